use crate::config::StoreConfig;
use crate::Result;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, warn};

/// The whole exercise collection lives as one JSON array under this key.
pub const EXERCISES_KEY: &str = "exercises:all";

const IMAGE_PREFIX: &str = "exercise:image:";

#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct ExerciseImage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    /// Null means the image has not been reduced to a thumbnail yet, so None
    /// is always written back out as an explicit null.
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One record of the shared collection. Other services own most of the
/// fields; everything this worker does not model is carried through the
/// read-modify-write untouched in `extra`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ExerciseRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ExerciseImage>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ExerciseRecord {
    pub fn needs_thumbnail(&self) -> bool {
        matches!(&self.image, Some(image) if image.uri.is_some() && image.thumbnail.is_none())
    }
}

pub(crate) fn filter_unprocessed(records: &[ExerciseRecord], limit: usize) -> Vec<ExerciseRecord> {
    records
        .iter()
        .filter(|record| record.needs_thumbnail())
        .take(limit)
        .cloned()
        .collect()
}

pub(crate) fn apply_thumbnail(
    records: &mut [ExerciseRecord],
    exercise_id: &str,
    thumbnail: &str,
) -> bool {
    for record in records.iter_mut() {
        if record.id == exercise_id {
            let image = record.image.get_or_insert_with(ExerciseImage::default);
            image.thumbnail = Some(thumbnail.to_owned());
            return true;
        }
    }

    false
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_all_records(&self) -> Option<Vec<ExerciseRecord>>;

    async fn get_unprocessed(&self, limit: usize) -> Vec<ExerciseRecord>;

    async fn update_thumbnail(&self, exercise_id: &str, thumbnail: &str) -> bool;
}

pub struct ExerciseStore {
    connection: ConnectionManager,
    config: StoreConfig,
}

impl ExerciseStore {
    pub async fn new(config: &StoreConfig) -> Result<ExerciseStore> {
        let client = Client::open(config.url().as_str())?;
        let connection = client.get_tokio_connection_manager().await?;

        Ok(ExerciseStore {
            connection,
            config: config.clone(),
        })
    }

    /// Liveness probe used once at startup; the worker refuses to start when
    /// the store is unreachable.
    pub async fn test_connection(&self) -> bool {
        let mut connection = self.connection.clone();
        match redis::cmd("PING")
            .query_async::<_, String>(&mut connection)
            .await
        {
            Ok(_) => true,
            Err(err) => {
                error!("Store connection test failed: {}", err);
                false
            }
        }
    }

    async fn get_raw(&self, key: &str) -> Result<Option<String>> {
        let mut connection = self.connection.clone();
        let value: Option<String> = connection.get(key).await?;

        Ok(value)
    }

    pub async fn get_thumbnail(&self, exercise_id: &str) -> Option<String> {
        match self.get_raw(&format!("{}{}", IMAGE_PREFIX, exercise_id)).await {
            Ok(value) => value,
            Err(err) => {
                error!("Could not get thumbnail for {}: {}", exercise_id, err);
                None
            }
        }
    }

    /// Single-key save path for one thumbnail, with the configured expiry.
    pub async fn save_thumbnail(&self, exercise_id: &str, thumbnail: &str) -> bool {
        let mut connection = self.connection.clone();
        let key = format!("{}{}", IMAGE_PREFIX, exercise_id);
        match connection.set_ex::<_, _, ()>(&key, thumbnail, self.config.ttl).await {
            Ok(()) => true,
            Err(err) => {
                error!("Could not save thumbnail for {}: {}", exercise_id, err);
                false
            }
        }
    }
}

#[async_trait]
impl RecordStore for ExerciseStore {
    async fn get_all_records(&self) -> Option<Vec<ExerciseRecord>> {
        let raw = match self.get_raw(EXERCISES_KEY).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                error!("Could not read exercise collection: {}", err);
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(records) => Some(records),
            Err(err) => {
                error!("Could not parse exercise collection: {}", err);
                None
            }
        }
    }

    async fn get_unprocessed(&self, limit: usize) -> Vec<ExerciseRecord> {
        match self.get_all_records().await {
            Some(records) => filter_unprocessed(&records, limit),
            None => Vec::new(),
        }
    }

    /// Rewrites the whole collection with the record's thumbnail set; the
    /// write is a single SET, so the stored collection is never left half
    /// updated. The per-record cache key is mirrored best effort.
    async fn update_thumbnail(&self, exercise_id: &str, thumbnail: &str) -> bool {
        let mut records = match self.get_all_records().await {
            Some(records) => records,
            None => {
                error!("No exercises found in store");
                return false;
            }
        };

        if !apply_thumbnail(&mut records, exercise_id, thumbnail) {
            warn!("Exercise {} not found in collection", exercise_id);
            return false;
        }

        let serialized = match serde_json::to_string(&records) {
            Ok(serialized) => serialized,
            Err(err) => {
                error!("Could not serialize exercise collection: {}", err);
                return false;
            }
        };

        let mut connection = self.connection.clone();
        if let Err(err) = connection.set::<_, _, ()>(EXERCISES_KEY, &serialized).await {
            error!("Could not save updated exercises: {}", err);
            return false;
        }

        info!("Updated thumbnail for exercise {}", exercise_id);
        self.save_thumbnail(exercise_id, thumbnail).await;

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, uri: Option<&str>, thumbnail: Option<&str>) -> ExerciseRecord {
        ExerciseRecord {
            id: id.to_owned(),
            image: Some(ExerciseImage {
                uri: uri.map(str::to_owned),
                thumbnail: thumbnail.map(str::to_owned),
                extra: Map::new(),
            }),
            extra: Map::new(),
        }
    }

    #[test]
    fn test_needs_thumbnail() {
        assert!(record("a", Some("https://bucket/a.png"), None).needs_thumbnail());
        assert!(!record("b", Some("https://bucket/b.png"), Some("data:...")).needs_thumbnail());
        assert!(!record("c", None, None).needs_thumbnail());

        let no_image = ExerciseRecord {
            id: "d".to_owned(),
            image: None,
            extra: Map::new(),
        };
        assert!(!no_image.needs_thumbnail());
    }

    #[test]
    fn test_filter_unprocessed_keeps_order_and_limit() {
        let records = vec![
            record("a", Some("u"), None),
            record("b", Some("u"), Some("t")),
            record("c", Some("u"), None),
            record("d", None, None),
            record("e", Some("u"), None),
        ];

        let unprocessed = filter_unprocessed(&records, 2);
        let ids: Vec<&str> = unprocessed.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);

        let unprocessed = filter_unprocessed(&records, 10);
        let ids: Vec<&str> = unprocessed.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "e"]);
    }

    #[test]
    fn test_apply_thumbnail_is_idempotent() {
        let mut records = vec![record("a", Some("u"), None)];

        assert!(apply_thumbnail(&mut records, "a", "data:image/jpeg;base64,x"));
        let once = records.clone();

        assert!(apply_thumbnail(&mut records, "a", "data:image/jpeg;base64,x"));
        assert_eq!(records, once);
        assert_eq!(
            records[0].image.as_ref().unwrap().thumbnail.as_deref(),
            Some("data:image/jpeg;base64,x")
        );
    }

    #[test]
    fn test_apply_thumbnail_unknown_id_leaves_collection_unchanged() {
        let mut records = vec![record("a", Some("u"), None)];
        let before = records.clone();

        assert!(!apply_thumbnail(&mut records, "missing", "t"));
        assert_eq!(records, before);
    }

    #[test]
    fn test_apply_thumbnail_creates_image_struct() {
        let mut records = vec![ExerciseRecord {
            id: "a".to_owned(),
            image: None,
            extra: Map::new(),
        }];

        assert!(apply_thumbnail(&mut records, "a", "t"));
        assert_eq!(
            records[0].image.as_ref().unwrap().thumbnail.as_deref(),
            Some("t")
        );
    }

    #[test]
    fn test_records_round_trip_preserves_foreign_fields() {
        let raw = r#"[{
            "id": "squat-01",
            "name": "Back Squat",
            "difficulty": 3,
            "image": {"uri": "https://x/a.png", "thumbnail": null, "width": 640}
        }]"#;

        let mut records: Vec<ExerciseRecord> = serde_json::from_str(raw).unwrap();
        assert!(records[0].needs_thumbnail());

        apply_thumbnail(&mut records, "squat-01", "data:image/jpeg;base64,x");
        let value = serde_json::to_value(&records).unwrap();

        assert_eq!(value[0]["name"], "Back Squat");
        assert_eq!(value[0]["difficulty"], 3);
        assert_eq!(value[0]["image"]["width"], 640);
        assert_eq!(value[0]["image"]["thumbnail"], "data:image/jpeg;base64,x");
    }

    #[test]
    fn test_unprocessed_thumbnail_serializes_as_null() {
        let records = vec![record("a", Some("u"), None)];
        let value = serde_json::to_value(&records).unwrap();

        assert!(value[0]["image"]["thumbnail"].is_null());
    }
}
