use crate::config::S3Config;

use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::Client;
use tracing::error;

pub struct S3Service {
    client: Client,
    bucket: String,
}

impl S3Service {
    pub async fn new(config: &S3Config) -> S3Service {
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        S3Service {
            client: Client::new(&shared),
            bucket: config.bucket.clone(),
        }
    }

    /// Fetches the raw object bytes for a bucket-relative key; absent on any
    /// error.
    pub async fn get_image(&self, key: &str) -> Option<Vec<u8>> {
        let object = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(object) => object,
            Err(err) => {
                error!("S3 error for {}: {}", key, err);
                return None;
            }
        };

        match object.body.collect().await {
            Ok(data) => Some(data.into_bytes().to_vec()),
            Err(err) => {
                error!("Could not read S3 object {}: {}", key, err);
                None
            }
        }
    }
}
