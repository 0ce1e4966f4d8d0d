mod config;
mod error;
mod images;
mod queue;
mod s3;
mod store;

pub use config::Config;
pub use error::{Result, WorkerError};
pub use images::{ImageProcessor, ThumbnailPipeline};
pub use queue::{JobQueue, MessageHandler};
pub use s3::S3Service;
pub use store::{ExerciseImage, ExerciseRecord, ExerciseStore, RecordStore};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

pub const PROCESS_ACTION: &str = "process_exercises";

const BATCH_SIZE: usize = 10;
const BATCH_RETRY_DELAY: Duration = Duration::from_secs(1);
const BATCH_PAUSE: Duration = Duration::from_millis(100);
const MAX_RECORD_ATTEMPTS: u32 = 3;

#[derive(Debug, Deserialize, Serialize)]
pub struct TriggerMessage {
    pub action: String,
}

#[derive(Debug, Default, PartialEq)]
pub struct ProcessingStatus {
    pub total: usize,
    pub processed: usize,
    pub remaining: usize,
}

/// Clears the busy flag on every exit path out of a processing run.
struct ProcessingGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Consumes trigger messages and drives the batch loop that thumbnails every
/// pending exercise image. One run at a time; triggers that arrive while a
/// run is active are acknowledged and dropped.
pub struct Consumer<S, P> {
    store: S,
    pipeline: P,
    url_pattern: Regex,
    processing: AtomicBool,
}

impl<S, P> Consumer<S, P>
where
    S: RecordStore,
    P: ThumbnailPipeline,
{
    pub fn new(store: S, pipeline: P, bucket: &str) -> Result<Consumer<S, P>> {
        let url_pattern = Regex::new(&format!(
            r"{}\.s3\.amazonaws\.com/",
            regex::escape(bucket)
        ))
        .map_err(|err| WorkerError::Config(err.to_string()))?;

        Ok(Consumer {
            store,
            pipeline,
            url_pattern,
            processing: AtomicBool::new(false),
        })
    }

    pub async fn processing_status(&self) -> ProcessingStatus {
        let records = match self.store.get_all_records().await {
            Some(records) => records,
            None => return ProcessingStatus::default(),
        };

        let total = records.len();
        let remaining = records
            .iter()
            .filter(|record| record.needs_thumbnail())
            .count();

        ProcessingStatus {
            total,
            processed: total - remaining,
            remaining,
        }
    }

    // The bucket-relative key, with any query string stripped. None for URLs
    // that do not point into the exercise bucket.
    fn storage_key(&self, image_url: &str) -> Option<String> {
        let image_url = image_url.split('?').next().unwrap_or(image_url);
        let matched = self.url_pattern.find(image_url)?;
        let key = &image_url[matched.end()..];

        if key.is_empty() {
            None
        } else {
            Some(key.to_owned())
        }
    }

    async fn process_record(
        &self,
        position: usize,
        total: usize,
        exercise: &ExerciseRecord,
    ) -> bool {
        let image_url = match exercise.image.as_ref().and_then(|image| image.uri.as_deref()) {
            Some(url) => url,
            None => {
                warn!("No image URL for exercise {}", exercise.id);
                return false;
            }
        };

        info!("Processing exercise {}/{} - ID: {}", position, total, exercise.id);

        let key = match self.storage_key(image_url) {
            Some(key) => key,
            None => {
                warn!("Skipping {} - URL is outside the exercise bucket", exercise.id);
                return false;
            }
        };
        debug!("Processing path: {}", key);

        match self.pipeline.process_image(&exercise.id, &key).await {
            Some(thumbnail) => {
                if self.store.update_thumbnail(&exercise.id, &thumbnail).await {
                    true
                } else {
                    error!("Failed to update store for {}", exercise.id);
                    false
                }
            }
            None => {
                error!("Failed to process image for {}", exercise.id);
                false
            }
        }
    }

    /// Runs one page of records through the pipeline, in page order. A bad
    /// record never aborts the batch; the batch counts as a success when at
    /// least one record was updated.
    async fn process_batch(
        &self,
        exercises: &[ExerciseRecord],
        attempts: &mut HashMap<String, u32>,
    ) -> bool {
        let total = exercises.len();
        let mut success_count = 0;

        for (i, exercise) in exercises.iter().enumerate() {
            if self.process_record(i + 1, total, exercise).await {
                success_count += 1;
                attempts.remove(&exercise.id);
                info!(
                    "Successfully processed {} ({}/{})",
                    exercise.id, success_count, total
                );
            } else {
                *attempts.entry(exercise.id.clone()).or_insert(0) += 1;
            }
        }

        let status = self.processing_status().await;
        info!(
            "Batch complete - Processed: {}/{} exercises. Overall progress: {}/{} ({} remaining)",
            success_count, total, status.processed, status.total, status.remaining
        );

        success_count > 0
    }

    /// The scan-until-empty loop: fetch a page of unprocessed records,
    /// thumbnail them, re-evaluate, and keep going until nothing is left. A
    /// page with zero successes is retried after a short delay; because
    /// updates remove records from the unprocessed set, the retry re-queries
    /// fresh state rather than replaying a cursor.
    pub async fn process_all_remaining(&self) -> Result<()> {
        let mut attempts: HashMap<String, u32> = HashMap::new();

        loop {
            let status = self.processing_status().await;
            if status.remaining == 0 {
                info!("All exercises have been processed");
                break;
            }

            let exercises = self.store.get_unprocessed(BATCH_SIZE).await;
            if exercises.is_empty() {
                info!("No more exercises to process");
                break;
            }

            // records that kept failing during this run are set aside so the
            // loop converges instead of retrying them forever
            let exercises: Vec<ExerciseRecord> = exercises
                .into_iter()
                .filter(|exercise| {
                    attempts.get(&exercise.id).copied().unwrap_or(0) < MAX_RECORD_ATTEMPTS
                })
                .collect();
            if exercises.is_empty() {
                warn!(
                    "{} unprocessed exercises keep failing, giving up until the next trigger",
                    status.remaining
                );
                break;
            }

            info!("Processing next batch of {} exercises", exercises.len());
            if !self.process_batch(&exercises, &mut attempts).await {
                error!("Failed to process batch, will retry");
                sleep(BATCH_RETRY_DELAY).await;
                continue;
            }

            sleep(BATCH_PAUSE).await;
        }

        Ok(())
    }
}

#[async_trait]
impl<S, P> MessageHandler for Consumer<S, P>
where
    S: RecordStore,
    P: ThumbnailPipeline,
{
    async fn handle(&self, body: &str) -> Result<()> {
        if self.processing.load(Ordering::SeqCst) {
            debug!("A processing run is already active, dropping trigger");
            return Ok(());
        }

        let message: TriggerMessage = serde_json::from_str(body)?;

        if message.action != PROCESS_ACTION {
            warn!("Unknown action: {}", message.action);
            return Ok(());
        }

        if self.processing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = ProcessingGuard {
            flag: &self.processing,
        };

        self.process_all_remaining().await
    }
}
