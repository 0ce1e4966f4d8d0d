use thumbnailer::{
    Config, Consumer, ExerciseStore, ImageProcessor, JobQueue, Result, S3Service, WorkerError,
};

use std::sync::atomic::Ordering;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting application...");

    if let Err(err) = run().await {
        error!("Application failed: {}", err);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = Config::from_env()?;

    let store = ExerciseStore::new(&config.store).await?;
    if !store.test_connection().await {
        return Err(WorkerError::Connection(
            "record store is unreachable".to_owned(),
        ));
    }

    let s3 = S3Service::new(&config.s3).await;
    let consumer = Consumer::new(store, ImageProcessor::new(s3), &config.s3.bucket)?;

    let mut queue = JobQueue::new(&config.queue)?;

    let shutdown = queue.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down...");
            shutdown.store(true, Ordering::SeqCst);
        }
    });

    queue.start_consuming(&consumer).await
}
