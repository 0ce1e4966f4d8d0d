use crate::config::QueueConfig;
use crate::{Result, WorkerError};

use async_trait::async_trait;
use redis::{aio::Connection, AsyncCommands, Client};
use serde::Serialize;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

const RECONNECT_DELAY_SECS: u64 = 5;
const MAX_RECONNECT_DELAY_SECS: u64 = 30;
const POP_TIMEOUT_SECS: f64 = 5.0;

/// Decides what happens to a delivery: `Ok` acknowledges it, `Err` sends it
/// back onto the queue and forces the consume loop through a reconnect.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, body: &str) -> Result<()>;
}

/// Reliable list queue over Redis. Deliveries are moved onto a side list
/// while they are in flight, so at most one unacknowledged message exists at
/// a time and anything left there after a crash or disconnect is redelivered.
pub struct JobQueue {
    client: Client,
    connection: Option<Connection>,
    queue_key: String,
    processing_key: String,
    reconnect_delay: u64,
    shutdown: Arc<AtomicBool>,
}

impl JobQueue {
    pub fn new(config: &QueueConfig) -> Result<JobQueue> {
        let client = Client::open(config.url().as_str())
            .map_err(|err| WorkerError::Config(err.to_string()))?;

        Ok(JobQueue {
            client,
            connection: None,
            queue_key: config.queue.clone(),
            processing_key: format!("{}:processing", config.queue),
            reconnect_delay: RECONNECT_DELAY_SECS,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag shared with signal handlers; once set, the consume loop stops at
    /// its next iteration.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Establishes the queue connection if it is absent, retrying with
    /// exponential backoff until it succeeds or shutdown is requested.
    /// Returns false only on shutdown.
    pub async fn connect(&mut self) -> bool {
        while !self.is_shutdown() {
            if self.connection.is_some() {
                return true;
            }

            match self.client.get_async_connection().await {
                Ok(mut connection) => {
                    if let Err(err) = self.requeue_in_flight(&mut connection).await {
                        warn!("Could not requeue in-flight messages: {}", err);
                    }
                    info!("Connected to broker, consuming from {}", self.queue_key);
                    self.connection = Some(connection);
                    self.reconnect_delay = RECONNECT_DELAY_SECS;
                    return true;
                }
                Err(err) => {
                    error!("Failed to connect to broker: {}", err);
                    sleep(Duration::from_secs(self.reconnect_delay)).await;
                    self.reconnect_delay = (self.reconnect_delay * 2).min(MAX_RECONNECT_DELAY_SECS);
                }
            }
        }

        false
    }

    // Messages still sitting on the processing list were delivered but never
    // acknowledged; put them back so they are delivered again.
    async fn requeue_in_flight(&self, connection: &mut Connection) -> Result<()> {
        loop {
            let pending: Option<String> = connection
                .rpoplpush(&self.processing_key, &self.queue_key)
                .await?;
            match pending {
                Some(_) => warn!("Redelivering unacknowledged message"),
                None => break,
            }
        }

        Ok(())
    }

    async fn next_message(&mut self) -> Result<Option<String>> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| WorkerError::Connection("queue is not connected".to_owned()))?;

        let message: Option<String> = connection
            .brpoplpush(&self.queue_key, &self.processing_key, POP_TIMEOUT_SECS)
            .await?;

        Ok(message)
    }

    async fn ack(&mut self, body: &str) -> Result<()> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| WorkerError::Connection("queue is not connected".to_owned()))?;

        let _: i64 = connection.lrem(&self.processing_key, 1, body).await?;

        Ok(())
    }

    // Requeue before removing from the processing list; a failure in between
    // leaves a duplicate rather than a lost message.
    async fn nack(&mut self, body: &str) -> Result<()> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| WorkerError::Connection("queue is not connected".to_owned()))?;

        let _: i64 = connection.rpush(&self.queue_key, body).await?;
        let _: i64 = connection.lrem(&self.processing_key, 1, body).await?;

        Ok(())
    }

    /// Blocks delivering messages to the handler until shutdown is requested.
    /// A lost connection, while consuming or while handling, sends the loop
    /// back through the reconnect phase instead of terminating it.
    pub async fn start_consuming<H>(&mut self, handler: &H) -> Result<()>
    where
        H: MessageHandler,
    {
        while !self.is_shutdown() {
            if !self.connect().await {
                break;
            }

            let body = match self.next_message().await {
                Ok(Some(body)) => body,
                Ok(None) => continue,
                Err(err) => {
                    warn!("Connection lost, reconnecting... Error: {}", err);
                    self.cleanup();
                    continue;
                }
            };

            match handler.handle(&body).await {
                Ok(()) => {
                    if let Err(err) = self.ack(&body).await {
                        warn!("Could not acknowledge message: {}", err);
                        self.cleanup();
                    }
                }
                Err(err) => {
                    if err.is_transient() {
                        warn!("Connection lost while handling message: {}", err);
                    } else {
                        error!("Message handler failed: {}", err);
                    }
                    if let Err(err) = self.nack(&body).await {
                        warn!("Could not requeue message: {}", err);
                    }
                    self.cleanup();
                }
            }
        }

        self.cleanup();
        info!("Consumer loop stopped");
        Ok(())
    }

    /// Publishes a message to the named queue. Persistent messages go onto
    /// the durable list; non-persistent ones are broadcast over pub/sub and
    /// only reach subscribers that are live right now.
    pub async fn publish<T>(&mut self, queue_name: &str, message: &T, persistent: bool) -> bool
    where
        T: Serialize + Sync,
    {
        if !self.connect().await {
            return false;
        }

        let body = match serde_json::to_string(message) {
            Ok(body) => body,
            Err(err) => {
                error!("Could not serialize message: {}", err);
                return false;
            }
        };

        let connection = match self.connection.as_mut() {
            Some(connection) => connection,
            None => return false,
        };

        let result = if persistent {
            connection.lpush::<_, _, i64>(queue_name, &body).await
        } else {
            connection.publish::<_, _, i64>(queue_name, &body).await
        };

        match result {
            Ok(_) => {
                debug!("Published message to {}", queue_name);
                true
            }
            Err(err) => {
                error!("Failed to publish message: {}", err);
                self.cleanup();
                false
            }
        }
    }

    fn cleanup(&mut self) {
        self.connection = None;
    }

    /// Gracefully shut down; safe to call more than once.
    pub fn close(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.cleanup();
        info!("Queue shut down");
    }
}
