use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Could not decode message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(String),
}

impl WorkerError {
    /// Transient errors mean the connection is gone and the consume loop
    /// should go through its reconnect phase instead of giving up.
    pub fn is_transient(&self) -> bool {
        matches!(self, WorkerError::Connection(_))
    }
}

impl From<redis::RedisError> for WorkerError {
    fn from(err: redis::RedisError) -> WorkerError {
        let connection_lost = err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.kind() == redis::ErrorKind::IoError;

        if connection_lost {
            WorkerError::Connection(err.to_string())
        } else {
            WorkerError::Store(err.to_string())
        }
    }
}
