use crate::{Result, WorkerError};

use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub host: String,
    pub port: u16,
    pub queue: String,
}

impl QueueConfig {
    pub fn url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub password: Option<String>,
    pub ttl: usize,
}

impl StoreConfig {
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

#[derive(Debug, Clone)]
pub struct S3Config {
    pub region: String,
    pub bucket: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub queue: QueueConfig,
    pub store: StoreConfig,
    pub s3: S3Config,
}

fn required(name: &str) -> Result<String> {
    env::var(name).map_err(|_| WorkerError::Config(format!("{} is not set", name)))
}

fn parsed<T: FromStr>(name: &str) -> Result<T> {
    required(name)?
        .parse()
        .map_err(|_| WorkerError::Config(format!("{} has an invalid value", name)))
}

impl Config {
    /// Loads the full configuration from the environment. Every required
    /// variable is resolved up front so a misconfigured worker fails before
    /// it opens any connection.
    pub fn from_env() -> Result<Config> {
        Ok(Config {
            queue: QueueConfig {
                host: required("BROKER_HOST")?,
                port: parsed("BROKER_PORT")?,
                queue: required("BROKER_QUEUE")?,
            },
            store: StoreConfig {
                host: required("REDIS_HOST")?,
                port: parsed("REDIS_PORT")?,
                db: parsed("REDIS_DB")?,
                password: env::var("REDIS_PASSWORD").ok(),
                ttl: parsed("REDIS_TTL")?,
            },
            s3: S3Config {
                region: required("AWS_DEFAULT_REGION")?,
                bucket: required("AWS_BUCKET_NAME")?,
            },
        })
    }
}
