use thiserror::Error;

/// Raised synchronously while building a worker; fatal to startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Queue unspecified -- pass a queue name or set {env}")]
    QueueUnspecified { env: &'static str },

    #[error("Invalid namespace: {0:?}")]
    InvalidNamespace(String),

    #[error("Load interval must be greater than zero")]
    ZeroLoadInterval,
}

/// Errors from the blocking-queue store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Command failed: {0}")]
    Command(String),
}

/// A failure while fetching, decoding or handling a single job.
///
/// Every variant is recoverable: the job loop reports it and keeps running.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Failed to fetch job: {0}")]
    Fetch(#[from] StoreError),

    #[error("Failed to decode job: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Job handler failed: {0:#}")]
    Handler(anyhow::Error),

    #[error("Job handler panicked: {0}")]
    Panicked(String),
}

impl JobError {
    pub fn is_decode(&self) -> bool {
        matches!(self, JobError::Decode(_))
    }
}
