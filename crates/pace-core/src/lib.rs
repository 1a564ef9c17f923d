mod error;
mod job;
mod load;
mod queue;

pub use error::{ConfigError, JobError, StoreError};
pub use job::Job;
pub use load::{LoadAverages, LoadTracker, DEFAULT_LOAD_INTERVAL, LOAD_WINDOWS};
pub use queue::{QueueName, DEFAULT_NAMESPACE, QUEUE_ENV_VAR};
