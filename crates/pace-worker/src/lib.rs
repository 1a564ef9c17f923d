pub mod config;
pub mod error;
pub mod failure;
pub mod handler;
mod job_loop;
pub mod worker;

pub use config::WorkerConfig;
pub use error::WorkerError;
pub use failure::{on_error, ErrorCallback, ErrorCallbacks};
pub use handler::{HandlerResult, JobHandler};
pub use worker::{Worker, WorkerState};

pub use pace_core::{ConfigError, Job, JobError, LoadAverages, QueueName, StoreError};
pub use pace_store::{BlockingQueue, MemoryQueue, RedisQueue};
