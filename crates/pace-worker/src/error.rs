use crate::worker::WorkerState;
use pace_core::{ConfigError, StoreError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Worker cannot start while {0}")]
    InvalidState(WorkerState),

    #[error(transparent)]
    Store(#[from] StoreError),
}
