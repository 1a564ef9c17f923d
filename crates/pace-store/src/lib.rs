//! Blocking-queue stores a worker can consume from.

mod memory;
mod redis_queue;

pub use memory::MemoryQueue;
pub use redis_queue::RedisQueue;

use async_trait::async_trait;
use pace_core::StoreError;
use std::time::Duration;

/// A store that can block until an item is available on a list.
#[async_trait]
pub trait BlockingQueue: Send + Sync + 'static {
    /// Remove the head of `key`, waiting up to `timeout` for one to appear.
    ///
    /// `Duration::ZERO` waits indefinitely. `Ok(None)` means the timeout
    /// elapsed with the list still empty.
    async fn pop(&self, key: &str, timeout: Duration) -> Result<Option<Vec<u8>>, StoreError>;

    /// Append a payload to the tail of `key`.
    async fn push(&self, key: &str, payload: Vec<u8>) -> Result<(), StoreError>;
}
