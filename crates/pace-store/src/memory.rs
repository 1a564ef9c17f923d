use crate::BlockingQueue;
use async_trait::async_trait;
use pace_core::StoreError;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;

/// In-process FIFO lists with blocking pop
pub struct MemoryQueue {
    lists: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
    pushed: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        MemoryQueue {
            lists: Mutex::new(HashMap::new()),
            pushed: Notify::new(),
        }
    }

    /// Seed a list without going through the async API.
    pub fn extend<I>(&self, key: &str, payloads: I)
    where
        I: IntoIterator,
        I::Item: Into<Vec<u8>>,
    {
        {
            let mut lists = self.lists.lock();
            let list = lists.entry(key.to_string()).or_default();
            list.extend(payloads.into_iter().map(Into::into));
        }
        self.pushed.notify_waiters();
    }

    pub fn len(&self, key: &str) -> usize {
        let lists = self.lists.lock();
        lists.get(key).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, key: &str) -> bool {
        self.len(key) == 0
    }

    fn try_pop(&self, key: &str) -> Option<Vec<u8>> {
        let mut lists = self.lists.lock();
        lists.get_mut(key).and_then(VecDeque::pop_front)
    }

    async fn wait_for_item(&self, key: &str) -> Vec<u8> {
        loop {
            // Register interest before checking so a push in between is not missed
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_pop(key) {
                return item;
            }

            notified.await;
        }
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlockingQueue for MemoryQueue {
    async fn pop(&self, key: &str, timeout: Duration) -> Result<Option<Vec<u8>>, StoreError> {
        if timeout.is_zero() {
            return Ok(Some(self.wait_for_item(key).await));
        }

        Ok(tokio::time::timeout(timeout, self.wait_for_item(key)).await.ok())
    }

    async fn push(&self, key: &str, payload: Vec<u8>) -> Result<(), StoreError> {
        self.extend(key, [payload]);
        Ok(())
    }
}
