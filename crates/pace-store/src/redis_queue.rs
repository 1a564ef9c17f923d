use crate::BlockingQueue;
use async_trait::async_trait;
use pace_core::StoreError;
use redis::aio::MultiplexedConnection;
use redis::RedisError;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Redis lists consumed with `BLPOP`.
///
/// The connection is opened on first use and dropped after an I/O failure so
/// the next command reconnects.
pub struct RedisQueue {
    client: redis::Client,
    connection: Mutex<Option<MultiplexedConnection>>,
}

impl RedisQueue {
    /// Validate `url` without connecting.
    pub fn open(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(RedisQueue {
            client,
            connection: Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        info!("Connected to redis at {}", self.client.get_connection_info().addr);
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn command_failed(&self, err: RedisError) -> StoreError {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            warn!("Redis connection lost: {}", err);
            *self.connection.lock().await = None;
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}

/// `BLPOP` takes whole seconds where 0 blocks forever; round sub-second
/// timeouts up so they never turn into an indefinite wait.
fn blpop_timeout(timeout: Duration) -> u64 {
    timeout.as_secs_f64().ceil() as u64
}

#[async_trait]
impl BlockingQueue for RedisQueue {
    async fn pop(&self, key: &str, timeout: Duration) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.connection().await?;
        debug!("BLPOP {} {:?}", key, timeout);

        let reply: Result<Option<(String, Vec<u8>)>, RedisError> = redis::cmd("BLPOP")
            .arg(key)
            .arg(blpop_timeout(timeout))
            .query_async(&mut conn)
            .await;

        match reply {
            Ok(popped) => Ok(popped.map(|(_, payload)| payload)),
            Err(e) => Err(self.command_failed(e).await),
        }
    }

    async fn push(&self, key: &str, payload: Vec<u8>) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;

        let reply: Result<i64, RedisError> = redis::cmd("RPUSH")
            .arg(key)
            .arg(payload)
            .query_async(&mut conn)
            .await;

        match reply {
            Ok(len) => {
                debug!("RPUSH {} -> {} queued", key, len);
                Ok(())
            }
            Err(e) => Err(self.command_failed(e).await),
        }
    }
}
