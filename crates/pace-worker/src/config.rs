use anyhow::Context;
use pace_core::{ConfigError, DEFAULT_LOAD_INTERVAL, DEFAULT_NAMESPACE, QUEUE_ENV_VAR};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const REDIS_URL_ENV_VAR: &str = "PACE_REDIS_URL";
pub const NAMESPACE_ENV_VAR: &str = "PACE_NAMESPACE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub redis_url: String,
    /// Queue used when none is passed to the worker explicitly
    pub queue: Option<String>,
    pub namespace: String,
    pub worker_id: Option<String>,
    pub load_interval_ms: u64,
    /// Pause before fetching again after the store failed
    pub fetch_retry_delay_ms: u64,
    pub handle_signals: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            queue: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            worker_id: None,
            load_interval_ms: DEFAULT_LOAD_INTERVAL.as_millis() as u64,
            fetch_retry_delay_ms: 1_000,
            handle_signals: true,
        }
    }
}

impl WorkerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: WorkerConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Override fields from `PACE_*` variables found through `lookup`.
    /// Empty values are ignored.
    pub fn merge_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|value| !value.is_empty());

        if let Some(queue) = lookup(QUEUE_ENV_VAR) {
            self.queue = Some(queue);
        }
        if let Some(url) = lookup(REDIS_URL_ENV_VAR) {
            self.redis_url = url;
        }
        if let Some(namespace) = lookup(NAMESPACE_ENV_VAR) {
            self.namespace = namespace;
        }
        self
    }

    pub fn load_interval(&self) -> Result<Duration, ConfigError> {
        if self.load_interval_ms == 0 {
            return Err(ConfigError::ZeroLoadInterval);
        }
        Ok(Duration::from_millis(self.load_interval_ms))
    }

    pub fn fetch_retry_delay(&self) -> Duration {
        Duration::from_millis(self.fetch_retry_delay_ms)
    }

    pub fn generate_worker_id(&self) -> String {
        if let Some(id) = &self.worker_id {
            return id.clone();
        }

        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        let random = uuid::Uuid::new_v4().simple().to_string();

        format!("{}-{}-{}", hostname, std::process::id(), &random[..8])
    }
}
