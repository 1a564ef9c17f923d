use crate::JobError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A decoded job payload.
///
/// Jobs carry no fixed schema: whatever JSON document was pushed onto the
/// queue is handed to the handler as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Job(Value);

impl Job {
    pub fn new(value: Value) -> Self {
        Job(value)
    }

    /// Decode a raw payload read from the store.
    ///
    /// Empty, truncated and non-UTF-8 payloads all fail with
    /// [`JobError::Decode`].
    pub fn decode(raw: &[u8]) -> Result<Self, JobError> {
        let value = serde_json::from_slice(raw)?;
        Ok(Job(value))
    }

    /// Encode the job the way it is stored on the queue.
    pub fn encode(&self) -> Result<Vec<u8>, JobError> {
        Ok(serde_json::to_vec(&self.0)?)
    }

    /// Look up a top-level field of an object job.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl From<Value> for Job {
    fn from(value: Value) -> Self {
        Job(value)
    }
}
