use async_trait::async_trait;
use pace_core::Job;
use std::future::Future;
use tracing::info;

/// Result type for job handlers
pub type HandlerResult = anyhow::Result<()>;

/// Trait for job handlers
///
/// Handlers run one at a time. They may await I/O freely: the worker keeps
/// waiting for the next job on the queue in the meantime.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, job: Job) -> HandlerResult {
        (self)(job).await
    }
}

/// Handler that just logs every job it receives
pub struct LogHandler;

#[async_trait]
impl JobHandler for LogHandler {
    async fn handle(&self, job: Job) -> HandlerResult {
        info!(job = %job.value(), "Processed job");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use parking_lot::Mutex;

    #[tokio::test]
    async fn test_closure_handler() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = {
            let seen = seen.clone();
            move |job: Job| {
                let seen = seen.clone();
                async move {
                    seen.lock().push(job.into_value());
                    Ok(())
                }
            }
        };

        handler.handle(Job::new(json!({"n": 1}))).await.unwrap();
        assert_eq!(*seen.lock(), vec![json!({"n": 1})]);
    }

    #[tokio::test]
    async fn test_closure_handler_error() {
        let handler = |job: Job| async move {
            anyhow::ensure!(job.get("n").is_some(), "missing n in {}", job.value());
            Ok(())
        };

        let err = handler.handle(Job::new(json!({}))).await.unwrap_err();
        assert_eq!(err.to_string(), "missing n in {}");
    }

    #[tokio::test]
    async fn test_log_handler() {
        assert!(LogHandler.handle(Job::new(json!([1, 2]))).await.is_ok());
    }
}
