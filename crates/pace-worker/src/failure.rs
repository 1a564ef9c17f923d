//! Reporting for jobs that could not be fetched, decoded or handled.

use once_cell::sync::Lazy;
use pace_core::JobError;
use parking_lot::RwLock;
use std::any::Any;
use std::error::Error as StdError;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

/// Called with the raw payload and the error for every failed job.
pub type ErrorCallback = Arc<dyn Fn(&[u8], &JobError) -> anyhow::Result<()> + Send + Sync>;

static PROCESS_CALLBACKS: Lazy<ErrorCallbacks> = Lazy::new(ErrorCallbacks::new);

/// An append-only, ordered list of error callbacks.
///
/// Clones share the same list. Workers hold two: a process-wide list shared
/// by every worker, and their own.
#[derive(Clone, Default)]
pub struct ErrorCallbacks {
    callbacks: Arc<RwLock<Vec<ErrorCallback>>>,
}

impl ErrorCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The list workers share unless another one is injected.
    pub fn process_wide() -> Self {
        PROCESS_CALLBACKS.clone()
    }

    pub fn register<F>(&self, callback: F)
    where
        F: Fn(&[u8], &JobError) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.callbacks.write().push(Arc::new(callback));
    }

    pub fn len(&self) -> usize {
        self.callbacks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<ErrorCallback> {
        self.callbacks.read().clone()
    }
}

/// Register a callback for failures on every worker in this process.
pub fn on_error<F>(callback: F)
where
    F: Fn(&[u8], &JobError) -> anyhow::Result<()> + Send + Sync + 'static,
{
    ErrorCallbacks::process_wide().register(callback);
}

/// Outcome of a single failure dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct FailureReport {
    pub(crate) callbacks_run: usize,
    pub(crate) callbacks_failed: usize,
}

/// Logs a failed job and fans it out to the registered callbacks.
#[derive(Clone)]
pub(crate) struct FailurePath {
    shared: ErrorCallbacks,
    local: ErrorCallbacks,
}

impl FailurePath {
    pub(crate) fn new(shared: ErrorCallbacks, local: ErrorCallbacks) -> Self {
        FailurePath { shared, local }
    }

    /// Never fails and never panics, whatever the callbacks do.
    pub(crate) fn report(&self, payload: &[u8], error: &JobError) -> FailureReport {
        log_failed_job("Job failed!", payload, &trace(error));

        // Taken up front so registrations made by a callback apply to the next job
        let callbacks: Vec<ErrorCallback> = self
            .shared
            .snapshot()
            .into_iter()
            .chain(self.local.snapshot())
            .collect();

        let mut report = FailureReport::default();
        for callback in callbacks {
            report.callbacks_run += 1;

            let failure = match catch_unwind(AssertUnwindSafe(|| callback(payload, error))) {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{:?}", e),
                Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
            };

            report.callbacks_failed += 1;
            log_failed_job("Error handler failed!", payload, &failure);
        }

        report
    }
}

fn log_failed_job(message: &str, payload: &[u8], detail: &str) {
    error!(
        payload = %String::from_utf8_lossy(payload),
        "{}\n{}",
        message,
        detail
    );
}

/// Error message followed by its cause chain.
fn trace(error: &JobError) -> String {
    if let JobError::Handler(e) = error {
        return format!("{}\n{:?}", error, e);
    }

    let mut trace = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        trace.push_str("\nCaused by: ");
        trace.push_str(&cause.to_string());
        source = cause.source();
    }
    trace
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
