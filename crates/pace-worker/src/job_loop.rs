//! The fetch, re-arm, dispatch cycle.
//!
//! Exactly one pop is outstanding while the worker runs. As soon as a pop
//! returns, the next one is spawned and only then is the payload decoded and
//! handed to the handler, so waiting for job N+1 overlaps with handling job N.
//! Handlers themselves still run strictly one after another.

use crate::failure::{panic_message, FailurePath};
use crate::handler::JobHandler;
use crate::worker::WorkerState;
use futures::FutureExt;
use pace_core::{Job, JobError, LoadTracker, QueueName, StoreError};
use pace_store::BlockingQueue;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

type Fetch = AbortOnDrop<Result<Option<Vec<u8>>, StoreError>>;

/// Aborts the wrapped task when dropped, including when the future owning it
/// is cancelled.
pub(crate) struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> AbortOnDrop<T> {
    pub(crate) fn new(handle: JoinHandle<T>) -> Self {
        AbortOnDrop(handle)
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub(crate) struct JobLoop<H> {
    queue: QueueName,
    store: Arc<dyn BlockingQueue>,
    handler: H,
    load: Arc<Mutex<LoadTracker>>,
    failures: FailurePath,
    state: watch::Receiver<WorkerState>,
    retry_delay: Duration,
}

impl<H: JobHandler> JobLoop<H> {
    pub(crate) fn new(
        queue: QueueName,
        store: Arc<dyn BlockingQueue>,
        handler: H,
        load: Arc<Mutex<LoadTracker>>,
        failures: FailurePath,
        state: watch::Receiver<WorkerState>,
        retry_delay: Duration,
    ) -> Self {
        JobLoop {
            queue,
            store,
            handler,
            load,
            failures,
            state,
            retry_delay,
        }
    }

    /// Runs until the worker leaves `Running`.
    ///
    /// A pop that has already returned when shutdown is seen is still
    /// processed; one still waiting on an empty queue is abandoned. Dropping
    /// the returned future also aborts the outstanding pop.
    pub(crate) async fn run(mut self) {
        let mut pending = Some(self.arm(Duration::ZERO));

        while let Some(mut fetch) = pending.take() {
            let fetched = tokio::select! {
                biased;
                joined = &mut fetch.0 => Some(joined),
                _ = stop_requested(&mut self.state) => None,
            };

            let Some(joined) = fetched else {
                debug!("Abandoning idle fetch on {}", self.queue.key());
                break;
            };

            let fetched = joined.unwrap_or_else(|e| {
                Err(StoreError::Command(format!("fetch task failed: {}", e)))
            });

            if self.is_running() {
                let delay = if fetched.is_err() {
                    self.retry_delay
                } else {
                    Duration::ZERO
                };
                pending = Some(self.arm(delay));
            }

            self.process(fetched).await;
        }
    }

    fn is_running(&self) -> bool {
        *self.state.borrow() == WorkerState::Running
    }

    /// Spawn the next blocking pop.
    fn arm(&self, delay: Duration) -> Fetch {
        let store = self.store.clone();
        let key = self.queue.key().to_string();

        AbortOnDrop::new(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            store.pop(&key, Duration::ZERO).await
        }))
    }

    async fn process(&self, fetched: Result<Option<Vec<u8>>, StoreError>) {
        let payload = match fetched {
            Ok(Some(payload)) => payload,
            Ok(None) => return,
            Err(e) => {
                self.report(&[], &JobError::Fetch(e));
                return;
            }
        };

        let started = Instant::now();
        match self.dispatch(&payload).await {
            Ok(()) => {
                self.load.lock().tick();
                debug!(elapsed = ?started.elapsed(), "Job handled");
            }
            Err(e) => self.report(&payload, &e),
        }
    }

    fn report(&self, payload: &[u8], error: &JobError) {
        let report = self.failures.report(payload, error);
        if report.callbacks_failed > 0 {
            debug!(
                callbacks_run = report.callbacks_run,
                callbacks_failed = report.callbacks_failed,
                "Some error callbacks failed"
            );
        }
    }

    async fn dispatch(&self, payload: &[u8]) -> Result<(), JobError> {
        let job = Job::decode(payload)?;

        match AssertUnwindSafe(self.handler.handle(job)).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(JobError::Handler(e)),
            Err(panic) => Err(JobError::Panicked(panic_message(panic.as_ref()))),
        }
    }
}

async fn stop_requested(state: &mut watch::Receiver<WorkerState>) {
    // An error means the worker was dropped, which also stops the loop
    let _ = state.wait_for(|s| *s != WorkerState::Running).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::ErrorCallbacks;
    use async_trait::async_trait;
    use pace_store::MemoryQueue;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const KEY: &str = "resque:queue:test";

    /// Counts pops and can fail the first few.
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryQueue,
        started: AtomicUsize,
        failures_left: AtomicUsize,
    }

    impl CountingStore {
        fn with_jobs(jobs: &[&str]) -> Arc<Self> {
            let store = CountingStore::default();
            store.inner.extend(KEY, jobs.iter().map(|j| j.as_bytes().to_vec()));
            Arc::new(store)
        }

        fn started(&self) -> usize {
            self.started.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BlockingQueue for CountingStore {
        async fn pop(&self, key: &str, timeout: Duration) -> Result<Option<Vec<u8>>, StoreError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(StoreError::Connection("connection refused".to_string()));
            }
            self.inner.pop(key, timeout).await
        }

        async fn push(&self, key: &str, payload: Vec<u8>) -> Result<(), StoreError> {
            self.inner.push(key, payload).await
        }
    }

    struct Harness {
        store: Arc<CountingStore>,
        load: Arc<Mutex<LoadTracker>>,
        shared: ErrorCallbacks,
        local: ErrorCallbacks,
        state: Arc<watch::Sender<WorkerState>>,
        reported: Arc<Mutex<Vec<(Vec<u8>, String)>>>,
    }

    impl Harness {
        fn new(store: Arc<CountingStore>) -> Self {
            let reported = Arc::new(Mutex::new(Vec::new()));
            let local = ErrorCallbacks::new();
            {
                let reported = reported.clone();
                local.register(move |payload, error| {
                    reported.lock().push((payload.to_vec(), error.to_string()));
                    Ok(())
                });
            }

            Harness {
                store,
                load: Arc::new(Mutex::new(LoadTracker::default())),
                shared: ErrorCallbacks::new(),
                local,
                state: Arc::new(watch::channel(WorkerState::Running).0),
                reported,
            }
        }

        fn job_loop<H: JobHandler>(&self, handler: H) -> JobLoop<H> {
            JobLoop::new(
                QueueName::new("test", "resque").unwrap(),
                self.store.clone(),
                handler,
                self.load.clone(),
                FailurePath::new(self.shared.clone(), self.local.clone()),
                self.state.subscribe(),
                Duration::from_millis(10),
            )
        }

        fn shutdown(&self) {
            self.state.send_replace(WorkerState::ShuttingDown);
        }

        /// Shut down once the queue is drained and `done` holds.
        fn shutdown_when(&self, done: impl Fn() -> bool + Send + 'static) {
            let store = self.store.clone();
            let state = self.state.clone();
            tokio::spawn(async move {
                while !(done() && store.inner.is_empty(KEY)) {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                state.send_replace(WorkerState::ShuttingDown);
            });
        }

        async fn run<H: JobHandler>(&self, handler: H) {
            tokio::time::timeout(Duration::from_secs(5), self.job_loop(handler).run())
                .await
                .expect("job loop did not stop");
        }

        fn ticks(&self) -> u64 {
            self.load.lock().total()
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<Value>>>, impl JobHandler) {
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
        (seen, handler)
    }

    #[tokio::test]
    async fn test_next_pop_armed_before_handler_finishes() {
        let store = CountingStore::with_jobs(&["1", "2"]);
        let harness = Harness::new(store.clone());
        let pops_during_handling = Arc::new(Mutex::new(Vec::new()));

        let handler = {
            let store = store.clone();
            let pops = pops_during_handling.clone();
            move |_job: Job| {
                let store = store.clone();
                let pops = pops.clone();
                async move {
                    // Simulated I/O: gives the spawned pop a chance to run
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    pops.lock().push(store.started());
                    Ok(())
                }
            }
        };

        let pops = pops_during_handling.clone();
        harness.shutdown_when(move || pops.lock().len() == 2);
        harness.run(handler).await;

        // While job N is handled, the pop for job N+1 has already started
        assert_eq!(*pops_during_handling.lock(), vec![2, 3]);
        assert_eq!(harness.ticks(), 2);
    }

    #[tokio::test]
    async fn test_decode_failure_skips_handler() {
        let store = CountingStore::with_jobs(&["{\"n\":1}", "", "{\"n\":3}", "[4]"]);
        let harness = Harness::new(store);
        let (seen, handler) = recorder();

        let done = seen.clone();
        harness.shutdown_when(move || done.lock().len() == 3);
        harness.run(handler).await;

        assert_eq!(seen.lock().len(), 3);
        let reported = harness.reported.lock();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].0, b"".to_vec());
        assert!(reported[0].1.starts_with("Failed to decode job"));
        assert_eq!(harness.ticks(), 3);
    }

    #[tokio::test]
    async fn test_handler_errors_and_panics_are_contained() {
        let store = CountingStore::with_jobs(&["\"fail\"", "\"panic\"", "\"ok\""]);
        let harness = Harness::new(store);
        let handled = Arc::new(AtomicUsize::new(0));

        let handler = {
            let handled = handled.clone();
            move |job: Job| {
                let handled = handled.clone();
                async move {
                    handled.fetch_add(1, Ordering::SeqCst);
                    match job.value().as_str() {
                        Some("fail") => anyhow::bail!("upstream returned 503"),
                        Some("panic") => panic!("handler bug"),
                        _ => Ok(()),
                    }
                }
            }
        };

        let done = handled.clone();
        harness.shutdown_when(move || done.load(Ordering::SeqCst) == 3);
        harness.run(handler).await;

        let reported = harness.reported.lock();
        assert_eq!(reported.len(), 2);
        assert_eq!(reported[0].0, b"\"fail\"".to_vec());
        assert_eq!(reported[0].1, "Job handler failed: upstream returned 503");
        assert_eq!(reported[1].0, b"\"panic\"".to_vec());
        assert_eq!(reported[1].1, "Job handler panicked: handler bug");
        assert_eq!(harness.ticks(), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_reported_and_retried() {
        let store = CountingStore::with_jobs(&["{\"n\":1}"]);
        store.failures_left.store(2, Ordering::SeqCst);
        let harness = Harness::new(store.clone());
        let (seen, handler) = recorder();

        let done = seen.clone();
        harness.shutdown_when(move || done.lock().len() == 1);
        harness.run(handler).await;

        let reported = harness.reported.lock();
        assert_eq!(reported.len(), 2);
        assert!(reported.iter().all(|(payload, _)| payload.is_empty()));
        assert!(reported[0].1.starts_with("Failed to fetch job"));
        assert_eq!(*seen.lock(), vec![serde_json::json!({"n": 1})]);
    }

    #[tokio::test]
    async fn test_shutdown_while_idle_stops_loop() {
        let store = CountingStore::with_jobs(&[]);
        let harness = Harness::new(store.clone());
        let (seen, handler) = recorder();

        harness.shutdown_when(|| true);
        harness.run(handler).await;

        assert!(seen.lock().is_empty());
        assert!(store.started() <= 1);
    }

    #[tokio::test]
    async fn test_shutdown_during_handler_drains_fetched_job_only() {
        let store = CountingStore::with_jobs(&["1", "2", "3"]);
        let harness = Harness::new(store.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let handler = {
            let seen = seen.clone();
            let state = harness.state.clone();
            move |job: Job| {
                let seen = seen.clone();
                let state = state.clone();
                async move {
                    if job.value() == &Value::from(1) {
                        state.send_replace(WorkerState::ShuttingDown);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    seen.lock().push(job.into_value());
                    Ok(())
                }
            }
        };

        harness.run(handler).await;

        // Job 2 was already fetched when shutdown began, job 3 never was
        assert_eq!(*seen.lock(), vec![Value::from(1), Value::from(2)]);
        assert_eq!(store.inner.len(KEY), 1);
        assert_eq!(store.started(), 2);
    }

    #[tokio::test]
    async fn test_dropping_loop_aborts_pending_fetch() {
        let store = CountingStore::with_jobs(&[]);
        let harness = Harness::new(store.clone());
        let (seen, handler) = recorder();

        let cancelled =
            tokio::time::timeout(Duration::from_millis(20), harness.job_loop(handler).run()).await;
        assert!(cancelled.is_err());
        assert_eq!(store.started(), 1);

        store.push(KEY, b"{\"n\":9}".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(store.inner.len(KEY), 1);
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_loop_exits_immediately_when_not_running() {
        let store = CountingStore::with_jobs(&[]);
        let harness = Harness::new(store);
        harness.shutdown();

        let (_, handler) = recorder();
        harness.run(handler).await;
    }
}
