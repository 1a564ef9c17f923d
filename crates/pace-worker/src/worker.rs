use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::failure::{ErrorCallbacks, FailurePath};
use crate::handler::JobHandler;
use crate::job_loop::{AbortOnDrop, JobLoop};
use pace_core::{ConfigError, JobError, LoadAverages, LoadTracker, QueueName};
use pace_store::{BlockingQueue, RedisQueue};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, info_span, warn, Instrument, Span};

/// Lifecycle of a [`Worker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    Created,
    Running,
    ShuttingDown,
    Stopped,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Created => "created",
            WorkerState::Running => "running",
            WorkerState::ShuttingDown => "shutting_down",
            WorkerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consumes one queue, one job at a time.
///
/// Clones share the same state, so a clone can be moved into another task to
/// call [`Worker::shutdown`] or [`Worker::on_error`] while [`Worker::start`]
/// runs.
#[derive(Clone)]
pub struct Worker {
    id: String,
    queue: QueueName,
    store: Arc<dyn BlockingQueue>,
    config: WorkerConfig,
    load: Arc<Mutex<LoadTracker>>,
    shared_callbacks: ErrorCallbacks,
    callbacks: ErrorCallbacks,
    state: Arc<watch::Sender<WorkerState>>,
}

impl Worker {
    /// Build a worker for `queue`, or for `config.queue` when `queue` is
    /// absent or empty.
    pub fn new(
        queue: Option<&str>,
        config: WorkerConfig,
        store: Arc<dyn BlockingQueue>,
    ) -> Result<Self, ConfigError> {
        let queue = QueueName::resolve(queue, config.queue.as_deref(), &config.namespace)?;
        let load = LoadTracker::new(config.load_interval()?);
        let (state, _) = watch::channel(WorkerState::Created);

        Ok(Worker {
            id: config.generate_worker_id(),
            queue,
            store,
            config,
            load: Arc::new(Mutex::new(load)),
            shared_callbacks: ErrorCallbacks::process_wide(),
            callbacks: ErrorCallbacks::new(),
            state: Arc::new(state),
        })
    }

    /// Build a worker backed by the redis server at `config.redis_url`.
    pub fn with_redis(queue: Option<&str>, config: WorkerConfig) -> Result<Self, WorkerError> {
        let store = RedisQueue::open(&config.redis_url)?;
        Ok(Self::new(queue, config, Arc::new(store))?)
    }

    /// Replace the process-wide callback list this worker reports to.
    pub fn with_shared_callbacks(mut self, shared: ErrorCallbacks) -> Self {
        self.shared_callbacks = shared;
        self
    }

    /// Register a callback for failures on this worker only.
    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&[u8], &JobError) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.callbacks.register(callback);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn load(&self) -> LoadAverages {
        self.load.lock().averages()
    }

    /// Jobs handled successfully so far.
    pub fn processed(&self) -> u64 {
        self.load.lock().total()
    }

    /// Process jobs with `handler` until [`Worker::shutdown`] is called or a
    /// termination signal arrives.
    ///
    /// Fails only if the worker was already started or shut down. Dropping
    /// the returned future before it completes also stops the worker.
    pub async fn start<H: JobHandler>(&self, handler: H) -> Result<(), WorkerError> {
        let mut found = WorkerState::Created;
        let started = self.state.send_if_modified(|state| {
            found = *state;
            if *state == WorkerState::Created {
                *state = WorkerState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(WorkerError::InvalidState(found));
        }

        let span = info_span!("worker", worker_id = %self.id, queue = %self.queue);
        info!(parent: &span, key = %self.queue.key(), "Starting up");

        let mut run = RunGuard {
            state: self.state.clone(),
            load: self.load.clone(),
            span: span.clone(),
            tasks: vec![AbortOnDrop::new(self.spawn_load_timer(span.clone()))],
        };
        if self.config.handle_signals {
            run.tasks
                .push(AbortOnDrop::new(self.spawn_signal_listener(span.clone())));
        }

        let job_loop = JobLoop::new(
            self.queue.clone(),
            self.store.clone(),
            handler,
            self.load.clone(),
            FailurePath::new(self.shared_callbacks.clone(), self.callbacks.clone()),
            self.state.subscribe(),
            self.config.fetch_retry_delay(),
        );
        job_loop.run().instrument(span).await;
        drop(run);

        Ok(())
    }

    /// Stop fetching new jobs. The job being handled, if any, finishes first.
    ///
    /// Safe to call any number of times. A worker that was never started
    /// goes straight to `Stopped`.
    pub fn shutdown(&self) {
        let changed = self.state.send_if_modified(|state| match *state {
            WorkerState::Running => {
                *state = WorkerState::ShuttingDown;
                true
            }
            WorkerState::Created => {
                *state = WorkerState::Stopped;
                true
            }
            WorkerState::ShuttingDown | WorkerState::Stopped => false,
        });

        if changed {
            info!(worker_id = %self.id, queue = %self.queue, "Shutting down");
        }
    }

    fn spawn_load_timer(&self, span: Span) -> JoinHandle<()> {
        let load = self.load.clone();
        let period = load.lock().interval();

        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                let mut last = Instant::now();

                loop {
                    let now = ticker.tick().await;
                    let averages = load.lock().recompute_after(now.duration_since(last));
                    last = now;
                    info!("load averages: {}", averages);
                }
            }
            .instrument(span),
        )
    }

    fn spawn_signal_listener(&self, span: Span) -> JoinHandle<()> {
        let worker = self.clone();

        tokio::spawn(
            async move {
                if let Err(e) = listen_for_signals(&worker).await {
                    warn!("Failed to listen for termination signals: {}", e);
                }
            }
            .instrument(span),
        )
    }
}

/// Tears down a started worker, whether `start` returned or was cancelled.
struct RunGuard {
    state: Arc<watch::Sender<WorkerState>>,
    load: Arc<Mutex<LoadTracker>>,
    span: Span,
    tasks: Vec<AbortOnDrop<()>>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.tasks.clear();
        self.state.send_replace(WorkerState::Stopped);
        info!(parent: &self.span, processed = self.load.lock().total(), "Stopped");
    }
}

#[cfg(unix)]
async fn listen_for_signals(worker: &Worker) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;
    let mut int = signal(SignalKind::interrupt())?;

    loop {
        let name = tokio::select! {
            _ = term.recv() => "SIGTERM",
            _ = quit.recv() => "SIGQUIT",
            _ = int.recv() => "SIGINT",
        };
        info!("Received {}", name);
        worker.shutdown();
    }
}

#[cfg(not(unix))]
async fn listen_for_signals(worker: &Worker) -> std::io::Result<()> {
    loop {
        tokio::signal::ctrl_c().await?;
        info!("Received ctrl-c");
        worker.shutdown();
    }
}
