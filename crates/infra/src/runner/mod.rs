//! Embedded task runner: delivers queued tasks to registered handlers.
//!
//! Plays the role of the task substrate for single-process deployments and
//! tests. Delivery is at-least-once: a handler error that asks for a retry
//! re-enqueues the task with backoff, and nothing stops a task from being
//! delivered again after it succeeded.

mod retry;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::lock::{Delivery, LockProtocol};
use crate::orchestrator::{HandlerError, HandlerOutcome, Orchestrator};
use crate::queue::{InMemoryTaskQueue, Task, TaskQueue};
use crate::store::Datastore;

pub use retry::{BackoffStrategy, RetryPolicy};

/// Handler bound to one task path.
pub type TaskHandler = Arc<dyn Fn(&Delivery) -> Result<HandlerOutcome, HandlerError> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct TaskRunnerConfig {
    /// How often to poll an empty queue
    pub poll_interval: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for TaskRunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            name: "task-runner".to_string(),
        }
    }
}

impl TaskRunnerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    Handled(HandlerOutcome),
    /// The handler answered with a 200-class error (duplicate, stale, ...).
    Acknowledged(u16),
    /// Re-enqueued for another attempt.
    Retried(u16),
    /// Dropped without retry (4xx, unknown path, retries exhausted).
    Dropped(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub path: String,
    pub lock_id: Option<String>,
    pub status: DeliveryStatus,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunnerStats {
    pub delivered: u64,
    pub handled: u64,
    pub acknowledged: u64,
    pub retried: u64,
    pub dropped: u64,
    pub per_path: BTreeMap<String, u64>,
    pub uptime_secs: u64,
}

/// Handle to control a spawned runner.
#[derive(Debug)]
pub struct TaskRunnerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<RunnerStats>>,
}

impl TaskRunnerHandle {
    /// Request graceful shutdown and wait for the worker thread.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> RunnerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

pub struct TaskRunner {
    queue: Arc<InMemoryTaskQueue>,
    datastore: Datastore,
    handlers: HashMap<String, TaskHandler>,
    retry: RetryPolicy,
    stats: Arc<Mutex<RunnerStats>>,
}

impl TaskRunner {
    /// `datastore` is used to relay outbox tasks left behind by failed relays.
    pub fn new(queue: Arc<InMemoryTaskQueue>, datastore: Datastore, retry: RetryPolicy) -> Self {
        Self {
            queue,
            datastore,
            handlers: HashMap::new(),
            retry,
            stats: Arc::new(Mutex::new(RunnerStats::default())),
        }
    }

    pub fn register<F>(&mut self, path: impl Into<String>, handler: F)
    where
        F: Fn(&Delivery) -> Result<HandlerOutcome, HandlerError> + Send + Sync + 'static,
    {
        self.handlers.insert(path.into(), Arc::new(handler));
    }

    /// Register every orchestration route of `orchestrator`.
    pub fn with_routes(mut self, orchestrator: &Orchestrator) -> Self {
        for (path, route) in orchestrator.routes() {
            let orchestrator = orchestrator.clone();
            self.register(path, move |delivery| orchestrator.dispatch(route, delivery));
        }
        self
    }

    pub fn stats(&self) -> RunnerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Deliver one task to its handler.
    pub fn deliver(&self, mut task: Task) -> DeliveryReport {
        let lock_id = task.lock.as_ref().map(|l| l.id.clone());
        let status = self.deliver_inner(&mut task);
        self.record(&task.path, &status);
        DeliveryReport {
            path: task.path,
            lock_id,
            status,
        }
    }

    fn deliver_inner(&self, task: &mut Task) -> DeliveryStatus {
        let Some(handler) = self.handlers.get(&task.path) else {
            warn!(path = %task.path, "no handler registered for task path");
            return DeliveryStatus::Dropped(404);
        };
        let delivery = match LockProtocol::parse_lock(|name| task.header(name)) {
            Ok(delivery) => delivery,
            Err(e) => {
                warn!(path = %task.path, error = %e, "dropping malformed task");
                return DeliveryStatus::Dropped(e.response_code());
            }
        };

        let err = match handler(&delivery) {
            Ok(outcome) => return DeliveryStatus::Handled(outcome),
            Err(err) => err,
        };
        let code = err.status_code();
        if code < 300 {
            debug!(path = %task.path, id = %delivery.id, seq = delivery.seq, reason = %err, "delivery acknowledged");
            return DeliveryStatus::Acknowledged(code);
        }
        if !err.should_retry() {
            warn!(path = %task.path, id = %delivery.id, code, error = %err, "delivery rejected");
            return DeliveryStatus::Dropped(code);
        }

        task.attempt += 1;
        if !self.retry.should_retry(task.attempt) {
            error!(path = %task.path, id = %delivery.id, attempts = task.attempt, error = %err, "giving up on task");
            return DeliveryStatus::Dropped(code);
        }
        let retry = task.clone().with_delay(self.retry.delay_for_attempt(task.attempt));
        match self.queue.add(retry) {
            Ok(()) => {
                debug!(path = %task.path, id = %delivery.id, attempt = task.attempt, error = %err, "delivery will be retried");
                DeliveryStatus::Retried(code)
            }
            Err(e) => {
                error!(path = %task.path, error = %e, "failed to re-enqueue task");
                DeliveryStatus::Dropped(code)
            }
        }
    }

    fn record(&self, path: &str, status: &DeliveryStatus) {
        if let Ok(mut s) = self.stats.lock() {
            s.delivered += 1;
            *s.per_path.entry(path.to_string()).or_insert(0) += 1;
            match status {
                DeliveryStatus::Handled(_) => s.handled += 1,
                DeliveryStatus::Acknowledged(_) => s.acknowledged += 1,
                DeliveryStatus::Retried(_) => s.retried += 1,
                DeliveryStatus::Dropped(_) => s.dropped += 1,
            }
        }
    }

    fn relay(&self) {
        if let Err(e) = self.datastore.relay_outbox() {
            warn!(error = %e, "outbox relay failed");
        }
    }

    /// Deliver the next queued task, ignoring retry delays.
    pub fn run_once(&self) -> Option<DeliveryReport> {
        self.relay();
        self.queue.take_next().map(|task| self.deliver(task))
    }

    /// Deliver the next queued task accepted by `pred`, ignoring retry delays.
    pub fn run_matching(&self, pred: impl Fn(&Task) -> bool) -> Option<DeliveryReport> {
        self.relay();
        self.queue.take_matching(pred).map(|task| self.deliver(task))
    }

    /// Deliver until the queue is empty or `max_deliveries` is reached.
    /// Returns every delivery report in order.
    pub fn run_until_idle(&self, max_deliveries: usize) -> Vec<DeliveryReport> {
        let mut reports = Vec::new();
        while reports.len() < max_deliveries {
            match self.run_once() {
                Some(report) => reports.push(report),
                None => break,
            }
        }
        reports
    }

    /// Run on a background thread, honouring retry delays.
    pub fn spawn(self, config: TaskRunnerConfig) -> std::io::Result<TaskRunnerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = self.stats.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || runner_loop(self, config, shutdown_rx))?;

        Ok(TaskRunnerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn runner_loop(runner: TaskRunner, config: TaskRunnerConfig, shutdown_rx: mpsc::Receiver<()>) {
    info!(runner = %config.name, "task runner started");
    let start_time = Instant::now();

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }
        if let Ok(mut s) = runner.stats.lock() {
            s.uptime_secs = start_time.elapsed().as_secs();
        }

        runner.relay();
        match runner.queue.take_ready(Utc::now()) {
            Some(task) => {
                let report = runner.deliver(task);
                debug!(runner = %config.name, path = %report.path, status = ?report.status, "task delivered");
            }
            None => thread::sleep(config.poll_interval),
        }
    }

    info!(runner = %config.name, "task runner stopped");
}
