//! Job → namespace → shard orchestration.
//!
//! Each step of a job's lifecycle is a task handled by one of the components
//! below, guarded by the lock protocol:
//!
//! | route | component | entity locked |
//! |-------|-----------|---------------|
//! | `/job` | [`JobController`] | job |
//! | `/iterate` | [`NamespaceIterator`] | iterator |
//! | `/namespace` | [`NamespaceOrchestrator`] (split) | namespace |
//! | `/shard` | [`ShardExecutor`] | shard |
//! | `/namespace/complete` | [`NamespaceOrchestrator`] (rollup) | namespace |
//! | `/job/complete` | [`JobController`] | job |
//!
//! Completion is detected inside the transaction that makes the final count
//! land, so the follow-up task is scheduled exactly once.

pub mod iterator;
pub mod job;
pub mod namespace;
pub mod shard;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use shardmap_core::{DomainError, JobId, JobState, Lockable, RequestId};

use crate::config::MapperConfig;
use crate::contracts::{
    EvenSplitter, NamespaceSource, ProcessorRegistry, ShardSplitter, SourceError, SplitError,
    StaticNamespaceSource,
};
use crate::lock::{Delivery, LockError, LockProtocol};
use crate::queue::TaskQueue;
use crate::store::{Datastore, EntityStore, StoreError, Transaction};

pub use iterator::NamespaceIterator;
pub use job::{JobController, JobSubmission};
pub use namespace::NamespaceOrchestrator;
pub use shard::ShardExecutor;

pub const JOB_PATH: &str = "/job";
pub const JOB_COMPLETE_PATH: &str = "/job/complete";
pub const ITERATOR_PATH: &str = "/iterate";
pub const NAMESPACE_PATH: &str = "/namespace";
pub const NAMESPACE_COMPLETE_PATH: &str = "/namespace/complete";
pub const SHARD_PATH: &str = "/shard";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Job,
    JobComplete,
    Iterate,
    Namespace,
    NamespaceComplete,
    Shard,
}

impl Route {
    pub const ALL: [Route; 6] = [
        Route::Job,
        Route::JobComplete,
        Route::Iterate,
        Route::Namespace,
        Route::NamespaceComplete,
        Route::Shard,
    ];

    /// Path relative to the configured base path.
    pub fn relative_path(self) -> &'static str {
        match self {
            Route::Job => JOB_PATH,
            Route::JobComplete => JOB_COMPLETE_PATH,
            Route::Iterate => ITERATOR_PATH,
            Route::Namespace => NAMESPACE_PATH,
            Route::NamespaceComplete => NAMESPACE_COMPLETE_PATH,
            Route::Shard => SHARD_PATH,
        }
    }
}

/// How a delivery was acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerOutcome {
    /// The step ran and its lock was released with success.
    Done,
    /// The job was aborted; the step was acknowledged without doing work.
    Aborted,
    /// The step's work had already been recorded by an earlier delivery.
    Skipped,
    /// The step exhausted its attempt limit and was given up.
    Abandoned,
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Split(#[from] SplitError),

    #[error("shard processing failed: {0}")]
    Process(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),
}

impl HandlerError {
    /// Status the task substrate (or API client) should see.
    pub fn status_code(&self) -> u16 {
        match self {
            HandlerError::Lock(e) => e.response_code(),
            HandlerError::Domain(DomainError::InvariantViolation(_)) => 500,
            HandlerError::Domain(_) => 400,
            HandlerError::NotFound(_) => 404,
            HandlerError::AlreadyExists(_) => 409,
            HandlerError::Store(_)
            | HandlerError::Source(_)
            | HandlerError::Split(_)
            | HandlerError::Process(_) => 500,
        }
    }

    /// Whether the delivery should be retried.
    pub fn should_retry(&self) -> bool {
        self.status_code() >= 500
    }
}

/// Dependencies shared by every handler.
pub(crate) struct Context {
    pub config: MapperConfig,
    pub datastore: Datastore,
    pub locks: LockProtocol,
    pub source: Arc<dyn NamespaceSource>,
    pub splitter: Arc<dyn ShardSplitter>,
    pub processors: ProcessorRegistry,
}

impl Context {
    pub fn path(&self, route: Route) -> String {
        self.config.path(route.relative_path())
    }

    pub fn attempts(&self) -> u32 {
        self.config.transaction_attempts
    }

    pub fn queue<'a>(&'a self, delivery: &'a Delivery) -> &'a str {
        self.config.queue_or_default(&delivery.queue)
    }

    pub fn load_job(&self, id: &JobId) -> Result<JobState, HandlerError> {
        self.datastore
            .get::<JobState>(id.as_str())?
            .ok_or_else(|| HandlerError::NotFound(format!("job {id}")))
    }

    /// Acquire the delivery's lock, run `step`, and on failure release the
    /// lock without success so the whole step is retried from scratch.
    pub fn locked_step<E, A, F>(
        &self,
        delivery: &Delivery,
        on_abandoned: A,
        step: F,
    ) -> Result<HandlerOutcome, HandlerError>
    where
        E: Lockable,
        A: FnOnce() -> Result<HandlerOutcome, HandlerError>,
        F: FnOnce(E, RequestId) -> Result<HandlerOutcome, HandlerError>,
    {
        let request_id = RequestId::new();
        let entity = match self.locks.get_lock::<E>(&delivery.id, delivery.seq, request_id) {
            Ok(entity) => entity,
            Err(LockError::Abandoned { key, seq, attempts }) => {
                error!(%key, seq, attempts, "step exhausted its attempts, giving up");
                return on_abandoned();
            }
            Err(e) => {
                if self.config.log_verbose {
                    debug!(id = %delivery.id, seq = delivery.seq, reason = %e, "delivery not run");
                }
                return Err(e.into());
            }
        };

        match step(entity, request_id) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                warn!(id = %delivery.id, seq = delivery.seq, error = %err, "step failed, releasing lock");
                if let Err(clear) = self.locks.clear_lock::<E>(&delivery.id, request_id, false) {
                    error!(id = %delivery.id, error = %clear, "failed to release lock after error");
                }
                Err(err)
            }
        }
    }

    /// Give up on a step that needs no bookkeeping beyond its lock.
    pub fn abandon_lock<E: Lockable>(&self, delivery: &Delivery) -> Result<HandlerOutcome, HandlerError> {
        self.locks.abandon::<E>(&delivery.id, delivery.seq)?;
        Ok(HandlerOutcome::Abandoned)
    }

    /// Acknowledge a step of an aborted job: no work, lock released.
    pub fn abort_step<E: Lockable>(
        &self,
        delivery: &Delivery,
        request_id: RequestId,
    ) -> Result<HandlerOutcome, HandlerError> {
        info!(id = %delivery.id, seq = delivery.seq, kind = E::KIND, "job aborted, skipping step");
        self.locks.clear_lock::<E>(&delivery.id, request_id, true)?;
        Ok(HandlerOutcome::Aborted)
    }

    /// Mark `job` complete inside `tx` and schedule `/job/complete` if every
    /// namespace is accounted and iteration has finished.
    pub fn complete_job_if_done(
        &self,
        tx: &mut Transaction<'_>,
        job: &mut JobState,
        queue: &str,
        now: DateTime<Utc>,
    ) -> bool {
        if !job.is_done() || job.is_completed() {
            return false;
        }
        job.mark_completed(now);
        tx.add_task(LockProtocol::task_for(job, &self.path(Route::JobComplete), queue));
        info!(
            job_id = %job.id,
            successful = job.namespaces_successful,
            failed = job.namespaces_failed,
            "all namespaces accounted, job complete"
        );
        true
    }
}

/// Entry point wiring every handler to one store, queue and set of contracts.
#[derive(Clone)]
pub struct Orchestrator {
    ctx: Arc<Context>,
    jobs: JobController,
    iterator: NamespaceIterator,
    namespaces: NamespaceOrchestrator,
    shards: ShardExecutor,
}

pub struct OrchestratorBuilder {
    config: MapperConfig,
    store: Arc<dyn EntityStore>,
    queue: Arc<dyn TaskQueue>,
    source: Arc<dyn NamespaceSource>,
    splitter: Arc<dyn ShardSplitter>,
    processors: ProcessorRegistry,
}

impl OrchestratorBuilder {
    pub fn source(mut self, source: impl NamespaceSource + 'static) -> Self {
        self.source = Arc::new(source);
        self
    }

    pub fn splitter(mut self, splitter: impl ShardSplitter + 'static) -> Self {
        self.splitter = Arc::new(splitter);
        self
    }

    pub fn processors(mut self, processors: ProcessorRegistry) -> Self {
        self.processors = processors;
        self
    }

    pub fn build(self) -> Orchestrator {
        let datastore = Datastore::new(self.store, self.queue, self.config.datastore_prefix.clone());
        let locks = LockProtocol::new(datastore.clone(), &self.config);
        let ctx = Arc::new(Context {
            config: self.config,
            datastore,
            locks,
            source: self.source,
            splitter: self.splitter,
            processors: self.processors,
        });
        Orchestrator {
            jobs: JobController::new(ctx.clone()),
            iterator: NamespaceIterator::new(ctx.clone()),
            namespaces: NamespaceOrchestrator::new(ctx.clone()),
            shards: ShardExecutor::new(ctx.clone()),
            ctx,
        }
    }
}

impl Orchestrator {
    pub fn builder(
        config: MapperConfig,
        store: Arc<dyn EntityStore>,
        queue: Arc<dyn TaskQueue>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            store,
            queue,
            source: Arc::new(StaticNamespaceSource::default()),
            splitter: Arc::new(EvenSplitter::default()),
            processors: ProcessorRegistry::default(),
        }
    }

    pub fn config(&self) -> &MapperConfig {
        &self.ctx.config
    }

    pub fn datastore(&self) -> &Datastore {
        &self.ctx.datastore
    }

    pub fn jobs(&self) -> &JobController {
        &self.jobs
    }

    pub fn iterator(&self) -> &NamespaceIterator {
        &self.iterator
    }

    pub fn namespaces(&self) -> &NamespaceOrchestrator {
        &self.namespaces
    }

    pub fn shards(&self) -> &ShardExecutor {
        &self.shards
    }

    /// Full handler path of every route.
    pub fn routes(&self) -> Vec<(String, Route)> {
        Route::ALL
            .into_iter()
            .map(|route| (self.ctx.path(route), route))
            .collect()
    }

    pub fn dispatch(&self, route: Route, delivery: &Delivery) -> Result<HandlerOutcome, HandlerError> {
        match route {
            Route::Job => self.jobs.handle_job(delivery),
            Route::JobComplete => self.jobs.handle_job_complete(delivery),
            Route::Iterate => self.iterator.handle(delivery),
            Route::Namespace => self.namespaces.handle_split(delivery),
            Route::NamespaceComplete => self.namespaces.handle_complete(delivery),
            Route::Shard => self.shards.handle(delivery),
        }
    }
}
