//! Job lifecycle: submission, start, abort, status and terminal completion.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use shardmap_core::{IteratorState, JobId, JobState, Query, WorkDescriptor};

use super::{Context, HandlerError, HandlerOutcome, Route};
use crate::lock::Delivery;

/// Everything needed to create a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSubmission {
    /// Caller-chosen id; generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub query: Query,
    pub descriptor: WorkDescriptor,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub shards: Option<u32>,
    /// Queue for every task of this job; the configured default when absent.
    #[serde(default)]
    pub queue: Option<String>,
}

impl JobSubmission {
    pub fn new(query: Query, descriptor: WorkDescriptor) -> Self {
        Self {
            id: None,
            query,
            descriptor,
            bucket: None,
            shards: None,
            queue: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_shards(mut self, shards: u32) -> Self {
        self.shards = Some(shards);
        self
    }

    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }
}

#[derive(Clone)]
pub struct JobController {
    ctx: Arc<Context>,
}

impl JobController {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Persist a new job and schedule its `/job` step.
    #[instrument(skip(self, submission), fields(job_id), err)]
    pub fn submit(&self, submission: JobSubmission) -> Result<JobState, HandlerError> {
        submission.query.validate()?;
        let id = match submission.id {
            Some(id) => JobId::new(id)?,
            None => JobId::generate(),
        };
        tracing::Span::current().record("job_id", tracing::field::display(&id));

        let mut job = JobState::new(id, submission.query, submission.descriptor, Utc::now());
        if let Some(bucket) = submission.bucket {
            job = job.with_bucket(bucket);
        }
        if let Some(shards) = submission.shards {
            job = job.with_shards(shards);
        }

        let queue = submission
            .queue
            .unwrap_or_else(|| self.ctx.config.default_queue.clone());
        let created = self
            .ctx
            .locks
            .schedule_if_absent(&job, &self.ctx.path(Route::Job), &queue)?;
        if !created {
            return Err(HandlerError::AlreadyExists(format!("job {}", job.id)));
        }

        info!(job_id = %job.id, kind = %job.query.kind, %queue, "job submitted");
        Ok(job)
    }

    /// `/job`: start the job under its lock.
    #[instrument(skip(self, delivery), fields(id = %delivery.id, seq = delivery.seq))]
    pub fn handle_job(&self, delivery: &Delivery) -> Result<HandlerOutcome, HandlerError> {
        let queue = self.ctx.queue(delivery);
        self.ctx.locked_step::<JobState, _, _>(
            delivery,
            || self.abandon_start(delivery, queue),
            |job, request_id| {
                if job.abort {
                    return self.ctx.abort_step::<JobState>(delivery, request_id);
                }
                self.start(&job, queue)?;
                self.ctx
                    .locks
                    .clear_lock::<JobState>(&delivery.id, request_id, true)?;
                Ok(HandlerOutcome::Done)
            },
        )
    }

    /// Create the job's iterator and schedule its first page.
    ///
    /// The job itself is not modified; the iterator reports back through its
    /// own transactions. Returns false if the iterator already existed.
    pub fn start(&self, job: &JobState, queue: &str) -> Result<bool, HandlerError> {
        if self.ctx.config.log_verbose {
            tracing::debug!(job_id = %job.id, "creating iterator");
        }
        let iterator = IteratorState::new(job.id.clone(), Utc::now());
        let created = self
            .ctx
            .locks
            .schedule_if_absent(&iterator, &self.ctx.path(Route::Iterate), queue)?;
        if created {
            info!(job_id = %job.id, "job started");
        }
        Ok(created)
    }

    /// Give up on starting the job after the step ran out of attempts.
    ///
    /// Without an iterator nothing else can end the job, so iteration is
    /// closed here (flagged as abandoned) and the empty job completes.
    fn abandon_start(&self, delivery: &Delivery, queue: &str) -> Result<HandlerOutcome, HandlerError> {
        let now = Utc::now();
        let closed = self.ctx.datastore.run_in_transaction(self.ctx.attempts(), |tx| {
            let mut job: JobState = tx
                .get(&delivery.id)?
                .ok_or_else(|| HandlerError::NotFound(format!("job {}", delivery.id)))?;
            job.lock.abandon(delivery.seq);

            let started = tx.get::<IteratorState>(job.id.as_str())?.is_some();
            let close = !started && job.iterating && !job.abort;
            if close {
                job.abandon_iteration();
                self.ctx.complete_job_if_done(tx, &mut job, queue, now);
            }
            tx.put(&job)?;
            Ok::<_, HandlerError>(close)
        })?;

        warn!(job_id = %delivery.id, seq = delivery.seq, closed, "job start abandoned");
        Ok(HandlerOutcome::Abandoned)
    }

    /// `/job/complete`: terminal persist of a job whose completion was
    /// detected transactionally.
    #[instrument(skip(self, delivery), fields(id = %delivery.id, seq = delivery.seq))]
    pub fn handle_job_complete(&self, delivery: &Delivery) -> Result<HandlerOutcome, HandlerError> {
        self.ctx.locked_step::<JobState, _, _>(
            delivery,
            || self.ctx.abandon_lock::<JobState>(delivery),
            |mut job, request_id| {
                if job.abort {
                    return self.ctx.abort_step::<JobState>(delivery, request_id);
                }
                if !job.is_done() {
                    return Err(HandlerError::Domain(shardmap_core::DomainError::invariant(format!(
                        "job {} completion delivered before every namespace was accounted",
                        job.id
                    ))));
                }
                self.completed(&mut job)?;
                Ok(HandlerOutcome::Done)
            },
        )
    }

    /// Persist the terminal state of `job` outside any transaction.
    ///
    /// Idempotent: the first completion time is kept.
    pub fn completed(&self, job: &mut JobState) -> Result<(), HandlerError> {
        job.mark_completed(Utc::now());
        self.ctx.datastore.put(job)?;
        info!(
            job_id = %job.id,
            namespaces = job.namespaces_total,
            failed = job.namespaces_failed,
            count = job.timing.count,
            bucket = job.bucket.as_deref().unwrap_or(""),
            duration_ms = job.timing.duration().map_or(0, |d| d.num_milliseconds()),
            "job completed"
        );
        Ok(())
    }

    /// Request cancellation. Steps that have not started yet become no-ops.
    #[instrument(skip(self), fields(job_id = %id), err)]
    pub fn abort(&self, id: &JobId) -> Result<JobState, HandlerError> {
        let job = self
            .ctx
            .datastore
            .run_in_transaction(self.ctx.attempts(), |tx| {
                let mut job: JobState = tx
                    .get(id.as_str())?
                    .ok_or_else(|| HandlerError::NotFound(format!("job {id}")))?;
                if !job.abort {
                    job.abort = true;
                    tx.put(&job)?;
                }
                Ok::<_, HandlerError>(job)
            })?;
        info!(job_id = %id, "job abort requested");
        Ok(job)
    }

    pub fn status(&self, id: &JobId) -> Result<JobState, HandlerError> {
        self.ctx.load_job(id)
    }
}
