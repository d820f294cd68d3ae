//! Shard execution and the per-shard terminal signal.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use shardmap_core::{NamespaceState, RequestId, ShardId, ShardOutcome, ShardReport, ShardState};

use super::{Context, HandlerError, HandlerOutcome, Route};
use crate::contracts::{ProcessError, ShardContext};
use crate::lock::{Delivery, LockProtocol};

/// Who is reporting a shard outcome, and what happens to the shard lock.
#[derive(Debug, Clone, Copy)]
enum Reporter {
    /// The delivery holding the shard lock; the lock is released with success.
    Holder(RequestId),
    /// The step `seq` ran out of attempts; the lock is abandoned.
    Abandoned(u64),
    /// An executor outside the lock protocol.
    External,
}

#[derive(Clone)]
pub struct ShardExecutor {
    ctx: Arc<Context>,
}

impl ShardExecutor {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// `/shard`: run the processor registered for the job's descriptor.
    #[instrument(skip(self, delivery), fields(id = %delivery.id, seq = delivery.seq))]
    pub fn handle(&self, delivery: &Delivery) -> Result<HandlerOutcome, HandlerError> {
        let shard_id: ShardId = delivery.id.parse()?;
        let queue = self.ctx.queue(delivery);

        self.ctx.locked_step::<ShardState, _, _>(
            delivery,
            || {
                let outcome = ShardOutcome::failed(format!(
                    "abandoned after {} attempts",
                    self.ctx.config.max_lock_retries
                ));
                self.record(
                    &shard_id,
                    outcome,
                    &ShardReport::default(),
                    Reporter::Abandoned(delivery.seq),
                    Utc::now(),
                    queue,
                )?;
                Ok(HandlerOutcome::Abandoned)
            },
            |shard, request_id| {
                let job = self.ctx.load_job(shard_id.job_id())?;
                if job.abort {
                    return self.ctx.abort_step::<ShardState>(delivery, request_id);
                }
                if shard.is_reported() {
                    self.ctx
                        .locks
                        .clear_lock::<ShardState>(&delivery.id, request_id, true)?;
                    return Ok(HandlerOutcome::Skipped);
                }

                let started = Utc::now();
                let holder = Reporter::Holder(request_id);
                let Some(processor) = self.ctx.processors.get(&job.descriptor.kind) else {
                    warn!(shard = %shard_id, kind = %job.descriptor.kind, "no processor registered");
                    let outcome = ShardOutcome::failed(format!(
                        "no processor registered for '{}'",
                        job.descriptor.kind
                    ));
                    self.record(&shard_id, outcome, &ShardReport::default(), holder, started, queue)?;
                    return Ok(HandlerOutcome::Done);
                };

                let (outcome, report) = match processor.process(&ShardContext { job: &job, shard: &shard }) {
                    Ok(report) => (ShardOutcome::Succeeded, report),
                    Err(ProcessError::Permanent(reason)) => {
                        warn!(shard = %shard_id, %reason, "shard failed");
                        (ShardOutcome::failed(reason), ShardReport::default())
                    }
                    Err(ProcessError::Retryable(reason)) => return Err(HandlerError::Process(reason)),
                };
                self.record(&shard_id, outcome, &report, holder, started, queue)?;
                Ok(HandlerOutcome::Done)
            },
        )
    }

    /// Report a shard's terminal outcome from outside the lock protocol.
    ///
    /// Duplicate reports are ignored. Returns true if this report completed the
    /// namespace (and scheduled its completion).
    pub fn record_outcome(
        &self,
        shard_id: &ShardId,
        outcome: ShardOutcome,
        report: &ShardReport,
    ) -> Result<bool, HandlerError> {
        self.record(
            shard_id,
            outcome,
            report,
            Reporter::External,
            Utc::now(),
            &self.ctx.config.default_queue,
        )
    }

    /// Record the outcome on the shard and count it on the namespace, in one
    /// transaction. The shard's outcome is what makes the count exactly-once.
    fn record(
        &self,
        shard_id: &ShardId,
        outcome: ShardOutcome,
        report: &ShardReport,
        reporter: Reporter,
        started: DateTime<Utc>,
        queue: &str,
    ) -> Result<bool, HandlerError> {
        let name = shard_id.to_string();
        let namespace_name = shard_id.namespace_id().to_string();
        let complete_path = self.ctx.path(Route::NamespaceComplete);

        let became_done = self.ctx.datastore.run_in_transaction(self.ctx.attempts(), |tx| {
            let now = Utc::now();
            let mut shard: ShardState = tx
                .get(&name)?
                .ok_or_else(|| HandlerError::NotFound(format!("shard {name}")))?;
            if let Reporter::Holder(request_id) = reporter {
                LockProtocol::ensure_held(&shard.lock, &name, request_id)?;
            }

            let already_reported = shard.is_reported();
            match reporter {
                Reporter::Holder(_) => shard.lock.complete(),
                Reporter::Abandoned(seq) => shard.lock.abandon(seq),
                Reporter::External => {}
            }
            if already_reported {
                tx.put(&shard)?;
                return Ok::<_, HandlerError>(false);
            }

            shard.timing.start(started);
            shard.timing.record(report.count, &report.counters);
            shard.timing.complete(now);
            shard.outcome = Some(outcome.clone());
            tx.put(&shard)?;

            let mut namespace: NamespaceState = tx
                .get(&namespace_name)?
                .ok_or_else(|| HandlerError::NotFound(format!("namespace {namespace_name}")))?;
            if namespace.shards_total.is_some_and(|total| shard_id.index() >= total) {
                warn!(shard = %name, total = ?namespace.shards_total, "shard outside the namespace split, not counted");
                return Ok(false);
            }

            let became_done = namespace.record_shard(&outcome, &shard.timing)?;
            if became_done {
                tx.add_task(LockProtocol::task_for(&namespace, &complete_path, queue));
            }
            tx.put(&namespace)?;
            Ok(became_done)
        })?;

        if self.ctx.config.log_verbose {
            debug!(shard = %shard_id, outcome = ?outcome, became_done, "shard outcome recorded");
        }
        Ok(became_done)
    }
}
