//! Namespace split (fan-out to shards) and completion rollup (fan-in to the job).

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use shardmap_core::{DomainError, JobState, NamespaceState, ShardId, ShardState};

use super::{Context, HandlerError, HandlerOutcome, Route};
use crate::contracts::shard_total;
use crate::lock::{Delivery, LockProtocol};

enum Rollup {
    Aborted,
    Applied { job_completed: bool },
}

#[derive(Clone)]
pub struct NamespaceOrchestrator {
    ctx: Arc<Context>,
}

impl NamespaceOrchestrator {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// `/namespace`: split the namespace into shards and schedule each one.
    ///
    /// Shards are scheduled before the total is written, so some of them may
    /// finish before this step commits. The final transaction re-reads the
    /// namespace and only sets `shards_total`; whichever write makes
    /// `successful + failed == total` schedules the completion task.
    #[instrument(skip(self, delivery), fields(id = %delivery.id, seq = delivery.seq))]
    pub fn handle_split(&self, delivery: &Delivery) -> Result<HandlerOutcome, HandlerError> {
        self.ctx.locked_step::<NamespaceState, _, _>(
            delivery,
            || self.abandon(delivery),
            |namespace, request_id| {
                let job = self.ctx.load_job(namespace.job_id())?;
                if job.abort {
                    return self.ctx.abort_step::<NamespaceState>(delivery, request_id);
                }

                let specs = self.ctx.splitter.split(&job, namespace.id.namespace())?;
                let total = shard_total(namespace.id.namespace(), specs.len())?;
                let queue = self.ctx.queue(delivery);
                let shard_path = self.ctx.path(Route::Shard);
                let now = Utc::now();

                for spec in &specs {
                    let shard = ShardState::new(ShardId::new(namespace.id.clone(), spec.index), total, now);
                    self.ctx.locks.schedule_if_absent(&shard, &shard_path, queue)?;
                }
                if self.ctx.config.log_verbose {
                    debug!(namespace = %namespace.id, shards = total, "shards scheduled");
                }

                let complete_path = self.ctx.path(Route::NamespaceComplete);
                let completing = self.ctx.datastore.run_in_transaction(self.ctx.attempts(), |tx| {
                    let mut fresh: NamespaceState = tx
                        .get(&delivery.id)?
                        .ok_or_else(|| HandlerError::NotFound(format!("namespace {}", delivery.id)))?;
                    LockProtocol::ensure_held(&fresh.lock, &delivery.id, request_id)?;

                    let completing = fresh.set_shards_total(total)?;
                    fresh.timing.start(now);
                    fresh.lock.complete();
                    if completing {
                        tx.add_task(LockProtocol::task_for(&fresh, &complete_path, queue));
                    }
                    tx.put(&fresh)?;
                    Ok::<_, HandlerError>(completing)
                })?;

                info!(namespace = %namespace.id, shards = total, completing, "namespace split");
                Ok(HandlerOutcome::Done)
            },
        )
    }

    /// `/namespace/complete`: recompute the namespace from its shards and fold
    /// it into the job.
    #[instrument(skip(self, delivery), fields(id = %delivery.id, seq = delivery.seq))]
    pub fn handle_complete(&self, delivery: &Delivery) -> Result<HandlerOutcome, HandlerError> {
        self.ctx.locked_step::<NamespaceState, _, _>(
            delivery,
            || self.abandon(delivery),
            |mut namespace, request_id| {
                let job = self.ctx.load_job(namespace.job_id())?;
                if job.abort {
                    return self.ctx.abort_step::<NamespaceState>(delivery, request_id);
                }

                let total = namespace.shards_total.ok_or_else(|| {
                    DomainError::invariant(format!("namespace {} completing before its split", namespace.id))
                })?;
                let names: Vec<String> = (0..total)
                    .map(|index| ShardId::new(namespace.id.clone(), index).to_string())
                    .collect();
                let shards: Vec<ShardState> = self
                    .ctx
                    .datastore
                    .get_multi::<ShardState>(&names)?
                    .into_iter()
                    .flatten()
                    .collect();

                namespace.recompute_from(&shards);
                if !namespace.is_done() {
                    return Err(DomainError::invariant(format!(
                        "namespace {}: {} of {total} shards accounted at completion",
                        namespace.id,
                        namespace.shards_accounted()
                    ))
                    .into());
                }
                let now = Utc::now();
                namespace.timing.complete(now);

                let queue = self.ctx.queue(delivery);
                let rollup = self.ctx.datastore.run_in_transaction(self.ctx.attempts(), |tx| {
                    let mut fresh: NamespaceState = tx
                        .get(&delivery.id)?
                        .ok_or_else(|| HandlerError::NotFound(format!("namespace {}", delivery.id)))?;
                    let mut job: JobState = tx
                        .get(fresh.job_id().as_str())?
                        .ok_or_else(|| HandlerError::NotFound(format!("job {}", fresh.job_id())))?;
                    if job.abort {
                        return Ok(Rollup::Aborted);
                    }
                    LockProtocol::ensure_held(&fresh.lock, &delivery.id, request_id)?;

                    fresh.copy_from(&namespace);
                    fresh.lock.complete();
                    job.record_namespace(&fresh)?;
                    let job_completed = self.ctx.complete_job_if_done(tx, &mut job, queue, now);
                    tx.put(&fresh)?;
                    tx.put(&job)?;
                    Ok::<_, HandlerError>(Rollup::Applied { job_completed })
                })?;

                match rollup {
                    Rollup::Aborted => self.ctx.abort_step::<NamespaceState>(delivery, request_id),
                    Rollup::Applied { job_completed } => {
                        info!(
                            namespace = %namespace.id,
                            successful = namespace.shards_successful,
                            failed = namespace.shards_failed,
                            job_completed,
                            "namespace rolled up"
                        );
                        Ok(HandlerOutcome::Done)
                    }
                }
            },
        )
    }

    /// Give up on a namespace step: the namespace counts as failed.
    fn abandon(&self, delivery: &Delivery) -> Result<HandlerOutcome, HandlerError> {
        let now = Utc::now();
        let queue = self.ctx.queue(delivery);
        let rolled = self.ctx.datastore.run_in_transaction(self.ctx.attempts(), |tx| {
            let Some(mut namespace) = tx.get::<NamespaceState>(&delivery.id)? else {
                return Ok::<_, HandlerError>(false);
            };
            namespace.lock.abandon(delivery.seq);

            // a completed timing means the rollup already landed
            let mut rolled = false;
            if !namespace.timing.is_completed() {
                let mut job: JobState = tx
                    .get(namespace.job_id().as_str())?
                    .ok_or_else(|| HandlerError::NotFound(format!("job {}", namespace.job_id())))?;
                if !job.abort {
                    namespace.abandoned = true;
                    namespace.timing.complete(now);
                    job.record_namespace(&namespace)?;
                    self.ctx.complete_job_if_done(tx, &mut job, queue, now);
                    tx.put(&job)?;
                    rolled = true;
                }
            }
            tx.put(&namespace)?;
            Ok(rolled)
        })?;

        warn!(namespace = %delivery.id, seq = delivery.seq, rolled, "namespace abandoned, counted as failed");
        Ok(HandlerOutcome::Abandoned)
    }
}
