//! Namespace discovery: one page of the job's data source per delivery.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use shardmap_core::{IteratorState, JobState, NamespaceId, NamespaceState};

use super::{Context, HandlerError, HandlerOutcome, Route};
use crate::lock::{Delivery, LockProtocol};

enum PageOutcome {
    Aborted,
    Continued { created: u64 },
    Exhausted { created: u64, total: u64 },
}

#[derive(Clone)]
pub struct NamespaceIterator {
    ctx: Arc<Context>,
}

impl NamespaceIterator {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// `/iterate`: list the next page and schedule a split for every
    /// namespace not seen before.
    ///
    /// New namespaces, the advanced cursor and the raised job total are
    /// committed together, so a page replayed after a failure neither double
    /// counts nor lets a namespace report before it is part of the total.
    #[instrument(skip(self, delivery), fields(id = %delivery.id, seq = delivery.seq))]
    pub fn handle(&self, delivery: &Delivery) -> Result<HandlerOutcome, HandlerError> {
        self.ctx.locked_step::<IteratorState, _, _>(
            delivery,
            || self.abandon(delivery),
            |iterator, request_id| {
                let job = self.ctx.load_job(&iterator.job_id)?;
                if job.abort {
                    return self.ctx.abort_step::<IteratorState>(delivery, request_id);
                }

                let page = self.ctx.source.list(
                    &job.query,
                    iterator.cursor.as_deref(),
                    self.ctx.config.iterator_page_size,
                )?;
                if self.ctx.config.log_verbose {
                    debug!(
                        job_id = %job.id,
                        cursor = iterator.cursor.as_deref().unwrap_or(""),
                        listed = page.namespaces.len(),
                        "namespace page listed"
                    );
                }

                let now = Utc::now();
                let queue = self.ctx.queue(delivery);
                let split_path = self.ctx.path(Route::Namespace);
                let iterate_path = self.ctx.path(Route::Iterate);

                let outcome = self.ctx.datastore.run_in_transaction(self.ctx.attempts(), |tx| {
                    let mut fresh: IteratorState = tx
                        .get(&delivery.id)?
                        .ok_or_else(|| HandlerError::NotFound(format!("iterator {}", delivery.id)))?;
                    LockProtocol::ensure_held(&fresh.lock, &delivery.id, request_id)?;

                    let mut job: JobState = tx
                        .get(fresh.job_id.as_str())?
                        .ok_or_else(|| HandlerError::NotFound(format!("job {}", fresh.job_id)))?;
                    if job.abort {
                        return Ok(PageOutcome::Aborted);
                    }

                    let mut created = 0;
                    for name in page.namespaces.iter().filter(|n| job.query.matches_namespace(n)) {
                        let id = NamespaceId::new(job.id.clone(), name.as_str());
                        if tx.get::<NamespaceState>(&id.to_string())?.is_some() {
                            continue;
                        }
                        LockProtocol::schedule(tx, &NamespaceState::new(id, now), &split_path, queue)?;
                        created += 1;
                    }

                    fresh.count += created;
                    fresh.pages += 1;
                    fresh.cursor = page.next_cursor.clone();
                    fresh.timing.start(now);
                    job.timing.start(now);
                    job.raise_namespaces_total(fresh.count);

                    let outcome = if page.next_cursor.is_some() {
                        fresh.lock.complete();
                        LockProtocol::schedule(tx, &fresh, &iterate_path, queue)?;
                        PageOutcome::Continued { created }
                    } else {
                        fresh.exhausted = true;
                        fresh.timing.complete(now);
                        fresh.lock.complete();
                        job.iterating = false;
                        self.ctx.complete_job_if_done(tx, &mut job, queue, now);
                        tx.put(&fresh)?;
                        PageOutcome::Exhausted {
                            created,
                            total: fresh.count,
                        }
                    };
                    tx.put(&job)?;
                    Ok::<_, HandlerError>(outcome)
                })?;

                match outcome {
                    PageOutcome::Aborted => self.ctx.abort_step::<IteratorState>(delivery, request_id),
                    PageOutcome::Continued { created } => {
                        if self.ctx.config.log_verbose {
                            debug!(job_id = %iterator.job_id, created, "iterator page done, rescheduled");
                        }
                        Ok(HandlerOutcome::Done)
                    }
                    PageOutcome::Exhausted { created, total } => {
                        info!(job_id = %iterator.job_id, created, namespaces = total, "iteration finished");
                        Ok(HandlerOutcome::Done)
                    }
                }
            },
        )
    }

    /// Give up on enumeration after the step ran out of attempts.
    ///
    /// The job stops iterating with the namespaces discovered so far and is
    /// flagged, then completes as soon as those are accounted.
    fn abandon(&self, delivery: &Delivery) -> Result<HandlerOutcome, HandlerError> {
        let now = Utc::now();
        let queue = self.ctx.queue(delivery);
        let (job_id, discovered) = self.ctx.datastore.run_in_transaction(self.ctx.attempts(), |tx| {
            let mut iterator: IteratorState = tx
                .get(&delivery.id)?
                .ok_or_else(|| HandlerError::NotFound(format!("iterator {}", delivery.id)))?;
            iterator.lock.abandon(delivery.seq);
            iterator.timing.complete(now);

            let mut job: JobState = tx
                .get(iterator.job_id.as_str())?
                .ok_or_else(|| HandlerError::NotFound(format!("job {}", iterator.job_id)))?;
            if job.iterating && !job.abort {
                job.abandon_iteration();
                self.ctx.complete_job_if_done(tx, &mut job, queue, now);
                tx.put(&job)?;
            }
            tx.put(&iterator)?;
            Ok::<_, HandlerError>((job.id, iterator.count))
        })?;

        warn!(%job_id, seq = delivery.seq, discovered, "namespace iteration abandoned");
        Ok(HandlerOutcome::Abandoned)
    }
}
