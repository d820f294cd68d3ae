//! Job state: the root of the aggregation tree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{Entity, Lockable};
use crate::error::{DomainError, DomainResult};
use crate::id::JobId;
use crate::lock::LockState;
use crate::namespace::NamespaceState;
use crate::query::{Query, WorkDescriptor};
use crate::timing::Timing;

/// Shard target used when a submission does not give one.
pub const DEFAULT_SHARDS: u32 = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub id: JobId,
    pub query: Query,
    pub descriptor: WorkDescriptor,
    /// Output sink reference; `None` means no output is persisted.
    pub bucket: Option<String>,
    /// Set externally to request cancellation.
    pub abort: bool,
    /// Target number of shards per namespace (hint for the splitter).
    pub shards: u32,
    /// True until the iterator has exhausted the data source.
    pub iterating: bool,
    /// Enumeration was given up before the source was exhausted;
    /// `namespaces_total` covers only what had been discovered.
    #[serde(default)]
    pub iteration_abandoned: bool,
    pub namespaces_total: u64,
    pub namespaces_successful: u64,
    pub namespaces_failed: u64,
    pub timing: Timing,
    pub lock: LockState,
}

impl JobState {
    pub fn new(id: JobId, query: Query, descriptor: WorkDescriptor, now: DateTime<Utc>) -> Self {
        Self {
            id,
            query,
            descriptor,
            bucket: None,
            abort: false,
            shards: DEFAULT_SHARDS,
            iterating: true,
            iteration_abandoned: false,
            namespaces_total: 0,
            namespaces_successful: 0,
            namespaces_failed: 0,
            timing: Timing::new(now),
            lock: LockState::default(),
        }
    }

    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        let bucket = bucket.into();
        self.bucket = (!bucket.is_empty()).then_some(bucket);
        self
    }

    pub fn with_shards(mut self, shards: u32) -> Self {
        self.shards = shards.max(1);
        self
    }

    pub fn namespaces_accounted(&self) -> u64 {
        self.namespaces_successful + self.namespaces_failed
    }

    /// Every discovered namespace reported and iteration has finished.
    pub fn is_done(&self) -> bool {
        !self.iterating && self.namespaces_accounted() == self.namespaces_total
    }

    pub fn is_completed(&self) -> bool {
        self.timing.is_completed()
    }

    /// Raise the discovered total. Totals never move backwards.
    pub fn raise_namespaces_total(&mut self, total: u64) {
        self.namespaces_total = self.namespaces_total.max(total);
    }

    /// End iteration early. The job completes once the namespaces already
    /// discovered are accounted.
    pub fn abandon_iteration(&mut self) {
        self.iterating = false;
        self.iteration_abandoned = true;
    }

    /// Fold a finished namespace into the job's counters and timing.
    ///
    /// A namespace with any failed shard (or an abandoned step) counts as a
    /// failed namespace.
    pub fn record_namespace(&mut self, namespace: &NamespaceState) -> DomainResult<()> {
        if self.namespaces_accounted() >= self.namespaces_total {
            return Err(DomainError::invariant(format!(
                "job {}: namespace {} reported but {} of {} already accounted",
                self.id,
                namespace.id,
                self.namespaces_accounted(),
                self.namespaces_total
            )));
        }
        if namespace.has_failures() {
            self.namespaces_failed += 1;
        } else {
            self.namespaces_successful += 1;
        }
        self.timing.rollup(&namespace.timing);
        Ok(())
    }

    /// Terminal transition: completion timestamp and lock released.
    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.timing.complete(now);
        self.lock.complete();
    }

    pub fn check_invariants(&self) -> DomainResult<()> {
        if self.namespaces_accounted() > self.namespaces_total {
            return Err(DomainError::invariant(format!(
                "job {}: {} successful + {} failed > {} total",
                self.id, self.namespaces_successful, self.namespaces_failed, self.namespaces_total
            )));
        }
        if self.is_completed() && !self.is_done() {
            return Err(DomainError::invariant(format!(
                "job {}: completed before every namespace was accounted",
                self.id
            )));
        }
        Ok(())
    }
}

impl Entity for JobState {
    const KIND: &'static str = "job";

    fn key_name(&self) -> String {
        self.id.to_string()
    }
}

impl Lockable for JobState {
    fn lock(&self) -> &LockState {
        &self.lock
    }

    fn lock_mut(&mut self) -> &mut LockState {
        &mut self.lock
    }
}
