//! Namespace state: one partition of a job, fanned out into shards.
//!
//! `shards_total` is `None` until the split step lands. Shards may report
//! before that, so the counters can be non-zero while the total is unknown; the
//! namespace is only done once the total is known and fully accounted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{Entity, Lockable};
use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, NamespaceId};
use crate::lock::LockState;
use crate::shard::{ShardOutcome, ShardState};
use crate::timing::Timing;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceState {
    pub id: NamespaceId,
    pub shards_total: Option<u32>,
    pub shards_successful: u32,
    pub shards_failed: u32,
    /// Gave up on a namespace-level step; counted as a failed namespace.
    #[serde(default)]
    pub abandoned: bool,
    pub timing: Timing,
    /// `lock.request_id` is the in-flight request marker.
    pub lock: LockState,
}

impl NamespaceState {
    pub fn new(id: NamespaceId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            shards_total: None,
            shards_successful: 0,
            shards_failed: 0,
            abandoned: false,
            timing: Timing::new(now),
            lock: LockState::default(),
        }
    }

    pub fn job_id(&self) -> &JobId {
        self.id.job_id()
    }

    pub fn shards_accounted(&self) -> u32 {
        self.shards_successful + self.shards_failed
    }

    pub fn is_done(&self) -> bool {
        self.shards_total == Some(self.shards_accounted())
    }

    pub fn has_failures(&self) -> bool {
        self.abandoned || self.shards_failed > 0
    }

    /// Record the split result without touching counters shards may already
    /// have advanced. Returns true if this write made the namespace done.
    pub fn set_shards_total(&mut self, total: u32) -> DomainResult<bool> {
        if self.shards_accounted() > total {
            return Err(DomainError::invariant(format!(
                "namespace {}: {} shards already reported but split produced {total}",
                self.id,
                self.shards_accounted()
            )));
        }
        let was_done = self.is_done();
        self.shards_total = Some(total);
        Ok(!was_done && self.is_done())
    }

    /// Count one shard's terminal signal. Returns true if this signal made the
    /// namespace done.
    pub fn record_shard(&mut self, outcome: &ShardOutcome, timing: &Timing) -> DomainResult<bool> {
        if let Some(total) = self.shards_total {
            if self.shards_accounted() >= total {
                return Err(DomainError::invariant(format!(
                    "namespace {}: shard reported after all {total} were accounted",
                    self.id
                )));
            }
        }
        let was_done = self.is_done();
        match outcome {
            ShardOutcome::Succeeded => self.shards_successful += 1,
            ShardOutcome::Failed { .. } => self.shards_failed += 1,
        }
        self.timing.rollup(timing);
        Ok(!was_done && self.is_done())
    }

    /// Rebuild counters and timing from the shard entities themselves.
    ///
    /// Only shards with a recorded outcome and an index inside the known total
    /// contribute; the lifecycle timestamps of the namespace are preserved.
    pub fn recompute_from(&mut self, shards: &[ShardState]) {
        let mut timing = Timing::new(self.timing.created_at);
        timing.started_at = self.timing.started_at;
        timing.completed_at = self.timing.completed_at;

        let mut successful = 0;
        let mut failed = 0;
        for shard in shards {
            if let Some(total) = self.shards_total {
                if shard.id.index() >= total {
                    continue;
                }
            }
            match &shard.outcome {
                Some(ShardOutcome::Succeeded) => successful += 1,
                Some(ShardOutcome::Failed { .. }) => failed += 1,
                None => continue,
            }
            timing.rollup(&shard.timing);
        }

        self.shards_successful = successful;
        self.shards_failed = failed;
        self.timing = timing;
    }

    /// Copy the finalized counters and timing (never the lock) from `other`.
    pub fn copy_from(&mut self, other: &NamespaceState) {
        self.shards_total = other.shards_total;
        self.shards_successful = other.shards_successful;
        self.shards_failed = other.shards_failed;
        self.abandoned = other.abandoned;
        self.timing = other.timing.clone();
    }

    pub fn check_invariants(&self) -> DomainResult<()> {
        if let Some(total) = self.shards_total {
            if self.shards_accounted() > total {
                return Err(DomainError::invariant(format!(
                    "namespace {}: {} successful + {} failed > {total} total",
                    self.id, self.shards_successful, self.shards_failed
                )));
            }
        }
        Ok(())
    }
}

impl Entity for NamespaceState {
    const KIND: &'static str = "namespace";

    fn key_name(&self) -> String {
        self.id.to_string()
    }
}

impl Lockable for NamespaceState {
    fn lock(&self) -> &LockState {
        &self.lock
    }

    fn lock_mut(&mut self) -> &mut LockState {
        &mut self.lock
    }
}
