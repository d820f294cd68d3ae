//! Shards: the smallest schedulable unit of a namespace.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{Entity, Lockable};
use crate::id::ShardId;
use crate::lock::LockState;
use crate::timing::Timing;

/// Terminal signal produced exactly once per shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ShardOutcome {
    Succeeded,
    Failed { reason: String },
}

impl ShardOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ShardOutcome::Succeeded)
    }
}

/// One partition produced by a splitting strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSpec {
    pub index: u32,
    pub total: u32,
}

/// Work reported by a shard processor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardReport {
    pub count: u64,
    #[serde(default)]
    pub counters: BTreeMap<String, i64>,
}

impl ShardReport {
    pub fn counted(count: u64) -> Self {
        Self {
            count,
            counters: BTreeMap::new(),
        }
    }

    pub fn with_counter(mut self, name: impl Into<String>, value: i64) -> Self {
        *self.counters.entry(name.into()).or_insert(0) += value;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardState {
    pub id: ShardId,
    /// Number of shards the namespace was split into when this one was made.
    pub total: u32,
    pub outcome: Option<ShardOutcome>,
    pub timing: Timing,
    pub lock: LockState,
}

impl ShardState {
    pub fn new(id: ShardId, total: u32, now: DateTime<Utc>) -> Self {
        Self {
            id,
            total,
            outcome: None,
            timing: Timing::new(now),
            lock: LockState::default(),
        }
    }

    pub fn spec(&self) -> ShardSpec {
        ShardSpec {
            index: self.id.index(),
            total: self.total,
        }
    }

    pub fn is_reported(&self) -> bool {
        self.outcome.is_some()
    }
}

impl Entity for ShardState {
    const KIND: &'static str = "shard";

    fn key_name(&self) -> String {
        self.id.to_string()
    }
}

impl Lockable for ShardState {
    fn lock(&self) -> &LockState {
        &self.lock
    }

    fn lock_mut(&mut self) -> &mut LockState {
        &mut self.lock
    }
}
