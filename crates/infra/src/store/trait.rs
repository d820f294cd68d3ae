use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use shardmap_core::ExpectedVersion;

use crate::queue::Task;

/// Storage key of one entity: `kind` already carries the configured prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: String,
    pub name: String,
}

impl EntityKey {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// Stored JSON body with its optimistic-concurrency version.
///
/// Versions start at 1 on first write; an absent entity has version 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedEntity {
    pub version: u64,
    pub body: JsonValue,
}

/// Everything a transaction wants to commit atomically.
///
/// `expectations` are the versions observed by the transaction's reads; the
/// commit fails with [`StoreError::Conflict`] if any of them moved. `tasks` are
/// written to the outbox in the same commit and relayed to the queue afterwards.
#[derive(Debug, Clone, Default)]
pub struct CommitBatch {
    pub expectations: Vec<(EntityKey, ExpectedVersion)>,
    pub writes: Vec<(EntityKey, JsonValue)>,
    pub tasks: Vec<Task>,
}

impl CommitBatch {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.tasks.is_empty()
    }

    pub fn writes_key(&self, key: &EntityKey) -> bool {
        self.writes.iter().any(|(k, _)| k == key)
    }

    pub fn written(&self, key: &EntityKey) -> Option<&JsonValue> {
        self.writes.iter().find(|(k, _)| k == key).map(|(_, body)| body)
    }
}

/// A task committed with a transaction but not yet handed to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    pub id: u64,
    pub task: Task,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Conflict(String),

    #[error("transaction gave up after {attempts} attempts: {last}")]
    TooManyAttempts { attempts: u32, last: String },

    #[error("entity {key} could not be decoded: {message}")]
    Decode { key: String, message: String },

    #[error("entity {key} could not be encoded: {message}")]
    Encode { key: String, message: String },

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// Versioned key/value entity storage with atomic multi-entity commits.
///
/// Implementations must:
/// - assign a new version on every write of a key
/// - apply a [`CommitBatch`] atomically (all writes and outbox tasks, or none)
/// - reject a batch whose expectations do not match current versions
pub trait EntityStore: Send + Sync {
    fn get(&self, key: &EntityKey) -> Result<Option<VersionedEntity>, StoreError>;

    fn get_multi(&self, keys: &[EntityKey]) -> Result<Vec<Option<VersionedEntity>>, StoreError> {
        keys.iter().map(|key| self.get(key)).collect()
    }

    /// Blind write of a single entity.
    fn put(&self, key: &EntityKey, body: JsonValue) -> Result<(), StoreError> {
        self.put_multi(vec![(key.clone(), body)])
    }

    /// Blind, atomic write of several entities.
    fn put_multi(&self, entries: Vec<(EntityKey, JsonValue)>) -> Result<(), StoreError> {
        self.commit(CommitBatch {
            writes: entries,
            ..Default::default()
        })
    }

    fn commit(&self, batch: CommitBatch) -> Result<(), StoreError>;

    /// Oldest outbox entries not yet acknowledged.
    fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError>;

    fn ack_outbox(&self, ids: &[u64]) -> Result<(), StoreError>;
}

impl<S> EntityStore for Arc<S>
where
    S: EntityStore + ?Sized,
{
    fn get(&self, key: &EntityKey) -> Result<Option<VersionedEntity>, StoreError> {
        (**self).get(key)
    }

    fn get_multi(&self, keys: &[EntityKey]) -> Result<Vec<Option<VersionedEntity>>, StoreError> {
        (**self).get_multi(keys)
    }

    fn put(&self, key: &EntityKey, body: JsonValue) -> Result<(), StoreError> {
        (**self).put(key, body)
    }

    fn put_multi(&self, entries: Vec<(EntityKey, JsonValue)>) -> Result<(), StoreError> {
        (**self).put_multi(entries)
    }

    fn commit(&self, batch: CommitBatch) -> Result<(), StoreError> {
        (**self).commit(batch)
    }

    fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        (**self).pending_outbox(limit)
    }

    fn ack_outbox(&self, ids: &[u64]) -> Result<(), StoreError> {
        (**self).ack_outbox(ids)
    }
}
