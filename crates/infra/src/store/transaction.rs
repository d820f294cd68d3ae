use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

use shardmap_core::{Entity, ExpectedVersion};

use super::r#trait::{CommitBatch, EntityKey, StoreError};
use super::Datastore;
use crate::queue::Task;

/// Optimistic transaction over typed entities.
///
/// Reads record the version they observed; writes and tasks are buffered until
/// commit. Reads see the transaction's own buffered writes.
pub struct Transaction<'a> {
    datastore: &'a Datastore,
    reads: BTreeMap<EntityKey, u64>,
    writes: BTreeMap<EntityKey, JsonValue>,
    tasks: Vec<Task>,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(datastore: &'a Datastore) -> Self {
        Self {
            datastore,
            reads: BTreeMap::new(),
            writes: BTreeMap::new(),
            tasks: Vec::new(),
        }
    }

    pub fn get<E: Entity>(&mut self, name: &str) -> Result<Option<E>, StoreError> {
        let key = self.datastore.key::<E>(name);
        if let Some(body) = self.writes.get(&key) {
            return super::decode(&key, body.clone()).map(Some);
        }

        let stored = self.datastore.store().get(&key)?;
        let version = stored.as_ref().map_or(0, |s| s.version);
        self.reads.entry(key.clone()).or_insert(version);
        stored.map(|s| super::decode(&key, s.body)).transpose()
    }

    pub fn get_multi<E: Entity>(&mut self, names: &[String]) -> Result<Vec<Option<E>>, StoreError> {
        names.iter().map(|name| self.get::<E>(name)).collect()
    }

    pub fn put<E: Entity>(&mut self, entity: &E) -> Result<(), StoreError> {
        let key = self.datastore.key_of(entity);
        let body = super::encode(&key, entity)?;
        self.writes.insert(key, body);
        Ok(())
    }

    /// Enqueue `task` only if this transaction commits.
    pub fn add_task(&mut self, task: Task) {
        self.tasks.push(task);
    }

    pub(crate) fn into_batch(self) -> CommitBatch {
        CommitBatch {
            expectations: self
                .reads
                .into_iter()
                .map(|(key, version)| (key, ExpectedVersion::Exact(version)))
                .collect(),
            writes: self.writes.into_iter().collect(),
            tasks: self.tasks,
        }
    }
}
