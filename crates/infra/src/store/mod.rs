//! Entity storage boundary.
//!
//! [`EntityStore`] is the untyped, versioned backend; [`Datastore`] layers typed
//! entity access, the configured kind prefix and optimistic transactions on
//! top. Tasks added inside a transaction are committed to the store's outbox
//! together with the entity writes and handed to the queue after the commit,
//! so "write state and schedule the next step" is all-or-nothing.

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod r#trait;
mod transaction;

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use shardmap_core::Entity;

use crate::queue::TaskQueue;

pub use in_memory::InMemoryEntityStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresEntityStore;
pub use r#trait::{CommitBatch, EntityKey, EntityStore, OutboxEntry, StoreError, VersionedEntity};
pub use transaction::Transaction;

const OUTBOX_BATCH: usize = 128;

/// Typed entity access plus transactions, bound to a store and a task queue.
#[derive(Clone)]
pub struct Datastore {
    store: Arc<dyn EntityStore>,
    queue: Arc<dyn TaskQueue>,
    prefix: String,
}

impl Datastore {
    pub fn new(
        store: Arc<dyn EntityStore>,
        queue: Arc<dyn TaskQueue>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            queue,
            prefix: prefix.into(),
        }
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }

    pub fn kind<E: Entity>(&self) -> String {
        format!("{}{}", self.prefix, E::KIND)
    }

    pub fn key<E: Entity>(&self, name: &str) -> EntityKey {
        EntityKey::new(self.kind::<E>(), name)
    }

    pub fn key_of<E: Entity>(&self, entity: &E) -> EntityKey {
        self.key::<E>(&entity.key_name())
    }

    pub fn get<E: Entity>(&self, name: &str) -> Result<Option<E>, StoreError> {
        let key = self.key::<E>(name);
        self.store
            .get(&key)?
            .map(|stored| decode(&key, stored.body))
            .transpose()
    }

    pub fn get_multi<E: Entity>(&self, names: &[String]) -> Result<Vec<Option<E>>, StoreError> {
        let keys: Vec<EntityKey> = names.iter().map(|n| self.key::<E>(n)).collect();
        let stored = self.store.get_multi(&keys)?;
        keys.iter()
            .zip(stored)
            .map(|(key, s)| s.map(|s| decode(key, s.body)).transpose())
            .collect()
    }

    /// Blind write outside any transaction.
    pub fn put<E: Entity>(&self, entity: &E) -> Result<(), StoreError> {
        let key = self.key_of(entity);
        let body = encode(&key, entity)?;
        self.store.put(&key, body)
    }

    /// Run `f` in an optimistic transaction, retrying on conflict.
    ///
    /// An error returned by `f` aborts the attempt with no writes and is
    /// returned as is. When every attempt conflicts the result is
    /// [`StoreError::TooManyAttempts`].
    pub fn run_in_transaction<T, E, F>(&self, attempts: u32, mut f: F) -> Result<T, E>
    where
        F: FnMut(&mut Transaction<'_>) -> Result<T, E>,
        E: From<StoreError>,
    {
        let attempts = attempts.max(1);
        let mut last = String::new();

        for attempt in 1..=attempts {
            let mut tx = Transaction::new(self);
            let value = f(&mut tx)?;
            let batch = tx.into_batch();
            let has_tasks = !batch.tasks.is_empty();

            match self.store.commit(batch) {
                Ok(()) => {
                    if has_tasks {
                        self.relay_outbox_logged();
                    }
                    return Ok(value);
                }
                Err(StoreError::Conflict(message)) => {
                    debug!(attempt, attempts, conflict = %message, "transaction conflict, retrying");
                    last = message;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(StoreError::TooManyAttempts { attempts, last }.into())
    }

    /// Hand committed outbox tasks to the queue. Returns how many were relayed.
    ///
    /// An entry is acknowledged only after the queue accepted it, so a failed
    /// relay leaves it for the next call (possibly delivering it twice).
    pub fn relay_outbox(&self) -> Result<usize, StoreError> {
        let mut relayed = 0;
        loop {
            let pending = self.store.pending_outbox(OUTBOX_BATCH)?;
            if pending.is_empty() {
                return Ok(relayed);
            }

            let mut acked = Vec::with_capacity(pending.len());
            let mut failure = None;
            for entry in pending {
                match self.queue.add(entry.task) {
                    Ok(()) => acked.push(entry.id),
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }

            relayed += acked.len();
            self.store.ack_outbox(&acked)?;
            if let Some(e) = failure {
                return Err(StoreError::Backend(format!("outbox relay: {e}")));
            }
        }
    }

    fn relay_outbox_logged(&self) {
        if let Err(e) = self.relay_outbox() {
            warn!(error = %e, "outbox relay failed; tasks stay pending");
        }
    }
}

pub(crate) fn decode<E: Entity>(key: &EntityKey, body: JsonValue) -> Result<E, StoreError> {
    serde_json::from_value(body).map_err(|e| StoreError::Decode {
        key: key.to_string(),
        message: e.to_string(),
    })
}

pub(crate) fn encode<E: Entity>(key: &EntityKey, entity: &E) -> Result<JsonValue, StoreError> {
    serde_json::to_value(entity).map_err(|e| StoreError::Encode {
        key: key.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{InMemoryTaskQueue, Task};
    use chrono::Utc;
    use shardmap_core::{IteratorState, JobId};

    fn datastore() -> (Datastore, Arc<InMemoryEntityStore>, Arc<InMemoryTaskQueue>) {
        let store = Arc::new(InMemoryEntityStore::new());
        let queue = Arc::new(InMemoryTaskQueue::new());
        (Datastore::new(store.clone(), queue.clone(), "test_"), store, queue)
    }

    fn iterator(id: &str) -> IteratorState {
        IteratorState::new(JobId::new(id).unwrap(), Utc::now())
    }

    #[test]
    fn keys_carry_the_prefix() {
        let (ds, store, _) = datastore();
        ds.put(&iterator("j1")).unwrap();
        assert_eq!(store.count_kind("test_iterator"), 1);
        assert!(ds.get::<IteratorState>("j1").unwrap().is_some());
    }

    #[test]
    fn committed_tasks_reach_the_queue() {
        let (ds, store, queue) = datastore();
        ds.run_in_transaction(3, |tx| -> Result<(), StoreError> {
            tx.put(&iterator("j1"))?;
            tx.add_task(Task::new("/next", "q"));
            Ok(())
        })
        .unwrap();

        assert_eq!(queue.added_for("/next"), 1);
        assert!(store.pending_outbox(10).unwrap().is_empty());
    }

    #[test]
    fn aborted_transaction_writes_nothing() {
        let (ds, _, queue) = datastore();
        let result: Result<(), StoreError> = ds.run_in_transaction(3, |tx| {
            tx.put(&iterator("j1"))?;
            tx.add_task(Task::new("/next", "q"));
            Err(StoreError::Backend("no".into()))
        });

        assert!(result.is_err());
        assert!(ds.get::<IteratorState>("j1").unwrap().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn conflicts_are_retried_against_fresh_state() {
        let (ds, store, _) = datastore();
        ds.put(&iterator("j1")).unwrap();

        let key = ds.key::<IteratorState>("j1");
        let racer = ds.clone();
        store.on_commit(
            move |batch| batch.writes_key(&key),
            move || {
                let mut it = racer.get::<IteratorState>("j1")?.unwrap_or_else(|| iterator("j1"));
                it.count += 10;
                racer.put(&it)
            },
        );

        let mut runs = 0;
        ds.run_in_transaction(3, |tx| -> Result<(), StoreError> {
            runs += 1;
            let mut it: IteratorState = tx.get("j1")?.unwrap();
            it.count += 1;
            tx.put(&it)
        })
        .unwrap();

        assert_eq!(runs, 2);
        assert_eq!(ds.get::<IteratorState>("j1").unwrap().unwrap().count, 11);
    }

    #[test]
    fn persistent_conflicts_give_up() {
        let (ds, store, _) = datastore();
        ds.put(&iterator("j1")).unwrap();
        for _ in 0..2 {
            let key = ds.key::<IteratorState>("j1");
            let racer = ds.clone();
            // blind writes carry no expectations, so the racers never trigger each other
            store.on_commit(
                move |batch| batch.writes_key(&key) && !batch.expectations.is_empty(),
                move || racer.put(&iterator("j1")),
            );
        }

        let result: Result<(), StoreError> = ds.run_in_transaction(2, |tx| {
            let it: IteratorState = tx.get("j1")?.unwrap();
            tx.put(&it)
        });
        assert!(matches!(result, Err(StoreError::TooManyAttempts { attempts: 2, .. })));
    }

    #[test]
    fn failed_relay_keeps_tasks_in_the_outbox() {
        let (ds, store, queue) = datastore();
        queue.fail_next_adds(1);
        ds.run_in_transaction(1, |tx| -> Result<(), StoreError> {
            tx.add_task(Task::new("/a", "q"));
            Ok(())
        })
        .unwrap();

        assert_eq!(store.pending_outbox(10).unwrap().len(), 1);
        assert_eq!(ds.relay_outbox().unwrap(), 1);
        assert_eq!(queue.added_for("/a"), 1);
    }
}
