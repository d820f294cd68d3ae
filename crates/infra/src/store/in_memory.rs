use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Mutex, RwLock};

use serde_json::Value as JsonValue;

use super::r#trait::{CommitBatch, EntityKey, EntityStore, OutboxEntry, StoreError, VersionedEntity};

type CommitPredicate = Box<dyn Fn(&CommitBatch) -> bool + Send>;
type CommitAction = Box<dyn FnOnce() -> Result<(), StoreError> + Send>;

struct CommitHook {
    predicate: CommitPredicate,
    action: CommitAction,
}

#[derive(Debug, Default)]
struct StoreState {
    entities: HashMap<EntityKey, VersionedEntity>,
    outbox: BTreeMap<u64, crate::queue::Task>,
    next_outbox_id: u64,
}

/// In-memory versioned entity store with a transactional outbox.
///
/// Intended for tests/dev. Commit hooks let a test run arbitrary code (other
/// transactions included) right before a matching commit is validated, which is
/// how interleavings between concurrent handlers are reproduced
/// deterministically.
#[derive(Default)]
pub struct InMemoryEntityStore {
    state: RwLock<StoreState>,
    hooks: Mutex<Vec<CommitHook>>,
}

impl fmt::Debug for InMemoryEntityStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryEntityStore")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `action` once, before the first commit accepted by `predicate`.
    ///
    /// The hook is removed before it runs, so commits made by the action itself
    /// do not re-trigger it. An error from the action fails that commit.
    pub fn on_commit<P, A>(&self, predicate: P, action: A)
    where
        P: Fn(&CommitBatch) -> bool + Send + 'static,
        A: FnOnce() -> Result<(), StoreError> + Send + 'static,
    {
        if let Ok(mut hooks) = self.hooks.lock() {
            hooks.push(CommitHook {
                predicate: Box::new(predicate),
                action: Box::new(action),
            });
        }
    }

    /// Number of stored entities of `kind`.
    pub fn count_kind(&self, kind: &str) -> usize {
        self.state
            .read()
            .map(|s| s.entities.keys().filter(|k| k.kind == kind).count())
            .unwrap_or(0)
    }

    pub fn version_of(&self, key: &EntityKey) -> u64 {
        self.state
            .read()
            .ok()
            .and_then(|s| s.entities.get(key).map(|e| e.version))
            .unwrap_or(0)
    }

    fn take_hook(&self, batch: &CommitBatch) -> Option<CommitAction> {
        let mut hooks = self.hooks.lock().ok()?;
        let idx = hooks.iter().position(|h| (h.predicate)(batch))?;
        Some(hooks.remove(idx).action)
    }
}

impl EntityStore for InMemoryEntityStore {
    fn get(&self, key: &EntityKey) -> Result<Option<VersionedEntity>, StoreError> {
        let state = self
            .state
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?;
        Ok(state.entities.get(key).cloned())
    }

    fn commit(&self, batch: CommitBatch) -> Result<(), StoreError> {
        if let Some(action) = self.take_hook(&batch) {
            action()?;
        }

        let mut state = self
            .state
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?;

        for (key, expected) in &batch.expectations {
            let current = state.entities.get(key).map_or(0, |e| e.version);
            if !expected.matches(current) {
                return Err(StoreError::Conflict(format!(
                    "{key}: expected {expected:?}, found {current}"
                )));
            }
        }

        for (key, body) in batch.writes {
            let entry = state.entities.entry(key).or_insert(VersionedEntity {
                version: 0,
                body: JsonValue::Null,
            });
            entry.version += 1;
            entry.body = body;
        }

        for task in batch.tasks {
            state.next_outbox_id += 1;
            let id = state.next_outbox_id;
            state.outbox.insert(id, task);
        }

        Ok(())
    }

    fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        let state = self
            .state
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?;
        Ok(state
            .outbox
            .iter()
            .take(limit)
            .map(|(id, task)| OutboxEntry {
                id: *id,
                task: task.clone(),
            })
            .collect())
    }

    fn ack_outbox(&self, ids: &[u64]) -> Result<(), StoreError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?;
        for id in ids {
            state.outbox.remove(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Task;
    use serde_json::json;
    use shardmap_core::ExpectedVersion;

    fn key(name: &str) -> EntityKey {
        EntityKey::new("thing", name)
    }

    #[test]
    fn writes_bump_versions() {
        let store = InMemoryEntityStore::new();
        store.put(&key("a"), json!({"n": 1})).unwrap();
        store.put(&key("a"), json!({"n": 2})).unwrap();

        let got = store.get(&key("a")).unwrap().unwrap();
        assert_eq!(got.version, 2);
        assert_eq!(got.body, json!({"n": 2}));
        assert!(store.get(&key("missing")).unwrap().is_none());
    }

    #[test]
    fn stale_expectation_rejects_whole_batch() {
        let store = InMemoryEntityStore::new();
        store.put(&key("a"), json!(1)).unwrap();

        let err = store
            .commit(CommitBatch {
                expectations: vec![(key("a"), ExpectedVersion::absent())],
                writes: vec![(key("b"), json!(2))],
                tasks: vec![Task::new("/x", "q")],
            })
            .unwrap_err();

        assert!(err.is_conflict());
        assert!(store.get(&key("b")).unwrap().is_none());
        assert!(store.pending_outbox(10).unwrap().is_empty());
    }

    #[test]
    fn outbox_entries_are_acked_individually() {
        let store = InMemoryEntityStore::new();
        store
            .commit(CommitBatch {
                tasks: vec![Task::new("/a", "q"), Task::new("/b", "q")],
                ..Default::default()
            })
            .unwrap();

        let pending = store.pending_outbox(10).unwrap();
        assert_eq!(pending.len(), 2);
        store.ack_outbox(&[pending[0].id]).unwrap();
        assert_eq!(store.pending_outbox(10).unwrap()[0].task.path, "/b");
    }

    #[test]
    fn hook_runs_once_before_matching_commit() {
        let store = std::sync::Arc::new(InMemoryEntityStore::new());
        let inner = store.clone();
        store.on_commit(
            |batch| batch.writes_key(&EntityKey::new("thing", "a")),
            move || inner.put(&EntityKey::new("thing", "a"), json!("from hook")),
        );

        // the hook's own write bumps the version, so the expectation fails
        let err = store
            .commit(CommitBatch {
                expectations: vec![(key("a"), ExpectedVersion::absent())],
                writes: vec![(key("a"), json!("mine"))],
                tasks: vec![],
            })
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.get(&key("a")).unwrap().unwrap().body, json!("from hook"));
    }
}
