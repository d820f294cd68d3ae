//! Sequence-numbered entity locks over an at-least-once task substrate.
//!
//! Every lock-protected entity embeds a [`LockState`]. Scheduling a step
//! enqueues a task carrying the entity's key and `sequence + 1`; the delivery
//! acquires the lock for exactly that sequence, runs the step, and releases the
//! lock. Duplicate and out-of-order deliveries are answered from the sequence
//! alone (see [`LockError`]), which makes every step idempotent.

mod error;

use chrono::Utc;
use tracing::{debug, warn};

use shardmap_core::{LockDecision, LockState, Lockable, RequestId};

use crate::config::MapperConfig;
use crate::queue::{HEADER_LOCK_ID, HEADER_LOCK_SEQ, HEADER_QUEUE_NAME, HEADER_TASK_ATTEMPT, Task};
use crate::store::{Datastore, StoreError, Transaction};

pub use error::LockError;

/// Lock identity and metadata carried by one task delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: String,
    pub seq: u64,
    pub queue: String,
    pub attempt: u32,
}

impl Delivery {
    pub fn new(id: impl Into<String>, seq: u64, queue: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            seq,
            queue: queue.into(),
            attempt: 0,
        }
    }
}

#[derive(Clone)]
pub struct LockProtocol {
    datastore: Datastore,
    attempts: u32,
    lease: chrono::Duration,
    max_attempts: u32,
}

impl LockProtocol {
    pub fn new(datastore: Datastore, config: &MapperConfig) -> Self {
        Self {
            datastore,
            attempts: config.transaction_attempts,
            lease: config.lease(),
            max_attempts: config.max_lock_retries,
        }
    }

    /// Task for the next step of `entity`.
    pub fn task_for<E: Lockable>(entity: &E, path: &str, queue: &str) -> Task {
        Task::locked(path, queue, entity.key_name(), entity.lock().next_sequence())
    }

    /// Persist `entity` and enqueue its next step within `tx`.
    pub fn schedule<E: Lockable>(
        tx: &mut Transaction<'_>,
        entity: &E,
        path: &str,
        queue: &str,
    ) -> Result<u64, StoreError> {
        let task = Self::task_for(entity, path, queue);
        let seq = entity.lock().next_sequence();
        tx.put(entity)?;
        tx.add_task(task);
        Ok(seq)
    }

    /// Create `entity` and schedule its first step, unless it already exists.
    ///
    /// Returns false (and writes nothing) when the entity was already there.
    pub fn schedule_if_absent<E: Lockable>(
        &self,
        entity: &E,
        path: &str,
        queue: &str,
    ) -> Result<bool, StoreError> {
        let name = entity.key_name();
        self.datastore.run_in_transaction(self.attempts, |tx| {
            if tx.get::<E>(&name)?.is_some() {
                return Ok(false);
            }
            Self::schedule(tx, entity, path, queue)?;
            Ok(true)
        })
    }

    /// Acquire step `seq` of the entity named `id` for `request_id`.
    pub fn get_lock<E: Lockable>(
        &self,
        id: &str,
        seq: u64,
        request_id: RequestId,
    ) -> Result<E, LockError> {
        let now = Utc::now();
        let key = self.datastore.key::<E>(id).to_string();

        let (entity, decision) = self.datastore.run_in_transaction(self.attempts, |tx| {
            let mut entity: E = tx
                .get(id)?
                .ok_or_else(|| LockError::NotFound { key: key.clone() })?;
            let decision = entity
                .lock()
                .evaluate(seq, now, self.lease, self.max_attempts);
            match decision {
                LockDecision::Acquire => {
                    entity.lock_mut().acquire(seq, request_id, now);
                    tx.put(&entity)?;
                }
                LockDecision::TakeOver => {
                    entity.lock_mut().take_over(request_id, now);
                    tx.put(&entity)?;
                }
                _ => {}
            }
            Ok::<_, LockError>((entity, decision))
        })?;

        let (current, attempts) = (entity.lock().sequence, entity.lock().attempts);
        match decision {
            LockDecision::Acquire => {
                debug!(%key, seq, %request_id, "lock acquired");
                Ok(entity)
            }
            LockDecision::TakeOver => {
                warn!(%key, seq, %request_id, attempts, "lock lease expired, taking over");
                Ok(entity)
            }
            LockDecision::AlreadyComplete => Err(LockError::AlreadyComplete { key, seq }),
            LockDecision::Stale => Err(LockError::Stale { key, seq, current }),
            LockDecision::InProgress => Err(LockError::InProgress { key, seq }),
            LockDecision::NotReady => Err(LockError::NotReady { key, seq, current }),
            LockDecision::Abandon => Err(LockError::Abandoned { key, seq, attempts }),
        }
    }

    /// Release the lock if `request_id` still holds it.
    ///
    /// `success = false` rolls the sequence back so a redelivery of the same
    /// step can acquire again. Returns whether anything was released.
    pub fn clear_lock<E: Lockable>(
        &self,
        id: &str,
        request_id: RequestId,
        success: bool,
    ) -> Result<bool, LockError> {
        let released = self.datastore.run_in_transaction(self.attempts, |tx| {
            let Some(mut entity) = tx.get::<E>(id)? else {
                return Ok::<_, LockError>(false);
            };
            if !entity.lock().is_held_by(request_id) {
                return Ok(false);
            }
            entity.lock_mut().release(success);
            tx.put(&entity)?;
            Ok(true)
        })?;
        if released {
            debug!(id, %request_id, success, "lock cleared");
        }
        Ok(released)
    }

    /// Mark step `seq` of the entity named `id` as given up.
    pub fn abandon<E: Lockable>(&self, id: &str, seq: u64) -> Result<(), LockError> {
        self.datastore.run_in_transaction(self.attempts, |tx| {
            if let Some(mut entity) = tx.get::<E>(id)? {
                entity.lock_mut().abandon(seq);
                tx.put(&entity)?;
            }
            Ok::<_, LockError>(())
        })
    }

    /// Fail unless `request_id` is still the holder of `lock`.
    pub fn ensure_held(lock: &LockState, key: &str, request_id: RequestId) -> Result<(), LockError> {
        if lock.is_held_by(request_id) {
            Ok(())
        } else {
            Err(LockError::LostLock {
                key: key.to_string(),
            })
        }
    }

    /// Extract the lock identity from delivery headers.
    pub fn parse_lock(lookup: impl Fn(&str) -> Option<String>) -> Result<Delivery, LockError> {
        let id = lookup(HEADER_LOCK_ID)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| LockError::Malformed(format!("missing {HEADER_LOCK_ID}")))?;
        let raw_seq = lookup(HEADER_LOCK_SEQ)
            .ok_or_else(|| LockError::Malformed(format!("missing {HEADER_LOCK_SEQ}")))?;
        let seq = raw_seq
            .trim()
            .parse::<u64>()
            .map_err(|e| LockError::Malformed(format!("{HEADER_LOCK_SEQ} '{raw_seq}': {e}")))?;

        Ok(Delivery {
            id,
            seq,
            queue: lookup(HEADER_QUEUE_NAME).unwrap_or_default(),
            attempt: lookup(HEADER_TASK_ATTEMPT)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::queue::InMemoryTaskQueue;
    use crate::store::InMemoryEntityStore;
    use shardmap_core::{IteratorState, JobId};

    fn protocol(config: &MapperConfig) -> (LockProtocol, Datastore, Arc<InMemoryTaskQueue>) {
        let queue = Arc::new(InMemoryTaskQueue::new());
        let ds = Datastore::new(Arc::new(InMemoryEntityStore::new()), queue.clone(), "");
        (LockProtocol::new(ds.clone(), config), ds, queue)
    }

    fn entity() -> IteratorState {
        IteratorState::new(JobId::new("j1").unwrap(), Utc::now())
    }

    #[test]
    fn schedule_if_absent_is_idempotent() {
        let (locks, _, queue) = protocol(&MapperConfig::default());
        assert!(locks.schedule_if_absent(&entity(), "/it", "q").unwrap());
        assert!(!locks.schedule_if_absent(&entity(), "/it", "q").unwrap());

        let tasks = queue.history();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].header(HEADER_LOCK_SEQ).as_deref(), Some("1"));
        assert_eq!(tasks[0].header(HEADER_LOCK_ID).as_deref(), Some("j1"));
    }

    #[test]
    fn acquire_then_duplicate_is_in_progress_then_complete() {
        let (locks, ds, _) = protocol(&MapperConfig::default());
        locks.schedule_if_absent(&entity(), "/it", "q").unwrap();

        let first = RequestId::new();
        let held: IteratorState = locks.get_lock("j1", 1, first).unwrap();
        assert!(held.lock.is_held_by(first));

        let dup = locks.get_lock::<IteratorState>("j1", 1, RequestId::new()).unwrap_err();
        assert!(matches!(dup, LockError::InProgress { .. }));
        assert_eq!(dup.response_code(), 503);

        assert!(locks.clear_lock::<IteratorState>("j1", first, true).unwrap());
        let dup = locks.get_lock::<IteratorState>("j1", 1, RequestId::new()).unwrap_err();
        assert!(matches!(dup, LockError::AlreadyComplete { .. }));
        assert_eq!(dup.response_code(), 200);

        let stored: IteratorState = ds.get("j1").unwrap().unwrap();
        assert_eq!(stored.lock.sequence, 1);
        assert!(!stored.lock.is_held());
    }

    #[test]
    fn failed_step_is_acquired_again() {
        let (locks, _, _) = protocol(&MapperConfig::default());
        locks.schedule_if_absent(&entity(), "/it", "q").unwrap();

        let first = RequestId::new();
        locks.get_lock::<IteratorState>("j1", 1, first).unwrap();
        locks.clear_lock::<IteratorState>("j1", first, false).unwrap();

        assert!(locks.get_lock::<IteratorState>("j1", 1, RequestId::new()).is_ok());
    }

    #[test]
    fn only_the_holder_clears() {
        let (locks, _, _) = protocol(&MapperConfig::default());
        locks.schedule_if_absent(&entity(), "/it", "q").unwrap();
        locks.get_lock::<IteratorState>("j1", 1, RequestId::new()).unwrap();
        assert!(!locks.clear_lock::<IteratorState>("j1", RequestId::new(), false).unwrap());
    }

    #[test]
    fn expired_lease_is_taken_over_until_abandoned() {
        let config = MapperConfig::default()
            .with_lease_timeout(Duration::ZERO)
            .with_max_lock_retries(2);
        let (locks, _, _) = protocol(&config);
        locks.schedule_if_absent(&entity(), "/it", "q").unwrap();

        locks.get_lock::<IteratorState>("j1", 1, RequestId::new()).unwrap();
        let second = RequestId::new();
        let taken: IteratorState = locks.get_lock("j1", 1, second).unwrap();
        assert!(taken.lock.is_held_by(second));

        let err = locks.get_lock::<IteratorState>("j1", 1, RequestId::new()).unwrap_err();
        assert!(matches!(err, LockError::Abandoned { attempts: 2, .. }));

        locks.abandon::<IteratorState>("j1", 1).unwrap();
        let err = locks.get_lock::<IteratorState>("j1", 1, RequestId::new()).unwrap_err();
        assert!(matches!(err, LockError::AlreadyComplete { .. }));
    }

    #[test]
    fn unknown_entity_and_future_steps() {
        let (locks, _, _) = protocol(&MapperConfig::default());
        let err = locks.get_lock::<IteratorState>("nope", 1, RequestId::new()).unwrap_err();
        assert!(matches!(err, LockError::NotFound { .. }));

        locks.schedule_if_absent(&entity(), "/it", "q").unwrap();
        let err = locks.get_lock::<IteratorState>("j1", 3, RequestId::new()).unwrap_err();
        assert!(matches!(err, LockError::NotReady { current: 0, .. }));
    }

    #[test]
    fn parse_lock_reads_headers() {
        let task = Task::locked("/x", "bulk", "job/ns", 4);
        let delivery = LockProtocol::parse_lock(|h| task.header(h)).unwrap();
        assert_eq!(delivery, Delivery::new("job/ns", 4, "bulk"));

        let err = LockProtocol::parse_lock(|h| (h == HEADER_LOCK_ID).then(|| "x".to_string())).unwrap_err();
        assert_eq!(err.response_code(), 400);
        let err = LockProtocol::parse_lock(|h| match h {
            HEADER_LOCK_ID => Some("x".to_string()),
            HEADER_LOCK_SEQ => Some("abc".to_string()),
            _ => None,
        })
        .unwrap_err();
        assert!(matches!(err, LockError::Malformed(_)));
    }
}
