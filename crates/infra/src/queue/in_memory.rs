use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};

use super::{QueueError, Task, TaskQueue};

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<Task>,
    history: Vec<Task>,
}

/// In-memory FIFO task queue.
///
/// Intended for tests/dev and for the embedded runner. Keeps a history of every
/// task ever added so tests can assert how often a step was scheduled, and can
/// inject enqueue failures and duplicate deliveries.
#[derive(Debug, Default)]
pub struct InMemoryTaskQueue {
    state: Mutex<QueueState>,
    fail_next_adds: AtomicU32,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, QueueState>, QueueError> {
        self.state
            .lock()
            .map_err(|_| QueueError::Unavailable("lock poisoned".to_string()))
    }

    /// Next task whose delay has elapsed.
    pub fn take_ready(&self, now: DateTime<Utc>) -> Option<Task> {
        let mut state = self.state().ok()?;
        let idx = state.pending.iter().position(|t| t.is_ready(now))?;
        state.pending.remove(idx)
    }

    /// Next task regardless of its delay.
    pub fn take_next(&self) -> Option<Task> {
        self.state().ok()?.pending.pop_front()
    }

    /// First pending task accepted by `pred`, regardless of delay.
    pub fn take_matching(&self, pred: impl Fn(&Task) -> bool) -> Option<Task> {
        let mut state = self.state().ok()?;
        let idx = state.pending.iter().position(pred)?;
        state.pending.remove(idx)
    }

    pub fn len(&self) -> usize {
        self.state().map(|s| s.pending.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending(&self) -> Vec<Task> {
        self.state()
            .map(|s| s.pending.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn drain(&self) -> Vec<Task> {
        self.state()
            .map(|mut s| s.pending.drain(..).collect())
            .unwrap_or_default()
    }

    /// Every task ever added, in enqueue order.
    pub fn history(&self) -> Vec<Task> {
        self.state().map(|s| s.history.clone()).unwrap_or_default()
    }

    /// How many tasks were ever added for `path`.
    pub fn added_for(&self, path: &str) -> usize {
        self.state()
            .map(|s| s.history.iter().filter(|t| t.path == path).count())
            .unwrap_or(0)
    }

    /// Enqueue a second copy of every pending task.
    pub fn duplicate_all(&self) {
        if let Ok(mut state) = self.state() {
            let copies: Vec<Task> = state.pending.iter().cloned().collect();
            state.pending.extend(copies);
        }
    }

    /// Make the next `n` adds fail.
    pub fn fail_next_adds(&self, n: u32) {
        self.fail_next_adds.store(n, Ordering::SeqCst);
    }
}

impl TaskQueue for InMemoryTaskQueue {
    fn add(&self, task: Task) -> Result<(), QueueError> {
        let injected = self
            .fail_next_adds
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(QueueError::Unavailable("injected enqueue failure".to_string()));
        }

        let mut state = self.state()?;
        state.history.push(task.clone());
        state.pending.push_back(task);
        Ok(())
    }
}
