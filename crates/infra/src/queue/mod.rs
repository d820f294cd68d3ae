//! Task queue boundary.
//!
//! The task substrate is at-least-once: a task may be delivered more than once,
//! out of order, or after a delay. Every orchestration step therefore carries
//! the lock identity and sequence it was scheduled with (see [`crate::lock`]),
//! which is what makes redeliveries harmless.

pub mod in_memory;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use in_memory::InMemoryTaskQueue;

/// Entity key name of the lock-protected entity the task operates on.
pub const HEADER_LOCK_ID: &str = "X-Lock-Id";
/// Step sequence the task was scheduled with.
pub const HEADER_LOCK_SEQ: &str = "X-Lock-Seq";
/// Queue the task was enqueued on; follow-up steps are enqueued there too.
pub const HEADER_QUEUE_NAME: &str = "X-Queue-Name";
/// Delivery attempt (0 for the first delivery).
pub const HEADER_TASK_ATTEMPT: &str = "X-Task-Attempt";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLock {
    pub id: String,
    pub seq: u64,
}

/// A unit of work addressed to a handler path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub path: String,
    pub queue: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<TaskLock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempt: u32,
}

impl Task {
    pub fn new(path: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            queue: queue.into(),
            lock: None,
            not_before: None,
            attempt: 0,
        }
    }

    /// Task bound to step `seq` of the entity keyed `id`.
    pub fn locked(
        path: impl Into<String>,
        queue: impl Into<String>,
        id: impl Into<String>,
        seq: u64,
    ) -> Self {
        Self {
            lock: Some(TaskLock { id: id.into(), seq }),
            ..Self::new(path, queue)
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        let delay = chrono::Duration::from_std(delay).unwrap_or_default();
        self.not_before = Some(Utc::now() + delay);
        self
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.not_before.is_none_or(|at| at <= now)
    }

    /// Header value as the task substrate would deliver it.
    pub fn header(&self, name: &str) -> Option<String> {
        match name {
            HEADER_LOCK_ID => self.lock.as_ref().map(|l| l.id.clone()),
            HEADER_LOCK_SEQ => self.lock.as_ref().map(|l| l.seq.to_string()),
            HEADER_QUEUE_NAME => Some(self.queue.clone()),
            HEADER_TASK_ATTEMPT => Some(self.attempt.to_string()),
            _ => None,
        }
    }

    /// All delivery headers, for transports that forward tasks over HTTP.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        [
            HEADER_LOCK_ID,
            HEADER_LOCK_SEQ,
            HEADER_QUEUE_NAME,
            HEADER_TASK_ATTEMPT,
        ]
        .into_iter()
        .filter_map(|name| self.header(name).map(|value| (name, value)))
        .collect()
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

/// Enqueue side of the task substrate.
pub trait TaskQueue: Send + Sync {
    fn add(&self, task: Task) -> Result<(), QueueError>;

    fn add_all(&self, tasks: Vec<Task>) -> Result<(), QueueError> {
        for task in tasks {
            self.add(task)?;
        }
        Ok(())
    }
}

impl<Q> TaskQueue for Arc<Q>
where
    Q: TaskQueue + ?Sized,
{
    fn add(&self, task: Task) -> Result<(), QueueError> {
        (**self).add(task)
    }

    fn add_all(&self, tasks: Vec<Task>) -> Result<(), QueueError> {
        (**self).add_all(tasks)
    }
}
