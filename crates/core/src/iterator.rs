//! Iterator checkpoint: enumeration progress over a job's data source.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{Entity, Lockable};
use crate::id::JobId;
use crate::lock::LockState;
use crate::timing::Timing;

/// Keyed by the job id. `cursor` and `count` always move together so that a
/// page re-processed after a failed delivery is never counted twice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IteratorState {
    pub job_id: JobId,
    /// Resume point in the data source; `None` before the first page.
    pub cursor: Option<String>,
    /// Namespaces discovered (and scheduled) so far.
    pub count: u64,
    pub pages: u64,
    pub exhausted: bool,
    pub timing: Timing,
    pub lock: LockState,
}

impl IteratorState {
    pub fn new(job_id: JobId, now: DateTime<Utc>) -> Self {
        Self {
            job_id,
            cursor: None,
            count: 0,
            pages: 0,
            exhausted: false,
            timing: Timing::new(now),
            lock: LockState::default(),
        }
    }
}

impl Entity for IteratorState {
    const KIND: &'static str = "iterator";

    fn key_name(&self) -> String {
        self.job_id.to_string()
    }
}

impl Lockable for IteratorState {
    fn lock(&self) -> &LockState {
        &self.lock
    }

    fn lock_mut(&mut self) -> &mut LockState {
        &mut self.lock
    }
}
