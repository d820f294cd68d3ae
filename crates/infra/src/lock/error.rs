use thiserror::Error;

use crate::store::StoreError;

/// Why a delivery could not take (or keep) an entity lock.
///
/// Every variant maps to the status the task substrate should see: 200-class
/// answers drop the delivery, 503 asks for a later redelivery.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("step {seq} of {key} already completed")]
    AlreadyComplete { key: String, seq: u64 },

    #[error("stale delivery of step {seq} for {key} (now at {current})")]
    Stale { key: String, seq: u64, current: u64 },

    #[error("step {seq} of {key} is held by another request")]
    InProgress { key: String, seq: u64 },

    #[error("{key} is not ready for step {seq} (at {current})")]
    NotReady { key: String, seq: u64, current: u64 },

    #[error("step {seq} of {key} abandoned after {attempts} attempts")]
    Abandoned { key: String, seq: u64, attempts: u32 },

    #[error("{key} not found")]
    NotFound { key: String },

    #[error("lock on {key} is no longer held by this request")]
    LostLock { key: String },

    #[error("malformed lock headers: {0}")]
    Malformed(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LockError {
    pub fn response_code(&self) -> u16 {
        match self {
            LockError::AlreadyComplete { .. }
            | LockError::Stale { .. }
            | LockError::Abandoned { .. }
            | LockError::NotFound { .. } => 200,
            LockError::InProgress { .. } | LockError::NotReady { .. } => 503,
            LockError::LostLock { .. } => 409,
            LockError::Malformed(_) => 400,
            LockError::Store(_) => 500,
        }
    }

    pub fn should_retry(&self) -> bool {
        self.response_code() >= 500
    }
}
