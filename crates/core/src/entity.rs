//! Entity traits: identity + continuity across persisted state changes.

use serde::{Serialize, de::DeserializeOwned};

use crate::lock::LockState;

/// A persisted orchestration entity.
///
/// The store addresses entities by `(KIND, key_name)`; the host may prefix the
/// kind (see the datastore prefix in the infra configuration).
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable kind name (e.g. `"namespace"`).
    const KIND: &'static str;

    /// Key name unique within the kind.
    fn key_name(&self) -> String;
}

/// An entity whose steps are guarded by the lock protocol.
pub trait Lockable: Entity {
    fn lock(&self) -> &LockState;

    fn lock_mut(&mut self) -> &mut LockState;
}
