//! `shardmap-core`: orchestration domain building blocks.
//!
//! This crate contains the **pure domain** of the job → namespace → shard
//! fan-out: entity state, lifecycle timing, lock bookkeeping and the opaque
//! query/descriptor types. No storage, queue or HTTP concerns live here.

pub mod entity;
pub mod error;
pub mod id;
pub mod iterator;
pub mod job;
pub mod lock;
pub mod namespace;
pub mod query;
pub mod shard;
pub mod timing;
pub mod value_object;
pub mod version;

pub use entity::{Entity, Lockable};
pub use error::{DomainError, DomainResult};
pub use id::{JobId, NamespaceId, RequestId, ShardId};
pub use iterator::IteratorState;
pub use job::JobState;
pub use lock::{LockDecision, LockState};
pub use namespace::NamespaceState;
pub use query::{Filter, FilterOp, Query, WorkDescriptor};
pub use shard::{ShardOutcome, ShardReport, ShardSpec, ShardState};
pub use timing::Timing;
pub use value_object::ValueObject;
pub use version::ExpectedVersion;
