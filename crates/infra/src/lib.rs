//! Infrastructure layer: entity store, task queue, lock protocol and the
//! orchestration handlers that drive a job through its namespaces and shards.

pub mod config;
pub mod contracts;
pub mod lock;
pub mod orchestrator;
pub mod queue;
pub mod runner;
pub mod store;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, MapperConfig};
pub use contracts::{
    EvenSplitter, NamespacePage, NamespaceSource, NoopProcessor, ProcessError, ProcessorRegistry,
    ShardContext, ShardProcessor, ShardSplitter, SourceError, SplitError, StaticNamespaceSource,
};
pub use lock::{Delivery, LockError, LockProtocol};
pub use orchestrator::{HandlerError, HandlerOutcome, JobSubmission, Orchestrator, Route};
pub use queue::{InMemoryTaskQueue, Task, TaskQueue};
pub use runner::{RetryPolicy, TaskRunner, TaskRunnerConfig, TaskRunnerHandle};
pub use store::{Datastore, EntityStore, InMemoryEntityStore, StoreError};
