//! Boundaries to the collaborators the orchestrator drives but does not own:
//! where namespaces come from, how a namespace is split, and what a shard does.

pub mod processor;
pub mod source;
pub mod splitter;

pub use processor::{NoopProcessor, ProcessError, ProcessorRegistry, ShardContext, ShardProcessor};
pub use source::{NamespacePage, NamespaceSource, SourceError, StaticNamespaceSource};
pub use splitter::{EvenSplitter, ShardSplitter, SplitError, shard_total};
