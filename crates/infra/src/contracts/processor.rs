use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use shardmap_core::{JobState, Query, ShardReport, ShardSpec, ShardState, WorkDescriptor};

/// What a shard processor sees of its job.
#[derive(Debug, Clone, Copy)]
pub struct ShardContext<'a> {
    pub job: &'a JobState,
    pub shard: &'a ShardState,
}

impl<'a> ShardContext<'a> {
    pub fn namespace(&self) -> &'a str {
        self.shard.id.namespace_id().namespace()
    }

    pub fn spec(&self) -> ShardSpec {
        self.shard.spec()
    }

    pub fn query(&self) -> &'a Query {
        &self.job.query
    }

    pub fn descriptor(&self) -> &'a WorkDescriptor {
        &self.job.descriptor
    }

    pub fn bucket(&self) -> Option<&'a str> {
        self.job.bucket.as_deref()
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    /// Transient: the delivery is retried within the step's attempt limit.
    #[error("retryable shard failure: {0}")]
    Retryable(String),

    /// Terminal: the shard is recorded as failed straight away.
    #[error("permanent shard failure: {0}")]
    Permanent(String),
}

/// Executes the per-shard work named by a [`WorkDescriptor`].
pub trait ShardProcessor: Send + Sync {
    fn process(&self, ctx: &ShardContext<'_>) -> Result<ShardReport, ProcessError>;
}

impl<F> ShardProcessor for F
where
    F: Fn(&ShardContext<'_>) -> Result<ShardReport, ProcessError> + Send + Sync,
{
    fn process(&self, ctx: &ShardContext<'_>) -> Result<ShardReport, ProcessError> {
        self(ctx)
    }
}

/// Does nothing and reports nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProcessor;

impl ShardProcessor for NoopProcessor {
    fn process(&self, _ctx: &ShardContext<'_>) -> Result<ShardReport, ProcessError> {
        Ok(ShardReport::default())
    }
}

/// Processors keyed by descriptor kind.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn ShardProcessor>>,
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: impl Into<String>, processor: impl ShardProcessor + 'static) {
        self.processors.insert(kind.into(), Arc::new(processor));
    }

    pub fn with(mut self, kind: impl Into<String>, processor: impl ShardProcessor + 'static) -> Self {
        self.register(kind, processor);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn ShardProcessor>> {
        self.processors.get(kind).cloned()
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.processors.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}
