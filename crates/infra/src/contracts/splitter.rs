use std::sync::Arc;

use thiserror::Error;

use shardmap_core::{JobState, ShardSpec};

#[derive(Debug, Error)]
pub enum SplitError {
    #[error("split of namespace '{namespace}' failed: {message}")]
    Failed { namespace: String, message: String },

    #[error("split of namespace '{namespace}' produced {count} shards, more than a namespace can track")]
    TooManyShards { namespace: String, count: usize },
}

/// Shard total for a split that produced `count` shards.
pub fn shard_total(namespace: &str, count: usize) -> Result<u32, SplitError> {
    u32::try_from(count).map_err(|_| SplitError::TooManyShards {
        namespace: namespace.to_string(),
        count,
    })
}

/// Decides how one namespace is partitioned into shards.
///
/// Must be deterministic for a given job and namespace: a split step retried
/// after a failure has to produce the same shard identities.
pub trait ShardSplitter: Send + Sync {
    fn split(&self, job: &JobState, namespace: &str) -> Result<Vec<ShardSpec>, SplitError>;
}

impl<S> ShardSplitter for Arc<S>
where
    S: ShardSplitter + ?Sized,
{
    fn split(&self, job: &JobState, namespace: &str) -> Result<Vec<ShardSpec>, SplitError> {
        (**self).split(job, namespace)
    }
}

impl<F> ShardSplitter for F
where
    F: Fn(&JobState, &str) -> Result<Vec<ShardSpec>, SplitError> + Send + Sync,
{
    fn split(&self, job: &JobState, namespace: &str) -> Result<Vec<ShardSpec>, SplitError> {
        self(job, namespace)
    }
}

/// Splits every namespace into the job's `shards` hint, capped at `max_shards`.
#[derive(Debug, Clone)]
pub struct EvenSplitter {
    pub max_shards: u32,
}

impl Default for EvenSplitter {
    fn default() -> Self {
        Self { max_shards: 256 }
    }
}

impl ShardSplitter for EvenSplitter {
    fn split(&self, job: &JobState, _namespace: &str) -> Result<Vec<ShardSpec>, SplitError> {
        let total = job.shards.clamp(1, self.max_shards.max(1));
        Ok((0..total).map(|index| ShardSpec { index, total }).collect())
    }
}
