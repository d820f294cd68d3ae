//! Identifiers used across the orchestration domain.
//!
//! Job ids are opaque strings chosen by the submitter (or generated). Namespace
//! and shard ids are scoped beneath their owning job so that every entity can be
//! traced back to the root of the aggregation tree from its id alone.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

const SEPARATOR: char = '/';

/// Identifier of a job (also the lock identity of the job and its iterator).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    /// Validate and wrap an externally supplied id.
    pub fn new(id: impl Into<String>) -> Result<Self, DomainError> {
        let id = id.into();
        if id.is_empty() {
            return Err(DomainError::invalid_id("JobId: empty"));
        }
        if id.contains(SEPARATOR) {
            return Err(DomainError::invalid_id(format!(
                "JobId: '{id}' must not contain '{SEPARATOR}'"
            )));
        }
        Ok(Self(id))
    }

    /// Generate a fresh, time-ordered id.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for JobId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for JobId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<JobId> for String {
    fn from(value: JobId) -> Self {
        value.0
    }
}

/// Identifier of a namespace within a job.
///
/// Rendered as `{job_id}/{namespace}`. The namespace part may be empty (the
/// default namespace of a data source) and may itself contain separators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NamespaceId {
    job_id: JobId,
    namespace: String,
}

impl NamespaceId {
    pub fn new(job_id: JobId, namespace: impl Into<String>) -> Self {
        Self {
            job_id,
            namespace: namespace.into(),
        }
    }

    /// Back-reference to the owning job.
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl core::fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}{SEPARATOR}{}", self.job_id, self.namespace)
    }
}

impl FromStr for NamespaceId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (job, namespace) = s
            .split_once(SEPARATOR)
            .ok_or_else(|| DomainError::invalid_id(format!("NamespaceId: '{s}'")))?;
        Ok(Self::new(JobId::new(job)?, namespace))
    }
}

impl TryFrom<String> for NamespaceId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NamespaceId> for String {
    fn from(value: NamespaceId) -> Self {
        value.to_string()
    }
}

/// Identifier of a shard: `(namespace, index)`.
///
/// Shard identities are deterministic so that re-running a split after a
/// failed attempt addresses the same shard entities again.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ShardId {
    namespace: NamespaceId,
    index: u32,
}

impl ShardId {
    pub fn new(namespace: NamespaceId, index: u32) -> Self {
        Self { namespace, index }
    }

    pub fn namespace_id(&self) -> &NamespaceId {
        &self.namespace
    }

    pub fn job_id(&self) -> &JobId {
        self.namespace.job_id()
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

impl core::fmt::Display for ShardId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}{SEPARATOR}{}", self.namespace, self.index)
    }
}

impl FromStr for ShardId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, index) = s
            .rsplit_once(SEPARATOR)
            .ok_or_else(|| DomainError::invalid_id(format!("ShardId: '{s}'")))?;
        let index = index
            .parse::<u32>()
            .map_err(|e| DomainError::invalid_id(format!("ShardId: {e}")))?;
        Ok(Self::new(namespace.parse()?, index))
    }
}

impl TryFrom<String> for ShardId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ShardId> for String {
    fn from(value: ShardId) -> Self {
        value.to_string()
    }
}

/// Identity of one in-flight delivery holding an entity lock.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Create a new identifier (UUIDv7, time-ordered).
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for RequestId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for RequestId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid =
            Uuid::from_str(s).map_err(|e| DomainError::invalid_id(format!("RequestId: {e}")))?;
        Ok(Self(uuid))
    }
}
