//! The job's data-source query and opaque work descriptor.
//!
//! Both are persisted inside the job entity. The query uses a versioned,
//! self-describing JSON encoding (`{"v":1, ...}`); decoding rejects versions
//! this build does not understand instead of guessing. The descriptor is
//! carried as bytes tagged with a kind and is only decoded by the shard
//! processor registered for that kind.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};
use crate::value_object::ValueObject;

/// Current query encoding version.
pub const QUERY_VERSION: u32 = 1;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Lt,
    Lte,
    Gt,
    Gte,
}

/// Property filter applied by the shard processor when reading a namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: JsonValue,
}

/// Description of the data a job maps over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    #[serde(rename = "v")]
    pub version: u32,
    /// Entity kind to read inside each namespace.
    pub kind: String,
    /// Explicit namespaces to include (empty = all).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<Filter>,
}

impl ValueObject for Query {}

impl Query {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            version: QUERY_VERSION,
            kind: kind.into(),
            namespaces: Vec::new(),
            namespace_prefix: None,
            filters: Vec::new(),
        }
    }

    pub fn with_namespaces<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.namespaces = namespaces.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_namespace_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.namespace_prefix = Some(prefix.into());
        self
    }

    pub fn filter(mut self, field: impl Into<String>, op: FilterOp, value: JsonValue) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            op,
            value,
        });
        self
    }

    /// Whether a namespace discovered in the data source belongs to this query.
    pub fn matches_namespace(&self, namespace: &str) -> bool {
        if !self.namespaces.is_empty() && !self.namespaces.iter().any(|n| n == namespace) {
            return false;
        }
        match &self.namespace_prefix {
            Some(prefix) => namespace.starts_with(prefix.as_str()),
            None => true,
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.version != QUERY_VERSION {
            return Err(DomainError::decode(format!(
                "unsupported query version {} (expected {QUERY_VERSION})",
                self.version
            )));
        }
        if self.kind.is_empty() {
            return Err(DomainError::validation("query kind must not be empty"));
        }
        Ok(())
    }

    pub fn encode(&self) -> DomainResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| DomainError::decode(format!("query encode: {e}")))
    }

    pub fn decode(bytes: &[u8]) -> DomainResult<Self> {
        let query: Query = serde_json::from_slice(bytes)
            .map_err(|e| DomainError::decode(format!("query decode: {e}")))?;
        query.validate()?;
        Ok(query)
    }
}

/// Opaque description of the per-shard work, resolved by `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkDescriptor {
    pub kind: String,
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl WorkDescriptor {
    pub fn new(kind: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Build a descriptor whose payload is the JSON encoding of `params`.
    pub fn json<T: Serialize>(kind: impl Into<String>, params: &T) -> DomainResult<Self> {
        let payload = serde_json::to_vec(params)
            .map_err(|e| DomainError::decode(format!("descriptor encode: {e}")))?;
        Ok(Self::new(kind, payload))
    }

    /// Decode a JSON payload (used by the processor that owns `kind`).
    pub fn decode_json<T: DeserializeOwned>(&self) -> DomainResult<T> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| DomainError::decode(format!("descriptor '{}': {e}", self.kind)))
    }
}
