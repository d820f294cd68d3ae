use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use shardmap_core::{JobState, Query, WorkDescriptor};
use shardmap_infra::JobSubmission;

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

/// Work descriptor as submitted over HTTP: `params` becomes the JSON payload
/// handed to the processor registered for `kind`.
#[derive(Debug, Deserialize)]
pub struct DescriptorRequest {
    pub kind: String,
    #[serde(default)]
    pub params: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub query: Query,
    pub descriptor: DescriptorRequest,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub shards: Option<u32>,
    #[serde(default)]
    pub queue: Option<String>,
}

impl SubmitJobRequest {
    pub fn into_submission(self) -> Result<JobSubmission, axum::response::Response> {
        let descriptor = match &self.descriptor.params {
            Some(params) => WorkDescriptor::json(self.descriptor.kind.clone(), params).map_err(|e| {
                errors::json_error(axum::http::StatusCode::BAD_REQUEST, "invalid_descriptor", e.to_string())
            })?,
            None => WorkDescriptor::new(self.descriptor.kind.clone(), Vec::new()),
        };

        Ok(JobSubmission {
            id: self.id,
            query: self.query,
            descriptor,
            bucket: self.bucket,
            shards: self.shards,
            queue: self.queue,
        })
    }
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub id: String,
    pub kind: String,
    pub descriptor: String,
    pub bucket: Option<String>,
    pub abort: bool,
    pub iterating: bool,
    pub iteration_abandoned: bool,
    pub completed: bool,
    pub shards: u32,
    pub namespaces_total: u64,
    pub namespaces_successful: u64,
    pub namespaces_failed: u64,
    pub count: u64,
    pub counters: std::collections::BTreeMap<String, i64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&JobState> for JobStatusResponse {
    fn from(job: &JobState) -> Self {
        Self {
            id: job.id.to_string(),
            kind: job.query.kind.clone(),
            descriptor: job.descriptor.kind.clone(),
            bucket: job.bucket.clone(),
            abort: job.abort,
            iterating: job.iterating,
            iteration_abandoned: job.iteration_abandoned,
            completed: job.is_completed(),
            shards: job.shards,
            namespaces_total: job.namespaces_total,
            namespaces_successful: job.namespaces_successful,
            namespaces_failed: job.namespaces_failed,
            count: job.timing.count,
            counters: job.timing.counters.clone(),
            created_at: job.timing.created_at,
            started_at: job.timing.started_at,
            updated_at: job.timing.updated_at,
            completed_at: job.timing.completed_at,
        }
    }
}
