//! External collaborators consumed by the runtime
//!
//! Services inside machines are the only callers of these traits; transition
//! logic never talks to the network directly.

pub mod memory;

pub use memory::{InMemoryStore, ScriptedExecutor};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared_types::{
    Dashboard, ExecutionStatus, Query, QueryResult, ResourceKind, ResourceRef, Visualization,
    WorkItem,
};
use std::collections::BTreeMap;

// ============================================================================
// Resource Store
// ============================================================================

/// Whole-resource write body (never a patch)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "resource", rename_all = "snake_case")]
pub enum ResourcePayload {
    Dashboard(Dashboard),
    Query(Query),
    Visualization(Visualization),
    WorkItem(WorkItem),
}

impl ResourcePayload {
    pub fn resource(&self) -> ResourceRef {
        match self {
            ResourcePayload::Dashboard(d) => ResourceRef::dashboard(d.id.clone()),
            ResourcePayload::Query(q) => ResourceRef::query(q.id.clone()),
            ResourcePayload::Visualization(v) => ResourceRef::visualization(v.id.clone()),
            ResourcePayload::WorkItem(w) => w.resource(),
        }
    }

    /// Server version this payload was based on
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        match self {
            ResourcePayload::Dashboard(d) => d.updated_at,
            ResourcePayload::Query(q) => q.updated_at,
            ResourcePayload::Visualization(v) => v.updated_at,
            ResourcePayload::WorkItem(w) => w.updated_at,
        }
    }

    pub fn set_updated_at(&mut self, updated_at: Option<DateTime<Utc>>) {
        match self {
            ResourcePayload::Dashboard(d) => d.updated_at = updated_at,
            ResourcePayload::Query(q) => q.updated_at = updated_at,
            ResourcePayload::Visualization(v) => v.updated_at = updated_at,
            ResourcePayload::WorkItem(w) => w.updated_at = updated_at,
        }
    }
}

/// Canonical fields returned by a successful write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedResource {
    pub resource: ResourceRef,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum WriteError {
    /// The server holds a newer version than the one this write was based on
    #[error("Write conflict on {0}")]
    Conflict(ResourceRef),

    #[error("Write rejected with status {code}: {message}")]
    Status { code: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(String),
}

impl WriteError {
    /// Interpret a non-success status code from the write endpoint
    pub fn from_status(resource: ResourceRef, code: u16, message: impl Into<String>) -> Self {
        if code == 409 {
            WriteError::Conflict(resource)
        } else {
            WriteError::Status {
                code,
                message: message.into(),
            }
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, WriteError::Conflict(_))
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("Resource not found: {0}")]
    NotFound(ResourceRef),

    #[error("Transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait ResourceStore: Send + Sync + 'static {
    async fn update(&self, payload: ResourcePayload) -> Result<SavedResource, WriteError>;

    /// `ResourceKind::Folder` refs resolve to explorer work items
    async fn fetch(&self, resource: &ResourceRef) -> Result<ResourcePayload, StoreError>;

    async fn delete(&self, resource: &ResourceRef) -> Result<(), StoreError>;

    async fn list_work_items(&self) -> Result<Vec<WorkItem>, StoreError>;

    async fn set_published(
        &self,
        dashboard_id: &str,
        published: bool,
    ) -> Result<SavedResource, WriteError>;
}

// ============================================================================
// Query Executor
// ============================================================================

/// Who asked for an execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionSource {
    Query { query_id: String },
    Cell { dashboard_id: String, cell_id: String },
}

impl ExecutionSource {
    pub fn resource(&self) -> ResourceRef {
        match self {
            ExecutionSource::Query { query_id } => ResourceRef::query(query_id.clone()),
            ExecutionSource::Cell { dashboard_id, .. } => {
                ResourceRef::new(ResourceKind::Dashboard, dashboard_id.clone())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub source: ExecutionSource,
    pub sql: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

/// Opaque run handle returned by submit
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunToken(pub String);

impl std::fmt::Display for RunToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollResponse {
    pub status: ExecutionStatus,
    pub error: Option<String>,
}

impl PollResponse {
    pub fn status(status: ExecutionStatus) -> Self {
        Self {
            status,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ExecutorError {
    #[error("Execution rejected: {0}")]
    Rejected(String),

    #[error("Unknown run: {0}")]
    UnknownRun(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait QueryExecutor: Send + Sync + 'static {
    async fn submit(&self, request: ExecutionRequest) -> Result<RunToken, ExecutorError>;

    async fn poll(&self, token: &RunToken) -> Result<PollResponse, ExecutorError>;

    /// Separate round trip for the formatted result of a finished run
    async fn fetch_result(&self, token: &RunToken) -> Result<QueryResult, ExecutorError>;

    /// Best effort; the server may finish the run anyway
    async fn cancel(&self, token: &RunToken) -> Result<(), ExecutorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_409_maps_to_conflict() {
        let resource = ResourceRef::dashboard("d1");
        assert!(WriteError::from_status(resource.clone(), 409, "stale").is_conflict());
        assert_eq!(
            WriteError::from_status(resource, 500, "boom"),
            WriteError::Status {
                code: 500,
                message: "boom".to_string()
            }
        );
    }

    #[test]
    fn test_payload_is_tagged_whole_resource() {
        let payload = ResourcePayload::Query(Query::new("q1", "Revenue", "select 1"));
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["resource"], "query");
        assert_eq!(json["sql"], "select 1");
        assert_eq!(payload.resource(), ResourceRef::query("q1"));
    }
}
