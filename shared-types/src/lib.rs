//! Shared types between the browser surface and the studio runtime
//!
//! These types are used by both:
//! - studio actors (native Rust)
//! - the editor UI (over JSON)
//!
//! Every record here is the externally-sourced shape of an aggregate. The
//! runtime owns the in-memory overlay (child actors, drafts, run state).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Generate a new sortable identifier (ULID)
pub fn new_id() -> String {
    ulid::Ulid::new().to_string()
}

// ============================================================================
// Resource Addressing
// ============================================================================

/// Kind of a persisted resource / explorer entry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Dashboard,
    Query,
    Visualization,
    Folder,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Dashboard => "dashboard",
            ResourceKind::Query => "query",
            ResourceKind::Visualization => "visualization",
            ResourceKind::Folder => "folder",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed pointer to one resource: the correlation key carried by broadcasts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub id: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn dashboard(id: impl Into<String>) -> Self {
        Self::new(ResourceKind::Dashboard, id)
    }

    pub fn query(id: impl Into<String>) -> Self {
        Self::new(ResourceKind::Query, id)
    }

    pub fn visualization(id: impl Into<String>) -> Self {
        Self::new(ResourceKind::Visualization, id)
    }

    pub fn folder(id: impl Into<String>) -> Self {
        Self::new(ResourceKind::Folder, id)
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

// ============================================================================
// Dashboards
// ============================================================================

/// Dashboard aggregate as stored by the backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Dashboard {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tabs: Vec<Tab>,
    #[serde(default)]
    pub cells: Vec<Cell>,
    #[serde(default)]
    pub layout: Vec<LayoutItem>,
    #[serde(default)]
    pub parameters: Vec<ParameterDefinition>,
    #[serde(default)]
    pub published: bool,
    /// Server version used for optimistic concurrency
    pub updated_at: Option<DateTime<Utc>>,
}

impl Dashboard {
    /// Empty dashboard with a single default tab
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            tabs: vec![Tab {
                id: new_id(),
                title: "Page 1".to_string(),
            }],
            cells: Vec::new(),
            layout: Vec::new(),
            parameters: Vec::new(),
            published: false,
            updated_at: None,
        }
    }

    pub fn cell(&self, cell_id: &str) -> Option<&Cell> {
        self.cells.iter().find(|c| c.id == cell_id)
    }

    pub fn tab(&self, tab_id: &str) -> Option<&Tab> {
        self.tabs.iter().find(|t| t.id == tab_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tab {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CellKind {
    Text,
    Query,
    Visualization,
    Parameter,
}

/// One panel on a dashboard grid
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cell {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: CellKind,
    pub tab_id: Option<String>,
    #[serde(default)]
    pub title: String,
    /// Panel-specific content (markdown text, chart config, ...)
    #[serde(default)]
    pub content: serde_json::Value,
    /// SQL executed for data-backed cells
    #[serde(default)]
    pub sql: Option<String>,
}

impl Cell {
    pub fn new(kind: CellKind, tab_id: Option<String>) -> Self {
        Self {
            id: new_id(),
            kind,
            tab_id,
            title: String::new(),
            content: serde_json::Value::Null,
            sql: None,
        }
    }

    /// Cells that load rows from an execution
    pub fn is_data_cell(&self) -> bool {
        matches!(self.kind, CellKind::Query | CellKind::Visualization) && self.sql.is_some()
    }
}

/// Grid position of one cell
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LayoutItem {
    pub cell_id: String,
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    Text,
    Number,
    Date,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParameterDefinition {
    pub name: String,
    pub kind: ParameterKind,
    pub default_value: Option<serde_json::Value>,
}

// ============================================================================
// Queries & Visualizations
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Query {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub sql: String,
    pub data_source_id: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Query {
    pub fn new(id: impl Into<String>, title: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            sql: sql.into(),
            data_source_id: None,
            updated_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Visualization {
    pub id: String,
    pub title: String,
    pub query_id: Option<String>,
    #[serde(default)]
    pub config: serde_json::Value,
    pub updated_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Work Items (file explorer)
// ============================================================================

/// Explorer entry; `parent_id` points at a folder work item
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkItem {
    pub id: String,
    pub kind: ResourceKind,
    pub title: String,
    pub parent_id: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    pub fn new(kind: ResourceKind, id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            title: title.into(),
            parent_id: None,
            updated_at: None,
        }
    }

    pub fn resource(&self) -> ResourceRef {
        ResourceRef::new(self.kind, self.id.clone())
    }
}

// ============================================================================
// Execution
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Finished,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Finished | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

/// One remote execution as seen by the editor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRun {
    pub id: String,
    pub status: ExecutionStatus,
    pub result: Option<QueryResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

// ============================================================================
// Notifications
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// Toast shown to the user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub id: String,
    pub level: NotificationLevel,
    pub message: String,
    pub resource: Option<ResourceRef>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(level: NotificationLevel, message: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            level,
            message: message.into(),
            resource: None,
            created_at: Utc::now(),
        }
    }

    pub fn about(mut self, resource: ResourceRef) -> Self {
        self.resource = Some(resource);
        self
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_id_is_unique() {
        let id1 = new_id();
        let id2 = new_id();
        assert_ne!(id1, id2);
        assert_eq!(id1.len(), 26); // ULID length
    }

    #[test]
    fn test_cell_serializes_kind_as_type() {
        let cell = Cell::new(CellKind::Text, None);
        let json = serde_json::to_value(&cell).unwrap();
        assert_eq!(json["type"], "Text");
    }

    #[test]
    fn test_dashboard_new_has_default_tab() {
        let dashboard = Dashboard::new("d1", "Revenue");
        assert_eq!(dashboard.tabs.len(), 1);
        assert!(dashboard.cells.is_empty());
        assert!(dashboard.updated_at.is_none());
    }

    #[test]
    fn test_data_cell_requires_sql() {
        let mut cell = Cell::new(CellKind::Query, None);
        assert!(!cell.is_data_cell());
        cell.sql = Some("select 1".to_string());
        assert!(cell.is_data_cell());

        let mut text = Cell::new(CellKind::Text, None);
        text.sql = Some("select 1".to_string());
        assert!(!text.is_data_cell());
    }

    #[test]
    fn test_resource_ref_display() {
        assert_eq!(ResourceRef::query("q1").to_string(), "query:q1");
        assert_eq!(ResourceKind::Folder.as_str(), "folder");
    }

    #[test]
    fn test_execution_status_terminal() {
        assert!(ExecutionStatus::Finished.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        let json = serde_json::to_string(&ExecutionStatus::Queued).unwrap();
        assert_eq!(json, "\"queued\"");
    }
}
