//! Session actors
//!
//! Aggregates (dashboard, query, visualization, work item) own their records
//! and talk to each other only through the event bus. Shared infrastructure
//! (bus, persistence, execution, layout signals) sits alongside them.

pub mod dashboard;
pub mod event_bus;
pub mod execution;
pub mod layout_signals;
pub mod notifications;
pub mod persistence;
pub mod queries;
pub mod query;
pub mod visualization;
pub mod work_items;

pub use dashboard::{DashboardActor, DashboardArguments, DashboardError, DashboardMsg};
pub use event_bus::{BusEvent, EventBusActor, EventBusArguments, EventBusMsg};
pub use notifications::{NotificationCenter, NotificationMsg};
pub use queries::{QueriesActor, QueriesMsg};
pub use query::{QueryActor, QueryError, QueryMsg};
pub use visualization::{VisualizationActor, VisualizationMsg};
pub use work_items::{WorkItemError, WorkItemsActor, WorkItemsMsg};
