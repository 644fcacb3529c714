use anyhow::Context;
use ractor::Actor;
use shared_types::{
    Cell, CellKind, Dashboard, LayoutItem, Query, QueryResult, ResourceKind, Visualization,
    WorkItem,
};
use std::path::PathBuf;
use std::sync::Arc;
use studio::backend::{InMemoryStore, ResourcePayload, ResourceStore, ScriptedExecutor};
use studio::supervisor::{self, SessionSupervisor, SessionSupervisorArgs};
use studio::StudioConfig;
use tracing_subscriber::EnvFilter;

/// Search the current directory and its ancestors for a `.env` file.
fn load_env_file() -> Option<Result<PathBuf, dotenvy::Error>> {
    let mut current = std::env::current_dir().ok()?;
    loop {
        let candidate = current.join(".env");
        if candidate.exists() {
            return Some(dotenvy::from_path(&candidate).map(|_| candidate));
        }
        if !current.pop() {
            return None;
        }
    }
}

/// A small explorer tree so a fresh session has something to open
fn seed(store: &InMemoryStore) {
    let folder_id = "finance";
    let query = Query::new(
        "monthly-revenue",
        "Monthly revenue",
        "select month, sum(amount) from orders where region = {{region}} group by 1",
    );

    let mut dashboard = Dashboard::new("revenue", "Revenue overview");
    let tab_id = dashboard.tabs.first().map(|t| t.id.clone());
    let mut cell = Cell::new(CellKind::Query, tab_id);
    cell.title = query.title.clone();
    cell.sql = Some(query.sql.clone());
    dashboard.layout.push(LayoutItem {
        cell_id: cell.id.clone(),
        x: 0,
        y: 0,
        w: 12,
        h: 6,
    });
    dashboard.cells.push(cell);
    dashboard.parameters.push(shared_types::ParameterDefinition {
        name: "region".to_string(),
        kind: shared_types::ParameterKind::Text,
        default_value: Some(serde_json::json!("EMEA")),
    });

    let visualization = Visualization {
        id: "revenue-trend".to_string(),
        title: "Revenue trend".to_string(),
        query_id: Some(query.id.clone()),
        config: serde_json::json!({ "chart": "line" }),
        updated_at: None,
    };

    let mut items = vec![
        WorkItem::new(ResourceKind::Folder, folder_id, "Finance"),
        WorkItem::new(ResourceKind::Dashboard, &dashboard.id, &dashboard.title),
        WorkItem::new(ResourceKind::Query, &query.id, &query.title),
        WorkItem::new(ResourceKind::Visualization, &visualization.id, &visualization.title),
    ];
    for item in items.iter_mut().skip(1) {
        item.parent_id = Some(folder_id.to_string());
    }

    store.seed(ResourcePayload::Dashboard(dashboard));
    store.seed(ResourcePayload::Query(query));
    store.seed(ResourcePayload::Visualization(visualization));
    for item in items {
        store.seed(ResourcePayload::WorkItem(item));
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let env_file = load_env_file();
    let config = StudioConfig::load().context("Failed to load studio configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter)),
        )
        .init();

    match env_file {
        Some(Ok(path)) => tracing::info!(path = %path.display(), "Loaded environment from .env"),
        Some(Err(e)) => tracing::warn!(error = %e, "Failed to load .env file"),
        None => tracing::info!("No .env file found; using process environment only"),
    }
    tracing::info!(
        debounce_ms = config.persistence.debounce_ms,
        poll_interval_ms = config.execution.poll_interval_ms,
        "Starting studio session"
    );

    let store = InMemoryStore::new();
    seed(&store);
    let executor = ScriptedExecutor::new();
    executor
        .set_result(QueryResult {
            columns: vec!["month".to_string(), "revenue".to_string()],
            rows: vec![vec![serde_json::json!("2024-01"), serde_json::json!(1200)]],
        })
        .await;

    let (session, handle) = Actor::spawn(
        None,
        SessionSupervisor,
        SessionSupervisorArgs {
            store: Arc::new(store.clone()),
            executor: Arc::new(executor),
            config,
        },
    )
    .await
    .context("Failed to start session supervisor")?;

    for item in store.list_work_items().await? {
        let opened = match item.kind {
            ResourceKind::Dashboard => supervisor::open_dashboard(&session, &item.id).await.map(|_| ()),
            ResourceKind::Query => supervisor::open_query(&session, &item.id).await.map(|_| ()),
            ResourceKind::Visualization => {
                supervisor::open_visualization(&session, &item.id).await.map(|_| ())
            }
            ResourceKind::Folder => Ok(()),
        };
        match opened {
            Ok(()) => tracing::info!(resource = %item.resource(), title = %item.title, "Opened"),
            Err(e) => tracing::warn!(resource = %item.resource(), error = %e, "Could not open work item"),
        }
    }

    let services = supervisor::get_services(&session).await?;
    tracing::info!(
        actors = services.directory().snapshot().len(),
        "Session ready; press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down");
    session.stop(Some("shutdown".to_string()));
    handle.await.context("Session supervisor panicked")?;
    Ok(())
}
