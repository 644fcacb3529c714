//! End-to-end session scenarios: a supervisor over in-memory backends

use ractor::{Actor, ActorRef};
use serde_json::json;
use shared_types::{
    Cell, CellKind, Dashboard, ExecutionStatus, LayoutItem, Query, ResourceKind, ResourceRef,
    WorkItem,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use studio::actors::dashboard::{self, DashboardMsg};
use studio::actors::event_bus::{get_history, BusEvent, RunPhase};
use studio::actors::persistence::{self, SaveStatus};
use studio::actors::query;
use studio::actors::work_items::{self, WorkItemsMsg};
use studio::backend::{InMemoryStore, PollResponse, ResourcePayload, ScriptedExecutor};
use studio::directory::keys;
use studio::supervisor::{self, SessionSupervisor, SessionSupervisorArgs, SessionSupervisorMsg};
use studio::{SessionServices, StudioConfig};

fn config(debounce_ms: u64) -> StudioConfig {
    let mut config = StudioConfig::default();
    config.persistence.debounce_ms = debounce_ms;
    config.persistence.complete_cooldown_ms = 100;
    config.persistence.failure_cooldown_ms = 300;
    config.execution.grace_ms = 10;
    config.execution.poll_interval_ms = 20;
    config.execution.cooldown_ms = 300;
    config
}

async fn start_session(
    store: &InMemoryStore,
    executor: &ScriptedExecutor,
    debounce_ms: u64,
) -> (ActorRef<SessionSupervisorMsg>, SessionServices) {
    let (session, _handle) = Actor::spawn(
        None,
        SessionSupervisor,
        SessionSupervisorArgs {
            store: Arc::new(store.clone()),
            executor: Arc::new(executor.clone()),
            config: config(debounce_ms),
        },
    )
    .await
    .unwrap();
    let services = supervisor::get_services(&session).await.unwrap();
    (session, services)
}

fn dashboard_with_cells(id: &str, cells: usize) -> Dashboard {
    let mut dashboard = Dashboard::new(id, "Ops");
    let tab_id = dashboard.tabs[0].id.clone();
    for i in 0..cells {
        let cell = Cell::new(CellKind::Text, Some(tab_id.clone()));
        dashboard.layout.push(LayoutItem {
            cell_id: cell.id.clone(),
            x: 0,
            y: (i as u32) * 4,
            w: 6,
            h: 4,
        });
        dashboard.cells.push(cell);
    }
    dashboard
}

async fn open(session: &ActorRef<SessionSupervisorMsg>, id: &str) -> ActorRef<DashboardMsg> {
    supervisor::open_dashboard(session, id).await.unwrap()
}

#[tokio::test]
async fn test_add_cell_is_saved_once_after_debounce() {
    let store = InMemoryStore::new();
    store.seed(ResourcePayload::Dashboard(dashboard_with_cells("d1", 0)));
    let (session, _services) = start_session(&store, &ScriptedExecutor::new(), 200).await;
    let dashboard = open(&session, "d1").await;

    let cell = dashboard::add_cell(&dashboard, CellKind::Text, None)
        .await
        .unwrap();
    let snapshot = dashboard::get_snapshot(&dashboard).await.unwrap();
    assert_eq!(snapshot.dashboard.cells.len(), 1);
    assert_eq!(snapshot.dashboard.cells[0].kind, CellKind::Text);
    assert!(store.writes().await.is_empty());

    // The writer sits in its debounce window and the dashboard reflects it
    let children = dashboard::get_children(&dashboard).await.unwrap();
    let writer = persistence::get_snapshot(&children.persistence).await.unwrap();
    assert_eq!(writer.status, SaveStatus::Pending);
    assert!(writer.pending);
    let snapshot = dashboard::get_snapshot(&dashboard).await.unwrap();
    assert_eq!(snapshot.save_status, SaveStatus::Pending);

    tokio::time::sleep(Duration::from_millis(500)).await;

    let writes = store.writes_for(&ResourceRef::dashboard("d1")).await;
    assert_eq!(writes.len(), 1);
    match &writes[0] {
        ResourcePayload::Dashboard(saved) => assert_eq!(saved.cells[0].id, cell.id),
        other => panic!("unexpected write {other:?}"),
    }
    let snapshot = dashboard::get_snapshot(&dashboard).await.unwrap();
    assert!(matches!(
        snapshot.save_status,
        SaveStatus::Saved | SaveStatus::Idle
    ));

    session.stop(None);
}

#[tokio::test]
async fn test_rapid_layout_updates_write_only_the_last_layout() {
    let store = InMemoryStore::new();
    let seeded = dashboard_with_cells("d1", 2);
    let (a, b) = (seeded.cells[0].id.clone(), seeded.cells[1].id.clone());
    store.seed(ResourcePayload::Dashboard(seeded));
    let (session, _services) = start_session(&store, &ScriptedExecutor::new(), 1000).await;
    let dashboard = open(&session, "d1").await;

    let first = vec![
        LayoutItem { cell_id: a.clone(), x: 6, y: 0, w: 6, h: 4 },
        LayoutItem { cell_id: b.clone(), x: 0, y: 0, w: 6, h: 4 },
    ];
    let second = vec![
        LayoutItem { cell_id: a.clone(), x: 0, y: 4, w: 12, h: 4 },
        LayoutItem { cell_id: b.clone(), x: 0, y: 0, w: 12, h: 4 },
    ];

    dashboard::update_layout(&dashboard, first).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    dashboard::update_layout(&dashboard, second.clone()).await.unwrap();

    // 900ms after the first update the debounce window is still open
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(store.writes().await.is_empty());

    tokio::time::sleep(Duration::from_millis(900)).await;
    let writes = store.writes_for(&ResourceRef::dashboard("d1")).await;
    assert_eq!(writes.len(), 1);
    match &writes[0] {
        ResourcePayload::Dashboard(saved) => assert_eq!(saved.layout, second),
        other => panic!("unexpected write {other:?}"),
    }

    session.stop(None);
}

#[tokio::test]
async fn test_layout_signals_share_one_debounce() {
    let store = InMemoryStore::new();
    let seeded = dashboard_with_cells("d1", 1);
    let cell_id = seeded.cells[0].id.clone();
    store.seed(ResourcePayload::Dashboard(seeded));
    let (session, services) = start_session(&store, &ScriptedExecutor::new(), 200).await;
    let dashboard = open(&session, "d1").await;

    for x in 1..=5 {
        services.layout_signals().emit(
            "d1",
            LayoutItem { cell_id: cell_id.clone(), x, y: 0, w: 6, h: 4 },
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    // Signals for another dashboard are not ours
    services.layout_signals().emit(
        "d2",
        LayoutItem { cell_id: cell_id.clone(), x: 11, y: 0, w: 1, h: 1 },
    );
    tokio::time::sleep(Duration::from_millis(500)).await;

    let writes = store.writes_for(&ResourceRef::dashboard("d1")).await;
    assert_eq!(writes.len(), 1);
    let snapshot = dashboard::get_snapshot(&dashboard).await.unwrap();
    assert_eq!(snapshot.dashboard.layout[0].x, 5);

    session.stop(None);
}

#[tokio::test]
async fn test_uncorrelated_broadcasts_leave_dashboard_untouched() {
    let store = InMemoryStore::new();
    store.seed(ResourcePayload::Dashboard(dashboard_with_cells("d1", 1)));
    store.seed(ResourcePayload::Dashboard(dashboard_with_cells("d2", 0)));
    let (session, services) = start_session(&store, &ScriptedExecutor::new(), 200).await;
    let dashboard = open(&session, "d1").await;
    let before = dashboard::get_snapshot(&dashboard).await.unwrap();

    services.publish(BusEvent::WorkItemRenamed {
        kind: ResourceKind::Dashboard,
        id: "d2".to_string(),
        title: "Not mine".to_string(),
    });
    // Same id, different kind
    services.publish(BusEvent::WorkItemDeleted {
        kind: ResourceKind::Query,
        id: "d1".to_string(),
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(dashboard.get_status(), ractor::ActorStatus::Running);
    assert_eq!(dashboard::get_snapshot(&dashboard).await.unwrap(), before);
    assert!(store.writes().await.is_empty());

    session.stop(None);
}

#[tokio::test]
async fn test_explorer_rename_reaches_open_dashboard_without_second_write() {
    let store = InMemoryStore::new();
    store.seed(ResourcePayload::Dashboard(dashboard_with_cells("d1", 0)));
    store.seed(ResourcePayload::WorkItem(WorkItem::new(
        ResourceKind::Dashboard,
        "d1",
        "Ops",
    )));
    let (session, services) = start_session(&store, &ScriptedExecutor::new(), 200).await;
    let dashboard = open(&session, "d1").await;
    let tree = services
        .directory()
        .get::<WorkItemsMsg>(keys::WORK_ITEMS)
        .unwrap();

    work_items::rename_item(&tree, ResourceRef::dashboard("d1"), "Operations")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let snapshot = dashboard::get_snapshot(&dashboard).await.unwrap();
    assert_eq!(snapshot.dashboard.title, "Operations");
    // Only the work item saved the rename
    assert!(store
        .writes_for(&ResourceRef::dashboard("d1"))
        .await
        .iter()
        .all(|w| matches!(w, ResourcePayload::WorkItem(_))));
    assert_eq!(store.writes().await.len(), 1);

    session.stop(None);
}

#[tokio::test]
async fn test_query_run_status_is_broadcast() {
    let store = InMemoryStore::new();
    store.seed(ResourcePayload::Query(Query::new(
        "q1",
        "Sales",
        "select * from sales where region = {{region}}",
    )));
    let executor = ScriptedExecutor::new();
    executor
        .script(vec![
            PollResponse::status(ExecutionStatus::Running),
            PollResponse::status(ExecutionStatus::Finished),
        ])
        .await;
    let (session, services) = start_session(&store, &executor, 200).await;

    let query_actor = supervisor::open_query(&session, "q1").await.unwrap();
    assert!(services.directory().contains(&keys::query("q1")));
    assert!(services.directory().contains(&keys::query_run("q1")));

    let mut parameters = BTreeMap::new();
    parameters.insert("region".to_string(), json!("EMEA"));
    query::execute_query(&query_actor, parameters.clone())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let snapshot = query::get_snapshot(&query_actor).await.unwrap();
    assert_eq!(snapshot.run.phase, Some(RunPhase::Complete));
    assert_eq!(executor.submissions().await[0].parameters, parameters);

    let phases: Vec<RunPhase> = get_history(services.event_bus(), "query.run_status", 20)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|published| match published.event {
            BusEvent::QueryRunStatus { phase, .. } => Some(phase),
            _ => None,
        })
        .collect();
    assert_eq!(phases.first(), Some(&RunPhase::Waiting));
    assert_eq!(phases.last(), Some(&RunPhase::Complete));

    session.stop(None);
}

#[tokio::test]
async fn test_deleting_a_folder_closes_its_open_dashboards() {
    let store = InMemoryStore::new();
    store.seed(ResourcePayload::WorkItem(WorkItem::new(
        ResourceKind::Folder,
        "f1",
        "Finance",
    )));
    let mut item = WorkItem::new(ResourceKind::Dashboard, "d1", "Ops");
    item.parent_id = Some("f1".to_string());
    store.seed(ResourcePayload::WorkItem(item));
    store.seed(ResourcePayload::Dashboard(dashboard_with_cells("d1", 1)));
    let (session, services) = start_session(&store, &ScriptedExecutor::new(), 200).await;
    let dashboard = open(&session, "d1").await;
    let tree = services
        .directory()
        .get::<WorkItemsMsg>(keys::WORK_ITEMS)
        .unwrap();

    let removed = work_items::delete_item(&tree, ResourceRef::folder("f1"))
        .await
        .unwrap();
    assert_eq!(removed.len(), 2);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(dashboard.get_status(), ractor::ActorStatus::Stopped);
    assert!(!services.directory().contains(&keys::dashboard("d1")));
    assert_eq!(
        supervisor::get_health(&session).await.unwrap().open_dashboards,
        0
    );

    session.stop(None);
}
