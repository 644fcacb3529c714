//! Session Supervisor - root of one editing session
//!
//! Builds the [`SessionServices`] bundle every aggregate receives and owns
//! the session-wide singletons:
//!
//! ```text
//! SessionSupervisor (one_for_one)
//! ├── EventBusActor
//! ├── NotificationCenter   "notifications"
//! ├── WorkItemsActor       "workItems"    ── WorkItemActor*
//! ├── QueriesActor         "queries"      ── QueryActor*
//! ├── DashboardActor*      "dashboard-<id>"
//! └── VisualizationActor*  "visualization-<id>"
//! ```
//!
//! A failed dashboard is restarted from its last persisted record, at most
//! `max_restarts` times per `restart_period_secs`. Past that the user gets an
//! error toast and the dashboard stays closed until opened again. A failed
//! singleton takes the session down with it.

use async_trait::async_trait;
use ractor::{Actor, ActorId, ActorProcessingErr, ActorRef, RpcReplyPort, SupervisionEvent};
use shared_types::{Notification, NotificationLevel, ResourceRef};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::actors::dashboard::{DashboardActor, DashboardArguments, DashboardMsg};
use crate::actors::event_bus::{BusEvent, EventBusActor, EventBusArguments, EventBusConfig, EventBusMsg};
use crate::actors::layout_signals::LayoutSignals;
use crate::actors::notifications::{NotificationCenter, NotificationCenterArguments, NotificationMsg};
use crate::actors::queries::{self, QueriesActor, QueriesArguments, QueriesMsg};
use crate::actors::query::{QueryError, QueryMsg};
use crate::actors::visualization::{VisualizationActor, VisualizationArguments, VisualizationMsg};
use crate::actors::work_items::{WorkItemsActor, WorkItemsArguments, WorkItemsMsg};
use crate::backend::{QueryExecutor, ResourcePayload, ResourceStore, StoreError};
use crate::config::StudioConfig;
use crate::directory::{keys, Directory, RegistrationToken};
use crate::services::SessionServices;

/// Capacity of the layout signal hub
const LAYOUT_SIGNAL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum SessionError {
    #[error("Resource not found: {0}")]
    NotFound(ResourceRef),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Session unavailable: {0}")]
    Unavailable(String),
}

impl SessionError {
    fn from_fetch(resource: ResourceRef, error: StoreError) -> Self {
        match error {
            StoreError::NotFound(_) => SessionError::NotFound(resource),
            other => SessionError::Store(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupervisionEventCounts {
    pub actor_started: u64,
    pub actor_failed: u64,
    pub actor_terminated: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHealth {
    pub event_bus_healthy: bool,
    pub work_items_healthy: bool,
    pub queries_healthy: bool,
    pub notifications_healthy: bool,
    pub open_dashboards: usize,
    pub open_visualizations: usize,
    pub supervision_event_counts: SupervisionEventCounts,
    pub last_supervision_failure: Option<String>,
}

/// Restart intensity per dashboard id
#[derive(Debug)]
pub struct RestartTracker {
    max_restarts: u32,
    period: Duration,
    windows: HashMap<String, (u32, Instant)>,
}

impl RestartTracker {
    pub fn new(max_restarts: u32, period: Duration) -> Self {
        Self {
            max_restarts,
            period,
            windows: HashMap::new(),
        }
    }

    /// Count one restart of `key`; false once the window's budget is spent
    pub fn should_restart(&mut self, key: &str) -> bool {
        self.should_restart_at(key, Instant::now())
    }

    fn should_restart_at(&mut self, key: &str, now: Instant) -> bool {
        match self.windows.get_mut(key) {
            Some((count, window_start)) => {
                if now.duration_since(*window_start) > self.period {
                    *count = 1;
                    *window_start = now;
                    true
                } else if *count < self.max_restarts {
                    *count += 1;
                    true
                } else {
                    warn!(
                        key = %key,
                        restarts = *count,
                        "Max restart intensity exceeded - will not restart actor"
                    );
                    false
                }
            }
            None => {
                if self.max_restarts == 0 {
                    return false;
                }
                self.windows.insert(key.to_string(), (1, now));
                true
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionSupervisor;

pub struct SessionSupervisorArgs {
    pub store: Arc<dyn ResourceStore>,
    pub executor: Arc<dyn QueryExecutor>,
    pub config: StudioConfig,
}

struct Singletons {
    notifications: ActorRef<NotificationMsg>,
    work_items: ActorRef<WorkItemsMsg>,
    queries: ActorRef<QueriesMsg>,
    registrations: Vec<RegistrationToken>,
}

pub struct SessionSupervisorState {
    services: SessionServices,
    event_bus: Option<ActorRef<EventBusMsg>>,
    notifications: Option<ActorRef<NotificationMsg>>,
    work_items: Option<ActorRef<WorkItemsMsg>>,
    queries: Option<ActorRef<QueriesMsg>>,
    registrations: Vec<RegistrationToken>,
    dashboards: HashMap<String, ActorRef<DashboardMsg>>,
    visualizations: HashMap<String, ActorRef<VisualizationMsg>>,
    restarts: RestartTracker,
    supervision_event_counts: SupervisionEventCounts,
    last_supervision_failure: Option<String>,
}

type Reply<T> = RpcReplyPort<Result<T, SessionError>>;

#[derive(Debug)]
pub enum SessionSupervisorMsg {
    /// Open a dashboard, or return the already-open actor
    OpenDashboard {
        dashboard_id: String,
        reply: Reply<ActorRef<DashboardMsg>>,
    },
    CloseDashboard { dashboard_id: String },
    OpenQuery {
        query_id: String,
        reply: Reply<ActorRef<QueryMsg>>,
    },
    OpenVisualization {
        visualization_id: String,
        reply: Reply<ActorRef<VisualizationMsg>>,
    },
    CloseVisualization { visualization_id: String },
    GetServices(RpcReplyPort<SessionServices>),
    GetHealth(RpcReplyPort<SessionHealth>),
}

#[async_trait]
impl Actor for SessionSupervisor {
    type Msg = SessionSupervisorMsg;
    type State = SessionSupervisorState;
    type Arguments = SessionSupervisorArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        info!(supervisor = %myself.get_id(), "SessionSupervisor starting");
        let SessionSupervisorArgs {
            store,
            executor,
            config,
        } = args;

        let (event_bus, _handle) = Actor::spawn_linked(
            None,
            EventBusActor,
            EventBusArguments {
                config: EventBusConfig {
                    history_limit: config.bus.history_limit,
                },
            },
            myself.get_cell(),
        )
        .await
        .map_err(|e| {
            error!("Failed to spawn EventBusActor: {}", e);
            ActorProcessingErr::from(e)
        })?;

        let restarts = RestartTracker::new(
            config.supervision.max_restarts,
            config.supervision.restart_period(),
        );
        let services = SessionServices::new(
            Directory::new(),
            event_bus.clone(),
            store,
            executor,
            config,
            LayoutSignals::new(LAYOUT_SIGNAL_CAPACITY),
        );

        let singletons = Self::spawn_singletons(&myself, &services).await?;
        info!(
            supervisor = %myself.get_id(),
            registered = singletons.registrations.len(),
            "Session singletons spawned"
        );

        Ok(SessionSupervisorState {
            services,
            event_bus: Some(event_bus),
            notifications: Some(singletons.notifications),
            work_items: Some(singletons.work_items),
            queries: Some(singletons.queries),
            registrations: singletons.registrations,
            dashboards: HashMap::new(),
            visualizations: HashMap::new(),
            restarts,
            supervision_event_counts: SupervisionEventCounts::default(),
            last_supervision_failure: None,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SessionSupervisorMsg::OpenDashboard {
                dashboard_id,
                reply,
            } => {
                let result = self.open_dashboard(&myself, state, dashboard_id).await;
                let _ = reply.send(result);
            }
            SessionSupervisorMsg::CloseDashboard { dashboard_id } => {
                if let Some(actor) = state.dashboards.remove(&dashboard_id) {
                    info!(dashboard_id = %dashboard_id, "Closing dashboard");
                    actor.stop(Some("closed".to_string()));
                }
            }
            SessionSupervisorMsg::OpenQuery { query_id, reply } => {
                let result = match &state.queries {
                    Some(queries) => queries::open_query(queries, query_id)
                        .await
                        .map_err(SessionError::from),
                    None => Err(SessionError::Unavailable("queries".to_string())),
                };
                let _ = reply.send(result);
            }
            SessionSupervisorMsg::OpenVisualization {
                visualization_id,
                reply,
            } => {
                let result = self
                    .open_visualization(&myself, state, visualization_id)
                    .await;
                let _ = reply.send(result);
            }
            SessionSupervisorMsg::CloseVisualization { visualization_id } => {
                if let Some(actor) = state.visualizations.remove(&visualization_id) {
                    info!(visualization_id = %visualization_id, "Closing visualization");
                    actor.stop(Some("closed".to_string()));
                }
            }
            SessionSupervisorMsg::GetServices(reply) => {
                let _ = reply.send(state.services.clone());
            }
            SessionSupervisorMsg::GetHealth(reply) => {
                let _ = reply.send(SessionHealth {
                    event_bus_healthy: state.event_bus.is_some(),
                    work_items_healthy: state.work_items.is_some(),
                    queries_healthy: state.queries.is_some(),
                    notifications_healthy: state.notifications.is_some(),
                    open_dashboards: state.dashboards.len(),
                    open_visualizations: state.visualizations.len(),
                    supervision_event_counts: state.supervision_event_counts.clone(),
                    last_supervision_failure: state.last_supervision_failure.clone(),
                });
            }
        }
        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        event: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match event {
            SupervisionEvent::ActorStarted(actor_cell) => {
                state.supervision_event_counts.actor_started += 1;
                tracing::debug!(child = %actor_cell.get_id(), "Session child started");
            }
            SupervisionEvent::ActorFailed(actor_cell, failure) => {
                state.supervision_event_counts.actor_failed += 1;
                let actor_id = actor_cell.get_id();
                state.last_supervision_failure = Some(format!("actor_id={actor_id} error={failure}"));
                warn!(
                    supervisor = %myself.get_id(),
                    failed_actor = %actor_id,
                    error = %failure,
                    "Session child failed - evaluating restart"
                );

                if let Some(dashboard_id) = find_by_actor(&state.dashboards, actor_id) {
                    state.dashboards.remove(&dashboard_id);
                    self.restart_dashboard(&myself, state, dashboard_id).await;
                } else if let Some(visualization_id) = find_by_actor(&state.visualizations, actor_id) {
                    state.visualizations.remove(&visualization_id);
                    notify_error(
                        &state.services,
                        ResourceRef::visualization(visualization_id),
                        "Visualization closed after an internal error",
                    );
                } else if self.is_singleton(state, actor_id) {
                    error!(failed_actor = %actor_id, "Session singleton failed");
                    return Err(format!("session singleton {actor_id} failed: {failure}").into());
                }
            }
            SupervisionEvent::ActorTerminated(actor_cell, _, reason) => {
                state.supervision_event_counts.actor_terminated += 1;
                let actor_id = actor_cell.get_id();
                // Deleted dashboards and visualizations stop themselves
                if let Some(dashboard_id) = find_by_actor(&state.dashboards, actor_id) {
                    info!(dashboard_id = %dashboard_id, reason = ?reason, "Dashboard terminated");
                    state.dashboards.remove(&dashboard_id);
                }
                if let Some(visualization_id) = find_by_actor(&state.visualizations, actor_id) {
                    info!(visualization_id = %visualization_id, reason = ?reason, "Visualization terminated");
                    state.visualizations.remove(&visualization_id);
                }
                if state.event_bus.as_ref().map(|a| a.get_id()) == Some(actor_id) {
                    state.event_bus = None;
                }
                if state.notifications.as_ref().map(|a| a.get_id()) == Some(actor_id) {
                    state.notifications = None;
                }
                if state.work_items.as_ref().map(|a| a.get_id()) == Some(actor_id) {
                    state.work_items = None;
                }
                if state.queries.as_ref().map(|a| a.get_id()) == Some(actor_id) {
                    state.queries = None;
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        for (_, actor) in state.dashboards.drain() {
            actor.stop(None);
        }
        for (_, actor) in state.visualizations.drain() {
            actor.stop(None);
        }
        for token in state.registrations.drain(..) {
            state.services.directory().release(&token);
        }
        if let Some(queries) = state.queries.take() {
            queries.stop(None);
        }
        if let Some(work_items) = state.work_items.take() {
            work_items.stop(None);
        }
        if let Some(notifications) = state.notifications.take() {
            notifications.stop(None);
        }
        if let Some(event_bus) = state.event_bus.take() {
            event_bus.stop(None);
        }
        info!(supervisor = %myself.get_id(), "SessionSupervisor stopped");
        Ok(())
    }
}

fn find_by_actor<M: ractor::Message>(actors: &HashMap<String, ActorRef<M>>, actor_id: ActorId) -> Option<String> {
    actors
        .iter()
        .find(|(_, actor)| actor.get_id() == actor_id)
        .map(|(id, _)| id.clone())
}

fn notify_error(services: &SessionServices, resource: ResourceRef, message: &str) {
    let notification = Notification::new(NotificationLevel::Error, message).about(resource);
    services.publish(BusEvent::NotificationShow { notification });
}

impl SessionSupervisor {
    async fn spawn_singletons(
        myself: &ActorRef<SessionSupervisorMsg>,
        services: &SessionServices,
    ) -> Result<Singletons, ActorProcessingErr> {
        let (notifications, _) = Actor::spawn_linked(
            None,
            NotificationCenter,
            NotificationCenterArguments {
                event_bus: services.event_bus().clone(),
            },
            myself.get_cell(),
        )
        .await?;
        let (work_items, _) = Actor::spawn_linked(
            None,
            WorkItemsActor,
            WorkItemsArguments {
                services: services.clone(),
            },
            myself.get_cell(),
        )
        .await?;
        let (queries, _) = Actor::spawn_linked(
            None,
            QueriesActor,
            QueriesArguments {
                services: services.clone(),
            },
            myself.get_cell(),
        )
        .await?;

        let directory = services.directory();
        let registrations = vec![
            directory.register(&notifications, keys::NOTIFICATIONS),
            directory.register(&work_items, keys::WORK_ITEMS),
            directory.register(&queries, keys::QUERIES),
        ];

        Ok(Singletons {
            notifications,
            work_items,
            queries,
            registrations,
        })
    }

    fn is_singleton(&self, state: &SessionSupervisorState, actor_id: ActorId) -> bool {
        [
            state.event_bus.as_ref().map(|a| a.get_id()),
            state.notifications.as_ref().map(|a| a.get_id()),
            state.work_items.as_ref().map(|a| a.get_id()),
            state.queries.as_ref().map(|a| a.get_id()),
        ]
        .contains(&Some(actor_id))
    }

    async fn open_dashboard(
        &self,
        myself: &ActorRef<SessionSupervisorMsg>,
        state: &mut SessionSupervisorState,
        dashboard_id: String,
    ) -> Result<ActorRef<DashboardMsg>, SessionError> {
        if let Some(actor) = state.dashboards.get(&dashboard_id) {
            return Ok(actor.clone());
        }

        let resource = ResourceRef::dashboard(dashboard_id.clone());
        let dashboard = match state.services.store().fetch(&resource).await {
            Ok(ResourcePayload::Dashboard(dashboard)) => dashboard,
            Ok(_) => return Err(SessionError::NotFound(resource)),
            Err(e) => return Err(SessionError::from_fetch(resource, e)),
        };

        let (actor, _) = Actor::spawn_linked(
            None,
            DashboardActor,
            DashboardArguments {
                dashboard,
                services: state.services.clone(),
            },
            myself.get_cell(),
        )
        .await
        .map_err(|e| SessionError::Unavailable(e.to_string()))?;

        info!(dashboard_id = %dashboard_id, actor_id = %actor.get_id(), "Dashboard opened");
        state.dashboards.insert(dashboard_id, actor.clone());
        Ok(actor)
    }

    async fn restart_dashboard(
        &self,
        myself: &ActorRef<SessionSupervisorMsg>,
        state: &mut SessionSupervisorState,
        dashboard_id: String,
    ) {
        let resource = ResourceRef::dashboard(dashboard_id.clone());
        if !state.restarts.should_restart(&dashboard_id) {
            notify_error(
                &state.services,
                resource,
                "Dashboard closed after repeated failures",
            );
            return;
        }

        info!(dashboard_id = %dashboard_id, "Restarting DashboardActor from last saved record");
        match self.open_dashboard(myself, state, dashboard_id.clone()).await {
            Ok(actor) => {
                info!(dashboard_id = %dashboard_id, new_actor = %actor.get_id(), "DashboardActor restarted");
            }
            Err(e) => {
                error!(dashboard_id = %dashboard_id, error = %e, "Failed to restart DashboardActor");
                notify_error(&state.services, resource, "Dashboard could not be reopened");
            }
        }
    }

    async fn open_visualization(
        &self,
        myself: &ActorRef<SessionSupervisorMsg>,
        state: &mut SessionSupervisorState,
        visualization_id: String,
    ) -> Result<ActorRef<VisualizationMsg>, SessionError> {
        if let Some(actor) = state.visualizations.get(&visualization_id) {
            return Ok(actor.clone());
        }

        let resource = ResourceRef::visualization(visualization_id.clone());
        let visualization = match state.services.store().fetch(&resource).await {
            Ok(ResourcePayload::Visualization(visualization)) => visualization,
            Ok(_) => return Err(SessionError::NotFound(resource)),
            Err(e) => return Err(SessionError::from_fetch(resource, e)),
        };

        let (actor, _) = Actor::spawn_linked(
            None,
            VisualizationActor,
            VisualizationArguments {
                visualization,
                services: state.services.clone(),
            },
            myself.get_cell(),
        )
        .await
        .map_err(|e| SessionError::Unavailable(e.to_string()))?;

        info!(visualization_id = %visualization_id, "Visualization opened");
        state.visualizations.insert(visualization_id, actor.clone());
        Ok(actor)
    }
}

// ============================================================================
// Convenience functions
// ============================================================================

fn unavailable<E: std::fmt::Display>(e: E) -> SessionError {
    SessionError::Unavailable(e.to_string())
}

pub async fn open_dashboard(
    supervisor: &ActorRef<SessionSupervisorMsg>,
    dashboard_id: impl Into<String>,
) -> Result<ActorRef<DashboardMsg>, SessionError> {
    let dashboard_id = dashboard_id.into();
    ractor::call!(supervisor, |reply| SessionSupervisorMsg::OpenDashboard {
        dashboard_id,
        reply
    })
    .map_err(unavailable)?
}

pub fn close_dashboard(
    supervisor: &ActorRef<SessionSupervisorMsg>,
    dashboard_id: impl Into<String>,
) -> Result<(), SessionError> {
    ractor::cast!(
        supervisor,
        SessionSupervisorMsg::CloseDashboard {
            dashboard_id: dashboard_id.into()
        }
    )
    .map_err(unavailable)
}

pub async fn open_query(
    supervisor: &ActorRef<SessionSupervisorMsg>,
    query_id: impl Into<String>,
) -> Result<ActorRef<QueryMsg>, SessionError> {
    let query_id = query_id.into();
    ractor::call!(supervisor, |reply| SessionSupervisorMsg::OpenQuery {
        query_id,
        reply
    })
    .map_err(unavailable)?
}

pub async fn open_visualization(
    supervisor: &ActorRef<SessionSupervisorMsg>,
    visualization_id: impl Into<String>,
) -> Result<ActorRef<VisualizationMsg>, SessionError> {
    let visualization_id = visualization_id.into();
    ractor::call!(supervisor, |reply| SessionSupervisorMsg::OpenVisualization {
        visualization_id,
        reply
    })
    .map_err(unavailable)?
}

pub fn close_visualization(
    supervisor: &ActorRef<SessionSupervisorMsg>,
    visualization_id: impl Into<String>,
) -> Result<(), SessionError> {
    ractor::cast!(
        supervisor,
        SessionSupervisorMsg::CloseVisualization {
            visualization_id: visualization_id.into()
        }
    )
    .map_err(unavailable)
}

pub async fn get_services(
    supervisor: &ActorRef<SessionSupervisorMsg>,
) -> Result<SessionServices, SessionError> {
    ractor::call!(supervisor, SessionSupervisorMsg::GetServices).map_err(unavailable)
}

pub async fn get_health(
    supervisor: &ActorRef<SessionSupervisorMsg>,
) -> Result<SessionHealth, SessionError> {
    ractor::call!(supervisor, SessionSupervisorMsg::GetHealth).map_err(unavailable)
}
