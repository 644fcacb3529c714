//! DashboardActor - the dashboard aggregate
//!
//! Sole writer of one dashboard record. On start it registers itself as
//! `dashboard-<id>`, subscribes to work-item broadcasts about itself and
//! spawns its fixed set of children:
//!
//! ```text
//! DashboardActor
//! ├── GridActor ── CellActor (one per cell) ── ExecutionActor (lazy)
//! ├── TabsActor
//! ├── ParametersActor
//! ├── PublishActor
//! ├── RefreshActor
//! └── PersistenceActor
//! ```
//!
//! Local intents mutate the record and hand the whole new snapshot to the
//! persistence child. Broadcast renames only touch the cached title; whoever
//! renamed the work item already saved it.

pub mod cell;
pub mod grid;
pub mod parameters;
pub mod publish;
pub mod refresh;
pub mod tabs;

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort, SupervisionEvent};
use serde_json::Value;
use shared_types::{
    new_id, Cell, CellKind, Dashboard, LayoutItem, ParameterDefinition, ResourceRef, Tab,
};
use std::collections::BTreeMap;
use std::time::Duration;

use self::grid::{GridActor, GridArguments, GridMsg, GridUpdate};
use self::parameters::{ParametersActor, ParametersArguments, ParametersMsg, ParametersUpdate};
use self::publish::{PublishActor, PublishArguments, PublishMsg, PublishUpdate};
use self::refresh::{RefreshActor, RefreshArguments, RefreshMsg};
use self::tabs::{TabsActor, TabsArguments, TabsMsg, TabsUpdate};
use crate::actors::event_bus::{subscribe, unsubscribe_owner, BusEvent, EventSubscriber};
use crate::actors::persistence::{
    self, PersistenceActor, PersistenceArguments, PersistenceMsg, PersistenceUpdate, SaveStatus,
};
use crate::directory::{keys, RegistrationToken};
use crate::machine::notifier;
use crate::services::SessionServices;

/// Default size of a newly added cell, in grid units
const NEW_CELL_WIDTH: u32 = 6;
const NEW_CELL_HEIGHT: u32 = 4;

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum DashboardError {
    #[error("Title must not be empty")]
    InvalidTitle,

    #[error("Cell not found: {0}")]
    CellNotFound(String),

    #[error("Tab not found: {0}")]
    TabNotFound(String),

    #[error("A dashboard needs at least one tab")]
    LastTab,

    #[error("Parameter not found: {0}")]
    ParameterNotFound(String),

    #[error("Parameter already defined: {0}")]
    DuplicateParameter(String),

    #[error("Dashboard unavailable: {0}")]
    Unavailable(String),
}

/// Subset of dashboard fields replaced by `Update`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DashboardPatch {
    pub title: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CellPatch {
    pub title: Option<String>,
    pub content: Option<Value>,
    pub sql: Option<String>,
}

/// Handles of the per-concern children, owned by the dashboard
#[derive(Debug, Clone)]
pub struct DashboardChildren {
    pub grid: ActorRef<GridMsg>,
    pub tabs: ActorRef<TabsMsg>,
    pub parameters: ActorRef<ParametersMsg>,
    pub publish: ActorRef<PublishMsg>,
    pub refresh: ActorRef<RefreshMsg>,
    pub persistence: ActorRef<PersistenceMsg>,
}

impl DashboardChildren {
    fn stop_all(&self) {
        self.grid.stop(None);
        self.tabs.stop(None);
        self.parameters.stop(None);
        self.publish.stop(None);
        self.refresh.stop(None);
        self.persistence.stop(None);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DashboardSnapshot {
    pub dashboard: Dashboard,
    pub active_tab: Option<String>,
    pub parameter_values: BTreeMap<String, Value>,
    pub save_status: SaveStatus,
}

#[derive(Debug, Default)]
pub struct DashboardActor;

pub struct DashboardArguments {
    pub dashboard: Dashboard,
    pub services: SessionServices,
}

pub struct DashboardState {
    dashboard: Dashboard,
    services: SessionServices,
    children: DashboardChildren,
    registration: RegistrationToken,
    active_tab: Option<String>,
    parameter_values: BTreeMap<String, Value>,
    save_status: SaveStatus,
}

type Reply<T> = RpcReplyPort<Result<T, DashboardError>>;

#[derive(Debug)]
pub enum DashboardMsg {
    // Local intents
    Rename {
        title: String,
        reply: Reply<()>,
    },
    Update {
        patch: DashboardPatch,
        reply: Reply<()>,
    },
    AddCell {
        kind: CellKind,
        /// Defaults to the active tab
        tab_id: Option<String>,
        reply: Reply<Cell>,
    },
    UpdateCell {
        cell_id: String,
        patch: CellPatch,
        reply: Reply<()>,
    },
    RemoveCell {
        cell_id: String,
        reply: Reply<()>,
    },
    /// Replace the whole layout
    UpdateLayout {
        layout: Vec<LayoutItem>,
        reply: Reply<()>,
    },
    AddTab {
        title: String,
        reply: Reply<Tab>,
    },
    RenameTab {
        tab_id: String,
        title: String,
        reply: Reply<()>,
    },
    RemoveTab {
        tab_id: String,
        reply: Reply<()>,
    },
    SelectTab {
        tab_id: String,
        reply: Reply<()>,
    },
    AddParameter {
        definition: ParameterDefinition,
        reply: Reply<()>,
    },
    SetParameter {
        name: String,
        value: Value,
        reply: Reply<()>,
    },
    Publish,
    Unpublish,
    SetAutoRefresh(Option<Duration>),
    RefreshCells,
    /// Pointer entered or left a cell; never saved
    HoverCell {
        cell_id: String,
        hovered: bool,
    },
    /// Retry a failed save
    Retry,
    GetSnapshot(RpcReplyPort<DashboardSnapshot>),
    GetChildren(RpcReplyPort<DashboardChildren>),

    // From children and the bus
    MoveCell(LayoutItem),
    Bus(BusEvent),
    Persistence(PersistenceUpdate),
    Tabs(TabsUpdate),
    Parameters(ParametersUpdate),
    PublishChanged(PublishUpdate),
    RefreshTick,
}

#[async_trait]
impl Actor for DashboardActor {
    type Msg = DashboardMsg;
    type State = DashboardState;
    type Arguments = DashboardArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let DashboardArguments {
            dashboard,
            services,
        } = args;
        tracing::info!(
            actor_id = %myself.get_id(),
            dashboard_id = %dashboard.id,
            cells = dashboard.cells.len(),
            "DashboardActor starting"
        );

        let resource = ResourceRef::dashboard(dashboard.id.clone());
        subscribe(
            services.event_bus(),
            "work_item.*",
            Some(resource),
            EventSubscriber::new(&myself, DashboardMsg::Bus),
        )
        .await?;

        let children = Self::spawn_children(&myself, &dashboard, &services).await?;
        let parameter_values: BTreeMap<String, Value> = dashboard
            .parameters
            .iter()
            .map(|p| (p.name.clone(), p.default_value.clone().unwrap_or(Value::Null)))
            .collect();
        // Data cells load as soon as the dashboard opens
        children.grid.cast(GridMsg::Refresh {
            parameters: parameter_values.clone(),
            changed: None,
        })?;
        let registration = services
            .directory()
            .register(&myself, keys::dashboard(&dashboard.id));

        Ok(DashboardState {
            active_tab: dashboard.tabs.first().map(|t| t.id.clone()),
            parameter_values,
            save_status: SaveStatus::Idle,
            dashboard,
            services,
            children,
            registration,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            DashboardMsg::Rename { title, reply } => {
                let result = self.rename(state, title);
                let _ = reply.send(result);
            }
            DashboardMsg::Update { patch, reply } => {
                let result = self.update(state, patch);
                let _ = reply.send(result);
            }
            DashboardMsg::AddCell {
                kind,
                tab_id,
                reply,
            } => {
                let result = self.add_cell(state, kind, tab_id);
                let _ = reply.send(result);
            }
            DashboardMsg::UpdateCell {
                cell_id,
                patch,
                reply,
            } => {
                let result = self.update_cell(state, cell_id, patch);
                let _ = reply.send(result);
            }
            DashboardMsg::RemoveCell { cell_id, reply } => {
                let result = self.remove_cells(state, |c| c.id == cell_id);
                let result = match result {
                    0 => Err(DashboardError::CellNotFound(cell_id)),
                    _ => {
                        self.persist(state);
                        Ok(())
                    }
                };
                let _ = reply.send(result);
            }
            DashboardMsg::UpdateLayout { layout, reply } => {
                let result = self.update_layout(state, layout);
                let _ = reply.send(result);
            }
            DashboardMsg::AddTab { title, reply } => {
                let tab = Tab {
                    id: new_id(),
                    title,
                };
                state.dashboard.tabs.push(tab.clone());
                self.tabs_changed(state);
                let _ = reply.send(Ok(tab));
            }
            DashboardMsg::RenameTab {
                tab_id,
                title,
                reply,
            } => {
                let result = match state.dashboard.tabs.iter_mut().find(|t| t.id == tab_id) {
                    Some(tab) => {
                        tab.title = title;
                        self.tabs_changed(state);
                        Ok(())
                    }
                    None => Err(DashboardError::TabNotFound(tab_id)),
                };
                let _ = reply.send(result);
            }
            DashboardMsg::RemoveTab { tab_id, reply } => {
                let result = self.remove_tab(state, tab_id);
                let _ = reply.send(result);
            }
            DashboardMsg::SelectTab { tab_id, reply } => {
                state.children.tabs.cast(TabsMsg::Select { tab_id, reply })?;
            }
            DashboardMsg::AddParameter { definition, reply } => {
                let result = if state
                    .dashboard
                    .parameters
                    .iter()
                    .any(|p| p.name == definition.name)
                {
                    Err(DashboardError::DuplicateParameter(definition.name))
                } else {
                    state.dashboard.parameters.push(definition);
                    state.children.parameters.cast(ParametersMsg::SetDefinitions(
                        state.dashboard.parameters.clone(),
                    ))?;
                    self.persist(state);
                    Ok(())
                };
                let _ = reply.send(result);
            }
            DashboardMsg::SetParameter { name, value, reply } => {
                state
                    .children
                    .parameters
                    .cast(ParametersMsg::Set { name, value, reply })?;
            }
            DashboardMsg::Publish => {
                state.children.publish.cast(PublishMsg::Publish)?;
            }
            DashboardMsg::Unpublish => {
                state.children.publish.cast(PublishMsg::Unpublish)?;
            }
            DashboardMsg::SetAutoRefresh(interval) => {
                state.children.refresh.cast(RefreshMsg::SetInterval(interval))?;
            }
            DashboardMsg::RefreshCells | DashboardMsg::RefreshTick => {
                state.children.grid.cast(GridMsg::Refresh {
                    parameters: state.parameter_values.clone(),
                    changed: None,
                })?;
            }
            DashboardMsg::HoverCell { cell_id, hovered } => {
                state.children.grid.cast(GridMsg::Hover { cell_id, hovered })?;
            }
            DashboardMsg::Retry => {
                persistence::retry(&state.children.persistence)?;
            }
            DashboardMsg::GetSnapshot(reply) => {
                let _ = reply.send(DashboardSnapshot {
                    dashboard: state.dashboard.clone(),
                    active_tab: state.active_tab.clone(),
                    parameter_values: state.parameter_values.clone(),
                    save_status: state.save_status,
                });
            }
            DashboardMsg::GetChildren(reply) => {
                let _ = reply.send(state.children.clone());
            }
            DashboardMsg::MoveCell(item) => {
                match state
                    .dashboard
                    .layout
                    .iter_mut()
                    .find(|i| i.cell_id == item.cell_id)
                {
                    Some(existing) if *existing == item => return Ok(()),
                    Some(existing) => *existing = item,
                    None => state.dashboard.layout.push(item),
                }
                self.persist(state);
            }
            DashboardMsg::Bus(event) => self.handle_bus(&myself, state, event),
            DashboardMsg::Persistence(update) => match update {
                PersistenceUpdate::Status(status) => state.save_status = status,
                PersistenceUpdate::Saved(saved) => {
                    state.dashboard.updated_at = Some(saved.updated_at);
                }
                PersistenceUpdate::Failed(error) => {
                    tracing::warn!(
                        dashboard_id = %state.dashboard.id,
                        error = %error,
                        "Dashboard save failed"
                    );
                }
            },
            DashboardMsg::Tabs(TabsUpdate::ActiveChanged(active)) => {
                state.active_tab = active;
            }
            DashboardMsg::Parameters(ParametersUpdate::Changed { names, values }) => {
                state.parameter_values = values;
                state.children.grid.cast(GridMsg::Refresh {
                    parameters: state.parameter_values.clone(),
                    changed: Some(names),
                })?;
            }
            DashboardMsg::PublishChanged(update) => match update {
                PublishUpdate::Changed {
                    published,
                    updated_at,
                } => {
                    state.dashboard.published = published;
                    // Publishing bumps the server version; later writes must carry it
                    state.dashboard.updated_at = state.dashboard.updated_at.max(Some(updated_at));
                }
                PublishUpdate::Failed(error) => {
                    tracing::warn!(
                        dashboard_id = %state.dashboard.id,
                        error = %error,
                        "Publish state change failed"
                    );
                }
            },
        }
        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisionEvent::ActorFailed(actor_cell, error) => {
                tracing::error!(
                    dashboard_id = %state.dashboard.id,
                    child = %actor_cell.get_id(),
                    error = %error,
                    "Dashboard child failed"
                );
                // Escalate so the session restarts the dashboard from its
                // last saved record
                return Err(format!("dashboard child {} failed: {error}", actor_cell.get_id()).into());
            }
            SupervisionEvent::ActorTerminated(actor_cell, _, reason) => {
                tracing::debug!(
                    dashboard_id = %state.dashboard.id,
                    child = %actor_cell.get_id(),
                    reason = ?reason,
                    "Dashboard child terminated"
                );
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
        tracing::info!(dashboard_id = %state.dashboard.id, "DashboardActor stopped");
        state.children.stop_all();
        let _ = unsubscribe_owner(state.services.event_bus(), myself.get_id());
        state.services.directory().release(&state.registration);
        Ok(())
    }
}

impl DashboardActor {
    async fn spawn_children(
        myself: &ActorRef<DashboardMsg>,
        dashboard: &Dashboard,
        services: &SessionServices,
    ) -> Result<DashboardChildren, ActorProcessingErr> {
        let supervisor = myself.get_cell();
        let id = dashboard.id.clone();

        let (grid, _) = Actor::spawn_linked(
            None,
            GridActor,
            GridArguments {
                dashboard_id: id.clone(),
                cells: dashboard.cells.clone(),
                services: services.clone(),
                notify: notifier(myself, |update: GridUpdate| match update {
                    GridUpdate::Moved(item) => DashboardMsg::MoveCell(item),
                }),
            },
            supervisor.clone(),
        )
        .await?;

        let (tabs, _) = Actor::spawn_linked(
            None,
            TabsActor,
            TabsArguments {
                dashboard_id: id.clone(),
                tabs: dashboard.tabs.clone(),
                notify: notifier(myself, DashboardMsg::Tabs),
            },
            supervisor.clone(),
        )
        .await?;

        let (parameters, _) = Actor::spawn_linked(
            None,
            ParametersActor,
            ParametersArguments {
                dashboard_id: id.clone(),
                definitions: dashboard.parameters.clone(),
                notify: notifier(myself, DashboardMsg::Parameters),
            },
            supervisor.clone(),
        )
        .await?;

        let (publish, _) = Actor::spawn_linked(
            None,
            PublishActor,
            PublishArguments {
                dashboard_id: id.clone(),
                published: dashboard.published,
                store: services.store(),
                notify: notifier(myself, DashboardMsg::PublishChanged),
            },
            supervisor.clone(),
        )
        .await?;

        let (refresh, _) = Actor::spawn_linked(
            None,
            RefreshActor,
            RefreshArguments {
                dashboard_id: id.clone(),
                notify: notifier(myself, |_: ()| DashboardMsg::RefreshTick),
                min_interval: None,
            },
            supervisor.clone(),
        )
        .await?;

        let (persistence, _) = Actor::spawn_linked(
            None,
            PersistenceActor,
            PersistenceArguments {
                resource: ResourceRef::dashboard(id),
                version: dashboard.updated_at,
                store: services.store(),
                event_bus: Some(services.event_bus().clone()),
                notify: Some(notifier(myself, DashboardMsg::Persistence)),
                config: services.config().persistence.clone(),
            },
            supervisor,
        )
        .await?;

        Ok(DashboardChildren {
            grid,
            tabs,
            parameters,
            publish,
            refresh,
            persistence,
        })
    }

    fn persist(&self, state: &DashboardState) {
        if let Err(e) = persistence::persist(&state.children.persistence, &state.dashboard) {
            tracing::warn!(
                dashboard_id = %state.dashboard.id,
                error = %e,
                "Persistence child unavailable"
            );
        }
    }

    fn announce(&self, state: &DashboardState) {
        state.services.publish(BusEvent::DashboardUpdated {
            dashboard_id: state.dashboard.id.clone(),
            title: state.dashboard.title.clone(),
            updated_at: state.dashboard.updated_at,
        });
    }

    fn rename(&self, state: &mut DashboardState, title: String) -> Result<(), DashboardError> {
        let title = title.trim().to_string();
        if title.is_empty() {
            return Err(DashboardError::InvalidTitle);
        }
        if title != state.dashboard.title {
            state.dashboard.title = title;
            self.persist(state);
            self.announce(state);
        }
        Ok(())
    }

    fn update(&self, state: &mut DashboardState, patch: DashboardPatch) -> Result<(), DashboardError> {
        let title = match patch.title {
            Some(title) if title.trim().is_empty() => return Err(DashboardError::InvalidTitle),
            Some(title) => Some(title.trim().to_string()),
            None => None,
        };
        let renamed = title.as_ref().is_some_and(|t| *t != state.dashboard.title);
        if let Some(title) = title {
            state.dashboard.title = title;
        }
        if let Some(description) = patch.description {
            state.dashboard.description = description;
        }
        self.persist(state);
        if renamed {
            self.announce(state);
        }
        Ok(())
    }

    fn add_cell(
        &self,
        state: &mut DashboardState,
        kind: CellKind,
        tab_id: Option<String>,
    ) -> Result<Cell, DashboardError> {
        let tab_id = match tab_id {
            Some(tab_id) if state.dashboard.tab(&tab_id).is_none() => {
                return Err(DashboardError::TabNotFound(tab_id))
            }
            Some(tab_id) => Some(tab_id),
            None => state
                .active_tab
                .clone()
                .or_else(|| state.dashboard.tabs.first().map(|t| t.id.clone())),
        };

        let cell = Cell::new(kind, tab_id);
        let bottom = state
            .dashboard
            .layout
            .iter()
            .map(|item| item.y + item.h)
            .max()
            .unwrap_or(0);
        state.dashboard.cells.push(cell.clone());
        state.dashboard.layout.push(LayoutItem {
            cell_id: cell.id.clone(),
            x: 0,
            y: bottom,
            w: NEW_CELL_WIDTH,
            h: NEW_CELL_HEIGHT,
        });
        if let Err(e) = state.children.grid.cast(GridMsg::AddCell(cell.clone())) {
            tracing::warn!(dashboard_id = %state.dashboard.id, error = %e, "Grid unavailable");
        }
        self.persist(state);

        tracing::debug!(
            dashboard_id = %state.dashboard.id,
            cell_id = %cell.id,
            kind = ?cell.kind,
            "Cell added"
        );
        Ok(cell)
    }

    fn update_cell(
        &self,
        state: &mut DashboardState,
        cell_id: String,
        patch: CellPatch,
    ) -> Result<(), DashboardError> {
        let Some(cell) = state.dashboard.cells.iter_mut().find(|c| c.id == cell_id) else {
            return Err(DashboardError::CellNotFound(cell_id));
        };
        if let Some(title) = patch.title {
            cell.title = title;
        }
        if let Some(content) = patch.content {
            cell.content = content;
        }
        let rerun = match patch.sql {
            Some(sql) if cell.sql.as_deref() != Some(sql.as_str()) => {
                cell.sql = Some(sql);
                true
            }
            _ => false,
        };
        let cell = cell.clone();
        if let Err(e) = state.children.grid.cast(GridMsg::UpdateCell { cell, rerun }) {
            tracing::warn!(dashboard_id = %state.dashboard.id, error = %e, "Grid unavailable");
        }
        self.persist(state);
        Ok(())
    }

    /// Drop matching cells with their layout items; returns how many went.
    fn remove_cells(&self, state: &mut DashboardState, doomed: impl Fn(&Cell) -> bool) -> usize {
        let (removed, kept): (Vec<Cell>, Vec<Cell>) = state
            .dashboard
            .cells
            .drain(..)
            .partition(|c| doomed(c));
        state.dashboard.cells = kept;
        state
            .dashboard
            .layout
            .retain(|item| !removed.iter().any(|c| c.id == item.cell_id));
        for cell in &removed {
            if let Err(e) = state.children.grid.cast(GridMsg::RemoveCell(cell.id.clone())) {
                tracing::warn!(dashboard_id = %state.dashboard.id, error = %e, "Grid unavailable");
            }
        }
        removed.len()
    }

    fn update_layout(
        &self,
        state: &mut DashboardState,
        layout: Vec<LayoutItem>,
    ) -> Result<(), DashboardError> {
        if let Some(unknown) = layout
            .iter()
            .find(|item| state.dashboard.cell(&item.cell_id).is_none())
        {
            return Err(DashboardError::CellNotFound(unknown.cell_id.clone()));
        }
        state.dashboard.layout = layout;
        self.persist(state);
        Ok(())
    }

    fn remove_tab(&self, state: &mut DashboardState, tab_id: String) -> Result<(), DashboardError> {
        if state.dashboard.tab(&tab_id).is_none() {
            return Err(DashboardError::TabNotFound(tab_id));
        }
        if state.dashboard.tabs.len() == 1 {
            return Err(DashboardError::LastTab);
        }
        state.dashboard.tabs.retain(|t| t.id != tab_id);
        self.remove_cells(state, |c| c.tab_id.as_deref() == Some(tab_id.as_str()));
        self.tabs_changed(state);
        Ok(())
    }

    fn tabs_changed(&self, state: &DashboardState) {
        if let Err(e) = state
            .children
            .tabs
            .cast(TabsMsg::SetTabs(state.dashboard.tabs.clone()))
        {
            tracing::warn!(dashboard_id = %state.dashboard.id, error = %e, "Tabs unavailable");
        }
        self.persist(state);
    }

    fn handle_bus(&self, myself: &ActorRef<DashboardMsg>, state: &mut DashboardState, event: BusEvent) {
        let me = ResourceRef::dashboard(state.dashboard.id.clone());
        if !event.correlation().is_about(&me) {
            return;
        }
        match event {
            BusEvent::WorkItemRenamed { title, .. } => {
                tracing::debug!(
                    dashboard_id = %state.dashboard.id,
                    title = %title,
                    "Title changed from explorer"
                );
                state.dashboard.title = title;
            }
            BusEvent::WorkItemDeleted { .. } => {
                tracing::info!(dashboard_id = %state.dashboard.id, "Dashboard deleted, stopping");
                myself.stop(Some("deleted".to_string()));
            }
            _ => {}
        }
    }
}

// ============================================================================
// Convenience functions
// ============================================================================

fn unavailable<E: std::fmt::Display>(e: E) -> DashboardError {
    DashboardError::Unavailable(e.to_string())
}

pub async fn rename_dashboard(
    actor: &ActorRef<DashboardMsg>,
    title: impl Into<String>,
) -> Result<(), DashboardError> {
    let title = title.into();
    ractor::call!(actor, |reply| DashboardMsg::Rename { title, reply }).map_err(unavailable)?
}

pub async fn add_cell(
    actor: &ActorRef<DashboardMsg>,
    kind: CellKind,
    tab_id: Option<String>,
) -> Result<Cell, DashboardError> {
    ractor::call!(actor, |reply| DashboardMsg::AddCell {
        kind,
        tab_id,
        reply
    })
    .map_err(unavailable)?
}

pub async fn update_cell(
    actor: &ActorRef<DashboardMsg>,
    cell_id: impl Into<String>,
    patch: CellPatch,
) -> Result<(), DashboardError> {
    let cell_id = cell_id.into();
    ractor::call!(actor, |reply| DashboardMsg::UpdateCell {
        cell_id,
        patch,
        reply
    })
    .map_err(unavailable)?
}

pub async fn update_layout(
    actor: &ActorRef<DashboardMsg>,
    layout: Vec<LayoutItem>,
) -> Result<(), DashboardError> {
    ractor::call!(actor, |reply| DashboardMsg::UpdateLayout { layout, reply })
        .map_err(unavailable)?
}

pub async fn set_parameter(
    actor: &ActorRef<DashboardMsg>,
    name: impl Into<String>,
    value: Value,
) -> Result<(), DashboardError> {
    let name = name.into();
    ractor::call!(actor, |reply| DashboardMsg::SetParameter { name, value, reply })
        .map_err(unavailable)?
}

pub fn hover_cell(
    actor: &ActorRef<DashboardMsg>,
    cell_id: impl Into<String>,
    hovered: bool,
) -> Result<(), DashboardError> {
    let cell_id = cell_id.into();
    ractor::cast!(actor, DashboardMsg::HoverCell { cell_id, hovered }).map_err(unavailable)
}

pub async fn get_snapshot(actor: &ActorRef<DashboardMsg>) -> Result<DashboardSnapshot, DashboardError> {
    ractor::call!(actor, DashboardMsg::GetSnapshot).map_err(unavailable)
}

pub async fn get_children(actor: &ActorRef<DashboardMsg>) -> Result<DashboardChildren, DashboardError> {
    ractor::call!(actor, DashboardMsg::GetChildren).map_err(unavailable)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::persistence::get_snapshot as persistence_snapshot;
    use crate::actors::dashboard::cell::CellMsg;
    use crate::backend::{InMemoryStore, ResourcePayload, ScriptedExecutor};
    use crate::services::testing::services;
    use shared_types::{ParameterKind, ResourceKind};

    async fn open(store: &InMemoryStore, dashboard: Dashboard) -> (ActorRef<DashboardMsg>, SessionServices) {
        let services = services(store, &ScriptedExecutor::new()).await;
        let stamped = match store.seed(ResourcePayload::Dashboard(dashboard)) {
            ResourcePayload::Dashboard(d) => d,
            other => panic!("unexpected payload {other:?}"),
        };
        let (actor, _handle) = Actor::spawn(
            None,
            DashboardActor,
            DashboardArguments {
                dashboard: stamped,
                services: services.clone(),
            },
        )
        .await
        .unwrap();
        (actor, services)
    }

    fn dashboard_writes(writes: Vec<ResourcePayload>) -> Vec<Dashboard> {
        writes
            .into_iter()
            .filter_map(|w| match w {
                ResourcePayload::Dashboard(d) => Some(d),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_add_cell_is_debounced_into_one_write() {
        let store = InMemoryStore::new();
        let (actor, _services) = open(&store, Dashboard::new("d1", "Ops")).await;

        let cell = add_cell(&actor, CellKind::Text, None).await.unwrap();
        let snapshot = get_snapshot(&actor).await.unwrap();
        assert_eq!(snapshot.dashboard.cells.len(), 1);
        assert_eq!(snapshot.dashboard.cells[0].kind, CellKind::Text);
        assert_eq!(snapshot.dashboard.cells[0].tab_id, snapshot.active_tab);

        let children = get_children(&actor).await.unwrap();
        let persistence = persistence_snapshot(&children.persistence).await.unwrap();
        assert_eq!(persistence.status, SaveStatus::Pending);

        tokio::time::sleep(std::time::Duration::from_millis(400)).await;
        let writes = dashboard_writes(store.writes().await);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].cells, vec![cell]);

        actor.stop(None);
    }

    #[tokio::test]
    async fn test_hover_reaches_cell_without_saving() {
        let store = InMemoryStore::new();
        let mut dashboard = Dashboard::new("d1", "Ops");
        let cell = Cell::new(CellKind::Text, dashboard.tabs.first().map(|t| t.id.clone()));
        dashboard.cells.push(cell.clone());
        let (actor, _services) = open(&store, dashboard).await;

        hover_cell(&actor, &cell.id, true).unwrap();
        let children = get_children(&actor).await.unwrap();
        let cell_actor = ractor::call!(children.grid, |reply| GridMsg::GetCell {
            cell_id: cell.id.clone(),
            reply
        })
        .unwrap()
        .unwrap();
        let snapshot = ractor::call!(cell_actor, CellMsg::GetSnapshot).unwrap();
        assert!(snapshot.hovered);

        hover_cell(&actor, &cell.id, false).unwrap();
        // Unknown cells are ignored
        hover_cell(&actor, "missing", true).unwrap();
        // Flush the dashboard then the grid so the cell has the hover message
        get_snapshot(&actor).await.unwrap();
        ractor::call!(children.grid, GridMsg::ListCells).unwrap();
        let snapshot = ractor::call!(cell_actor, CellMsg::GetSnapshot).unwrap();
        assert!(!snapshot.hovered);

        tokio::time::sleep(std::time::Duration::from_millis(400)).await;
        assert!(store.writes().await.is_empty());

        actor.stop(None);
    }

    #[tokio::test]
    async fn test_new_cells_stack_below_existing_layout() {
        let store = InMemoryStore::new();
        let (actor, _services) = open(&store, Dashboard::new("d1", "Ops")).await;

        add_cell(&actor, CellKind::Text, None).await.unwrap();
        add_cell(&actor, CellKind::Text, None).await.unwrap();

        let snapshot = get_snapshot(&actor).await.unwrap();
        let ys: Vec<u32> = snapshot.dashboard.layout.iter().map(|i| i.y).collect();
        assert_eq!(ys, vec![0, NEW_CELL_HEIGHT]);

        actor.stop(None);
    }

    #[tokio::test]
    async fn test_rename_rejects_blank_title() {
        let store = InMemoryStore::new();
        let (actor, _services) = open(&store, Dashboard::new("d1", "Ops")).await;

        assert_eq!(
            rename_dashboard(&actor, "   ").await,
            Err(DashboardError::InvalidTitle)
        );
        rename_dashboard(&actor, "Operations").await.unwrap();
        assert_eq!(
            get_snapshot(&actor).await.unwrap().dashboard.title,
            "Operations"
        );

        actor.stop(None);
    }

    #[tokio::test]
    async fn test_uncorrelated_broadcast_leaves_dashboard_untouched() {
        let store = InMemoryStore::new();
        let (actor, services) = open(&store, Dashboard::new("d1", "Ops")).await;
        let before = get_snapshot(&actor).await.unwrap();

        services.publish(BusEvent::WorkItemRenamed {
            kind: ResourceKind::Dashboard,
            id: "d2".to_string(),
            title: "Someone else".to_string(),
        });
        services.publish(BusEvent::WorkItemRenamed {
            kind: ResourceKind::Query,
            id: "d1".to_string(),
            title: "Same id, other kind".to_string(),
        });
        // Deliver directly as well: the handler's own check must hold too
        ractor::cast!(
            actor,
            DashboardMsg::Bus(BusEvent::WorkItemDeleted {
                kind: ResourceKind::Dashboard,
                id: "d2".to_string(),
            })
        )
        .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(get_snapshot(&actor).await.unwrap(), before);

        actor.stop(None);
    }

    #[tokio::test]
    async fn test_correlated_rename_updates_title_without_saving() {
        let store = InMemoryStore::new();
        let (actor, services) = open(&store, Dashboard::new("d1", "Ops")).await;

        services.publish(BusEvent::WorkItemRenamed {
            kind: ResourceKind::Dashboard,
            id: "d1".to_string(),
            title: "Renamed elsewhere".to_string(),
        });
        tokio::time::sleep(std::time::Duration::from_millis(400)).await;

        let snapshot = get_snapshot(&actor).await.unwrap();
        assert_eq!(snapshot.dashboard.title, "Renamed elsewhere");
        assert!(store.writes().await.is_empty());

        actor.stop(None);
    }

    #[tokio::test]
    async fn test_deleted_work_item_stops_and_unregisters_dashboard() {
        let store = InMemoryStore::new();
        let (actor, services) = open(&store, Dashboard::new("d1", "Ops")).await;
        assert!(services.directory().contains(&keys::dashboard("d1")));

        services.publish(BusEvent::WorkItemDeleted {
            kind: ResourceKind::Dashboard,
            id: "d1".to_string(),
        });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert_eq!(actor.get_status(), ractor::ActorStatus::Stopped);
        assert!(!services.directory().contains(&keys::dashboard("d1")));
    }

    #[tokio::test]
    async fn test_last_tab_cannot_be_removed() {
        let store = InMemoryStore::new();
        let (actor, _services) = open(&store, Dashboard::new("d1", "Ops")).await;
        let tab_id = get_snapshot(&actor).await.unwrap().dashboard.tabs[0].id.clone();

        let result = ractor::call!(actor, |reply| DashboardMsg::RemoveTab {
            tab_id: tab_id.clone(),
            reply
        })
        .unwrap();
        assert_eq!(result, Err(DashboardError::LastTab));

        actor.stop(None);
    }

    #[tokio::test]
    async fn test_removing_tab_drops_its_cells_and_moves_selection() {
        let store = InMemoryStore::new();
        let (actor, _services) = open(&store, Dashboard::new("d1", "Ops")).await;

        let second = ractor::call!(actor, |reply| DashboardMsg::AddTab {
            title: "Details".to_string(),
            reply
        })
        .unwrap()
        .unwrap();
        ractor::call!(actor, |reply| DashboardMsg::SelectTab {
            tab_id: second.id.clone(),
            reply
        })
        .unwrap()
        .unwrap();
        let cell = add_cell(&actor, CellKind::Text, None).await.unwrap();
        assert_eq!(cell.tab_id.as_deref(), Some(second.id.as_str()));

        ractor::call!(actor, |reply| DashboardMsg::RemoveTab {
            tab_id: second.id.clone(),
            reply
        })
        .unwrap()
        .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let snapshot = get_snapshot(&actor).await.unwrap();
        assert_eq!(snapshot.dashboard.tabs.len(), 1);
        assert!(snapshot.dashboard.cells.is_empty());
        assert!(snapshot.dashboard.layout.is_empty());
        assert_eq!(snapshot.active_tab, Some(snapshot.dashboard.tabs[0].id.clone()));

        actor.stop(None);
    }

    #[tokio::test]
    async fn test_parameters_must_be_defined_before_set() {
        let store = InMemoryStore::new();
        let (actor, _services) = open(&store, Dashboard::new("d1", "Ops")).await;

        assert_eq!(
            set_parameter(&actor, "region", Value::from("emea")).await,
            Err(DashboardError::ParameterNotFound("region".to_string()))
        );

        let definition = ParameterDefinition {
            name: "region".to_string(),
            kind: ParameterKind::Text,
            default_value: Some(Value::from("global")),
        };
        ractor::call!(actor, |reply| DashboardMsg::AddParameter {
            definition: definition.clone(),
            reply
        })
        .unwrap()
        .unwrap();
        let duplicate = ractor::call!(actor, |reply| DashboardMsg::AddParameter {
            definition,
            reply
        })
        .unwrap();
        assert_eq!(
            duplicate,
            Err(DashboardError::DuplicateParameter("region".to_string()))
        );

        set_parameter(&actor, "region", Value::from("emea")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let snapshot = get_snapshot(&actor).await.unwrap();
        assert_eq!(
            snapshot.parameter_values.get("region"),
            Some(&Value::from("emea"))
        );

        actor.stop(None);
    }

    #[tokio::test]
    async fn test_publish_then_save_does_not_conflict() {
        let store = InMemoryStore::new();
        let (actor, _services) = open(&store, Dashboard::new("d1", "Ops")).await;

        ractor::cast!(actor, DashboardMsg::Publish).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(get_snapshot(&actor).await.unwrap().dashboard.published);

        rename_dashboard(&actor, "Published ops").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(400)).await;

        let snapshot = get_snapshot(&actor).await.unwrap();
        assert_eq!(snapshot.save_status, SaveStatus::Idle);
        match store.get(&ResourceRef::dashboard("d1")) {
            Some(ResourcePayload::Dashboard(stored)) => {
                assert_eq!(stored.title, "Published ops");
                assert!(stored.published);
            }
            other => panic!("unexpected stored record {other:?}"),
        }

        actor.stop(None);
    }
}
