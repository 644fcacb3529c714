//! GridActor - owns the cell actors of one dashboard
//!
//! Besides fanning refreshes out to its cells, the grid listens on the
//! session's layout signal hub for its dashboard id and funnels every signal
//! into the dashboard, so drags coming from several emitters share the one
//! persistence debounce.

use async_trait::async_trait;
use futures::StreamExt;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort, SupervisionEvent};
use serde_json::Value;
use shared_types::{Cell, LayoutItem};
use std::collections::BTreeMap;
use tokio::task::JoinHandle;

use super::cell::{CellActor, CellArguments, CellMsg};
use crate::actors::layout_signals::LayoutSignal;
use crate::machine::Notifier;
use crate::services::SessionServices;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GridUpdate {
    /// A layout signal moved one of this grid's cells
    Moved(LayoutItem),
}

#[derive(Debug, Default)]
pub struct GridActor;

pub struct GridArguments {
    pub dashboard_id: String,
    pub cells: Vec<Cell>,
    pub services: SessionServices,
    pub notify: Notifier<GridUpdate>,
}

struct CellEntry {
    cell: Cell,
    actor: ActorRef<CellMsg>,
}

pub struct GridState {
    dashboard_id: String,
    services: SessionServices,
    notify: Notifier<GridUpdate>,
    cells: Vec<CellEntry>,
    parameters: BTreeMap<String, Value>,
    signals: Option<JoinHandle<()>>,
}

#[derive(Debug)]
pub enum GridMsg {
    AddCell(Cell),
    /// Replace a cell's record; `rerun` re-executes a data cell
    UpdateCell { cell: Cell, rerun: bool },
    RemoveCell(String),
    /// Re-run data cells. With `changed` set, only cells whose SQL mentions
    /// one of those parameters are re-run.
    Refresh {
        parameters: BTreeMap<String, Value>,
        changed: Option<Vec<String>>,
    },
    Hover { cell_id: String, hovered: bool },
    Layout(LayoutSignal),
    GetCell {
        cell_id: String,
        reply: RpcReplyPort<Option<ActorRef<CellMsg>>>,
    },
    ListCells(RpcReplyPort<Vec<String>>),
}

fn mentions_any(cell: &Cell, names: &[String]) -> bool {
    let Some(sql) = &cell.sql else {
        return false;
    };
    names.iter().any(|name| sql.contains(&format!("{{{{{name}}}}}")))
}

#[async_trait]
impl Actor for GridActor {
    type Msg = GridMsg;
    type State = GridState;
    type Arguments = GridArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::debug!(
            actor_id = %myself.get_id(),
            dashboard_id = %args.dashboard_id,
            cells = args.cells.len(),
            "GridActor starting"
        );

        let mut state = GridState {
            dashboard_id: args.dashboard_id,
            services: args.services,
            notify: args.notify,
            cells: Vec::with_capacity(args.cells.len()),
            parameters: BTreeMap::new(),
            signals: None,
        };
        for cell in args.cells {
            self.spawn_cell(&myself, &mut state, cell).await?;
        }

        // Subscribe before the task starts so nothing emitted after
        // `pre_start` is missed
        let mut signals = state
            .services
            .layout_signals()
            .subscribe(state.dashboard_id.clone())
            .into_stream();
        let grid = myself.clone();
        state.signals = Some(tokio::spawn(async move {
            while let Some(signal) = signals.next().await {
                if grid.cast(GridMsg::Layout(signal)).is_err() {
                    break;
                }
            }
        }));

        Ok(state)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            GridMsg::AddCell(cell) => {
                let actor = self.spawn_cell(&myself, state, cell).await?;
                actor.cast(CellMsg::Refresh(state.parameters.clone()))?;
            }
            GridMsg::UpdateCell { cell, rerun } => {
                if let Some(entry) = state.cells.iter_mut().find(|e| e.cell.id == cell.id) {
                    entry.cell = cell.clone();
                    entry.actor.cast(CellMsg::Update(cell))?;
                    if rerun {
                        entry.actor.cast(CellMsg::Refresh(state.parameters.clone()))?;
                    }
                }
            }
            GridMsg::RemoveCell(cell_id) => {
                if let Some(index) = state.cells.iter().position(|e| e.cell.id == cell_id) {
                    let entry = state.cells.remove(index);
                    entry.actor.stop(Some("cell removed".to_string()));
                }
            }
            GridMsg::Refresh {
                parameters,
                changed,
            } => {
                state.parameters = parameters;
                for entry in &state.cells {
                    let affected = match &changed {
                        Some(names) => mentions_any(&entry.cell, names),
                        None => true,
                    };
                    if affected {
                        entry.actor.cast(CellMsg::Refresh(state.parameters.clone()))?;
                    }
                }
            }
            GridMsg::Hover { cell_id, hovered } => {
                if let Some(entry) = state.cells.iter().find(|e| e.cell.id == cell_id) {
                    entry.actor.cast(CellMsg::Hover(hovered))?;
                }
            }
            GridMsg::Layout(signal) => {
                if state.cells.iter().any(|e| e.cell.id == signal.item.cell_id) {
                    (state.notify)(GridUpdate::Moved(signal.item));
                } else {
                    tracing::debug!(
                        dashboard_id = %state.dashboard_id,
                        cell_id = %signal.item.cell_id,
                        "Layout signal for unknown cell"
                    );
                }
            }
            GridMsg::GetCell { cell_id, reply } => {
                let actor = state
                    .cells
                    .iter()
                    .find(|e| e.cell.id == cell_id)
                    .map(|e| e.actor.clone());
                let _ = reply.send(actor);
            }
            GridMsg::ListCells(reply) => {
                let _ = reply.send(state.cells.iter().map(|e| e.cell.id.clone()).collect());
            }
        }
        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisionEvent::ActorFailed(actor_cell, error) => {
                let Some(index) = state
                    .cells
                    .iter()
                    .position(|e| e.actor.get_id() == actor_cell.get_id())
                else {
                    return Ok(());
                };
                let entry = state.cells.remove(index);
                tracing::warn!(
                    dashboard_id = %state.dashboard_id,
                    cell_id = %entry.cell.id,
                    error = %error,
                    "Cell actor failed, respawning"
                );
                let actor = self.spawn_cell(&myself, state, entry.cell).await?;
                actor.cast(CellMsg::Refresh(state.parameters.clone()))?;
            }
            SupervisionEvent::ActorTerminated(actor_cell, _, reason) => {
                tracing::debug!(
                    dashboard_id = %state.dashboard_id,
                    actor_id = %actor_cell.get_id(),
                    reason = ?reason,
                    "Cell actor terminated"
                );
            }
            _ => {}
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Some(signals) = state.signals.take() {
            signals.abort();
        }
        for entry in state.cells.drain(..) {
            entry.actor.stop(None);
        }
        Ok(())
    }
}

impl GridActor {
    async fn spawn_cell(
        &self,
        myself: &ActorRef<GridMsg>,
        state: &mut GridState,
        cell: Cell,
    ) -> Result<ActorRef<CellMsg>, ActorProcessingErr> {
        let args = CellArguments {
            dashboard_id: state.dashboard_id.clone(),
            cell: cell.clone(),
            executor: state.services.executor(),
            config: state.services.config().execution.clone(),
        };
        let (actor, _handle) = Actor::spawn_linked(None, CellActor, args, myself.get_cell()).await?;
        state.cells.push(CellEntry {
            cell,
            actor: actor.clone(),
        });
        Ok(actor)
    }
}
