//! CellActor - one panel on a dashboard grid
//!
//! Two independent regions run side by side:
//!
//! - `data`: idle → loading → ready | failed, driven by an ephemeral
//!   execution child that the cell spawns the first time it needs data
//! - `hover`: out ⇄ over, purely presentational
//!
//! A refresh that arrives while a run is in flight marks the data stale; the
//! settled run (complete, failed or cancelled) is then discarded and a new one
//! started with the newest parameters.

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort, SupervisionEvent};
use serde_json::Value;
use shared_types::{Cell, QueryResult};
use std::collections::BTreeMap;
use std::sync::Arc;
use strum::EnumDiscriminants;

use crate::actors::event_bus::RunPhase;
use crate::actors::execution::{
    ExecutionActor, ExecutionArguments, ExecutionMsg, ExecutionUpdate,
};
use crate::backend::{ExecutionRequest, ExecutionSource, QueryExecutor};
use crate::config::ExecutionConfig;
use crate::machine::{
    actor_sink, notifier, ActionScope, Delivery, DefinitionError, Interpreter, Machine,
    MachineDefinition, MachineEvent,
};

// ============================================================================
// Machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellState {
    Cell,
    Data,
    Idle,
    Loading,
    Ready,
    Failed,
    Hover,
    Out,
    Over,
}

#[derive(Debug, Clone, EnumDiscriminants)]
#[strum_discriminants(name(CellEventKind), derive(Hash))]
pub enum CellEvent {
    Refresh(BTreeMap<String, Value>),
    Updated(Cell),
    Progress(ExecutionUpdate),
    Enter,
    Leave,
}

impl MachineEvent for CellEvent {
    type Kind = CellEventKind;

    fn kind(&self) -> CellEventKind {
        self.into()
    }
}

pub struct CellContext {
    dashboard_id: String,
    cell: Cell,
    parameters: BTreeMap<String, Value>,
    result: Option<QueryResult>,
    error: Option<String>,
    stale: bool,
}

impl CellContext {
    fn request(&self) -> Option<ExecutionRequest> {
        let sql = self.cell.sql.clone()?;
        Some(ExecutionRequest {
            source: ExecutionSource::Cell {
                dashboard_id: self.dashboard_id.clone(),
                cell_id: self.cell.id.clone(),
            },
            sql,
            parameters: self.parameters.clone(),
        })
    }
}

#[derive(Debug)]
pub enum CellCommand {
    Execute(ExecutionRequest),
}

pub struct CellMachine;

impl Machine for CellMachine {
    type State = CellState;
    type Event = CellEvent;
    type Context = CellContext;
    type Command = CellCommand;
}

type Scope<'a> = ActionScope<'a, CellMachine>;

fn store_parameters(s: &mut Scope<'_>) {
    let event = s.event;
    if let Some(CellEvent::Refresh(parameters)) = event {
        s.ctx.parameters = parameters.clone();
    }
}

fn start_run(s: &mut Scope<'_>) {
    s.ctx.stale = false;
    s.ctx.error = None;
    if let Some(request) = s.ctx.request() {
        s.emit(CellCommand::Execute(request));
    }
}

fn store_outcome(s: &mut Scope<'_>) {
    let event = s.event;
    if let Some(CellEvent::Progress(update)) = event {
        s.ctx.result = update.result.clone();
        s.ctx.error = update.error.clone();
    }
}

fn is_data_cell(ctx: &CellContext, _: &CellEvent) -> bool {
    ctx.cell.is_data_cell()
}

fn finished(phase: RunPhase) -> impl Fn(&CellContext, &CellEvent) -> bool {
    move |_, event| matches!(event, CellEvent::Progress(update) if update.phase == phase)
}

pub fn definition() -> Result<MachineDefinition<CellMachine>, DefinitionError> {
    use CellEventKind as K;
    use CellState as S;
    type C = CellMachine;

    MachineDefinition::builder("cell")
        .initial(S::Cell)
        .state(
            C::parallel(S::Cell).on(
                K::Updated,
                C::internal().action(|s| {
                    let event = s.event;
                    if let Some(CellEvent::Updated(cell)) = event {
                        s.ctx.cell = cell.clone();
                    }
                }),
            ),
        )
        .state(C::compound(S::Data, S::Idle).child_of(S::Cell))
        .state(
            C::atomic(S::Idle).child_of(S::Data).on(
                K::Refresh,
                C::to(S::Loading)
                    .guard(is_data_cell)
                    .action(store_parameters),
            ),
        )
        .state(
            C::atomic(S::Loading)
                .child_of(S::Data)
                .on_entry(start_run)
                .on(
                    K::Refresh,
                    C::internal().action(|s| {
                        store_parameters(s);
                        s.ctx.stale = true;
                    }),
                )
                .on(
                    K::Progress,
                    C::to(S::Loading)
                        .reenter()
                        .guard(|ctx, event| {
                            ctx.stale
                                && matches!(
                                    event,
                                    CellEvent::Progress(u) if u.phase.is_settled()
                                )
                        }),
                )
                .on(
                    K::Progress,
                    C::to(S::Ready)
                        .guard(finished(RunPhase::Complete))
                        .action(store_outcome),
                )
                .on(
                    K::Progress,
                    C::to(S::Failed)
                        .guard(finished(RunPhase::Failed))
                        .action(store_outcome),
                )
                .on(
                    K::Progress,
                    C::to(S::Idle).guard(finished(RunPhase::Cancelled)),
                ),
        )
        .state(
            C::atomic(S::Ready).child_of(S::Data).on(
                K::Refresh,
                C::to(S::Loading)
                    .guard(is_data_cell)
                    .action(store_parameters),
            ),
        )
        .state(
            C::atomic(S::Failed).child_of(S::Data).on(
                K::Refresh,
                C::to(S::Loading)
                    .guard(is_data_cell)
                    .action(store_parameters),
            ),
        )
        .state(C::compound(S::Hover, S::Out).child_of(S::Cell))
        .state(
            C::atomic(S::Out)
                .child_of(S::Hover)
                .on(K::Enter, C::to(S::Over)),
        )
        .state(
            C::atomic(S::Over)
                .child_of(S::Hover)
                .on(K::Leave, C::to(S::Out)),
        )
        .build()
}

// ============================================================================
// CellActor
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellDataState {
    Idle,
    Loading,
    Ready,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CellSnapshot {
    pub cell: Cell,
    pub data: CellDataState,
    pub hovered: bool,
    pub result: Option<QueryResult>,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct CellActor;

pub struct CellArguments {
    pub dashboard_id: String,
    pub cell: Cell,
    pub executor: Arc<dyn QueryExecutor>,
    pub config: ExecutionConfig,
}

pub struct CellActorState {
    interpreter: Interpreter<CellMachine>,
    execution: Option<ActorRef<ExecutionMsg>>,
    executor: Arc<dyn QueryExecutor>,
    config: ExecutionConfig,
}

#[derive(Debug)]
pub enum CellMsg {
    /// Re-run the cell's query with these parameter values
    Refresh(BTreeMap<String, Value>),
    Update(Cell),
    Hover(bool),
    Execution(ExecutionUpdate),
    Service(Delivery<CellEvent>),
    GetSnapshot(RpcReplyPort<CellSnapshot>),
}

#[async_trait]
impl Actor for CellActor {
    type Msg = CellMsg;
    type State = CellActorState;
    type Arguments = CellArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::debug!(
            actor_id = %myself.get_id(),
            dashboard_id = %args.dashboard_id,
            cell_id = %args.cell.id,
            "CellActor starting"
        );
        let context = CellContext {
            dashboard_id: args.dashboard_id,
            cell: args.cell,
            parameters: BTreeMap::new(),
            result: None,
            error: None,
            stale: false,
        };
        let mut interpreter = Interpreter::new(
            Arc::new(definition()?),
            context,
            actor_sink(&myself, CellMsg::Service),
        );
        interpreter.start();
        Ok(CellActorState {
            interpreter,
            execution: None,
            executor: args.executor,
            config: args.config,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let commands = match message {
            CellMsg::Refresh(parameters) => state.interpreter.send(CellEvent::Refresh(parameters)),
            CellMsg::Update(cell) => state.interpreter.send(CellEvent::Updated(cell)),
            CellMsg::Hover(true) => state.interpreter.send(CellEvent::Enter),
            CellMsg::Hover(false) => state.interpreter.send(CellEvent::Leave),
            CellMsg::Execution(update) => state.interpreter.send(CellEvent::Progress(update)),
            CellMsg::Service(delivery) => state.interpreter.deliver(delivery),
            CellMsg::GetSnapshot(reply) => {
                let _ = reply.send(self.snapshot(state));
                return Ok(());
            }
        };
        for command in commands {
            match command {
                CellCommand::Execute(request) => {
                    let execution = self.ensure_execution(&myself, state).await?;
                    execution.cast(ExecutionMsg::Execute(request))?;
                }
            }
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
                tracing::warn!(
                    cell_id = %state.interpreter.context().cell.id,
                    actor_id = %actor_cell.get_id(),
                    error = %error,
                    "Cell execution child failed"
                );
                state.execution = None;
            }
            SupervisionEvent::ActorTerminated(actor_cell, _, _) => {
                if state
                    .execution
                    .as_ref()
                    .is_some_and(|e| e.get_id() == actor_cell.get_id())
                {
                    state.execution = None;
                }
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
        state.interpreter.stop();
        if let Some(execution) = state.execution.take() {
            execution.stop(None);
        }
        Ok(())
    }
}

impl CellActor {
    async fn ensure_execution(
        &self,
        myself: &ActorRef<CellMsg>,
        state: &mut CellActorState,
    ) -> Result<ActorRef<ExecutionMsg>, ActorProcessingErr> {
        if let Some(execution) = &state.execution {
            return Ok(execution.clone());
        }
        let ctx = state.interpreter.context();
        let args = ExecutionArguments {
            label: format!("cell:{}/{}", ctx.dashboard_id, ctx.cell.id),
            executor: Arc::clone(&state.executor),
            config: state.config.clone(),
            notify: Some(notifier(myself, CellMsg::Execution)),
        };
        let (execution, _handle) =
            Actor::spawn_linked(None, ExecutionActor, args, myself.get_cell()).await?;
        state.execution = Some(execution.clone());
        Ok(execution)
    }

    fn snapshot(&self, state: &CellActorState) -> CellSnapshot {
        let interpreter = &state.interpreter;
        let data = if interpreter.matches(CellState::Loading) {
            CellDataState::Loading
        } else if interpreter.matches(CellState::Ready) {
            CellDataState::Ready
        } else if interpreter.matches(CellState::Failed) {
            CellDataState::Failed
        } else {
            CellDataState::Idle
        };
        let ctx = interpreter.context();
        CellSnapshot {
            cell: ctx.cell.clone(),
            data,
            hovered: interpreter.matches(CellState::Over),
            result: ctx.result.clone(),
            error: ctx.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ExecutorError, PollResponse, ScriptedExecutor};
    use shared_types::{CellKind, ExecutionStatus};
    use std::time::Duration;

    fn config() -> ExecutionConfig {
        ExecutionConfig {
            grace_ms: 10,
            poll_interval_ms: 20,
            cooldown_ms: 300,
        }
    }

    async fn spawn_cell(executor: &ScriptedExecutor, cell: Cell) -> ActorRef<CellMsg> {
        let (actor, _handle) = Actor::spawn(
            None,
            CellActor,
            CellArguments {
                dashboard_id: "d1".to_string(),
                cell,
                executor: Arc::new(executor.clone()),
                config: config(),
            },
        )
        .await
        .unwrap();
        actor
    }

    fn query_cell() -> Cell {
        let mut cell = Cell::new(CellKind::Query, None);
        cell.sql = Some("select 1".to_string());
        cell
    }

    #[test]
    fn test_definition_builds() {
        assert!(definition().unwrap().contains(CellState::Over));
    }

    #[tokio::test]
    async fn test_data_and_hover_regions_are_independent() {
        let executor = ScriptedExecutor::new();
        executor
            .script(vec![
                PollResponse::status(ExecutionStatus::Running),
                PollResponse::status(ExecutionStatus::Finished),
            ])
            .await;
        let cell = spawn_cell(&executor, query_cell()).await;

        ractor::cast!(cell, CellMsg::Hover(true)).unwrap();
        ractor::cast!(cell, CellMsg::Refresh(BTreeMap::new())).unwrap();
        let snapshot = ractor::call!(cell, CellMsg::GetSnapshot).unwrap();
        assert_eq!(snapshot.data, CellDataState::Loading);
        assert!(snapshot.hovered);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let snapshot = ractor::call!(cell, CellMsg::GetSnapshot).unwrap();
        assert_eq!(snapshot.data, CellDataState::Ready);
        assert!(snapshot.hovered);
        assert!(snapshot.result.is_some());

        cell.stop(None);
    }

    #[tokio::test]
    async fn test_text_cell_ignores_refresh() {
        let executor = ScriptedExecutor::new();
        let cell = spawn_cell(&executor, Cell::new(CellKind::Text, None)).await;

        ractor::cast!(cell, CellMsg::Refresh(BTreeMap::new())).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snapshot = ractor::call!(cell, CellMsg::GetSnapshot).unwrap();
        assert_eq!(snapshot.data, CellDataState::Idle);
        assert!(executor.submissions().await.is_empty());

        cell.stop(None);
    }

    #[tokio::test]
    async fn test_refresh_during_run_reruns_with_new_parameters() {
        let executor = ScriptedExecutor::new();
        executor
            .script(vec![
                PollResponse::status(ExecutionStatus::Running),
                PollResponse::status(ExecutionStatus::Finished),
            ])
            .await;
        let cell = spawn_cell(&executor, query_cell()).await;

        ractor::cast!(cell, CellMsg::Refresh(BTreeMap::new())).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut parameters = BTreeMap::new();
        parameters.insert("region".to_string(), Value::from("emea"));
        ractor::cast!(cell, CellMsg::Refresh(parameters)).unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let snapshot = ractor::call!(cell, CellMsg::GetSnapshot).unwrap();
        assert_eq!(snapshot.data, CellDataState::Ready);

        let submissions = executor.submissions().await;
        assert_eq!(submissions.len(), 2);
        assert_eq!(
            submissions[1].parameters.get("region"),
            Some(&Value::from("emea"))
        );

        cell.stop(None);
    }

    #[tokio::test]
    async fn test_refresh_during_failing_run_reruns_with_new_parameters() {
        let executor = ScriptedExecutor::new();
        executor
            .script(vec![
                PollResponse::status(ExecutionStatus::Running),
                PollResponse::status(ExecutionStatus::Finished),
            ])
            .await;
        executor
            .fail_next_fetch(ExecutorError::Transport("offline".to_string()))
            .await;
        let cell = spawn_cell(&executor, query_cell()).await;

        ractor::cast!(cell, CellMsg::Refresh(BTreeMap::new())).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut parameters = BTreeMap::new();
        parameters.insert("region".to_string(), Value::from("emea"));
        ractor::cast!(cell, CellMsg::Refresh(parameters)).unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        let submissions = executor.submissions().await;
        assert_eq!(submissions.len(), 2);
        assert_eq!(
            submissions[1].parameters.get("region"),
            Some(&Value::from("emea"))
        );

        // The failed run is discarded; the rerun's fetch succeeds
        let snapshot = ractor::call!(cell, CellMsg::GetSnapshot).unwrap();
        assert_eq!(snapshot.data, CellDataState::Ready);
        assert!(snapshot.error.is_none());

        cell.stop(None);
    }

    #[tokio::test]
    async fn test_refresh_during_cancelled_run_reruns() {
        let executor = ScriptedExecutor::new();
        executor
            .script(vec![
                PollResponse::status(ExecutionStatus::Running),
                PollResponse::status(ExecutionStatus::Cancelled),
            ])
            .await;
        let cell = spawn_cell(&executor, query_cell()).await;

        ractor::cast!(cell, CellMsg::Refresh(BTreeMap::new())).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut parameters = BTreeMap::new();
        parameters.insert("region".to_string(), Value::from("apac"));
        ractor::cast!(cell, CellMsg::Refresh(parameters)).unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let submissions = executor.submissions().await;
        assert_eq!(submissions.len(), 2);
        assert_eq!(
            submissions[1].parameters.get("region"),
            Some(&Value::from("apac"))
        );
        // The rerun is cancelled server-side too, and nothing is stale now
        let snapshot = ractor::call!(cell, CellMsg::GetSnapshot).unwrap();
        assert_eq!(snapshot.data, CellDataState::Idle);

        cell.stop(None);
    }
}
