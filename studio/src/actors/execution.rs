//! ExecutionActor - submit, poll and fetch one remote query run at a time
//!
//! ```text
//! idle ─Execute─▶ waitForExecute ─(grace)─▶ executeQuery ─▶ polling.pollingResults ⇄ polling.waiting
//!                                                              │ finished        │ Cancel
//!                                                              ▼                 ▼
//!                                  complete ◀── fetchResults ◀───────────── cancelling ──▶ cancelled
//! ```
//!
//! Every failure lands in a sub-state of `error` named after the stage that
//! failed. `complete`, `cancelled` and `error` all accept `Execute`/`Retry`,
//! which restarts at `waitForExecute`; `cancelled` and `error` also fall back
//! to `idle` after a cooldown.
//!
//! Cancellation is a race: the actor asks the server to cancel and then checks
//! the run once more. If the server already finished, the results are fetched
//! and the run completes instead of being cancelled.

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use shared_types::{ExecutionRun, ExecutionStatus, QueryResult};
use std::sync::Arc;
use strum::EnumDiscriminants;

use crate::actors::event_bus::RunPhase;
use crate::backend::{ExecutionRequest, ExecutorError, PollResponse, QueryExecutor, RunToken};
use crate::config::ExecutionConfig;
use crate::machine::{
    actor_sink, ActionScope, Delivery, DefinitionError, Interpreter, Invocation, Machine,
    MachineDefinition, MachineEvent, Notifier,
};

// ============================================================================
// Machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionState {
    Idle,
    WaitForExecute,
    ExecuteQuery,
    Polling,
    PollingResults,
    Waiting,
    FetchResults,
    Complete,
    Cancelling,
    Cancelled,
    Error,
    ErrorSubmit,
    ErrorPoll,
    ErrorFetch,
    ErrorExecution,
}

#[derive(Debug, Clone, EnumDiscriminants)]
#[strum_discriminants(name(ExecutionEventKind), derive(Hash))]
pub enum ExecutionEvent {
    Execute(ExecutionRequest),
    Retry,
    Cancel,
    GraceElapsed,
    Submitted(RunToken),
    SubmitFailed(ExecutorError),
    Polled(PollResponse),
    PollFailed(ExecutorError),
    PollAgain,
    Fetched(QueryResult),
    FetchFailed(ExecutorError),
    /// Status observed right after asking the server to cancel
    CancelSettled(PollResponse),
    CooldownElapsed,
}

impl MachineEvent for ExecutionEvent {
    type Kind = ExecutionEventKind;

    fn kind(&self) -> ExecutionEventKind {
        self.into()
    }
}

/// Progress report sent to the owner on entering each stage
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionUpdate {
    pub phase: RunPhase,
    pub run_id: Option<String>,
    pub result: Option<QueryResult>,
    pub error: Option<String>,
}

pub struct ExecutionContext {
    executor: Arc<dyn QueryExecutor>,
    request: Option<ExecutionRequest>,
    token: Option<RunToken>,
    status: Option<ExecutionStatus>,
    result: Option<QueryResult>,
    error: Option<String>,
    config: ExecutionConfig,
}

#[derive(Debug)]
pub enum ExecutionCommand {
    InformParent(ExecutionUpdate),
}

pub struct ExecutionMachine;

impl Machine for ExecutionMachine {
    type State = ExecutionState;
    type Event = ExecutionEvent;
    type Context = ExecutionContext;
    type Command = ExecutionCommand;
}

type Scope<'a> = ActionScope<'a, ExecutionMachine>;

fn inform(s: &mut Scope<'_>, phase: RunPhase) {
    let update = ExecutionUpdate {
        phase,
        run_id: s.ctx.token.as_ref().map(|t| t.0.clone()),
        result: s.ctx.result.clone(),
        error: s.ctx.error.clone(),
    };
    s.emit(ExecutionCommand::InformParent(update));
}

fn store_request(s: &mut Scope<'_>) {
    let event = s.event;
    if let Some(ExecutionEvent::Execute(request)) = event {
        s.ctx.request = Some(request.clone());
    }
}

fn reset_run(s: &mut Scope<'_>) {
    s.ctx.token = None;
    s.ctx.status = None;
    s.ctx.result = None;
    s.ctx.error = None;
}

fn store_token(s: &mut Scope<'_>) {
    let event = s.event;
    if let Some(ExecutionEvent::Submitted(token)) = event {
        s.ctx.token = Some(token.clone());
        s.ctx.status = Some(ExecutionStatus::Queued);
    }
}

fn store_status(s: &mut Scope<'_>) {
    let event = s.event;
    match event {
        Some(ExecutionEvent::Polled(response)) | Some(ExecutionEvent::CancelSettled(response)) => {
            s.ctx.status = Some(response.status);
            if response.error.is_some() {
                s.ctx.error = response.error.clone();
            }
        }
        _ => {}
    }
}

fn store_result(s: &mut Scope<'_>) {
    let event = s.event;
    if let Some(ExecutionEvent::Fetched(result)) = event {
        s.ctx.result = Some(result.clone());
    }
}

fn store_error(s: &mut Scope<'_>) {
    let event = s.event;
    let error = match event {
        Some(ExecutionEvent::SubmitFailed(e))
        | Some(ExecutionEvent::PollFailed(e))
        | Some(ExecutionEvent::FetchFailed(e)) => Some(e.to_string()),
        Some(ExecutionEvent::Polled(response)) => Some(
            response
                .error
                .clone()
                .unwrap_or_else(|| "Query execution failed".to_string()),
        ),
        _ => None,
    };
    s.ctx.status = Some(ExecutionStatus::Failed);
    if error.is_some() {
        s.ctx.error = error;
    }
}

fn reported(status: ExecutionStatus) -> impl Fn(&ExecutionContext, &ExecutionEvent) -> bool {
    move |_, event| match event {
        ExecutionEvent::Polled(response) | ExecutionEvent::CancelSettled(response) => {
            response.status == status
        }
        _ => false,
    }
}

fn has_request(ctx: &ExecutionContext, _: &ExecutionEvent) -> bool {
    ctx.request.is_some()
}

pub fn definition() -> Result<MachineDefinition<ExecutionMachine>, DefinitionError> {
    use ExecutionEventKind as K;
    use ExecutionState as S;
    type X = ExecutionMachine;

    MachineDefinition::builder("execution")
        .initial(S::Idle)
        .state(
            X::atomic(S::Idle)
                .on(K::Execute, X::to(S::WaitForExecute).action(store_request))
                .on(K::Retry, X::to(S::WaitForExecute).guard(has_request)),
        )
        .state(
            X::atomic(S::WaitForExecute)
                .on_entry(reset_run)
                .on_entry(|s| inform(s, RunPhase::Waiting))
                .invoke(Invocation::<X>::after(
                    "grace",
                    |ctx: &ExecutionContext| ctx.config.grace(),
                    ExecutionEvent::GraceElapsed,
                ))
                // Edits keep arriving: take the newest request and wait again
                .on(
                    K::Execute,
                    X::to(S::WaitForExecute).reenter().action(store_request),
                )
                .on(K::GraceElapsed, X::to(S::ExecuteQuery))
                .on(K::Cancel, X::to(S::Cancelled)),
        )
        .state(
            X::atomic(S::ExecuteQuery)
                .on_entry(|s| inform(s, RunPhase::Submitting))
                .invoke(Invocation::<X>::future(
                    "submit",
                    |ctx: &ExecutionContext, _| {
                        let executor = Arc::clone(&ctx.executor);
                        let request = ctx.request.clone();
                        async move {
                            match request {
                                Some(request) => executor.submit(request).await,
                                None => Err(ExecutorError::Rejected("no request".to_string())),
                            }
                        }
                    },
                    ExecutionEvent::Submitted,
                    ExecutionEvent::SubmitFailed,
                ))
                .on(K::Submitted, X::to(S::Polling).action(store_token))
                .on(K::SubmitFailed, X::to(S::ErrorSubmit).action(store_error)),
        )
        .state(
            X::compound(S::Polling, S::PollingResults)
                .on_entry(|s| inform(s, RunPhase::Running))
                .on(K::Cancel, X::to(S::Cancelling)),
        )
        .state(
            X::atomic(S::PollingResults)
                .child_of(S::Polling)
                .invoke(Invocation::<X>::future(
                    "poll",
                    |ctx: &ExecutionContext, _| {
                        let executor = Arc::clone(&ctx.executor);
                        let token = ctx.token.clone();
                        async move {
                            match token {
                                Some(token) => executor.poll(&token).await,
                                None => Err(ExecutorError::UnknownRun("missing token".to_string())),
                            }
                        }
                    },
                    ExecutionEvent::Polled,
                    ExecutionEvent::PollFailed,
                ))
                .on(
                    K::Polled,
                    X::to(S::FetchResults)
                        .guard(reported(ExecutionStatus::Finished))
                        .action(store_status),
                )
                .on(
                    K::Polled,
                    X::to(S::ErrorExecution)
                        .guard(reported(ExecutionStatus::Failed))
                        .action(store_error),
                )
                .on(
                    K::Polled,
                    X::to(S::Cancelled)
                        .guard(reported(ExecutionStatus::Cancelled))
                        .action(store_status),
                )
                .on(K::Polled, X::to(S::Waiting).action(store_status))
                .on(K::PollFailed, X::to(S::ErrorPoll).action(store_error)),
        )
        .state(
            X::atomic(S::Waiting)
                .child_of(S::Polling)
                .invoke(Invocation::<X>::after(
                    "poll-interval",
                    |ctx: &ExecutionContext| ctx.config.poll_interval(),
                    ExecutionEvent::PollAgain,
                ))
                .on(K::PollAgain, X::to(S::PollingResults)),
        )
        .state(
            X::atomic(S::FetchResults)
                .on_entry(|s| inform(s, RunPhase::Fetching))
                .invoke(Invocation::<X>::future(
                    "fetch",
                    |ctx: &ExecutionContext, _| {
                        let executor = Arc::clone(&ctx.executor);
                        let token = ctx.token.clone();
                        async move {
                            match token {
                                Some(token) => executor.fetch_result(&token).await,
                                None => Err(ExecutorError::UnknownRun("missing token".to_string())),
                            }
                        }
                    },
                    ExecutionEvent::Fetched,
                    ExecutionEvent::FetchFailed,
                ))
                .on(K::Fetched, X::to(S::Complete).action(store_result))
                .on(K::FetchFailed, X::to(S::ErrorFetch).action(store_error)),
        )
        .state(
            X::atomic(S::Complete)
                .on_entry(|s| inform(s, RunPhase::Complete))
                .on(K::Execute, X::to(S::WaitForExecute).action(store_request))
                .on(K::Retry, X::to(S::WaitForExecute)),
        )
        .state(
            X::atomic(S::Cancelling)
                .on_entry(|s| inform(s, RunPhase::Cancelling))
                .invoke(Invocation::<X>::future(
                    "cancel",
                    |ctx: &ExecutionContext, _| {
                        let executor = Arc::clone(&ctx.executor);
                        let token = ctx.token.clone();
                        async move {
                            let Some(token) = token else {
                                return Ok(PollResponse::status(ExecutionStatus::Cancelled));
                            };
                            if let Err(e) = executor.cancel(&token).await {
                                tracing::warn!(run = %token, error = %e, "Cancel request failed");
                            }
                            executor.poll(&token).await
                        }
                    },
                    ExecutionEvent::CancelSettled,
                    |_: ExecutorError| {
                        ExecutionEvent::CancelSettled(PollResponse::status(ExecutionStatus::Cancelled))
                    },
                ))
                .on(
                    K::CancelSettled,
                    X::to(S::FetchResults)
                        .guard(reported(ExecutionStatus::Finished))
                        .action(store_status),
                )
                .on(K::CancelSettled, X::to(S::Cancelled).action(store_status)),
        )
        .state(
            X::atomic(S::Cancelled)
                .on_entry(|s| {
                    s.ctx.status = Some(ExecutionStatus::Cancelled);
                    inform(s, RunPhase::Cancelled);
                })
                .invoke(Invocation::<X>::after(
                    "cancel-cooldown",
                    |ctx: &ExecutionContext| ctx.config.cooldown(),
                    ExecutionEvent::CooldownElapsed,
                ))
                .on(K::CooldownElapsed, X::to(S::Idle))
                .on(K::Execute, X::to(S::WaitForExecute).action(store_request))
                .on(K::Retry, X::to(S::WaitForExecute).guard(has_request)),
        )
        .state(
            X::compound(S::Error, S::ErrorExecution)
                .on_entry(|s| inform(s, RunPhase::Failed))
                .invoke(Invocation::<X>::after(
                    "error-cooldown",
                    |ctx: &ExecutionContext| ctx.config.cooldown(),
                    ExecutionEvent::CooldownElapsed,
                ))
                .on(K::CooldownElapsed, X::to(S::Idle))
                .on(K::Execute, X::to(S::WaitForExecute).action(store_request))
                .on(K::Retry, X::to(S::WaitForExecute).guard(has_request)),
        )
        .state(X::atomic(S::ErrorSubmit).child_of(S::Error))
        .state(X::atomic(S::ErrorPoll).child_of(S::Error))
        .state(X::atomic(S::ErrorFetch).child_of(S::Error))
        .state(X::atomic(S::ErrorExecution).child_of(S::Error))
        .build()
}

// ============================================================================
// ExecutionActor
// ============================================================================

#[derive(Debug, Default)]
pub struct ExecutionActor;

pub struct ExecutionArguments {
    /// What this actor runs for, used in logs
    pub label: String,
    pub executor: Arc<dyn QueryExecutor>,
    pub config: ExecutionConfig,
    pub notify: Option<Notifier<ExecutionUpdate>>,
}

pub struct ExecutionActorState {
    label: String,
    interpreter: Interpreter<ExecutionMachine>,
    notify: Option<Notifier<ExecutionUpdate>>,
}

/// Read-only view of the current run
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionSnapshot {
    /// Innermost active state
    pub state: ExecutionState,
    pub run: Option<ExecutionRun>,
    pub error: Option<String>,
}

impl ExecutionSnapshot {
    pub fn is_error(&self) -> bool {
        matches!(
            self.state,
            ExecutionState::ErrorSubmit
                | ExecutionState::ErrorPoll
                | ExecutionState::ErrorFetch
                | ExecutionState::ErrorExecution
        )
    }
}

#[derive(Debug)]
pub enum ExecutionMsg {
    Execute(ExecutionRequest),
    /// Run the last request again
    Retry,
    Cancel,
    Service(Delivery<ExecutionEvent>),
    GetSnapshot(RpcReplyPort<ExecutionSnapshot>),
}

#[async_trait]
impl Actor for ExecutionActor {
    type Msg = ExecutionMsg;
    type State = ExecutionActorState;
    type Arguments = ExecutionArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            actor_id = %myself.get_id(),
            label = %args.label,
            "ExecutionActor starting"
        );

        let context = ExecutionContext {
            executor: args.executor,
            request: None,
            token: None,
            status: None,
            result: None,
            error: None,
            config: args.config,
        };
        let mut interpreter = Interpreter::new(
            Arc::new(definition()?),
            context,
            actor_sink(&myself, ExecutionMsg::Service),
        );
        let commands = interpreter.start();

        let state = ExecutionActorState {
            label: args.label,
            interpreter,
            notify: args.notify,
        };
        self.run_commands(commands, &state);
        Ok(state)
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let commands = match message {
            ExecutionMsg::Execute(request) => {
                tracing::debug!(label = %state.label, "Execution requested");
                state.interpreter.send(ExecutionEvent::Execute(request))
            }
            ExecutionMsg::Retry => state.interpreter.send(ExecutionEvent::Retry),
            ExecutionMsg::Cancel => {
                tracing::debug!(label = %state.label, "Cancellation requested");
                state.interpreter.send(ExecutionEvent::Cancel)
            }
            ExecutionMsg::Service(delivery) => state.interpreter.deliver(delivery),
            ExecutionMsg::GetSnapshot(reply) => {
                let _ = reply.send(self.snapshot(state));
                return Ok(());
            }
        };
        self.run_commands(commands, state);
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.interpreter.stop();
        tracing::info!(
            actor_id = %myself.get_id(),
            label = %state.label,
            "ExecutionActor stopped"
        );
        Ok(())
    }
}

impl ExecutionActor {
    fn run_commands(&self, commands: Vec<ExecutionCommand>, state: &ExecutionActorState) {
        for command in commands {
            match command {
                ExecutionCommand::InformParent(update) => {
                    if update.phase == RunPhase::Failed {
                        tracing::warn!(
                            label = %state.label,
                            error = ?update.error,
                            "Execution failed"
                        );
                    }
                    if let Some(notify) = &state.notify {
                        notify(update);
                    }
                }
            }
        }
    }

    fn snapshot(&self, state: &ExecutionActorState) -> ExecutionSnapshot {
        let ctx = state.interpreter.context();
        let run = match (&ctx.token, ctx.status) {
            (Some(token), Some(status)) => Some(ExecutionRun {
                id: token.0.clone(),
                status,
                result: ctx.result.clone(),
            }),
            _ => None,
        };
        ExecutionSnapshot {
            state: state
                .interpreter
                .active_states()
                .last()
                .copied()
                .unwrap_or(ExecutionState::Idle),
            run,
            error: ctx.error.clone(),
        }
    }
}

// ============================================================================
// Convenience functions
// ============================================================================

pub fn execute(
    actor: &ActorRef<ExecutionMsg>,
    request: ExecutionRequest,
) -> Result<(), ractor::RactorErr<ExecutionMsg>> {
    ractor::cast!(actor, ExecutionMsg::Execute(request))
}

pub fn cancel(actor: &ActorRef<ExecutionMsg>) -> Result<(), ractor::RactorErr<ExecutionMsg>> {
    ractor::cast!(actor, ExecutionMsg::Cancel)
}

pub async fn get_snapshot(
    actor: &ActorRef<ExecutionMsg>,
) -> Result<ExecutionSnapshot, ractor::RactorErr<ExecutionMsg>> {
    ractor::call!(actor, ExecutionMsg::GetSnapshot)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ExecutionSource, ScriptedExecutor};
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn request() -> ExecutionRequest {
        ExecutionRequest {
            source: ExecutionSource::Query {
                query_id: "q1".to_string(),
            },
            sql: "select 1".to_string(),
            parameters: BTreeMap::new(),
        }
    }

    async fn spawn_with(
        executor: &ScriptedExecutor,
        poll_interval_ms: u64,
    ) -> (
        ActorRef<ExecutionMsg>,
        mpsc::UnboundedReceiver<ExecutionUpdate>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let notify: Notifier<ExecutionUpdate> = Arc::new(move |update: ExecutionUpdate| {
            let _ = tx.send(update);
        });
        let (actor, _handle) = Actor::spawn(
            None,
            ExecutionActor,
            ExecutionArguments {
                label: "test".to_string(),
                executor: Arc::new(executor.clone()),
                config: ExecutionConfig {
                    grace_ms: 20,
                    poll_interval_ms,
                    cooldown_ms: 300,
                },
                notify: Some(notify),
            },
        )
        .await
        .unwrap();
        (actor, rx)
    }

    fn phases(rx: &mut mpsc::UnboundedReceiver<ExecutionUpdate>) -> Vec<RunPhase> {
        let mut phases = Vec::new();
        while let Ok(update) = rx.try_recv() {
            phases.push(update.phase);
        }
        phases
    }

    #[test]
    fn test_definition_builds() {
        let definition = definition().unwrap();
        assert!(definition.contains(ExecutionState::ErrorFetch));
    }

    #[tokio::test]
    async fn test_run_reaches_complete() {
        let executor = ScriptedExecutor::new();
        executor
            .script(vec![
                PollResponse::status(ExecutionStatus::Running),
                PollResponse::status(ExecutionStatus::Finished),
            ])
            .await;
        executor
            .set_result(QueryResult {
                columns: vec!["n".to_string()],
                rows: vec![vec![serde_json::json!(1)]],
            })
            .await;
        let (actor, mut rx) = spawn_with(&executor, 20).await;

        execute(&actor, request()).unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        let snapshot = get_snapshot(&actor).await.unwrap();
        assert_eq!(snapshot.state, ExecutionState::Complete);
        let run = snapshot.run.unwrap();
        assert_eq!(run.status, ExecutionStatus::Finished);
        assert_eq!(run.result.unwrap().columns, vec!["n".to_string()]);
        assert_eq!(executor.poll_count(), 2);

        assert_eq!(
            phases(&mut rx),
            vec![
                RunPhase::Waiting,
                RunPhase::Submitting,
                RunPhase::Running,
                RunPhase::Fetching,
                RunPhase::Complete,
            ]
        );

        actor.stop(None);
    }

    #[tokio::test]
    async fn test_failed_run_reaches_error() {
        let executor = ScriptedExecutor::new();
        executor
            .script(vec![PollResponse::failed("syntax error at or near \"selec\"")])
            .await;
        let (actor, mut rx) = spawn_with(&executor, 20).await;

        execute(&actor, request()).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let snapshot = get_snapshot(&actor).await.unwrap();
        assert_eq!(snapshot.state, ExecutionState::ErrorExecution);
        assert!(snapshot.is_error());
        assert!(snapshot.error.unwrap().contains("syntax error"));
        assert_eq!(phases(&mut rx).last(), Some(&RunPhase::Failed));

        // Falls back to idle after the cooldown
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(
            get_snapshot(&actor).await.unwrap().state,
            ExecutionState::Idle
        );

        actor.stop(None);
    }

    #[tokio::test]
    async fn test_cancel_loses_race_to_finished_run() {
        let executor = ScriptedExecutor::new();
        executor.set_honor_cancel(false);
        executor
            .script(vec![
                PollResponse::status(ExecutionStatus::Running),
                PollResponse::status(ExecutionStatus::Finished),
            ])
            .await;
        let (actor, _rx) = spawn_with(&executor, 1000).await;

        execute(&actor, request()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            get_snapshot(&actor).await.unwrap().state,
            ExecutionState::Waiting
        );

        cancel(&actor).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let snapshot = get_snapshot(&actor).await.unwrap();
        assert_eq!(snapshot.state, ExecutionState::Complete);
        assert_eq!(executor.cancels().await.len(), 1);

        actor.stop(None);
    }

    #[tokio::test]
    async fn test_cancel_honored_by_server() {
        let executor = ScriptedExecutor::new();
        executor
            .script(vec![PollResponse::status(ExecutionStatus::Running)])
            .await;
        let (actor, mut rx) = spawn_with(&executor, 1000).await;

        execute(&actor, request()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel(&actor).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let snapshot = get_snapshot(&actor).await.unwrap();
        assert_eq!(snapshot.state, ExecutionState::Cancelled);
        assert_eq!(snapshot.run.unwrap().status, ExecutionStatus::Cancelled);
        let phases = phases(&mut rx);
        assert_eq!(
            &phases[phases.len() - 2..],
            &[RunPhase::Cancelling, RunPhase::Cancelled]
        );

        actor.stop(None);
    }

    #[tokio::test]
    async fn test_retry_after_submit_failure() {
        let executor = ScriptedExecutor::new();
        executor
            .fail_next_submit(ExecutorError::Transport("offline".to_string()))
            .await;
        let (actor, _rx) = spawn_with(&executor, 20).await;

        execute(&actor, request()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            get_snapshot(&actor).await.unwrap().state,
            ExecutionState::ErrorSubmit
        );

        ractor::cast!(actor, ExecutionMsg::Retry).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let snapshot = get_snapshot(&actor).await.unwrap();
        assert_eq!(snapshot.state, ExecutionState::Complete);
        assert!(snapshot.error.is_none());
        assert_eq!(executor.submissions().await.len(), 2);

        actor.stop(None);
    }

    #[tokio::test]
    async fn test_execute_during_grace_keeps_latest_request() {
        let executor = ScriptedExecutor::new();
        let (actor, _rx) = spawn_with(&executor, 20).await;

        execute(&actor, request()).unwrap();
        let mut newer = request();
        newer.sql = "select 2".to_string();
        execute(&actor, newer).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let submissions = executor.submissions().await;
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].sql, "select 2");

        actor.stop(None);
    }
}
