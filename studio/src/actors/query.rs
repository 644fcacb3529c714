//! QueryActor - a saved query and its run
//!
//! Registered as `query-<id>`. Owns two children: a persistence actor for the
//! query record and an execution actor registered as `queryRun-<id>`, whose
//! progress is mirrored into the query snapshot and broadcast as
//! `QUERY.RUN_STATUS`.

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort, SupervisionEvent};
use shared_types::{Query, QueryResult, ResourceRef};
use std::collections::BTreeMap;

use crate::actors::event_bus::{
    subscribe, unsubscribe_owner, BusEvent, EventSubscriber, RunPhase,
};
use crate::actors::execution::{ExecutionActor, ExecutionArguments, ExecutionMsg, ExecutionUpdate};
use crate::actors::persistence::{
    self, PersistenceActor, PersistenceArguments, PersistenceMsg, PersistenceUpdate, SaveStatus,
};
use crate::backend::{ExecutionRequest, ExecutionSource};
use crate::directory::{keys, RegistrationToken};
use crate::machine::notifier;
use crate::services::SessionServices;

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum QueryError {
    #[error("Title must not be empty")]
    InvalidTitle,

    #[error("Query has no SQL to run")]
    EmptySql,

    #[error("Query not found: {0}")]
    NotFound(String),

    #[error("Query unavailable: {0}")]
    Unavailable(String),
}

/// Last known state of the query's run, as reported by the execution child
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunView {
    pub phase: Option<RunPhase>,
    pub run_id: Option<String>,
    pub result: Option<QueryResult>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuerySnapshot {
    pub query: Query,
    pub run: RunView,
    pub save_status: SaveStatus,
}

#[derive(Debug, Default)]
pub struct QueryActor;

pub struct QueryArguments {
    pub query: Query,
    pub services: SessionServices,
}

pub struct QueryState {
    query: Query,
    services: SessionServices,
    persistence: ActorRef<PersistenceMsg>,
    execution: ActorRef<ExecutionMsg>,
    registrations: Vec<RegistrationToken>,
    run: RunView,
    save_status: SaveStatus,
}

#[derive(Debug)]
pub enum QueryMsg {
    UpdateSql(String),
    Rename {
        title: String,
        reply: RpcReplyPort<Result<(), QueryError>>,
    },
    Execute {
        parameters: BTreeMap<String, serde_json::Value>,
        reply: RpcReplyPort<Result<(), QueryError>>,
    },
    Cancel,
    /// Retry whatever failed last: the save, the run, or both
    Retry,
    GetSnapshot(RpcReplyPort<QuerySnapshot>),

    Execution(ExecutionUpdate),
    Persistence(PersistenceUpdate),
    Bus(BusEvent),
}

#[async_trait]
impl Actor for QueryActor {
    type Msg = QueryMsg;
    type State = QueryState;
    type Arguments = QueryArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let QueryArguments { query, services } = args;
        tracing::info!(
            actor_id = %myself.get_id(),
            query_id = %query.id,
            "QueryActor starting"
        );

        subscribe(
            services.event_bus(),
            "work_item.*",
            Some(ResourceRef::query(query.id.clone())),
            EventSubscriber::new(&myself, QueryMsg::Bus),
        )
        .await?;

        let (persistence, _) = Actor::spawn_linked(
            None,
            PersistenceActor,
            PersistenceArguments {
                resource: ResourceRef::query(query.id.clone()),
                version: query.updated_at,
                store: services.store(),
                event_bus: Some(services.event_bus().clone()),
                notify: Some(notifier(&myself, QueryMsg::Persistence)),
                config: services.config().persistence.clone(),
            },
            myself.get_cell(),
        )
        .await?;

        let (execution, _) = Actor::spawn_linked(
            None,
            ExecutionActor,
            ExecutionArguments {
                label: format!("query:{}", query.id),
                executor: services.executor(),
                config: services.config().execution.clone(),
                notify: Some(notifier(&myself, QueryMsg::Execution)),
            },
            myself.get_cell(),
        )
        .await?;

        let directory = services.directory();
        let registrations = vec![
            directory.register(&myself, keys::query(&query.id)),
            directory.register(&execution, keys::query_run(&query.id)),
        ];

        Ok(QueryState {
            query,
            services,
            persistence,
            execution,
            registrations,
            run: RunView::default(),
            save_status: SaveStatus::Idle,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            QueryMsg::UpdateSql(sql) => {
                if sql != state.query.sql {
                    state.query.sql = sql;
                    self.saved_locally(state);
                }
            }
            QueryMsg::Rename { title, reply } => {
                let title = title.trim().to_string();
                let result = if title.is_empty() {
                    Err(QueryError::InvalidTitle)
                } else {
                    if title != state.query.title {
                        state.query.title = title;
                        self.saved_locally(state);
                    }
                    Ok(())
                };
                let _ = reply.send(result);
            }
            QueryMsg::Execute { parameters, reply } => {
                let result = if state.query.sql.trim().is_empty() {
                    Err(QueryError::EmptySql)
                } else {
                    let request = ExecutionRequest {
                        source: ExecutionSource::Query {
                            query_id: state.query.id.clone(),
                        },
                        sql: state.query.sql.clone(),
                        parameters,
                    };
                    state
                        .execution
                        .cast(ExecutionMsg::Execute(request))
                        .map_err(|e| QueryError::Unavailable(e.to_string()))
                };
                let _ = reply.send(result);
            }
            QueryMsg::Cancel => {
                state.execution.cast(ExecutionMsg::Cancel)?;
            }
            QueryMsg::Retry => {
                if matches!(state.save_status, SaveStatus::Failed | SaveStatus::Conflict) {
                    persistence::retry(&state.persistence)?;
                }
                if state.run.phase == Some(RunPhase::Failed) {
                    state.execution.cast(ExecutionMsg::Retry)?;
                }
            }
            QueryMsg::GetSnapshot(reply) => {
                let _ = reply.send(QuerySnapshot {
                    query: state.query.clone(),
                    run: state.run.clone(),
                    save_status: state.save_status,
                });
            }
            QueryMsg::Execution(update) => {
                if update.run_id.is_some() {
                    state.run.run_id = update.run_id.clone();
                }
                state.run.phase = Some(update.phase);
                match update.phase {
                    RunPhase::Submitting => {
                        state.run.result = None;
                        state.run.error = None;
                    }
                    RunPhase::Complete => state.run.result = update.result,
                    RunPhase::Failed => state.run.error = update.error,
                    _ => {}
                }
                state.services.publish(BusEvent::QueryRunStatus {
                    query_id: state.query.id.clone(),
                    phase: update.phase,
                    run_id: state.run.run_id.clone(),
                });
            }
            QueryMsg::Persistence(update) => match update {
                PersistenceUpdate::Status(status) => state.save_status = status,
                PersistenceUpdate::Saved(saved) => state.query.updated_at = Some(saved.updated_at),
                PersistenceUpdate::Failed(error) => {
                    tracing::warn!(query_id = %state.query.id, error = %error, "Query save failed");
                }
            },
            QueryMsg::Bus(event) => {
                let me = ResourceRef::query(state.query.id.clone());
                if !event.correlation().is_about(&me) {
                    return Ok(());
                }
                match event {
                    BusEvent::WorkItemRenamed { title, .. } => {
                        state.query.title = title;
                        // Cards showing this query only listen for query events
                        self.announce(state);
                    }
                    BusEvent::WorkItemDeleted { .. } => {
                        tracing::info!(query_id = %state.query.id, "Query deleted, stopping");
                        myself.stop(Some("deleted".to_string()));
                    }
                    _ => {}
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
                tracing::error!(
                    query_id = %state.query.id,
                    child = %actor_cell.get_id(),
                    error = %error,
                    "Query child failed"
                );
                return Err(format!("query child {} failed: {error}", actor_cell.get_id()).into());
            }
            SupervisionEvent::ActorTerminated(actor_cell, _, reason) => {
                tracing::debug!(
                    query_id = %state.query.id,
                    child = %actor_cell.get_id(),
                    reason = ?reason,
                    "Query child terminated"
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
        tracing::info!(query_id = %state.query.id, "QueryActor stopped");
        state.persistence.stop(None);
        state.execution.stop(None);
        let _ = unsubscribe_owner(state.services.event_bus(), myself.get_id());
        for token in &state.registrations {
            state.services.directory().release(token);
        }
        Ok(())
    }
}

impl QueryActor {
    fn saved_locally(&self, state: &QueryState) {
        if let Err(e) = persistence::persist(&state.persistence, &state.query) {
            tracing::warn!(query_id = %state.query.id, error = %e, "Persistence child unavailable");
        }
        self.announce(state);
    }

    fn announce(&self, state: &QueryState) {
        state.services.publish(BusEvent::QueryUpdated {
            query_id: state.query.id.clone(),
            title: state.query.title.clone(),
            sql: state.query.sql.clone(),
        });
    }
}

// ============================================================================
// Convenience functions
// ============================================================================

fn unavailable<E: std::fmt::Display>(e: E) -> QueryError {
    QueryError::Unavailable(e.to_string())
}

pub fn update_sql(
    actor: &ActorRef<QueryMsg>,
    sql: impl Into<String>,
) -> Result<(), ractor::RactorErr<QueryMsg>> {
    ractor::cast!(actor, QueryMsg::UpdateSql(sql.into()))
}

pub async fn rename_query(
    actor: &ActorRef<QueryMsg>,
    title: impl Into<String>,
) -> Result<(), QueryError> {
    let title = title.into();
    ractor::call!(actor, |reply| QueryMsg::Rename { title, reply }).map_err(unavailable)?
}

pub async fn execute_query(
    actor: &ActorRef<QueryMsg>,
    parameters: BTreeMap<String, serde_json::Value>,
) -> Result<(), QueryError> {
    ractor::call!(actor, |reply| QueryMsg::Execute { parameters, reply }).map_err(unavailable)?
}

pub async fn get_snapshot(actor: &ActorRef<QueryMsg>) -> Result<QuerySnapshot, QueryError> {
    ractor::call!(actor, QueryMsg::GetSnapshot).map_err(unavailable)
}
