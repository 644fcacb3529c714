//! QueriesActor - opens saved queries and runs throwaway ones
//!
//! Registered as `queries`. Saved queries get a supervised `QueryActor`
//! loaded from the store; a query actor that fails is reloaded from its last
//! saved record. Ephemeral runs (SQL typed into a scratch editor) get an
//! `ExecutionActor` that is stopped once the run settles.

use async_trait::async_trait;
use ractor::{Actor, ActorId, ActorProcessingErr, ActorRef, RpcReplyPort, SupervisionEvent};
use serde_json::Value;
use shared_types::{new_id, ResourceRef};
use std::collections::{BTreeMap, HashMap};

use super::execution::{ExecutionActor, ExecutionArguments, ExecutionMsg, ExecutionUpdate};
use super::query::{QueryActor, QueryArguments, QueryError, QueryMsg};
use crate::backend::{ExecutionRequest, ExecutionSource, ResourcePayload, StoreError};
use crate::machine::Notifier;
use crate::services::SessionServices;

#[derive(Debug, Default)]
pub struct QueriesActor;

pub struct QueriesArguments {
    pub services: SessionServices,
}

pub struct QueriesState {
    services: SessionServices,
    open: HashMap<String, ActorRef<QueryMsg>>,
    ephemeral: HashMap<String, ActorRef<ExecutionMsg>>,
}

pub enum QueriesMsg {
    /// Open a saved query, or return the already-open actor
    Open {
        query_id: String,
        reply: RpcReplyPort<Result<ActorRef<QueryMsg>, QueryError>>,
    },
    Close { query_id: String },
    ListOpen(RpcReplyPort<Vec<String>>),
    /// Run SQL that is not saved anywhere. Progress goes to `notify`; the
    /// reply carries the run key.
    RunEphemeral {
        sql: String,
        parameters: BTreeMap<String, Value>,
        notify: Notifier<ExecutionUpdate>,
        reply: RpcReplyPort<Result<String, QueryError>>,
    },
    EphemeralSettled { key: String },
}

impl std::fmt::Debug for QueriesMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueriesMsg::Open { query_id, .. } => {
                f.debug_struct("Open").field("query_id", query_id).finish_non_exhaustive()
            }
            QueriesMsg::Close { query_id } => f.debug_struct("Close").field("query_id", query_id).finish(),
            QueriesMsg::ListOpen(_) => f.write_str("ListOpen"),
            QueriesMsg::RunEphemeral { sql, parameters, .. } => f
                .debug_struct("RunEphemeral")
                .field("sql", sql)
                .field("parameters", parameters)
                .finish_non_exhaustive(),
            QueriesMsg::EphemeralSettled { key } => {
                f.debug_struct("EphemeralSettled").field("key", key).finish()
            }
        }
    }
}

#[async_trait]
impl Actor for QueriesActor {
    type Msg = QueriesMsg;
    type State = QueriesState;
    type Arguments = QueriesArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(actor_id = %myself.get_id(), "QueriesActor starting");
        Ok(QueriesState {
            services: args.services,
            open: HashMap::new(),
            ephemeral: HashMap::new(),
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            QueriesMsg::Open { query_id, reply } => {
                let result = self.open(&myself, state, query_id).await;
                let _ = reply.send(result);
            }
            QueriesMsg::Close { query_id } => {
                if let Some(actor) = state.open.remove(&query_id) {
                    tracing::info!(query_id = %query_id, "Closing query");
                    actor.stop(Some("closed".to_string()));
                }
            }
            QueriesMsg::ListOpen(reply) => {
                let mut ids: Vec<String> = state.open.keys().cloned().collect();
                ids.sort();
                let _ = reply.send(ids);
            }
            QueriesMsg::RunEphemeral {
                sql,
                parameters,
                notify,
                reply,
            } => {
                let result = self
                    .run_ephemeral(&myself, state, sql, parameters, notify)
                    .await;
                let _ = reply.send(result);
            }
            QueriesMsg::EphemeralSettled { key } => {
                if let Some(execution) = state.ephemeral.remove(&key) {
                    tracing::debug!(run_key = %key, "Ephemeral run settled");
                    execution.stop(None);
                }
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
                let Some(query_id) = find_query(state, actor_cell.get_id()) else {
                    tracing::warn!(actor_id = %actor_cell.get_id(), error = %error, "Ephemeral run failed");
                    state.ephemeral.retain(|_, e| e.get_id() != actor_cell.get_id());
                    return Ok(());
                };
                tracing::warn!(query_id = %query_id, error = %error, "Query actor failed, reloading");
                state.open.remove(&query_id);
                if let Err(e) = self.open(&myself, state, query_id.clone()).await {
                    tracing::error!(query_id = %query_id, error = %e, "Failed to reload query");
                }
            }
            SupervisionEvent::ActorTerminated(actor_cell, _, reason) => {
                // Deleted queries stop themselves
                if let Some(query_id) = find_query(state, actor_cell.get_id()) {
                    tracing::debug!(query_id = %query_id, reason = ?reason, "Query actor terminated");
                    state.open.remove(&query_id);
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
        for (_, actor) in state.open.drain() {
            actor.stop(None);
        }
        for (_, execution) in state.ephemeral.drain() {
            execution.stop(None);
        }
        Ok(())
    }
}

fn find_query(state: &QueriesState, actor_id: ActorId) -> Option<String> {
    state
        .open
        .iter()
        .find(|(_, actor)| actor.get_id() == actor_id)
        .map(|(id, _)| id.clone())
}

impl QueriesActor {
    async fn open(
        &self,
        myself: &ActorRef<QueriesMsg>,
        state: &mut QueriesState,
        query_id: String,
    ) -> Result<ActorRef<QueryMsg>, QueryError> {
        if let Some(actor) = state.open.get(&query_id) {
            return Ok(actor.clone());
        }

        let query = match state.services.store().fetch(&ResourceRef::query(query_id.clone())).await {
            Ok(ResourcePayload::Query(query)) => query,
            Ok(_) | Err(StoreError::NotFound(_)) => return Err(QueryError::NotFound(query_id)),
            Err(e) => return Err(QueryError::Unavailable(e.to_string())),
        };

        let (actor, _) = Actor::spawn_linked(
            None,
            QueryActor,
            QueryArguments {
                query,
                services: state.services.clone(),
            },
            myself.get_cell(),
        )
        .await
        .map_err(|e| QueryError::Unavailable(e.to_string()))?;

        tracing::info!(query_id = %query_id, actor_id = %actor.get_id(), "Query opened");
        state.open.insert(query_id, actor.clone());
        Ok(actor)
    }

    async fn run_ephemeral(
        &self,
        myself: &ActorRef<QueriesMsg>,
        state: &mut QueriesState,
        sql: String,
        parameters: BTreeMap<String, Value>,
        notify: Notifier<ExecutionUpdate>,
    ) -> Result<String, QueryError> {
        if sql.trim().is_empty() {
            return Err(QueryError::EmptySql);
        }
        let key = format!("ephemeral-{}", new_id());

        let manager = myself.clone();
        let settled_key = key.clone();
        let forward: Notifier<ExecutionUpdate> = std::sync::Arc::new(move |update: ExecutionUpdate| {
            let done = update.phase.is_settled();
            notify(update);
            if done {
                let _ = manager.cast(QueriesMsg::EphemeralSettled {
                    key: settled_key.clone(),
                });
            }
        });

        let (execution, _) = Actor::spawn_linked(
            None,
            ExecutionActor,
            ExecutionArguments {
                label: key.clone(),
                executor: state.services.executor(),
                config: state.services.config().execution.clone(),
                notify: Some(forward),
            },
            myself.get_cell(),
        )
        .await
        .map_err(|e| QueryError::Unavailable(e.to_string()))?;

        execution
            .cast(ExecutionMsg::Execute(ExecutionRequest {
                source: ExecutionSource::Query {
                    query_id: key.clone(),
                },
                sql,
                parameters,
            }))
            .map_err(|e| QueryError::Unavailable(e.to_string()))?;
        state.ephemeral.insert(key.clone(), execution);
        Ok(key)
    }
}

// ============================================================================
// Convenience functions
// ============================================================================

pub async fn open_query(
    queries: &ActorRef<QueriesMsg>,
    query_id: impl Into<String>,
) -> Result<ActorRef<QueryMsg>, QueryError> {
    let query_id = query_id.into();
    ractor::call!(queries, |reply| QueriesMsg::Open { query_id, reply })
        .map_err(|e| QueryError::Unavailable(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::event_bus::RunPhase;
    use crate::backend::{InMemoryStore, ScriptedExecutor};
    use crate::services::testing::services;
    use shared_types::Query;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn spawn_queries(store: &InMemoryStore, executor: &ScriptedExecutor) -> ActorRef<QueriesMsg> {
        let services = services(store, executor).await;
        let (actor, _handle) = Actor::spawn(None, QueriesActor, QueriesArguments { services })
            .await
            .unwrap();
        actor
    }

    #[tokio::test]
    async fn test_open_is_idempotent_and_unknown_ids_fail() {
        let store = InMemoryStore::new();
        store.seed(ResourcePayload::Query(Query::new("q1", "Sales", "select 1")));
        let queries = spawn_queries(&store, &ScriptedExecutor::new()).await;

        let first = open_query(&queries, "q1").await.unwrap();
        let second = open_query(&queries, "q1").await.unwrap();
        assert_eq!(first.get_id(), second.get_id());

        assert_eq!(
            open_query(&queries, "missing").await.unwrap_err(),
            QueryError::NotFound("missing".to_string())
        );

        queries.stop(None);
    }

    #[tokio::test]
    async fn test_closed_query_is_forgotten() {
        let store = InMemoryStore::new();
        store.seed(ResourcePayload::Query(Query::new("q1", "Sales", "select 1")));
        let queries = spawn_queries(&store, &ScriptedExecutor::new()).await;

        let actor = open_query(&queries, "q1").await.unwrap();
        ractor::cast!(queries, QueriesMsg::Close { query_id: "q1".to_string() }).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(actor.get_status(), ractor::ActorStatus::Stopped);
        assert!(ractor::call!(queries, QueriesMsg::ListOpen).unwrap().is_empty());

        queries.stop(None);
    }

    #[tokio::test]
    async fn test_ephemeral_run_reports_and_cleans_up() {
        let store = InMemoryStore::new();
        let executor = ScriptedExecutor::new();
        let queries = spawn_queries(&store, &executor).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let key = ractor::call!(queries, |reply| QueriesMsg::RunEphemeral {
            sql: "select 42".to_string(),
            parameters: BTreeMap::new(),
            notify: Arc::new(move |update: ExecutionUpdate| {
                let _ = tx.send(update.phase);
            }),
            reply,
        })
        .unwrap()
        .unwrap();
        assert!(key.starts_with("ephemeral-"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let mut phases = Vec::new();
        while let Ok(phase) = rx.try_recv() {
            phases.push(phase);
        }
        assert_eq!(phases.last(), Some(&RunPhase::Complete));
        assert_eq!(executor.submissions().await[0].sql, "select 42");

        queries.stop(None);
    }
}
