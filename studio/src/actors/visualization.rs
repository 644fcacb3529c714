//! VisualizationActor - a saved chart bound to a query
//!
//! Registered as `visualization-<id>`. Keeps a denormalized copy of its
//! source query's title, refreshed from `QUERY.UPDATED` broadcasts, and
//! flags the source as missing when the query's work item is deleted.

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort, SupervisionEvent};
use serde_json::Value;
use shared_types::{ResourceRef, Visualization};
use std::sync::Arc;

use crate::actors::event_bus::{subscribe, unsubscribe_owner, BusEvent, EventSubscriber};
use crate::actors::persistence::{
    self, PersistenceActor, PersistenceArguments, PersistenceMsg, PersistenceUpdate, SaveStatus,
};
use crate::backend::{ResourcePayload, ResourceStore};
use crate::directory::{keys, RegistrationToken};
use crate::machine::notifier;
use crate::services::SessionServices;

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum VisualizationError {
    #[error("Title must not be empty")]
    InvalidTitle,

    #[error("Visualization unavailable: {0}")]
    Unavailable(String),
}

/// What the visualization knows about its source query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceQuery {
    pub query_id: Option<String>,
    pub title: Option<String>,
    pub missing: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VisualizationSnapshot {
    pub visualization: Visualization,
    pub source: SourceQuery,
    pub save_status: SaveStatus,
}

#[derive(Debug, Default)]
pub struct VisualizationActor;

pub struct VisualizationArguments {
    pub visualization: Visualization,
    pub services: SessionServices,
}

pub struct VisualizationState {
    visualization: Visualization,
    services: SessionServices,
    persistence: ActorRef<PersistenceMsg>,
    registration: RegistrationToken,
    source: SourceQuery,
    save_status: SaveStatus,
}

#[derive(Debug)]
pub enum VisualizationMsg {
    Rename {
        title: String,
        reply: RpcReplyPort<Result<(), VisualizationError>>,
    },
    UpdateConfig(Value),
    SetQuery(Option<String>),
    Retry,
    GetSnapshot(RpcReplyPort<VisualizationSnapshot>),

    Bus(BusEvent),
    Persistence(PersistenceUpdate),
}

/// Resolve the current title of a query, `None` when it no longer exists
async fn query_title(store: &Arc<dyn ResourceStore>, query_id: &str) -> Option<String> {
    match store.fetch(&ResourceRef::query(query_id)).await {
        Ok(ResourcePayload::Query(query)) => Some(query.title),
        Ok(_) => None,
        Err(e) => {
            tracing::debug!(query_id = %query_id, error = %e, "Source query not found");
            None
        }
    }
}

async fn resolve_source(store: &Arc<dyn ResourceStore>, query_id: Option<String>) -> SourceQuery {
    let Some(query_id) = query_id else {
        return SourceQuery::default();
    };
    let title = query_title(store, &query_id).await;
    SourceQuery {
        missing: title.is_none(),
        query_id: Some(query_id),
        title,
    }
}

#[async_trait]
impl Actor for VisualizationActor {
    type Msg = VisualizationMsg;
    type State = VisualizationState;
    type Arguments = VisualizationArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let VisualizationArguments {
            visualization,
            services,
        } = args;
        tracing::info!(
            actor_id = %myself.get_id(),
            visualization_id = %visualization.id,
            "VisualizationActor starting"
        );

        // Events about the source query matter too, and the source can
        // change, so filtering happens in the handler
        let bus = services.event_bus();
        for topic in ["work_item.*", "query.updated"] {
            subscribe(
                bus,
                topic,
                None,
                EventSubscriber::new(&myself, VisualizationMsg::Bus),
            )
            .await?;
        }

        let (persistence, _) = Actor::spawn_linked(
            None,
            PersistenceActor,
            PersistenceArguments {
                resource: ResourceRef::visualization(visualization.id.clone()),
                version: visualization.updated_at,
                store: services.store(),
                event_bus: Some(services.event_bus().clone()),
                notify: Some(notifier(&myself, VisualizationMsg::Persistence)),
                config: services.config().persistence.clone(),
            },
            myself.get_cell(),
        )
        .await?;

        let source = resolve_source(&services.store(), visualization.query_id.clone()).await;
        let registration = services
            .directory()
            .register(&myself, keys::visualization(&visualization.id));

        Ok(VisualizationState {
            visualization,
            services,
            persistence,
            registration,
            source,
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
            VisualizationMsg::Rename { title, reply } => {
                let title = title.trim().to_string();
                let result = if title.is_empty() {
                    Err(VisualizationError::InvalidTitle)
                } else {
                    if title != state.visualization.title {
                        state.visualization.title = title;
                        self.persist(state);
                        self.announce(state);
                    }
                    Ok(())
                };
                let _ = reply.send(result);
            }
            VisualizationMsg::UpdateConfig(config) => {
                state.visualization.config = config;
                self.persist(state);
            }
            VisualizationMsg::SetQuery(query_id) => {
                if query_id != state.visualization.query_id {
                    state.source = resolve_source(&state.services.store(), query_id.clone()).await;
                    state.visualization.query_id = query_id;
                    self.persist(state);
                }
            }
            VisualizationMsg::Retry => {
                persistence::retry(&state.persistence)?;
            }
            VisualizationMsg::GetSnapshot(reply) => {
                let _ = reply.send(VisualizationSnapshot {
                    visualization: state.visualization.clone(),
                    source: state.source.clone(),
                    save_status: state.save_status,
                });
            }
            VisualizationMsg::Bus(event) => self.handle_bus(&myself, state, event),
            VisualizationMsg::Persistence(update) => match update {
                PersistenceUpdate::Status(status) => state.save_status = status,
                PersistenceUpdate::Saved(saved) => {
                    state.visualization.updated_at = Some(saved.updated_at);
                }
                PersistenceUpdate::Failed(error) => {
                    tracing::warn!(
                        visualization_id = %state.visualization.id,
                        error = %error,
                        "Visualization save failed"
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
        if let SupervisionEvent::ActorFailed(actor_cell, error) = message {
            tracing::error!(
                visualization_id = %state.visualization.id,
                child = %actor_cell.get_id(),
                error = %error,
                "Visualization child failed"
            );
            return Err(format!("visualization child {} failed: {error}", actor_cell.get_id()).into());
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        tracing::info!(visualization_id = %state.visualization.id, "VisualizationActor stopped");
        state.persistence.stop(None);
        let _ = unsubscribe_owner(state.services.event_bus(), myself.get_id());
        state.services.directory().release(&state.registration);
        Ok(())
    }
}

impl VisualizationActor {
    fn persist(&self, state: &VisualizationState) {
        if let Err(e) = persistence::persist(&state.persistence, &state.visualization) {
            tracing::warn!(
                visualization_id = %state.visualization.id,
                error = %e,
                "Persistence child unavailable"
            );
        }
    }

    fn announce(&self, state: &VisualizationState) {
        state.services.publish(BusEvent::VisualizationUpdated {
            visualization_id: state.visualization.id.clone(),
            title: state.visualization.title.clone(),
        });
    }

    fn handle_bus(
        &self,
        myself: &ActorRef<VisualizationMsg>,
        state: &mut VisualizationState,
        event: BusEvent,
    ) {
        let correlation = event.correlation();
        let about_me =
            correlation.is_about(&ResourceRef::visualization(state.visualization.id.clone()));
        let about_source = state
            .source
            .query_id
            .as_ref()
            .is_some_and(|id| correlation.is_about(&ResourceRef::query(id.clone())));
        if !about_me && !about_source {
            return;
        }

        match event {
            BusEvent::QueryUpdated { title, .. } => {
                state.source.title = Some(title);
                state.source.missing = false;
            }
            BusEvent::WorkItemDeleted { .. } if about_source => {
                tracing::info!(
                    visualization_id = %state.visualization.id,
                    "Source query deleted"
                );
                state.source.missing = true;
            }
            BusEvent::WorkItemRenamed { title, .. } if about_me => {
                state.visualization.title = title;
            }
            BusEvent::WorkItemDeleted { .. } => {
                tracing::info!(visualization_id = %state.visualization.id, "Visualization deleted, stopping");
                myself.stop(Some("deleted".to_string()));
            }
            _ => {}
        }
    }
}

// ============================================================================
// Convenience functions
// ============================================================================

pub async fn rename_visualization(
    actor: &ActorRef<VisualizationMsg>,
    title: impl Into<String>,
) -> Result<(), VisualizationError> {
    let title = title.into();
    ractor::call!(actor, |reply| VisualizationMsg::Rename { title, reply })
        .map_err(|e| VisualizationError::Unavailable(e.to_string()))?
}

pub async fn get_snapshot(
    actor: &ActorRef<VisualizationMsg>,
) -> Result<VisualizationSnapshot, VisualizationError> {
    ractor::call!(actor, VisualizationMsg::GetSnapshot)
        .map_err(|e| VisualizationError::Unavailable(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InMemoryStore, ScriptedExecutor};
    use crate::services::testing::services;
    use shared_types::{Query, ResourceKind};
    use std::time::Duration;

    fn chart(query_id: Option<&str>) -> Visualization {
        Visualization {
            id: "v1".to_string(),
            title: "Revenue chart".to_string(),
            query_id: query_id.map(str::to_string),
            config: Value::Null,
            updated_at: None,
        }
    }

    async fn open(
        store: &InMemoryStore,
        visualization: Visualization,
    ) -> (ActorRef<VisualizationMsg>, SessionServices) {
        let services = services(store, &ScriptedExecutor::new()).await;
        let (actor, _handle) = Actor::spawn(
            None,
            VisualizationActor,
            VisualizationArguments {
                visualization,
                services: services.clone(),
            },
        )
        .await
        .unwrap();
        (actor, services)
    }

    #[tokio::test]
    async fn test_source_title_resolved_and_followed() {
        let store = InMemoryStore::new();
        store.seed(ResourcePayload::Query(Query::new("q1", "Sales", "select 1")));
        let (actor, services) = open(&store, chart(Some("q1"))).await;

        let snapshot = get_snapshot(&actor).await.unwrap();
        assert_eq!(snapshot.source.title.as_deref(), Some("Sales"));
        assert!(!snapshot.source.missing);

        services.publish(BusEvent::QueryUpdated {
            query_id: "q2".to_string(),
            title: "Unrelated".to_string(),
            sql: String::new(),
        });
        services.publish(BusEvent::QueryUpdated {
            query_id: "q1".to_string(),
            title: "Net sales".to_string(),
            sql: "select 1".to_string(),
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snapshot = get_snapshot(&actor).await.unwrap();
        assert_eq!(snapshot.source.title.as_deref(), Some("Net sales"));

        actor.stop(None);
    }

    #[tokio::test]
    async fn test_source_deletion_marks_query_missing() {
        let store = InMemoryStore::new();
        store.seed(ResourcePayload::Query(Query::new("q1", "Sales", "select 1")));
        let (actor, services) = open(&store, chart(Some("q1"))).await;

        services.publish(BusEvent::WorkItemDeleted {
            kind: ResourceKind::Query,
            id: "q1".to_string(),
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snapshot = get_snapshot(&actor).await.unwrap();
        assert!(snapshot.source.missing);
        assert_eq!(actor.get_status(), ractor::ActorStatus::Running);

        actor.stop(None);
    }

    #[tokio::test]
    async fn test_unknown_source_is_missing() {
        let store = InMemoryStore::new();
        let (actor, _services) = open(&store, chart(Some("gone"))).await;

        assert!(get_snapshot(&actor).await.unwrap().source.missing);

        actor.stop(None);
    }

    #[tokio::test]
    async fn test_rename_announces_and_saves() {
        let store = InMemoryStore::new();
        let (actor, services) = open(&store, chart(None)).await;

        rename_visualization(&actor, "Quarterly revenue").await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        let history = crate::actors::event_bus::get_history(services.event_bus(), "visualization.updated", 10)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(
            store.writes_for(&ResourceRef::visualization("v1")).await.len(),
            1
        );

        actor.stop(None);
    }
}
