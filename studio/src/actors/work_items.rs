//! Work items - the file explorer tree
//!
//! `WorkItemsActor` (registered as `workItems`) owns the tree structure and
//! one `WorkItemActor` per entry, bulk-registered as
//! `workItem-<kind>-<id>`. Each item actor owns its title: it saves and
//! broadcasts explorer renames and moves, and follows renames made inside
//! the dashboard, query or visualization it points at without saving again.
//!
//! Deleting a folder cascades depth-first; every removed entry is announced
//! with its own `WORK_ITEM.DELETED` so open aggregates can shut down.

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort, SupervisionEvent};
use shared_types::{
    new_id, Dashboard, Query, ResourceKind, ResourceRef, Visualization, WorkItem,
};
use std::collections::BTreeMap;

use crate::actors::event_bus::{subscribe, unsubscribe_owner, BusEvent, EventSubscriber};
use crate::actors::persistence::{
    self, PersistenceActor, PersistenceArguments, PersistenceMsg, PersistenceUpdate, Persistable,
};
use crate::backend::ResourcePayload;
use crate::directory::{keys, RegistrationToken};
use crate::machine::notifier;
use crate::services::SessionServices;

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum WorkItemError {
    #[error("Title must not be empty")]
    InvalidTitle,

    #[error("Work item not found: {0}")]
    NotFound(ResourceRef),

    #[error("Parent is not a folder: {0}")]
    ParentNotFolder(String),

    #[error("A folder cannot be moved into itself or its descendants")]
    Cycle,

    #[error("Store error: {0}")]
    Store(String),

    #[error("Work items unavailable: {0}")]
    Unavailable(String),
}

// ============================================================================
// WorkItemActor
// ============================================================================

#[derive(Debug, Default)]
pub struct WorkItemActor;

pub struct WorkItemArguments {
    pub item: WorkItem,
    pub services: SessionServices,
}

pub struct WorkItemState {
    item: WorkItem,
    services: SessionServices,
    persistence: ActorRef<PersistenceMsg>,
}

#[derive(Debug)]
pub enum WorkItemMsg {
    Rename {
        title: String,
        reply: RpcReplyPort<Result<(), WorkItemError>>,
    },
    Move { parent_id: Option<String> },
    Get(RpcReplyPort<WorkItem>),
    Bus(BusEvent),
    Persistence(PersistenceUpdate),
}

/// Topics carrying renames made inside the resource an item points at
fn followed_topic(kind: ResourceKind) -> Option<&'static str> {
    match kind {
        ResourceKind::Dashboard => Some("dashboard.updated"),
        ResourceKind::Query => Some("query.updated"),
        ResourceKind::Visualization => Some("visualization.updated"),
        ResourceKind::Folder => None,
    }
}

#[async_trait]
impl Actor for WorkItemActor {
    type Msg = WorkItemMsg;
    type State = WorkItemState;
    type Arguments = WorkItemArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let WorkItemArguments { item, services } = args;
        tracing::debug!(
            actor_id = %myself.get_id(),
            resource = %item.resource(),
            "WorkItemActor starting"
        );

        if let Some(topic) = followed_topic(item.kind) {
            subscribe(
                services.event_bus(),
                topic,
                Some(item.resource()),
                EventSubscriber::new(&myself, WorkItemMsg::Bus),
            )
            .await?;
        }

        let (persistence, _) = Actor::spawn_linked(
            None,
            PersistenceActor,
            PersistenceArguments {
                resource: Persistable::resource(&item),
                version: item.updated_at,
                store: services.store(),
                event_bus: Some(services.event_bus().clone()),
                notify: Some(notifier(&myself, WorkItemMsg::Persistence)),
                config: services.config().persistence.clone(),
            },
            myself.get_cell(),
        )
        .await?;

        Ok(WorkItemState {
            item,
            services,
            persistence,
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkItemMsg::Rename { title, reply } => {
                let title = title.trim().to_string();
                if title.is_empty() {
                    let _ = reply.send(Err(WorkItemError::InvalidTitle));
                    return Ok(());
                }
                if title != state.item.title {
                    state.item.title = title.clone();
                    self.persist(state);
                    state.services.publish(BusEvent::WorkItemRenamed {
                        kind: state.item.kind,
                        id: state.item.id.clone(),
                        title,
                    });
                }
                let _ = reply.send(Ok(()));
            }
            WorkItemMsg::Move { parent_id } => {
                if parent_id != state.item.parent_id {
                    state.item.parent_id = parent_id.clone();
                    self.persist(state);
                    state.services.publish(BusEvent::WorkItemMoved {
                        kind: state.item.kind,
                        id: state.item.id.clone(),
                        parent_id,
                    });
                }
            }
            WorkItemMsg::Get(reply) => {
                let _ = reply.send(state.item.clone());
            }
            WorkItemMsg::Bus(event) => {
                if !event.correlation().is_about(&state.item.resource()) {
                    return Ok(());
                }
                match event {
                    BusEvent::DashboardUpdated { title, .. }
                    | BusEvent::QueryUpdated { title, .. }
                    | BusEvent::VisualizationUpdated { title, .. } => {
                        state.item.title = title;
                    }
                    _ => {}
                }
            }
            WorkItemMsg::Persistence(update) => match update {
                PersistenceUpdate::Saved(saved) => state.item.updated_at = Some(saved.updated_at),
                PersistenceUpdate::Failed(error) => {
                    tracing::warn!(resource = %state.item.resource(), error = %error, "Work item save failed");
                }
                PersistenceUpdate::Status(_) => {}
            },
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.persistence.stop(None);
        let _ = unsubscribe_owner(state.services.event_bus(), myself.get_id());
        Ok(())
    }
}

impl WorkItemActor {
    fn persist(&self, state: &WorkItemState) {
        if let Err(e) = persistence::persist(&state.persistence, &state.item) {
            tracing::warn!(resource = %state.item.resource(), error = %e, "Persistence child unavailable");
        }
    }
}

// ============================================================================
// WorkItemsActor
// ============================================================================

#[derive(Debug, Default)]
pub struct WorkItemsActor;

pub struct WorkItemsArguments {
    pub services: SessionServices,
}

struct ItemEntry {
    parent_id: Option<String>,
    actor: ActorRef<WorkItemMsg>,
    registration: RegistrationToken,
}

pub struct WorkItemsState {
    services: SessionServices,
    items: BTreeMap<ResourceRef, ItemEntry>,
}

#[derive(Debug)]
pub enum WorkItemsMsg {
    Create {
        kind: ResourceKind,
        title: String,
        parent_id: Option<String>,
        reply: RpcReplyPort<Result<WorkItem, WorkItemError>>,
    },
    Rename {
        resource: ResourceRef,
        title: String,
        reply: RpcReplyPort<Result<(), WorkItemError>>,
    },
    Move {
        resource: ResourceRef,
        parent_id: Option<String>,
        reply: RpcReplyPort<Result<(), WorkItemError>>,
    },
    /// Delete an entry and, for folders, everything below it. Replies with
    /// every removed resource, deepest first.
    Delete {
        resource: ResourceRef,
        reply: RpcReplyPort<Result<Vec<ResourceRef>, WorkItemError>>,
    },
    List(RpcReplyPort<Vec<WorkItem>>),
    Get {
        resource: ResourceRef,
        reply: RpcReplyPort<Option<ActorRef<WorkItemMsg>>>,
    },
}

#[async_trait]
impl Actor for WorkItemsActor {
    type Msg = WorkItemsMsg;
    type State = WorkItemsState;
    type Arguments = WorkItemsArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let services = args.services;
        let items = services.store().list_work_items().await?;
        tracing::info!(
            actor_id = %myself.get_id(),
            items = items.len(),
            "WorkItemsActor starting"
        );

        let mut spawned = Vec::with_capacity(items.len());
        for item in items {
            let parent_id = item.parent_id.clone();
            let resource = item.resource();
            let key = keys::work_item(item.kind, &item.id);
            let actor = Self::spawn_item(&myself, &services, item).await?;
            spawned.push((resource, parent_id, key, actor));
        }
        let tokens = services.directory().bulk_register(
            spawned
                .iter()
                .map(|(_, _, key, actor)| (key.clone(), actor.clone())),
        );

        let items = spawned
            .into_iter()
            .zip(tokens)
            .map(|((resource, parent_id, _, actor), registration)| {
                (
                    resource,
                    ItemEntry {
                        parent_id,
                        actor,
                        registration,
                    },
                )
            })
            .collect();

        Ok(WorkItemsState { services, items })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkItemsMsg::Create {
                kind,
                title,
                parent_id,
                reply,
            } => {
                let result = self.create(&myself, state, kind, title, parent_id).await;
                let _ = reply.send(result);
            }
            WorkItemsMsg::Rename {
                resource,
                title,
                reply,
            } => match state.items.get(&resource) {
                Some(entry) => {
                    if let Err(e) = entry.actor.cast(WorkItemMsg::Rename { title, reply }) {
                        tracing::warn!(resource = %resource, error = %e, "Work item did not take the rename");
                    }
                }
                None => {
                    let _ = reply.send(Err(WorkItemError::NotFound(resource)));
                }
            },
            WorkItemsMsg::Move {
                resource,
                parent_id,
                reply,
            } => {
                let result = self.move_item(state, resource, parent_id);
                let _ = reply.send(result);
            }
            WorkItemsMsg::Delete { resource, reply } => {
                let result = self.delete(state, resource).await;
                let _ = reply.send(result);
            }
            WorkItemsMsg::List(reply) => {
                let mut items = Vec::with_capacity(state.items.len());
                for entry in state.items.values() {
                    match ractor::call!(entry.actor, WorkItemMsg::Get) {
                        Ok(item) => items.push(item),
                        Err(e) => tracing::warn!(error = %e, "Work item did not answer"),
                    }
                }
                let _ = reply.send(items);
            }
            WorkItemsMsg::Get { resource, reply } => {
                let _ = reply.send(state.items.get(&resource).map(|e| e.actor.clone()));
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
                let Some(resource) = state
                    .items
                    .iter()
                    .find(|(_, e)| e.actor.get_id() == actor_cell.get_id())
                    .map(|(r, _)| r.clone())
                else {
                    return Ok(());
                };
                tracing::warn!(resource = %resource, error = %error, "Work item actor failed, reloading");
                let stored = state
                    .services
                    .store()
                    .list_work_items()
                    .await?
                    .into_iter()
                    .find(|item| item.resource() == resource);
                if let Some(entry) = state.items.remove(&resource) {
                    state.services.directory().release(&entry.registration);
                }
                if let Some(item) = stored {
                    self.adopt(&myself, state, item).await?;
                }
            }
            SupervisionEvent::ActorTerminated(actor_cell, _, _) => {
                tracing::trace!(actor_id = %actor_cell.get_id(), "Work item actor terminated");
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
        for (_, entry) in std::mem::take(&mut state.items) {
            state.services.directory().release(&entry.registration);
            entry.actor.stop(None);
        }
        Ok(())
    }
}

impl WorkItemsActor {
    async fn spawn_item(
        myself: &ActorRef<WorkItemsMsg>,
        services: &SessionServices,
        item: WorkItem,
    ) -> Result<ActorRef<WorkItemMsg>, ActorProcessingErr> {
        let (actor, _) = Actor::spawn_linked(
            None,
            WorkItemActor,
            WorkItemArguments {
                item,
                services: services.clone(),
            },
            myself.get_cell(),
        )
        .await?;
        Ok(actor)
    }

    /// Spawn, register and track one item
    async fn adopt(
        &self,
        myself: &ActorRef<WorkItemsMsg>,
        state: &mut WorkItemsState,
        item: WorkItem,
    ) -> Result<(), ActorProcessingErr> {
        let resource = item.resource();
        let key = keys::work_item(item.kind, &item.id);
        let parent_id = item.parent_id.clone();
        let actor = Self::spawn_item(myself, &state.services, item).await?;
        let registration = state.services.directory().register(&actor, key);
        state.items.insert(
            resource,
            ItemEntry {
                parent_id,
                actor,
                registration,
            },
        );
        Ok(())
    }

    fn check_parent(&self, state: &WorkItemsState, parent_id: &Option<String>) -> Result<(), WorkItemError> {
        match parent_id {
            Some(parent_id) if !state.items.contains_key(&ResourceRef::folder(parent_id.clone())) => {
                Err(WorkItemError::ParentNotFolder(parent_id.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn create(
        &self,
        myself: &ActorRef<WorkItemsMsg>,
        state: &mut WorkItemsState,
        kind: ResourceKind,
        title: String,
        parent_id: Option<String>,
    ) -> Result<WorkItem, WorkItemError> {
        let title = title.trim().to_string();
        if title.is_empty() {
            return Err(WorkItemError::InvalidTitle);
        }
        self.check_parent(state, &parent_id)?;

        let id = new_id();
        let store = state.services.store();
        let record = match kind {
            ResourceKind::Dashboard => Some(ResourcePayload::Dashboard(Dashboard::new(&id, &title))),
            ResourceKind::Query => Some(ResourcePayload::Query(Query::new(&id, &title, ""))),
            ResourceKind::Visualization => Some(ResourcePayload::Visualization(Visualization {
                id: id.clone(),
                title: title.clone(),
                query_id: None,
                config: serde_json::Value::Null,
                updated_at: None,
            })),
            ResourceKind::Folder => None,
        };
        if let Some(record) = record {
            store
                .update(record)
                .await
                .map_err(|e| WorkItemError::Store(e.to_string()))?;
        }

        let mut item = WorkItem::new(kind, id, title);
        item.parent_id = parent_id;
        let saved = store
            .update(ResourcePayload::WorkItem(item.clone()))
            .await
            .map_err(|e| WorkItemError::Store(e.to_string()))?;
        item.updated_at = Some(saved.updated_at);

        self.adopt(myself, state, item.clone())
            .await
            .map_err(|e| WorkItemError::Unavailable(e.to_string()))?;
        tracing::info!(resource = %item.resource(), "Work item created");
        state
            .services
            .publish(BusEvent::WorkItemCreated { item: item.clone() });
        Ok(item)
    }

    fn move_item(
        &self,
        state: &mut WorkItemsState,
        resource: ResourceRef,
        parent_id: Option<String>,
    ) -> Result<(), WorkItemError> {
        if !state.items.contains_key(&resource) {
            return Err(WorkItemError::NotFound(resource));
        }
        self.check_parent(state, &parent_id)?;
        if let Some(parent_id) = &parent_id {
            let target = ResourceRef::folder(parent_id.clone());
            if resource == target || subtree(state, &resource).contains(&target) {
                return Err(WorkItemError::Cycle);
            }
        }

        let Some(entry) = state.items.get_mut(&resource) else {
            return Err(WorkItemError::NotFound(resource));
        };
        entry.parent_id = parent_id.clone();
        entry
            .actor
            .cast(WorkItemMsg::Move { parent_id })
            .map_err(|e| WorkItemError::Unavailable(e.to_string()))
    }

    async fn delete(
        &self,
        state: &mut WorkItemsState,
        resource: ResourceRef,
    ) -> Result<Vec<ResourceRef>, WorkItemError> {
        if !state.items.contains_key(&resource) {
            return Err(WorkItemError::NotFound(resource));
        }
        let doomed = subtree(state, &resource);
        let store = state.services.store();
        for target in &doomed {
            if let Err(e) = store.delete(target).await {
                tracing::warn!(resource = %target, error = %e, "Store delete failed");
            }
            if let Some(entry) = state.items.remove(target) {
                state.services.directory().release(&entry.registration);
                entry.actor.stop(Some("deleted".to_string()));
            }
            state.services.publish(BusEvent::WorkItemDeleted {
                kind: target.kind,
                id: target.id.clone(),
            });
        }
        tracing::info!(resource = %resource, removed = doomed.len(), "Work item deleted");
        Ok(doomed)
    }
}

/// `root` and everything below it, deepest entries first
fn subtree(state: &WorkItemsState, root: &ResourceRef) -> Vec<ResourceRef> {
    let mut out = Vec::new();
    collect_subtree(state, root, &mut out);
    out
}

fn collect_subtree(state: &WorkItemsState, root: &ResourceRef, out: &mut Vec<ResourceRef>) {
    if root.kind == ResourceKind::Folder {
        let children: Vec<ResourceRef> = state
            .items
            .iter()
            .filter(|(_, entry)| entry.parent_id.as_deref() == Some(root.id.as_str()))
            .map(|(resource, _)| resource.clone())
            .collect();
        for child in &children {
            collect_subtree(state, child, out);
        }
    }
    out.push(root.clone());
}

// ============================================================================
// Convenience functions
// ============================================================================

fn unavailable<E: std::fmt::Display>(e: E) -> WorkItemError {
    WorkItemError::Unavailable(e.to_string())
}

pub async fn create_item(
    actor: &ActorRef<WorkItemsMsg>,
    kind: ResourceKind,
    title: impl Into<String>,
    parent_id: Option<String>,
) -> Result<WorkItem, WorkItemError> {
    let title = title.into();
    ractor::call!(actor, |reply| WorkItemsMsg::Create {
        kind,
        title,
        parent_id,
        reply
    })
    .map_err(unavailable)?
}

pub async fn rename_item(
    actor: &ActorRef<WorkItemsMsg>,
    resource: ResourceRef,
    title: impl Into<String>,
) -> Result<(), WorkItemError> {
    let title = title.into();
    ractor::call!(actor, |reply| WorkItemsMsg::Rename {
        resource,
        title,
        reply
    })
    .map_err(unavailable)?
}

pub async fn move_item(
    actor: &ActorRef<WorkItemsMsg>,
    resource: ResourceRef,
    parent_id: Option<String>,
) -> Result<(), WorkItemError> {
    ractor::call!(actor, |reply| WorkItemsMsg::Move {
        resource,
        parent_id,
        reply
    })
    .map_err(unavailable)?
}

pub async fn delete_item(
    actor: &ActorRef<WorkItemsMsg>,
    resource: ResourceRef,
) -> Result<Vec<ResourceRef>, WorkItemError> {
    ractor::call!(actor, |reply| WorkItemsMsg::Delete { resource, reply }).map_err(unavailable)?
}

pub async fn list_items(actor: &ActorRef<WorkItemsMsg>) -> Result<Vec<WorkItem>, WorkItemError> {
    ractor::call!(actor, WorkItemsMsg::List).map_err(unavailable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::event_bus::get_history;
    use crate::backend::{InMemoryStore, ScriptedExecutor};
    use crate::services::testing::services;
    use std::time::Duration;

    async fn spawn_tree(store: &InMemoryStore) -> (ActorRef<WorkItemsMsg>, SessionServices) {
        let services = services(store, &ScriptedExecutor::new()).await;
        let (actor, _handle) = Actor::spawn(
            None,
            WorkItemsActor,
            WorkItemsArguments {
                services: services.clone(),
            },
        )
        .await
        .unwrap();
        (actor, services)
    }

    fn seeded_store() -> InMemoryStore {
        let store = InMemoryStore::new();
        store.seed(ResourcePayload::WorkItem(WorkItem::new(ResourceKind::Folder, "f1", "Finance")));
        let mut dashboard = WorkItem::new(ResourceKind::Dashboard, "d1", "Ops");
        dashboard.parent_id = Some("f1".to_string());
        store.seed(ResourcePayload::WorkItem(dashboard));
        store.seed(ResourcePayload::Dashboard(Dashboard::new("d1", "Ops")));
        store
    }

    #[tokio::test]
    async fn test_seeded_items_are_bulk_registered() {
        let store = seeded_store();
        let (tree, services) = spawn_tree(&store).await;

        let directory = services.directory();
        assert!(directory.contains(&keys::work_item(ResourceKind::Folder, "f1")));
        assert!(directory.contains(&keys::work_item(ResourceKind::Dashboard, "d1")));
        assert_eq!(list_items(&tree).await.unwrap().len(), 2);

        tree.stop(None);
    }

    #[tokio::test]
    async fn test_rename_saves_and_broadcasts() {
        let store = seeded_store();
        let (tree, services) = spawn_tree(&store).await;

        rename_item(&tree, ResourceRef::dashboard("d1"), "Operations")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        let history = get_history(services.event_bus(), "work_item.renamed", 10)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        let writes = store.writes().await;
        assert_eq!(writes.len(), 1);
        assert!(matches!(&writes[0], ResourcePayload::WorkItem(item) if item.title == "Operations"));

        tree.stop(None);
    }

    #[tokio::test]
    async fn test_dashboard_rename_updates_cached_title_without_saving() {
        let store = seeded_store();
        let (tree, services) = spawn_tree(&store).await;

        services.publish(BusEvent::DashboardUpdated {
            dashboard_id: "d1".to_string(),
            title: "Renamed in editor".to_string(),
            updated_at: None,
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let items = list_items(&tree).await.unwrap();
        let dashboard = items.iter().find(|i| i.id == "d1").unwrap();
        assert_eq!(dashboard.title, "Renamed in editor");
        assert!(store.writes().await.is_empty());

        tree.stop(None);
    }

    #[tokio::test]
    async fn test_folder_delete_cascades() {
        let store = seeded_store();
        let (tree, services) = spawn_tree(&store).await;

        let removed = delete_item(&tree, ResourceRef::folder("f1")).await.unwrap();
        assert_eq!(
            removed,
            vec![ResourceRef::dashboard("d1"), ResourceRef::folder("f1")]
        );
        assert!(list_items(&tree).await.unwrap().is_empty());
        assert!(store.get(&ResourceRef::dashboard("d1")).is_none());
        assert!(!services
            .directory()
            .contains(&keys::work_item(ResourceKind::Dashboard, "d1")));

        let history = get_history(services.event_bus(), "work_item.deleted", 10)
            .await
            .unwrap();
        assert_eq!(history.len(), 2);

        tree.stop(None);
    }

    #[tokio::test]
    async fn test_create_and_move_validate_parents() {
        let store = seeded_store();
        let (tree, _services) = spawn_tree(&store).await;

        assert_eq!(
            create_item(&tree, ResourceKind::Query, "Sales", Some("d1".to_string())).await,
            Err(WorkItemError::ParentNotFolder("d1".to_string()))
        );

        let sub = create_item(&tree, ResourceKind::Folder, "Sub", Some("f1".to_string()))
            .await
            .unwrap();
        assert_eq!(
            move_item(&tree, ResourceRef::folder("f1"), Some(sub.id.clone())).await,
            Err(WorkItemError::Cycle)
        );

        let query = create_item(&tree, ResourceKind::Query, "Sales", None)
            .await
            .unwrap();
        assert!(store.get(&ResourceRef::query(query.id.clone())).is_some());
        move_item(&tree, query.resource(), Some(sub.id.clone()))
            .await
            .unwrap();

        tree.stop(None);
    }
}
