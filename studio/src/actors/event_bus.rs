//! EventBusActor - session-wide multicast of domain events
//!
//! Every actor that needs cross-tree visibility subscribes once (normally in
//! `pre_start`) to a topic pattern, optionally narrowed to one correlated
//! resource. Publishing fans the event out to matching subscribers in
//! subscription order.
//!
//! # Architecture
//!
//! - `BusEvent` is a closed tagged union; every variant names the resource it
//!   is about through `correlation()`, so filtering by "is this about me" is
//!   done once at the bus instead of in every handler
//! - Wildcard topic patterns (e.g., "work_item.*", "*")
//! - A stopped or failing subscriber is pruned without interrupting delivery
//! - Bounded history ring for diagnostics
//!
//! # Example
//!
//! ```ignore
//! let subscriber = EventSubscriber::new(&dashboard_ref, DashboardMsg::Bus);
//! subscribe(&event_bus, "work_item.*", Some(ResourceRef::dashboard(id)), subscriber).await?;
//!
//! publish_event(&event_bus, BusEvent::WorkItemRenamed { .. })?;
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ractor::{cast, Actor, ActorCell, ActorId, ActorProcessingErr, ActorRef, ActorStatus, Message, RpcReplyPort};
use serde::{Deserialize, Serialize};
use shared_types::{Notification, ResourceKind, ResourceRef, WorkItem};
use std::collections::VecDeque;
use std::sync::Arc;

// ============================================================================
// Data Types
// ============================================================================

/// Domain events crossing actor-tree boundaries.
///
/// Serialized as `{"type": "DOMAIN.ACTION", ...payload}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum BusEvent {
    #[serde(rename = "DASHBOARD.UPDATED")]
    DashboardUpdated {
        dashboard_id: String,
        title: String,
        updated_at: Option<DateTime<Utc>>,
    },

    #[serde(rename = "DASHBOARD.DELETED")]
    DashboardDeleted { dashboard_id: String },

    #[serde(rename = "QUERY.UPDATED")]
    QueryUpdated {
        query_id: String,
        title: String,
        sql: String,
    },

    #[serde(rename = "QUERY.RUN_STATUS")]
    QueryRunStatus {
        query_id: String,
        phase: RunPhase,
        run_id: Option<String>,
    },

    #[serde(rename = "VISUALIZATION.UPDATED")]
    VisualizationUpdated {
        visualization_id: String,
        title: String,
    },

    #[serde(rename = "WORK_ITEM.CREATED")]
    WorkItemCreated { item: WorkItem },

    #[serde(rename = "WORK_ITEM.RENAMED")]
    WorkItemRenamed {
        kind: ResourceKind,
        id: String,
        title: String,
    },

    #[serde(rename = "WORK_ITEM.MOVED")]
    WorkItemMoved {
        kind: ResourceKind,
        id: String,
        parent_id: Option<String>,
    },

    #[serde(rename = "WORK_ITEM.DELETED")]
    WorkItemDeleted { kind: ResourceKind, id: String },

    #[serde(rename = "PERSISTENCE.SAVED")]
    PersistenceSaved {
        resource: ResourceRef,
        updated_at: DateTime<Utc>,
    },

    #[serde(rename = "PERSISTENCE.FAILED")]
    PersistenceFailed { resource: ResourceRef, error: String },

    #[serde(rename = "PERSISTENCE.CONFLICT")]
    PersistenceConflict { resource: ResourceRef },

    #[serde(rename = "NOTIFICATION.SHOW")]
    NotificationShow { notification: Notification },
}

/// Coarse execution progress broadcast for saved queries
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Waiting,
    Submitting,
    Running,
    Fetching,
    Complete,
    Cancelling,
    Cancelled,
    Failed,
}

impl RunPhase {
    /// No further progress follows without a new `Execute`
    pub fn is_settled(self) -> bool {
        matches!(self, RunPhase::Complete | RunPhase::Failed | RunPhase::Cancelled)
    }
}

/// What a broadcast is about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Correlation {
    Resource(ResourceRef),
    Global,
}

impl Correlation {
    pub fn is_about(&self, resource: &ResourceRef) -> bool {
        matches!(self, Correlation::Resource(r) if r == resource)
    }
}

impl BusEvent {
    /// Wire type tag, e.g. `WORK_ITEM.RENAMED`
    pub fn event_type(&self) -> &'static str {
        match self {
            BusEvent::DashboardUpdated { .. } => "DASHBOARD.UPDATED",
            BusEvent::DashboardDeleted { .. } => "DASHBOARD.DELETED",
            BusEvent::QueryUpdated { .. } => "QUERY.UPDATED",
            BusEvent::QueryRunStatus { .. } => "QUERY.RUN_STATUS",
            BusEvent::VisualizationUpdated { .. } => "VISUALIZATION.UPDATED",
            BusEvent::WorkItemCreated { .. } => "WORK_ITEM.CREATED",
            BusEvent::WorkItemRenamed { .. } => "WORK_ITEM.RENAMED",
            BusEvent::WorkItemMoved { .. } => "WORK_ITEM.MOVED",
            BusEvent::WorkItemDeleted { .. } => "WORK_ITEM.DELETED",
            BusEvent::PersistenceSaved { .. } => "PERSISTENCE.SAVED",
            BusEvent::PersistenceFailed { .. } => "PERSISTENCE.FAILED",
            BusEvent::PersistenceConflict { .. } => "PERSISTENCE.CONFLICT",
            BusEvent::NotificationShow { .. } => "NOTIFICATION.SHOW",
        }
    }

    /// Routing topic (hierarchical, e.g., "work_item.renamed")
    pub fn topic(&self) -> String {
        self.event_type().to_ascii_lowercase()
    }

    pub fn correlation(&self) -> Correlation {
        match self {
            BusEvent::DashboardUpdated { dashboard_id, .. }
            | BusEvent::DashboardDeleted { dashboard_id } => {
                Correlation::Resource(ResourceRef::dashboard(dashboard_id.clone()))
            }
            BusEvent::QueryUpdated { query_id, .. } | BusEvent::QueryRunStatus { query_id, .. } => {
                Correlation::Resource(ResourceRef::query(query_id.clone()))
            }
            BusEvent::VisualizationUpdated {
                visualization_id, ..
            } => Correlation::Resource(ResourceRef::visualization(visualization_id.clone())),
            BusEvent::WorkItemCreated { item } => Correlation::Resource(item.resource()),
            BusEvent::WorkItemRenamed { kind, id, .. }
            | BusEvent::WorkItemMoved { kind, id, .. }
            | BusEvent::WorkItemDeleted { kind, id } => {
                Correlation::Resource(ResourceRef::new(*kind, id.clone()))
            }
            BusEvent::PersistenceSaved { resource, .. }
            | BusEvent::PersistenceFailed { resource, .. }
            | BusEvent::PersistenceConflict { resource } => Correlation::Resource(resource.clone()),
            BusEvent::NotificationShow { .. } => Correlation::Global,
        }
    }

    /// Check if this event matches a topic pattern
    /// Supports wildcards: "work_item.*" matches "work_item.renamed"
    pub fn matches_topic(&self, pattern: &str) -> bool {
        topic_matches(&self.topic(), pattern)
    }
}

fn topic_matches(topic: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    if let Some(prefix) = pattern.strip_suffix(".*") {
        topic.starts_with(prefix)
            && (topic.len() == prefix.len() || topic[prefix.len()..].starts_with('.'))
    } else {
        topic == pattern
    }
}

/// A published event as kept in history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishedEvent {
    /// Unique event identifier (ULID)
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub event: BusEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Delivery endpoint: an actor cell plus how to wrap bus events into its
/// own message type.
#[derive(Clone)]
pub struct EventSubscriber {
    owner: ActorCell,
    deliver: Arc<dyn Fn(BusEvent) -> Result<(), String> + Send + Sync>,
}

impl std::fmt::Debug for EventSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSubscriber")
            .field("owner", &self.owner.get_id())
            .finish()
    }
}

impl EventSubscriber {
    pub fn new<M, F>(actor: &ActorRef<M>, wrap: F) -> Self
    where
        M: Message,
        F: Fn(BusEvent) -> M + Send + Sync + 'static,
    {
        let target = actor.clone();
        Self {
            owner: actor.get_cell(),
            deliver: Arc::new(move |event| target.cast(wrap(event)).map_err(|e| e.to_string())),
        }
    }

    pub fn owner(&self) -> ActorId {
        self.owner.get_id()
    }
}

struct Subscription {
    id: SubscriptionId,
    topic: String,
    correlation: Option<ResourceRef>,
    subscriber: EventSubscriber,
}

impl Subscription {
    fn accepts(&self, event: &BusEvent) -> bool {
        if !event.matches_topic(&self.topic) {
            return false;
        }
        match &self.correlation {
            Some(resource) => event.correlation().is_about(resource),
            None => true,
        }
    }
}

// ============================================================================
// EventBusActor
// ============================================================================

/// Messages handled by EventBusActor
#[derive(Debug)]
pub enum EventBusMsg {
    /// Publish an event to every matching subscriber
    Publish { event: BusEvent },

    /// Subscribe an actor to a topic pattern, optionally only for events
    /// correlated with one resource
    Subscribe {
        topic: String,
        correlation: Option<ResourceRef>,
        subscriber: EventSubscriber,
        reply: Option<RpcReplyPort<SubscriptionId>>,
    },

    /// Drop every subscription owned by an actor (called from `post_stop`)
    UnsubscribeOwner { owner: ActorId },

    /// Get subscribers whose pattern covers a topic (for debugging)
    GetSubscribers {
        topic: String,
        reply: RpcReplyPort<Vec<ActorId>>,
    },

    /// Recent events matching a topic pattern, newest last
    GetHistory {
        topic: String,
        limit: usize,
        reply: RpcReplyPort<Vec<PublishedEvent>>,
    },
}

/// Configuration for EventBusActor
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Maximum published events kept for `GetHistory`
    pub history_limit: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self { history_limit: 256 }
    }
}

/// Arguments for spawning EventBusActor
#[derive(Debug, Clone, Default)]
pub struct EventBusArguments {
    pub config: EventBusConfig,
}

/// State for EventBusActor
pub struct EventBusState {
    subscriptions: Vec<Subscription>,
    history: VecDeque<PublishedEvent>,
    next_subscription: u64,
    config: EventBusConfig,
}

/// Actor that provides pub/sub event distribution
#[derive(Debug, Default)]
pub struct EventBusActor;

#[async_trait]
impl Actor for EventBusActor {
    type Msg = EventBusMsg;
    type State = EventBusState;
    type Arguments = EventBusArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            actor_id = %myself.get_id(),
            history_limit = args.config.history_limit,
            "EventBusActor starting"
        );

        Ok(EventBusState {
            subscriptions: Vec::new(),
            history: VecDeque::with_capacity(args.config.history_limit),
            next_subscription: 1,
            config: args.config,
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            EventBusMsg::Publish { event } => self.handle_publish(event, state),
            EventBusMsg::Subscribe {
                topic,
                correlation,
                subscriber,
                reply,
            } => {
                let id = self.handle_subscribe(topic, correlation, subscriber, state);
                if let Some(reply) = reply {
                    let _ = reply.send(id);
                }
            }
            EventBusMsg::UnsubscribeOwner { owner } => {
                let before = state.subscriptions.len();
                state.subscriptions.retain(|s| s.subscriber.owner() != owner);
                tracing::debug!(
                    owner = %owner,
                    removed = before - state.subscriptions.len(),
                    "Removed subscriptions of stopped actor"
                );
            }
            EventBusMsg::GetSubscribers { topic, reply } => {
                let ids = state
                    .subscriptions
                    .iter()
                    .filter(|s| topic_matches(&topic, &s.topic))
                    .map(|s| s.subscriber.owner())
                    .collect();
                let _ = reply.send(ids);
            }
            EventBusMsg::GetHistory {
                topic,
                limit,
                reply,
            } => {
                let mut events: Vec<PublishedEvent> = state
                    .history
                    .iter()
                    .rev()
                    .filter(|e| e.event.matches_topic(&topic))
                    .take(limit)
                    .cloned()
                    .collect();
                events.reverse();
                let _ = reply.send(events);
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        tracing::info!(
            actor_id = %myself.get_id(),
            subscriptions = state.subscriptions.len(),
            "EventBusActor stopped"
        );
        Ok(())
    }
}

impl EventBusActor {
    fn handle_publish(&self, event: BusEvent, state: &mut EventBusState) {
        let topic = event.topic();
        tracing::debug!(
            topic = %topic,
            correlation = ?event.correlation(),
            "Publishing event"
        );

        let mut dead: Vec<SubscriptionId> = Vec::new();
        for subscription in &state.subscriptions {
            if !subscription.accepts(&event) {
                continue;
            }
            let owner = &subscription.subscriber.owner;
            if matches!(
                owner.get_status(),
                ActorStatus::Stopping | ActorStatus::Stopped
            ) {
                dead.push(subscription.id);
                continue;
            }
            if let Err(e) = (subscription.subscriber.deliver)(event.clone()) {
                tracing::warn!(
                    topic = %topic,
                    actor_id = %owner.get_id(),
                    error = %e,
                    "Failed to send event to subscriber"
                );
                dead.push(subscription.id);
            }
        }
        if !dead.is_empty() {
            state.subscriptions.retain(|s| !dead.contains(&s.id));
        }

        if state.config.history_limit > 0 {
            if state.history.len() == state.config.history_limit {
                state.history.pop_front();
            }
            state.history.push_back(PublishedEvent {
                id: ulid::Ulid::new().to_string(),
                timestamp: Utc::now(),
                event,
            });
        }
    }

    fn handle_subscribe(
        &self,
        topic: String,
        correlation: Option<ResourceRef>,
        subscriber: EventSubscriber,
        state: &mut EventBusState,
    ) -> SubscriptionId {
        let id = SubscriptionId(state.next_subscription);
        state.next_subscription += 1;

        tracing::debug!(
            topic = %topic,
            correlation = ?correlation,
            subscriber = %subscriber.owner(),
            "Actor subscribed to topic"
        );

        state.subscriptions.push(Subscription {
            id,
            topic,
            correlation,
            subscriber,
        });
        id
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Convenience function to publish an event
pub fn publish_event(
    event_bus: &ActorRef<EventBusMsg>,
    event: BusEvent,
) -> Result<(), ractor::RactorErr<EventBusMsg>> {
    cast!(event_bus, EventBusMsg::Publish { event })
}

/// Subscribe and wait until the bus has registered the subscription, so no
/// event published afterwards can be missed.
pub async fn subscribe(
    event_bus: &ActorRef<EventBusMsg>,
    topic: impl Into<String>,
    correlation: Option<ResourceRef>,
    subscriber: EventSubscriber,
) -> Result<SubscriptionId, ractor::RactorErr<EventBusMsg>> {
    let topic = topic.into();
    ractor::call!(event_bus, |reply| EventBusMsg::Subscribe {
        topic,
        correlation,
        subscriber,
        reply: Some(reply),
    })
}

/// Convenience function to drop all of an actor's subscriptions
pub fn unsubscribe_owner(
    event_bus: &ActorRef<EventBusMsg>,
    owner: ActorId,
) -> Result<(), ractor::RactorErr<EventBusMsg>> {
    cast!(event_bus, EventBusMsg::UnsubscribeOwner { owner })
}

pub async fn get_history(
    event_bus: &ActorRef<EventBusMsg>,
    topic: impl Into<String>,
    limit: usize,
) -> Result<Vec<PublishedEvent>, ractor::RactorErr<EventBusMsg>> {
    let topic = topic.into();
    ractor::call!(event_bus, |reply| EventBusMsg::GetHistory {
        topic,
        limit,
        reply,
    })
}

// ============================================================================
// Tests
// ============================================================================
