//! PersistenceActor - debounced, conflict-aware writes for one aggregate
//!
//! The owning aggregate sends its whole snapshot after every local mutation.
//! Snapshots arriving inside the debounce window replace each other, so a
//! burst of N mutations produces one write carrying the Nth snapshot.
//!
//! ```text
//! idle ──Mutated──▶ debouncing ──(quiet period)──▶ flushing ──Saved──▶ complete ──▶ idle
//!                     ▲   │ Mutated (timer reset)       │
//!                     └───┘                             ├──Failed(409)──▶ failed.conflict ──▶ idle
//!                                                       └──Failed──────▶ failed.error ────▶ idle
//! ```
//!
//! Mutations that arrive while a write is in flight mark the snapshot dirty;
//! a successful write then goes straight back to debouncing instead of
//! completing. Failures are not retried automatically: a `Retry` or the next
//! mutation starts a new write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use serde::{Deserialize, Serialize};
use shared_types::{
    Dashboard, Notification, NotificationLevel, Query, ResourceRef, Visualization, WorkItem,
};
use std::sync::Arc;
use strum::EnumDiscriminants;

use crate::actors::event_bus::{publish_event, BusEvent, EventBusMsg};
use crate::backend::{ResourcePayload, ResourceStore, SavedResource, WriteError};
use crate::config::PersistenceConfig;
use crate::machine::{
    actor_sink, ActionScope, Delivery, DefinitionError, Interpreter, Invocation, Machine,
    MachineDefinition, MachineEvent, Notifier,
};

// ============================================================================
// Persistable
// ============================================================================

/// An aggregate record that can be written back as a whole resource
pub trait Persistable: Clone + Send + Sync + 'static {
    fn resource(&self) -> ResourceRef;

    fn to_payload(&self) -> ResourcePayload;
}

impl Persistable for Dashboard {
    fn resource(&self) -> ResourceRef {
        ResourceRef::dashboard(self.id.clone())
    }

    fn to_payload(&self) -> ResourcePayload {
        ResourcePayload::Dashboard(self.clone())
    }
}

impl Persistable for Query {
    fn resource(&self) -> ResourceRef {
        ResourceRef::query(self.id.clone())
    }

    fn to_payload(&self) -> ResourcePayload {
        ResourcePayload::Query(self.clone())
    }
}

impl Persistable for Visualization {
    fn resource(&self) -> ResourceRef {
        ResourceRef::visualization(self.id.clone())
    }

    fn to_payload(&self) -> ResourcePayload {
        ResourcePayload::Visualization(self.clone())
    }
}

impl Persistable for WorkItem {
    fn resource(&self) -> ResourceRef {
        WorkItem::resource(self)
    }

    fn to_payload(&self) -> ResourcePayload {
        ResourcePayload::WorkItem(self.clone())
    }
}

// ============================================================================
// Machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PersistenceState {
    Idle,
    Debouncing,
    Flushing,
    Complete,
    Failed,
    FailedConflict,
    FailedError,
}

#[derive(Debug, Clone, EnumDiscriminants)]
#[strum_discriminants(name(PersistenceEventKind), derive(Hash))]
pub enum PersistenceEvent {
    Mutated(ResourcePayload),
    Flush,
    Saved(SavedResource),
    Failed(WriteError),
    Retry,
    CooldownElapsed,
}

impl MachineEvent for PersistenceEvent {
    type Kind = PersistenceEventKind;

    fn kind(&self) -> PersistenceEventKind {
        self.into()
    }
}

pub struct PersistenceContext {
    store: Arc<dyn ResourceStore>,
    /// Newest snapshot not yet handed to a write
    latest: Option<ResourcePayload>,
    in_flight: Option<ResourcePayload>,
    /// Newest server version seen, from saves or from the aggregate itself
    version: Option<DateTime<Utc>>,
    dirty: bool,
    last_error: Option<WriteError>,
    writes: u64,
    config: PersistenceConfig,
}

#[derive(Debug)]
pub enum PersistenceCommand {
    Saved(SavedResource),
    Failed(WriteError),
}

pub struct PersistenceMachine;

impl Machine for PersistenceMachine {
    type State = PersistenceState;
    type Event = PersistenceEvent;
    type Context = PersistenceContext;
    type Command = PersistenceCommand;
}

fn record_mutation(s: &mut ActionScope<'_, PersistenceMachine>) {
    let event = s.event;
    if let Some(PersistenceEvent::Mutated(payload)) = event {
        s.ctx.version = s.ctx.version.max(payload.updated_at());
        s.ctx.latest = Some(payload.clone());
    }
}

fn begin_flush(s: &mut ActionScope<'_, PersistenceMachine>) {
    if let Some(mut payload) = s.ctx.latest.take() {
        payload.set_updated_at(s.ctx.version);
        s.ctx.in_flight = Some(payload);
    }
    s.ctx.dirty = false;
}

fn record_saved(s: &mut ActionScope<'_, PersistenceMachine>) {
    let event = s.event;
    if let Some(PersistenceEvent::Saved(saved)) = event {
        s.ctx.version = s.ctx.version.max(Some(saved.updated_at));
        s.ctx.in_flight = None;
        s.ctx.last_error = None;
        s.ctx.writes += 1;
        s.emit(PersistenceCommand::Saved(saved.clone()));
    }
}

fn record_failure(s: &mut ActionScope<'_, PersistenceMachine>) {
    let event = s.event;
    if let Some(PersistenceEvent::Failed(error)) = event {
        // Keep the unsaved snapshot around for a retry unless a newer one exists
        let in_flight = s.ctx.in_flight.take();
        if s.ctx.latest.is_none() {
            s.ctx.latest = in_flight;
        }
        s.ctx.dirty = false;
        s.ctx.last_error = Some(error.clone());
        s.emit(PersistenceCommand::Failed(error.clone()));
    }
}

fn can_retry(ctx: &PersistenceContext, _: &PersistenceEvent) -> bool {
    ctx.last_error.is_some() && ctx.latest.is_some()
}

pub fn definition() -> Result<MachineDefinition<PersistenceMachine>, DefinitionError> {
    use PersistenceEventKind as K;
    use PersistenceState as S;
    type P = PersistenceMachine;

    MachineDefinition::builder("persistence")
        .initial(S::Idle)
        .state(
            P::atomic(S::Idle)
                .on(K::Mutated, P::to(S::Debouncing).action(record_mutation))
                .on(K::Retry, P::to(S::Flushing).guard(can_retry)),
        )
        .state(
            P::atomic(S::Debouncing)
                .invoke(Invocation::<P>::after(
                    "debounce",
                    |ctx: &PersistenceContext| ctx.config.debounce(),
                    PersistenceEvent::Flush,
                ))
                .on(
                    K::Mutated,
                    P::to(S::Debouncing).reenter().action(record_mutation),
                )
                .on(K::Flush, P::to(S::Flushing)),
        )
        .state(
            P::atomic(S::Flushing)
                .on_entry(begin_flush)
                .invoke(Invocation::<P>::future(
                    "write",
                    |ctx: &PersistenceContext, _| {
                        let store = Arc::clone(&ctx.store);
                        let payload = ctx.in_flight.clone();
                        async move {
                            match payload {
                                Some(payload) => store.update(payload).await,
                                None => Err(WriteError::Transport("nothing to write".to_string())),
                            }
                        }
                    },
                    PersistenceEvent::Saved,
                    PersistenceEvent::Failed,
                ))
                .on(
                    K::Mutated,
                    P::internal().action(|s| {
                        record_mutation(s);
                        s.ctx.dirty = true;
                    }),
                )
                .on(
                    K::Saved,
                    P::to(S::Debouncing)
                        .guard(|ctx, _| ctx.dirty)
                        .action(record_saved),
                )
                .on(K::Saved, P::to(S::Complete).action(record_saved))
                .on(
                    K::Failed,
                    P::to(S::FailedConflict)
                        .guard(|_, event| {
                            matches!(event, PersistenceEvent::Failed(e) if e.is_conflict())
                        })
                        .action(record_failure),
                )
                .on(K::Failed, P::to(S::FailedError).action(record_failure)),
        )
        .state(
            P::atomic(S::Complete)
                .invoke(Invocation::<P>::after(
                    "complete-cooldown",
                    |ctx: &PersistenceContext| ctx.config.complete_cooldown(),
                    PersistenceEvent::CooldownElapsed,
                ))
                .on(K::CooldownElapsed, P::to(S::Idle))
                .on(K::Mutated, P::to(S::Debouncing).action(record_mutation)),
        )
        .state(
            P::compound(S::Failed, S::FailedError)
                .invoke(Invocation::<P>::after(
                    "failure-cooldown",
                    |ctx: &PersistenceContext| ctx.config.failure_cooldown(),
                    PersistenceEvent::CooldownElapsed,
                ))
                .on(K::CooldownElapsed, P::to(S::Idle))
                .on(K::Retry, P::to(S::Flushing).guard(can_retry))
                .on(K::Mutated, P::to(S::Debouncing).action(record_mutation)),
        )
        .state(P::atomic(S::FailedConflict).child_of(S::Failed))
        .state(P::atomic(S::FailedError).child_of(S::Failed))
        .build()
}

// ============================================================================
// Status reporting
// ============================================================================

/// Coarse save indicator for the owning aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveStatus {
    Idle,
    Pending,
    Saving,
    Saved,
    Conflict,
    Failed,
}

/// Sent to the owning aggregate
#[derive(Debug, Clone)]
pub enum PersistenceUpdate {
    Status(SaveStatus),
    Saved(SavedResource),
    Failed(WriteError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersistenceSnapshot {
    pub resource: ResourceRef,
    pub status: SaveStatus,
    pub version: Option<DateTime<Utc>>,
    pub pending: bool,
    pub writes: u64,
    pub last_error: Option<WriteError>,
}

fn status_of(interpreter: &Interpreter<PersistenceMachine>) -> SaveStatus {
    use PersistenceState as S;
    if interpreter.matches(S::FailedConflict) {
        SaveStatus::Conflict
    } else if interpreter.matches(S::FailedError) {
        SaveStatus::Failed
    } else if interpreter.matches(S::Flushing) {
        SaveStatus::Saving
    } else if interpreter.matches(S::Debouncing) {
        SaveStatus::Pending
    } else if interpreter.matches(S::Complete) {
        SaveStatus::Saved
    } else {
        SaveStatus::Idle
    }
}

// ============================================================================
// PersistenceActor
// ============================================================================

#[derive(Debug, Default)]
pub struct PersistenceActor;

pub struct PersistenceArguments {
    pub resource: ResourceRef,
    /// Server version of the record the aggregate was loaded from
    pub version: Option<DateTime<Utc>>,
    pub store: Arc<dyn ResourceStore>,
    pub event_bus: Option<ActorRef<EventBusMsg>>,
    pub notify: Option<Notifier<PersistenceUpdate>>,
    pub config: PersistenceConfig,
}

pub struct PersistenceActorState {
    resource: ResourceRef,
    interpreter: Interpreter<PersistenceMachine>,
    event_bus: Option<ActorRef<EventBusMsg>>,
    notify: Option<Notifier<PersistenceUpdate>>,
    status: SaveStatus,
}

#[derive(Debug)]
pub enum PersistenceMsg {
    /// Latest whole snapshot of the aggregate after a local mutation
    Mutated(ResourcePayload),
    /// Write the pending snapshot again after a failure
    Retry,
    Service(Delivery<PersistenceEvent>),
    GetSnapshot(RpcReplyPort<PersistenceSnapshot>),
}

#[async_trait]
impl Actor for PersistenceActor {
    type Msg = PersistenceMsg;
    type State = PersistenceActorState;
    type Arguments = PersistenceArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            actor_id = %myself.get_id(),
            resource = %args.resource,
            "PersistenceActor starting"
        );

        let definition = Arc::new(definition()?);
        let context = PersistenceContext {
            store: args.store,
            latest: None,
            in_flight: None,
            version: args.version,
            dirty: false,
            last_error: None,
            writes: 0,
            config: args.config,
        };
        let mut interpreter = Interpreter::new(
            definition,
            context,
            actor_sink(&myself, PersistenceMsg::Service),
        );
        let commands = interpreter.start();

        let mut state = PersistenceActorState {
            resource: args.resource,
            interpreter,
            event_bus: args.event_bus,
            notify: args.notify,
            status: SaveStatus::Idle,
        };
        self.run_commands(commands, &mut state);
        Ok(state)
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let commands = match message {
            PersistenceMsg::Mutated(payload) => {
                if payload.resource() != state.resource {
                    tracing::warn!(
                        resource = %state.resource,
                        other = %payload.resource(),
                        "Ignoring snapshot of a different resource"
                    );
                    return Ok(());
                }
                state.interpreter.send(PersistenceEvent::Mutated(payload))
            }
            PersistenceMsg::Retry => state.interpreter.send(PersistenceEvent::Retry),
            PersistenceMsg::Service(delivery) => state.interpreter.deliver(delivery),
            PersistenceMsg::GetSnapshot(reply) => {
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
        let pending = state.interpreter.context().latest.is_some();
        if pending {
            tracing::warn!(
                actor_id = %myself.get_id(),
                resource = %state.resource,
                "PersistenceActor stopped with unsaved changes"
            );
        }
        state.interpreter.stop();
        tracing::info!(
            actor_id = %myself.get_id(),
            resource = %state.resource,
            "PersistenceActor stopped"
        );
        Ok(())
    }
}

impl PersistenceActor {
    fn run_commands(&self, commands: Vec<PersistenceCommand>, state: &mut PersistenceActorState) {
        for command in commands {
            match command {
                PersistenceCommand::Saved(saved) => {
                    tracing::debug!(
                        resource = %saved.resource,
                        updated_at = %saved.updated_at,
                        "Resource saved"
                    );
                    self.publish(
                        state,
                        BusEvent::PersistenceSaved {
                            resource: saved.resource.clone(),
                            updated_at: saved.updated_at,
                        },
                    );
                    if let Some(notify) = &state.notify {
                        notify(PersistenceUpdate::Saved(saved));
                    }
                }
                PersistenceCommand::Failed(error) => {
                    let resource = state.resource.clone();
                    if error.is_conflict() {
                        tracing::warn!(resource = %resource, "Write conflict, refresh required");
                        self.publish(
                            state,
                            BusEvent::PersistenceConflict {
                                resource: resource.clone(),
                            },
                        );
                        let notification = Notification::new(
                            NotificationLevel::Warning,
                            format!(
                                "{resource} was changed elsewhere. Refresh to load the latest version before editing."
                            ),
                        )
                        .about(resource);
                        self.publish(state, BusEvent::NotificationShow { notification });
                    } else {
                        tracing::error!(resource = %resource, error = %error, "Write failed");
                        self.publish(
                            state,
                            BusEvent::PersistenceFailed {
                                resource: resource.clone(),
                                error: error.to_string(),
                            },
                        );
                        let notification = Notification::new(
                            NotificationLevel::Error,
                            format!("Could not save {resource}: {error}"),
                        )
                        .about(resource);
                        self.publish(state, BusEvent::NotificationShow { notification });
                    }
                    if let Some(notify) = &state.notify {
                        notify(PersistenceUpdate::Failed(error));
                    }
                }
            }
        }

        let status = status_of(&state.interpreter);
        if status != state.status {
            state.status = status;
            if let Some(notify) = &state.notify {
                notify(PersistenceUpdate::Status(status));
            }
        }
    }

    fn publish(&self, state: &PersistenceActorState, event: BusEvent) {
        if let Some(bus) = &state.event_bus {
            if let Err(e) = publish_event(bus, event) {
                tracing::warn!(resource = %state.resource, error = %e, "Failed to publish persistence event");
            }
        }
    }

    fn snapshot(&self, state: &PersistenceActorState) -> PersistenceSnapshot {
        let ctx = state.interpreter.context();
        PersistenceSnapshot {
            resource: state.resource.clone(),
            status: status_of(&state.interpreter),
            version: ctx.version,
            pending: ctx.latest.is_some() || ctx.in_flight.is_some(),
            writes: ctx.writes,
            last_error: ctx.last_error.clone(),
        }
    }
}

// ============================================================================
// Convenience functions
// ============================================================================

/// Hand the aggregate's current snapshot to its persistence actor
pub fn persist<R: Persistable>(
    actor: &ActorRef<PersistenceMsg>,
    record: &R,
) -> Result<(), ractor::RactorErr<PersistenceMsg>> {
    ractor::cast!(actor, PersistenceMsg::Mutated(record.to_payload()))
}

pub fn retry(actor: &ActorRef<PersistenceMsg>) -> Result<(), ractor::RactorErr<PersistenceMsg>> {
    ractor::cast!(actor, PersistenceMsg::Retry)
}

pub async fn get_snapshot(
    actor: &ActorRef<PersistenceMsg>,
) -> Result<PersistenceSnapshot, ractor::RactorErr<PersistenceMsg>> {
    ractor::call!(actor, PersistenceMsg::GetSnapshot)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryStore;
    use std::time::Duration;

    fn fast_config() -> PersistenceConfig {
        PersistenceConfig {
            debounce_ms: 200,
            complete_cooldown_ms: 100,
            failure_cooldown_ms: 300,
        }
    }

    async fn spawn_for(
        store: &InMemoryStore,
        dashboard: &Dashboard,
    ) -> ActorRef<PersistenceMsg> {
        let (actor, _handle) = Actor::spawn(
            None,
            PersistenceActor,
            PersistenceArguments {
                resource: dashboard.resource(),
                version: dashboard.updated_at,
                store: Arc::new(store.clone()),
                event_bus: None,
                notify: None,
                config: fast_config(),
            },
        )
        .await
        .unwrap();
        actor
    }

    fn seeded(store: &InMemoryStore) -> Dashboard {
        match store.seed(ResourcePayload::Dashboard(Dashboard::new("d1", "Ops"))) {
            ResourcePayload::Dashboard(d) => d,
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_definition_builds() {
        let definition = definition().unwrap();
        assert!(definition.contains(PersistenceState::FailedConflict));
    }

    #[tokio::test]
    async fn test_burst_of_mutations_writes_latest_snapshot_once() {
        let store = InMemoryStore::new();
        let mut dashboard = seeded(&store);
        let actor = spawn_for(&store, &dashboard).await;

        for title in ["A", "B", "C"] {
            dashboard.title = title.to_string();
            persist(&actor, &dashboard).unwrap();
            tokio::time::sleep(Duration::from_millis(40)).await;
        }

        let snapshot = get_snapshot(&actor).await.unwrap();
        assert_eq!(snapshot.status, SaveStatus::Pending);

        tokio::time::sleep(Duration::from_millis(400)).await;

        let writes = store.writes_for(&dashboard.resource()).await;
        assert_eq!(writes.len(), 1);
        match &writes[0] {
            ResourcePayload::Dashboard(d) => assert_eq!(d.title, "C"),
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(get_snapshot(&actor).await.unwrap().writes, 1);

        actor.stop(None);
    }

    #[tokio::test]
    async fn test_consecutive_saves_use_new_version() {
        let store = InMemoryStore::new();
        let mut dashboard = seeded(&store);
        let actor = spawn_for(&store, &dashboard).await;

        dashboard.title = "first".to_string();
        persist(&actor, &dashboard).unwrap();
        tokio::time::sleep(Duration::from_millis(450)).await;

        // The aggregate still carries the original version; the actor stamps
        // the one returned by the first save.
        dashboard.title = "second".to_string();
        persist(&actor, &dashboard).unwrap();
        tokio::time::sleep(Duration::from_millis(450)).await;

        let writes = store.writes_for(&dashboard.resource()).await;
        assert_eq!(writes.len(), 2);
        let snapshot = get_snapshot(&actor).await.unwrap();
        assert_eq!(snapshot.writes, 2);
        assert!(snapshot.last_error.is_none());

        actor.stop(None);
    }

    #[tokio::test]
    async fn test_conflict_is_distinguished() {
        let store = InMemoryStore::new();
        let mut dashboard = seeded(&store);
        let actor = spawn_for(&store, &dashboard).await;

        assert!(store.bump_version(&dashboard.resource()));
        dashboard.title = "stale".to_string();
        persist(&actor, &dashboard).unwrap();
        tokio::time::sleep(Duration::from_millis(260)).await;

        let snapshot = get_snapshot(&actor).await.unwrap();
        assert_eq!(snapshot.status, SaveStatus::Conflict);
        assert!(matches!(snapshot.last_error, Some(WriteError::Conflict(_))));
        assert!(snapshot.pending);

        // Back to idle after the cooldown
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(get_snapshot(&actor).await.unwrap().status, SaveStatus::Idle);

        actor.stop(None);
    }

    #[tokio::test]
    async fn test_failure_then_manual_retry() {
        let store = InMemoryStore::new();
        let mut dashboard = seeded(&store);
        let actor = spawn_for(&store, &dashboard).await;

        store
            .fail_next(WriteError::Status {
                code: 500,
                message: "boom".to_string(),
            })
            .await;
        dashboard.title = "retry me".to_string();
        persist(&actor, &dashboard).unwrap();
        tokio::time::sleep(Duration::from_millis(260)).await;

        let snapshot = get_snapshot(&actor).await.unwrap();
        assert_eq!(snapshot.status, SaveStatus::Failed);
        assert_eq!(snapshot.writes, 0);

        retry(&actor).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let snapshot = get_snapshot(&actor).await.unwrap();
        assert_eq!(snapshot.writes, 1);
        assert!(snapshot.last_error.is_none());
        assert!(!snapshot.pending);
        // One failed attempt plus the successful retry
        assert_eq!(store.writes_for(&dashboard.resource()).await.len(), 2);

        actor.stop(None);
    }

    #[tokio::test]
    async fn test_retry_without_failure_is_ignored() {
        let store = InMemoryStore::new();
        let dashboard = seeded(&store);
        let actor = spawn_for(&store, &dashboard).await;

        retry(&actor).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(get_snapshot(&actor).await.unwrap().status, SaveStatus::Idle);
        assert!(store.writes().await.is_empty());

        actor.stop(None);
    }
}
