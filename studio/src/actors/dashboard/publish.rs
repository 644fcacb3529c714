//! PublishActor - publish/unpublish control for one dashboard
//!
//! Publishing is a separate endpoint from the whole-resource write, so it
//! gets its own small machine rather than going through persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum::EnumDiscriminants;

use crate::backend::{ResourceStore, SavedResource, WriteError};
use crate::machine::{
    actor_sink, ActionScope, Delivery, DefinitionError, Interpreter, Invocation, Machine,
    MachineDefinition, MachineEvent, Notifier,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishState {
    Unpublished,
    Publishing,
    Published,
    Unpublishing,
    Error,
}

#[derive(Debug, Clone, EnumDiscriminants)]
#[strum_discriminants(name(PublishEventKind), derive(Hash))]
pub enum PublishEvent {
    Publish,
    Unpublish,
    Done(SavedResource),
    Failed(WriteError),
}

impl MachineEvent for PublishEvent {
    type Kind = PublishEventKind;

    fn kind(&self) -> PublishEventKind {
        self.into()
    }
}

pub struct PublishContext {
    store: Arc<dyn ResourceStore>,
    dashboard_id: String,
    /// Whether the last confirmed state is published
    published: bool,
}

#[derive(Debug)]
pub enum PublishCommand {
    Changed {
        published: bool,
        updated_at: DateTime<Utc>,
    },
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PublishUpdate {
    Changed {
        published: bool,
        updated_at: DateTime<Utc>,
    },
    Failed(String),
}

pub struct PublishMachine;

impl Machine for PublishMachine {
    type State = PublishState;
    type Event = PublishEvent;
    type Context = PublishContext;
    type Command = PublishCommand;
}

fn set_published(target: bool) -> Invocation<PublishMachine> {
    Invocation::<PublishMachine>::future(
        if target { "publish" } else { "unpublish" },
        move |ctx: &PublishContext, _| {
            let store = Arc::clone(&ctx.store);
            let dashboard_id = ctx.dashboard_id.clone();
            async move { store.set_published(&dashboard_id, target).await }
        },
        PublishEvent::Done,
        PublishEvent::Failed,
    )
}

fn confirm(target: bool) -> impl Fn(&mut ActionScope<'_, PublishMachine>) + Send + Sync + 'static {
    move |s| {
        let event = s.event;
        if let Some(PublishEvent::Done(saved)) = event {
            s.ctx.published = target;
            s.emit(PublishCommand::Changed {
                published: target,
                updated_at: saved.updated_at,
            });
        }
    }
}

fn record_failure(s: &mut ActionScope<'_, PublishMachine>) {
    let event = s.event;
    if let Some(PublishEvent::Failed(error)) = event {
        s.emit(PublishCommand::Failed(error.to_string()));
    }
}

pub fn definition(published: bool) -> Result<MachineDefinition<PublishMachine>, DefinitionError> {
    use PublishEventKind as K;
    use PublishState as S;
    type P = PublishMachine;

    MachineDefinition::builder("publish")
        .initial(if published { S::Published } else { S::Unpublished })
        .state(P::atomic(S::Unpublished).on(K::Publish, P::to(S::Publishing)))
        .state(
            P::atomic(S::Publishing)
                .invoke(set_published(true))
                .on(K::Done, P::to(S::Published).action(confirm(true)))
                .on(K::Failed, P::to(S::Error).action(record_failure)),
        )
        .state(P::atomic(S::Published).on(K::Unpublish, P::to(S::Unpublishing)))
        .state(
            P::atomic(S::Unpublishing)
                .invoke(set_published(false))
                .on(K::Done, P::to(S::Unpublished).action(confirm(false)))
                .on(K::Failed, P::to(S::Error).action(record_failure)),
        )
        .state(
            P::atomic(S::Error)
                .on(K::Publish, P::to(S::Publishing))
                .on(K::Unpublish, P::to(S::Unpublishing)),
        )
        .build()
}

// ============================================================================
// PublishActor
// ============================================================================

#[derive(Debug, Default)]
pub struct PublishActor;

pub struct PublishArguments {
    pub dashboard_id: String,
    pub published: bool,
    pub store: Arc<dyn ResourceStore>,
    pub notify: Notifier<PublishUpdate>,
}

pub struct PublishActorState {
    interpreter: Interpreter<PublishMachine>,
    notify: Notifier<PublishUpdate>,
}

#[derive(Debug)]
pub enum PublishMsg {
    Publish,
    Unpublish,
    Service(Delivery<PublishEvent>),
    GetState(RpcReplyPort<PublishState>),
}

#[async_trait]
impl Actor for PublishActor {
    type Msg = PublishMsg;
    type State = PublishActorState;
    type Arguments = PublishArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::debug!(
            actor_id = %myself.get_id(),
            dashboard_id = %args.dashboard_id,
            published = args.published,
            "PublishActor starting"
        );
        let context = PublishContext {
            store: args.store,
            dashboard_id: args.dashboard_id,
            published: args.published,
        };
        let mut interpreter = Interpreter::new(
            Arc::new(definition(args.published)?),
            context,
            actor_sink(&myself, PublishMsg::Service),
        );
        interpreter.start();
        Ok(PublishActorState {
            interpreter,
            notify: args.notify,
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let commands = match message {
            PublishMsg::Publish => state.interpreter.send(PublishEvent::Publish),
            PublishMsg::Unpublish => state.interpreter.send(PublishEvent::Unpublish),
            PublishMsg::Service(delivery) => state.interpreter.deliver(delivery),
            PublishMsg::GetState(reply) => {
                let current = state
                    .interpreter
                    .active_states()
                    .first()
                    .copied()
                    .unwrap_or(PublishState::Unpublished);
                let _ = reply.send(current);
                return Ok(());
            }
        };
        for command in commands {
            match command {
                PublishCommand::Changed {
                    published,
                    updated_at,
                } => (state.notify)(PublishUpdate::Changed {
                    published,
                    updated_at,
                }),
                PublishCommand::Failed(error) => {
                    let ctx = state.interpreter.context();
                    tracing::warn!(
                        dashboard_id = %ctx.dashboard_id,
                        published = ctx.published,
                        error = %error,
                        "Publish state change failed"
                    );
                    (state.notify)(PublishUpdate::Failed(error));
                }
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.interpreter.stop();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InMemoryStore, ResourcePayload};
    use shared_types::Dashboard;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_publish_round_trip() {
        let store = InMemoryStore::new();
        store.seed(ResourcePayload::Dashboard(Dashboard::new("d1", "Ops")));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (actor, _handle) = Actor::spawn(
            None,
            PublishActor,
            PublishArguments {
                dashboard_id: "d1".to_string(),
                published: false,
                store: Arc::new(store.clone()),
                notify: Arc::new(move |update: PublishUpdate| {
                    let _ = tx.send(update);
                }),
            },
        )
        .await
        .unwrap();

        ractor::cast!(actor, PublishMsg::Publish).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            ractor::call!(actor, PublishMsg::GetState).unwrap(),
            PublishState::Published
        );
        assert!(matches!(
            rx.try_recv().unwrap(),
            PublishUpdate::Changed { published: true, .. }
        ));
        assert_eq!(store.publishes().await, vec![("d1".to_string(), true)]);

        actor.stop(None);
    }

    #[tokio::test]
    async fn test_failure_can_be_retried() {
        let store = InMemoryStore::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (actor, _handle) = Actor::spawn(
            None,
            PublishActor,
            PublishArguments {
                dashboard_id: "missing".to_string(),
                published: false,
                store: Arc::new(store.clone()),
                notify: Arc::new(move |update: PublishUpdate| {
                    let _ = tx.send(update);
                }),
            },
        )
        .await
        .unwrap();

        ractor::cast!(actor, PublishMsg::Publish).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            ractor::call!(actor, PublishMsg::GetState).unwrap(),
            PublishState::Error
        );
        assert!(matches!(rx.try_recv().unwrap(), PublishUpdate::Failed(_)));

        store.seed(ResourcePayload::Dashboard(Dashboard::new("missing", "Now here")));
        ractor::cast!(actor, PublishMsg::Publish).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            ractor::call!(actor, PublishMsg::GetState).unwrap(),
            PublishState::Published
        );

        actor.stop(None);
    }
}
