//! RefreshActor - periodic re-run of a dashboard's data cells
//!
//! While `on`, a ticker stream invoked by the state emits one `Tick` per
//! interval. Changing the interval re-enters `on`, which restarts the ticker.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use std::sync::Arc;
use std::time::Duration;
use strum::EnumDiscriminants;

use crate::machine::{
    actor_sink, ActionScope, Delivery, DefinitionError, Interpreter, Invocation, Machine, MachineDefinition,
    MachineEvent, Notifier,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefreshState {
    Off,
    On,
}

#[derive(Debug, Clone, EnumDiscriminants)]
#[strum_discriminants(name(RefreshEventKind), derive(Hash))]
pub enum RefreshEvent {
    Enable(Duration),
    Disable,
    Tick,
}

impl MachineEvent for RefreshEvent {
    type Kind = RefreshEventKind;

    fn kind(&self) -> RefreshEventKind {
        self.into()
    }
}

pub struct RefreshContext {
    interval: Duration,
    ticks: u64,
}

#[derive(Debug)]
pub enum RefreshCommand {
    Refresh,
}

pub struct RefreshMachine;

impl Machine for RefreshMachine {
    type State = RefreshState;
    type Event = RefreshEvent;
    type Context = RefreshContext;
    type Command = RefreshCommand;
}

fn set_interval(s: &mut ActionScope<'_, RefreshMachine>) {
    let event = s.event;
    if let Some(RefreshEvent::Enable(interval)) = event {
        s.ctx.interval = *interval;
    }
}

/// Smallest accepted interval
const MIN_INTERVAL: Duration = Duration::from_secs(1);

pub fn definition() -> Result<MachineDefinition<RefreshMachine>, DefinitionError> {
    use RefreshEventKind as K;
    use RefreshState as S;
    type R = RefreshMachine;

    MachineDefinition::builder("refresh")
        .initial(S::Off)
        .state(R::atomic(S::Off).on(K::Enable, R::to(S::On).action(set_interval)))
        .state(
            R::atomic(S::On)
                .invoke(Invocation::<R>::stream("ticker", |ctx: &RefreshContext, _| {
                    let interval = ctx.interval;
                    stream::unfold((), move |_| async move {
                        tokio::time::sleep(interval).await;
                        Some((RefreshEvent::Tick, ()))
                    })
                    .boxed()
                }))
                .on(
                    K::Tick,
                    R::internal().action(|s| {
                        s.ctx.ticks += 1;
                        s.emit(RefreshCommand::Refresh);
                    }),
                )
                .on(K::Enable, R::to(S::On).reenter().action(set_interval))
                .on(K::Disable, R::to(S::Off)),
        )
        .build()
}

#[derive(Debug, Default)]
pub struct RefreshActor;

pub struct RefreshArguments {
    pub dashboard_id: String,
    pub notify: Notifier<()>,
    /// Floor applied to requested intervals
    pub min_interval: Option<Duration>,
}

pub struct RefreshActorState {
    dashboard_id: String,
    interpreter: Interpreter<RefreshMachine>,
    notify: Notifier<()>,
    min_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshSnapshot {
    pub interval: Option<Duration>,
    pub ticks: u64,
}

#[derive(Debug)]
pub enum RefreshMsg {
    /// `None` turns auto-refresh off
    SetInterval(Option<Duration>),
    Service(Delivery<RefreshEvent>),
    GetSnapshot(RpcReplyPort<RefreshSnapshot>),
}

#[async_trait]
impl Actor for RefreshActor {
    type Msg = RefreshMsg;
    type State = RefreshActorState;
    type Arguments = RefreshArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::debug!(
            actor_id = %myself.get_id(),
            dashboard_id = %args.dashboard_id,
            "RefreshActor starting"
        );
        let mut interpreter = Interpreter::new(
            Arc::new(definition()?),
            RefreshContext {
                interval: MIN_INTERVAL,
                ticks: 0,
            },
            actor_sink(&myself, RefreshMsg::Service),
        );
        interpreter.start();
        Ok(RefreshActorState {
            dashboard_id: args.dashboard_id,
            interpreter,
            notify: args.notify,
            min_interval: args.min_interval.unwrap_or(MIN_INTERVAL),
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let commands = match message {
            RefreshMsg::SetInterval(Some(interval)) => {
                let interval = interval.max(state.min_interval);
                tracing::debug!(
                    dashboard_id = %state.dashboard_id,
                    interval_ms = interval.as_millis() as u64,
                    "Auto-refresh enabled"
                );
                state.interpreter.send(RefreshEvent::Enable(interval))
            }
            RefreshMsg::SetInterval(None) => state.interpreter.send(RefreshEvent::Disable),
            RefreshMsg::Service(delivery) => state.interpreter.deliver(delivery),
            RefreshMsg::GetSnapshot(reply) => {
                let ctx = state.interpreter.context();
                let interval = state
                    .interpreter
                    .matches(RefreshState::On)
                    .then_some(ctx.interval);
                let _ = reply.send(RefreshSnapshot {
                    interval,
                    ticks: ctx.ticks,
                });
                return Ok(());
            }
        };
        for command in commands {
            match command {
                RefreshCommand::Refresh => (state.notify)(()),
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
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_ticks_until_disabled() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let (actor, _handle) = Actor::spawn(
            None,
            RefreshActor,
            RefreshArguments {
                dashboard_id: "d1".to_string(),
                notify: Arc::new(move |()| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
                min_interval: Some(Duration::from_millis(10)),
            },
        )
        .await
        .unwrap();

        ractor::cast!(actor, RefreshMsg::SetInterval(Some(Duration::from_millis(30)))).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        ractor::cast!(actor, RefreshMsg::SetInterval(None)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let ticked = count.load(Ordering::SeqCst);
        assert!(ticked >= 2, "expected at least two ticks, got {ticked}");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), ticked);

        let snapshot = ractor::call!(actor, RefreshMsg::GetSnapshot).unwrap();
        assert_eq!(snapshot.interval, None);

        actor.stop(None);
    }
}
