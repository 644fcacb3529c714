//! NotificationCenter - session toast list
//!
//! Registered as `notifications`. Collects every `NOTIFICATION.SHOW`
//! broadcast until the user dismisses it.

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use shared_types::Notification;
use std::collections::VecDeque;

use crate::actors::event_bus::{subscribe, unsubscribe_owner, BusEvent, EventBusMsg, EventSubscriber};

/// Oldest toasts are dropped beyond this
const MAX_NOTIFICATIONS: usize = 50;

#[derive(Debug, Default)]
pub struct NotificationCenter;

pub struct NotificationCenterArguments {
    pub event_bus: ActorRef<EventBusMsg>,
}

pub struct NotificationCenterState {
    event_bus: ActorRef<EventBusMsg>,
    notifications: VecDeque<Notification>,
}

#[derive(Debug)]
pub enum NotificationMsg {
    List(RpcReplyPort<Vec<Notification>>),
    /// Replies whether a toast with that id was showing
    Dismiss {
        id: String,
        reply: RpcReplyPort<bool>,
    },
    Bus(BusEvent),
}

#[async_trait]
impl Actor for NotificationCenter {
    type Msg = NotificationMsg;
    type State = NotificationCenterState;
    type Arguments = NotificationCenterArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(actor_id = %myself.get_id(), "NotificationCenter starting");
        subscribe(
            &args.event_bus,
            "notification.show",
            None,
            EventSubscriber::new(&myself, NotificationMsg::Bus),
        )
        .await?;

        Ok(NotificationCenterState {
            event_bus: args.event_bus,
            notifications: VecDeque::new(),
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            NotificationMsg::List(reply) => {
                let _ = reply.send(state.notifications.iter().cloned().collect());
            }
            NotificationMsg::Dismiss { id, reply } => {
                let before = state.notifications.len();
                state.notifications.retain(|n| n.id != id);
                let _ = reply.send(state.notifications.len() != before);
            }
            NotificationMsg::Bus(BusEvent::NotificationShow { notification }) => {
                tracing::debug!(
                    level = ?notification.level,
                    message = %notification.message,
                    "Notification shown"
                );
                state.notifications.push_back(notification);
                while state.notifications.len() > MAX_NOTIFICATIONS {
                    state.notifications.pop_front();
                }
            }
            NotificationMsg::Bus(_) => {}
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let _ = unsubscribe_owner(&state.event_bus, myself.get_id());
        tracing::info!(actor_id = %myself.get_id(), "NotificationCenter stopped");
        Ok(())
    }
}

pub async fn list_notifications(
    center: &ActorRef<NotificationMsg>,
) -> Result<Vec<Notification>, ractor::RactorErr<NotificationMsg>> {
    ractor::call!(center, NotificationMsg::List)
}

pub async fn dismiss_notification(
    center: &ActorRef<NotificationMsg>,
    id: impl Into<String>,
) -> Result<bool, ractor::RactorErr<NotificationMsg>> {
    let id = id.into();
    ractor::call!(center, |reply| NotificationMsg::Dismiss { id, reply })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::event_bus::{publish_event, EventBusActor, EventBusArguments};
    use shared_types::NotificationLevel;
    use std::time::Duration;

    #[tokio::test]
    async fn test_collects_and_dismisses_toasts() {
        let (bus, _) = Actor::spawn(None, EventBusActor, EventBusArguments::default())
            .await
            .unwrap();
        let (center, _) = Actor::spawn(
            None,
            NotificationCenter,
            NotificationCenterArguments {
                event_bus: bus.clone(),
            },
        )
        .await
        .unwrap();

        let toast = Notification::new(NotificationLevel::Error, "Save failed");
        let toast_id = toast.id.clone();
        publish_event(&bus, BusEvent::NotificationShow { notification: toast }).unwrap();
        publish_event(
            &bus,
            BusEvent::DashboardDeleted {
                dashboard_id: "d1".to_string(),
            },
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let shown = list_notifications(&center).await.unwrap();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].message, "Save failed");

        assert!(dismiss_notification(&center, toast_id.clone()).await.unwrap());
        assert!(!dismiss_notification(&center, toast_id).await.unwrap());
        assert!(list_notifications(&center).await.unwrap().is_empty());

        center.stop(None);
        bus.stop(None);
    }

    #[tokio::test]
    async fn test_keeps_only_recent_toasts() {
        let (bus, _) = Actor::spawn(None, EventBusActor, EventBusArguments::default())
            .await
            .unwrap();
        let (center, _) = Actor::spawn(
            None,
            NotificationCenter,
            NotificationCenterArguments {
                event_bus: bus.clone(),
            },
        )
        .await
        .unwrap();

        for i in 0..(MAX_NOTIFICATIONS + 5) {
            let notification = Notification::new(NotificationLevel::Info, format!("toast {i}"));
            publish_event(&bus, BusEvent::NotificationShow { notification }).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let shown = list_notifications(&center).await.unwrap();
        assert_eq!(shown.len(), MAX_NOTIFICATIONS);
        assert_eq!(shown[0].message, "toast 5");

        center.stop(None);
        bus.stop(None);
    }
}
