//! Glue between interpreters and the ractor actors that own them

use ractor::{ActorRef, Message};
use std::sync::Arc;

use super::service::{Delivery, DeliverySink};

/// Route service output back into `actor`'s mailbox, wrapped as one of its
/// messages. Output for an actor that has already stopped is discarded.
pub fn actor_sink<Msg, E, F>(actor: &ActorRef<Msg>, wrap: F) -> DeliverySink<E>
where
    Msg: Message,
    E: Send + 'static,
    F: Fn(Delivery<E>) -> Msg + Send + Sync + 'static,
{
    let actor = actor.clone();
    Arc::new(move |delivery| {
        if let Err(e) = actor.cast(wrap(delivery)) {
            tracing::trace!(actor_id = %actor.get_id(), error = %e, "Service output for stopped actor");
        }
    })
}

/// Child-to-parent notification channel, independent of the parent's
/// message type.
pub type Notifier<T> = Arc<dyn Fn(T) + Send + Sync>;

pub fn notifier<Msg, T, F>(parent: &ActorRef<Msg>, wrap: F) -> Notifier<T>
where
    Msg: Message,
    T: Send + 'static,
    F: Fn(T) -> Msg + Send + Sync + 'static,
{
    let parent = parent.clone();
    Arc::new(move |update| {
        if let Err(e) = parent.cast(wrap(update)) {
            tracing::debug!(parent = %parent.get_id(), error = %e, "Parent no longer accepts updates");
        }
    })
}
