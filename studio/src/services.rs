//! Per-session collaborators handed to every aggregate actor

use ractor::ActorRef;
use std::sync::Arc;

use crate::actors::event_bus::{publish_event, BusEvent, EventBusMsg};
use crate::actors::layout_signals::LayoutSignals;
use crate::backend::{QueryExecutor, ResourceStore};
use crate::config::StudioConfig;
use crate::directory::Directory;

#[derive(Clone)]
pub struct SessionServices {
    inner: Arc<SessionServicesInner>,
}

struct SessionServicesInner {
    directory: Directory,
    event_bus: ActorRef<EventBusMsg>,
    store: Arc<dyn ResourceStore>,
    executor: Arc<dyn QueryExecutor>,
    config: StudioConfig,
    layout_signals: LayoutSignals,
}

impl std::fmt::Debug for SessionServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionServices")
            .field("event_bus", &self.inner.event_bus.get_id())
            .field("directory_entries", &self.inner.directory.snapshot().len())
            .finish_non_exhaustive()
    }
}

impl SessionServices {
    pub fn new(
        directory: Directory,
        event_bus: ActorRef<EventBusMsg>,
        store: Arc<dyn ResourceStore>,
        executor: Arc<dyn QueryExecutor>,
        config: StudioConfig,
        layout_signals: LayoutSignals,
    ) -> Self {
        Self {
            inner: Arc::new(SessionServicesInner {
                directory,
                event_bus,
                store,
                executor,
                config,
                layout_signals,
            }),
        }
    }

    pub fn directory(&self) -> &Directory {
        &self.inner.directory
    }

    pub fn event_bus(&self) -> &ActorRef<EventBusMsg> {
        &self.inner.event_bus
    }

    pub fn store(&self) -> Arc<dyn ResourceStore> {
        Arc::clone(&self.inner.store)
    }

    pub fn executor(&self) -> Arc<dyn QueryExecutor> {
        Arc::clone(&self.inner.executor)
    }

    pub fn config(&self) -> &StudioConfig {
        &self.inner.config
    }

    pub fn layout_signals(&self) -> &LayoutSignals {
        &self.inner.layout_signals
    }

    /// Publish on the session bus; a stopped bus only means the session is
    /// shutting down.
    pub fn publish(&self, event: BusEvent) {
        let topic = event.topic();
        if let Err(e) = publish_event(&self.inner.event_bus, event) {
            tracing::warn!(topic = %topic, error = %e, "Failed to publish bus event");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::actors::event_bus::{EventBusActor, EventBusArguments};
    use crate::backend::{InMemoryStore, ScriptedExecutor};
    use crate::config::PersistenceConfig;
    use ractor::Actor;

    /// Short timings so debounce and cooldown paths run in tests
    pub(crate) fn fast_config() -> StudioConfig {
        let mut config = StudioConfig::default();
        config.persistence = PersistenceConfig {
            debounce_ms: 200,
            complete_cooldown_ms: 100,
            failure_cooldown_ms: 300,
        };
        config.execution.grace_ms = 10;
        config.execution.poll_interval_ms = 20;
        config.execution.cooldown_ms = 300;
        config
    }

    pub(crate) async fn services(
        store: &InMemoryStore,
        executor: &ScriptedExecutor,
    ) -> SessionServices {
        let (event_bus, _handle) = Actor::spawn(None, EventBusActor, EventBusArguments::default())
            .await
            .unwrap();
        SessionServices::new(
            Directory::new(),
            event_bus,
            Arc::new(store.clone()),
            Arc::new(executor.clone()),
            fast_config(),
            LayoutSignals::new(64),
        )
    }
}
