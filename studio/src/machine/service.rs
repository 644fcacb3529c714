use futures::stream::{self, BoxStream, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::Machine;

type ServiceFactory<M> = Arc<
    dyn Fn(&<M as Machine>::Context, Option<&<M as Machine>::Event>) -> BoxStream<'static, <M as Machine>::Event>
        + Send
        + Sync,
>;

/// Identity of one running service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InvocationId(pub(crate) u64);

/// Event produced by a running service, tagged with the instance that
/// produced it so late results from a cancelled service can be dropped.
#[derive(Debug, Clone)]
pub struct Delivery<E> {
    pub invocation: InvocationId,
    pub event: E,
}

/// Where service output goes; normally a cast back into the host actor.
pub type DeliverySink<E> = Arc<dyn Fn(Delivery<E>) + Send + Sync>;

/// Long-running work bound to the lifetime of a state.
///
/// Every kind of service is modelled as a stream of machine events: a future
/// yields exactly one (its done or error event), a delayed event yields one
/// after sleeping, a subscription yields many.
pub struct Invocation<M: Machine> {
    pub(crate) name: &'static str,
    pub(crate) factory: ServiceFactory<M>,
}

impl<M: Machine> Invocation<M> {
    /// One-shot async call. The result is routed through `on_done` or
    /// `on_error` into the machine's own queue.
    pub fn future<T, E, F, Fut, D, R>(name: &'static str, make: F, on_done: D, on_error: R) -> Self
    where
        T: Send + 'static,
        E: Send + 'static,
        F: Fn(&M::Context, Option<&M::Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        D: Fn(T) -> M::Event + Clone + Send + Sync + 'static,
        R: Fn(E) -> M::Event + Clone + Send + Sync + 'static,
    {
        let factory: ServiceFactory<M> = Arc::new(move |ctx, event| {
            let call = make(ctx, event);
            let on_done = on_done.clone();
            let on_error = on_error.clone();
            stream::once(async move {
                match call.await {
                    Ok(value) => on_done(value),
                    Err(error) => on_error(error),
                }
            })
            .boxed()
        });
        Self { name, factory }
    }

    /// Push-stream subscription; every item is sent into the machine.
    pub fn stream<F>(name: &'static str, make: F) -> Self
    where
        F: Fn(&M::Context, Option<&M::Event>) -> BoxStream<'static, M::Event> + Send + Sync + 'static,
    {
        Self {
            name,
            factory: Arc::new(make),
        }
    }

    /// Delayed event; cancelled like any other service when the state is left.
    pub fn after<D>(name: &'static str, delay: D, event: M::Event) -> Self
    where
        D: Fn(&M::Context) -> Duration + Send + Sync + 'static,
    {
        let factory: ServiceFactory<M> = Arc::new(move |ctx, _| {
            let delay = delay(ctx);
            let event = event.clone();
            stream::once(async move {
                tokio::time::sleep(delay).await;
                event
            })
            .boxed()
        });
        Self { name, factory }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}
