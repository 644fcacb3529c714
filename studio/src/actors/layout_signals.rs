//! Session-wide multicast of cell position changes
//!
//! Drag handles, resize handles and keyboard nudges all emit here instead of
//! messaging the dashboard themselves. Each dashboard's grid holds one
//! subscription filtered by its id, so however many emitters are active the
//! dashboard sees one ordered stream and its persistence debounce is reset
//! by every signal rather than each emitter running its own timer.

use futures::stream::{self, BoxStream, StreamExt};
use shared_types::LayoutItem;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq)]
pub struct LayoutSignal {
    pub dashboard_id: String,
    pub item: LayoutItem,
}

#[derive(Clone)]
pub struct LayoutSignals {
    sender: broadcast::Sender<LayoutSignal>,
}

impl LayoutSignals {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns how many grids received the signal
    pub fn emit(&self, dashboard_id: impl Into<String>, item: LayoutItem) -> usize {
        let signal = LayoutSignal {
            dashboard_id: dashboard_id.into(),
            item,
        };
        self.sender.send(signal).unwrap_or(0)
    }

    pub fn subscribe(&self, dashboard_id: impl Into<String>) -> LayoutSubscription {
        LayoutSubscription {
            dashboard_id: dashboard_id.into(),
            receiver: self.sender.subscribe(),
        }
    }
}

pub struct LayoutSubscription {
    dashboard_id: String,
    receiver: broadcast::Receiver<LayoutSignal>,
}

impl LayoutSubscription {
    /// Next signal for this dashboard; `None` once the hub is gone
    pub async fn recv(&mut self) -> Option<LayoutSignal> {
        loop {
            match self.receiver.recv().await {
                Ok(signal) if signal.dashboard_id == self.dashboard_id => return Some(signal),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        dashboard_id = %self.dashboard_id,
                        skipped,
                        "Layout subscriber lagged"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> BoxStream<'static, LayoutSignal> {
        stream::unfold(self, |mut subscription| async move {
            subscription
                .recv()
                .await
                .map(|signal| (signal, subscription))
        })
        .boxed()
    }
}
