//! In-process broadcast bus.

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

use crate::traits::{Subscription, Transport, TransportError};

/// Messages buffered per subscriber before the slowest one starts lagging.
const BUS_CAPACITY: usize = 1024;

/// Broadcast bus living inside one process.
///
/// Stands in for the endpoint's message bus: every macro gets a clone and
/// sees every message, including its own.
#[derive(Clone)]
pub struct LocalBus {
    sender: broadcast::Sender<String>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBus {
    /// Create a new bus.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl Transport for LocalBus {
    async fn broadcast(&self, text: String) -> Result<(), TransportError> {
        // Nobody listening is not an error on a broadcast bus.
        let _ = self.sender.send(text);
        Ok(())
    }

    fn subscribe(&self) -> Subscription {
        let live = BroadcastStream::new(self.sender.subscribe()).filter_map(|res| async move {
            match res {
                Ok(text) => Some(text),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!("bus subscriber lagged, {skipped} messages dropped");
                    None
                }
            }
        });
        Subscription::new(live)
    }
}
