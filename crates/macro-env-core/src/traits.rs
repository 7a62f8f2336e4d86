//! Collaborator traits: the host bus and persistent storage.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt, stream::BoxStream};
use thiserror::Error;

/// Transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,
    #[error("Send failed: {0}")]
    Send(String),
}

/// Live feed of bus messages.
///
/// Dropping the subscription unsubscribes; there is no other release path
/// to forget.
pub struct Subscription {
    stream: BoxStream<'static, String>,
}

impl Subscription {
    /// Wrap a stream of inbound text messages.
    pub fn new(stream: impl Stream<Item = String> + Send + 'static) -> Self {
        Self {
            stream: stream.boxed(),
        }
    }

    /// Next inbound message, or `None` once the bus is gone.
    pub async fn next(&mut self) -> Option<String> {
        self.stream.next().await
    }
}

impl Stream for Subscription {
    type Item = String;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.stream.poll_next_unpin(cx)
    }
}

/// Broadcast text bus shared by every macro on the endpoint.
///
/// Every broadcast is delivered to every current subscriber, the sender
/// included. No ordering is promised across senders.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a text message to all listeners.
    async fn broadcast(&self, text: String) -> Result<(), TransportError>;

    /// Start receiving messages. Messages sent before this call are not seen.
    fn subscribe(&self) -> Subscription;
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Stored environment not found")]
    NotFound,
    #[error("Storage capacity exceeded: {size} bytes over a limit of {limit}")]
    CapacityExceeded { size: usize, limit: usize },
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Durable home for the serialized environment.
#[async_trait]
pub trait EnvStorage: Send + Sync {
    /// Read the last saved document.
    async fn load(&self) -> Result<String, StorageError>;

    /// Replace the saved document.
    async fn save(&self, contents: &str) -> Result<(), StorageError>;
}
