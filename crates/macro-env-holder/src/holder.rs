//! Holder message loop.

use std::sync::Arc;

use macro_env_core::{EnvStorage, HolderConfig, Subscription, Transport, WireCodec};
use tokio::{sync::oneshot, task::JoinHandle};

use crate::{
    handler::{Disposition, HolderHandler},
    store::EnvironmentStore,
};

/// Environment holder process.
pub struct Holder;

impl Holder {
    /// Bootstrap a store from `config` and start answering on `transport`.
    ///
    /// `storage` is only used when `config.durable` is set.
    pub async fn start(
        config: &HolderConfig,
        transport: Arc<dyn Transport>,
        storage: Option<Arc<dyn EnvStorage>>,
    ) -> HolderHandle {
        let storage = if config.durable {
            if storage.is_none() {
                tracing::warn!("durable mode requested without storage, staying volatile");
            }
            storage
        } else {
            None
        };

        let sniffer = config.trace_messages.then(|| spawn_sniffer(transport.subscribe()));

        let store = EnvironmentStore::bootstrap(config.defaults.clone(), storage).await;
        let handler = HolderHandler::new(store, WireCodec::from_config(&config.codec));

        let mut handle = Self::spawn(handler, transport);
        handle.sniffer = sniffer;
        handle
    }

    /// Run `handler` against `transport` in a background task.
    ///
    /// The subscription is taken before this returns, so requests broadcast
    /// right after are not missed.
    #[must_use]
    pub fn spawn(handler: HolderHandler, transport: Arc<dyn Transport>) -> HolderHandle {
        let inbox = transport.subscribe();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run(handler, transport, inbox, shutdown_rx));

        HolderHandle {
            shutdown_tx: Some(shutdown_tx),
            task,
            sniffer: None,
        }
    }
}

/// Handle to a running holder.
///
/// Dropping the handle stops the message loop and the sniffer.
pub struct HolderHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<EnvironmentStore>,
    sniffer: Option<Sniffer>,
}

/// Aborts the sniffer task when dropped.
struct Sniffer(JoinHandle<()>);

impl Drop for Sniffer {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl HolderHandle {
    /// Stop answering and hand back the store.
    ///
    /// # Errors
    /// Returns error if the holder task panicked.
    pub async fn shutdown(mut self) -> Result<EnvironmentStore, tokio::task::JoinError> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        drop(self.sniffer.take());
        self.task.await
    }
}

async fn run(
    mut handler: HolderHandler,
    transport: Arc<dyn Transport>,
    mut inbox: Subscription,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> EnvironmentStore {
    tracing::info!(vars = handler.store().len(), "environment holder listening");

    loop {
        let text = tokio::select! {
            biased;
            _ = &mut shutdown_rx => break,
            next = inbox.next() => match next {
                Some(text) => text,
                None => {
                    tracing::info!("bus closed, holder stopping");
                    break;
                }
            },
        };

        // Replies to our own get_response echoes are filtered by the handler.
        if let Disposition::Replied(reply) = handler.handle(&text).await {
            let encoded = match handler.codec().encode(&reply) {
                Ok(encoded) => encoded,
                Err(e) => {
                    tracing::error!("{e}");
                    continue;
                }
            };
            if let Err(e) = transport.broadcast(encoded).await {
                tracing::error!(env = %reply.env, "failed to publish value: {e}");
            }
        }
    }

    handler.into_store()
}

fn spawn_sniffer(mut feed: Subscription) -> Sniffer {
    tracing::debug!("sniffer: logging every bus message");
    Sniffer(tokio::spawn(async move {
        while let Some(text) = feed.next().await {
            tracing::debug!("sniffer: {text}");
        }
    }))
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::storage::MemoryStorage;
    use crate::store::Mode;
    use macro_env_core::{Envelope, LocalBus, Operation, PING, PONG};
    use serde_json::json;

    async fn next_reply(feed: &mut Subscription, codec: &WireCodec) -> Envelope {
        loop {
            let text = feed.next().await.unwrap();
            if let Ok(envelope) = codec.decode(&text) {
                if envelope.operation == Operation::GetResponse {
                    return envelope;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_answers_over_bus() {
        let bus = LocalBus::new();
        let holder = Holder::start(&HolderConfig::default(), Arc::new(bus.clone()), None).await;
        let codec = WireCodec::plain();
        let mut feed = bus.subscribe();

        let request = Envelope::get(PING);
        bus.broadcast(codec.encode(&request).unwrap()).await.unwrap();

        let reply = next_reply(&mut feed, &codec).await;
        assert_eq!(reply.id, request.id);
        assert_eq!(reply.value, Some(json!(PONG)));

        let store = holder.shutdown().await.unwrap();
        assert_eq!(store.mode(), Mode::Volatile);
    }

    #[tokio::test]
    async fn test_shutdown_returns_mutated_store() {
        let bus = LocalBus::new();
        let holder = Holder::start(&HolderConfig::default(), Arc::new(bus.clone()), None).await;
        let codec = WireCodec::plain();
        let mut feed = bus.subscribe();

        bus.broadcast(codec.encode(&Envelope::set("ROOM", json!("Board"))).unwrap())
            .await
            .unwrap();
        // The holder handles messages in order, so once this is answered the set is applied.
        bus.broadcast(codec.encode(&Envelope::get("ROOM")).unwrap())
            .await
            .unwrap();
        assert_eq!(next_reply(&mut feed, &codec).await.value, Some(json!("Board")));

        let store = holder.shutdown().await.unwrap();
        assert_eq!(store.get("ROOM"), Some(&json!("Board")));
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_durable_start_uses_storage() {
        let bus = LocalBus::new();
        let storage = Arc::new(MemoryStorage::new());
        let config = HolderConfig {
            durable: true,
            trace_messages: true,
            ..HolderConfig::default()
        };

        let holder = Holder::start(&config, Arc::new(bus.clone()), Some(storage.clone())).await;
        assert!(storage.contents().unwrap().contains("DEVICE_SECRET"));
        assert_eq!(bus.subscriber_count(), 2);

        let store = holder.shutdown().await.unwrap();
        assert_eq!(store.mode(), Mode::Durable);
    }

    #[tokio::test]
    async fn test_dropping_handle_releases_all_subscriptions() {
        let bus = LocalBus::new();
        let config = HolderConfig {
            trace_messages: true,
            ..HolderConfig::default()
        };

        let holder = Holder::start(&config, Arc::new(bus.clone()), None).await;
        assert_eq!(bus.subscriber_count(), 2);
        drop(holder);

        tokio::time::timeout(Duration::from_secs(1), async {
            while bus.subscriber_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_storage_ignored_when_volatile() {
        let bus = LocalBus::new();
        let storage = Arc::new(MemoryStorage::new());
        let holder =
            Holder::start(&HolderConfig::default(), Arc::new(bus), Some(storage.clone())).await;
        assert_eq!(storage.contents(), None);
        holder.shutdown().await.unwrap();
    }
}
