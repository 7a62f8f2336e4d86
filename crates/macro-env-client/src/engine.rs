//! Client protocol engine.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use macro_env_core::{
    ClientConfig, EncodeError, Envelope, Operation, PING, PONG, Transport, TransportError,
    WireCodec,
};
use serde_json::Value;
use tokio::{sync::watch, time::Instant};
use uuid::Uuid;

/// Client error.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Environment timeout: no value for \"{env}\" after {after:?}")]
    Timeout { env: String, after: Duration },
    #[error("Variable \"{0}\" is managed by the holder")]
    ReservedKey(String),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("{0}")]
    Encode(#[from] EncodeError),
    #[error("Client engine shut down")]
    Shutdown,
}

/// An outstanding `get`.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    /// Variable requested.
    pub env: String,
    /// When the request was issued.
    pub issued_at: Instant,
}

type PendingTable = Mutex<HashMap<Uuid, PendingRequest>>;

/// Removes its entry from the pending table when dropped.
struct PendingGuard<'a> {
    table: &'a PendingTable,
    id: Uuid,
}

impl<'a> PendingGuard<'a> {
    fn register(table: &'a PendingTable, id: Uuid, env: &str) -> Self {
        if let Ok(mut pending) = table.lock() {
            pending.insert(
                id,
                PendingRequest {
                    env: env.to_string(),
                    issued_at: Instant::now(),
                },
            );
        }
        Self { table, id }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.table.lock() {
            pending.remove(&self.id);
        }
    }
}

/// Reads and writes environment variables through the holder.
///
/// Each `get` owns its bus subscription for exactly as long as it waits:
/// the subscription is taken before the request goes out and released when
/// the reply, the timeout or shutdown ends the call.
pub struct ClientEngine {
    transport: Arc<dyn Transport>,
    codec: WireCodec,
    config: ClientConfig,
    pending: Arc<PendingTable>,
    shutdown_tx: watch::Sender<bool>,
}

impl ClientEngine {
    /// Create an engine using the codec described by `config`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        let codec = WireCodec::from_config(&config.codec);
        Self::with_codec(transport, codec, config)
    }

    /// Create an engine with an explicit codec.
    #[must_use]
    pub fn with_codec(transport: Arc<dyn Transport>, codec: WireCodec, config: ClientConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            transport,
            codec,
            config,
            pending: Arc::new(Mutex::new(HashMap::new())),
            shutdown_tx,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Ask the holder for the value of `name`.
    ///
    /// Resolves with `Ok(None)` when the holder does not know the variable.
    ///
    /// # Errors
    /// Returns `Timeout` if no matching reply arrives within the reply
    /// timeout, `Shutdown` if the engine is shut down while waiting.
    pub async fn get(&self, name: &str) -> Result<Option<Value>, ClientError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let already_stopped = *shutdown_rx.borrow_and_update();
        if already_stopped {
            return Err(ClientError::Shutdown);
        }

        let request = Envelope::get(name);
        let text = self.codec.encode(&request)?;
        let id = request.id.unwrap_or_else(Uuid::new_v4);

        let mut inbox = self.transport.subscribe();
        let _pending = PendingGuard::register(&self.pending, id, name);

        self.transport.broadcast(text).await?;

        let timeout = self.config.reply_timeout();
        let reply = async {
            while let Some(text) = inbox.next().await {
                let Some(envelope) = self.codec.decode_or_skip(&text) else {
                    continue;
                };
                if envelope.operation != Operation::GetResponse {
                    tracing::debug!(env = %envelope.env, "ignoring bus message, not a get_response");
                    continue;
                }
                if !envelope.answers(&request) {
                    tracing::debug!(
                        env = %envelope.env,
                        id = ?envelope.id,
                        "ignoring reply for another request (waiting for \"{name}\")"
                    );
                    continue;
                }
                tracing::debug!(env = %name, "received value: {:?}", envelope.value);
                return Ok(envelope.value);
            }
            Err(ClientError::Transport(TransportError::Closed))
        };

        tokio::select! {
            biased;
            () = stopped(&mut shutdown_rx) => Err(ClientError::Shutdown),
            outcome = tokio::time::timeout(timeout, reply) => outcome.unwrap_or_else(|_| {
                tracing::debug!(env = %name, "no reply within {timeout:?}");
                Err(ClientError::Timeout {
                    env: name.to_string(),
                    after: timeout,
                })
            }),
        }
    }

    /// Ask the holder to bind `name` to `value`.
    ///
    /// The protocol carries no acknowledgement; a later `get` observes the change.
    ///
    /// # Errors
    /// Returns error if `name` is the liveness key or the broadcast fails.
    pub async fn set(&self, name: &str, value: Value) -> Result<(), ClientError> {
        if name == PING {
            return Err(ClientError::ReservedKey(name.to_string()));
        }
        self.publish(&Envelope::set(name, value)).await
    }

    /// Ask the holder to forget `name`.
    ///
    /// # Errors
    /// Returns error if `name` is the liveness key or the broadcast fails.
    pub async fn unset(&self, name: &str) -> Result<(), ClientError> {
        if name == PING {
            return Err(ClientError::ReservedKey(name.to_string()));
        }
        self.publish(&Envelope::unset(name)).await
    }

    async fn publish(&self, envelope: &Envelope) -> Result<(), ClientError> {
        if self.is_shut_down() {
            return Err(ClientError::Shutdown);
        }
        let text = self.codec.encode(envelope)?;
        self.transport.broadcast(text).await?;
        Ok(())
    }

    /// Whether a holder answers `PING` with `PONG`.
    ///
    /// Never fails: timeouts and unexpected values both read as `false`.
    pub async fn probe_liveness(&self) -> bool {
        match self.get(PING).await {
            Ok(Some(Value::String(value))) if value == PONG => {
                tracing::debug!("PING => PONG: environment holder is operational");
                true
            }
            Ok(other) => {
                tracing::debug!("environment holder is NOT operational: unexpected value {other:?}");
                false
            }
            Err(e) => {
                tracing::debug!("environment holder is NOT operational: {e}");
                false
            }
        }
    }

    /// Snapshot of the outstanding `get` calls.
    #[must_use]
    pub fn pending_requests(&self) -> Vec<PendingRequest> {
        self.pending
            .lock()
            .map(|pending| pending.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of outstanding `get` calls.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|pending| pending.len()).unwrap_or(0)
    }

    /// Fail every in-flight and future call with `Shutdown`.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

async fn stopped(rx: &mut watch::Receiver<bool>) {
    loop {
        let stop = *rx.borrow_and_update();
        if stop {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone with the engine; nothing will ever stop us.
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use macro_env_core::{LocalBus, Subscription};
    use serde_json::json;
    use tokio::task::JoinHandle;

    fn engine(bus: &LocalBus) -> ClientEngine {
        ClientEngine::new(Arc::new(bus.clone()), ClientConfig::default())
    }

    /// Answers every `get` on the bus with whatever `answer` returns.
    fn spawn_responder<F>(bus: &LocalBus, answer: F) -> JoinHandle<()>
    where
        F: Fn(&Envelope) -> Option<Envelope> + Send + 'static,
    {
        let mut inbox: Subscription = bus.subscribe();
        let bus = bus.clone();
        tokio::spawn(async move {
            let codec = WireCodec::plain();
            while let Some(text) = inbox.next().await {
                let Ok(request) = codec.decode(&text) else {
                    continue;
                };
                if request.operation != Operation::Get {
                    continue;
                }
                if let Some(reply) = answer(&request) {
                    bus.broadcast(codec.encode(&reply).unwrap()).await.unwrap();
                }
            }
        })
    }

    #[tokio::test]
    async fn test_get_resolves_with_reply() {
        let bus = LocalBus::new();
        let responder = spawn_responder(&bus, |req| Some(req.reply(Some(json!(1234)))));
        let engine = engine(&bus);

        let value = engine.get("DEVICE_SECRET").await.unwrap();
        assert_eq!(value, Some(json!(1234)));
        assert_eq!(engine.pending_count(), 0);

        responder.abort();
    }

    #[tokio::test]
    async fn test_not_found_is_not_an_error() {
        let bus = LocalBus::new();
        let responder = spawn_responder(&bus, |req| Some(req.reply(None)));
        let engine = engine(&bus);

        tokio_test::assert_ok!(engine.get("MISSING").await);
        responder.abort();
    }

    #[tokio::test]
    async fn test_concurrent_gets_for_same_name_stay_separate() {
        let bus = LocalBus::new();
        let responder = spawn_responder(&bus, |req| {
            let id = req.id.map(|id| id.to_string());
            Some(req.reply(Some(json!(id))))
        });
        let engine = engine(&bus);

        let (first, second) = tokio::join!(engine.get("A"), engine.get("A"));
        let (first, second) = (first.unwrap(), second.unwrap());
        assert!(first.is_some());
        assert_ne!(first, second);

        responder.abort();
    }

    #[tokio::test]
    async fn test_reply_without_id_matches_by_name() {
        let bus = LocalBus::new();
        let responder = spawn_responder(&bus, |req| {
            let mut reply = req.reply(Some(json!("legacy")));
            reply.id = None;
            Some(reply)
        });
        let engine = engine(&bus);

        assert_eq!(engine.get("A").await.unwrap(), Some(json!("legacy")));
        responder.abort();
    }

    #[tokio::test]
    async fn test_ignores_chatter_and_other_variables() {
        let bus = LocalBus::new();
        let noisy = bus.clone();
        let responder = spawn_responder(&bus, move |_| {
            let bus = noisy.clone();
            let decoy = Envelope::get("OTHER").reply(Some(json!("wrong")));
            let decoy = WireCodec::plain().encode(&decoy).unwrap();
            tokio::spawn(async move {
                bus.broadcast("hello world".to_string()).await.unwrap();
                bus.broadcast(decoy).await.unwrap();
            });
            None
        });
        let late = spawn_responder(&bus, |req| Some(req.reply(Some(json!("right")))));
        let engine = engine(&bus);

        assert_eq!(engine.get("A").await.unwrap(), Some(json!("right")));
        responder.abort();
        late.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_subscription() {
        let bus = LocalBus::new();
        let engine = engine(&bus);

        let started = Instant::now();
        let err = engine.get("DEVICE_SECRET").await.unwrap_err();

        assert!(matches!(err, ClientError::Timeout { ref env, .. } if env == "DEVICE_SECRET"));
        assert!(started.elapsed() >= engine.config().reply_timeout());
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_without_holder_waits_full_timeout() {
        let bus = LocalBus::new();
        let engine = engine(&bus);

        let started = Instant::now();
        assert!(!engine.probe_liveness().await);
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_probe_rejects_unexpected_value() {
        let bus = LocalBus::new();
        let responder = spawn_responder(&bus, |req| Some(req.reply(Some(json!("PANG")))));
        let engine = engine(&bus);

        assert!(!engine.probe_liveness().await);
        responder.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_ends_inflight_get() {
        let bus = LocalBus::new();
        let engine = Arc::new(engine(&bus));

        let waiting = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.get("A").await })
        };
        while engine.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        engine.shutdown();

        assert!(matches!(waiting.await.unwrap(), Err(ClientError::Shutdown)));
        assert_eq!(bus.subscriber_count(), 0);
        assert!(matches!(engine.get("A").await, Err(ClientError::Shutdown)));
        assert!(matches!(
            engine.set("A", json!(1)).await,
            Err(ClientError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_set_ping_rejected_locally() {
        let bus = LocalBus::new();
        let mut feed = bus.subscribe();
        let engine = engine(&bus);

        assert!(matches!(
            engine.set(PING, json!("x")).await,
            Err(ClientError::ReservedKey(_))
        ));
        assert!(engine.unset(PING).await.is_err());

        engine.set("A", json!(1)).await.unwrap();
        let sent = WireCodec::plain().decode(&feed.next().await.unwrap()).unwrap();
        assert_eq!(sent.operation, Operation::Set);
        assert_eq!(sent.env, "A");
    }

    #[tokio::test]
    async fn test_pending_requests_visible_while_waiting() {
        let bus = LocalBus::new();
        let engine = Arc::new(engine(&bus));
        let mut feed = bus.subscribe();

        let waiting = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.get("ROOM").await })
        };

        // Once the request is on the bus it is registered.
        let request = WireCodec::plain().decode(&feed.next().await.unwrap()).unwrap();
        let pending = engine.pending_requests();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].env, "ROOM");

        let reply = WireCodec::plain().encode(&request.reply(None)).unwrap();
        bus.broadcast(reply).await.unwrap();
        assert_eq!(waiting.await.unwrap().unwrap(), None);
        assert!(engine.pending_requests().is_empty());
    }
}
