//! Reactive responder to protocol envelopes.

use macro_env_core::{Envelope, Operation, WireCodec};

use crate::store::{EnvironmentStore, Mode, ReservedKeyError};

/// Why a message produced no action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Not decodable as an envelope.
    NotProtocol,
    /// A `get_response`, which only clients consume.
    Response,
    /// Missing or unknown operation.
    Unrecognized,
}

/// Outcome of handling one bus message.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// A `get` was answered with this envelope.
    Replied(Envelope),
    /// A `set` bound the variable.
    Stored { env: String },
    /// A `set` without value removed the variable.
    Removed { env: String },
    /// A `set` targeted the liveness key.
    Rejected(ReservedKeyError),
    Ignored(IgnoreReason),
}

/// Handles each inbound message on its own against the store.
///
/// No per-request state survives between calls.
#[derive(Debug)]
pub struct HolderHandler {
    store: EnvironmentStore,
    codec: WireCodec,
}

impl HolderHandler {
    #[must_use]
    pub const fn new(store: EnvironmentStore, codec: WireCodec) -> Self {
        Self { store, codec }
    }

    #[must_use]
    pub const fn store(&self) -> &EnvironmentStore {
        &self.store
    }

    #[must_use]
    pub const fn codec(&self) -> &WireCodec {
        &self.codec
    }

    #[must_use]
    pub fn into_store(self) -> EnvironmentStore {
        self.store
    }

    /// Decode and act on one bus message.
    pub async fn handle(&mut self, text: &str) -> Disposition {
        tracing::debug!("new bus message: {text}");
        let Some(envelope) = self.codec.decode_or_skip(text) else {
            return Disposition::Ignored(IgnoreReason::NotProtocol);
        };
        self.handle_envelope(envelope).await
    }

    /// Act on an already decoded envelope.
    pub async fn handle_envelope(&mut self, envelope: Envelope) -> Disposition {
        if envelope.env.is_empty() {
            tracing::debug!("envelope names no variable, ignoring");
            return Disposition::Ignored(IgnoreReason::NotProtocol);
        }
        match envelope.operation {
            Operation::Get => {
                tracing::debug!(env = %envelope.env, id = ?envelope.id, "value requested");
                let value = self.store.get(&envelope.env).cloned();
                if value.is_none() {
                    tracing::debug!(env = %envelope.env, "variable not found");
                }
                Disposition::Replied(envelope.reply(value))
            }
            Operation::GetResponse => {
                tracing::debug!(env = %envelope.env, "ignoring get_response");
                Disposition::Ignored(IgnoreReason::Response)
            }
            Operation::Set => self.apply_set(envelope).await,
            Operation::Unrecognized => {
                tracing::warn!(env = %envelope.env, "operation not supported, ignoring");
                Disposition::Ignored(IgnoreReason::Unrecognized)
            }
        }
    }

    async fn apply_set(&mut self, envelope: Envelope) -> Disposition {
        let Envelope { env, value, .. } = envelope;

        let outcome = match value {
            Some(value) => {
                tracing::info!(env = %env, "setting value: {value}");
                self.store.set(env.clone(), value).map(|_| Disposition::Stored { env })
            }
            None => {
                tracing::info!(env = %env, "removing variable");
                self.store.unset(&env).map(|_| Disposition::Removed { env })
            }
        };

        match outcome {
            Ok(done) => {
                if self.store.mode() == Mode::Durable {
                    // Best effort: the in-memory change stands either way.
                    if let Err(e) = self.store.save().await {
                        tracing::error!("could not persist environment: {e}");
                    }
                }
                done
            }
            Err(e) => {
                tracing::warn!("{e}, aborting");
                Disposition::Rejected(e)
            }
        }
    }
}
