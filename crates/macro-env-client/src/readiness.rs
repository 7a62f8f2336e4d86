//! Startup liveness loop.

use std::sync::Arc;

use tokio::sync::watch;

use crate::engine::ClientEngine;

/// Whether the environment holder can be relied on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Probing has not finished yet.
    Pending,
    /// The holder answered a liveness probe.
    Ready,
    /// Every probe failed; dependent features should degrade.
    NotReady,
}

impl Readiness {
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl ClientEngine {
    /// Probe the holder until it answers or the retry budget runs out.
    ///
    /// After failed attempt `i` the loop waits `i² × base delay` before the
    /// next one; that wait comes on top of the reply timeout spent by the
    /// probe itself.
    pub async fn await_environment(&self) -> Readiness {
        let attempts = self.config().liveness_retries;

        for attempt in 0..attempts {
            if self.probe_liveness().await {
                tracing::info!("environment holder is operational");
                return Readiness::Ready;
            }
            if self.is_shut_down() {
                break;
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(self.config().retry_delay(attempt)).await;
            }
        }

        tracing::warn!("no response from the environment holder after {attempts} attempts, is it running?");
        Readiness::NotReady
    }

    /// Run [`Self::await_environment`] in the background.
    ///
    /// The receiver starts at `Pending` and changes exactly once.
    pub fn spawn_readiness_probe(self: &Arc<Self>) -> watch::Receiver<Readiness> {
        let (tx, rx) = watch::channel(Readiness::Pending);
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let readiness = engine.await_environment().await;
            let _ = tx.send(readiness);
        });
        rx
    }
}
