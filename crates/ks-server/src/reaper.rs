//! Idle-session reaper.
//!
//! Sweeps the registry on a fixed period and tears down sessions that have
//! gone quiet. The timeout notice is best effort — the peer may already be
//! gone — and the teardown itself rides on cleanup's idempotency, so a
//! session racing the sweep with its own disconnect is harmless.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use ks_core::ServerMessage;

use crate::session::cleanup::cleanup;
use crate::session::registry::SessionRegistry;

pub struct IdleReaper {
    registry: Arc<SessionRegistry>,
    sweep_interval: Duration,
    idle_timeout: Duration,
}

impl IdleReaper {
    pub fn new(
        registry: Arc<SessionRegistry>,
        sweep_interval: Duration,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            sweep_interval,
            idle_timeout,
        }
    }

    /// Run until the shutdown signal fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            sweep_secs = self.sweep_interval.as_secs(),
            idle_timeout_secs = self.idle_timeout.as_secs(),
            "idle reaper started"
        );
        let mut interval = tokio::time::interval(self.sweep_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    sweep_once(&self.registry, self.idle_timeout).await;
                }
                _ = shutdown.recv() => {
                    debug!("idle reaper shutting down");
                    break;
                }
            }
        }
    }
}

/// One sweep: notify and clean up every session idle past the threshold.
/// Returns the number of sessions reaped.
pub async fn sweep_once(registry: &SessionRegistry, idle_timeout: Duration) -> usize {
    let stale = registry.stale_sessions(idle_timeout).await;
    let mut reaped = 0;
    for (id, notify) in stale {
        warn!(session_id = %id, "closing idle session");
        // Best effort; ignored when the peer's queue is gone or full.
        let _ = notify.try_send(ServerMessage::error("Session timeout due to inactivity"));
        if cleanup(registry, &id).await {
            reaped += 1;
        }
    }
    if reaped > 0 {
        debug!(count = reaped, "reaper removed idle sessions");
    }
    reaped
}
