//! Process memory governor.
//!
//! Samples resident memory on a fixed period and logs it next to the
//! active-session count. Crossing the high-water mark triggers an
//! opportunistic reclamation pass over the registry — a hint, never a
//! correctness dependency, and never grounds for terminating a session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sysinfo::{Pid, System};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use ks_core::{KsError, KsResult};

use crate::session::registry::SessionRegistry;

pub struct MemoryGovernor {
    registry: Arc<SessionRegistry>,
    check_interval: Duration,
    high_water_mb: u64,
    last_rss_mb: Arc<AtomicU64>,
    sys: System,
    pid: Pid,
}

impl MemoryGovernor {
    pub fn new(
        registry: Arc<SessionRegistry>,
        check_interval: Duration,
        high_water_mb: u64,
    ) -> KsResult<Self> {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| KsError::Other(format!("cannot resolve own pid: {e}")))?;
        Ok(Self {
            registry,
            check_interval,
            high_water_mb,
            last_rss_mb: Arc::new(AtomicU64::new(0)),
            sys: System::new(),
            pid,
        })
    }

    /// Shared view of the most recent sample, for the health endpoint.
    pub fn last_rss_handle(&self) -> Arc<AtomicU64> {
        self.last_rss_mb.clone()
    }

    fn sample_rss_mb(&mut self) -> u64 {
        self.sys.refresh_all();
        self.sys
            .process(self.pid)
            .map(|p| p.memory() / (1024 * 1024))
            .unwrap_or(0)
    }

    /// Run until the shutdown signal fires.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            check_secs = self.check_interval.as_secs(),
            high_water_mb = self.high_water_mb,
            "memory governor started"
        );
        let mut interval = tokio::time::interval(self.check_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let rss_mb = self.sample_rss_mb();
                    self.last_rss_mb.store(rss_mb, Ordering::Relaxed);
                    let sessions = self.registry.count().await;
                    info!(memory_mb = rss_mb, sessions, "memory check");
                    if rss_mb > self.high_water_mb {
                        warn!(
                            memory_mb = rss_mb,
                            high_water_mb = self.high_water_mb,
                            "memory high-water mark crossed, compacting registry"
                        );
                        self.registry.compact().await;
                    }
                }
                _ = shutdown.recv() => {
                    debug!("memory governor shutting down");
                    break;
                }
            }
        }
    }
}
