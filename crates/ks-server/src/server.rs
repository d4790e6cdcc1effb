//! Top-level server: owns the registry and the shared services, accepts
//! WebSocket connections, and runs the shutdown sweep.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;
use tracing::{info, warn};

use ks_core::{KsError, KsResult, ServerMessage};

use crate::config::ServerConfig;
use crate::health::{self, HealthState};
use crate::memory::MemoryGovernor;
use crate::reaper::IdleReaper;
use crate::relay::RelayService;
use crate::session::cleanup::cleanup;
use crate::session::registry::SessionRegistry;
use crate::shell::ssh::SshConnector;
use crate::shell::RemoteShellConnector;
use crate::transport::websocket::{self, WsTransport};

/// The KeySocket relay server instance.
pub struct RelayServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    connector: Arc<dyn RemoteShellConnector>,
}

impl RelayServer {
    /// Create a server that opens real SSH shells.
    pub fn new(config: ServerConfig) -> Self {
        let connector = Arc::new(SshConnector::new(config.connect_timeout));
        Self::with_connector(config, connector)
    }

    /// Create a server with a custom remote-shell connector.
    pub fn with_connector(config: ServerConfig, connector: Arc<dyn RemoteShellConnector>) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.output_buffer_bytes));
        Self {
            config,
            registry,
            connector,
        }
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Accept connections until `shutdown` resolves, then close every
    /// remaining session before returning.
    pub async fn run<F>(self, shutdown: F) -> KsResult<()>
    where
        F: Future<Output = ()>,
    {
        let addr: SocketAddr = format!("0.0.0.0:{}", self.config.port)
            .parse()
            .map_err(|e| KsError::Other(format!("invalid address: {e}")))?;
        let health_addr: SocketAddr = format!("0.0.0.0:{}", self.config.health_port)
            .parse()
            .map_err(|e| KsError::Other(format!("invalid address: {e}")))?;

        let mut ws_rx = websocket::start_listener(addr).await?;

        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        let reaper = IdleReaper::new(
            self.registry.clone(),
            self.config.sweep_interval,
            self.config.idle_timeout,
        );
        tokio::spawn(reaper.run(shutdown_tx.subscribe()));

        let governor = MemoryGovernor::new(
            self.registry.clone(),
            self.config.memory_check_interval,
            self.config.memory_high_water_mb,
        )?;
        let health_state = HealthState {
            registry: self.registry.clone(),
            last_rss_mb: governor.last_rss_handle(),
            memory_limit_mb: self.config.memory_limit_mb,
            started_at: Instant::now(),
        };
        tokio::spawn(governor.run(shutdown_tx.subscribe()));
        tokio::spawn(async move {
            if let Err(e) = health::serve(health_addr, health_state).await {
                warn!(error = %e, "health endpoint failed");
            }
        });

        let relay = RelayService::new(
            self.registry.clone(),
            self.connector.clone(),
            self.config.input_max_bytes,
        );

        info!(
            port = self.config.port,
            health_port = self.config.health_port,
            idle_timeout_secs = self.config.idle_timeout.as_secs(),
            output_buffer_bytes = self.config.output_buffer_bytes,
            "keysocket relay ready"
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                conn = ws_rx.recv() => match conn {
                    Some(conn) => {
                        let relay = relay.clone();
                        let source = conn.remote_addr.ip().to_string();
                        tokio::spawn(async move {
                            relay
                                .run_session(WsTransport::new(conn.ws_stream), source)
                                .await;
                        });
                    }
                    None => {
                        info!("listener closed, shutting down");
                        break;
                    }
                },
                _ = &mut shutdown => {
                    info!("received shutdown signal");
                    break;
                }
            }
        }

        let _ = shutdown_tx.send(());
        self.shutdown_sweep().await;
        Ok(())
    }

    /// Close every live session. Each peer gets a best-effort notice; the
    /// actual release goes through the same idempotent cleanup as every
    /// other trigger, so sessions racing their own teardown are fine.
    pub async fn shutdown_sweep(&self) {
        let entries = self.registry.all_sessions().await;
        info!(count = entries.len(), "closing all sessions for shutdown");
        for (id, notify) in entries {
            let _ = notify.try_send(ServerMessage::disconnected("Server shutting down"));
            cleanup(&self.registry, &id).await;
        }
    }
}
