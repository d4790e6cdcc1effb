//! Read-only health endpoint.
//!
//! Reports active-session count and the memory governor's latest sample,
//! served on its own port so monitoring never contends with the relay.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tracing::info;

use ks_core::{KsError, KsResult};

use crate::session::registry::SessionRegistry;

#[derive(Clone)]
pub struct HealthState {
    pub registry: Arc<SessionRegistry>,
    pub last_rss_mb: Arc<AtomicU64>,
    pub memory_limit_mb: u64,
    pub started_at: Instant,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(state)
}

/// Serve the health endpoint until the process exits.
pub async fn serve(addr: SocketAddr, state: HealthState) -> KsResult<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| KsError::Transport(format!("health bind failed: {e}")))?;
    info!(addr = %addr, "health endpoint started");
    axum::serve(listener, router(state))
        .await
        .map_err(|e| KsError::Transport(format!("health server failed: {e}")))
}

async fn health(State(state): State<HealthState>) -> Json<serde_json::Value> {
    let used_mb = state.last_rss_mb.load(Ordering::Relaxed);
    let percent = if state.memory_limit_mb > 0 {
        used_mb * 100 / state.memory_limit_mb
    } else {
        0
    };
    Json(serde_json::json!({
        "status": "healthy",
        "memory": {
            "used_mb": used_mb,
            "limit_mb": state.memory_limit_mb,
            "percent": percent,
        },
        "sessions": {
            "active": state.registry.count().await,
        },
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}
