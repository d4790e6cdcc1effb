//! ks-server: KeySocket relay server.
//!
//! Accepts WebSocket connections from browser terminals and relays them to
//! SSH shells, under bounded per-session buffering, idle reaping, and
//! memory monitoring.

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use ks_server::config::ServerConfig;
use ks_server::server::RelayServer;

/// ks-server — KeySocket SSH terminal relay
#[derive(Parser, Debug)]
#[command(name = "ks-server", version, about = "KeySocket SSH terminal relay")]
struct Cli {
    /// Listen port for WebSocket connections
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.keysocket/config.toml")]
    config: String,

    /// Idle timeout in seconds before a session is reaped
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Memory high-water mark in MiB
    #[arg(long)]
    memory_high_water_mb: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting ks-server");

    let config_path = PathBuf::from(&cli.config);
    let config = match ServerConfig::load(
        Some(&config_path),
        cli.port,
        cli.idle_timeout,
        cli.memory_high_water_mb,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let server = RelayServer::new(config);
    if let Err(e) = server.run(shutdown_signal()).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("ks-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
