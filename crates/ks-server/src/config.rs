//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use ks_core::{KsError, KsResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub limits: LimitsSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Health endpoint port. Defaults to the relay port + 1.
    #[serde(default)]
    pub health_port: Option<u16>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            health_port: None,
        }
    }
}

/// `[limits]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    #[serde(default = "default_output_buffer_bytes")]
    pub output_buffer_bytes: usize,
    #[serde(default = "default_input_max_bytes")]
    pub input_max_bytes: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_memory_check_interval_secs")]
    pub memory_check_interval_secs: u64,
    #[serde(default = "default_memory_high_water_mb")]
    pub memory_high_water_mb: u64,
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            output_buffer_bytes: default_output_buffer_bytes(),
            input_max_bytes: default_input_max_bytes(),
            idle_timeout_secs: default_idle_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            memory_check_interval_secs: default_memory_check_interval_secs(),
            memory_high_water_mb: default_memory_high_water_mb(),
            memory_limit_mb: default_memory_limit_mb(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_port() -> u16 {
    3000
}
fn default_output_buffer_bytes() -> usize {
    8192
}
fn default_input_max_bytes() -> usize {
    1000
}
fn default_idle_timeout_secs() -> u64 {
    180
}
fn default_sweep_interval_secs() -> u64 {
    30
}
fn default_memory_check_interval_secs() -> u64 {
    60
}
fn default_memory_high_water_mb() -> u64 {
    450
}
fn default_memory_limit_mb() -> u64 {
    512
}
fn default_connect_timeout_secs() -> u64 {
    30
}

/// Resolved server configuration (CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub health_port: u16,
    pub output_buffer_bytes: usize,
    pub input_max_bytes: usize,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub memory_check_interval: Duration,
    pub memory_high_water_mb: u64,
    pub memory_limit_mb: u64,
    pub connect_timeout: Duration,
}

impl ServerConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_port: Option<u16>,
        cli_idle_timeout: Option<u64>,
        cli_memory_high_water_mb: Option<u64>,
    ) -> KsResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| KsError::Other(format!("config parse error: {e}")))?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        Ok(Self::from_parts(
            file_config,
            cli_port,
            cli_idle_timeout,
            cli_memory_high_water_mb,
        ))
    }

    fn from_parts(
        file: ConfigFile,
        cli_port: Option<u16>,
        cli_idle_timeout: Option<u64>,
        cli_memory_high_water_mb: Option<u64>,
    ) -> Self {
        let port = cli_port.unwrap_or(file.server.port);
        // Saturates so a relay on the last port cannot wrap to port 0.
        let health_port = file
            .server
            .health_port
            .unwrap_or_else(|| port.saturating_add(1));
        let idle_timeout_secs = cli_idle_timeout.unwrap_or(file.limits.idle_timeout_secs);
        let memory_high_water_mb =
            cli_memory_high_water_mb.unwrap_or(file.limits.memory_high_water_mb);

        Self {
            port,
            health_port,
            output_buffer_bytes: file.limits.output_buffer_bytes,
            input_max_bytes: file.limits.input_max_bytes,
            idle_timeout: Duration::from_secs(idle_timeout_secs),
            sweep_interval: Duration::from_secs(file.limits.sweep_interval_secs),
            memory_check_interval: Duration::from_secs(file.limits.memory_check_interval_secs),
            memory_high_water_mb,
            memory_limit_mb: file.limits.memory_limit_mb,
            connect_timeout: Duration::from_secs(file.limits.connect_timeout_secs),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_parts(ConfigFile::default(), None, None, None)
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let file: ConfigFile = toml::from_str(
            r#"
            [server]
            port = 8080

            [limits]
            idle_timeout_secs = 60
            "#,
        )
        .unwrap();
        let config = ServerConfig::from_parts(file, None, None, None);
        assert_eq!(config.port, 8080);
        assert_eq!(config.health_port, 8081);
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.output_buffer_bytes, 8192);
        assert_eq!(config.input_max_bytes, 1000);
        assert_eq!(config.memory_high_water_mb, 450);
    }

    #[test]
    fn health_port_does_not_wrap_past_the_port_space() {
        let file: ConfigFile = toml::from_str("[server]\nport = 65535\n").unwrap();
        let config = ServerConfig::from_parts(file, None, None, None);
        assert_eq!(config.port, 65535);
        assert_eq!(config.health_port, 65535);
    }

    #[test]
    fn cli_overrides_win_over_file_values() {
        let file: ConfigFile = toml::from_str("[server]\nport = 8080\n").unwrap();
        let config = ServerConfig::from_parts(file, Some(9000), Some(45), Some(200));
        assert_eq!(config.port, 9000);
        assert_eq!(config.idle_timeout, Duration::from_secs(45));
        assert_eq!(config.memory_high_water_mb, 200);
    }
}
