//! Server configuration: TOML file + CLI overrides.
//!
//! Every value is validated at load time; an invalid configuration aborts
//! startup rather than limping along with a bad cap or a zero interval.

use serde::Deserialize;
use sideband_core::{SignalError, SignalResult};
use std::net::SocketAddr;
use std::path::Path;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub protocol: ProtocolSection,
    #[serde(default)]
    pub limits: LimitsSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    #[serde(default = "default_endpoint_path")]
    pub endpoint_path: String,
    #[serde(default = "default_connection_cap")]
    pub connection_cap: usize,
    /// Defaults to half the connection cap when absent.
    #[serde(default)]
    pub max_sessions: Option<usize>,
    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            endpoint_path: default_endpoint_path(),
            connection_cap: default_connection_cap(),
            max_sessions: None,
            cors_origin: default_cors_origin(),
        }
    }
}

/// `[session]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_session_ttl_ms")]
    pub ttl_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            ttl_ms: default_session_ttl_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

/// `[protocol]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolSection {
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default = "default_timestamp_skew_ms")]
    pub timestamp_skew_ms: u64,
    #[serde(default = "default_slow_peer_stall_ms")]
    pub slow_peer_stall_ms: u64,
    #[serde(default = "default_liveness_timeout_ms")]
    pub liveness_timeout_ms: u64,
}

impl Default for ProtocolSection {
    fn default() -> Self {
        Self {
            max_frame_bytes: default_max_frame_bytes(),
            timestamp_skew_ms: default_timestamp_skew_ms(),
            slow_peer_stall_ms: default_slow_peer_stall_ms(),
            liveness_timeout_ms: default_liveness_timeout_ms(),
        }
    }
}

/// `[limits]` section of the config TOML (per-remote-address caps).
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    #[serde(default = "default_creates_per_hour")]
    pub session_creates_per_hour: u32,
    #[serde(default = "default_joins_per_hour")]
    pub joins_per_hour: u32,
    #[serde(default = "default_messages_per_minute")]
    pub messages_per_minute: u32,
    #[serde(default = "default_connections_per_ip")]
    pub connections_per_ip: u32,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            session_creates_per_hour: default_creates_per_hour(),
            joins_per_hour: default_joins_per_hour(),
            messages_per_minute: default_messages_per_minute(),
            connections_per_ip: default_connections_per_ip(),
        }
    }
}

fn default_listen_address() -> String {
    "127.0.0.1:9460".to_string()
}
fn default_endpoint_path() -> String {
    "/ws".to_string()
}
fn default_connection_cap() -> usize {
    10_000
}
fn default_cors_origin() -> String {
    "*".to_string()
}
fn default_session_ttl_ms() -> u64 {
    3_600_000
}
fn default_sweep_interval_ms() -> u64 {
    300_000
}
fn default_max_frame_bytes() -> usize {
    1_048_576
}
fn default_timestamp_skew_ms() -> u64 {
    300_000
}
fn default_slow_peer_stall_ms() -> u64 {
    30_000
}
fn default_liveness_timeout_ms() -> u64 {
    65_000
}
fn default_creates_per_hour() -> u32 {
    10
}
fn default_joins_per_hour() -> u32 {
    20
}
fn default_messages_per_minute() -> u32 {
    100
}
fn default_connections_per_ip() -> u32 {
    5
}

/// Resolved server configuration (file values merged with CLI overrides,
/// all fields validated).
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_address: SocketAddr,
    pub endpoint_path: String,
    pub connection_cap: usize,
    pub max_sessions: usize,
    pub cors_origin: String,
    pub session_ttl_ms: u64,
    pub sweep_interval_ms: u64,
    pub max_frame_bytes: usize,
    pub timestamp_skew_ms: u64,
    pub slow_peer_stall_ms: u64,
    pub liveness_timeout_ms: u64,
    pub session_creates_per_hour: u32,
    pub joins_per_hour: u32,
    pub messages_per_minute: u32,
    pub connections_per_ip: u32,
}

impl Default for Config {
    fn default() -> Self {
        // Defaults are always valid.
        Config::resolve(ConfigFile::default(), None, None, None, None).unwrap()
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply CLI overrides.
    ///
    /// A missing file falls back to defaults; an unreadable or invalid file
    /// is an error.
    pub fn load(
        config_path: Option<&Path>,
        cli_listen: Option<&str>,
        cli_endpoint_path: Option<&str>,
        cli_session_ttl_ms: Option<u64>,
        cli_connection_cap: Option<usize>,
    ) -> SignalResult<Self> {
        let file_config = if let Some(path) = config_path {
            if path.exists() {
                info!(path = %path.display(), "loading config file");
                let content = std::fs::read_to_string(path)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| SignalError::Config(format!("config parse error: {e}")))?
            } else {
                info!(path = %path.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        Self::resolve(
            file_config,
            cli_listen,
            cli_endpoint_path,
            cli_session_ttl_ms,
            cli_connection_cap,
        )
    }

    fn resolve(
        file: ConfigFile,
        cli_listen: Option<&str>,
        cli_endpoint_path: Option<&str>,
        cli_session_ttl_ms: Option<u64>,
        cli_connection_cap: Option<usize>,
    ) -> SignalResult<Self> {
        let listen_str = cli_listen.unwrap_or(&file.server.listen_address);
        let listen_address: SocketAddr = listen_str
            .parse()
            .map_err(|e| SignalError::Config(format!("invalid listen_address {listen_str:?}: {e}")))?;

        let endpoint_path = cli_endpoint_path
            .map(str::to_string)
            .unwrap_or(file.server.endpoint_path);
        let connection_cap = cli_connection_cap.unwrap_or(file.server.connection_cap);
        let max_sessions = file.server.max_sessions.unwrap_or(connection_cap / 2);

        let config = Self {
            listen_address,
            endpoint_path,
            connection_cap,
            max_sessions,
            cors_origin: file.server.cors_origin,
            session_ttl_ms: cli_session_ttl_ms.unwrap_or(file.session.ttl_ms),
            sweep_interval_ms: file.session.sweep_interval_ms,
            max_frame_bytes: file.protocol.max_frame_bytes,
            timestamp_skew_ms: file.protocol.timestamp_skew_ms,
            slow_peer_stall_ms: file.protocol.slow_peer_stall_ms,
            liveness_timeout_ms: file.protocol.liveness_timeout_ms,
            session_creates_per_hour: file.limits.session_creates_per_hour,
            joins_per_hour: file.limits.joins_per_hour,
            messages_per_minute: file.limits.messages_per_minute,
            connections_per_ip: file.limits.connections_per_ip,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> SignalResult<()> {
        if !self.endpoint_path.starts_with('/') {
            return Err(SignalError::Config(format!(
                "endpoint_path must start with '/': {:?}",
                self.endpoint_path
            )));
        }
        for (name, value) in [
            ("connection_cap", self.connection_cap as u64),
            ("max_sessions", self.max_sessions as u64),
            ("session.ttl_ms", self.session_ttl_ms),
            ("session.sweep_interval_ms", self.sweep_interval_ms),
            ("protocol.max_frame_bytes", self.max_frame_bytes as u64),
            ("protocol.slow_peer_stall_ms", self.slow_peer_stall_ms),
            ("protocol.liveness_timeout_ms", self.liveness_timeout_ms),
        ] {
            if value == 0 {
                return Err(SignalError::Config(format!("{name} must be non-zero")));
            }
        }
        if self.max_sessions > self.connection_cap {
            return Err(SignalError::Config(
                "max_sessions cannot exceed connection_cap".into(),
            ));
        }
        Ok(())
    }
}
