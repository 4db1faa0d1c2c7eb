//! Server configuration.
//!
//! Configuration is layered:
//! - The first existing file of `parley.toml`, `/etc/parley/parley.toml`,
//!   `~/.config/parley/parley.toml`
//! - Environment variables (`PARLEY_*`, `__` between section and key,
//!   e.g. `PARLEY_LIMITS__MAX_CONNECTIONS`; lists are comma-separated,
//!   e.g. `PARLEY_TRANSPORT__CORS_ORIGINS=https://a.example,https://b.example`)

use anyhow::{bail, Context, Result};
use parley_core::HubConfig;
use parley_protocol::Encoding;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

const CONFIG_PATHS: [&str; 3] = [
    "parley.toml",
    "/etc/parley/parley.toml",
    "~/.config/parley/parley.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Authentication configuration.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Message archive configuration.
    #[serde(default)]
    pub archive: ArchiveConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Encoding used when the client does not ask for one.
    #[serde(default)]
    pub default_encoding: Encoding,

    /// Browser origins allowed to call the HTTP API. Empty allows any origin.
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Shared HS256 secret for bearer tokens.
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: Option<String>,

    /// Clock skew tolerated on token expiry, in seconds.
    #[serde(default = "default_leeway")]
    pub leeway_secs: u64,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum WebSocket message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Maximum chat message content length in bytes.
    #[serde(default = "default_max_content_length")]
    pub max_content_length: usize,

    /// Outbound queue capacity per connection, in frames.
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,

    /// Upper bound on a single socket write, in milliseconds.
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Message archive configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Keep routed messages for the history endpoint.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum number of messages kept in memory.
    #[serde(default = "default_archive_capacity")]
    pub capacity: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("PARLEY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("PARLEY_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_jwt_secret() -> Option<String> {
    std::env::var("PARLEY_JWT_SECRET")
        .ok()
        .filter(|s| !s.is_empty())
}

fn default_leeway() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_cors_origins() -> Vec<String> {
    vec!["http://localhost:3000".to_string()]
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_message_size() -> usize {
    256 * 1024 // 256 KB
}

fn default_max_content_length() -> usize {
    64 * 1024 // 64 KB
}

fn default_outbound_capacity() -> usize {
    256
}

fn default_send_timeout() -> u64 {
    5_000
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_heartbeat_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_archive_capacity() -> usize {
    100_000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            auth: AuthConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            archive: ArchiveConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            default_encoding: Encoding::default(),
            cors_origins: default_cors_origins(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: default_jwt_secret(),
            leeway_secs: default_leeway(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
            max_content_length: default_max_content_length(),
            outbound_capacity: default_outbound_capacity(),
            send_timeout_ms: default_send_timeout(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: default_archive_capacity(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the default file locations and environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = CONFIG_PATHS
            .iter()
            .map(|p| shellexpand::tilde(p).into_owned())
            .find(|p| Path::new(p).exists())
        {
            tracing::info!("Loading configuration from {}", path);
            builder = builder.add_source(config::File::from(Path::new(&path)));
        }

        builder
            .add_source(
                config::Environment::with_prefix("PARLEY")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("transport.cors_origins")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// The JWT secret.
    ///
    /// # Errors
    ///
    /// Returns an error if no secret is configured.
    pub fn jwt_secret(&self) -> Result<&str> {
        match self.auth.jwt_secret.as_deref() {
            Some(secret) if !secret.is_empty() => Ok(secret),
            _ => bail!("No JWT secret configured: set PARLEY_JWT_SECRET or auth.jwt_secret"),
        }
    }

    /// Hub settings derived from the limits.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            outbound_capacity: self.limits.outbound_capacity,
            max_content_length: self.limits.max_content_length,
        }
    }

    /// Bound on a single socket write.
    #[must_use]
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.limits.send_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.transport.default_encoding, Encoding::Msgpack);
        assert_eq!(config.heartbeat.timeout_ms, 60_000);
        assert!(config.archive.enabled);
        assert_eq!(config.transport.cors_origins, vec!["http://localhost:3000"]);
    }

    #[test]
    fn test_config_bind_addr() {
        let mut config = Config::default();
        config.host = "127.0.0.1".into();
        config.port = 8080;
        assert_eq!(config.bind_addr().unwrap().port(), 8080);

        config.host = "not an address".into();
        assert!(config.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [transport]
            default_encoding = "json"
            cors_origins = []

            [auth]
            jwt_secret = "s3cret"

            [limits]
            max_connections = 50000
            outbound_capacity = 32
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.transport.default_encoding, Encoding::Json);
        assert!(config.transport.cors_origins.is_empty());
        assert_eq!(config.jwt_secret().unwrap(), "s3cret");
        assert_eq!(config.limits.max_connections, 50000);
        assert_eq!(config.hub_config().outbound_capacity, 32);
    }

    #[test]
    fn test_missing_secret_is_an_error() {
        let mut config = Config::default();
        config.auth.jwt_secret = None;
        assert!(config.jwt_secret().is_err());

        config.auth.jwt_secret = Some(String::new());
        assert!(config.jwt_secret().is_err());
    }
}
