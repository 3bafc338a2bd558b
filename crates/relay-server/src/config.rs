//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (RELAY_*)
//! - TOML configuration file

use anyhow::{bail, Context, Result};
use relay_core::{HubConfig, OverflowPolicy, SessionConfig};
use relay_protocol::codec::MAX_FRAME_SIZE;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Database path selecting the in-memory SQLite backend.
pub const IN_MEMORY_DATABASE: &str = ":memory:";

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

    /// Token verification.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Message storage.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

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
}

/// Token verification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 signing secret.
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: Option<String>,

    /// Lifetime of issued tokens in seconds.
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
}

/// Message storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path, or `:memory:`.
    #[serde(default = "default_database")]
    pub database: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Live messages admitted per connection and window.
    #[serde(default = "default_message_rate_limit")]
    pub message_rate_limit: usize,

    /// Live message rate window in milliseconds.
    #[serde(default = "default_message_rate_window")]
    pub message_rate_window_ms: u64,

    /// REST requests admitted per user and window.
    #[serde(default = "default_rest_rate_limit")]
    pub rest_rate_limit: usize,

    /// REST rate window in milliseconds.
    #[serde(default = "default_rest_rate_window")]
    pub rest_rate_window_ms: u64,

    /// Outbound queue capacity per session.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    /// Maximum WebSocket message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Maximum message body length in bytes.
    #[serde(default = "default_max_content_length")]
    pub max_content_length: usize,

    /// What to do when a session's outbound queue is full.
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Ping interval in milliseconds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,

    /// Read deadline in milliseconds.
    #[serde(default = "default_pong_wait")]
    pub pong_wait_ms: u64,
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
    std::env::var("RELAY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("RELAY_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_jwt_secret() -> Option<String> {
    std::env::var("RELAY_JWT_SECRET").ok().filter(|s| !s.is_empty())
}

fn default_token_ttl() -> u64 {
    24 * 60 * 60
}

fn default_database() -> String {
    std::env::var("RELAY_DATABASE").unwrap_or_else(|_| "relay.db".to_string())
}

fn default_message_rate_limit() -> usize {
    10
}

fn default_message_rate_window() -> u64 {
    1_000
}

fn default_rest_rate_limit() -> usize {
    60
}

fn default_rest_rate_window() -> u64 {
    60_000
}

fn default_outbound_queue() -> usize {
    relay_core::hub::DEFAULT_QUEUE_CAPACITY
}

fn default_max_message_size() -> usize {
    MAX_FRAME_SIZE
}

fn default_max_content_length() -> usize {
    relay_core::hub::DEFAULT_MAX_CONTENT_LENGTH
}

fn default_ping_interval() -> u64 {
    50_000
}

fn default_pong_wait() -> u64 {
    60_000
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
            storage: StorageConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: default_jwt_secret(),
            token_ttl_secs: default_token_ttl(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            message_rate_limit: default_message_rate_limit(),
            message_rate_window_ms: default_message_rate_window(),
            rest_rate_limit: default_rest_rate_limit(),
            rest_rate_window_ms: default_rest_rate_window(),
            outbound_queue: default_outbound_queue(),
            max_message_size: default_max_message_size(),
            max_content_length: default_max_content_length(),
            overflow: OverflowPolicy::default(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval(),
            pong_wait_ms: default_pong_wait(),
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
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed, or
    /// if the resulting configuration is invalid.
    pub fn load() -> Result<Self> {
        // Try to load from default paths
        let config_paths = [
            "relay.toml",
            "/etc/relay/relay.toml",
            "~/.config/relay/relay.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    /// Check values that would make the server misbehave.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat.ping_interval_ms == 0 {
            bail!("heartbeat.ping_interval_ms must be at least 1");
        }
        if self.heartbeat.ping_interval_ms >= self.heartbeat.pong_wait_ms {
            bail!(
                "heartbeat.ping_interval_ms ({}) must be below heartbeat.pong_wait_ms ({})",
                self.heartbeat.ping_interval_ms,
                self.heartbeat.pong_wait_ms
            );
        }
        if self.limits.outbound_queue == 0 {
            bail!("limits.outbound_queue must be at least 1");
        }
        if self.limits.message_rate_limit == 0 || self.limits.rest_rate_limit == 0 {
            bail!("rate limits must be at least 1");
        }
        if self.limits.message_rate_window_ms == 0 || self.limits.rest_rate_window_ms == 0 {
            bail!("rate limit windows must be at least 1ms");
        }
        if self.limits.max_message_size == 0 || self.limits.max_message_size > MAX_FRAME_SIZE {
            bail!(
                "limits.max_message_size must be between 1 and {} bytes: {}",
                MAX_FRAME_SIZE,
                self.limits.max_message_size
            );
        }
        if !self.transport.websocket_path.starts_with('/') {
            bail!(
                "transport.websocket_path must start with '/': {}",
                self.transport.websocket_path
            );
        }
        Ok(())
    }

    /// Get the JWT signing secret.
    ///
    /// # Errors
    ///
    /// Returns an error if no secret is configured.
    pub fn jwt_secret(&self) -> Result<&str> {
        self.auth
            .jwt_secret
            .as_deref()
            .context("No JWT secret configured: set RELAY_JWT_SECRET or auth.jwt_secret")
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address: {}:{}", self.host, self.port))
    }

    /// Hub settings.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            max_content_length: self.limits.max_content_length,
            overflow_policy: self.limits.overflow,
        }
    }

    /// Per-connection session settings.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            queue_capacity: self.limits.outbound_queue,
            ping_interval: Duration::from_millis(self.heartbeat.ping_interval_ms),
            pong_wait: Duration::from_millis(self.heartbeat.pong_wait_ms),
            rate_limit: self.limits.message_rate_limit,
            rate_window: Duration::from_millis(self.limits.message_rate_window_ms),
        }
    }

    /// REST rate limit window.
    #[must_use]
    pub fn rest_rate_window(&self) -> Duration {
        Duration::from_millis(self.limits.rest_rate_window_ms)
    }
}
