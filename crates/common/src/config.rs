use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tunnel protocol constants
pub mod protocol {
    /// ALPN tag negotiated on exit-node QUIC tunnels
    pub const ALPN: &[u8] = b"relaymesh/1";

    /// Server name presented by exit agents during the QUIC handshake
    pub const SERVER_NAME: &str = "relaymesh.local";

    /// Default QUIC tunnel port
    pub const DEFAULT_QUIC_PORT: u16 = 4433;

    /// Longest accepted envelope line (4 MiB)
    pub const MAX_LINE_SIZE: usize = 4 * 1024 * 1024;

    /// Idle timeout on the physical tunnel
    pub const IDLE_TIMEOUT_SECS: u64 = 60;

    /// QUIC keep-alive interval
    pub const KEEPALIVE_INTERVAL_SECS: u64 = 5;
}

/// Relay engine constants
pub mod relay {
    /// Wait for a connect_response before giving up on a node
    pub const CONNECT_TIMEOUT_MS: u64 = 5_000;

    /// Connect attempts per end-user request
    pub const CONNECT_ATTEMPTS: usize = 3;

    /// Read buffer for the user-to-tunnel pump
    pub const BUFFER_SIZE: usize = 4096;

    /// Capacity of each logical stream's inbound queue
    pub const INBOUND_QUEUE_CAPACITY: usize = 100;

    /// Exit agent dial timeout
    pub const DIAL_TIMEOUT_SECS: u64 = 10;
}

/// Scoring constants
pub mod scoring {
    /// Reliability assigned to a freshly registered node
    pub const INITIAL_RELIABILITY: f64 = 0.7;

    /// Multiplier applied on a successful connect
    pub const REWARD_FACTOR: f64 = 1.02;

    /// Multiplier applied on a connect timeout or failure
    pub const PENALTY_FACTOR: f64 = 0.8;

    /// Reliability ceiling
    pub const MAX_RELIABILITY: f64 = 1.2;

    /// Reliability floor
    pub const MIN_RELIABILITY: f64 = 0.01;

    /// Latency at or below which the latency axis scores 1.0
    pub const LATENCY_BASELINE_MS: f64 = 10.0;

    /// Latency span over which the latency axis decays to 0
    pub const LATENCY_SPAN_MS: f64 = 500.0;

    /// Weight of the latency axis in the score
    pub const LATENCY_WEIGHT: f64 = 0.6;

    /// Weight of reliability in the score
    pub const RELIABILITY_WEIGHT: f64 = 0.4;

    /// Number of pong samples in the latency moving average
    pub const LATENCY_WINDOW: usize = 10;
}

/// Health monitoring constants
pub mod health {
    /// Ping ticker interval
    pub const PING_INTERVAL_SECS: u64 = 5;
}

/// Selection engine constants
pub mod selection {
    /// Pool rebuild interval
    pub const POOL_REFRESH_SECS: u64 = 10;

    /// Binary-search retries before reporting no node
    pub const POOL_PICK_RETRIES: usize = 3;

    /// Minimum weight of any selectable node
    pub const WEIGHT_FLOOR: f64 = 1.0;

    /// Default number of racers in competitive mode
    pub const RACE_WIDTH: usize = 2;
}

/// Exit-node selection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionStrategy {
    /// Linear weighted-random walk over a fresh registry snapshot
    Weighted,
    /// Precomputed cumulative-weight pools per region
    Pooled,
}

/// Relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// QUIC tunnel listener
    pub quic_listen: SocketAddr,

    /// SOCKS5 ingress listener
    pub socks_listen: SocketAddr,

    /// HTTP CONNECT ingress listener
    pub http_listen: SocketAddr,

    /// Stats API and WebSocket tunnel listener
    pub api_listen: SocketAddr,

    /// Selection policy
    pub selection: SelectionStrategy,

    /// Exponent applied to scores before weighting
    pub weight_exponent: f64,

    /// Race connects across the top nodes for every request
    pub competitive: bool,

    /// Number of racers in competitive mode
    pub race_width: usize,

    pub connect_timeout_ms: u64,

    pub connect_attempts: usize,

    pub ping_interval_secs: u64,

    pub pool_refresh_secs: u64,

    pub relay_buffer_size: usize,

    /// Append per-connection telemetry as JSON lines to this file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_log: Option<PathBuf>,

    /// Reject ingress clients without valid credentials
    pub require_auth: bool,

    /// Static username to password table
    pub users: HashMap<String, String>,

    /// Static IP to country-code table used for region resolution
    pub regions: HashMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            quic_listen: SocketAddr::from(([0, 0, 0, 0], protocol::DEFAULT_QUIC_PORT)),
            socks_listen: SocketAddr::from(([0, 0, 0, 0], 1080)),
            http_listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            api_listen: SocketAddr::from(([127, 0, 0, 1], 8081)),
            selection: SelectionStrategy::Pooled,
            weight_exponent: 1.0,
            competitive: false,
            race_width: selection::RACE_WIDTH,
            connect_timeout_ms: relay::CONNECT_TIMEOUT_MS,
            connect_attempts: relay::CONNECT_ATTEMPTS,
            ping_interval_secs: health::PING_INTERVAL_SECS,
            pool_refresh_secs: selection::POOL_REFRESH_SECS,
            relay_buffer_size: relay::BUFFER_SIZE,
            connection_log: None,
            require_auth: false,
            users: HashMap::new(),
            regions: HashMap::new(),
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_selection(mut self, selection: SelectionStrategy) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_weight_exponent(mut self, exponent: f64) -> Self {
        self.weight_exponent = exponent;
        self
    }

    pub fn with_competitive(mut self, race_width: usize) -> Self {
        self.competitive = true;
        self.race_width = race_width;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_connection_log(mut self, path: PathBuf) -> Self {
        self.connection_log = Some(path);
        self
    }

    pub fn with_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.insert(username.into(), password.into());
        self.require_auth = true;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn pool_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.pool_refresh_secs)
    }

    /// Check values that would stall the relay if left at zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_attempts == 0 {
            return Err(ConfigError::Invalid("connect_attempts must be at least 1".into()));
        }
        if self.relay_buffer_size == 0 {
            return Err(ConfigError::Invalid("relay_buffer_size must be positive".into()));
        }
        if self.ping_interval_secs == 0 || self.pool_refresh_secs == 0 {
            return Err(ConfigError::Invalid("intervals must be positive".into()));
        }
        if !self.weight_exponent.is_finite() || self.weight_exponent <= 0.0 {
            return Err(ConfigError::Invalid("weight_exponent must be positive".into()));
        }
        if self.competitive && self.race_width < 2 {
            return Err(ConfigError::Invalid("race_width must be at least 2".into()));
        }
        Ok(())
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::WriteError(e.to_string()))?;

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config file: {0}")]
    WriteError(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}
