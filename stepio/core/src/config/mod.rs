//! Engine Configuration
//!
//! Tunables for the I/O engine, loaded with the following priority (highest
//! first):
//! 1. Environment variables (`STEPIO_*`)
//! 2. TOML configuration file
//! 3. Default values
//!
//! The file lives at `$XDG_CONFIG_HOME/stepio/io.toml` unless a path is given
//! explicitly.
//!
//! # Example Configuration
//!
//! ```toml
//! handshake_timeout_ms = 10000
//! incoming_buffer_cap = 1024
//! outgoing_buffer_cap = 1024
//! prewarm_buffers = 64
//! outbound_queue_bytes = 65536
//! nodes_per_listener = 48
//! bind_addr = "0.0.0.0"
//! port_range = [60001, 63000]
//! drain_timeout_ms = 5000
//! open_mode = "append"
//! ```

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// How per-task and per-node output files are opened
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpenMode {
    /// Truncate existing files
    #[default]
    Truncate,
    /// Append to existing files
    Append,
}

/// I/O engine tunables
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoConfig {
    /// How long a freshly accepted socket may take to deliver its handshake
    pub handshake_timeout_ms: u64,

    /// Cap of the node -> launcher buffer pool
    pub incoming_buffer_cap: usize,

    /// Cap of the launcher -> node buffer pool
    pub outgoing_buffer_cap: usize,

    /// Buffers allocated per pool at creation (bounded by each cap)
    pub prewarm_buffers: usize,

    /// Payload bytes that may wait in one node's outbound queue
    ///
    /// Stdin chunks are sized to the smallest free space across their
    /// destinations so one slow node bounds everybody's memory.
    pub outbound_queue_bytes: usize,

    /// Nodes served per listening socket
    ///
    /// More sockets keep each accept backlog short when thousands of nodes
    /// connect at once.
    pub nodes_per_listener: usize,

    /// Address the listening sockets bind to
    pub bind_addr: IpAddr,

    /// Inclusive port range to bind in; ephemeral ports when unset
    pub port_range: Option<(u16, u16)>,

    /// Upper bound on flushing local writers during `finish`
    pub drain_timeout_ms: u64,

    /// How output files are opened
    pub open_mode: OpenMode,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            incoming_buffer_cap: 1024,
            outgoing_buffer_cap: 1024,
            prewarm_buffers: 64,
            outbound_queue_bytes: 64 * 1024,
            nodes_per_listener: 48,
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            port_range: None,
            drain_timeout_ms: 5_000,
            open_mode: OpenMode::Truncate,
        }
    }
}

impl IoConfig {
    /// Handshake timeout as a `Duration`
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Drain timeout as a `Duration`
    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Number of listening sockets for a step of `node_count` nodes
    #[must_use]
    pub fn listener_count(&self, node_count: u32) -> usize {
        let per = self.nodes_per_listener.max(1);
        (node_count as usize).div_ceil(per).max(1)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.incoming_buffer_cap == 0 || self.outgoing_buffer_cap == 0 {
            return Err(ConfigError::ValidationError(
                "buffer caps must be at least 1".to_string(),
            ));
        }
        if self.outbound_queue_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "outbound_queue_bytes must be at least 1".to_string(),
            ));
        }
        if self.nodes_per_listener == 0 {
            return Err(ConfigError::ValidationError(
                "nodes_per_listener must be at least 1".to_string(),
            ));
        }
        if let Some((low, high)) = self.port_range {
            if low > high {
                return Err(ConfigError::ValidationError(format!(
                    "port_range start {low} is above end {high}"
                )));
            }
        }
        Ok(())
    }

    /// Apply `STEPIO_*` environment overrides
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
        }

        if let Some(v) = parsed("STEPIO_HANDSHAKE_TIMEOUT_MS") {
            self.handshake_timeout_ms = v;
        }
        if let Some(v) = parsed("STEPIO_INCOMING_BUFFER_CAP") {
            self.incoming_buffer_cap = v;
        }
        if let Some(v) = parsed("STEPIO_OUTGOING_BUFFER_CAP") {
            self.outgoing_buffer_cap = v;
        }
        if let Some(v) = parsed("STEPIO_PREWARM_BUFFERS") {
            self.prewarm_buffers = v;
        }
        if let Some(v) = parsed("STEPIO_OUTBOUND_QUEUE_BYTES") {
            self.outbound_queue_bytes = v;
        }
        if let Some(v) = parsed("STEPIO_NODES_PER_LISTENER") {
            self.nodes_per_listener = v;
        }
        if let Some(v) = parsed("STEPIO_BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Some(range) = std::env::var("STEPIO_PORT_RANGE")
            .ok()
            .and_then(|v| parse_port_range(&v))
        {
            self.port_range = Some(range);
        }
        if let Some(v) = parsed("STEPIO_DRAIN_TIMEOUT_MS") {
            self.drain_timeout_ms = v;
        }
        if let Ok(v) = std::env::var("STEPIO_OPEN_MODE") {
            match v.to_lowercase().as_str() {
                "append" => self.open_mode = OpenMode::Append,
                "truncate" => self.open_mode = OpenMode::Truncate,
                other => tracing::warn!(value = other, "Ignoring unknown STEPIO_OPEN_MODE"),
            }
        }
        self
    }

    /// Defaults, overlaid by the default config file if present, then env
    pub fn load() -> Result<Self, ConfigError> {
        match default_config_path() {
            Some(path) if path.exists() => Self::load_from_path(&path),
            _ => {
                let config = Self::default().with_env_overrides();
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Load a specific TOML file, then apply env overrides
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&content)?.with_env_overrides();
        config.validate()?;
        tracing::debug!(path = %path.display(), "Loaded I/O configuration");
        Ok(config)
    }

    /// Parse TOML text (no env overrides)
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }
}

/// `$XDG_CONFIG_HOME/stepio/io.toml`
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("stepio").join("io.toml"))
}

/// Parse `"low-high"` or `"low,high"`
fn parse_port_range(value: &str) -> Option<(u16, u16)> {
    let (low, high) = value.split_once(['-', ','])?;
    Some((low.trim().parse().ok()?, high.trim().parse().ok()?))
}
