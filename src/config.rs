//! Relay configuration (`gdxsv.toml`).
//!
//! Every field has a default, so a partial file only overrides what it
//! names:
//!
//! ```toml
//! server = "zdxsv.net"
//! disk = 2
//! replay_dir = "replays"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::WorkerOptions;
use crate::core::{
    CONNECT_TIMEOUT, ConfigError, DEFAULT_MAX_LAG, KEY_FRAME_GRACE_FRAMES, OUTGOING_CAPACITY,
    SOCKET_TIMEOUT, UDP_TICK,
};

/// Default lobby host.
pub const DEFAULT_SERVER: &str = "zdxsv.net";

/// Default worker channel capacity, in chunks.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Settings for the whole relay core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Lobby host name.
    pub server: String,
    /// Input delay before the first ping test.
    pub max_lag: u8,
    /// Game disk, 1 or 2. Selects guest addresses.
    pub disk: u8,
    /// Where rollback battles are saved; `None` disables saving.
    pub replay_dir: Option<PathBuf>,
    /// Replace pilot names with `USER0n` during replays.
    pub hide_names: bool,
    /// Bound on every socket call, in milliseconds.
    pub socket_timeout_ms: u64,
    /// Bound on lobby connects, in milliseconds.
    pub connect_timeout_ms: u64,
    /// UDP worker cadence, in milliseconds.
    pub udp_tick_ms: u64,
    /// Outgoing accumulator capacity.
    pub outgoing_capacity: usize,
    /// Key-frame barrier grace window, in frames.
    pub key_frame_grace_frames: u32,
    /// UDP worker channel capacity, in chunks.
    pub channel_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            max_lag: DEFAULT_MAX_LAG,
            disk: 2,
            replay_dir: None,
            hide_names: false,
            socket_timeout_ms: SOCKET_TIMEOUT.as_millis() as u64,
            connect_timeout_ms: CONNECT_TIMEOUT.as_millis() as u64,
            udp_tick_ms: UDP_TICK.as_millis() as u64,
            outgoing_capacity: OUTGOING_CAPACITY,
            key_frame_grace_frames: KEY_FRAME_GRACE_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl RelayConfig {
    /// Parse and validate TOML.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Write as TOML, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Reject values the relay cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.disk != 1 && self.disk != 2 {
            return Err(ConfigError::Invalid(format!("disk must be 1 or 2, got {}", self.disk)));
        }
        if self.server.is_empty() {
            return Err(ConfigError::Invalid("server is empty".into()));
        }
        if self.udp_tick_ms == 0 {
            return Err(ConfigError::Invalid("udp_tick_ms must be positive".into()));
        }
        if self.socket_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be positive".into()));
        }
        if self.outgoing_capacity == 0 || self.channel_capacity == 0 {
            return Err(ConfigError::Invalid("capacities must be positive".into()));
        }
        Ok(())
    }

    /// Socket call bound.
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    /// Lobby connect bound.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Options for UDP workers.
    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            tick: Duration::from_millis(self.udp_tick_ms),
            socket_timeout: self.socket_timeout(),
            outgoing_capacity: self.outgoing_capacity,
            channel_capacity: self.channel_capacity,
        }
    }
}

/// Builder for [`RelayConfig`].
#[derive(Debug, Default)]
pub struct RelayConfigBuilder {
    config: RelayConfig,
}

impl RelayConfigBuilder {
    /// Start from defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the lobby host.
    pub fn server(mut self, host: impl Into<String>) -> Self {
        self.config.server = host.into();
        self
    }

    /// Set the initial input delay.
    pub fn max_lag(mut self, lag: u8) -> Self {
        self.config.max_lag = lag;
        self
    }

    /// Set the game disk.
    pub fn disk(mut self, disk: u8) -> Self {
        self.config.disk = disk;
        self
    }

    /// Save rollback battles under `dir`.
    pub fn replay_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.replay_dir = Some(dir.into());
        self
    }

    /// Hide pilot names during replays.
    pub fn hide_names(mut self, hide: bool) -> Self {
        self.config.hide_names = hide;
        self
    }

    /// Set the socket call bound.
    pub fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.config.socket_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the lobby connect bound.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the UDP worker cadence.
    pub fn udp_tick(mut self, tick: Duration) -> Self {
        self.config.udp_tick_ms = tick.as_millis() as u64;
        self
    }

    /// Set the outgoing accumulator capacity.
    pub fn outgoing_capacity(mut self, capacity: usize) -> Self {
        self.config.outgoing_capacity = capacity;
        self
    }

    /// Set the key-frame grace window.
    pub fn key_frame_grace_frames(mut self, frames: u32) -> Self {
        self.config.key_frame_grace_frames = frames;
        self
    }

    /// Set the worker channel capacity.
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<RelayConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
