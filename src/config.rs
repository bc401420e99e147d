//! Relay configuration
//!
//! Loaded from a TOML file; every section falls back to its defaults
//! when omitted.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub registry: RegistryConfig,
    pub session: SessionConfig,
    pub media: MediaConfig,
    pub ui: UiConfig,
}

/// Conference registry listener
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub bind_address: String,
    pub port: u16,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            port: DEFAULT_REGISTRY_PORT,
        }
    }
}

/// Per-conference session behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Address the control and media listeners bind to
    pub bind_address: String,
    /// How long a mode switch waits for the media tables to converge
    pub barrier_timeout_ms: u64,
    /// How long a P2P handoff waits for both port announcements
    pub handoff_timeout_ms: u64,
    /// Interval of the liveness log line
    pub log_interval_secs: u64,
    /// Largest accepted control message body
    pub max_control_message: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            barrier_timeout_ms: DEFAULT_BARRIER_TIMEOUT_MS,
            handoff_timeout_ms: DEFAULT_HANDOFF_TIMEOUT_MS,
            log_interval_secs: DEFAULT_LOG_INTERVAL_SECS,
            max_control_message: MAX_CONTROL_MESSAGE_SIZE,
        }
    }
}

impl SessionConfig {
    pub fn barrier_timeout(&self) -> Duration {
        Duration::from_millis(self.barrier_timeout_ms)
    }

    pub fn handoff_timeout(&self) -> Duration {
        Duration::from_millis(self.handoff_timeout_ms)
    }

    pub fn log_interval(&self) -> Duration {
        Duration::from_secs(self.log_interval_secs.max(1))
    }
}

/// Media transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Largest datagram the relay emits
    pub max_datagram_size: usize,
    /// Samples per mixed audio chunk (16-bit mono)
    pub audio_chunk_samples: usize,
    /// Kernel receive buffer for media sockets
    pub recv_buffer_size: usize,
    /// Kernel send buffer for media sockets
    pub send_buffer_size: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            max_datagram_size: MAX_PACKET_SIZE,
            audio_chunk_samples: AUDIO_CHUNK_SAMPLES,
            recv_buffer_size: SOCKET_BUFFER_SIZE,
            send_buffer_size: SOCKET_BUFFER_SIZE,
        }
    }
}

/// HTTP status API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub http_port: u16,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            http_port: DEFAULT_HTTP_PORT,
        }
    }
}

impl AppConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load from `path`, returning defaults when the file does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Load from an explicit path or the platform config directory
    pub fn load_or_default(path: Option<PathBuf>) -> Result<Self> {
        match path.or_else(Self::default_path) {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    /// `<config dir>/relay.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "conference-relay")
            .map(|dirs| dirs.config_dir().join("relay.toml"))
    }

    /// Serialize back to TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }
}
