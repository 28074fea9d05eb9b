//! Server configuration
//!
//! Loaded from an optional TOML file, then overridden by a few environment
//! variables. Missing files are not an error; the defaults describe a
//! usable single-user server.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::StartupError;

/// Hard upper bound on concurrent sessions (width of the occupancy bitmap)
pub const MAX_SESSIONS: usize = 64;
/// Hard upper bound on swapchains per session
pub const MAX_SWAPCHAINS: usize = 64;

/// Display refresh rates the timing helpers accept, in Hz
pub const REFRESH_RATE_RANGE: std::ops::RangeInclusive<f64> = 1.0..=1000.0;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "TESSERA_CONFIG";

const DEFAULT_SOCKET_NAME: &str = "tessera_comp_ipc";

/// How to treat an inherited listening socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketActivation {
    /// Use an inherited socket if one was passed, otherwise bind
    #[default]
    Auto,
    /// Always bind `socket_path`
    Never,
    /// Fail startup unless a socket was inherited
    Require,
}

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Filesystem path of the listening socket; a leading `@` selects the
    /// abstract namespace
    pub socket_path: String,
    pub socket_activation: SocketActivation,
    pub max_sessions: usize,
    pub max_swapchains: usize,
    pub event_queue_capacity: usize,
    /// Shut down once the last client leaves
    pub exit_on_disconnect: bool,
    pub shutdown_timeout_ms: u64,
    pub refresh_rate_hz: f64,
    pub log_level: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path().to_string_lossy().into_owned(),
            socket_activation: SocketActivation::Auto,
            max_sessions: 8,
            max_swapchains: 32,
            event_queue_capacity: 32,
            exit_on_disconnect: false,
            shutdown_timeout_ms: 2000,
            refresh_rate_hz: 60.0,
            log_level: None,
        }
    }
}

fn default_socket_path() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(DEFAULT_SOCKET_NAME)
}

impl ServerConfig {
    /// Load from `path` if it exists, apply environment overrides, validate
    pub fn load(path: Option<&Path>) -> Result<Self, StartupError> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let content = fs::read_to_string(path).map_err(|e| {
                    StartupError::Config(format!("failed to read {:?}: {}", path, e))
                })?;
                let config = Self::from_toml(&content)?;
                info!("Configuration loaded from {:?}", path);
                config
            }
            Some(path) => {
                info!("Config file not found at {:?}, using defaults", path);
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        debug!("Config: {:?}", config);
        Ok(config)
    }

    /// Parse a TOML document; unspecified fields take their defaults
    pub fn from_toml(content: &str) -> Result<Self, StartupError> {
        toml::from_str(content).map_err(|e| StartupError::Config(e.to_string()))
    }

    /// Apply `TESSERA_*` overrides, reading variables through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("TESSERA_SOCKET") {
            self.socket_path = path;
        }
        if let Some(n) = lookup("TESSERA_MAX_SESSIONS").and_then(|v| v.parse().ok()) {
            self.max_sessions = n;
        }
        if let Some(v) = lookup("TESSERA_EXIT_ON_DISCONNECT") {
            self.exit_on_disconnect = matches!(v.as_str(), "1" | "true" | "yes");
        }
    }

    /// Reject limits the fixed-capacity structures cannot honour
    pub fn validate(&self) -> Result<(), StartupError> {
        if self.max_sessions == 0 || self.max_sessions > MAX_SESSIONS {
            return Err(StartupError::Config(format!(
                "max_sessions must be in 1..={}, got {}",
                MAX_SESSIONS, self.max_sessions
            )));
        }
        if self.max_swapchains == 0 || self.max_swapchains > MAX_SWAPCHAINS {
            return Err(StartupError::Config(format!(
                "max_swapchains must be in 1..={}, got {}",
                MAX_SWAPCHAINS, self.max_swapchains
            )));
        }
        if self.event_queue_capacity == 0 {
            return Err(StartupError::Config(
                "event_queue_capacity must be at least 1".into(),
            ));
        }
        if !REFRESH_RATE_RANGE.contains(&self.refresh_rate_hz) {
            return Err(StartupError::Config(format!(
                "refresh_rate_hz must be in {:?}, got {}",
                REFRESH_RATE_RANGE, self.refresh_rate_hz
            )));
        }
        if self.socket_path.is_empty() || self.socket_path == "@" {
            return Err(StartupError::Config("socket_path is empty".into()));
        }
        Ok(())
    }

    /// Abstract-namespace name, if `socket_path` selects one
    pub fn abstract_name(&self) -> Option<&str> {
        self.socket_path.strip_prefix('@')
    }

    /// Frame period in nanoseconds derived from `refresh_rate_hz`
    pub fn frame_period_ns(&self) -> u64 {
        (1_000_000_000.0 / self.refresh_rate_hz) as u64
    }
}
