//! Configuration system for Tether.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TETHER_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/tether/config.toml
//!   3. ~/.config/tether/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub session: SessionConfig,
    pub api: ApiConfig,
    pub echo: EchoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Worker threads besides the main thread. 0 = single-threaded.
    pub workers: u16,
    /// Capacity of each worker's event queue.
    pub event_queue_size: usize,
    /// RPC payloads a worker may have in flight before posts are rejected.
    pub ctrl_pool_size: usize,
    /// Hard cap on live sessions per worker.
    pub max_sessions_per_worker: usize,
    /// Slots reserved up front in each worker's pool.
    pub preallocated_sessions: usize,
    pub rx_fifo_size: u32,
    pub tx_fifo_size: u32,
    /// Fifo byte budget per worker.
    pub segment_size: u64,
    /// How long an idle worker waits on its queue before housekeeping.
    pub idle_wait_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// HTTP port for the operator API.
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EchoConfig {
    /// Attach the built-in echo application at startup.
    pub enabled: bool,
    /// Loopback endpoint the echo server listens on.
    pub listen: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            event_queue_size: 16_384,
            ctrl_pool_size: 1024,
            max_sessions_per_worker: 65_536,
            preallocated_sessions: 0,
            rx_fifo_size: 64 * 1024,
            tx_fifo_size: 64 * 1024,
            segment_size: 256 * 1024 * 1024, // 256 MB
            idle_wait_ms: 10,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 9017 }
    }
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "127.0.0.1:7".to_string(),
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("tether")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl TetherConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            TetherConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TETHER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&TetherConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject values the session layer cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.session;
        let invalid = |field, reason: &str| ConfigError::Invalid {
            field,
            reason: reason.to_string(),
        };
        if s.event_queue_size == 0 {
            return Err(invalid("session.event_queue_size", "must be > 0"));
        }
        if s.rx_fifo_size == 0 || s.tx_fifo_size == 0 {
            return Err(invalid("session.rx_fifo_size/tx_fifo_size", "must be > 0"));
        }
        if u64::from(s.rx_fifo_size) + u64::from(s.tx_fifo_size) > s.segment_size {
            return Err(invalid(
                "session.segment_size",
                "must hold at least one rx/tx fifo pair",
            ));
        }
        if s.preallocated_sessions > s.max_sessions_per_worker {
            return Err(invalid(
                "session.preallocated_sessions",
                "exceeds max_sessions_per_worker",
            ));
        }
        Ok(())
    }

    /// Apply TETHER_* env var overrides.
    fn apply_env_overrides(&mut self) {
        fn parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
            std::env::var(key).ok().and_then(|v| v.parse().ok())
        }
        if let Some(n) = parsed("TETHER_SESSION__WORKERS") {
            self.session.workers = n;
        }
        if let Some(n) = parsed("TETHER_SESSION__EVENT_QUEUE_SIZE") {
            self.session.event_queue_size = n;
        }
        if let Some(n) = parsed("TETHER_SESSION__RX_FIFO_SIZE") {
            self.session.rx_fifo_size = n;
        }
        if let Some(n) = parsed("TETHER_SESSION__TX_FIFO_SIZE") {
            self.session.tx_fifo_size = n;
        }
        if let Some(n) = parsed("TETHER_SESSION__SEGMENT_SIZE") {
            self.session.segment_size = n;
        }
        if let Some(p) = parsed("TETHER_API__PORT") {
            self.api.port = p;
        }
        if let Ok(v) = std::env::var("TETHER_ECHO__ENABLED") {
            self.echo.enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("TETHER_ECHO__LISTEN") {
            self.echo.listen = v;
        }
    }
}
