//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `FORKSERVE_WORKER_COUNT`,
//!    `FORKSERVE_LISTEN`, `FORKSERVE_LOG_LEVEL`
//! 2. **Config file**: path via `--config <path>`, or `forkserve.yaml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The YAML file mirrors the struct hierarchy:
//!
//! ```yaml
//! server:
//!   worker_count: 4            # alias: workerCount
//!   listen: "127.0.0.1:9009"   # or "unix:/run/app.sock", or "fd:0"
//!   status_file: ".status"
//!   pid_file: "/run/forkserve.pid"
//!   poll_interval_ms: 1000
//!   drain_grace_secs: 15
//!   fork_failure_limit: 1
//!   reload_timeout_secs: 0
//!   max_backoff_secs: 60
//!
//! logging:
//!   level: "info"
//! ```
//!
//! A config is loaded once per generation and never mutated afterwards. When
//! loading fails, [`Config::load_or`] keeps the previous generation's config.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::error::ConfigError;

/// Config file looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "forkserve.yaml";

/// Top-level configuration, deserialized from YAML.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Process-pool and supervision settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    /// Number of worker processes per generation (default 4).
    #[serde(default = "default_worker_count", alias = "workerCount")]
    pub worker_count: usize,
    /// FastCGI listen address (default `127.0.0.1:9009`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// File receiving the last reload status; `null` disables it.
    #[serde(default = "default_status_file")]
    pub status_file: Option<String>,
    /// File receiving the boss pid, read by `forkserve reload`.
    #[serde(default)]
    pub pid_file: Option<String>,
    /// Boss and manager poll cadence in milliseconds (default 1000).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Seconds a drained worker gets before SIGKILL (default 15). A stopped
    /// manager gets this plus two poll intervals.
    #[serde(default = "default_drain_grace_secs")]
    pub drain_grace_secs: u64,
    /// Consecutive fork failures before the manager demotes itself (default 1).
    #[serde(default = "default_fork_failure_limit")]
    pub fork_failure_limit: u32,
    /// Seconds the boss waits for a new generation's handshake; 0 waits
    /// until the new manager exits (default 0).
    #[serde(default)]
    pub reload_timeout_secs: u64,
    /// Maximum seconds between manager respawn attempts (default 60).
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_worker_count() -> usize {
    4
}
fn default_listen() -> String {
    "127.0.0.1:9009".to_string()
}
#[allow(clippy::unnecessary_wraps)]
fn default_status_file() -> Option<String> {
    Some(".status".to_string())
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_drain_grace_secs() -> u64 {
    15
}
fn default_fork_failure_limit() -> u32 {
    1
}
fn default_max_backoff_secs() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            listen: default_listen(),
            status_file: default_status_file(),
            pid_file: None,
            poll_interval_ms: default_poll_interval_ms(),
            drain_grace_secs: default_drain_grace_secs(),
            fork_failure_limit: default_fork_failure_limit(),
            reload_timeout_secs: 0,
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ServerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_secs(self.drain_grace_secs)
    }

    /// `None` when the boss should wait for the handshake indefinitely.
    pub fn reload_timeout(&self) -> Option<Duration> {
        (self.reload_timeout_secs > 0).then(|| Duration::from_secs(self.reload_timeout_secs))
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `forkserve.yaml`
    /// in the current directory is used when present, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(DEFAULT_CONFIG_FILE)?
            }
            None => Config::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::load`], but any failure keeps `last_good`.
    pub fn load_or(path: Option<&str>, last_good: &Config) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!("{e}; keeping previous configuration");
                last_good.clone()
            }
        }
    }

    /// Parse a YAML document.
    pub fn from_yaml(content: &str, origin: &str) -> Result<Self, ConfigError> {
        // An empty document deserializes to unit, not a mapping.
        if content.trim().is_empty() {
            return Ok(Config::default());
        }
        serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(origin.to_string(), e))
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_string(), e))?;
        Self::from_yaml(&content, path)
    }

    /// Apply `FORKSERVE_*` overrides obtained from `lookup`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(count) = lookup("FORKSERVE_WORKER_COUNT") {
            self.server.worker_count = count.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("FORKSERVE_WORKER_COUNT is not a number: {count}"))
            })?;
        }
        if let Some(listen) = lookup("FORKSERVE_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(level) = lookup("FORKSERVE_LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.worker_count == 0 {
            return Err(ConfigError::Invalid("server.worker_count must be positive".into()));
        }
        if self.server.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("server.poll_interval_ms must be positive".into()));
        }
        if self.server.fork_failure_limit == 0 {
            return Err(ConfigError::Invalid("server.fork_failure_limit must be positive".into()));
        }
        Ok(())
    }
}
