//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `CARWATCH_API_URL`, `CARWATCH_API_TOKEN`,
//!    `CARWATCH_USER_ID`
//! 2. **Config file** — path via `--config <path>`, or `carwatch.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [api]
//! base_url = "http://127.0.0.1:8000"
//! token = "secret"          # optional bearer token
//! user_id = "42"            # whose requests `monitor` tracks
//!
//! [progress]
//! max_connections = 3
//! attempts_per_minute = 10
//! duplicate_window_ms = 10000
//! open_timeout_ms = 10000
//!
//! [queue]
//! open_timeout_ms = 10000
//! poll_interval_ms = 5000   # HTTP fallback while the socket is down
//!
//! [reconnect]
//! base_delay_ms = 1000
//! max_delay_ms = 30000
//! max_attempts = 5
//! idle_timeout_ms = 60000   # optional; omit to disable the watchdog
//!
//! [coordinator]
//! queue_debounce_ms = 300
//! requests_debounce_ms = 500
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::backoff::ReconnectPolicy;
use crate::connection::ConnectionOptions;
use crate::coordinator::CoordinatorSettings;
use crate::error::ConfigError;
use crate::progress::ProgressLimits;

const DEFAULT_CONFIG_FILE: &str = "carwatch.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP API the streams are derived from.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// `http`/`https` base URL (default `http://127.0.0.1:8000`). Override
    /// with `CARWATCH_API_URL`.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Bearer token for HTTP calls. Override with `CARWATCH_API_TOKEN`.
    pub token: Option<String>,
    /// User whose request list is tracked. Override with `CARWATCH_USER_ID`.
    pub user_id: Option<String>,
}

/// Task-progress admission budget.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressConfig {
    /// Concurrent task streams (default 3).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// New task-stream attempts per minute, across all tasks (default 10).
    #[serde(default = "default_attempts_per_minute")]
    pub attempts_per_minute: usize,
    /// Repeat attempts for one task inside this window are refused (default 10 000).
    #[serde(default = "default_duplicate_window_ms")]
    pub duplicate_window_ms: u64,
    /// Handshake timeout per task stream (default 10 000).
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
}

/// Shared queue-status stream.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Handshake timeout (default 10 000).
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
    /// Interval of the HTTP fallback poll (default 5000).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// Backoff applied to every stream after an unexpected close.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Treat a stream silent for this long as dropped. Unset disables it.
    pub idle_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_queue_debounce_ms")]
    pub queue_debounce_ms: u64,
    #[serde(default = "default_requests_debounce_ms")]
    pub requests_debounce_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}
fn default_max_connections() -> usize {
    3
}
fn default_attempts_per_minute() -> usize {
    10
}
fn default_duplicate_window_ms() -> u64 {
    10_000
}
fn default_open_timeout_ms() -> u64 {
    10_000
}
fn default_poll_interval_ms() -> u64 {
    5000
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_max_attempts() -> u32 {
    5
}
fn default_queue_debounce_ms() -> u64 {
    300
}
fn default_requests_debounce_ms() -> u64 {
    500
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token: None,
            user_id: None,
        }
    }
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            attempts_per_minute: default_attempts_per_minute(),
            duplicate_window_ms: default_duplicate_window_ms(),
            open_timeout_ms: default_open_timeout_ms(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            open_timeout_ms: default_open_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            idle_timeout_ms: None,
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            queue_debounce_ms: default_queue_debounce_ms(),
            requests_debounce_ms: default_requests_debounce_ms(),
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

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `carwatch.toml` in
    /// the current directory is used when present.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply env var overrides; `lookup` returns a variable's value if set.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("CARWATCH_API_URL") {
            self.api.base_url = url;
        }
        if let Some(token) = lookup("CARWATCH_API_TOKEN") {
            self.api.token = Some(token).filter(|t| !t.is_empty());
        }
        if let Some(user) = lookup("CARWATCH_USER_ID") {
            self.api.user_id = Some(user).filter(|u| !u.is_empty());
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        crate::endpoints::normalize_base(&self.api.base_url)
            .map_err(|e| ConfigError::Invalid(format!("api.base_url: {e}")))?;
        if self.progress.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "progress.max_connections must be at least 1".into(),
            ));
        }
        if self.progress.attempts_per_minute == 0 {
            return Err(ConfigError::Invalid(
                "progress.attempts_per_minute must be at least 1".into(),
            ));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "reconnect.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.reconnect.base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
            max_attempts: self.reconnect.max_attempts,
        }
    }

    pub fn queue_options(&self) -> ConnectionOptions {
        self.connection_options(self.queue.open_timeout_ms)
    }

    pub fn progress_options(&self) -> ConnectionOptions {
        self.connection_options(self.progress.open_timeout_ms)
    }

    pub fn progress_limits(&self) -> ProgressLimits {
        ProgressLimits {
            max_connections: self.progress.max_connections,
            attempts_per_minute: self.progress.attempts_per_minute,
            duplicate_window: Duration::from_millis(self.progress.duplicate_window_ms),
        }
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            base_url: self.api.base_url.clone(),
            user_id: self.api.user_id.clone(),
            queue_debounce: Duration::from_millis(self.coordinator.queue_debounce_ms),
            requests_debounce: Duration::from_millis(self.coordinator.requests_debounce_ms),
            poll_interval: Duration::from_millis(self.queue.poll_interval_ms),
        }
    }

    fn connection_options(&self, open_timeout_ms: u64) -> ConnectionOptions {
        ConnectionOptions {
            open_timeout: Duration::from_millis(open_timeout_ms),
            reconnect: self.reconnect_policy(),
            idle_timeout: self.reconnect.idle_timeout_ms.map(Duration::from_millis),
        }
    }
}
