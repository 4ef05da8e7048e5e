//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::realtime::BackoffPolicy;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub backoff: BackoffConfig,

    #[serde(default)]
    pub notifications: NotificationsConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Event stream endpoint configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// API root, e.g. `http://localhost:8000/api`
    #[serde(default = "default_api_base")]
    pub api_base: String,

    #[serde(default = "default_events_path")]
    pub events_path: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Session credential sent with the stream request
    #[serde(default)]
    pub session_cookie: Option<String>,

    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
}

fn default_api_base() -> String {
    "http://localhost:8000/api".to_string()
}

fn default_events_path() -> String {
    "/events".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_cookie_name() -> String {
    "aimb_session".to_string()
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            events_path: default_events_path(),
            connect_timeout_secs: default_connect_timeout(),
            session_cookie: None,
            cookie_name: default_cookie_name(),
        }
    }
}

impl StreamConfig {
    /// Full URL of the events endpoint
    pub fn events_url(&self) -> String {
        let base = self.api_base.trim_end_matches('/');
        let path = self.events_path.trim_start_matches('/');
        format!("{}/{}", base, path)
    }
}

/// Reconnect backoff configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_base")]
    pub base_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_backoff_cap")]
    pub cap_ms: u64,
}

fn default_backoff_base() -> u64 {
    3000
}

fn default_backoff_multiplier() -> f64 {
    1.5
}

fn default_backoff_cap() -> u64 {
    30_000
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_backoff_base(),
            multiplier: default_backoff_multiplier(),
            cap_ms: default_backoff_cap(),
        }
    }
}

impl BackoffConfig {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.base_ms),
            self.multiplier,
            Duration::from_millis(self.cap_ms),
        )
    }
}

/// Desktop notification configuration
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default = "default_notifications_enabled")]
    pub enabled: bool,

    /// Local settings file; defaults to the user config directory
    #[serde(default)]
    pub settings_path: Option<String>,
}

fn default_notifications_enabled() -> bool {
    true
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            enabled: default_notifications_enabled(),
            settings_path: None,
        }
    }
}

/// Development stream server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Route prefix the events endpoint is mounted under
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Seconds between synthetic `rates_updated` events
    #[serde(default = "default_publish_interval")]
    pub publish_interval_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_prefix() -> String {
    "/api".to_string()
}

fn default_publish_interval() -> u64 {
    15
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            prefix: default_prefix(),
            publish_interval_secs: default_publish_interval(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::parse(&content).map_err(|error| ConfigError::Parse {
            path: path.to_path_buf(),
            error,
        })
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| e.to_string())
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("ratefeed").join("config.toml")),
            Some(PathBuf::from("/etc/ratefeed/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                match Self::load_with_env(path) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable source
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        // Stream overrides
        if let Some(api_base) = var("RATEFEED_API_BASE") {
            self.stream.api_base = api_base;
        }
        if let Some(path) = var("RATEFEED_EVENTS_PATH") {
            self.stream.events_path = path;
        }
        if let Some(cookie) = var("RATEFEED_SESSION_COOKIE") {
            self.stream.session_cookie = Some(cookie);
        }

        // Backoff overrides
        if let Some(Ok(base)) = var("RATEFEED_BACKOFF_BASE_MS").map(|v| v.parse::<u64>()) {
            self.backoff.base_ms = base;
        }
        if let Some(Ok(multiplier)) = var("RATEFEED_BACKOFF_MULTIPLIER").map(|v| v.parse::<f64>()) {
            self.backoff.multiplier = multiplier;
        }
        if let Some(Ok(cap)) = var("RATEFEED_BACKOFF_CAP_MS").map(|v| v.parse::<u64>()) {
            self.backoff.cap_ms = cap;
        }

        if let Some(Ok(enabled)) = var("RATEFEED_NOTIFICATIONS").map(|v| v.parse::<bool>()) {
            self.notifications.enabled = enabled;
        }

        // Logging overrides
        if let Some(level) = var("RATEFEED_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("RATEFEED_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# ratefeed Configuration
#
# Environment variables override these settings:
# - RATEFEED_API_BASE
# - RATEFEED_EVENTS_PATH
# - RATEFEED_SESSION_COOKIE
# - RATEFEED_BACKOFF_BASE_MS
# - RATEFEED_BACKOFF_MULTIPLIER
# - RATEFEED_BACKOFF_CAP_MS
# - RATEFEED_NOTIFICATIONS
# - RATEFEED_LOG_LEVEL
# - RATEFEED_LOG_FORMAT

[stream]
# API root the events endpoint lives under
api_base = "http://localhost:8000/api"

# Path of the server push stream
events_path = "/events"

# Seconds to wait for the TCP connection
connect_timeout_secs = 10

# Session credential, sent as a cookie
# session_cookie = ""
cookie_name = "aimb_session"

[backoff]
# Delay before the first retry (ms)
base_ms = 3000

# Growth factor per consecutive failure
multiplier = 1.5

# Upper bound on the delay (ms)
cap_ms = 30000

[notifications]
# Show desktop notifications for triggered alerts
enabled = true

# Where the notification permission is remembered
# settings_path = "~/.config/ratefeed/settings.toml"

[server]
# Development stream server
host = "127.0.0.1"
port = 8000
prefix = "/api"
publish_interval_secs = 15

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
