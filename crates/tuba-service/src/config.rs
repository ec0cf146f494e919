//! Server configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use tuba_core::{FallbackPolicy, PollerOptions, ReadinessPolicy, Window};

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server settings.
    pub server: ServerConfig,
    /// Storage settings.
    pub storage: StorageConfig,
    /// Where live readings come from and how they are polled.
    pub telemetry: TelemetryConfig,
    /// Readiness thresholds.
    pub readiness: ReadinessPolicy,
    /// Session history settings.
    pub sessions: SessionsConfig,
    /// ABV refresh settings.
    pub abv: AbvConfig,
    /// Batch defaults.
    pub batches: BatchesConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return every error found.
    ///
    /// # Example
    ///
    /// ```
    /// use tuba_service::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        errors.extend(self.server.validate());
        errors.extend(self.storage.validate());
        errors.extend(self.telemetry.validate());
        errors.extend(validate_readiness(&self.readiness));
        errors.extend(self.sessions.validate());
        errors.extend(self.batches.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Poller options derived from this configuration.
    pub fn poller_options(&self) -> PollerOptions {
        PollerOptions::builder()
            .poll_interval(Duration::from_secs(self.telemetry.poll_interval))
            .fallback(self.telemetry.fallback)
            .smoothing(self.telemetry.smoothing())
            .readiness(self.readiness)
            .history_limit(self.sessions.history_limit)
            .event_buffer(self.server.broadcast_buffer)
            .build()
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (e.g., "127.0.0.1:8080").
    pub bind: String,
    /// Capacity of the live event channel feeding WebSocket clients.
    pub broadcast_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            broadcast_buffer: 100,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.bind.is_empty() {
            errors.push(ValidationError::new(
                "server.bind",
                "bind address cannot be empty",
            ));
        } else {
            match self.bind.rsplit_once(':') {
                None => errors.push(ValidationError::new(
                    "server.bind",
                    format!(
                        "invalid bind address '{}': expected format 'host:port'",
                        self.bind
                    ),
                )),
                Some((_, port)) => match port.parse::<u16>() {
                    Ok(0) => errors.push(ValidationError::new("server.bind", "port cannot be 0")),
                    Err(_) => errors.push(ValidationError::new(
                        "server.bind",
                        format!("invalid port '{}': must be a number 1-65535", port),
                    )),
                    Ok(_) => {}
                },
            }
        }

        if self.broadcast_buffer == 0 {
            errors.push(ValidationError::new(
                "server.broadcast_buffer",
                "broadcast buffer must be at least 1",
            ));
        }

        errors
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file path.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: tuba_store::default_db_path(),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.path.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "storage.path",
                "database path cannot be empty",
            ));
        }
        errors
    }
}

/// Where the poller gets readings from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Samples posted to this service's `/ispindel` endpoint.
    #[default]
    Local,
    /// A remote bridge reached over HTTP.
    Http,
}

/// Minimum poll interval in seconds.
pub const MIN_POLL_INTERVAL: u64 = 1;

/// Maximum poll interval in seconds (5 minutes).
pub const MAX_POLL_INTERVAL: u64 = 300;

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Source of live readings.
    pub source: SourceKind,
    /// Base URL of the remote bridge (required for `http`).
    pub base_url: Option<String>,
    /// Poll interval in seconds.
    pub poll_interval: u64,
    /// Per-request timeout in seconds for the remote bridge.
    pub request_timeout: u64,
    /// Behaviour when a fetch fails.
    pub fallback: FallbackPolicy,
    /// Moving-average window; `0` disables smoothing.
    pub smoothing_window: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::Local,
            base_url: None,
            poll_interval: 5,
            request_timeout: 10,
            fallback: FallbackPolicy::default(),
            smoothing_window: Window::MIN,
        }
    }
}

impl TelemetryConfig {
    /// Configured smoothing window, if enabled and valid.
    pub fn smoothing(&self) -> Option<Window> {
        match self.smoothing_window {
            0 => None,
            width => Window::new(width).ok(),
        }
    }

    /// Validate telemetry configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.source == SourceKind::Http {
            match self.base_url.as_deref().map(str::trim) {
                None | Some("") => errors.push(ValidationError::new(
                    "telemetry.base_url",
                    "base URL is required when source is 'http'",
                )),
                Some(url) if !url.starts_with("http://") && !url.starts_with("https://") => {
                    errors.push(ValidationError::new(
                        "telemetry.base_url",
                        format!("'{}' must start with http:// or https://", url),
                    ))
                }
                Some(_) => {}
            }
        }

        if self.poll_interval < MIN_POLL_INTERVAL {
            errors.push(ValidationError::new(
                "telemetry.poll_interval",
                format!(
                    "poll interval {} is too short (minimum {} second)",
                    self.poll_interval, MIN_POLL_INTERVAL
                ),
            ));
        } else if self.poll_interval > MAX_POLL_INTERVAL {
            errors.push(ValidationError::new(
                "telemetry.poll_interval",
                format!(
                    "poll interval {} is too long (maximum {} seconds)",
                    self.poll_interval, MAX_POLL_INTERVAL
                ),
            ));
        }

        if self.request_timeout == 0 {
            errors.push(ValidationError::new(
                "telemetry.request_timeout",
                "request timeout must be at least 1 second",
            ));
        }

        if self.smoothing_window != 0
            && let Err(e) = Window::new(self.smoothing_window)
        {
            errors.push(ValidationError::new(
                "telemetry.smoothing_window",
                e.to_string(),
            ));
        }

        errors
    }
}

fn validate_readiness(policy: &ReadinessPolicy) -> Vec<ValidationError> {
    match policy.validate() {
        Ok(()) => Vec::new(),
        Err(e) => vec![ValidationError::new("readiness", e.to_string())],
    }
}

/// Session history configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// Completed sessions kept in memory and returned by default.
    pub history_limit: usize,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            history_limit: tuba_core::session::DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl SessionsConfig {
    /// Validate session configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if !(1..=1000).contains(&self.history_limit) {
            errors.push(ValidationError::new(
                "sessions.history_limit",
                format!(
                    "history limit {} must be between 1 and 1000",
                    self.history_limit
                ),
            ));
        }
        errors
    }
}

/// Where ABV refreshes are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbvMode {
    /// Derive from the batch's original gravity and the latest stored gravity.
    #[default]
    Local,
    /// Ask the telemetry source.
    Remote,
}

/// ABV refresh configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AbvConfig {
    /// Minimum seconds between refreshes of the same batch.
    pub min_refresh_interval: u64,
    /// Where refreshes are computed.
    pub mode: AbvMode,
}

impl Default for AbvConfig {
    fn default() -> Self {
        Self {
            min_refresh_interval: 30,
            mode: AbvMode::Local,
        }
    }
}

/// Batch defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchesConfig {
    /// Days between a batch's start and its estimated end.
    pub estimated_duration_days: u8,
}

impl Default for BatchesConfig {
    fn default() -> Self {
        Self {
            estimated_duration_days: 3,
        }
    }
}

/// Shortest estimated fermentation in days.
pub const MIN_DURATION_DAYS: u8 = 3;

/// Longest estimated fermentation in days.
pub const MAX_DURATION_DAYS: u8 = 5;

impl BatchesConfig {
    /// Validate batch configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if !(MIN_DURATION_DAYS..=MAX_DURATION_DAYS).contains(&self.estimated_duration_days) {
            errors.push(ValidationError::new(
                "batches.estimated_duration_days",
                format!(
                    "estimated duration {} must be between {} and {} days",
                    self.estimated_duration_days, MIN_DURATION_DAYS, MAX_DURATION_DAYS
                ),
            ));
        }
        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `server.bind` or `telemetry.poll_interval`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tuba")
        .join("server.toml")
}
