//! Layered configuration for the Tether control protocol.
//!
//! Reads configuration from multiple sources with precedence:
//! env vars > config file > defaults

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tether_types::ConfigError;

/// Default timeout for ordinary control requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Floor for the initialize handshake timeout.
pub const DEFAULT_INITIALIZE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default wait for the first result after caller input is exhausted.
pub const DEFAULT_STREAM_CLOSE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default cap on a single buffered inbound JSON message.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Resolved control-protocol configuration for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlConfig {
    pub request_timeout: Duration,
    pub initialize_timeout: Duration,
    pub stream_close_timeout: Duration,
    pub max_buffer_size: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            initialize_timeout: DEFAULT_INITIALIZE_TIMEOUT,
            stream_close_timeout: DEFAULT_STREAM_CLOSE_TIMEOUT,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
        }
    }
}

/// Settings that can be read from a TOML config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub control: ControlSettings,
}

/// `[control]` section of the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlSettings {
    pub request_timeout_ms: Option<u64>,
    pub initialize_timeout_ms: Option<u64>,
    pub stream_close_timeout_ms: Option<u64>,
    pub max_buffer_size: Option<usize>,
}

impl ControlSettings {
    /// Overlay `other` on top of `self`; fields set in `other` win.
    fn merge(self, other: ControlSettings) -> Self {
        Self {
            request_timeout_ms: other.request_timeout_ms.or(self.request_timeout_ms),
            initialize_timeout_ms: other.initialize_timeout_ms.or(self.initialize_timeout_ms),
            stream_close_timeout_ms: other
                .stream_close_timeout_ms
                .or(self.stream_close_timeout_ms),
            max_buffer_size: other.max_buffer_size.or(self.max_buffer_size),
        }
    }

    fn resolve(self) -> ControlConfig {
        let stream_close_timeout = self
            .stream_close_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_STREAM_CLOSE_TIMEOUT);
        // The handshake may legitimately take as long as the close wait.
        let initialize_timeout = self
            .initialize_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| stream_close_timeout.max(DEFAULT_INITIALIZE_TIMEOUT));

        ControlConfig {
            request_timeout: self
                .request_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            initialize_timeout,
            stream_close_timeout,
            max_buffer_size: self.max_buffer_size.unwrap_or(DEFAULT_MAX_BUFFER_SIZE),
        }
    }
}

impl ControlConfig {
    /// Load configuration from all sources, applying precedence rules.
    ///
    /// Precedence (highest to lowest):
    /// 1. Environment variables (`TETHER_*_TIMEOUT_MS`)
    /// 2. Config file (~/.tether/config.toml)
    /// 3. Defaults
    pub fn load() -> Result<Self, ConfigError> {
        let file = load_settings_file(&config_dir().join("config.toml"));
        Ok(file.control.merge(env_settings()?).resolve())
    }

    /// Resolve a config from file settings alone, ignoring the environment.
    pub fn from_settings(settings: SettingsFile) -> Self {
        settings.control.resolve()
    }
}

fn env_settings() -> Result<ControlSettings, ConfigError> {
    Ok(ControlSettings {
        request_timeout_ms: env_millis("TETHER_REQUEST_TIMEOUT_MS")?,
        initialize_timeout_ms: env_millis("TETHER_INITIALIZE_TIMEOUT_MS")?,
        stream_close_timeout_ms: env_millis("TETHER_STREAM_CLOSE_TIMEOUT_MS")?,
        max_buffer_size: None,
    })
}

fn env_millis(key: &str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => parse_millis(key, &raw).map(Some),
        Err(_) => Ok(None),
    }
}

fn parse_millis(key: &str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim()
        .parse::<u64>()
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected milliseconds, got '{raw}': {e}"),
        })
}

/// Get the Tether config directory path (~/.tether/).
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("TETHER_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tether")
}

/// Load and parse a TOML settings file, returning defaults on any error.
pub fn load_settings_file(path: &Path) -> SettingsFile {
    match std::fs::read_to_string(path) {
        Ok(content) => toml::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!("Failed to parse {}: {}", path.display(), e);
            SettingsFile::default()
        }),
        Err(_) => SettingsFile::default(),
    }
}
