//! Serde-backed configuration for the standard [Pipeline](crate::pipeline::Pipeline).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unable to read configuration file: {0}")]
    Io(
        #[source]
        #[from]
        std::io::Error,
    ),
    #[error("Invalid configuration: {0}")]
    Yaml(
        #[source]
        #[from]
        serde_yaml::Error,
    ),
}

/// Configuration for every stage of the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PipelineConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(contents)?)
    }
}

/// Which part of the request identifies the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientKeySource {
    /// The address of the connected peer.
    #[default]
    PeerIp,
    /// The address reported by a trusted reverse proxy (`Forwarded` / `X-Forwarded-For`).
    RealIp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum admitted requests per client within any window
    #[serde(default = "default_capacity")]
    pub capacity: u64,

    /// Window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    #[serde(default)]
    pub key: ClientKeySource,

    /// How often idle clients are evicted, in seconds; `null` disables eviction
    #[serde(default = "default_gc_interval_secs")]
    pub gc_interval_secs: Option<u64>,

    /// Send `x-ratelimit-*` and `retry-after` headers
    #[serde(default)]
    pub headers: bool,

    /// Give the slot back when the handler responds with a 5xx
    #[serde(default)]
    pub rollback_server_errors: bool,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn gc_interval(&self) -> Option<Duration> {
        self.gc_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            window_ms: default_window_ms(),
            key: ClientKeySource::default(),
            gc_interval_secs: default_gc_interval_secs(),
            headers: false,
            rollback_server_errors: false,
        }
    }
}

fn default_capacity() -> u64 {
    100
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_gc_interval_secs() -> Option<u64> {
    Some(crate::backend::DEFAULT_GC_INTERVAL_SECONDS)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    /// Include `stack` and `details` in fault responses
    #[serde(default)]
    pub verbose: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log every request at info level
    #[serde(default = "default_access_log")]
    pub access_log: bool,

    /// Requests slower than this many milliseconds are logged as warnings
    #[serde(default = "default_slow_request_ms")]
    pub slow_request_ms: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            access_log: default_access_log(),
            slow_request_ms: default_slow_request_ms(),
        }
    }
}

fn default_access_log() -> bool {
    false
}

fn default_slow_request_ms() -> u64 {
    1000
}
