//! Coordination Configuration
//!
//! This module provides configuration structures for connecting to the
//! coordination store and choosing the namespace paths the protocols use.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::retry::RetryConfig;
use crate::store::path;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordConfig {
    /// Coordination store connection
    pub store: StoreConfig,

    /// Namespace paths and identity
    #[serde(default)]
    pub coordination: CoordinationConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Coordination store connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Comma-separated host:port list
    pub endpoints: String,

    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Reconnection backoff
    #[serde(default)]
    pub retry: RetrySettings,
}

/// Reconnection backoff settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// First delay after a failed attempt
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound for the delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Multiplier applied after each failure
    #[serde(default = "default_factor")]
    pub factor: f64,

    /// Maximum attempts (0 = retry forever)
    #[serde(default)]
    pub max_retries: usize,
}

/// Namespace paths and identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Path under which members register
    #[serde(default = "default_namespace_path")]
    pub namespace_path: String,

    /// Self identity (auto-generated when absent)
    #[serde(default)]
    pub identity: Option<String>,

    /// Path under which crash monitors register themselves
    #[serde(default = "default_monitor_path")]
    pub monitor_path: String,

    /// Persistent node watched for change data capture
    #[serde(default = "default_data_path")]
    pub data_path: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Largest accepted backoff multiplier
pub const MAX_RETRY_FACTOR: f64 = 10.0;

// Default value functions
fn default_session_timeout_ms() -> u64 {
    10_000
}

fn default_initial_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_factor() -> f64 {
    2.0
}

fn default_namespace_path() -> String {
    "/nodes".to_string()
}

fn default_monitor_path() -> String {
    "/monitors".to_string()
}

fn default_data_path() -> String {
    "/data".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            factor: default_factor(),
            max_retries: 0,
        }
    }
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            namespace_path: default_namespace_path(),
            identity: None,
            monitor_path: default_monitor_path(),
            data_path: default_data_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig {
                endpoints: "localhost:2182,localhost:2183,localhost:2184".to_string(),
                session_timeout_ms: default_session_timeout_ms(),
                retry: RetrySettings::default(),
            },
            coordination: CoordinationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl CoordConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: CoordConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("failed to render configuration: {}", e)))
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        let endpoints = self.endpoints();
        if endpoints.is_empty() {
            return Err(crate::Error::Config("store.endpoints cannot be empty".into()));
        }
        for endpoint in &endpoints {
            validate_endpoint(endpoint)?;
        }

        for (key, value) in [
            ("coordination.namespace_path", &self.coordination.namespace_path),
            ("coordination.monitor_path", &self.coordination.monitor_path),
            ("coordination.data_path", &self.coordination.data_path),
        ] {
            path::validate(value)
                .map_err(|e| crate::Error::Config(format!("{}: {}", key, e)))?;
        }

        if let Some(identity) = &self.coordination.identity {
            if identity.is_empty() || identity.contains('/') {
                return Err(crate::Error::Config(format!(
                    "coordination.identity '{}' must be non-empty and contain no '/'",
                    identity
                )));
            }
        }

        if self.store.session_timeout_ms == 0 {
            return Err(crate::Error::Config("store.session_timeout_ms must be > 0".into()));
        }

        let retry = &self.store.retry;
        if !(1.0..=MAX_RETRY_FACTOR).contains(&retry.factor) {
            return Err(crate::Error::Config(format!(
                "store.retry.factor must be between 1.0 and {}",
                MAX_RETRY_FACTOR
            )));
        }
        if retry.max_delay_ms < retry.initial_delay_ms {
            return Err(crate::Error::Config(
                "store.retry.max_delay_ms must be >= store.retry.initial_delay_ms".into(),
            ));
        }

        Ok(())
    }

    /// Parsed endpoint list
    pub fn endpoints(&self) -> Vec<String> {
        self.store
            .endpoints
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Configured identity, or a freshly generated one
    pub fn identity(&self) -> String {
        self.coordination
            .identity
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string())
    }

    /// Get session timeout as Duration
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.store.session_timeout_ms)
    }

    /// Reconnection backoff
    pub fn retry(&self) -> RetryConfig {
        let settings = &self.store.retry;
        RetryConfig {
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            factor: settings.factor,
            max_retries: (settings.max_retries > 0).then_some(settings.max_retries),
        }
    }
}

fn validate_endpoint(endpoint: &str) -> crate::Result<()> {
    match endpoint.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(()),
        _ => Err(crate::Error::Config(format!(
            "store.endpoints entry '{}' is not host:port",
            endpoint
        ))),
    }
}
