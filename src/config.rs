//! Configuration management for Sluice.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, SluiceError};
use crate::ratelimit::{LimitParams, LimitRules, DEFAULT_DURATION, DEFAULT_MAX, DEFAULT_RATE};

/// Prefix for environment variable overrides, e.g. `SLUICE__LIMITER__MAX=10`.
const ENV_PREFIX: &str = "SLUICE";
const ENV_SEPARATOR: &str = "__";

/// Main configuration for Sluice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SluiceConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Limiter defaults and rules
    #[serde(default)]
    pub limiter: LimiterConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Default bucket capacity
    #[serde(default = "default_max")]
    pub max: u64,

    /// Default drain rate in drips per second
    #[serde(default = "default_rate")]
    pub rate: f64,

    /// Default timeout in seconds once a limit is exceeded
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Path to a limit rules file
    pub rules_path: Option<String>,

    /// Report bucket mutations as tracing events
    #[serde(default = "default_notifications")]
    pub notifications: bool,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max: default_max(),
            rate: default_rate(),
            timeout_secs: default_timeout_secs(),
            rules_path: None,
            notifications: default_notifications(),
        }
    }
}

fn default_max() -> u64 {
    DEFAULT_MAX
}

fn default_rate() -> f64 {
    DEFAULT_RATE
}

fn default_timeout_secs() -> u64 {
    DEFAULT_DURATION
}

fn default_notifications() -> bool {
    true
}

impl LimiterConfig {
    /// Parameters for keys no rule matches.
    pub fn defaults(&self) -> LimitParams {
        LimitParams {
            max: self.max,
            rate: self.rate,
            duration: self.timeout_secs,
        }
    }

    /// Load the configured rule table, or an empty one.
    pub fn load_rules(&self) -> Result<LimitRules> {
        match &self.rules_path {
            Some(path) => LimitRules::from_file(path),
            None => Ok(LimitRules::new()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max == 0 {
            return Err(SluiceError::Config("limiter.max must be greater than zero".to_string()));
        }
        if !self.rate.is_finite() || self.rate <= 0.0 {
            return Err(SluiceError::Config(format!(
                "limiter.rate must be a positive number, got {}",
                self.rate
            )));
        }
        Ok(())
    }
}

impl SluiceConfig {
    /// Load configuration from an optional file, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        );

        let config: SluiceConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| SluiceError::Config(e.to_string()))?;
        config.limiter.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: SluiceConfig =
            serde_yaml::from_str(yaml).map_err(|e| SluiceError::Config(e.to_string()))?;
        config.limiter.validate()?;
        Ok(config)
    }
}
