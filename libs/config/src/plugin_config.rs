//! Plugin Configuration Module
//!
//! Loads [`PluginConfig`] from an optional TOML file with environment
//! overrides (`OFPLUGIN__` prefix, `__` between nested keys), e.g.
//! `OFPLUGIN__STATISTICS__PER_DEVICE_QUOTA=8`.

use crate::defaults;
use anyhow::{Context, Result};
use config_crate::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "OFPLUGIN";

/// Validation failures; any of them aborts initialization
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} has to be in range <{min},{max}>, got {value}")]
    OutOfRange {
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },

    #[error("{field}: {message}")]
    Invalid { field: &'static str, message: String },
}

impl ConfigError {
    pub fn field(&self) -> &'static str {
        match self {
            ConfigError::OutOfRange { field, .. } | ConfigError::Invalid { field, .. } => *field,
        }
    }
}

/// Main plugin configuration structure
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct PluginConfig {
    /// Ceiling of concurrently outstanding device requests, process-wide
    pub rpc_requests_quota: u64,

    /// Capacity of the inbound device-response channel
    pub global_notification_quota: u64,

    /// Refuse switches that lack flow, table, group or meter statistics
    pub switch_features_mandatory: bool,

    pub statistics: StatisticsConfig,
    pub chain: ChainConfig,
    pub logging: LoggingConfig,
}

/// Statistics collection settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct StatisticsConfig {
    pub min_request_interval_ms: u64,
    pub max_nodes_for_collector: usize,
    /// Optional per-device ceiling on outstanding requests
    pub per_device_quota: Option<usize>,
    pub request_timeout_ms: u64,
}

/// Transaction chain settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ChainConfig {
    pub submit_interval_ms: u64,
}

/// Logging settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            rpc_requests_quota: defaults::quota::RPC_REQUESTS_QUOTA,
            global_notification_quota: defaults::quota::GLOBAL_NOTIFICATION_QUOTA,
            switch_features_mandatory: false,
            statistics: StatisticsConfig::default(),
            chain: ChainConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            min_request_interval_ms: defaults::statistics::MIN_REQUEST_INTERVAL_MS,
            max_nodes_for_collector: defaults::statistics::MAX_NODES_FOR_COLLECTOR,
            per_device_quota: None,
            request_timeout_ms: defaults::statistics::REQUEST_TIMEOUT_MS,
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            submit_interval_ms: defaults::chain::SUBMIT_INTERVAL_MS,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl StatisticsConfig {
    pub fn min_request_interval(&self) -> Duration {
        Duration::from_millis(self.min_request_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl ChainConfig {
    pub fn submit_interval(&self) -> Duration {
        Duration::from_millis(self.submit_interval_ms)
    }
}

impl PluginConfig {
    /// Load configuration from an optional file with environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!("Loading plugin config: {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        } else {
            debug!("No config file given, using defaults with environment overrides");
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Parse configuration from a TOML string (no environment overrides)
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Config::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    /// Check every bound; violations are fatal configuration errors
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        check_range("rpc_requests_quota", self.rpc_requests_quota, 1, defaults::quota::MAX_QUOTA)?;
        check_range(
            "global_notification_quota",
            self.global_notification_quota,
            1,
            u32::MAX as u64,
        )?;
        check_range(
            "statistics.max_nodes_for_collector",
            self.statistics.max_nodes_for_collector as u64,
            1,
            u16::MAX as u64,
        )?;
        if let Some(per_device) = self.statistics.per_device_quota {
            check_range(
                "statistics.per_device_quota",
                per_device as u64,
                1,
                defaults::quota::MAX_QUOTA,
            )?;
        }
        if self.statistics.min_request_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "statistics.min_request_interval_ms",
                message: "must be greater than zero".to_string(),
            });
        }
        if self.statistics.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "statistics.request_timeout_ms",
                message: "must be greater than zero".to_string(),
            });
        }
        if self.chain.submit_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "chain.submit_interval_ms",
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

fn check_range(field: &'static str, value: u64, min: u64, max: u64) -> std::result::Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange { field, value, min, max });
    }
    Ok(())
}
