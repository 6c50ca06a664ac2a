//! # Plugin Configuration
//!
//! Centralized configuration for the switch statistics plugin: request and
//! notification quotas, collector scheduling, chain submission cadence and
//! logging.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use plugin_config::PluginConfig;
//!
//! let config = PluginConfig::load(Some(std::path::Path::new("config/plugin.toml"))).unwrap();
//! config.validate().unwrap();
//! println!("rpc quota: {}", config.rpc_requests_quota);
//! ```

pub mod defaults;
pub mod plugin_config;

pub use plugin_config::{
    ChainConfig, ConfigError, LoggingConfig, PluginConfig, StatisticsConfig, ENV_PREFIX,
};
