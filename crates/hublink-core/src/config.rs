/*!
 * Configuration management for HubLink.
 *
 * This module provides functionality to load, validate, and access the
 * runtime settings of the hub client: enumeration cadence, network timeouts,
 * attribute caching and TLS trust options.
 */
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Core configuration for HubLink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Network and enumeration configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// TLS trust configuration
    #[serde(default)]
    pub tls: TlsConfig,
}

/// Network and enumeration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// How long a full device enumeration stays valid, in milliseconds
    #[serde(default = "default_device_list_validity_ms")]
    pub device_list_validity_ms: u64,

    /// Connection timeout for hub requests, in milliseconds
    #[serde(default = "default_network_timeout_ms")]
    pub network_timeout_ms: u64,

    /// How long a cached device attribute snapshot stays valid, in milliseconds
    #[serde(default = "default_cache_validity_ms")]
    pub cache_validity_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to log to stdout
    #[serde(default = "default_log_stdout")]
    pub stdout: bool,
}

/// TLS trust configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Whether to verify the hub certificate chain
    #[serde(default = "default_verify_peer")]
    pub verify_peer: bool,

    /// Path to an additional trusted CA bundle
    #[serde(default)]
    pub trusted_ca: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            logging: LoggingConfig::default(),
            tls: TlsConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            device_list_validity_ms: default_device_list_validity_ms(),
            network_timeout_ms: default_network_timeout_ms(),
            cache_validity_ms: default_cache_validity_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            stdout: default_log_stdout(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            verify_peer: default_verify_peer(),
            trusted_ca: None,
        }
    }
}

impl Config {
    /// Load configuration from the default file and `HUBLINK`-prefixed
    /// environment variables
    pub fn load() -> Result<Config> {
        ConfigBuilder::new()
            .with_config_file("hublink.toml")
            .with_environment_prefix("HUBLINK")
            .build()
    }
}

impl NetworkConfig {
    /// Device-list validity as a Duration
    pub fn device_list_validity(&self) -> Duration {
        Duration::from_millis(self.device_list_validity_ms)
    }

    /// Network timeout as a Duration
    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    /// Attribute-cache validity as a Duration
    pub fn cache_validity(&self) -> Duration {
        Duration::from_millis(self.cache_validity_ms)
    }
}

fn default_device_list_validity_ms() -> u64 {
    10_000
}

fn default_network_timeout_ms() -> u64 {
    20_000
}

fn default_cache_validity_ms() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_stdout() -> bool {
    true
}

fn default_verify_peer() -> bool {
    true
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
    override_with: Option<Config>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Override with an existing config
    pub fn override_with(mut self, config: Config) -> Self {
        self.override_with = Some(config);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        let mut config_builder = ConfigLib::builder();

        // Start with default values
        let default_config = Config::default();
        config_builder = config_builder
            .add_source(config::Config::try_from(&default_config)
                .map_err(|e| Error::invalid_argument(format!("Failed to create default config: {}", e)))?);

        // Add configuration from file if specified
        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        // Add configuration from environment variables if prefix is specified
        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true)
            );
        }

        // Build the config
        let config_lib = config_builder.build()
            .map_err(|e| Error::invalid_argument(format!("Failed to build configuration: {}", e)))?;

        // Convert to our config type
        let mut config: Config = config_lib.try_deserialize()
            .map_err(|e| Error::invalid_argument(format!("Failed to deserialize configuration: {}", e)))?;

        // Override with provided config if specified
        if let Some(override_config) = self.override_with {
            config = override_config;
        }

        info!("Configuration loaded successfully");
        Ok(config)
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<Config>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: Config) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &Config {
        &self.0
    }
}

impl From<Config> for SharedConfig {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}

impl AsRef<Config> for SharedConfig {
    fn as_ref(&self) -> &Config {
        self.get()
    }
}
