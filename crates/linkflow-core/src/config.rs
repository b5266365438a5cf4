/*!
 * Configuration management for linkflow.
 *
 * This module provides functionality to load, validate, and access configuration
 * settings for device links: defaults, then an optional file, then environment
 * variables.
 */
use std::path::Path;
use std::sync::Arc;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Core configuration for linkflow
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Link defaults shared by every client
    #[serde(default)]
    pub link: LinkConfig,

    /// Configured device clients
    #[serde(default)]
    pub clients: Vec<ClientConfig>,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Application environment (development, production, etc.)
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log filter (trace, debug, info, warn, error, or a full directive)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to include the event target in log lines
    #[serde(default = "default_true")]
    pub with_target: bool,

    /// Whether to emit ANSI colours
    #[serde(default = "default_true")]
    pub ansi: bool,
}

/// Connection, framing, and dispatch defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Reconnect automatically after a failure
    #[serde(default = "default_true")]
    pub retry_enabled: bool,

    /// Delay between a failure and the next connect attempt
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Keep retrying when the device rejected our credentials
    #[serde(default = "default_true")]
    pub retry_on_auth_failure: bool,

    /// Upper bound for a single connect attempt
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Default delay between consecutive outbound commands
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,

    /// Largest unterminated remainder the receive buffer may hold
    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: usize,

    /// Maximum number of commands waiting to be sent
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Hold commands while disconnected instead of rejecting them
    #[serde(default = "default_true")]
    pub queue_while_disconnected: bool,
}

/// A single configured device client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    /// Unique client name
    pub name: String,

    /// Connection string, e.g. `tcp://host=10.0.0.5;port=23`
    pub endpoint: String,

    /// Frame delimiter; ignored when `frame_length` is set
    #[serde(default = "default_delimiter")]
    pub delimiter: String,

    /// Fixed frame length for binary protocols
    #[serde(default)]
    pub frame_length: Option<usize>,

    /// Per-client pacing override
    #[serde(default)]
    pub pacing_ms: Option<u64>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            environment: default_environment(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            with_target: true,
            ansi: true,
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            retry_enabled: true,
            retry_interval_ms: default_retry_interval_ms(),
            retry_on_auth_failure: true,
            connect_timeout_ms: default_connect_timeout_ms(),
            pacing_ms: default_pacing_ms(),
            max_buffer_bytes: default_max_buffer_bytes(),
            queue_capacity: default_queue_capacity(),
            queue_while_disconnected: true,
        }
    }
}

impl Config {
    /// Validate cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.link.max_buffer_bytes == 0 {
            return Err(Error::config("link.max_buffer_bytes must be greater than zero"));
        }
        if self.link.queue_capacity == 0 {
            return Err(Error::config("link.queue_capacity must be greater than zero"));
        }

        let mut names = std::collections::HashSet::new();
        for client in &self.clients {
            if client.name.is_empty() {
                return Err(Error::config("client name must not be empty"));
            }
            if !names.insert(client.name.as_str()) {
                return Err(Error::config(format!("duplicate client name: {}", client.name)));
            }
            if client.frame_length.is_none() && client.delimiter.is_empty() {
                return Err(Error::config(format!(
                    "client {} needs a delimiter or a frame_length",
                    client.name
                )));
            }
            if client.frame_length == Some(0) {
                return Err(Error::config(format!(
                    "client {} has a zero frame_length",
                    client.name
                )));
            }
        }

        Ok(())
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn default_app_name() -> String {
    "linkflow".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_retry_interval_ms() -> u64 {
    5_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_pacing_ms() -> u64 {
    100
}

fn default_max_buffer_bytes() -> usize {
    64 * 1024
}

fn default_queue_capacity() -> usize {
    256
}

fn default_delimiter() -> String {
    "\n".to_string()
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
        if let Some(config) = self.override_with {
            config.validate()?;
            return Ok(config);
        }

        let mut config_builder = ConfigLib::builder();

        // Start with default values
        let default_config = Config::default();
        config_builder = config_builder.add_source(
            ConfigLib::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config_lib = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?;

        let config: Config = config_lib
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        config.validate()?;

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
