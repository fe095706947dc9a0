/*!
 * Configuration management for PropBridge.
 *
 * This module provides functionality to load, validate, and access configuration
 * settings for PropBridge components.
 */
use std::path::Path;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::utils::millis_to_duration;

/// Core configuration for PropBridge
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Worker pool configuration
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Execution bridge timeouts
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Device discovery configuration
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Path resolution configuration
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// Sampling loop configuration
    #[serde(default)]
    pub sampling: SamplingConfig,
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
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to log to a file
    #[serde(default)]
    pub file_logging: bool,

    /// Log file path (if file_logging is true)
    #[serde(default = "default_log_file")]
    pub log_file: String,

    /// Whether to log to stdout
    #[serde(default = "default_true")]
    pub stdout: bool,

    /// Whether to use JSON format for logs
    #[serde(default)]
    pub json_format: bool,
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 means use available parallelism)
    #[serde(default)]
    pub worker_threads: usize,

    /// Prefix for worker thread names
    #[serde(default = "default_thread_name")]
    pub thread_name: String,
}

/// Execution bridge timeouts, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Timeout for property writes
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Timeout for a single read inside the sampling loop
    #[serde(default = "default_sample_read_timeout_ms")]
    pub sample_read_timeout_ms: u64,

    /// Timeout for on-demand reads and snapshot reads
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Timeout for action invocations
    #[serde(default = "default_invoke_timeout_ms")]
    pub invoke_timeout_ms: u64,
}

/// Device discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Prefix of the logical device names (`odrive0`, `odrive1`, ...)
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    /// Bounded wait for a single connection probe
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Delay between two probes
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Poll interval while at least one device is online and scanning is suspended
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,

    /// Identifier used for devices whose serial number cannot be read
    #[serde(default = "default_unknown_serial")]
    pub unknown_serial: String,
}

/// Path resolution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Members whose name starts with this prefix are hidden from snapshots
    #[serde(default = "default_hidden_prefix")]
    pub hidden_prefix: String,

    /// Prefix added to a leaf name to reach its read/write accessor
    #[serde(default = "default_accessor_prefix")]
    pub accessor_prefix: String,

    /// Suffix added to a leaf name to reach its read/write accessor
    #[serde(default = "default_accessor_suffix")]
    pub accessor_suffix: String,
}

/// Sampling loop configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Minimum time between two frames (0 runs at the rate device I/O allows)
    #[serde(default)]
    pub min_interval_ms: u64,
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
            file_logging: false,
            log_file: default_log_file(),
            stdout: default_true(),
            json_format: false,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            thread_name: default_thread_name(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            write_timeout_ms: default_write_timeout_ms(),
            sample_read_timeout_ms: default_sample_read_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            invoke_timeout_ms: default_invoke_timeout_ms(),
        }
    }
}

impl BridgeConfig {
    /// Timeout for property writes
    pub fn write_timeout(&self) -> Duration {
        millis_to_duration(self.write_timeout_ms)
    }

    /// Timeout for a sampling read
    pub fn sample_read_timeout(&self) -> Duration {
        millis_to_duration(self.sample_read_timeout_ms)
    }

    /// Timeout for on-demand reads
    pub fn read_timeout(&self) -> Duration {
        millis_to_duration(self.read_timeout_ms)
    }

    /// Timeout for action invocations
    pub fn invoke_timeout(&self) -> Duration {
        millis_to_duration(self.invoke_timeout_ms)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            name_prefix: default_name_prefix(),
            probe_timeout_ms: default_probe_timeout_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            idle_poll_ms: default_idle_poll_ms(),
            unknown_serial: default_unknown_serial(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            hidden_prefix: default_hidden_prefix(),
            accessor_prefix: default_accessor_prefix(),
            accessor_suffix: default_accessor_suffix(),
        }
    }
}

fn default_app_name() -> String {
    "propbridge".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "./logs/propbridge.log".to_string()
}

fn default_true() -> bool {
    true
}

fn default_thread_name() -> String {
    "propbridge-worker".to_string()
}

fn default_write_timeout_ms() -> u64 {
    1000
}

fn default_sample_read_timeout_ms() -> u64 {
    100
}

fn default_read_timeout_ms() -> u64 {
    2000
}

fn default_invoke_timeout_ms() -> u64 {
    2000
}

fn default_name_prefix() -> String {
    "odrive".to_string()
}

fn default_probe_timeout_ms() -> u64 {
    5000
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_idle_poll_ms() -> u64 {
    2000
}

fn default_unknown_serial() -> String {
    "unknown_serial".to_string()
}

fn default_hidden_prefix() -> String {
    "_".to_string()
}

fn default_accessor_prefix() -> String {
    "_".to_string()
}

fn default_accessor_suffix() -> String {
    "_property".to_string()
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
            return Ok(config);
        }

        let mut config_builder = ConfigLib::builder().add_source(
            ConfigLib::try_from(&Config::default())
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            if Path::new(&config_file).exists() {
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
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config: Config = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        config.validate()?;
        info!("Configuration loaded successfully");
        Ok(config)
    }
}

impl Config {
    /// Check values that would make the bridge unusable
    pub fn validate(&self) -> Result<()> {
        if self.discovery.name_prefix.is_empty() {
            return Err(Error::config("discovery.name_prefix must not be empty"));
        }
        if self.resolver.hidden_prefix.is_empty() {
            return Err(Error::config("resolver.hidden_prefix must not be empty"));
        }
        let bridge = &self.bridge;
        if [
            bridge.write_timeout_ms,
            bridge.sample_read_timeout_ms,
            bridge.read_timeout_ms,
            bridge.invoke_timeout_ms,
        ]
        .contains(&0)
        {
            return Err(Error::config("bridge timeouts must be greater than zero"));
        }
        Ok(())
    }
}
