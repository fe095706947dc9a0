/*!
 * Logging functionality for PropBridge.
 *
 * This module provides tracing setup and utilities for consistent logging
 * across the PropBridge crates.
 */
use std::fs::{self, File};
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Initialize the logging system with default configuration
pub fn init() -> Result<()> {
    init_with_filter("info")
}

/// Initialize the logging system with a specific filter
///
/// # Arguments
///
/// * `filter` - The log filter string (e.g., "info", "debug", "propbridge_engine=trace")
pub fn init_with_filter(filter: &str) -> Result<()> {
    init_from_config(&LoggingConfig {
        level: filter.to_string(),
        ..LoggingConfig::default()
    })
}

/// Initialize the logging system from a logging configuration.
///
/// `RUST_LOG` takes precedence over the configured level. When file logging is
/// enabled the file is truncated and written without ANSI colors.
pub fn init_from_config(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let mut layers: Vec<BoxedLayer> = Vec::new();

    if config.stdout {
        if config.json_format {
            layers.push(fmt::layer().json().with_target(true).boxed());
        } else {
            layers.push(fmt::layer().with_target(true).boxed());
        }
    }

    if config.file_logging {
        let path = Path::new(&config.log_file);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        layers.push(
            fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(Mutex::new(file))
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| Error::runtime(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}

/// A type alias for a tracing span
pub type Span = tracing::Span;

/// Create a new span for an operation on a property path
///
/// # Arguments
///
/// * `name` - The name of the operation
/// * `path` - The dotted property path it targets
pub fn operation_span(name: &str, path: &str) -> Span {
    tracing::debug_span!("operation", name = %name, path = %path)
}
