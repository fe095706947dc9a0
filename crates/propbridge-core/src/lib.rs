/*!
 * PropBridge Core
 *
 * This crate provides the core functionality shared by the PropBridge crates:
 * leaf values and their wire coercion, configuration, logging and the
 * execution bridge that drives device operations from blocking threads.
 */

#![warn(missing_docs)]

pub mod bridge;
pub mod config;
pub mod error;
pub mod logging;
pub mod prelude;
pub mod types;
pub mod utils;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use chrono;
    pub use futures;
    pub use serde_json;
    pub use tokio;
    pub use tracing;
}

/// PropBridge core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization
pub fn init() -> Result<(), error::Error> {
    logging::init()?;
    tracing::info!("PropBridge Core {} initialized", VERSION);
    Ok(())
}

/// Library initialization from a loaded configuration
pub fn init_with_config(config: &config::Config) -> Result<(), error::Error> {
    logging::init_from_config(&config.logging)?;
    tracing::info!(
        "PropBridge Core {} initialized ({})",
        VERSION,
        config.general.environment
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
