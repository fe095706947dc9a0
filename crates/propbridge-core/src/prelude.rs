/*!
 * Prelude module for PropBridge Core.
 *
 * This module re-exports commonly used types and functions from the PropBridge Core crate
 * to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{DeclaredType, LeafType, Value};

// Re-export the execution bridge
pub use crate::bridge::{ExecutionBridge, Outcome};

// Re-export config types
pub use crate::config::{Config, ConfigBuilder};

// Re-export utility functions
pub use crate::utils::{millis_to_duration, spawn_named};

// Re-export logging macros
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
