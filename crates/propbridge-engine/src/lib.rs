/*!
 * PropBridge Engine
 *
 * This crate resolves dotted property paths against the device registry,
 * coordinates concurrent reads and writes, snapshots property trees and
 * runs the sampling loop. A transport drives it through the request
 * [`Service`].
 */

#![warn(missing_docs)]

// Re-export core types
pub use propbridge_core::prelude;

// Re-export types from propbridge_core for convenience
pub use propbridge_core::types::{DeclaredType, LeafType, Value};

pub mod coordinator;
pub mod error;
pub mod introspect;
pub mod path;
pub mod resolver;
pub mod sampler;
pub mod service;
pub mod worker;

// Re-export main types for convenience
pub use coordinator::{Coordinator, PropertyValue, Reading};
pub use error::{Error, Result};
pub use introspect::{Introspection, Introspector, LeafSnapshot, SnapshotEntry, TreeSnapshot};
pub use path::{PathError, PropertyPath};
pub use resolver::{AccessorNaming, PathResolver, ResolvedLeaf};
pub use sampler::{Frame, Sampler, SamplingControl, SamplingState, SamplingStats};
pub use service::{Dispatcher, Request, Responder, Response, Service, Session};
pub use worker::WorkerPool;

/// PropBridge engine crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the engine
pub fn init() -> Result<()> {
    tracing::info!("PropBridge Engine {} initialized", VERSION);
    Ok(())
}
