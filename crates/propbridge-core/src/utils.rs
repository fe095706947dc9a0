/*!
 * Utility functions and helpers for PropBridge.
 */
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Spawn a named OS thread that logs when its body returns an error
///
/// # Arguments
///
/// * `name` - The thread name (also used for logging)
/// * `body` - The closure to run on the thread
pub fn spawn_named<F, E>(name: &str, body: F) -> Result<thread::JoinHandle<()>>
where
    F: FnOnce() -> std::result::Result<(), E> + Send + 'static,
    E: std::fmt::Display,
{
    let thread_name = name.to_string();
    thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || match body() {
            Ok(()) => debug!("Thread '{}' finished", thread_name),
            Err(e) => warn!("Thread '{}' failed: {}", thread_name, e),
        })
        .map_err(|e| Error::runtime(format!("Failed to spawn thread {}: {}", name, e)))
}

/// Convert milliseconds to a Duration
pub fn millis_to_duration(millis: u64) -> Duration {
    Duration::from_millis(millis)
}
