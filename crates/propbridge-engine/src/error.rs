/*!
 * Error types for the PropBridge engine crate.
 */
use thiserror::Error;

use crate::path::PathError;

/// Error type for PropBridge engine operations
#[derive(Error, Debug)]
pub enum Error {
    /// The path does not resolve to a member of an online device
    #[error("Path error: {0}")]
    Path(#[from] PathError),

    /// The declared type and value of a write cannot be coerced
    #[error("Unsupported type: {0}")]
    UnsupportedType(String),

    /// A bounded operation did not complete in time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Device error
    #[error("Device error: {0}")]
    Device(#[from] propbridge_devices::DeviceError),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] propbridge_core::error::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for PropBridge engine operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new unsupported type error
    pub fn unsupported_type<S: AsRef<str>>(msg: S) -> Self {
        Error::UnsupportedType(msg.as_ref().to_string())
    }

    /// Create a new timeout error
    pub fn timeout<S: AsRef<str>>(msg: S) -> Self {
        Error::Timeout(msg.as_ref().to_string())
    }

    /// Create a new other error
    pub fn other<S: AsRef<str>>(msg: S) -> Self {
        Error::Other(msg.as_ref().to_string())
    }

    /// Check whether this error means a device is no longer reachable
    pub fn is_connection_loss(&self) -> bool {
        match self {
            Error::Path(e) => e.is_connection_loss(),
            Error::Device(e) => e.is_connection_loss(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}
