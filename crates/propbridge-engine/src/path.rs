/*!
 * Dotted property paths.
 *
 * A path such as `odrive0.axis0.config.calibration_lockin.accel` names a
 * device followed by the members to walk. Paths are parsed once per request
 * and never cached together with the handles they resolve to.
 */
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use propbridge_devices::DeviceError;

/// Error raised when a path cannot be parsed or resolved
#[derive(Error, Debug)]
pub enum PathError {
    /// The path string is empty
    #[error("empty path")]
    Empty,

    /// The path contains an empty segment
    #[error("empty segment in path {0:?}")]
    EmptySegment(String),

    /// The path names a device but no member
    #[error("path {0:?} does not name a member")]
    NoMember(String),

    /// The leading segment is not a registered device
    #[error("unknown device {0:?}")]
    UnknownDevice(String),

    /// The leading segment names a device that is offline
    #[error("device {0:?} is offline")]
    DeviceOffline(String),

    /// A member lookup along the path failed
    #[error("cannot resolve {segment:?} in {path:?}: {source}")]
    Lookup {
        /// The full path
        path: String,
        /// The segment whose lookup failed
        segment: String,
        /// The backend error
        #[source]
        source: DeviceError,
    },
}

impl PathError {
    /// Check whether the lookup failed because the device went away
    pub fn is_connection_loss(&self) -> bool {
        match self {
            PathError::Lookup { source, .. } => source.is_connection_loss(),
            _ => false,
        }
    }
}

/// A parsed dotted path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PropertyPath {
    raw: String,
    segments: Vec<String>,
}

impl PropertyPath {
    /// Parse a dotted path; every segment must be non-empty
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        if raw.is_empty() {
            return Err(PathError::Empty);
        }
        let segments: Vec<String> = raw.split('.').map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(PathError::EmptySegment(raw.to_string()));
        }
        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// Get the path exactly as the client wrote it
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Get the device name (first segment)
    pub fn device(&self) -> &str {
        &self.segments[0]
    }

    /// Get the member segments after the device name
    pub fn members(&self) -> &[String] {
        &self.segments[1..]
    }

    /// Get the last segment, if the path names a member
    pub fn leaf(&self) -> Option<&str> {
        self.members().last().map(String::as_str)
    }
}

impl fmt::Display for PropertyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for PropertyPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for PropertyPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for PropertyPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
