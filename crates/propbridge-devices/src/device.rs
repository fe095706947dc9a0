/*!
 * Remote device abstractions.
 *
 * A connected device is seen as a tree of remote objects. Each object lists
 * its members by name and kind; a member is a plain value, a remote property
 * with read/write accessors, a callable function or a nested object. Backends
 * implement these traits; the rest of PropBridge depends only on them.
 */
use std::fmt::{self, Debug};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use propbridge_core::{error::Error as CoreError, types::Value};

/// Substrings that mark an error description as a lost connection
pub const CONNECTION_LOSS_MARKERS: [&str; 3] = ["lost", "disconnect", "connection"];

/// Error type for device operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The device is not connected
    #[error("Device not connected")]
    NotConnected,

    /// No device is registered under this name
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// The object has no member with this name
    #[error("Member not found: {0}")]
    MemberNotFound(String),

    /// The member exists but is of another kind
    #[error("Member {name} is a {found}, expected a {expected}")]
    WrongMemberKind {
        /// The member name
        name: String,
        /// The kind the operation needed
        expected: MemberKind,
        /// The kind the member actually has
        found: MemberKind,
    },

    /// The transport to the device went away
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The member cannot be written
    #[error("Member is read-only: {0}")]
    ReadOnly(String),

    /// The value is not acceptable for the member
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Communication error with the device
    #[error("Communication error: {0}")]
    Communication(String),

    /// Timeout error
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

impl DeviceError {
    /// Check whether this error means the device is no longer reachable.
    ///
    /// Backends report transport failures with free-form descriptions, so the
    /// description of a communication, timeout, core or other error counts
    /// when it mentions a lost connection. Lookup and value errors never do.
    pub fn is_connection_loss(&self) -> bool {
        match self {
            DeviceError::ConnectionLost(_) | DeviceError::NotConnected => true,
            DeviceError::UnknownDevice(_)
            | DeviceError::MemberNotFound(_)
            | DeviceError::WrongMemberKind { .. }
            | DeviceError::ReadOnly(_)
            | DeviceError::InvalidValue(_) => false,
            DeviceError::Communication(text)
            | DeviceError::Timeout(text)
            | DeviceError::Other(text) => mentions_connection_loss(text),
            DeviceError::Core(err) => mentions_connection_loss(&err.to_string()),
        }
    }
}

fn mentions_connection_loss(text: &str) -> bool {
    let text = text.to_lowercase();
    CONNECTION_LOSS_MARKERS.iter().any(|marker| text.contains(marker))
}

/// Kind of a member in a remote object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberKind {
    /// A readable (and possibly writable) scalar
    Leaf,
    /// A callable action
    Callable,
    /// A nested object
    SubTree,
}

impl fmt::Display for MemberKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberKind::Leaf => f.write_str("leaf"),
            MemberKind::Callable => f.write_str("callable"),
            MemberKind::SubTree => f.write_str("sub-tree"),
        }
    }
}

/// Name and kind of a member, as listed by [`RemoteObject::members`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    /// The member name
    pub name: String,
    /// The member kind
    pub kind: MemberKind,
}

impl MemberInfo {
    /// Create a new member description
    pub fn new<S: Into<String>>(name: S, kind: MemberKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// A shared handle to a remote object
pub type ObjectHandle = Arc<dyn RemoteObject>;

/// A member looked up on a remote object
#[derive(Debug, Clone)]
pub enum Member {
    /// A plain value held locally by the handle
    Value(Value),
    /// A remote property reached through read/write accessors
    Property(Arc<dyn RemoteProperty>),
    /// A callable action
    Function(Arc<dyn RemoteFunction>),
    /// A nested object
    Object(ObjectHandle),
}

impl Member {
    /// Get the kind of this member
    pub fn kind(&self) -> MemberKind {
        match self {
            Member::Value(_) | Member::Property(_) => MemberKind::Leaf,
            Member::Function(_) => MemberKind::Callable,
            Member::Object(_) => MemberKind::SubTree,
        }
    }

    /// Take the nested object, or fail with a wrong-kind error
    pub fn into_object(self, name: &str) -> Result<ObjectHandle> {
        match self {
            Member::Object(object) => Ok(object),
            other => Err(DeviceError::WrongMemberKind {
                name: name.to_string(),
                expected: MemberKind::SubTree,
                found: other.kind(),
            }),
        }
    }

    /// Take the callable, or fail with a wrong-kind error
    pub fn into_function(self, name: &str) -> Result<Arc<dyn RemoteFunction>> {
        match self {
            Member::Function(function) => Ok(function),
            other => Err(DeviceError::WrongMemberKind {
                name: name.to_string(),
                expected: MemberKind::Callable,
                found: other.kind(),
            }),
        }
    }
}

/// A node of a device's property tree
///
/// Enumeration and lookup are local operations on the handle; only property
/// accessors and function calls talk to the device.
pub trait RemoteObject: Send + Sync + Debug {
    /// List all members, including hidden ones
    fn members(&self) -> Result<Vec<MemberInfo>>;

    /// Look up a member by name
    fn member(&self, name: &str) -> Result<Member>;
}

/// A remote scalar with read and write accessors
#[async_trait]
pub trait RemoteProperty: Send + Sync + Debug {
    /// Read the current value from the device
    async fn read(&self) -> Result<Value>;

    /// Write a new value to the device
    async fn write(&self, value: Value) -> Result<()>;
}

/// A remote callable without arguments
#[async_trait]
pub trait RemoteFunction: Send + Sync + Debug {
    /// Invoke the function on the device
    async fn call(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_loss_classification() {
        assert!(DeviceError::ConnectionLost("usb".into()).is_connection_loss());
        assert!(DeviceError::NotConnected.is_connection_loss());
        assert!(DeviceError::Communication("object LOST".into()).is_connection_loss());
        assert!(DeviceError::Other("device disconnected".into()).is_connection_loss());
        assert!(DeviceError::Other("USB connection reset".into()).is_connection_loss());

        assert!(!DeviceError::Communication("checksum mismatch".into()).is_connection_loss());
        assert!(!DeviceError::Timeout("no reply".into()).is_connection_loss());
        assert!(!DeviceError::MemberNotFound("lost_counter".into()).is_connection_loss());
    }

    #[test]
    fn test_lookup_and_value_errors_are_not_connection_loss() {
        let err = DeviceError::WrongMemberKind {
            name: "connection_timeout".into(),
            expected: MemberKind::SubTree,
            found: MemberKind::Leaf,
        };
        assert!(!err.is_connection_loss());
        assert!(!DeviceError::ReadOnly("disconnect_count".into()).is_connection_loss());
        assert!(!DeviceError::InvalidValue("connection: bad".into()).is_connection_loss());
    }

    #[test]
    fn test_core_errors_are_classified_by_description() {
        let err: DeviceError = CoreError::runtime("transport lost").into();
        assert!(err.is_connection_loss());

        let err: DeviceError = CoreError::timeout("read timed out").into();
        assert!(!err.is_connection_loss());
    }

    #[test]
    fn test_wrong_member_kind() {
        let member = Member::Value(Value::Float(1.0));
        assert_eq!(member.kind(), MemberKind::Leaf);

        let err = member.into_object("vbus_voltage").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Member vbus_voltage is a leaf, expected a sub-tree"
        );
    }
}
