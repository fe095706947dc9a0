/*!
 * PropBridge Devices
 *
 * This crate provides the remote-object abstractions a device backend
 * implements, the registry of named devices and the discovery loop that
 * attaches new devices as they appear.
 */

#![warn(missing_docs)]

// Re-export core types
pub use propbridge_core::prelude;

pub mod device;
pub mod discovery;
pub mod registry;

#[cfg(feature = "sim")]
pub mod sim;

pub use device::{
    DeviceError, Member, MemberInfo, MemberKind, ObjectHandle, RemoteFunction, RemoteObject,
    RemoteProperty,
};
pub use discovery::{Connector, DeviceDiscovery, DeviceSink, DiscoveredDevice, DiscoveryOptions};
pub use registry::{DeviceEntry, DeviceRegistry, RegistryEvent};

/// PropBridge devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the device system
pub fn init() -> Result<(), propbridge_core::error::Error> {
    tracing::info!("PropBridge Devices {} initialized", VERSION);
    Ok(())
}

/// Names of the backends compiled into this build
pub fn available_backends() -> Vec<&'static str> {
    #[allow(unused_mut)]
    let mut backends = Vec::new();

    #[cfg(feature = "sim")]
    backends.push("sim");

    backends
}
