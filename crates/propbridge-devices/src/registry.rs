/*!
 * Device registry for PropBridge.
 *
 * The registry maps logical device names (`odrive0`, `odrive1`, ...) to
 * connection handles and an online flag. A name is derived from the order
 * in which stable device identifiers were first seen, so a device that
 * reconnects gets its old name back.
 *
 * The registry only guards its own map. Serializing registry mutations
 * against property writes is the job of the owner (the coordinator).
 */
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::device::{DeviceError, ObjectHandle, Result};

/// Event types for device registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A device came online under this name
    DeviceFound {
        /// The logical device name
        name: String,
        /// The stable device identifier
        serial: String,
    },
    /// The online status of at least one device changed
    StatusChanged(BTreeMap<String, bool>),
}

/// A registered device
#[derive(Debug, Clone)]
pub struct DeviceEntry {
    /// The logical device name
    pub name: String,
    /// The stable device identifier
    pub serial: String,
    /// The connection handle (root object of the property tree)
    pub handle: ObjectHandle,
    /// Whether the device is currently reachable
    pub online: bool,
}

#[derive(Debug, Default)]
struct RegistryState {
    entries: BTreeMap<String, DeviceEntry>,
    known_serials: Vec<String>,
}

/// Device registry
#[derive(Debug)]
pub struct DeviceRegistry {
    /// Prefix of the logical names
    name_prefix: String,
    /// Registered devices and the identifiers seen so far
    state: RwLock<RegistryState>,
    /// Event sender for registry events
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl DeviceRegistry {
    /// Create a new device registry naming devices `<prefix><index>`
    pub fn new<S: Into<String>>(name_prefix: S) -> Self {
        let (event_sender, _) = broadcast::channel(100);
        Self {
            name_prefix: name_prefix.into(),
            state: RwLock::new(RegistryState::default()),
            event_sender,
        }
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, RegistryState>> {
        self.state.read().map_err(|_| {
            DeviceError::Other("Failed to acquire read lock on device registry".to_string())
        })
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, RegistryState>> {
        self.state.write().map_err(|_| {
            DeviceError::Other("Failed to acquire write lock on device registry".to_string())
        })
    }

    /// Register a device that a scan returned and mark it online.
    ///
    /// Returns the logical name, which is reused when the identifier was seen before.
    pub fn register(&self, serial: &str, handle: ObjectHandle) -> Result<String> {
        let (name, statuses) = {
            let mut state = self.write_state()?;
            let index = match state.known_serials.iter().position(|s| s == serial) {
                Some(index) => index,
                None => {
                    state.known_serials.push(serial.to_string());
                    state.known_serials.len() - 1
                }
            };
            let name = format!("{}{}", self.name_prefix, index);

            state.entries.insert(
                name.clone(),
                DeviceEntry {
                    name: name.clone(),
                    serial: serial.to_string(),
                    handle,
                    online: true,
                },
            );
            (name, Self::collect_statuses(&state))
        };

        info!("Found device {} as {}", serial, name);
        let _ = self.event_sender.send(RegistryEvent::StatusChanged(statuses));
        let _ = self.event_sender.send(RegistryEvent::DeviceFound {
            name: name.clone(),
            serial: serial.to_string(),
        });

        Ok(name)
    }

    /// Mark a device offline.
    ///
    /// Returns `true` if the device was online before the call.
    pub fn mark_offline(&self, name: &str) -> Result<bool> {
        let statuses = {
            let mut state = self.write_state()?;
            let entry = state
                .entries
                .get_mut(name)
                .ok_or_else(|| DeviceError::UnknownDevice(name.to_string()))?;
            if !entry.online {
                return Ok(false);
            }
            entry.online = false;
            Self::collect_statuses(&state)
        };

        info!("Lost device {}", name);
        let _ = self.event_sender.send(RegistryEvent::StatusChanged(statuses));
        Ok(true)
    }

    /// Get the handle of an online device
    pub fn handle(&self, name: &str) -> Result<ObjectHandle> {
        let state = self.read_state()?;
        match state.entries.get(name) {
            Some(entry) if entry.online => Ok(entry.handle.clone()),
            Some(_) => {
                debug!("Device {} is offline", name);
                Err(DeviceError::NotConnected)
            }
            None => Err(DeviceError::UnknownDevice(name.to_string())),
        }
    }

    /// Check if a device is registered and online
    pub fn is_online(&self, name: &str) -> bool {
        self.read_state()
            .map(|state| state.entries.get(name).map_or(false, |entry| entry.online))
            .unwrap_or(false)
    }

    /// Count online devices
    pub fn online_count(&self) -> usize {
        self.read_state()
            .map(|state| state.entries.values().filter(|entry| entry.online).count())
            .unwrap_or(0)
    }

    /// Get the online status of every registered device
    pub fn statuses(&self) -> Result<BTreeMap<String, bool>> {
        Ok(Self::collect_statuses(&*self.read_state()?))
    }

    /// Get the names and handles of all online devices
    pub fn online_devices(&self) -> Result<Vec<(String, ObjectHandle)>> {
        let state = self.read_state()?;
        Ok(state
            .entries
            .values()
            .filter(|entry| entry.online)
            .map(|entry| (entry.name.clone(), entry.handle.clone()))
            .collect())
    }

    /// Get a registered device, online or not
    pub fn entry(&self, name: &str) -> Option<DeviceEntry> {
        self.read_state().ok()?.entries.get(name).cloned()
    }

    /// Get the name assigned to an identifier, if it was ever seen
    pub fn name_for(&self, serial: &str) -> Option<String> {
        let state = self.read_state().ok()?;
        state
            .known_serials
            .iter()
            .position(|s| s == serial)
            .map(|index| format!("{}{}", self.name_prefix, index))
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    fn collect_statuses(state: &RegistryState) -> BTreeMap<String, bool> {
        state
            .entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.online))
            .collect()
    }
}

#[cfg(all(test, feature = "sim"))]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::sim::SimObject;

    fn handle() -> ObjectHandle {
        Arc::new(SimObject::builder().property("vbus_voltage", 24.0).build())
    }

    #[test]
    fn test_names_follow_discovery_order() {
        let registry = DeviceRegistry::new("odrive");
        assert_eq!(registry.register("A1", handle()).unwrap(), "odrive0");
        assert_eq!(registry.register("B2", handle()).unwrap(), "odrive1");
        assert_eq!(registry.online_count(), 2);
    }

    #[test]
    fn test_name_is_reused_on_reconnection() {
        let registry = DeviceRegistry::new("odrive");
        let first = registry.register("X1", handle()).unwrap();

        assert!(registry.mark_offline(&first).unwrap());
        assert!(!registry.is_online(&first));
        assert!(matches!(registry.handle(&first), Err(DeviceError::NotConnected)));

        let second = registry.register("X1", handle()).unwrap();
        assert_eq!(first, second);
        assert!(registry.is_online(&second));
        assert_eq!(registry.name_for("X1").as_deref(), Some("odrive0"));
    }

    #[test]
    fn test_mark_offline_twice_is_a_no_op() {
        let registry = DeviceRegistry::new("odrive");
        let name = registry.register("X1", handle()).unwrap();
        assert!(registry.mark_offline(&name).unwrap());
        assert!(!registry.mark_offline(&name).unwrap());
        assert!(matches!(
            registry.mark_offline("odrive9"),
            Err(DeviceError::UnknownDevice(_))
        ));
    }

    #[test]
    fn test_unknown_device_handle() {
        let registry = DeviceRegistry::new("odrive");
        assert!(matches!(registry.handle("odrive0"), Err(DeviceError::UnknownDevice(_))));
    }

    #[test]
    fn test_status_events() {
        let registry = DeviceRegistry::new("odrive");
        let mut events = registry.subscribe();

        let name = registry.register("X1", handle()).unwrap();
        registry.mark_offline(&name).unwrap();

        let online = BTreeMap::from([("odrive0".to_string(), true)]);
        let offline = BTreeMap::from([("odrive0".to_string(), false)]);
        assert_eq!(events.try_recv().unwrap(), RegistryEvent::StatusChanged(online));
        assert_eq!(
            events.try_recv().unwrap(),
            RegistryEvent::DeviceFound {
                name: "odrive0".to_string(),
                serial: "X1".to_string()
            }
        );
        assert_eq!(events.try_recv().unwrap(), RegistryEvent::StatusChanged(offline));
    }

    #[test]
    fn test_online_devices_skip_offline_entries() {
        let registry = DeviceRegistry::new("odrive");
        registry.register("A", handle()).unwrap();
        let b = registry.register("B", handle()).unwrap();
        registry.mark_offline(&b).unwrap();

        let names: Vec<String> = registry
            .online_devices()
            .unwrap()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["odrive0".to_string()]);
        assert_eq!(registry.statuses().unwrap().len(), 2);
        assert_eq!(registry.entry(&b).map(|e| e.serial), Some("B".to_string()));
    }
}
