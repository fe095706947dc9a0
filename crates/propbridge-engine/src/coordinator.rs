/*!
 * Concurrency coordination of device access.
 *
 * The [`Coordinator`] owns the device registry and enforces the access
 * discipline shared by every caller:
 *
 * - writes, invocations, device listing and registry mutations hold one
 *   exclusive lock, so at most one of them is in flight;
 * - every write raises the pause flag before taking the lock and lowers it
 *   right after its device write, before the read-back;
 * - reads never take the lock. A read that observes the pause flag returns
 *   [`Reading::Skipped`] instead of waiting.
 *
 * The pause flag counts in-flight writes, so a finishing write never clears
 * the pause of another queued writer. Reads rely on the backend tolerating
 * concurrent reads.
 */
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use propbridge_core::bridge::{ExecutionBridge, Outcome};
use propbridge_core::config::{BridgeConfig, Config};
use propbridge_core::logging::operation_span;
use propbridge_core::types::{DeclaredType, Value};
use propbridge_devices::discovery::ScanOutcome;
use propbridge_devices::{
    Connector, DeviceDiscovery, DeviceError, DeviceRegistry, DeviceSink, DiscoveredDevice,
    DiscoveryOptions, RegistryEvent, RemoteProperty,
};

use crate::error::{Error, Result};
use crate::introspect::{Introspector, TreeSnapshot};
use crate::path::PropertyPath;
use crate::resolver::{AccessorNaming, PathResolver, ResolvedLeaf};

/// Result of a read that respects the pause flag
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    /// The value read, or the soft-failure default
    Value(Value),
    /// A write was in flight, so nothing was read
    Skipped,
}

impl Reading {
    /// Get the value, if the read was not skipped
    pub fn value(self) -> Option<Value> {
        match self {
            Reading::Value(value) => Some(value),
            Reading::Skipped => None,
        }
    }

    /// Check whether the read was skipped
    pub fn is_skipped(&self) -> bool {
        matches!(self, Reading::Skipped)
    }
}

/// A path together with its value, as returned to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyValue {
    /// The path as the client sent it
    pub path: String,
    /// The value
    #[serde(rename = "val")]
    pub value: Value,
}

/// Lowers the pause contribution of one write when dropped
struct PauseGuard<'a>(&'a AtomicUsize);

impl<'a> PauseGuard<'a> {
    fn raise(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Owner of the device registry and the access discipline around it
#[derive(Debug)]
pub struct Coordinator {
    registry: DeviceRegistry,
    exclusive: Mutex<()>,
    writes_in_flight: AtomicUsize,
    resolver: PathResolver,
    introspector: Introspector,
    discovery: DeviceDiscovery,
    timeouts: BridgeConfig,
    unknown_serial: String,
}

impl Coordinator {
    /// Create a coordinator discovering devices through `connector`
    pub fn new(config: &Config, connector: Arc<dyn Connector>) -> Self {
        Self {
            registry: DeviceRegistry::new(config.discovery.name_prefix.clone()),
            exclusive: Mutex::new(()),
            writes_in_flight: AtomicUsize::new(0),
            resolver: PathResolver::new(AccessorNaming::from(&config.resolver)),
            introspector: Introspector::from_config(&config.resolver, &config.bridge),
            discovery: DeviceDiscovery::new(connector, DiscoveryOptions::from(&config.discovery)),
            timeouts: config.bridge.clone(),
            unknown_serial: config.discovery.unknown_serial.clone(),
        }
    }

    /// Create a coordinator with the default configuration
    pub fn with_defaults(connector: Arc<dyn Connector>) -> Self {
        Self::new(&Config::default(), connector)
    }

    /// Get the device registry
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Get the configured timeouts
    pub fn timeouts(&self) -> &BridgeConfig {
        &self.timeouts
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.registry.subscribe()
    }

    /// Check whether a write is in flight
    pub fn is_paused(&self) -> bool {
        self.writes_in_flight() > 0
    }

    /// Number of writes that raised the pause flag and have not lowered it yet
    pub fn writes_in_flight(&self) -> usize {
        self.writes_in_flight.load(Ordering::SeqCst)
    }

    /// Snapshot the property tree of every online device
    pub fn list_devices(&self) -> Result<BTreeMap<String, TreeSnapshot>> {
        let _exclusive = self.lock();
        let mut devices = BTreeMap::new();

        for (name, handle) in self.registry.online_devices()? {
            let report = self.introspector.inspect(&handle);
            if report.connection_lost {
                self.mark_offline_locked(&name);
                continue;
            }
            if !report.omitted.is_empty() {
                debug!("{} members of {} left out of snapshot", report.omitted.len(), name);
            }
            devices.insert(name, report.tree);
        }

        Ok(devices)
    }

    /// Read a property with the generic read timeout
    pub fn read_property(&self, raw: &str) -> Result<Reading> {
        let path = PropertyPath::parse(raw)?;
        let span = operation_span("read", raw);
        let _enter = span.enter();
        self.read_path(&path, self.timeouts.read_timeout())
    }

    /// Read a parsed path, waiting at most `limit` for the device.
    ///
    /// Returns [`Reading::Skipped`] while a write is in flight. A read that
    /// fails or times out yields the default value; only paths that do not
    /// resolve are reported as errors.
    pub fn read_path(&self, path: &PropertyPath, limit: Duration) -> Result<Reading> {
        Ok(self
            .try_read_path(path, limit)?
            .unwrap_or_else(|| Reading::Value(Value::zero())))
    }

    /// Like [`read_path`](Self::read_path), but `None` when the device read
    /// failed or timed out.
    pub(crate) fn try_read_path(
        &self,
        path: &PropertyPath,
        limit: Duration,
    ) -> Result<Option<Reading>> {
        if self.is_paused() {
            debug!("Write in flight, skipping read of {}", path);
            return Ok(Some(Reading::Skipped));
        }

        let property = match self.resolver.resolve_leaf(&self.registry, path) {
            Ok(ResolvedLeaf::Property(property)) => property,
            Ok(ResolvedLeaf::Value(value)) => return Ok(Some(Reading::Value(value))),
            Err(e) => {
                if e.is_connection_loss() {
                    self.mark_offline(path.device());
                }
                return Err(e.into());
            }
        };

        Ok(self.bounded_read(property, path, limit).map(Reading::Value))
    }

    /// Write a property and read it back.
    ///
    /// The value is coerced according to `declared_type` first; combinations
    /// that cannot be coerced fail with [`Error::UnsupportedType`] and write
    /// nothing. A device write that fails or times out is logged and the
    /// read-back result is returned as usual. A timed-out write is abandoned
    /// on this thread's execution context and may still reach the device
    /// after the exclusive lock is released.
    pub fn write_property(
        &self,
        raw: &str,
        value: &JsonValue,
        declared_type: &str,
    ) -> Result<PropertyValue> {
        let path = PropertyPath::parse(raw)?;
        let span = operation_span("write", raw);
        let _enter = span.enter();

        {
            let _pause = PauseGuard::raise(&self.writes_in_flight);
            let _exclusive = self.lock();

            let declared = DeclaredType::parse(declared_type).ok_or_else(|| {
                Error::unsupported_type(format!("unknown declared type {:?}", declared_type))
            })?;
            let coerced = declared.coerce(value).ok_or_else(|| {
                Error::unsupported_type(format!("cannot write {} as {}", value, declared_type))
            })?;

            let property = match self.resolver.resolve_leaf(&self.registry, &path) {
                Ok(ResolvedLeaf::Property(property)) => property,
                Ok(ResolvedLeaf::Value(_)) => {
                    return Err(DeviceError::ReadOnly(raw.to_string()).into());
                }
                Err(e) => {
                    if e.is_connection_loss() {
                        self.mark_offline_locked(path.device());
                    }
                    return Err(e.into());
                }
            };

            debug!("Writing {} to {}", coerced, path);
            let outcome = ExecutionBridge::run(
                async move { property.write(coerced).await },
                self.timeouts.write_timeout(),
            );
            match outcome {
                Outcome::Completed(()) => {}
                Outcome::TimedOut => {
                    warn!("Write to {} timed out after {:?}", path, self.timeouts.write_timeout());
                }
                Outcome::Failed(e) => {
                    warn!("Write to {} failed: {}", path, e);
                    if e.is_connection_loss() {
                        self.mark_offline_locked(path.device());
                    }
                }
            }
        }

        let value = self.read_back(&path);
        Ok(PropertyValue {
            path: raw.to_string(),
            value,
        })
    }

    /// Invoke a callable member without arguments
    pub fn invoke(&self, raw: &str) -> Result<()> {
        let path = PropertyPath::parse(raw)?;
        let span = operation_span("invoke", raw);
        let _enter = span.enter();
        let _exclusive = self.lock();

        let function = match self.resolver.resolve_callable(&self.registry, &path) {
            Ok(function) => function,
            Err(e) => {
                if e.is_connection_loss() {
                    self.mark_offline_locked(path.device());
                }
                return Err(e.into());
            }
        };

        debug!("Calling {}", path);
        match ExecutionBridge::run(async move { function.call().await }, self.timeouts.invoke_timeout()) {
            Outcome::Completed(()) => Ok(()),
            Outcome::TimedOut => Err(Error::timeout(format!("call of {} timed out", path))),
            Outcome::Failed(e) => {
                if e.is_connection_loss() {
                    self.mark_offline_locked(path.device());
                }
                Err(e.into())
            }
        }
    }

    /// Start background discovery.
    ///
    /// Returns `false` if discovery was already running.
    pub fn start_discovery(self: &Arc<Self>) -> Result<bool> {
        let this: Weak<Self> = Arc::downgrade(self);
        let sink: Weak<dyn DeviceSink> = this;
        Ok(self.discovery.start(sink)?)
    }

    /// Stop background discovery
    pub fn stop_discovery(&self) {
        self.discovery.stop();
    }

    /// Check whether background discovery is running
    pub fn is_discovering(&self) -> bool {
        self.discovery.is_running()
    }

    /// Run a single discovery round on the calling thread
    pub fn discover_once(&self) -> ScanOutcome {
        self.discovery.scan_once(self)
    }

    /// Mark a device offline, taking the exclusive lock
    pub fn mark_offline(&self, name: &str) {
        let _exclusive = self.lock();
        self.mark_offline_locked(name);
    }

    fn mark_offline_locked(&self, name: &str) {
        match self.registry.mark_offline(name) {
            Ok(true) => info!("Device {} marked offline", name),
            Ok(false) => {}
            Err(e) => warn!("Failed to mark {} offline: {}", name, e),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.exclusive.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_back(&self, path: &PropertyPath) -> Value {
        match self.resolver.resolve_leaf(&self.registry, path) {
            Ok(ResolvedLeaf::Property(property)) => self
                .bounded_read(property, path, self.timeouts.read_timeout())
                .unwrap_or_else(Value::zero),
            Ok(ResolvedLeaf::Value(value)) => value,
            Err(e) => {
                debug!("Read-back of {} failed: {}", path, e);
                if e.is_connection_loss() {
                    self.mark_offline(path.device());
                }
                Value::zero()
            }
        }
    }

    fn bounded_read(
        &self,
        property: Arc<dyn RemoteProperty>,
        path: &PropertyPath,
        limit: Duration,
    ) -> Option<Value> {
        match ExecutionBridge::run(async move { property.read().await }, limit) {
            Outcome::Completed(value) => Some(value),
            Outcome::TimedOut => {
                debug!("Read of {} timed out after {:?}", path, limit);
                None
            }
            Outcome::Failed(e) => {
                warn!("Read of {} failed: {}", path, e);
                if e.is_connection_loss() {
                    self.mark_offline(path.device());
                }
                None
            }
        }
    }
}

impl DeviceSink for Coordinator {
    fn online_count(&self) -> usize {
        self.registry.online_count()
    }

    fn device_found(&self, device: DiscoveredDevice) -> propbridge_devices::device::Result<String> {
        let serial = match device.serial {
            Some(serial) => serial,
            None => {
                warn!("Device did not report a serial number, using {}", self.unknown_serial);
                self.unknown_serial.clone()
            }
        };
        let _exclusive = self.lock();
        self.registry.register(&serial, device.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    use propbridge_devices::sim::{SimConnector, SimDevice, SimFault, SimObject};
    use serde_json::json;

    fn coordinator_with(devices: Vec<SimDevice>) -> Coordinator {
        let coordinator = Coordinator::with_defaults(Arc::new(SimConnector::new()));
        for device in devices {
            coordinator.device_found(device.discovered()).unwrap();
        }
        coordinator
    }

    #[test]
    fn test_read_property() {
        let coordinator = coordinator_with(vec![SimDevice::odrive_like("X1")]);
        let reading = coordinator.read_property("odrive0.vbus_voltage").unwrap();
        assert_eq!(reading, Reading::Value(Value::Float(24.0)));
    }

    #[test]
    fn test_read_unknown_path_is_a_path_error() {
        let coordinator = coordinator_with(vec![SimDevice::odrive_like("X1")]);
        assert!(matches!(coordinator.read_property("odrive3.vbus_voltage"), Err(Error::Path(_))));
        assert!(matches!(coordinator.read_property("odrive0..x"), Err(Error::Path(_))));
    }

    #[test]
    fn test_read_of_offline_device_is_a_path_error() {
        let device = SimDevice::odrive_like("X1");
        let coordinator = coordinator_with(vec![device.clone()]);
        coordinator.mark_offline("odrive0");

        let property = device.root().property("vbus_voltage").unwrap();
        assert!(matches!(coordinator.read_property("odrive0.vbus_voltage"), Err(Error::Path(_))));
        assert_eq!(property.read_count(), 0);
    }

    #[test]
    fn test_path_errors_leave_device_online() {
        let root = SimObject::builder()
            .property("connection_timeout", 5.0)
            .property("disconnect_delay", 1.0)
            .build();
        let coordinator = coordinator_with(vec![SimDevice::new("X1", root)]);

        let err = coordinator
            .read_property("odrive0.connection_timeout.value")
            .unwrap_err();
        assert!(matches!(err, Error::Path(_)));
        assert!(coordinator.registry().is_online("odrive0"));

        let err = coordinator
            .write_property("odrive0.disconnect_delay.value", &json!(2.0), "number")
            .unwrap_err();
        assert!(matches!(err, Error::Path(_)));
        assert!(coordinator.invoke("odrive0.connection_timeout").is_err());
        assert!(coordinator.registry().is_online("odrive0"));
        assert!(!coordinator.is_paused());
    }

    #[test]
    fn test_write_coerces_and_reads_back() {
        let device = SimDevice::odrive_like("X1");
        let coordinator = coordinator_with(vec![device.clone()]);

        let written = coordinator
            .write_property("odrive0.axis0.config.calibration_lockin.accel", &json!(17), "number")
            .unwrap();
        assert_eq!(written.value, Value::Float(17.0));
        assert_eq!(
            serde_json::to_value(&written).unwrap(),
            json!({"path": "odrive0.axis0.config.calibration_lockin.accel", "val": 17.0})
        );
        assert!(!coordinator.is_paused());
    }

    #[test]
    fn test_write_infinity_sentinel() {
        let device = SimDevice::odrive_like("X1");
        let coordinator = coordinator_with(vec![device.clone()]);
        let path = "odrive0.axis1.controller.config.vel_limit";

        coordinator.write_property(path, &json!(5.0), "number").unwrap();
        let written = coordinator.write_property(path, &json!("-Infinity"), "string").unwrap();
        assert_eq!(written.value, Value::Float(f64::NEG_INFINITY));
        assert_eq!(serde_json::to_value(&written).unwrap()["val"], json!("-Infinity"));
    }

    #[test]
    fn test_unsupported_write_is_rejected() {
        let device = SimDevice::odrive_like("X1");
        let coordinator = coordinator_with(vec![device.clone()]);
        let property = device.root().property("axis0.controller.input_pos").unwrap();

        let err = coordinator
            .write_property("odrive0.axis0.controller.input_pos", &json!("fast"), "string")
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedType(_)));

        let err = coordinator
            .write_property("odrive0.axis0.controller.input_pos", &json!([1]), "array")
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedType(_)));

        assert_eq!(property.write_count(), 0);
        assert!(!coordinator.is_paused());
    }

    #[test]
    fn test_write_failure_releases_pause() {
        let device = SimDevice::odrive_like("X1");
        let coordinator = coordinator_with(vec![device.clone()]);
        let property = device.root().property("axis0.controller.input_vel").unwrap();
        property.set_fault(Some(SimFault::Failure("bad crc".into())));

        let written = coordinator
            .write_property("odrive0.axis0.controller.input_vel", &json!(1.0), "number")
            .unwrap();
        assert_eq!(written.value, Value::zero());
        assert!(!coordinator.is_paused());
        assert!(coordinator.registry().is_online("odrive0"));
    }

    #[test]
    fn test_write_timeout_releases_pause() {
        let device = SimDevice::odrive_like("X1");
        let mut config = Config::default();
        config.bridge.write_timeout_ms = 20;
        let coordinator = Coordinator::new(&config, Arc::new(SimConnector::new()));
        coordinator.device_found(device.discovered()).unwrap();

        let property = device.root().property("axis0.pos_estimate").unwrap();
        property.set_latency(Duration::from_millis(200));
        coordinator
            .write_property("odrive0.axis0.pos_estimate", &json!(3.0), "number")
            .unwrap();
        assert!(!coordinator.is_paused());
    }

    #[test]
    fn test_reads_are_skipped_while_paused() {
        let device = SimDevice::odrive_like("X1");
        let coordinator = Arc::new(coordinator_with(vec![device.clone()]));
        device
            .root()
            .property("axis0.controller.input_pos")
            .unwrap()
            .set_latency(Duration::from_millis(300));

        let writer = {
            let coordinator = coordinator.clone();
            thread::spawn(move || {
                coordinator
                    .write_property("odrive0.axis0.controller.input_pos", &json!(2.0), "number")
                    .unwrap()
            })
        };

        while !coordinator.is_paused() {
            thread::yield_now();
        }
        let reading = coordinator.read_property("odrive0.vbus_voltage").unwrap();
        assert!(reading.is_skipped());

        writer.join().unwrap();
        assert!(!coordinator.is_paused());
    }

    #[test]
    fn test_invoke() {
        let device = SimDevice::odrive_like("X1");
        let coordinator = coordinator_with(vec![device.clone()]);

        coordinator.invoke("odrive0.save_configuration").unwrap();
        assert_eq!(device.root().function("save_configuration").unwrap().call_count(), 1);

        assert!(coordinator.invoke("odrive0.vbus_voltage").is_err());
        assert!(coordinator.invoke("odrive0.nothing").is_err());
    }

    #[test]
    fn test_invoke_on_lost_device_marks_offline() {
        let device = SimDevice::odrive_like("X1");
        let coordinator = coordinator_with(vec![device.clone()]);
        device.disconnect();

        assert!(coordinator.invoke("odrive0.reboot").is_err());
        assert!(!coordinator.registry().is_online("odrive0"));
    }

    #[test]
    fn test_list_devices_only_online() {
        let coordinator = coordinator_with(vec![SimDevice::odrive_like("A"), SimDevice::odrive_like("B")]);
        coordinator.mark_offline("odrive1");

        let devices = coordinator.list_devices().unwrap();
        assert_eq!(devices.keys().collect::<Vec<_>>(), vec!["odrive0"]);
        assert!(devices["odrive0"].contains_key("axis0"));
    }

    #[test]
    fn test_list_devices_drops_lost_device() {
        let device = SimDevice::odrive_like("A");
        let coordinator = coordinator_with(vec![device.clone()]);
        device.disconnect();

        assert!(coordinator.list_devices().unwrap().is_empty());
        assert!(!coordinator.registry().is_online("odrive0"));
    }

    #[test]
    fn test_serial_fallback() {
        let coordinator = coordinator_with(vec![SimDevice::odrive_like("X1").without_serial()]);
        let entry = coordinator.registry().entry("odrive0").unwrap();
        assert_eq!(entry.serial, "unknown_serial");
    }

    #[test]
    fn test_discover_once() {
        let connector = Arc::new(SimConnector::new());
        let coordinator = Coordinator::with_defaults(connector.clone());
        assert_eq!(coordinator.discover_once(), ScanOutcome::NotFound);

        connector.plug(SimDevice::odrive_like("X1"));
        assert_eq!(coordinator.discover_once(), ScanOutcome::Found("odrive0".to_string()));
        assert_eq!(coordinator.discover_once(), ScanOutcome::Suspended);
    }

    #[test]
    fn test_background_discovery_does_not_keep_coordinator_alive() {
        let mut config = Config::default();
        config.discovery.retry_delay_ms = 5;
        config.discovery.idle_poll_ms = 5;
        let coordinator = Arc::new(Coordinator::new(&config, Arc::new(SimConnector::new())));
        assert!(coordinator.start_discovery().unwrap());

        let weak = Arc::downgrade(&coordinator);
        drop(coordinator);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while weak.strong_count() > 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(weak.strong_count(), 0);
    }
}
