/*!
 * In-memory simulated backend.
 *
 * Provides remote objects, properties, functions and a connector that
 * behave like a small motor controller. Faults (lost connections, failing
 * members) and latency can be injected at runtime, and property writes can
 * be recorded to observe how writes interleave.
 */
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use propbridge_core::types::Value;

use crate::device::{
    DeviceError, Member, MemberInfo, MemberKind, ObjectHandle, RemoteFunction, RemoteObject,
    RemoteProperty, Result,
};
use crate::discovery::{Connector, DiscoveredDevice};

/// A fault injected into a simulated member
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimFault {
    /// The device went away
    ConnectionLost,
    /// The operation fails with this message
    Failure(String),
}

impl SimFault {
    fn to_error(&self, member: &str) -> DeviceError {
        match self {
            SimFault::ConnectionLost => {
                DeviceError::ConnectionLost(format!("object {} lost", member))
            }
            SimFault::Failure(msg) => DeviceError::Communication(format!("{}: {}", member, msg)),
        }
    }
}

/// One entry of a [`WriteLog`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteEvent {
    /// A write began; the tag is `<property>=<value>`
    Started(String),
    /// A write finished; the tag is `<property>=<value>`
    Finished(String),
}

/// Shared record of write start and end events
#[derive(Debug, Clone, Default)]
pub struct WriteLog(Arc<Mutex<Vec<WriteEvent>>>);

impl WriteLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: WriteEvent) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }

    /// Get a copy of the recorded events
    pub fn events(&self) -> Vec<WriteEvent> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// A simulated remote property
#[derive(Debug)]
pub struct SimProperty {
    name: String,
    value: RwLock<Value>,
    read_only: bool,
    latency: RwLock<Duration>,
    fault: RwLock<Option<SimFault>>,
    log: Option<WriteLog>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl SimProperty {
    /// Create a new writable property
    pub fn new<S: Into<String>, V: Into<Value>>(name: S, value: V) -> Self {
        Self {
            name: name.into(),
            value: RwLock::new(value.into()),
            read_only: false,
            latency: RwLock::new(Duration::ZERO),
            fault: RwLock::new(None),
            log: None,
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// Make the property read-only
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Record writes into a log
    pub fn with_log(mut self, log: WriteLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Get the current value without going through the accessor
    pub fn value(&self) -> Value {
        self.value.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Change the value from the device side (e.g. a new telemetry reading)
    pub fn set_value<V: Into<Value>>(&self, value: V) {
        *self.value.write().unwrap_or_else(PoisonError::into_inner) = value.into();
    }

    /// Delay every read and write by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    /// Inject or clear a fault
    pub fn set_fault(&self, fault: Option<SimFault>) {
        *self.fault.write().unwrap_or_else(PoisonError::into_inner) = fault;
    }

    /// Number of reads served, including failed ones
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of completed writes
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_fault(&self) -> Result<()> {
        match self.fault.read().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(fault) => Err(fault.to_error(&self.name)),
            None => Ok(()),
        }
    }

    fn latency(&self) -> Duration {
        *self.latency.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Keep the stored type when the device would convert the written value
    fn conform(current: &Value, written: Value) -> Value {
        match (current, written) {
            (Value::Integer(_), Value::Float(f)) if f.is_finite() && f.fract() == 0.0 => {
                Value::Integer(f as i64)
            }
            (Value::Bool(_), Value::Float(f)) => Value::Bool(f != 0.0),
            (_, written) => written,
        }
    }
}

#[async_trait]
impl RemoteProperty for SimProperty {
    async fn read(&self) -> Result<Value> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.check_fault()?;
        let latency = self.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(self.value())
    }

    async fn write(&self, value: Value) -> Result<()> {
        self.check_fault()?;
        if self.read_only {
            return Err(DeviceError::ReadOnly(self.name.clone()));
        }

        let tag = format!("{}={}", self.name, value);
        trace!("sim write {}", tag);
        if let Some(log) = &self.log {
            log.push(WriteEvent::Started(tag.clone()));
        }

        let latency = self.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        {
            let mut current = self.value.write().unwrap_or_else(PoisonError::into_inner);
            let conformed = Self::conform(&current, value);
            *current = conformed;
        }
        self.writes.fetch_add(1, Ordering::SeqCst);

        if let Some(log) = &self.log {
            log.push(WriteEvent::Finished(tag));
        }
        Ok(())
    }
}

/// A simulated remote function
#[derive(Debug)]
pub struct SimFunction {
    name: String,
    calls: AtomicUsize,
    fault: RwLock<Option<SimFault>>,
}

impl SimFunction {
    /// Create a new function
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            calls: AtomicUsize::new(0),
            fault: RwLock::new(None),
        }
    }

    /// Number of successful calls
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Inject or clear a fault
    pub fn set_fault(&self, fault: Option<SimFault>) {
        *self.fault.write().unwrap_or_else(PoisonError::into_inner) = fault;
    }
}

#[async_trait]
impl RemoteFunction for SimFunction {
    async fn call(&self) -> Result<()> {
        if let Some(fault) = self.fault.read().unwrap_or_else(PoisonError::into_inner).as_ref() {
            return Err(fault.to_error(&self.name));
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A member of a simulated object
#[derive(Debug, Clone)]
pub enum SimMember {
    /// A plain value
    Value(Value),
    /// A remote property
    Property(Arc<SimProperty>),
    /// A callable
    Function(Arc<SimFunction>),
    /// A nested object
    Object(Arc<SimObject>),
    /// A member whose lookup always fails with this message
    Broken(String),
}

impl SimMember {
    fn kind(&self) -> MemberKind {
        match self {
            SimMember::Value(_) | SimMember::Property(_) | SimMember::Broken(_) => MemberKind::Leaf,
            SimMember::Function(_) => MemberKind::Callable,
            SimMember::Object(_) => MemberKind::SubTree,
        }
    }
}

/// A simulated remote object
#[derive(Debug)]
pub struct SimObject {
    members: BTreeMap<String, SimMember>,
    accessor_prefix: String,
    accessor_suffix: String,
}

impl SimObject {
    /// Start building an object
    pub fn builder() -> SimObjectBuilder {
        SimObjectBuilder::default()
    }

    /// Find a property by dotted path relative to this object
    pub fn property(&self, path: &str) -> Option<Arc<SimProperty>> {
        match self.walk(path)? {
            SimMember::Property(property) => Some(property),
            _ => None,
        }
    }

    /// Find a function by dotted path relative to this object
    pub fn function(&self, path: &str) -> Option<Arc<SimFunction>> {
        match self.walk(path)? {
            SimMember::Function(function) => Some(function),
            _ => None,
        }
    }

    /// Inject or clear a fault on every property and function of the tree
    pub fn set_fault_recursive(&self, fault: Option<SimFault>) {
        for member in self.members.values() {
            match member {
                SimMember::Property(property) => property.set_fault(fault.clone()),
                SimMember::Function(function) => function.set_fault(fault.clone()),
                SimMember::Object(object) => object.set_fault_recursive(fault.clone()),
                SimMember::Value(_) | SimMember::Broken(_) => {}
            }
        }
    }

    fn walk(&self, path: &str) -> Option<SimMember> {
        let mut segments = path.split('.');
        let mut member = self.members.get(segments.next()?)?.clone();
        for segment in segments {
            member = match member {
                SimMember::Object(object) => object.members.get(segment)?.clone(),
                _ => return None,
            };
        }
        Some(member)
    }

    fn accessor_target(&self, name: &str) -> Option<&SimMember> {
        let leaf = name
            .strip_prefix(self.accessor_prefix.as_str())?
            .strip_suffix(self.accessor_suffix.as_str())?;
        match self.members.get(leaf)? {
            member @ (SimMember::Property(_) | SimMember::Value(_)) => Some(member),
            _ => None,
        }
    }
}

impl RemoteObject for SimObject {
    fn members(&self) -> Result<Vec<MemberInfo>> {
        Ok(self
            .members
            .iter()
            .map(|(name, member)| MemberInfo::new(name.clone(), member.kind()))
            .collect())
    }

    fn member(&self, name: &str) -> Result<Member> {
        let member = self
            .members
            .get(name)
            .or_else(|| self.accessor_target(name))
            .ok_or_else(|| DeviceError::MemberNotFound(name.to_string()))?;

        match member {
            SimMember::Value(value) => Ok(Member::Value(value.clone())),
            SimMember::Property(property) => Ok(Member::Property(property.clone())),
            SimMember::Function(function) => Ok(Member::Function(function.clone())),
            SimMember::Object(object) => Ok(Member::Object(object.clone())),
            SimMember::Broken(msg) => Err(DeviceError::Communication(msg.clone())),
        }
    }
}

/// Builder for [`SimObject`]
#[derive(Debug)]
pub struct SimObjectBuilder {
    members: BTreeMap<String, SimMember>,
    accessor_prefix: String,
    accessor_suffix: String,
    log: Option<WriteLog>,
}

impl Default for SimObjectBuilder {
    fn default() -> Self {
        Self {
            members: BTreeMap::new(),
            accessor_prefix: "_".to_string(),
            accessor_suffix: "_property".to_string(),
            log: None,
        }
    }
}

impl SimObjectBuilder {
    /// Use another accessor naming convention
    pub fn accessor<P: Into<String>, S: Into<String>>(mut self, prefix: P, suffix: S) -> Self {
        self.accessor_prefix = prefix.into();
        self.accessor_suffix = suffix.into();
        self
    }

    /// Record writes of properties added after this call
    pub fn write_log(mut self, log: WriteLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Add a writable property
    pub fn property<S: Into<String>, V: Into<Value>>(self, name: S, value: V) -> Self {
        let name = name.into();
        let mut property = SimProperty::new(name.clone(), value);
        if let Some(log) = &self.log {
            property = property.with_log(log.clone());
        }
        self.member(name, SimMember::Property(Arc::new(property)))
    }

    /// Add a read-only property
    pub fn read_only<S: Into<String>, V: Into<Value>>(self, name: S, value: V) -> Self {
        let name = name.into();
        let property = SimProperty::new(name.clone(), value).read_only();
        self.member(name, SimMember::Property(Arc::new(property)))
    }

    /// Add a plain value
    pub fn value<S: Into<String>, V: Into<Value>>(self, name: S, value: V) -> Self {
        self.member(name, SimMember::Value(value.into()))
    }

    /// Add a function
    pub fn function<S: Into<String>>(self, name: S) -> Self {
        let name = name.into();
        let function = SimFunction::new(name.clone());
        self.member(name, SimMember::Function(Arc::new(function)))
    }

    /// Add a nested object
    pub fn object<S: Into<String>>(self, name: S, object: SimObject) -> Self {
        self.member(name, SimMember::Object(Arc::new(object)))
    }

    /// Add a member whose lookup fails
    pub fn broken<S: Into<String>, M: Into<String>>(self, name: S, msg: M) -> Self {
        self.member(name, SimMember::Broken(msg.into()))
    }

    /// Add any member
    pub fn member<S: Into<String>>(mut self, name: S, member: SimMember) -> Self {
        self.members.insert(name.into(), member);
        self
    }

    /// Build the object
    pub fn build(self) -> SimObject {
        SimObject {
            members: self.members,
            accessor_prefix: self.accessor_prefix,
            accessor_suffix: self.accessor_suffix,
        }
    }
}

/// A simulated device: an identifier plus a property tree
#[derive(Debug, Clone)]
pub struct SimDevice {
    serial: Option<String>,
    root: Arc<SimObject>,
}

impl SimDevice {
    /// Create a device from a root object
    pub fn new<S: Into<String>>(serial: S, root: SimObject) -> Self {
        Self {
            serial: Some(serial.into()),
            root: Arc::new(root),
        }
    }

    /// Create a device with the tree of a small dual-axis motor controller
    pub fn odrive_like<S: Into<String>>(serial: S) -> Self {
        fn axis() -> SimObject {
            SimObject::builder()
                .property("pos_estimate", 0.0)
                .property("vel_estimate", 0.0)
                .read_only("current_state", 1)
                .property("requested_state", 0)
                .property("error", 0)
                .object(
                    "config",
                    SimObject::builder()
                        .property("startup_closed_loop_control", false)
                        .property("enable_watchdog", false)
                        .object(
                            "calibration_lockin",
                            SimObject::builder()
                                .property("accel", 20.0)
                                .property("vel", 40.0)
                                .build(),
                        )
                        .build(),
                )
                .object(
                    "controller",
                    SimObject::builder()
                        .property("input_pos", 0.0)
                        .property("input_vel", 0.0)
                        .object(
                            "config",
                            SimObject::builder()
                                .property("vel_limit", f64::INFINITY)
                                .property("pos_gain", 20.0)
                                .build(),
                        )
                        .build(),
                )
                .function("watchdog_feed")
                .build()
        }

        let root = SimObject::builder()
            .read_only("vbus_voltage", 24.0)
            .read_only("ibus", 0.0)
            .value("hw_version_major", 3)
            .value("fw_version_minor", 5)
            .object("axis0", axis())
            .object("axis1", axis())
            .function("reboot")
            .function("save_configuration")
            .function("clear_errors")
            .value("_remote_attributes", "internal")
            .build();
        Self::new(serial, root)
    }

    /// Drop the identifier, as if the device could not report it
    pub fn without_serial(mut self) -> Self {
        self.serial = None;
        self
    }

    /// Get the identifier
    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    /// Get the root object
    pub fn root(&self) -> &Arc<SimObject> {
        &self.root
    }

    /// Get the root object as a remote-object handle
    pub fn handle(&self) -> ObjectHandle {
        self.root.clone()
    }

    /// Make every member fail with a lost connection
    pub fn disconnect(&self) {
        self.root.set_fault_recursive(Some(SimFault::ConnectionLost));
    }

    /// Clear all injected faults
    pub fn reconnect(&self) {
        self.root.set_fault_recursive(None);
    }

    /// Describe the device the way a connector reports it
    pub fn discovered(&self) -> DiscoveredDevice {
        DiscoveredDevice {
            serial: self.serial.clone(),
            root: self.handle(),
        }
    }
}

/// A connector handing out simulated devices in the order they were plugged in
#[derive(Debug, Default)]
pub struct SimConnector {
    pending: Mutex<VecDeque<SimDevice>>,
    probes: AtomicUsize,
    latency: RwLock<Duration>,
    failing: AtomicBool,
}

impl SimConnector {
    /// Create a connector with no attached devices
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device; the next probe returns it
    pub fn plug(&self, device: SimDevice) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(device);
    }

    /// Number of probes made so far
    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// Delay every probe
    pub fn set_probe_latency(&self, latency: Duration) {
        *self.latency.write().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    /// Make probes fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for SimConnector {
    fn name(&self) -> &'static str {
        "sim"
    }

    async fn find_any(&self) -> Result<Option<DiscoveredDevice>> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(DeviceError::Communication("usb enumeration failed".to_string()));
        }

        let latency = *self.latency.read().unwrap_or_else(PoisonError::into_inner);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let device = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        Ok(device.map(|device| device.discovered()))
    }
}
