/*!
 * Device discovery for PropBridge.
 *
 * Discovery runs on a dedicated thread. Each round it either probes the
 * connector for a device (bounded by a timeout) or, while at least one device
 * is online, stays idle: only the first discovered device is actively
 * managed. A probe that errors or times out counts as "nothing found this
 * round" and never stops the loop. The thread holds its sink weakly and
 * exits once the sink is gone.
 */
use std::fmt::Debug;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use propbridge_core::bridge::{ExecutionBridge, Outcome};
use propbridge_core::config::DiscoveryConfig;
use propbridge_core::utils::{millis_to_duration, spawn_named};

use crate::device::{DeviceError, ObjectHandle, Result};

/// A device returned by a connection probe
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    /// The stable identifier, if the device reported one
    pub serial: Option<String>,
    /// The root object of the device's property tree
    pub root: ObjectHandle,
}

/// Connection-establishment primitive of a backend
#[async_trait]
pub trait Connector: Send + Sync + Debug {
    /// Get the connector name
    fn name(&self) -> &'static str;

    /// Probe for any attached device.
    ///
    /// The caller bounds the probe with a timeout, so implementations may wait.
    async fn find_any(&self) -> Result<Option<DiscoveredDevice>>;
}

/// Receiver of discovery results
///
/// Implemented by whoever owns the device registry and the lock that
/// serializes its mutation.
pub trait DeviceSink: Send + Sync {
    /// Number of devices currently online
    fn online_count(&self) -> usize;

    /// Register a discovered device and return its logical name
    fn device_found(&self, device: DiscoveredDevice) -> Result<String>;
}

/// Discovery timing options
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Bounded wait for a single probe
    pub probe_timeout: Duration,
    /// Delay after each probe
    pub retry_delay: Duration,
    /// Delay between checks while scanning is suspended
    pub idle_poll: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self::from(&DiscoveryConfig::default())
    }
}

impl From<&DiscoveryConfig> for DiscoveryOptions {
    fn from(config: &DiscoveryConfig) -> Self {
        Self {
            probe_timeout: millis_to_duration(config.probe_timeout_ms),
            retry_delay: millis_to_duration(config.retry_delay_ms),
            idle_poll: millis_to_duration(config.idle_poll_ms),
        }
    }
}

/// Result of one discovery round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// A device is online, so no probe was made
    Suspended,
    /// A device was found and registered under this name
    Found(String),
    /// The probe found nothing, failed or timed out
    NotFound,
}

#[derive(Debug)]
struct Worker {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

/// Background discovery process
#[derive(Debug)]
pub struct DeviceDiscovery {
    /// The backend connector
    connector: Arc<dyn Connector>,
    /// Timing options
    options: DiscoveryOptions,
    /// The running discovery thread, if any
    worker: Mutex<Option<Worker>>,
}

impl DeviceDiscovery {
    /// Create a new discovery process for a connector
    pub fn new(connector: Arc<dyn Connector>, options: DiscoveryOptions) -> Self {
        Self {
            connector,
            options,
            worker: Mutex::new(None),
        }
    }

    /// Get the timing options
    pub fn options(&self) -> &DiscoveryOptions {
        &self.options
    }

    /// Run a single discovery round on the calling thread
    pub fn scan_once(&self, sink: &dyn DeviceSink) -> ScanOutcome {
        scan(&self.connector, &self.options, sink)
    }

    /// Start the discovery thread.
    ///
    /// Returns `false` if discovery was already running.
    pub fn start(&self, sink: Weak<dyn DeviceSink>) -> Result<bool> {
        let mut worker = self
            .worker
            .lock()
            .map_err(|_| DeviceError::Other("Failed to acquire discovery lock".to_string()))?;

        if let Some(running) = worker.as_ref() {
            if !running.thread.is_finished() {
                debug!("Discovery already running");
                return Ok(false);
            }
        }

        let (stop, stop_rx) = mpsc::channel::<()>();
        let connector = self.connector.clone();
        let options = self.options.clone();

        let thread = spawn_named("propbridge-discovery", move || {
            info!("Discovery loop started via {}", connector.name());
            loop {
                let Some(current) = sink.upgrade() else {
                    debug!("Discovery sink dropped");
                    break;
                };
                let delay = match scan(&connector, &options, current.as_ref()) {
                    ScanOutcome::Suspended => options.idle_poll,
                    _ => options.retry_delay,
                };
                drop(current);
                match stop_rx.recv_timeout(delay) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            info!("Discovery loop stopped");
            Ok::<(), DeviceError>(())
        })?;

        *worker = Some(Worker { stop, thread });
        Ok(true)
    }

    /// Check whether the discovery thread is running
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .map(|worker| worker.as_ref().map_or(false, |w| !w.thread.is_finished()))
            .unwrap_or(false)
    }

    /// Stop the discovery thread and wait for it to exit
    pub fn stop(&self) {
        let worker = match self.worker.lock() {
            Ok(mut worker) => worker.take(),
            Err(_) => return,
        };
        if let Some(worker) = worker {
            let _ = worker.stop.send(());
            // The loop itself may drop the last owner of this discovery
            if worker.thread.thread().id() == thread::current().id() {
                return;
            }
            if worker.thread.join().is_err() {
                warn!("Discovery thread panicked");
            }
        }
    }
}

impl Drop for DeviceDiscovery {
    fn drop(&mut self) {
        self.stop();
    }
}

fn scan(connector: &Arc<dyn Connector>, options: &DiscoveryOptions, sink: &dyn DeviceSink) -> ScanOutcome {
    if sink.online_count() > 0 {
        return ScanOutcome::Suspended;
    }

    debug!("Scanning for devices via {}", connector.name());
    let probe = connector.clone();
    match ExecutionBridge::run(async move { probe.find_any().await }, options.probe_timeout) {
        Outcome::Completed(Some(device)) => match sink.device_found(device) {
            Ok(name) => ScanOutcome::Found(name),
            Err(e) => {
                warn!("Failed to register discovered device: {}", e);
                ScanOutcome::NotFound
            }
        },
        Outcome::Completed(None) => ScanOutcome::NotFound,
        Outcome::TimedOut => {
            debug!("Probe timed out after {:?}", options.probe_timeout);
            ScanOutcome::NotFound
        }
        Outcome::Failed(e) => {
            debug!("Probe failed: {}", e);
            ScanOutcome::NotFound
        }
    }
}

#[cfg(all(test, feature = "sim"))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use crate::registry::DeviceRegistry;
    use crate::sim::{SimConnector, SimDevice};

    struct RegistrySink {
        registry: DeviceRegistry,
        found: AtomicUsize,
    }

    impl RegistrySink {
        fn new() -> Self {
            Self {
                registry: DeviceRegistry::new("odrive"),
                found: AtomicUsize::new(0),
            }
        }
    }

    impl DeviceSink for RegistrySink {
        fn online_count(&self) -> usize {
            self.registry.online_count()
        }

        fn device_found(&self, device: DiscoveredDevice) -> Result<String> {
            self.found.fetch_add(1, Ordering::SeqCst);
            let serial = device.serial.unwrap_or_else(|| "unknown_serial".to_string());
            self.registry.register(&serial, device.root)
        }
    }

    fn fast_options() -> DiscoveryOptions {
        DiscoveryOptions {
            probe_timeout: Duration::from_millis(50),
            retry_delay: Duration::from_millis(5),
            idle_poll: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_scan_registers_device() {
        let connector = Arc::new(SimConnector::new());
        connector.plug(SimDevice::odrive_like("X1"));
        let discovery = DeviceDiscovery::new(connector, fast_options());
        let sink = RegistrySink::new();

        assert_eq!(discovery.scan_once(&sink), ScanOutcome::Found("odrive0".to_string()));
        assert_eq!(discovery.scan_once(&sink), ScanOutcome::Suspended);
    }

    #[test]
    fn test_scanning_resumes_when_no_device_is_online() {
        let connector = Arc::new(SimConnector::new());
        connector.plug(SimDevice::odrive_like("X1"));
        let discovery = DeviceDiscovery::new(connector.clone(), fast_options());
        let sink = RegistrySink::new();

        discovery.scan_once(&sink);
        sink.registry.mark_offline("odrive0").unwrap();
        assert_eq!(discovery.scan_once(&sink), ScanOutcome::NotFound);

        connector.plug(SimDevice::odrive_like("X1"));
        assert_eq!(discovery.scan_once(&sink), ScanOutcome::Found("odrive0".to_string()));
    }

    #[test_log::test]
    fn test_failed_and_slow_probes_are_not_fatal() {
        let connector = Arc::new(SimConnector::new());
        let discovery = DeviceDiscovery::new(connector.clone(), fast_options());
        let sink = RegistrySink::new();

        connector.set_failing(true);
        assert_eq!(discovery.scan_once(&sink), ScanOutcome::NotFound);

        connector.set_failing(false);
        connector.set_probe_latency(Duration::from_millis(500));
        connector.plug(SimDevice::odrive_like("X1"));
        assert_eq!(discovery.scan_once(&sink), ScanOutcome::NotFound);
        assert_eq!(connector.probe_count(), 2);
    }

    #[test]
    fn test_missing_serial_uses_fallback() {
        let connector = Arc::new(SimConnector::new());
        connector.plug(SimDevice::odrive_like("ignored").without_serial());
        let discovery = DeviceDiscovery::new(connector, fast_options());
        let sink = RegistrySink::new();

        discovery.scan_once(&sink);
        assert_eq!(sink.registry.name_for("unknown_serial").as_deref(), Some("odrive0"));
    }

    #[test_log::test]
    fn test_background_loop_starts_once_and_stops() {
        let connector = Arc::new(SimConnector::new());
        let discovery = DeviceDiscovery::new(connector.clone(), fast_options());
        let sink = Arc::new(RegistrySink::new());

        let weak: Weak<RegistrySink> = Arc::downgrade(&sink);

        assert!(discovery.start(weak.clone()).unwrap());
        assert!(!discovery.start(weak).unwrap());

        connector.plug(SimDevice::odrive_like("X1"));
        let deadline = Instant::now() + Duration::from_secs(2);
        while sink.registry.online_count() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(sink.registry.online_count(), 1);

        discovery.stop();
        assert!(!discovery.is_running());
        assert_eq!(sink.found.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_background_loop_ends_with_its_sink() {
        let connector = Arc::new(SimConnector::new());
        let discovery = DeviceDiscovery::new(connector, fast_options());
        let sink = Arc::new(RegistrySink::new());

        let weak: Weak<RegistrySink> = Arc::downgrade(&sink);

        assert!(discovery.start(weak).unwrap());
        drop(sink);

        let deadline = Instant::now() + Duration::from_secs(2);
        while discovery.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!discovery.is_running());
    }
}
