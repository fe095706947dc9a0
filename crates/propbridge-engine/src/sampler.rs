/*!
 * Continuous sampling of declared paths.
 *
 * A client declares the paths it wants streamed and toggles sampling with
 * an enable flag. While enabled, [`Sampler::run`] blocks its thread and
 * produces one [`Frame`] per tick as fast as the device answers. A tick
 * that observes an in-flight write produces an empty frame instead of
 * waiting.
 */
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use tracing::{debug, info};

use propbridge_core::config::{BridgeConfig, SamplingConfig};
use propbridge_core::types::Value;

use crate::coordinator::{Coordinator, Reading};
use crate::error::Result;
use crate::path::PropertyPath;

/// Sampling state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingState {
    /// Not sampling
    Idle,
    /// Sampling is enabled
    Sampling,
}

/// Per-session sampling counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SamplingStats {
    /// Frames emitted, including empty ones
    pub frames: u64,
    /// Frames left empty because a write was in flight
    pub skipped_frames: u64,
    /// Path reads reported as zero because the path did not resolve or the
    /// device read failed or timed out
    pub failed_reads: u64,
}

/// One sampling tick
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Position of the frame in the current sampling run, starting at 0
    pub sequence: u64,
    /// When the tick started
    pub timestamp: DateTime<Utc>,
    /// Values keyed by the paths as declared, in first-seen order
    pub values: Vec<(String, Value)>,
}

impl Frame {
    /// Check whether the frame carries no values
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get the value sampled for a path
    pub fn get(&self, path: &str) -> Option<&Value> {
        self.values.iter().find(|(p, _)| p == path).map(|(_, v)| v)
    }
}

impl Serialize for Frame {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (path, value) in &self.values {
            map.serialize_entry(path, value)?;
        }
        map.end()
    }
}

/// Shared sampling controls of a session: the enable flag and declared paths
#[derive(Debug, Clone, Default)]
pub struct SamplingControl {
    enabled: Arc<AtomicBool>,
    paths: Arc<RwLock<Vec<String>>>,
    stats: Arc<Mutex<SamplingStats>>,
}

impl SamplingControl {
    /// Create disabled controls with no declared paths
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the enable flag
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    /// Clear the enable flag; a running loop exits after its current tick
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    /// Check the enable flag
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Get the state implied by the enable flag
    pub fn state(&self) -> SamplingState {
        if self.is_enabled() {
            SamplingState::Sampling
        } else {
            SamplingState::Idle
        }
    }

    /// Replace the declared paths
    pub fn declare<I, S>(&self, paths: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let paths: Vec<String> = paths.into_iter().map(Into::into).collect();
        debug!("Sampling paths declared: {:?}", paths);
        *self.paths.write().unwrap_or_else(PoisonError::into_inner) = paths;
    }

    /// Get the declared paths, duplicates included
    pub fn declared(&self) -> Vec<String> {
        self.paths.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Get the counters of the current or last sampling run
    pub fn stats(&self) -> SamplingStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn update_stats<F: FnOnce(&mut SamplingStats)>(&self, f: F) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

/// Deduplicate paths, keeping the first occurrence of each
pub fn unique_paths(paths: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    paths
        .iter()
        .filter(|path| seen.insert(path.as_str()))
        .cloned()
        .collect()
}

/// Sampling loop of one session
#[derive(Debug)]
pub struct Sampler {
    coordinator: Arc<Coordinator>,
    control: SamplingControl,
    read_timeout: Duration,
    min_interval: Duration,
    sequence: u64,
}

impl Sampler {
    /// Create a sampler with explicit timing
    pub fn new(
        coordinator: Arc<Coordinator>,
        control: SamplingControl,
        read_timeout: Duration,
        min_interval: Duration,
    ) -> Self {
        Self {
            coordinator,
            control,
            read_timeout,
            min_interval,
            sequence: 0,
        }
    }

    /// Create a sampler from configuration
    pub fn from_config(
        coordinator: Arc<Coordinator>,
        control: SamplingControl,
        sampling: &SamplingConfig,
        bridge: &BridgeConfig,
    ) -> Self {
        Self::new(
            coordinator,
            control,
            bridge.sample_read_timeout(),
            Duration::from_millis(sampling.min_interval_ms),
        )
    }

    /// Get the session controls
    pub fn control(&self) -> &SamplingControl {
        &self.control
    }

    /// Sample every declared path once
    pub fn sample(&mut self) -> Frame {
        let sequence = self.sequence;
        self.sequence += 1;
        let timestamp = Utc::now();

        let mut values = Vec::new();
        let mut failed = 0;
        let mut skipped = self.coordinator.is_paused();

        if !skipped {
            for raw in unique_paths(&self.control.declared()) {
                let reading = PropertyPath::parse(&raw)
                    .map_err(Into::into)
                    .and_then(|path| self.coordinator.try_read_path(&path, self.read_timeout));
                match reading {
                    Ok(Some(Reading::Value(value))) => values.push((raw, value)),
                    Ok(None) => {
                        failed += 1;
                        values.push((raw, Value::zero()));
                    }
                    Ok(Some(Reading::Skipped)) => {
                        // A write started mid-tick; drop the partial frame
                        skipped = true;
                        values.clear();
                        break;
                    }
                    Err(e) => {
                        debug!("Sampling {} failed: {}", raw, e);
                        failed += 1;
                        values.push((raw, Value::zero()));
                    }
                }
            }
        }

        self.control.update_stats(|stats| {
            stats.frames += 1;
            stats.failed_reads += failed;
            if skipped {
                stats.skipped_frames += 1;
            }
        });

        Frame {
            sequence,
            timestamp,
            values,
        }
    }

    /// Run the loop on the calling thread until sampling is disabled.
    ///
    /// Entering the loop resets the counters. `emit` receives each frame; an
    /// error from it ends the loop early and is returned.
    pub fn run<F>(&mut self, mut emit: F) -> Result<SamplingStats>
    where
        F: FnMut(Frame) -> Result<()>,
    {
        self.sequence = 0;
        self.control.update_stats(|stats| *stats = SamplingStats::default());
        info!("Sampling started");

        while self.control.is_enabled() {
            let started = Instant::now();
            emit(self.sample())?;

            if !self.min_interval.is_zero() {
                if let Some(rest) = self.min_interval.checked_sub(started.elapsed()) {
                    thread::sleep(rest);
                }
            }
        }

        let stats = self.control.stats();
        info!(
            "Sampling stopped after {} frames ({} skipped)",
            stats.frames, stats.skipped_frames
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use propbridge_devices::sim::{SimConnector, SimDevice, SimFault};
    use propbridge_devices::DeviceSink;
    use serde_json::json;

    fn sampler_for(devices: &[SimDevice]) -> (Arc<Coordinator>, Sampler) {
        sampler_with_timeout(devices, Duration::from_millis(100))
    }

    fn sampler_with_timeout(
        devices: &[SimDevice],
        read_timeout: Duration,
    ) -> (Arc<Coordinator>, Sampler) {
        let coordinator = Arc::new(Coordinator::with_defaults(Arc::new(SimConnector::new())));
        for device in devices {
            coordinator.device_found(device.discovered()).unwrap();
        }
        let sampler = Sampler::new(
            coordinator.clone(),
            SamplingControl::new(),
            read_timeout,
            Duration::ZERO,
        );
        (coordinator, sampler)
    }

    fn wait_until_paused(coordinator: &Coordinator) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !coordinator.is_paused() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(coordinator.is_paused());
    }

    #[test]
    fn test_unique_paths_keep_first_seen_order() {
        let paths: Vec<String> = ["b", "a", "b", "c", "a"].iter().map(|s| s.to_string()).collect();
        assert_eq!(unique_paths(&paths), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_duplicate_paths_yield_one_entry() {
        let (_, mut sampler) = sampler_for(&[SimDevice::odrive_like("A"), SimDevice::odrive_like("B")]);
        sampler.control().declare([
            "odrive0.vbus_voltage",
            "odrive0.vbus_voltage",
            "odrive1.axis0.pos_estimate",
        ]);

        let frame = sampler.sample();
        assert_eq!(frame.values.len(), 2);
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"odrive0.vbus_voltage": 24.0, "odrive1.axis0.pos_estimate": 0.0})
        );
    }

    #[test]
    fn test_unresolvable_path_reads_as_zero() {
        let (_, mut sampler) = sampler_for(&[SimDevice::odrive_like("A")]);
        sampler.control().declare(["odrive0.vbus_voltage", "odrive5.vbus_voltage", "bad..path"]);

        let frame = sampler.sample();
        assert_eq!(frame.get("odrive5.vbus_voltage"), Some(&Value::zero()));
        assert_eq!(frame.get("bad..path"), Some(&Value::zero()));
        assert_eq!(frame.get("odrive0.vbus_voltage"), Some(&Value::Float(24.0)));
        assert_eq!(sampler.control().stats().failed_reads, 2);
    }

    #[test]
    fn test_run_until_disabled() {
        let (_, mut sampler) = sampler_for(&[SimDevice::odrive_like("A")]);
        let control = sampler.control().clone();
        control.declare(["odrive0.axis0.pos_estimate"]);
        control.enable();
        assert_eq!(control.state(), SamplingState::Sampling);

        let mut sequences = Vec::new();
        let stats = sampler
            .run(|frame| {
                sequences.push(frame.sequence);
                if sequences.len() == 5 {
                    control.disable();
                }
                Ok(())
            })
            .unwrap();

        assert_eq!(sequences, vec![0, 1, 2, 3, 4]);
        assert_eq!(stats.frames, 5);
        assert_eq!(control.state(), SamplingState::Idle);
    }

    #[test]
    fn test_run_when_disabled_returns_immediately() {
        let (_, mut sampler) = sampler_for(&[]);
        let stats = sampler.run(|_| panic!("no frame expected")).unwrap();
        assert_eq!(stats, SamplingStats::default());
    }

    #[test]
    fn test_emit_error_stops_the_loop() {
        let (_, mut sampler) = sampler_for(&[SimDevice::odrive_like("A")]);
        sampler.control().enable();
        let result = sampler.run(|_| Err(crate::error::Error::other("client gone")));
        assert!(result.is_err());
    }

    #[test]
    fn test_failed_device_reads_are_counted() {
        let device = SimDevice::odrive_like("A");
        let (_, mut sampler) = sampler_for(&[device.clone()]);
        device
            .root()
            .property("ibus")
            .unwrap()
            .set_fault(Some(SimFault::Failure("bad crc".into())));
        device.root().property("axis0.pos_estimate").unwrap().set_latency(Duration::from_millis(500));
        sampler.control().declare(["odrive0.ibus", "odrive0.axis0.pos_estimate", "odrive0.vbus_voltage"]);

        let frame = sampler.sample();
        assert_eq!(frame.get("odrive0.ibus"), Some(&Value::zero()));
        assert_eq!(frame.get("odrive0.axis0.pos_estimate"), Some(&Value::zero()));
        assert_eq!(frame.get("odrive0.vbus_voltage"), Some(&Value::Float(24.0)));
        assert_eq!(sampler.control().stats().failed_reads, 2);
    }

    #[test]
    fn test_tick_during_write_is_empty() {
        let device = SimDevice::odrive_like("A");
        let (coordinator, mut sampler) = sampler_for(&[device.clone()]);
        sampler.control().declare(["odrive0.vbus_voltage", "odrive0.axis0.pos_estimate"]);
        device
            .root()
            .property("axis0.controller.input_vel")
            .unwrap()
            .set_latency(Duration::from_millis(300));

        let writer = {
            let coordinator = coordinator.clone();
            thread::spawn(move || {
                coordinator.write_property("odrive0.axis0.controller.input_vel", &json!(2.0), "number")
            })
        };
        wait_until_paused(&coordinator);

        let frame = sampler.sample();
        assert!(frame.is_empty());
        assert_eq!(sampler.control().stats().skipped_frames, 1);

        writer.join().unwrap().unwrap();
        let frame = sampler.sample();
        assert_eq!(frame.values.len(), 2);
        assert_eq!(sampler.control().stats().skipped_frames, 1);
        assert_eq!(sampler.control().stats().frames, 2);
    }

    #[test]
    fn test_write_started_mid_tick_empties_the_frame() {
        let device = SimDevice::odrive_like("A");
        let (coordinator, mut sampler) =
            sampler_with_timeout(&[device.clone()], Duration::from_secs(1));
        sampler.control().declare(["odrive0.axis0.pos_estimate", "odrive0.vbus_voltage"]);
        device.root().property("axis0.pos_estimate").unwrap().set_latency(Duration::from_millis(200));
        device
            .root()
            .property("axis1.controller.input_vel")
            .unwrap()
            .set_latency(Duration::from_millis(500));

        let writer = {
            let coordinator = coordinator.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(40));
                coordinator.write_property("odrive0.axis1.controller.input_vel", &json!(1.0), "number")
            })
        };

        let frame = sampler.sample();
        assert!(frame.is_empty());
        let stats = sampler.control().stats();
        assert_eq!(stats.skipped_frames, 1);
        assert_eq!(stats.failed_reads, 0);

        writer.join().unwrap().unwrap();
    }

    #[test]
    fn test_entering_run_resets_counters() {
        let (_, mut sampler) = sampler_for(&[SimDevice::odrive_like("A")]);
        let control = sampler.control().clone();
        control.declare(["odrive0.vbus_voltage", "odrive7.vbus_voltage"]);

        let mut run_for = |frames: usize| {
            control.enable();
            let mut sequences = Vec::new();
            let stats = sampler
                .run(|frame| {
                    sequences.push(frame.sequence);
                    if sequences.len() == frames {
                        control.disable();
                    }
                    Ok(())
                })
                .unwrap();
            (sequences, stats)
        };

        let (_, first) = run_for(4);
        assert_eq!(first.frames, 4);
        assert_eq!(first.failed_reads, 4);

        let (sequences, second) = run_for(2);
        assert_eq!(sequences, vec![0, 1]);
        assert_eq!(second.frames, 2);
        assert_eq!(second.failed_reads, 2);
        assert_eq!(second.skipped_frames, 0);
    }
}
