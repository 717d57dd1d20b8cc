//! Device manager: builds devices from config and drives their lifecycle.
//!
//! The manager owns the device registry behind one lock so the storage
//! service and the external facade can take snapshots while samplers run.
//! Hardware enumeration lives in the driver layer; the manager only logs the
//! configured topology and asks the injected source factory for handles.

use crate::config::{Config, DeviceConfig};
use crate::daq::device::{Device, DeviceSettings, Snapshot, StreamSink};
use crate::daq::source::{AcquireError, SampleSource, SimulatedSource};
use crate::iot::Publisher;
use crate::types::{ChannelConfig, DeviceStatus, FatigueSnapshot};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared handle to the running devices.
pub type DeviceRegistry = Arc<Mutex<BTreeMap<String, Device>>>;

/// Creates a [`SampleSource`] for a named device.
pub type SourceFactory =
    Box<dyn Fn(&str, &[ChannelConfig], f64) -> Result<Box<dyn SampleSource>, AcquireError> + Send + Sync>;

/// Default factory: seeded simulated sources (hardware drivers are wired in
/// by the embedding service).
pub fn simulated_factory(seed: u64) -> SourceFactory {
    Box::new(move |name, channels, rate| {
        let source = SimulatedSource::new(name, channels, rate, seed)?;
        Ok(Box::new(source))
    })
}

pub struct DeviceManager {
    devices: DeviceRegistry,
    settings: DeviceSettings,
    factory: SourceFactory,
}

impl DeviceManager {
    /// Build every configured device. A device that fails to build is
    /// logged and skipped; the rest of the fleet still comes up.
    pub fn new(
        config: &Config,
        data_root: &Path,
        publisher: Arc<Publisher>,
        factory: SourceFactory,
        sink: Option<Arc<dyn StreamSink>>,
    ) -> Result<Self, crate::config::ConfigError> {
        config.validate()?;
        let (fs_hw, fs_eff) = config.rates()?;
        let settings = DeviceSettings {
            sample_rate: fs_hw,
            effective_sample_rate: fs_eff,
            samples_per_read: config.samples_per_read,
            fft_interval: config.fft_interval,
            fft_window_s: config.fft_window_s,
            disp_method: config.disp_method,
            log_interval_s: 600.0,
            storage_duration_s: config.storage.duration_s,
        };

        log_device_check(&config.devices);

        let mut devices = BTreeMap::new();
        for (name, dev_cfg) in &config.devices {
            match Device::new(
                name,
                &dev_cfg.display_name,
                dev_cfg.channels.clone(),
                settings.clone(),
                data_root,
                Arc::clone(&publisher),
            ) {
                Ok(mut device) => {
                    if let Some(ref s) = sink {
                        device.set_stream_sink(Arc::clone(s));
                    }
                    devices.insert(name.clone(), device);
                }
                Err(e) => {
                    warn!(device = %name, error = %e, "device build failed; skipping");
                }
            }
        }

        Ok(Self {
            devices: Arc::new(Mutex::new(devices)),
            settings,
            factory,
        })
    }

    /// Shared registry handle for the storage service and facade.
    pub fn registry(&self) -> DeviceRegistry {
        Arc::clone(&self.devices)
    }

    pub fn settings(&self) -> &DeviceSettings {
        &self.settings
    }

    pub fn device_names(&self) -> Vec<String> {
        self.devices.lock().keys().cloned().collect()
    }

    pub fn display_names(&self) -> Vec<String> {
        self.devices
            .lock()
            .values()
            .map(|d| d.display_name().to_string())
            .collect()
    }

    pub fn start(&self, name: &str) -> Result<(), AcquireError> {
        let mut devices = self.devices.lock();
        let Some(device) = devices.get_mut(name) else {
            return Err(AcquireError::HardwareUnavailable(format!(
                "unknown device {name}"
            )));
        };
        let source = (self.factory)(name, device.channels(), self.settings.sample_rate)?;
        device.start(source)
    }

    pub fn start_all(&self) {
        for name in self.device_names() {
            if let Err(e) = self.start(&name) {
                warn!(device = %name, error = %e, "device start failed");
            }
        }
    }

    pub fn stop(&self, name: &str) {
        if let Some(device) = self.devices.lock().get_mut(name) {
            device.stop();
        }
    }

    pub fn stop_all(&self) {
        for device in self.devices.lock().values_mut() {
            device.stop();
        }
    }

    pub fn get_status(&self) -> BTreeMap<String, DeviceStatus> {
        self.devices
            .lock()
            .iter()
            .map(|(name, dev)| (name.clone(), dev.status()))
            .collect()
    }

    pub fn fatigue_snapshots(&self) -> BTreeMap<String, FatigueSnapshot> {
        self.devices
            .lock()
            .iter()
            .map(|(name, dev)| (name.clone(), dev.fatigue_snapshot()))
            .collect()
    }

    /// Reset cumulative damage for one device, or for all when `None`.
    pub fn reset_damage(&self, device: Option<&str>) -> BTreeMap<String, FatigueSnapshot> {
        let mut results = BTreeMap::new();
        let mut devices = self.devices.lock();
        for (name, dev) in devices.iter_mut() {
            if device.is_some_and(|d| d != name) {
                continue;
            }
            match dev.reset_damage() {
                Ok(snapshot) => {
                    results.insert(name.clone(), snapshot);
                }
                Err(e) => warn!(device = %name, error = %e, "damage reset failed"),
            }
        }
        results
    }

    /// Snapshot every device's storage rings.
    pub fn capture_snapshots(&self, duration_s: f64) -> Vec<Snapshot> {
        self.devices
            .lock()
            .values()
            .map(|dev| dev.capture_snapshot(duration_s))
            .collect()
    }
}

/// Log the configured topology at startup.
fn log_device_check(devices: &BTreeMap<String, DeviceConfig>) {
    info!(count = devices.len(), "device check start");
    for (name, cfg) in devices {
        info!(
            device = %name,
            model = %cfg.model,
            channels = cfg.channels.len(),
            enabled = cfg.channels.iter().filter(|c| c.enabled).count(),
            "configured device"
        );
    }
}
