//! Top-level monitoring service: wires configuration, devices, wind,
//! storage, and the IoT publisher into one start/stop unit.
//!
//! The external HTTP/WebSocket facade talks to this type only: status,
//! fatigue snapshots, damage reset, and reconfiguration all go through here.

use crate::config::Config;
use crate::daq::device::StreamSink;
use crate::daq::manager::{DeviceManager, SourceFactory};
use crate::iot::{publish_startup_test, Publisher};
use crate::storage::{StorageService, WindStatsSource};
use crate::types::{DeviceStatus, FatigueSnapshot};
use crate::wind::{WindService, WindStatus};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

pub struct MonitorService {
    publisher: Arc<Publisher>,
    manager: DeviceManager,
    wind: Option<Arc<WindService>>,
    storage: Option<StorageService>,
}

impl MonitorService {
    /// Bring the whole pipeline up: devices auto-start, the stream-control
    /// subscriber binds to the configured display names, and a startup
    /// connectivity payload goes out.
    pub fn start(
        config: &Config,
        app_root: &Path,
        factory: SourceFactory,
        sink: Option<Arc<dyn StreamSink>>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let data_root = app_root.join("data");

        let publisher = Publisher::new(config.iot.clone(), &data_root);
        let manager = DeviceManager::new(
            config,
            &data_root,
            Arc::clone(&publisher),
            factory,
            sink,
        )?;
        publisher.start_control_subscriber(manager.display_names());

        let wind = WindService::start(config.wind.clone(), Some(Arc::clone(&publisher)));

        manager.start_all();

        let mut storage_cfg = config.storage.clone();
        storage_cfg.output_dir = resolve_dir(app_root, &storage_cfg.output_dir);
        let storage = StorageService::start(
            storage_cfg,
            manager.registry(),
            Arc::clone(&publisher),
            wind.clone().map(|w| w as Arc<dyn WindStatsSource>),
        );

        publish_startup_test(&publisher, &manager.device_names());
        info!("monitor service started");

        Ok(Self {
            publisher,
            manager,
            wind,
            storage,
        })
    }

    pub fn stop(&mut self) {
        if let Some(mut storage) = self.storage.take() {
            storage.stop();
        }
        if let Some(wind) = self.wind.take() {
            wind.stop();
        }
        self.manager.stop_all();
        self.publisher.shutdown();
        info!("monitor service stopped");
    }

    pub fn manager(&self) -> &DeviceManager {
        &self.manager
    }

    pub fn device_status(&self) -> BTreeMap<String, DeviceStatus> {
        self.manager.get_status()
    }

    pub fn fatigue_snapshots(&self) -> BTreeMap<String, FatigueSnapshot> {
        self.manager.fatigue_snapshots()
    }

    pub fn reset_damage(&self, device: Option<&str>) -> BTreeMap<String, FatigueSnapshot> {
        self.manager.reset_damage(device)
    }

    pub fn wind_status(&self) -> Option<WindStatus> {
        self.wind.as_ref().map(|w| w.status())
    }

    /// Toggle live streaming locally (the dashboard switch).
    pub fn set_stream_enabled(&self, enabled: bool) {
        self.publisher.gate().set_local(enabled);
    }
}

impl Drop for MonitorService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn resolve_dir(app_root: &Path, dir: &Path) -> PathBuf {
    if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        app_root.join(dir)
    }
}
