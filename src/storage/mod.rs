//! Waveform snapshot service.
//!
//! A single timer thread serves every device: at each tick it prunes expired
//! month folders, captures each device's storage-ring tail, writes a TDMS
//! segment into `output_dir/YYYYMM/DD/`, and publishes the interval data
//! payloads. The timer re-aligns by sleeping `interval − elapsed`, so a slow
//! tick does not drift the schedule.

pub mod tdms;

use crate::config::StorageConfig;
use crate::daq::device::Snapshot;
use crate::daq::manager::DeviceRegistry;
use crate::iot::Publisher;
use crate::types::{ChannelUnit, DispStats, WindStats};
use chrono::{DateTime, Datelike, Local, Utc};
use crossbeam_channel::{bounded, Receiver, Sender};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub use tdms::{read_segment, write_segment, TdmsChannel, TdmsError, TdmsValue};

/// Grace period for joining the timer thread on stop.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Supplies the latest wind statistics window for the interval payloads.
pub trait WindStatsSource: Send + Sync {
    fn latest_stats(&self) -> Option<WindStats>;
}

// ============================================================================
// Service
// ============================================================================

pub struct StorageService {
    stop_tx: Sender<()>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl StorageService {
    /// Spawn the timer thread. Returns `None` when storage is disabled.
    pub fn start(
        cfg: StorageConfig,
        registry: DeviceRegistry,
        publisher: Arc<Publisher>,
        wind: Option<Arc<dyn WindStatsSource>>,
    ) -> Option<Self> {
        if !cfg.enabled {
            return None;
        }
        let (stop_tx, stop_rx) = bounded::<()>(0);
        info!(
            interval_s = cfg.interval_s,
            duration_s = cfg.duration_s,
            dir = %cfg.output_dir.display(),
            "storage service started"
        );
        let handle = std::thread::Builder::new()
            .name("storage".to_string())
            .spawn(move || timer_loop(&cfg, &registry, &publisher, wind.as_deref(), &stop_rx))
            .ok();
        Some(Self { stop_tx, handle })
    }

    pub fn stop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let deadline = Instant::now() + JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
                info!("storage service stopped");
            } else {
                warn!("storage thread did not stop in time; leaking");
            }
        }
    }
}

impl Drop for StorageService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn timer_loop(
    cfg: &StorageConfig,
    registry: &DeviceRegistry,
    publisher: &Publisher,
    wind: Option<&dyn WindStatsSource>,
    stop_rx: &Receiver<()>,
) {
    loop {
        let started = Instant::now();
        run_once(cfg, registry, publisher, wind);
        // Re-align on the interval regardless of how long the tick took.
        let wait = Duration::from_secs_f64(cfg.interval_s).saturating_sub(started.elapsed());
        match stop_rx.recv_timeout(wait) {
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            _ => return,
        }
    }
}

/// One storage tick: retention sweep, then snapshot + write + publish per
/// device, then the wind stats payload.
pub fn run_once(
    cfg: &StorageConfig,
    registry: &DeviceRegistry,
    publisher: &Publisher,
    wind: Option<&dyn WindStatsSource>,
) {
    let now_utc = Utc::now();
    let now_local = Local::now();

    if let Err(e) = cleanup_old_months(&cfg.output_dir, cfg.retention_months, now_local) {
        warn!(error = %e, "retention sweep failed");
    }

    // Capture snapshots and fatigue under the registry lock, then write
    // files with the lock released.
    let captured: Vec<(Snapshot, crate::types::FatigueSnapshot)> = {
        let devices = registry.lock();
        devices
            .values()
            .map(|dev| (dev.capture_snapshot(cfg.duration_s), dev.fatigue_snapshot()))
            .collect()
    };

    for (snapshot, fatigue) in &captured {
        if snapshot.is_empty() {
            continue;
        }
        match write_snapshot(cfg, snapshot, now_utc, now_local) {
            Ok(path) => {
                info!(device = %snapshot.device, path = %path.display(), "wrote tdms snapshot");
            }
            Err(e) => warn!(device = %snapshot.device, error = %e, "tdms write failed"),
        }
        publish_interval_data(cfg, publisher, snapshot, fatigue, now_local);
    }

    if let Some(wind) = wind {
        publish_wind_stats(cfg, publisher, wind, &captured, now_local);
    }
}

// ============================================================================
// TDMS Assembly
// ============================================================================

/// Write one snapshot as a TDMS segment under `output_dir/YYYYMM/DD/`.
pub fn write_snapshot(
    cfg: &StorageConfig,
    snapshot: &Snapshot,
    now_utc: DateTime<Utc>,
    now_local: DateTime<Local>,
) -> Result<PathBuf, TdmsError> {
    let ts_str = now_utc.format("%d%m%y_%H%M%S").to_string();
    let filename = cfg
        .filename_format
        .replace("{display_name}", &snapshot.display_name)
        .replace("{ts}", &ts_str);

    let dest_dir = cfg
        .output_dir
        .join(now_local.format("%Y%m").to_string())
        .join(now_local.format("%d").to_string());
    std::fs::create_dir_all(&dest_dir)?;
    let path = dest_dir.join(filename);

    write_segment(&path, "Data", &snapshot_channels(snapshot))?;
    Ok(path)
}

/// TDMS channel objects with the waveform metadata viewers expect.
pub fn snapshot_channels(snapshot: &Snapshot) -> Vec<TdmsChannel> {
    let fs = snapshot.effective_sample_rate;
    snapshot
        .data
        .iter()
        .enumerate()
        .map(|(idx, data)| {
            let cfg = snapshot.channels.get(idx);
            let ch_id = cfg.map_or(idx as u32, |c| c.id);
            let unit = cfg.map_or("g", |c| match c.unit {
                ChannelUnit::G => "g",
                ChannelUnit::MetersPerSecondSquared => "m/s2",
            });
            let mut properties = vec![
                (
                    "sample_rate".to_string(),
                    TdmsValue::F64(snapshot.sample_rate),
                ),
                ("effective_sample_rate".to_string(), TdmsValue::F64(fs)),
                ("unit".to_string(), TdmsValue::Str(unit.to_string())),
                ("unit_string".to_string(), TdmsValue::Str(unit.to_string())),
                (
                    "remark".to_string(),
                    TdmsValue::Str(cfg.map_or(String::new(), |c| c.remark.clone())),
                ),
                (
                    "sensitivity".to_string(),
                    TdmsValue::F64(cfg.map_or(0.0, |c| c.sensitivity)),
                ),
                (
                    "coupling".to_string(),
                    TdmsValue::Str(
                        cfg.map_or("AC", |c| match c.coupling {
                            crate::types::Coupling::Ac => "AC",
                            crate::types::Coupling::Dc => "DC",
                        })
                        .to_string(),
                    ),
                ),
                ("type".to_string(), TdmsValue::Str("acc".to_string())),
                (
                    "iepe".to_string(),
                    TdmsValue::Bool(cfg.is_some_and(|c| c.iepe)),
                ),
            ];
            if fs > 0.0 {
                properties.extend([
                    ("wf_increment".to_string(), TdmsValue::F64(1.0 / fs)),
                    (
                        "wf_start_time".to_string(),
                        TdmsValue::Time(snapshot.start_time),
                    ),
                    ("wf_start_offset".to_string(), TdmsValue::F64(0.0)),
                    ("wf_start_index".to_string(), TdmsValue::I32(0)),
                    ("wf_samples".to_string(), TdmsValue::I32(data.len() as i32)),
                    ("wf_xname".to_string(), TdmsValue::Str("Time".to_string())),
                    (
                        "wf_xunit_string".to_string(),
                        TdmsValue::Str("s".to_string()),
                    ),
                    (
                        "wf_time_reference".to_string(),
                        TdmsValue::Str("absolute".to_string()),
                    ),
                ]);
            }
            TdmsChannel {
                name: format!("CH{ch_id}"),
                data: data.clone(),
                properties,
            }
        })
        .collect()
}

// ============================================================================
// Retention
// ============================================================================

/// Delete month folders (`YYYYMM`) older than the retention horizon.
/// Returns the removed folder names.
pub fn cleanup_old_months(
    output_dir: &Path,
    retention_months: u32,
    now: DateTime<Local>,
) -> std::io::Result<Vec<String>> {
    let mut removed = Vec::new();
    if retention_months == 0 || !output_dir.exists() {
        return Ok(removed);
    }
    let current = now.year() * 12 + now.month() as i32;
    let cutoff = current - (retention_months as i32 - 1);

    for entry in std::fs::read_dir(output_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(value) = parse_month_folder(&name) else {
            continue;
        };
        if value < cutoff {
            match std::fs::remove_dir_all(entry.path()) {
                Ok(()) => {
                    info!(folder = %name, "removed expired snapshot month");
                    removed.push(name);
                }
                Err(e) => warn!(folder = %name, error = %e, "failed to remove month folder"),
            }
        }
    }
    Ok(removed)
}

/// `YYYYMM` → `12·Y + M`, or `None` for anything else.
fn parse_month_folder(name: &str) -> Option<i32> {
    if name.len() != 6 || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year: i32 = name[..4].parse().ok()?;
    let month: i32 = name[4..].parse().ok()?;
    if !(1..=12).contains(&month) {
        return None;
    }
    Some(year * 12 + month)
}

// ============================================================================
// Interval Payloads
// ============================================================================

fn topic_base(snapshot: &Snapshot) -> String {
    let display = snapshot.display_name.trim();
    if display.is_empty() {
        snapshot.device.clone()
    } else {
        display.to_string()
    }
}

fn publish_interval_data(
    cfg: &StorageConfig,
    publisher: &Publisher,
    snapshot: &Snapshot,
    fatigue: &crate::types::FatigueSnapshot,
    now: DateTime<Local>,
) {
    let base = topic_base(snapshot);
    let timestamp = now.format("%Y-%m-%dT%H:%M:%S").to_string();

    // Acceleration stats per channel over the snapshot window.
    let channels: Vec<serde_json::Value> = snapshot
        .data
        .iter()
        .enumerate()
        .map(|(idx, data)| {
            let ch = snapshot.channels.get(idx).map_or(idx as u32, |c| c.id);
            if data.is_empty() {
                return json!({ "ch": ch, "acc_max": null, "acc_min": null,
                               "acc_rms": null, "acc_p2p": null });
            }
            let stats = DispStats::from_signal(data);
            json!({
                "ch": ch,
                "acc_max": stats.max,
                "acc_min": stats.min,
                "acc_rms": stats.rms,
                "acc_p2p": stats.p2p,
            })
        })
        .collect();
    publisher.publish_to(
        &json!({
            "device": snapshot.device,
            "display_name": snapshot.display_name,
            "timestamp": timestamp,
            "interval_s": cfg.interval_s,
            "window_s": cfg.duration_s,
            "channels": channels,
        }),
        Some(&format!("{base}/data/vib")),
    );

    // Displacement stats of the dominant channel.
    if let Some((main_channel, disp)) = dominant_displacement(snapshot) {
        publisher.publish_to(
            &json!({
                "device": snapshot.device,
                "display_name": snapshot.display_name,
                "timestamp": timestamp,
                "interval_s": cfg.interval_s,
                "window_s": cfg.duration_s,
                "main_channel": main_channel,
                "disp_max": disp.max,
                "disp_min": disp.min,
                "disp_rms": disp.rms,
                "disp_p2p": disp.p2p,
            }),
            Some(&format!("{base}/data/disp")),
        );
    }

    // Cumulative fatigue vector.
    publisher.publish_to(
        &json!({
            "device": snapshot.device,
            "display_name": snapshot.display_name,
            "timestamp": timestamp,
            "interval_s": cfg.interval_s,
            "fatigue_cumulative": {
                "phi_deg_list": fatigue.phi_deg_list,
                "D_phi_cum": fatigue.d_phi_cum,
            },
        }),
        Some(&format!("{base}/data/fatigue")),
    );
}

/// Integrate every channel of the snapshot and pick the one with the largest
/// displacement peak.
fn dominant_displacement(snapshot: &Snapshot) -> Option<(u32, DispStats)> {
    let fs = snapshot.effective_sample_rate;
    if fs <= 0.0 {
        return None;
    }
    let mut best: Option<(u32, DispStats, f64)> = None;
    for (idx, data) in snapshot.data.iter().enumerate() {
        if data.is_empty() {
            continue;
        }
        let cfg = snapshot.channels.get(idx);
        let is_g = cfg.map_or(true, |c| c.unit.is_g());
        let acc: Vec<f64> = if is_g {
            data.iter()
                .map(|&a| a * crate::types::STANDARD_GRAVITY)
                .collect()
        } else {
            data.clone()
        };
        let disp = crate::dsp::acc_to_disp(&acc, fs, crate::dsp::DispMethod::Fft);
        let stats = DispStats::from_signal(&disp);
        let peak = stats.max.abs().max(stats.min.abs());
        let ch = cfg.map_or(idx as u32, |c| c.id);
        if best.as_ref().map_or(true, |(_, _, p)| peak > *p) {
            best = Some((ch, stats, peak));
        }
    }
    best.map(|(ch, stats, _)| (ch, stats))
}

fn publish_wind_stats(
    cfg: &StorageConfig,
    publisher: &Publisher,
    wind: &dyn WindStatsSource,
    captured: &[(Snapshot, crate::types::FatigueSnapshot)],
    now: DateTime<Local>,
) {
    let Some(stats) = wind.latest_stats() else {
        return;
    };
    let payload = json!({
        "timestamp": now.format("%Y-%m-%dT%H:%M:%S").to_string(),
        "interval_s": cfg.interval_s,
        "speed_mean": stats.speed_mean,
        "speed_max": stats.speed_max,
        "speed_min": stats.speed_min,
        "direction_mean_deg": stats.direction_mean_deg,
        "n": stats.n,
    });
    for (snapshot, _) in captured {
        let base = topic_base(snapshot);
        publisher.publish_to(&payload, Some(&format!("{base}/data/wind")));
    }
}
