//! Damage logging: persistent cumulative fatigue plus the daily CSV.
//!
//! The cumulative store survives restarts through a three-file protocol:
//! before every write the current primary is copied to `.bak`, the new
//! content goes to `.tmp`, and the tmp is atomically renamed over the
//! primary. A crash at any point leaves at least one parseable record, and
//! the loader repairs the primary from the backup when needed.

use crate::types::{CumulativeDamage, DispStats, FatigueWindow, WindowStats};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const DAMAGE_FILE: &str = "damage_cumulative.txt";
pub const BACKUP_FILE: &str = "damage_cumulative.bak";

const TIMESTAMP_FMT: &str = "%Y-%m-%dT%H:%M:%S";
const CSV_TIMESTAMP_FMT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

fn io_err(path: &Path, source: std::io::Error) -> PersistError {
    PersistError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// ============================================================================
// CSV Rows
// ============================================================================

/// One row of the daily CSV. Field order defines the header order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CsvRow {
    pub timestamp: String,
    pub device: String,
    #[serde(rename = "type")]
    pub row_type: String,
    pub channel: Option<u32>,
    pub acc_max: Option<f64>,
    pub acc_min: Option<f64>,
    pub acc_rms: Option<f64>,
    pub disp_max: Option<f64>,
    pub disp_min: Option<f64>,
    pub disp_rms: Option<f64>,
    #[serde(rename = "fatigue_Dmax")]
    pub fatigue_dmax: Option<f64>,
    #[serde(rename = "fatigue_phi_deg")]
    pub fatigue_phi_deg: Option<f64>,
    #[serde(rename = "fatigue_Sa_max")]
    pub fatigue_sa_max: Option<f64>,
}

impl CsvRow {
    fn empty(timestamp: String, device: String, row_type: &str) -> Self {
        Self {
            timestamp,
            device,
            row_type: row_type.to_string(),
            channel: None,
            acc_max: None,
            acc_min: None,
            acc_rms: None,
            disp_max: None,
            disp_min: None,
            disp_rms: None,
            fatigue_dmax: None,
            fatigue_phi_deg: None,
            fatigue_sa_max: None,
        }
    }
}

// ============================================================================
// Damage Logger
// ============================================================================

/// Per-device cumulative damage store and CSV writer.
pub struct DamageLogger {
    device_name: String,
    data_dir: PathBuf,
    dphi_deg: f64,
    state: CumulativeDamage,
}

impl DamageLogger {
    /// Open (or initialize) the store under `data_dir`.
    pub fn open(device_name: &str, data_dir: &Path, dphi_deg: f64) -> Result<Self, PersistError> {
        std::fs::create_dir_all(data_dir).map_err(|e| io_err(data_dir, e))?;
        let mut logger = Self {
            device_name: device_name.to_string(),
            data_dir: data_dir.to_path_buf(),
            dphi_deg,
            state: default_record(device_name, dphi_deg),
        };
        logger.load_or_init()?;
        Ok(logger)
    }

    pub fn cumulative(&self) -> &CumulativeDamage {
        &self.state
    }

    fn primary_path(&self) -> PathBuf {
        self.data_dir.join(DAMAGE_FILE)
    }

    fn backup_path(&self) -> PathBuf {
        self.data_dir.join(BACKUP_FILE)
    }

    /// Load invariant: primary, then backup (repairing the primary from it),
    /// then zeros persisted fresh.
    fn load_or_init(&mut self) -> Result<(), PersistError> {
        if let Some(record) = try_load(&self.primary_path()) {
            self.state = record;
            return Ok(());
        }
        if let Some(record) = try_load(&self.backup_path()) {
            warn!(device = %self.device_name, "primary damage file unreadable; restored from backup");
            self.state = record;
            // Repair the primary so the next crash still has two copies.
            let json = serde_json::to_string_pretty(&self.state)?;
            if let Err(e) = std::fs::write(self.primary_path(), json) {
                warn!(device = %self.device_name, error = %e, "failed to repair primary damage file");
            }
            return Ok(());
        }
        info!(device = %self.device_name, "initializing cumulative damage at zero");
        self.state = default_record(&self.device_name, self.dphi_deg);
        self.persist()
    }

    /// Write protocol: backup current primary, stage to `.tmp`, rename.
    fn persist(&self) -> Result<(), PersistError> {
        let primary = self.primary_path();
        if primary.exists() {
            if let Err(e) = std::fs::copy(&primary, self.backup_path()) {
                warn!(device = %self.device_name, error = %e, "damage backup copy failed");
            }
        }
        let tmp = self.data_dir.join(format!("{DAMAGE_FILE}.tmp"));
        let json = serde_json::to_string_pretty(&self.state)?;
        std::fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
        std::fs::rename(&tmp, &primary).map_err(|e| io_err(&primary, e))
    }

    /// Fold one window's directional damage into the cumulative vector,
    /// remapping the stored layout first when the bin count changed.
    pub fn update_cumulative(
        &mut self,
        window: &FatigueWindow,
        ts: DateTime<Local>,
    ) -> Result<CumulativeDamage, PersistError> {
        if window.phi_deg_list.is_empty() || window.d_phi.is_empty() {
            return Ok(self.state.clone());
        }

        if self.state.d_phi_cum.len() != window.d_phi.len() {
            let remapped = remap_bins(
                &self.state.phi_deg_list,
                &self.state.d_phi_cum,
                &window.phi_deg_list,
            );
            self.state.phi_deg_list = window.phi_deg_list.clone();
            self.state.d_phi_cum = remapped;
        }

        for (cum, d) in self.state.d_phi_cum.iter_mut().zip(window.d_phi.iter()) {
            *cum += d;
        }
        self.state.timestamp = ts.format(TIMESTAMP_FMT).to_string();
        refresh_peak(&mut self.state);
        self.persist()?;
        Ok(self.state.clone())
    }

    /// Zero every bin and persist.
    pub fn reset(&mut self) -> Result<CumulativeDamage, PersistError> {
        self.state = default_record(&self.device_name, self.dphi_deg);
        self.persist()?;
        Ok(self.state.clone())
    }

    // ------------------------------------------------------------------
    // Daily CSV
    // ------------------------------------------------------------------

    /// Append the window's row set to `YYYYMMDD.csv`: one `stat` row per
    /// channel with data, plus one `fatigue` row when a window computed.
    pub fn write_window(
        &self,
        start: DateTime<Local>,
        channels: &[(u32, WindowStats, DispStats)],
        fatigue: Option<&FatigueWindow>,
    ) -> Result<(), PersistError> {
        let timestamp = start.format(CSV_TIMESTAMP_FMT).to_string();
        let mut rows = Vec::new();

        for (channel, stats, disp) in channels {
            if stats.count == 0 {
                continue;
            }
            let mut row = CsvRow::empty(timestamp.clone(), self.device_name.clone(), "stat");
            row.channel = Some(*channel);
            row.acc_max = Some(stats.max);
            row.acc_min = Some(stats.min);
            row.acc_rms = Some(stats.rms());
            row.disp_max = Some(disp.max);
            row.disp_min = Some(disp.min);
            row.disp_rms = Some(disp.rms);
            rows.push(row);
        }

        if let Some(f) = fatigue {
            let mut row = CsvRow::empty(timestamp, self.device_name.clone(), "fatigue");
            row.fatigue_dmax = Some(f.dmax);
            row.fatigue_phi_deg = Some(f.phi_deg);
            row.fatigue_sa_max = Some(f.sa_max);
            rows.push(row);
        }

        if rows.is_empty() {
            return Ok(());
        }

        let path = self
            .data_dir
            .join(format!("{}.csv", start.format("%Y%m%d")));
        append_rows(&path, &rows)
    }
}

/// Append rows, writing the header only when the file is new.
pub fn append_rows(path: &Path, rows: &[CsvRow]) -> Result<(), PersistError> {
    let existed = path.exists();
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| io_err(path, e))?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(!existed)
        .from_writer(file);
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush().map_err(|e| io_err(path, e))?;
    Ok(())
}

/// Parse a daily CSV back into rows (tooling and tests).
pub fn read_rows(path: &Path) -> Result<Vec<CsvRow>, PersistError> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        rows.push(row?);
    }
    Ok(rows)
}

// ============================================================================
// Helpers
// ============================================================================

fn default_record(device_name: &str, dphi_deg: f64) -> CumulativeDamage {
    let bins = (360.0 / dphi_deg).round() as usize;
    CumulativeDamage {
        timestamp: Local::now().format(TIMESTAMP_FMT).to_string(),
        device: device_name.to_string(),
        phi_deg_list: (0..bins).map(|i| i as f64 * dphi_deg).collect(),
        d_phi_cum: vec![0.0; bins],
        d_cum_max: 0.0,
        phi_deg_cum: 0.0,
    }
}

fn refresh_peak(record: &mut CumulativeDamage) {
    let mut imax = 0;
    for (i, &d) in record.d_phi_cum.iter().enumerate() {
        if d > record.d_phi_cum[imax] {
            imax = i;
        }
    }
    record.d_cum_max = record.d_phi_cum.get(imax).copied().unwrap_or(0.0);
    record.phi_deg_cum = record.phi_deg_list.get(imax).copied().unwrap_or(0.0);
}

fn try_load(path: &Path) -> Option<CumulativeDamage> {
    let text = std::fs::read_to_string(path).ok()?;
    let record: CumulativeDamage = serde_json::from_str(&text).ok()?;
    if record.phi_deg_list.is_empty()
        || record.phi_deg_list.len() != record.d_phi_cum.len()
    {
        return None;
    }
    Some(record)
}

/// Smallest angular distance between two azimuths, in degrees.
fn circular_distance_deg(a: f64, b: f64) -> f64 {
    ((a - b + 180.0).rem_euclid(360.0) - 180.0).abs()
}

/// Move every old bin's damage to the circularly nearest new bin. The total
/// mass is preserved: each old bin contributes entirely to exactly one new
/// bin.
pub fn remap_bins(old_phi: &[f64], old_damage: &[f64], new_phi: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; new_phi.len()];
    if old_phi.len() != old_damage.len() || new_phi.is_empty() {
        return out;
    }
    for (phi, damage) in old_phi.iter().zip(old_damage.iter()) {
        let mut best = 0;
        let mut best_dist = f64::INFINITY;
        for (j, target) in new_phi.iter().enumerate() {
            let dist = circular_distance_deg(*phi, *target);
            if dist < best_dist {
                best_dist = dist;
                best = j;
            }
        }
        out[best] += damage;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FatigueParams;

    fn window_with_first_bin(value: f64) -> FatigueWindow {
        let params = FatigueParams::at_rate(1600.0);
        let bins = params.bin_count();
        let phi: Vec<f64> = (0..bins)
            .map(|b| params.dphi_deg / 2.0 + b as f64 * params.dphi_deg)
            .collect();
        let mut d = vec![0.0; bins];
        d[0] = value;
        FatigueWindow {
            dmax: value,
            phi_deg: phi[0],
            sa_max: 100.0,
            phi_deg_list: phi,
            d_phi: d,
            params,
        }
    }

    #[test]
    fn initializes_zeroed_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let logger = DamageLogger::open("tower1", dir.path(), 5.0).unwrap();
        assert_eq!(logger.cumulative().d_phi_cum.len(), 72);
        assert!(logger.cumulative().d_phi_cum.iter().all(|&d| d == 0.0));
        assert!(dir.path().join(DAMAGE_FILE).exists());
    }

    #[test]
    fn updates_accumulate_monotonically() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = DamageLogger::open("tower1", dir.path(), 5.0).unwrap();
        let window = window_with_first_bin(1e-6);
        for i in 1..=3 {
            let record = logger.update_cumulative(&window, Local::now()).unwrap();
            assert!((record.d_phi_cum[0] - i as f64 * 1e-6).abs() < 1e-18);
        }
        let record = logger.cumulative();
        assert!((record.d_cum_max - 3e-6).abs() < 1e-18);
    }

    #[test]
    fn reload_restores_from_backup_when_primary_deleted() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut logger = DamageLogger::open("tower1", dir.path(), 5.0).unwrap();
            let window = window_with_first_bin(1e-6);
            // First update establishes a primary, second rolls it to backup.
            logger.update_cumulative(&window, Local::now()).unwrap();
            logger.update_cumulative(&window, Local::now()).unwrap();
            logger.update_cumulative(&window, Local::now()).unwrap();
        }
        std::fs::remove_file(dir.path().join(DAMAGE_FILE)).unwrap();

        let logger = DamageLogger::open("tower1", dir.path(), 5.0).unwrap();
        // Backup holds the state before the last write.
        assert!((logger.cumulative().d_phi_cum[0] - 2e-6).abs() < 1e-18);
        // Primary was repaired.
        assert!(dir.path().join(DAMAGE_FILE).exists());
    }

    #[test]
    fn truncated_primary_falls_back_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut logger = DamageLogger::open("tower1", dir.path(), 5.0).unwrap();
            logger
                .update_cumulative(&window_with_first_bin(1e-6), Local::now())
                .unwrap();
            logger
                .update_cumulative(&window_with_first_bin(1e-6), Local::now())
                .unwrap();
        }
        // Simulate a crash mid-write: primary truncated to garbage.
        std::fs::write(dir.path().join(DAMAGE_FILE), "{\"timesta").unwrap();

        let logger = DamageLogger::open("tower1", dir.path(), 5.0).unwrap();
        assert!((logger.cumulative().d_phi_cum[0] - 1e-6).abs() < 1e-18);
    }

    #[test]
    fn reset_round_trips_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = DamageLogger::open("tower1", dir.path(), 5.0).unwrap();
        logger
            .update_cumulative(&window_with_first_bin(5e-7), Local::now())
            .unwrap();
        logger.reset().unwrap();
        drop(logger);

        let logger = DamageLogger::open("tower1", dir.path(), 5.0).unwrap();
        assert!(logger.cumulative().d_phi_cum.iter().all(|&d| d == 0.0));
        assert_eq!(logger.cumulative().d_cum_max, 0.0);
    }

    #[test]
    fn bin_remap_preserves_total_mass() {
        let old_phi: Vec<f64> = (0..72).map(|i| i as f64 * 5.0).collect();
        let old_damage: Vec<f64> = (0..72).map(|i| (i + 1) as f64 * 1e-6).collect();
        let new_phi: Vec<f64> = (0..36).map(|i| 5.0 + i as f64 * 10.0).collect();

        let remapped = remap_bins(&old_phi, &old_damage, &new_phi);
        assert_eq!(remapped.len(), 36);
        let old_total: f64 = old_damage.iter().sum();
        let new_total: f64 = remapped.iter().sum();
        assert!((old_total - new_total).abs() < 1e-15);
    }

    #[test]
    fn remap_fires_on_bin_count_change_during_update() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = DamageLogger::open("tower1", dir.path(), 5.0).unwrap();
        logger
            .update_cumulative(&window_with_first_bin(1e-6), Local::now())
            .unwrap();
        let before: f64 = logger.cumulative().d_phi_cum.iter().sum();

        // A 36-bin window arrives: stored damage rides along into the new
        // layout before the new window is added.
        let params = FatigueParams {
            dphi_deg: 10.0,
            ..FatigueParams::at_rate(1600.0)
        };
        let phi: Vec<f64> = (0..36).map(|b| 5.0 + b as f64 * 10.0).collect();
        let window = FatigueWindow {
            dmax: 0.0,
            phi_deg: phi[0],
            sa_max: 0.0,
            phi_deg_list: phi,
            d_phi: vec![0.0; 36],
            params,
        };
        let record = logger.update_cumulative(&window, Local::now()).unwrap();
        assert_eq!(record.d_phi_cum.len(), 36);
        let after: f64 = record.d_phi_cum.iter().sum();
        assert!((before - after).abs() < 1e-15);
    }

    #[test]
    fn csv_rows_round_trip_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let logger = DamageLogger::open("tower1", dir.path(), 5.0).unwrap();

        let mut stats = WindowStats::default();
        stats.accumulate(&[0.125, -0.5, 0.75]);
        let disp = DispStats {
            max: 0.001,
            min: -0.002,
            rms: 0.0005,
            p2p: 0.003,
        };
        let start = Local::now();
        let window = window_with_first_bin(1.25e-7);
        logger
            .write_window(start, &[(0, stats, disp), (1, WindowStats::default(), disp)], Some(&window))
            .unwrap();

        let path = dir.path().join(format!("{}.csv", start.format("%Y%m%d")));
        let rows = read_rows(&path).unwrap();
        // Channel 1 had no samples: one stat row plus one fatigue row.
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].row_type, "stat");
        assert_eq!(rows[0].channel, Some(0));
        assert_eq!(rows[0].acc_max, Some(0.75));
        assert_eq!(rows[0].acc_min, Some(-0.5));
        assert_eq!(rows[0].disp_rms, Some(0.0005));
        assert_eq!(rows[1].row_type, "fatigue");
        assert_eq!(rows[1].fatigue_dmax, Some(1.25e-7));
        assert_eq!(rows[1].channel, None);

        // A second window appends without a second header.
        logger
            .write_window(start, &[(0, stats, disp)], None)
            .unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text.lines()
                .filter(|l| l.starts_with("timestamp,"))
                .count(),
            1
        );
        let rows = read_rows(&path).unwrap();
        assert_eq!(rows.len(), 3);
    }
}
