//! Shared data model for the monitoring pipeline.
//!
//! Plain serde value types exchanged between the acquisition layer, the
//! analysis worker, the damage logger, and the IoT publisher. Field names on
//! the serialized forms match the on-disk / on-wire records, so the structs
//! double as the persistence schema.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Standard gravity, for converting "g" channels to m/s².
pub const STANDARD_GRAVITY: f64 = 9.80665;

// ============================================================================
// Channel Configuration
// ============================================================================

/// Kind of physical channel. Only accelerometers exist today; the tag keeps
/// the config format open for strain/temperature channels later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    #[default]
    #[serde(alias = "accel")]
    Acc,
}

/// Engineering unit reported by a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChannelUnit {
    #[default]
    #[serde(rename = "g")]
    G,
    #[serde(rename = "m/s2", alias = "m/s^2", alias = "m/s²")]
    MetersPerSecondSquared,
}

impl ChannelUnit {
    /// Whether samples need the g → m/s² conversion before integration.
    pub fn is_g(self) -> bool {
        matches!(self, Self::G)
    }
}

/// Input coupling of the analog front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Coupling {
    #[default]
    Ac,
    Dc,
}

/// Per-channel configuration as persisted in the device config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub id: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(rename = "type", default)]
    pub kind: ChannelKind,
    #[serde(default)]
    pub unit: ChannelUnit,
    /// Sensor sensitivity in mV/g.
    #[serde(default = "default_sensitivity")]
    pub sensitivity: f64,
    #[serde(default)]
    pub coupling: Coupling,
    #[serde(default)]
    pub iepe: bool,
    /// IEPE excitation current in amperes.
    #[serde(default = "default_iepe_current")]
    pub iepe_current: f64,
    #[serde(default)]
    pub remark: String,
}

fn default_true() -> bool {
    true
}

fn default_sensitivity() -> f64 {
    100.0
}

fn default_iepe_current() -> f64 {
    0.004
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            id: 0,
            enabled: true,
            kind: ChannelKind::Acc,
            unit: ChannelUnit::G,
            sensitivity: default_sensitivity(),
            coupling: Coupling::Ac,
            iepe: true,
            iepe_current: default_iepe_current(),
            remark: String::new(),
        }
    }
}

// ============================================================================
// Chunks
// ============================================================================

/// One hardware read: N channels × `samples_per_read` samples each.
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    pub channels: Vec<Vec<f64>>,
}

impl Chunk {
    pub fn new(channels: Vec<Vec<f64>>) -> Self {
        Self { channels }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Samples per channel (0 for an empty chunk).
    pub fn samples_per_channel(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.samples_per_channel() == 0
    }
}

// ============================================================================
// Window Statistics
// ============================================================================

/// Running min/max/sum-of-squares accumulator over one log window.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct WindowStats {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub sum_sq: f64,
}

impl Default for WindowStats {
    fn default() -> Self {
        Self {
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            sum_sq: 0.0,
        }
    }
}

impl WindowStats {
    pub fn accumulate(&mut self, samples: &[f64]) {
        for &s in samples {
            if s > self.max {
                self.max = s;
            }
            if s < self.min {
                self.min = s;
            }
            self.sum_sq += s * s;
        }
        self.count += samples.len() as u64;
    }

    /// RMS of everything accumulated so far; 0 before the first sample.
    pub fn rms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            (self.sum_sq / self.count as f64).sqrt()
        }
    }

    pub fn peak_to_peak(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.max - self.min
        }
    }
}

/// Displacement statistics over one window.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DispStats {
    pub max: f64,
    pub min: f64,
    pub rms: f64,
    pub p2p: f64,
}

impl DispStats {
    pub fn from_signal(disp: &[f64]) -> Self {
        if disp.is_empty() {
            return Self::default();
        }
        let mut max = f64::NEG_INFINITY;
        let mut min = f64::INFINITY;
        let mut sum_sq = 0.0;
        for &u in disp {
            max = max.max(u);
            min = min.min(u);
            sum_sq += u * u;
        }
        Self {
            max,
            min,
            rms: (sum_sq / disp.len() as f64).sqrt(),
            p2p: max - min,
        }
    }
}

// ============================================================================
// Fatigue
// ============================================================================

/// Parameters of the directional damage computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FatigueParams {
    /// Effective sample rate of the displacement signals (Hz).
    pub fs: f64,
    /// Displacement → stress conversion (MPa per displacement unit).
    pub k_disp2stress: f64,
    /// Elastic modulus (MPa).
    pub et: f64,
    /// Azimuth bin width (degrees).
    pub dphi_deg: f64,
    /// Stress-amplitude admission bounds (MPa); amplitudes outside
    /// [min, max] contribute no damage.
    #[serde(default = "default_sa_admit_min")]
    pub sa_admit_min: f64,
    #[serde(default = "default_sa_admit_max")]
    pub sa_admit_max: f64,
}

fn default_sa_admit_min() -> f64 {
    48.0
}

fn default_sa_admit_max() -> f64 {
    3999.0
}

impl Default for FatigueParams {
    fn default() -> Self {
        Self {
            fs: 0.0,
            k_disp2stress: 90.62 / 0.4,
            et: 2.05e5,
            dphi_deg: 5.0,
            sa_admit_min: default_sa_admit_min(),
            sa_admit_max: default_sa_admit_max(),
        }
    }
}

impl FatigueParams {
    pub fn at_rate(fs: f64) -> Self {
        Self {
            fs,
            ..Self::default()
        }
    }

    /// Number of azimuth bins for this bin width.
    pub fn bin_count(&self) -> usize {
        (360.0 / self.dphi_deg).round() as usize
    }
}

/// Result of one window's directional damage sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FatigueWindow {
    #[serde(rename = "Dmax")]
    pub dmax: f64,
    /// Azimuth (degrees) of the most damaging direction.
    pub phi_deg: f64,
    /// Peak stress amplitude (MPa) at the most damaging direction.
    #[serde(rename = "Sa_max")]
    pub sa_max: f64,
    pub phi_deg_list: Vec<f64>,
    #[serde(rename = "D_phi")]
    pub d_phi: Vec<f64>,
    pub params: FatigueParams,
}

/// S-N curve sampled for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnCurve {
    #[serde(rename = "Sa")]
    pub sa: Vec<f64>,
    #[serde(rename = "N")]
    pub n: Vec<f64>,
}

/// Persistent cumulative damage record (`damage_cumulative.txt`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CumulativeDamage {
    pub timestamp: String,
    pub device: String,
    pub phi_deg_list: Vec<f64>,
    #[serde(rename = "D_phi_cum")]
    pub d_phi_cum: Vec<f64>,
    #[serde(rename = "D_cum_max")]
    pub d_cum_max: f64,
    pub phi_deg_cum: f64,
}

/// Fatigue state returned to callers: last window merged with the persistent
/// cumulative fields and a display S-N curve.
#[derive(Debug, Clone, Serialize)]
pub struct FatigueSnapshot {
    pub timestamp: Option<String>,
    pub device: String,
    #[serde(rename = "Dmax")]
    pub dmax: f64,
    pub phi_deg: f64,
    #[serde(rename = "Sa_max")]
    pub sa_max: f64,
    pub phi_deg_list: Vec<f64>,
    #[serde(rename = "D_phi")]
    pub d_phi: Vec<f64>,
    #[serde(rename = "D_phi_cum")]
    pub d_phi_cum: Vec<f64>,
    #[serde(rename = "D_cum_max")]
    pub d_cum_max: f64,
    pub phi_deg_cum: f64,
    pub params: FatigueParams,
    pub sn_curve: SnCurve,
}

// ============================================================================
// Wind
// ============================================================================

/// One anemometer reading.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WindSample {
    pub ts: DateTime<Utc>,
    pub speed_mps: f64,
    /// Direction in degrees, wrapped to [0, 360).
    pub direction_deg: f64,
}

/// Wind statistics over one stats window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindStats {
    pub ts_start: DateTime<Utc>,
    pub ts_end: DateTime<Utc>,
    pub speed_min: f64,
    pub speed_max: f64,
    pub speed_mean: f64,
    /// Circular mean direction; `None` when the resultant vector vanishes
    /// (uniformly opposed directions have no meaningful mean).
    pub direction_mean_deg: Option<f64>,
    pub n: usize,
}

// ============================================================================
// Device Status
// ============================================================================

/// Per-device status reported to the external facade.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub running: bool,
    pub actual_rate: Option<f64>,
    pub sample_rate: f64,
    pub effective_sample_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_config_round_trips_with_tagged_kind() {
        let json = r#"{
            "id": 1,
            "enabled": true,
            "type": "acc",
            "unit": "g",
            "sensitivity": 100.0,
            "coupling": "AC",
            "iepe": true,
            "iepe_current": 0.004,
            "remark": "NE leg"
        }"#;
        let ch: ChannelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(ch.kind, ChannelKind::Acc);
        assert!(ch.unit.is_g());
        assert_eq!(ch.coupling, Coupling::Ac);

        let back = serde_json::to_string(&ch).unwrap();
        assert!(back.contains("\"type\":\"acc\""));
        assert!(back.contains("\"unit\":\"g\""));
    }

    #[test]
    fn window_stats_match_whole_window_reduction() {
        let a = [0.5, -1.25, 2.0];
        let b = [0.25, 3.5];
        let mut st = WindowStats::default();
        st.accumulate(&a);
        st.accumulate(&b);

        let all: Vec<f64> = a.iter().chain(b.iter()).copied().collect();
        let sum_sq: f64 = all.iter().map(|x| x * x).sum();
        assert_eq!(st.count, all.len() as u64);
        assert_eq!(st.max, 3.5);
        assert_eq!(st.min, -1.25);
        assert!((st.sum_sq - sum_sq).abs() < 1e-12);
        assert!((st.rms() - (sum_sq / all.len() as f64).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn empty_window_stats_are_zeroed() {
        let st = WindowStats::default();
        assert_eq!(st.rms(), 0.0);
        assert_eq!(st.peak_to_peak(), 0.0);
    }

    #[test]
    fn disp_stats_of_symmetric_signal() {
        let s = [1.0, -1.0, 1.0, -1.0];
        let d = DispStats::from_signal(&s);
        assert_eq!(d.max, 1.0);
        assert_eq!(d.min, -1.0);
        assert_eq!(d.p2p, 2.0);
        assert!((d.rms - 1.0).abs() < 1e-12);
    }

    #[test]
    fn fatigue_params_default_bins() {
        let p = FatigueParams::default();
        assert_eq!(p.bin_count(), 72);
        assert!((p.k_disp2stress - 226.55).abs() < 1e-10);
    }
}
