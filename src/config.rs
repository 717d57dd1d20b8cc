//! Persisted JSON configuration.
//!
//! Every field carries a serde default, so older config files load with
//! missing keys filled in — the JSON equivalent of a deep merge against the
//! defaults. `Config::load` creates the file on first run.
//!
//! Rate validation follows the acquisition hardware's floor: a requested
//! hardware rate below 1600 Hz is remapped to 1600 Hz with the requested
//! value becoming the effective (post-decimation) rate, and the effective
//! rate is always clamped to the hardware rate.

use crate::dsp::DispMethod;
use crate::types::{ChannelConfig, Coupling};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Minimum hardware sample rate supported by the acquisition cards (Hz).
pub const MIN_HARDWARE_RATE: u32 = 1600;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// Top-Level Config
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Requested hardware sample rate (Hz).
    pub sample_rate: u32,
    /// Post-decimation rate (Hz); 0 or absent means "same as hardware".
    pub effective_sample_rate: u32,
    /// Samples per channel delivered by one hardware read.
    pub samples_per_read: usize,
    /// Minimum seconds between spectrum payloads on the stream.
    pub fft_interval: f64,
    /// Viewing window backing the live stream buffers (seconds).
    pub fft_window_s: f64,
    pub disp_method: DispMethod,
    pub storage: StorageConfig,
    pub wind: WindConfig,
    pub iot: IotConfig,
    pub devices: BTreeMap<String, DeviceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sample_rate: 2000,
            effective_sample_rate: 0,
            samples_per_read: 4000,
            fft_interval: 0.5,
            fft_window_s: 30.0,
            disp_method: DispMethod::Fft,
            storage: StorageConfig::default(),
            wind: WindConfig::default(),
            iot: IotConfig::default(),
            devices: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load from `path`, creating the file with defaults when absent.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let cfg = Self::default();
            cfg.save(path)?;
            info!(path = %path.display(), "created default config");
            return Ok(cfg);
        }
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let cfg: Self = serde_json::from_str(&contents)?;
        Ok(cfg)
    }

    /// Persist as pretty JSON, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::Io(parent.to_path_buf(), e))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|e| ConfigError::Io(path.to_path_buf(), e))
    }

    /// Hardware and effective rates after validation rules.
    pub fn rates(&self) -> Result<(f64, f64), ConfigError> {
        if self.sample_rate == 0 {
            return Err(ConfigError::Invalid("sample_rate must be positive".into()));
        }
        let (hw, eff) = if self.sample_rate < MIN_HARDWARE_RATE {
            // The card cannot clock this slowly: sample at the floor and
            // decimate down to the rate the operator asked for.
            (MIN_HARDWARE_RATE, self.sample_rate)
        } else {
            let eff = if self.effective_sample_rate == 0 {
                self.sample_rate
            } else {
                self.effective_sample_rate
            };
            (self.sample_rate, eff)
        };
        let eff = eff.min(hw);
        Ok((f64::from(hw), f64::from(eff)))
    }

    /// Structural checks beyond what serde enforces.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rates()?;
        if self.samples_per_read == 0 {
            return Err(ConfigError::Invalid(
                "samples_per_read must be positive".into(),
            ));
        }
        for (name, dev) in &self.devices {
            for ch in &dev.channels {
                if ch.coupling == Coupling::Dc && ch.iepe {
                    return Err(ConfigError::Invalid(format!(
                        "{name} CH{}: DC coupling cannot be used with IEPE on",
                        ch.id
                    )));
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Devices
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub model: String,
    /// Name shown on dashboards and used as the IoT topic base; falls back
    /// to the device key when empty.
    pub display_name: String,
    pub channels: Vec<ChannelConfig>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            model: "9230".to_string(),
            display_name: String::new(),
            channels: Vec::new(),
        }
    }
}

// ============================================================================
// Storage
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub enabled: bool,
    /// Seconds between waveform snapshots.
    pub interval_s: f64,
    /// Seconds of ring-buffer tail captured per snapshot.
    pub duration_s: f64,
    pub output_dir: PathBuf,
    /// `{display_name}` and `{ts}` are substituted.
    pub filename_format: String,
    pub retention_months: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_s: 600.0,
            duration_s: 30.0,
            output_dir: PathBuf::from("data"),
            filename_format: "{display_name}_{ts}.tdms".to_string(),
            retention_months: 3,
        }
    }
}

// ============================================================================
// Wind
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindMode {
    #[default]
    Sim,
    Rs485,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindConfig {
    pub enabled: bool,
    pub mode: WindMode,
    pub sample_interval_s: f64,
    pub stats_interval_s: f64,
    pub sim_seed: Option<u64>,
    pub rs485: Rs485Config,
}

impl Default for WindConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: WindMode::Sim,
            sample_interval_s: 1.0,
            stats_interval_s: 600.0,
            sim_seed: Some(1),
            rs485: Rs485Config::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Rs485Config {
    pub port: String,
    pub baudrate: u32,
    pub slave_id: u8,
    pub bytesize: u8,
    /// "N", "E", or "O".
    pub parity: String,
    pub stopbits: u8,
    pub timeout_s: f64,
    pub start_register: u16,
    pub register_count: u16,
}

impl Default for Rs485Config {
    fn default() -> Self {
        Self {
            port: "COM3".to_string(),
            baudrate: 9600,
            slave_id: 1,
            bytesize: 8,
            parity: "N".to_string(),
            stopbits: 1,
            timeout_s: 0.5,
            start_register: 0,
            register_count: 5,
        }
    }
}

// ============================================================================
// IoT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IotKind {
    /// Append payload records to a local JSONL file.
    #[default]
    Log,
    /// Publish to an MQTT v3.1.1 broker.
    Mqtt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IotConfig {
    #[serde(rename = "type")]
    pub kind: IotKind,
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub control_topic: String,
    pub username: String,
    pub password: String,
    pub client_id: String,
    /// TLS material; empty paths disable TLS.
    pub ca_cert: String,
    pub certfile: String,
    pub keyfile: String,
}

impl Default for IotConfig {
    fn default() -> Self {
        Self {
            kind: IotKind::Log,
            host: "127.0.0.1".to_string(),
            port: 1883,
            topic: "towerguard/data".to_string(),
            control_topic: "+/control/stream".to_string(),
            username: String::new(),
            password: String::new(),
            client_id: "towerguard-client".to_string(),
            ca_cert: String::new(),
            certfile: String::new(),
            keyfile: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_fill_from_defaults() {
        let cfg: Config = serde_json::from_str(r#"{"sample_rate": 3200}"#).unwrap();
        assert_eq!(cfg.sample_rate, 3200);
        assert_eq!(cfg.samples_per_read, 4000);
        assert_eq!(cfg.wind.sample_interval_s, 1.0);
        assert_eq!(cfg.iot.kind, IotKind::Log);
        assert_eq!(cfg.storage.retention_months, 3);
    }

    #[test]
    fn low_rate_remaps_to_hardware_floor() {
        let cfg = Config {
            sample_rate: 800,
            ..Config::default()
        };
        let (hw, eff) = cfg.rates().unwrap();
        assert_eq!(hw, 1600.0);
        assert_eq!(eff, 800.0);
    }

    #[test]
    fn effective_rate_clamps_to_hardware() {
        let cfg = Config {
            sample_rate: 2000,
            effective_sample_rate: 5000,
            ..Config::default()
        };
        let (hw, eff) = cfg.rates().unwrap();
        assert_eq!(hw, 2000.0);
        assert_eq!(eff, 2000.0);
    }

    #[test]
    fn absent_effective_rate_tracks_hardware() {
        let cfg = Config {
            sample_rate: 3200,
            ..Config::default()
        };
        let (hw, eff) = cfg.rates().unwrap();
        assert_eq!(hw, 3200.0);
        assert_eq!(eff, 3200.0);
    }

    #[test]
    fn zero_rate_is_rejected() {
        let cfg = Config {
            sample_rate: 0,
            ..Config::default()
        };
        assert!(cfg.rates().is_err());
    }

    #[test]
    fn dc_coupling_with_iepe_is_rejected() {
        use crate::types::ChannelConfig;
        let mut cfg = Config::default();
        cfg.devices.insert(
            "tower1".to_string(),
            DeviceConfig {
                channels: vec![ChannelConfig {
                    coupling: Coupling::Dc,
                    iepe: true,
                    ..ChannelConfig::default()
                }],
                ..DeviceConfig::default()
            },
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_creates_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let created = Config::load(&path).unwrap();
        assert!(path.exists());

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.sample_rate, created.sample_rate);
        assert_eq!(loaded.iot.topic, "towerguard/data");
    }
}
