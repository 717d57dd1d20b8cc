//! Towerguard: structural-health monitoring for instrumented towers.
//!
//! Continuous pipeline from dual-axis accelerometers to live streams,
//! windowed statistics, and a persistent directional fatigue estimate.
//!
//! ## Architecture
//!
//! - **DAQ**: per-device sampling threads, anti-aliased decimation, ring
//!   buffers, and a bounded-queue analysis worker
//! - **DSP**: FFT double integration to displacement, rainflow counting,
//!   ASME S-N fatigue over azimuth bins
//! - **Storage**: periodic TDMS waveform snapshots with month-granular
//!   retention
//! - **Wind**: simulated or Modbus-RTU anemometer with windowed statistics
//! - **IoT**: JSONL or MQTT publication with a remotely-controllable
//!   stream gate

pub mod config;
pub mod daq;
pub mod dsp;
pub mod iot;
pub mod service;
pub mod storage;
pub mod types;
pub mod wind;

// Re-export the service entry point
pub use service::MonitorService;

// Re-export commonly used types
pub use config::{Config, ConfigError};
pub use types::{
    ChannelConfig, ChannelKind, ChannelUnit, Chunk, Coupling, CumulativeDamage, DeviceStatus,
    DispStats, FatigueParams, FatigueSnapshot, FatigueWindow, WindSample, WindStats, WindowStats,
};

// Re-export the pipeline building blocks
pub use daq::{DeviceManager, SampleSource, Snapshot};
pub use dsp::{acc_to_disp, DispMethod};
pub use iot::Publisher;
