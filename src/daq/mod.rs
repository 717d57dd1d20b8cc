//! Acquisition layer: sources, sampling threads, ring buffers, analysis
//! workers, and the persistent damage log.

pub mod damage;
pub mod device;
pub mod manager;
pub mod ring;
pub mod runner;
pub mod source;
pub mod worker;

pub use damage::DamageLogger;
pub use device::{Device, DeviceSettings, Snapshot, StreamSink};
pub use manager::{simulated_factory, DeviceManager, DeviceRegistry, SourceFactory};
pub use runner::Runner;
pub use source::{AcquireError, ReplaySource, SampleSource, SimulatedSource};
pub use worker::{AnalysisWorker, WorkerConfig};
