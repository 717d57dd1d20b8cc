//! Per-device orchestration: sampling, decimation, ring buffers, analysis.
//!
//! The sampler callback runs the whole hot path on the sampling thread:
//! decimate, append to the stream/storage rings, assemble the live stream
//! payload, and hand the decimated chunk to the analysis queue. Readers take
//! bounded tail snapshots through the ring locks; nothing else touches the
//! rings.

use crate::daq::damage::{DamageLogger, PersistError};
use crate::daq::ring::ChannelRings;
use crate::daq::runner::Runner;
use crate::daq::source::{AcquireError, SampleSource};
use crate::daq::worker::{AnalysisWorker, WorkerConfig};
use crate::dsp::{self, Decimator, DispMethod};
use crate::iot::Publisher;
use crate::types::{
    ChannelConfig, Chunk, DeviceStatus, FatigueSnapshot, STANDARD_GRAVITY,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Pipeline parameters shared by every device.
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    /// Hardware sample rate (Hz).
    pub sample_rate: f64,
    /// Post-decimation rate (Hz).
    pub effective_sample_rate: f64,
    pub samples_per_read: usize,
    /// Minimum seconds between spectrum payloads.
    pub fft_interval: f64,
    /// Live viewing window backing the stream rings (seconds).
    pub fft_window_s: f64,
    pub disp_method: DispMethod,
    /// Statistics/fatigue window length (seconds).
    pub log_interval_s: f64,
    /// Seconds of decimated data the storage rings can hold.
    pub storage_duration_s: f64,
}

/// Receives live stream events for the dashboard facade.
pub trait StreamSink: Send + Sync {
    fn emit(&self, event: &str, payload: &Value);
}

/// Consistent tail of a device's storage rings, ready for waveform storage.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub device: String,
    pub display_name: String,
    pub channels: Vec<ChannelConfig>,
    pub sample_rate: f64,
    pub effective_sample_rate: f64,
    /// Absolute start time of the captured tail.
    pub start_time: DateTime<Utc>,
    pub data: Vec<Vec<f64>>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.data.iter().all(Vec::is_empty)
    }
}

// ============================================================================
// Device
// ============================================================================

pub struct Device {
    name: String,
    display_name: String,
    channels: Vec<ChannelConfig>,
    settings: DeviceSettings,
    stream_rings: ChannelRings,
    storage_rings: ChannelRings,
    damage: Arc<Mutex<DamageLogger>>,
    publisher: Arc<Publisher>,
    sink: Option<Arc<dyn StreamSink>>,
    runner: Runner,
    worker: Option<AnalysisWorker>,
    running: bool,
}

impl Device {
    /// Build the device and open its damage store under
    /// `data_root/<device name>/`.
    pub fn new(
        name: &str,
        display_name: &str,
        channels: Vec<ChannelConfig>,
        settings: DeviceSettings,
        data_root: &Path,
        publisher: Arc<Publisher>,
    ) -> Result<Self, PersistError> {
        let enabled: Vec<ChannelConfig> = channels.into_iter().filter(|c| c.enabled).collect();
        let n = enabled.len();
        let stream_capacity =
            (settings.effective_sample_rate * settings.fft_window_s).ceil() as usize;
        let storage_capacity =
            (settings.effective_sample_rate * settings.storage_duration_s).ceil() as usize;

        let damage = Arc::new(Mutex::new(DamageLogger::open(
            name,
            &data_root.join(name),
            5.0,
        )?));

        Ok(Self {
            name: name.to_string(),
            display_name: if display_name.is_empty() {
                name.to_string()
            } else {
                display_name.to_string()
            },
            channels: enabled,
            runner: Runner::new(name, settings.samples_per_read),
            settings,
            stream_rings: ChannelRings::new(n, stream_capacity.max(1)),
            storage_rings: ChannelRings::new(n, storage_capacity.max(1)),
            damage,
            publisher,
            sink: None,
            worker: None,
            running: false,
        })
    }

    pub fn set_stream_sink(&mut self, sink: Arc<dyn StreamSink>) {
        self.sink = Some(sink);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Enabled channels, in acquisition order.
    pub fn channels(&self) -> &[ChannelConfig] {
        &self.channels
    }

    /// Start sampling from `source` and spin up the analysis worker.
    pub fn start(&mut self, source: Box<dyn SampleSource>) -> Result<(), AcquireError> {
        if self.running {
            return Ok(());
        }

        let worker = AnalysisWorker::start(
            WorkerConfig {
                device_name: self.name.clone(),
                sample_rate: self.settings.effective_sample_rate,
                log_interval: Duration::from_secs_f64(self.settings.log_interval_s),
                disp_method: self.settings.disp_method,
                channels: self.channels.clone(),
            },
            Arc::clone(&self.damage),
            Arc::clone(&self.publisher),
        );

        let mut decimator = Decimator::new(
            self.channels.len(),
            self.settings.sample_rate,
            self.settings.effective_sample_rate,
        );
        let queue = worker.queue();
        let stream_rings = self.stream_rings.clone();
        let storage_rings = self.storage_rings.clone();
        let publisher = Arc::clone(&self.publisher);
        let sink = self.sink.clone();
        let ctx = StreamContext {
            device: self.name.clone(),
            display_name: self.display_name.clone(),
            channels: self.channels.clone(),
            effective_sample_rate: self.settings.effective_sample_rate,
            samples_per_read: self.settings.samples_per_read,
            disp_method: self.settings.disp_method,
        };
        let fft_interval = Duration::from_secs_f64(self.settings.fft_interval.max(0.0));
        let mut last_fft: Option<Instant> = None;

        self.runner.start(
            source,
            Box::new(move |chunk: Chunk| {
                let decimated = decimator.process(&chunk.channels);
                stream_rings.extend(&decimated);
                storage_rings.extend(&decimated);

                let with_fft = last_fft.map_or(true, |t| t.elapsed() >= fft_interval);
                if with_fft {
                    last_fft = Some(Instant::now());
                }
                emit_stream(&ctx, &stream_rings, with_fft, sink.as_deref(), &publisher);

                queue.submit(decimated);
            }),
        )?;

        self.worker = Some(worker);
        self.running = true;
        info!(device = %self.name, "device started");
        Ok(())
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.runner.stop();
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
        info!(device = %self.name, "device stopped");
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus {
            running: self.running && self.runner.is_running(),
            actual_rate: self.runner.actual_rate(),
            sample_rate: self.settings.sample_rate,
            effective_sample_rate: self.settings.effective_sample_rate,
        }
    }

    /// Capture the last `duration_s` seconds from the storage rings.
    pub fn capture_snapshot(&self, duration_s: f64) -> Snapshot {
        let max_len = (self.settings.effective_sample_rate * duration_s).ceil() as usize;
        let data = self.storage_rings.tails(max_len);
        let captured = data.iter().map(Vec::len).max().unwrap_or(0);
        let span = captured as f64 / self.settings.effective_sample_rate;
        Snapshot {
            device: self.name.clone(),
            display_name: self.display_name.clone(),
            channels: self.channels.clone(),
            sample_rate: self.settings.sample_rate,
            effective_sample_rate: self.settings.effective_sample_rate,
            start_time: Utc::now() - chrono::Duration::milliseconds((span * 1000.0) as i64),
            data,
        }
    }

    /// Last window's fatigue merged with the persistent cumulative state and
    /// a display S-N curve.
    pub fn fatigue_snapshot(&self) -> FatigueSnapshot {
        let params = crate::types::FatigueParams::at_rate(self.settings.effective_sample_rate);
        let sn_curve = dsp::build_sn_curve(params.et);
        let record = self.damage.lock().cumulative().clone();

        let mut snapshot = FatigueSnapshot {
            timestamp: Some(record.timestamp.clone()),
            device: self.name.clone(),
            dmax: 0.0,
            phi_deg: 0.0,
            sa_max: 0.0,
            phi_deg_list: record.phi_deg_list.clone(),
            d_phi: Vec::new(),
            d_phi_cum: record.d_phi_cum.clone(),
            d_cum_max: record.d_cum_max,
            phi_deg_cum: record.phi_deg_cum,
            params,
            sn_curve,
        };

        let last = self
            .worker
            .as_ref()
            .and_then(|w| w.last_window().lock().clone());
        if let Some(last) = last {
            snapshot.timestamp = Some(last.timestamp);
            snapshot.dmax = last.window.dmax;
            snapshot.phi_deg = last.window.phi_deg;
            snapshot.sa_max = last.window.sa_max;
            snapshot.phi_deg_list = last.window.phi_deg_list;
            snapshot.d_phi = last.window.d_phi;
            snapshot.params = last.window.params;
            snapshot.d_phi_cum = last.cumulative.d_phi_cum;
            snapshot.d_cum_max = last.cumulative.d_cum_max;
            snapshot.phi_deg_cum = last.cumulative.phi_deg_cum;
        }
        snapshot
    }

    /// Zero the cumulative store, clear the last window, and return the
    /// fresh snapshot.
    pub fn reset_damage(&mut self) -> Result<FatigueSnapshot, PersistError> {
        self.damage.lock().reset()?;
        if let Some(worker) = &self.worker {
            worker.clear_last_window();
        }
        Ok(self.fatigue_snapshot())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Stream Payload Assembly
// ============================================================================

/// Static context captured into the sampler callback.
#[derive(Debug, Clone)]
struct StreamContext {
    device: String,
    display_name: String,
    channels: Vec<ChannelConfig>,
    effective_sample_rate: f64,
    samples_per_read: usize,
    disp_method: DispMethod,
}

fn emit_stream(
    ctx: &StreamContext,
    rings: &ChannelRings,
    with_fft: bool,
    sink: Option<&dyn StreamSink>,
    publisher: &Publisher,
) {
    let time_data = rings.tails(ctx.samples_per_read);
    let displacement = displacement_tracks(ctx, &time_data);

    let mut payload = json!({
        "device": ctx.device,
        "time_data": time_data,
        "displacement": displacement,
    });

    let mut spectrum_payload = None;
    if with_fft {
        let (freq, spectra) = spectra(ctx, &time_data);
        payload["fft"] = json!(spectra);
        spectrum_payload = Some(json!({
            "device": ctx.device,
            "freq": freq,
            "spectra": spectra,
        }));
    }

    if let Some(sink) = sink {
        sink.emit(&format!("stream_{}", ctx.device), &payload);
        if let Some(ref sp) = spectrum_payload {
            sink.emit(&format!("spectrum_{}", ctx.device), sp);
        }
    }

    // Gated live-stream topics; dropped unless streaming is enabled.
    let base = &ctx.display_name;
    publisher.publish_to(
        &json!({ "device": ctx.device, "time_data": payload["time_data"] }),
        Some(&format!("{base}/stream/vib")),
    );
    publisher.publish_to(
        &json!({ "device": ctx.device, "displacement": payload["displacement"] }),
        Some(&format!("{base}/stream/disp_track")),
    );
    if let Some(sp) = spectrum_payload {
        publisher.publish_to(&sp, Some(&format!("{base}/stream/freq")));
    }
}

/// Displacement tracks for the first two channels, unit-converted and
/// integrated at the effective rate.
fn displacement_tracks(ctx: &StreamContext, time_data: &[Vec<f64>]) -> Vec<Vec<f64>> {
    time_data
        .iter()
        .take(2)
        .enumerate()
        .map(|(i, samples)| {
            if samples.is_empty() {
                return Vec::new();
            }
            let is_g = ctx.channels.get(i).map_or(true, |c| c.unit.is_g());
            let acc: Vec<f64> = if is_g {
                samples.iter().map(|&a| a * STANDARD_GRAVITY).collect()
            } else {
                samples.clone()
            };
            dsp::acc_to_disp(&acc, ctx.effective_sample_rate, ctx.disp_method)
        })
        .collect()
}

/// dB magnitude spectra of each channel's tail plus the shared frequency
/// axis at the effective rate.
fn spectra(ctx: &StreamContext, time_data: &[Vec<f64>]) -> (Vec<f64>, Vec<Vec<f64>>) {
    let mut freq = Vec::new();
    let mut spectra = Vec::new();
    for samples in time_data {
        if samples.len() < 2 {
            spectra.push(Vec::new());
            continue;
        }
        if freq.is_empty() {
            freq = dsp::spectrum::frequency_axis(samples.len(), ctx.effective_sample_rate);
        }
        spectra.push(dsp::spectrum::magnitudes_db(samples));
    }
    (freq, spectra)
}
