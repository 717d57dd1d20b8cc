//! Analysis worker: per-window statistics, directional fatigue, logging.
//!
//! One worker thread per device drains a bounded queue of decimated chunks.
//! Submission never blocks the sampler: when the queue is full the oldest
//! queued chunk is discarded so analysis always sees the freshest data.
//!
//! At every window boundary (wall clock ≥ `log_interval`) the worker computes
//! directional fatigue from channels 0/1, folds it into the persistent
//! cumulative store, derives displacement statistics for every channel,
//! appends the CSV row set, and emits one IoT summary payload — in that
//! order. Errors inside a window are logged and the window is skipped, but
//! accumulators are always cleared so the next window starts clean.

use crate::daq::damage::DamageLogger;
use crate::dsp::{self, DispMethod};
use crate::iot::Publisher;
use crate::types::{
    ChannelConfig, CumulativeDamage, DispStats, FatigueParams, FatigueWindow, WindowStats,
    STANDARD_GRAVITY,
};
use chrono::{DateTime, Local};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, warn};

/// Queue depth between the sampler callback and the worker.
const QUEUE_CAPACITY: usize = 3;

/// How long the worker blocks on the queue before re-checking its flag.
const QUEUE_POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Grace period for joining the worker thread on stop.
const JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Static configuration for one device's analysis.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub device_name: String,
    /// Effective (post-decimation) sample rate.
    pub sample_rate: f64,
    pub log_interval: Duration,
    pub disp_method: DispMethod,
    pub channels: Vec<ChannelConfig>,
}

/// Last completed window, kept for snapshot assembly.
#[derive(Debug, Clone)]
pub struct LastWindow {
    pub timestamp: String,
    pub window: FatigueWindow,
    pub cumulative: CumulativeDamage,
}

/// Shared handle to the last window result.
pub type LastWindowSlot = Arc<Mutex<Option<LastWindow>>>;

// ============================================================================
// Core (thread-free, unit-testable)
// ============================================================================

/// Window accumulation and boundary processing, independent of the thread
/// and queue machinery.
pub struct AnalysisCore {
    cfg: WorkerConfig,
    damage: Arc<Mutex<DamageLogger>>,
    publisher: Arc<Publisher>,
    last_window: LastWindowSlot,
    stats: Vec<WindowStats>,
    buffers: Vec<Vec<f64>>,
    last_chunk_len: Option<usize>,
}

impl AnalysisCore {
    pub fn new(
        cfg: WorkerConfig,
        damage: Arc<Mutex<DamageLogger>>,
        publisher: Arc<Publisher>,
        last_window: LastWindowSlot,
    ) -> Self {
        let n = cfg.channels.len().max(2);
        Self {
            cfg,
            damage,
            publisher,
            last_window,
            stats: vec![WindowStats::default(); n],
            buffers: vec![Vec::new(); n],
            last_chunk_len: None,
        }
    }

    /// Fold one decimated chunk into the window accumulators.
    pub fn ingest(&mut self, chunk: &[Vec<f64>]) {
        while self.stats.len() < chunk.len() {
            self.stats.push(WindowStats::default());
            self.buffers.push(Vec::new());
        }
        for (i, samples) in chunk.iter().enumerate() {
            self.stats[i].accumulate(samples);
            self.buffers[i].extend_from_slice(samples);
        }
        if let Some(first) = chunk.first() {
            if !first.is_empty() {
                self.last_chunk_len = Some(first.len());
            }
        }
    }

    /// Length of the most recent non-empty chunk.
    pub fn last_chunk_len(&self) -> Option<usize> {
        self.last_chunk_len
    }

    fn unit_is_g(&self, channel: usize) -> bool {
        self.cfg
            .channels
            .get(channel)
            .map_or(true, |c| c.unit.is_g())
    }

    /// Channel buffer in m/s², converted from g where the config says so.
    fn si_buffer(&self, channel: usize) -> Vec<f64> {
        let raw = &self.buffers[channel];
        if self.unit_is_g(channel) {
            raw.iter().map(|&a| a * STANDARD_GRAVITY).collect()
        } else {
            raw.clone()
        }
    }

    /// Close the window that started at `start`: fatigue, persistence, CSV,
    /// IoT — then clear the accumulators.
    pub fn flush_window(&mut self, start: DateTime<Local>, now: DateTime<Local>) {
        let fatigue = self.compute_fatigue(now);
        let disp_stats = self.compute_disp_stats();
        self.write_csv(start, &disp_stats, fatigue.as_ref().map(|l| &l.window));
        self.publish_summary(now, &disp_stats);

        if let Some(last) = fatigue {
            *self.last_window.lock() = Some(last);
        }

        for st in &mut self.stats {
            *st = WindowStats::default();
        }
        for buf in &mut self.buffers {
            buf.clear();
        }
    }

    fn compute_fatigue(&self, now: DateTime<Local>) -> Option<LastWindow> {
        if self.buffers.len() < 2 {
            return None;
        }
        let ax = self.si_buffer(0);
        let ay = self.si_buffer(1);
        let params = FatigueParams::at_rate(self.cfg.sample_rate);
        let window = dsp::fatigue_from_accel(&ax, &ay, self.cfg.disp_method, &params);

        match self.damage.lock().update_cumulative(&window, now) {
            Ok(cumulative) => Some(LastWindow {
                timestamp: now.format("%Y-%m-%dT%H:%M:%S").to_string(),
                window,
                cumulative,
            }),
            Err(e) => {
                error!(device = %self.cfg.device_name, error = %e, "cumulative damage update failed");
                None
            }
        }
    }

    fn compute_disp_stats(&self) -> Vec<DispStats> {
        (0..self.buffers.len())
            .map(|i| {
                if self.buffers[i].is_empty() {
                    return DispStats::default();
                }
                let acc = self.si_buffer(i);
                let disp = dsp::acc_to_disp(&acc, self.cfg.sample_rate, self.cfg.disp_method);
                DispStats::from_signal(&disp)
            })
            .collect()
    }

    fn write_csv(
        &self,
        start: DateTime<Local>,
        disp_stats: &[DispStats],
        fatigue: Option<&FatigueWindow>,
    ) {
        let rows: Vec<(u32, WindowStats, DispStats)> = self
            .stats
            .iter()
            .enumerate()
            .map(|(i, st)| {
                let channel = self.cfg.channels.get(i).map_or(i as u32, |c| c.id);
                (channel, *st, disp_stats.get(i).copied().unwrap_or_default())
            })
            .collect();
        if let Err(e) = self.damage.lock().write_window(start, &rows, fatigue) {
            error!(device = %self.cfg.device_name, error = %e, "window csv append failed");
        }
    }

    fn publish_summary(&self, now: DateTime<Local>, disp_stats: &[DispStats]) {
        let channels: Vec<serde_json::Value> = self
            .stats
            .iter()
            .enumerate()
            .map(|(i, st)| {
                let ch = self.cfg.channels.get(i).map_or(i as u32, |c| c.id);
                let main_freq = dsp::spectrum::dominant_frequency(
                    &self.buffers[i],
                    self.cfg.sample_rate,
                );
                if st.count == 0 {
                    json!({ "ch": ch, "acc_max": null, "acc_min": null, "acc_rms": null,
                            "acc_p2p": null, "disp_max": null, "disp_min": null,
                            "disp_rms": null, "disp_p2p": null, "main_freq_hz": main_freq })
                } else {
                    let disp = disp_stats.get(i).copied().unwrap_or_default();
                    json!({
                        "ch": ch,
                        "acc_max": st.max,
                        "acc_min": st.min,
                        "acc_rms": st.rms(),
                        "acc_p2p": st.peak_to_peak(),
                        "disp_max": disp.max,
                        "disp_min": disp.min,
                        "disp_rms": disp.rms,
                        "disp_p2p": disp.p2p,
                        "main_freq_hz": main_freq,
                    })
                }
            })
            .collect();

        let (phi, cum) = {
            let damage = self.damage.lock();
            let record = damage.cumulative();
            (record.phi_deg_list.clone(), record.d_phi_cum.clone())
        };
        let payload = json!({
            "device": self.cfg.device_name,
            "timestamp": now.format("%Y-%m-%dT%H:%M:%S").to_string(),
            "channels": channels,
            "fatigue_cumulative": { "phi_deg_list": phi, "D_phi_cum": cum },
        });
        self.publisher.publish(&payload);
    }
}

// ============================================================================
// Worker Thread
// ============================================================================

/// Cloneable submit handle onto a worker's bounded queue.
///
/// `submit` never blocks: under overload the oldest queued chunk is popped
/// to make room, trading latency-fairness for freshness.
#[derive(Clone)]
pub struct ChunkQueue {
    tx: Sender<Vec<Vec<f64>>>,
    rx: Receiver<Vec<Vec<f64>>>,
    device_name: String,
}

impl ChunkQueue {
    pub fn submit(&self, chunk: Vec<Vec<f64>>) {
        match self.tx.try_send(chunk) {
            Ok(()) => {}
            Err(TrySendError::Full(chunk)) => {
                let _ = self.rx.try_recv();
                if self.tx.try_send(chunk).is_err() {
                    warn!(device = %self.device_name, "analysis queue still full; chunk dropped");
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!(device = %self.device_name, "analysis queue disconnected");
            }
        }
    }
}

/// Thread + queue wrapper around [`AnalysisCore`].
pub struct AnalysisWorker {
    queue: ChunkQueue,
    running: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
    last_window: LastWindowSlot,
    device_name: String,
}

impl AnalysisWorker {
    pub fn start(
        cfg: WorkerConfig,
        damage: Arc<Mutex<DamageLogger>>,
        publisher: Arc<Publisher>,
    ) -> Self {
        let (tx, rx) = bounded::<Vec<Vec<f64>>>(QUEUE_CAPACITY);
        let running = Arc::new(AtomicBool::new(true));
        let last_window: LastWindowSlot = Arc::new(Mutex::new(None));
        let device_name = cfg.device_name.clone();

        let mut core = AnalysisCore::new(cfg.clone(), damage, publisher, Arc::clone(&last_window));
        let flag = Arc::clone(&running);
        let queue = rx.clone();
        let handle = std::thread::Builder::new()
            .name(format!("analysis-{device_name}"))
            .spawn(move || {
                let mut window_started = Instant::now();
                let mut window_start_wall = Local::now();
                while flag.load(Ordering::SeqCst) {
                    let chunk = match queue.recv_timeout(QUEUE_POLL_TIMEOUT) {
                        Ok(c) => c,
                        Err(_) => continue,
                    };
                    core.ingest(&chunk);

                    if window_started.elapsed() >= cfg.log_interval {
                        let start = window_start_wall;
                        window_started = Instant::now();
                        window_start_wall = Local::now();
                        core.flush_window(start, Local::now());
                    }
                }
            })
            .ok();
        if handle.is_none() {
            warn!(device = %device_name, "failed to spawn analysis worker thread");
        }

        Self {
            queue: ChunkQueue {
                tx,
                rx,
                device_name: device_name.clone(),
            },
            running,
            handle,
            last_window,
            device_name,
        }
    }

    /// Submit handle for the sampler callback.
    pub fn queue(&self) -> ChunkQueue {
        self.queue.clone()
    }

    /// Enqueue a chunk, discarding the oldest queued one under overload.
    pub fn submit(&self, chunk: Vec<Vec<f64>>) {
        self.queue.submit(chunk);
    }

    /// Handle to the last completed window (shared with the device).
    pub fn last_window(&self) -> LastWindowSlot {
        Arc::clone(&self.last_window)
    }

    /// Clear the last-window state (after a cumulative reset).
    pub fn clear_last_window(&self) {
        *self.last_window.lock() = None;
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let deadline = Instant::now() + JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!(device = %self.device_name, "analysis worker did not stop in time; leaking");
            }
        }
    }
}

impl Drop for AnalysisWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IotConfig;
    use crate::types::ChannelUnit;
    use std::f64::consts::PI;

    fn test_channels() -> Vec<ChannelConfig> {
        (0..2)
            .map(|id| ChannelConfig {
                id,
                unit: ChannelUnit::MetersPerSecondSquared,
                ..ChannelConfig::default()
            })
            .collect()
    }

    fn test_core(dir: &std::path::Path, fs: f64) -> AnalysisCore {
        let damage = Arc::new(Mutex::new(DamageLogger::open("tower1", dir, 5.0).unwrap()));
        let publisher = Publisher::new(IotConfig::default(), dir);
        AnalysisCore::new(
            WorkerConfig {
                device_name: "tower1".to_string(),
                sample_rate: fs,
                log_interval: Duration::from_secs(600),
                disp_method: DispMethod::Fft,
                channels: test_channels(),
            },
            damage,
            publisher,
            Arc::new(Mutex::new(None)),
        )
    }

    #[test]
    fn ingest_accumulates_stats_and_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let mut core = test_core(dir.path(), 1600.0);
        core.ingest(&[vec![1.0, -2.0], vec![0.5, 0.25]]);
        core.ingest(&[vec![3.0], vec![-0.5]]);
        assert_eq!(core.stats[0].count, 3);
        assert_eq!(core.stats[0].max, 3.0);
        assert_eq!(core.stats[0].min, -2.0);
        assert_eq!(core.buffers[1], vec![0.5, 0.25, -0.5]);
        assert_eq!(core.last_chunk_len, Some(1));
    }

    #[test]
    fn flush_clears_accumulators_and_records_last_window() {
        let dir = tempfile::tempdir().unwrap();
        let fs = 1600.0;
        let mut core = test_core(dir.path(), fs);

        // Strong 5 Hz motion on channel 0 over one second.
        let ax: Vec<f64> = (0..1600)
            .map(|i| 500.0 * (2.0 * PI * 5.0 * i as f64 / fs).sin())
            .collect();
        let ay = vec![0.0; 1600];
        core.ingest(&[ax, ay]);

        let start = Local::now();
        core.flush_window(start, Local::now());

        assert!(core.stats.iter().all(|s| s.count == 0));
        assert!(core.buffers.iter().all(Vec::is_empty));
        let last = core.last_window.lock().clone();
        let last = last.expect("window should produce fatigue");
        assert_eq!(last.window.d_phi.len(), 72);

        // CSV rows landed in today's file.
        let path = dir
            .path()
            .join(format!("{}.csv", start.format("%Y%m%d")));
        let rows = crate::daq::damage::read_rows(&path).unwrap();
        assert!(rows.iter().any(|r| r.row_type == "stat"));
        assert!(rows.iter().any(|r| r.row_type == "fatigue"));

        // The window summary went to the JSONL sink.
        let log = std::fs::read_to_string(dir.path().join("iot_log.jsonl")).unwrap();
        assert!(log.contains("fatigue_cumulative"));
    }

    #[test]
    fn drop_oldest_submit_keeps_freshest_three() {
        let dir = tempfile::tempdir().unwrap();
        let damage = Arc::new(Mutex::new(
            DamageLogger::open("tower1", dir.path(), 5.0).unwrap(),
        ));
        let publisher = Publisher::new(IotConfig::default(), dir.path());
        // Worker whose thread failed to start would still queue; here we
        // build the machinery but never let the thread drain by stopping it
        // immediately after spawn.
        let mut worker = AnalysisWorker::start(
            WorkerConfig {
                device_name: "tower1".to_string(),
                sample_rate: 1600.0,
                log_interval: Duration::from_secs(600),
                disp_method: DispMethod::Fft,
                channels: test_channels(),
            },
            damage,
            publisher,
        );
        worker.stop();

        for v in 1..=5 {
            worker.submit(vec![vec![f64::from(v)]]);
        }
        let mut remaining = Vec::new();
        while let Ok(chunk) = worker.queue.rx.try_recv() {
            remaining.push(chunk[0][0]);
        }
        assert_eq!(remaining, vec![3.0, 4.0, 5.0]);
    }
}
