//! Wind service: periodic anemometer sampling with windowed statistics.
//!
//! One sampler thread polls an abstract [`WindSensor`]. A read failure marks
//! the sensor disconnected and the next tick tries to reconnect — the loop
//! never aborts. Every `stats_every_n` successful samples the service
//! computes min/max/mean speed and the circular mean direction over a
//! sliding window and publishes the result.

pub mod modbus;
pub mod sim;

use crate::config::{WindConfig, WindMode};
use crate::iot::Publisher;
use crate::storage::WindStatsSource;
use crate::types::{WindSample, WindStats};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub use modbus::Rs485WindSensor;
pub use sim::SimulatedWindSensor;

#[derive(Debug, thiserror::Error)]
pub enum WindError {
    #[error("sensor not connected: {0}")]
    NotConnected(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("serial error: {0}")]
    Serial(String),
}

/// Abstract wind sensor surface. Drivers own their transport.
pub trait WindSensor: Send {
    /// Try to (re)establish the device link. Returns whether it is up.
    fn connect(&mut self) -> bool;

    fn read(&mut self) -> Result<WindSample, WindError>;

    fn close(&mut self);
}

/// Circular mean of directions in degrees, wrapped to [0, 360).
/// `None` when the set is empty or the resultant vector vanishes.
pub fn circular_mean_deg(angles_deg: &[f64]) -> Option<f64> {
    if angles_deg.is_empty() {
        return None;
    }
    let (mut s, mut c) = (0.0f64, 0.0f64);
    for a in angles_deg {
        let r = a.to_radians();
        s += r.sin();
        c += r.cos();
    }
    let n = angles_deg.len() as f64;
    if (s / n).abs() < 1e-12 && (c / n).abs() < 1e-12 {
        return None;
    }
    Some(s.atan2(c).to_degrees().rem_euclid(360.0))
}

/// Window statistics over an ordered sample run.
pub fn compute_stats(samples: &[WindSample]) -> Option<WindStats> {
    let first = samples.first()?;
    let last = samples.last()?;
    let speeds: Vec<f64> = samples.iter().map(|s| s.speed_mps).collect();
    let dirs: Vec<f64> = samples.iter().map(|s| s.direction_deg).collect();
    Some(WindStats {
        ts_start: first.ts,
        ts_end: last.ts,
        speed_min: speeds.iter().copied().fold(f64::INFINITY, f64::min),
        speed_max: speeds.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        speed_mean: speeds.iter().sum::<f64>() / speeds.len() as f64,
        direction_mean_deg: circular_mean_deg(&dirs),
        n: speeds.len(),
    })
}

// ============================================================================
// Service
// ============================================================================

/// Status reported to the external facade.
#[derive(Debug, Clone, Serialize)]
pub struct WindStatus {
    pub enabled: bool,
    pub mode: WindMode,
    pub connected: bool,
    pub sample_interval_s: f64,
    pub stats_interval_s: f64,
    pub sample: Option<WindSample>,
    pub stats: Option<WindStats>,
}

#[derive(Default)]
struct WindState {
    connected: bool,
    last_sample: Option<WindSample>,
    last_stats: Option<WindStats>,
    window: VecDeque<WindSample>,
}

pub struct WindService {
    cfg: WindConfig,
    state: Arc<Mutex<WindState>>,
    running: Arc<AtomicBool>,
    stop_tx: Option<Sender<()>>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl WindService {
    /// Build the sensor from config and start the sampler thread.
    /// Returns `None` when the wind service is disabled.
    pub fn start(cfg: WindConfig, publisher: Option<Arc<Publisher>>) -> Option<Arc<Self>> {
        if !cfg.enabled {
            return None;
        }
        let sensor: Box<dyn WindSensor> = match cfg.mode {
            WindMode::Sim => Box::new(SimulatedWindSensor::new(cfg.sim_seed)),
            WindMode::Rs485 => Box::new(Rs485WindSensor::open(cfg.rs485.clone())),
        };
        Some(Self::start_with_sensor(cfg, sensor, publisher))
    }

    /// Start with an explicit sensor (tests inject scripted ones).
    pub fn start_with_sensor(
        cfg: WindConfig,
        sensor: Box<dyn WindSensor>,
        publisher: Option<Arc<Publisher>>,
    ) -> Arc<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let service = Arc::new(Self {
            cfg: cfg.clone(),
            state: Arc::new(Mutex::new(WindState::default())),
            running: Arc::new(AtomicBool::new(true)),
            stop_tx: Some(stop_tx),
            handle: Mutex::new(None),
        });

        let state = Arc::clone(&service.state);
        let running = Arc::clone(&service.running);
        let mode = cfg.mode;
        let interval_s = cfg.sample_interval_s;
        let handle = std::thread::Builder::new()
            .name("wind".to_string())
            .spawn(move || {
                sampler_loop(&cfg, sensor, &state, &running, publisher.as_deref(), &stop_rx, mode);
            })
            .ok();
        *service.handle.lock() = handle;
        info!(mode = ?mode, interval_s = interval_s, "wind service started");
        service
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(tx) = &self.stop_tx {
            let _ = tx.try_send(());
        }
        if let Some(handle) = self.handle.lock().take() {
            let deadline = Instant::now() + Duration::from_secs(2);
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
                info!("wind service stopped");
            } else {
                warn!("wind thread did not stop in time; leaking");
            }
        }
    }

    pub fn status(&self) -> WindStatus {
        let state = self.state.lock();
        WindStatus {
            enabled: self.cfg.enabled,
            mode: self.cfg.mode,
            connected: state.connected,
            sample_interval_s: self.cfg.sample_interval_s,
            stats_interval_s: self.cfg.stats_interval_s,
            sample: state.last_sample,
            stats: state.last_stats.clone(),
        }
    }
}

impl WindStatsSource for WindService {
    fn latest_stats(&self) -> Option<WindStats> {
        self.state.lock().last_stats.clone()
    }
}

/// Samples per stats window.
pub fn stats_every_n(stats_interval_s: f64, sample_interval_s: f64) -> usize {
    ((stats_interval_s / sample_interval_s.max(1e-6)).round() as usize).max(1)
}

#[allow(clippy::too_many_arguments)]
fn sampler_loop(
    cfg: &WindConfig,
    mut sensor: Box<dyn WindSensor>,
    state: &Arc<Mutex<WindState>>,
    running: &Arc<AtomicBool>,
    publisher: Option<&Publisher>,
    stop_rx: &Receiver<()>,
    mode: WindMode,
) {
    let every_n = stats_every_n(cfg.stats_interval_s, cfg.sample_interval_s);
    let interval = Duration::from_secs_f64(cfg.sample_interval_s.max(0.0));

    state.lock().connected = sensor.connect();
    let mut counter = 0usize;

    while running.load(Ordering::SeqCst) {
        let tick = Instant::now();

        if !state.lock().connected {
            let up = sensor.connect();
            state.lock().connected = up;
        }

        match sensor.read() {
            Ok(sample) => {
                {
                    let mut st = state.lock();
                    st.connected = true;
                    st.last_sample = Some(sample);
                    st.window.push_back(sample);
                    while st.window.len() > every_n {
                        st.window.pop_front();
                    }
                }

                counter += 1;
                if counter >= every_n {
                    counter = 0;
                    let window: Vec<WindSample> = {
                        let st = state.lock();
                        st.window.iter().copied().collect()
                    };
                    let stats = compute_stats(&window);
                    state.lock().last_stats = stats.clone();
                    if let (Some(publisher), Some(stats)) = (publisher, stats) {
                        publisher.publish(&json!({
                            "type": "wind_stats",
                            "mode": mode,
                            "connected": true,
                            "stats": stats,
                        }));
                    }
                }
            }
            Err(e) => {
                // Keep the loop alive; reconnect on the next tick.
                warn!(error = %e, "wind read failed; marking disconnected");
                state.lock().connected = false;
            }
        }

        // Maintain cadence, staying responsive to stop.
        let wait = interval.saturating_sub(tick.elapsed());
        match stop_rx.recv_timeout(wait) {
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            _ => break,
        }
    }
    sensor.close();
}
