//! Per-device sampling thread.
//!
//! Owns the [`SampleSource`] for the life of the run and delivers every chunk
//! to a single callback. A failed read stops only this device: the loop tears
//! the source down inline (never joining itself) and records the cause, so a
//! later `stop()` from the manager returns immediately.

use crate::daq::source::{AcquireError, SampleSource};
use crate::types::Chunk;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Default hardware read timeout.
pub const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Grace period for joining the sampling thread on stop.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Chunk delivery callback. Runs on the sampling thread.
pub type ChunkCallback = Box<dyn FnMut(Chunk) + Send>;

/// Continuous sampling loop around a [`SampleSource`].
pub struct Runner {
    name: String,
    samples_per_read: usize,
    running: Arc<AtomicBool>,
    actual_rate: Arc<Mutex<Option<f64>>>,
    last_error: Arc<Mutex<Option<String>>>,
    handle: Option<JoinHandle<()>>,
}

impl Runner {
    pub fn new(name: &str, samples_per_read: usize) -> Self {
        Self {
            name: name.to_string(),
            samples_per_read,
            running: Arc::new(AtomicBool::new(false)),
            actual_rate: Arc::new(Mutex::new(None)),
            last_error: Arc::new(Mutex::new(None)),
            handle: None,
        }
    }

    /// Arm the source and spawn the sampling thread.
    pub fn start(
        &mut self,
        mut source: Box<dyn SampleSource>,
        mut on_chunk: ChunkCallback,
    ) -> Result<(), AcquireError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let rate = source.start()?;
        *self.actual_rate.lock() = Some(rate);
        *self.last_error.lock() = None;
        self.running.store(true, Ordering::SeqCst);
        info!(device = %self.name, actual_rate = rate, "sampling started");

        let name = self.name.clone();
        let running = Arc::clone(&self.running);
        let last_error = Arc::clone(&self.last_error);
        let samples_per_read = self.samples_per_read;

        let handle = std::thread::Builder::new()
            .name(format!("sampler-{name}"))
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    match source.read(samples_per_read, READ_TIMEOUT) {
                        Ok(chunk) => on_chunk(chunk),
                        Err(e) => {
                            error!(device = %name, error = %e, "read failed; stopping device");
                            *last_error.lock() = Some(e.to_string());
                            // Tear down inline; stop() must never block on
                            // this thread joining itself.
                            running.store(false, Ordering::SeqCst);
                            source.stop();
                            return;
                        }
                    }
                }
                source.stop();
            })
            .map_err(|e| AcquireError::HardwareUnavailable(e.to_string()))?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Request stop and join with a bounded grace period. A thread that
    /// outlives the join is leaked; the process keeps going.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let deadline = Instant::now() + JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
                info!(device = %self.name, "sampling stopped");
            } else {
                warn!(device = %self.name, "sampling thread did not stop in time; leaking");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Rate the clock actually locked to, once started.
    pub fn actual_rate(&self) -> Option<f64> {
        *self.actual_rate.lock()
    }

    /// Cause of the last read failure, if the device stopped on its own.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        self.stop();
    }
}
