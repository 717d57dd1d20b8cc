//! Fixed-capacity sample rings with bounded tail snapshots.
//!
//! Written only by the sampler callback; readers (stream assembly, storage
//! snapshots, IoT payloads) take length-bounded copies of the tail through a
//! short lock, so a reader can never observe a torn append.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Ring of recent samples for one channel. Oldest samples fall off the front
/// when the capacity is reached.
#[derive(Debug)]
pub struct SampleRing {
    buf: VecDeque<f64>,
    capacity: usize,
}

impl SampleRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity.min(1 << 20)),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn extend(&mut self, samples: &[f64]) {
        if samples.len() >= self.capacity {
            // The new block alone fills the ring.
            self.buf.clear();
            self.buf
                .extend(samples[samples.len() - self.capacity..].iter().copied());
            return;
        }
        let overflow = (self.buf.len() + samples.len()).saturating_sub(self.capacity);
        for _ in 0..overflow {
            self.buf.pop_front();
        }
        self.buf.extend(samples.iter().copied());
    }

    /// Copy of the most recent `max_len` samples (all of them if fewer).
    pub fn tail(&self, max_len: usize) -> Vec<f64> {
        let n = self.buf.len().min(max_len);
        self.buf.iter().skip(self.buf.len() - n).copied().collect()
    }
}

/// Per-device set of channel rings behind one lock.
#[derive(Debug, Clone)]
pub struct ChannelRings {
    inner: Arc<Mutex<Vec<SampleRing>>>,
}

impl ChannelRings {
    pub fn new(channels: usize, capacity: usize) -> Self {
        let rings = (0..channels).map(|_| SampleRing::new(capacity)).collect();
        Self {
            inner: Arc::new(Mutex::new(rings)),
        }
    }

    /// Append one decimated chunk (outer index = channel).
    pub fn extend(&self, chunk: &[Vec<f64>]) {
        let mut rings = self.inner.lock();
        for (ring, samples) in rings.iter_mut().zip(chunk.iter()) {
            ring.extend(samples);
        }
    }

    /// Consistent tail snapshot across all channels.
    pub fn tails(&self, max_len: usize) -> Vec<Vec<f64>> {
        let rings = self.inner.lock();
        rings.iter().map(|r| r.tail(max_len)).collect()
    }

    pub fn channel_count(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().iter().all(SampleRing::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_drops_oldest() {
        let mut ring = SampleRing::new(4);
        ring.extend(&[1.0, 2.0, 3.0]);
        ring.extend(&[4.0, 5.0]);
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.tail(10), vec![2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn oversized_block_keeps_its_own_tail() {
        let mut ring = SampleRing::new(3);
        ring.extend(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(ring.tail(10), vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn tail_is_length_bounded() {
        let mut ring = SampleRing::new(8);
        ring.extend(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(ring.tail(2), vec![3.0, 4.0]);
        assert_eq!(ring.tail(0), Vec::<f64>::new());
    }

    #[test]
    fn channel_rings_snapshot_all_channels() {
        let rings = ChannelRings::new(2, 4);
        rings.extend(&[vec![1.0, 2.0], vec![10.0, 20.0]]);
        rings.extend(&[vec![3.0], vec![30.0]]);
        let tails = rings.tails(2);
        assert_eq!(tails, vec![vec![2.0, 3.0], vec![20.0, 30.0]]);
        assert_eq!(rings.channel_count(), 2);
        assert!(!rings.is_empty());
    }
}
