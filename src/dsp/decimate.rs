//! Anti-aliased FIR decimation from the hardware rate to the effective rate.
//!
//! A windowed-sinc low-pass runs over every chunk before downsampling. Filter
//! state (the previous chunk's tail) and the downsampling phase are carried
//! across chunks, so concatenating per-chunk outputs equals filtering the
//! concatenated stream and keeping every M-th sample, apart from the zero-fill
//! transient of `taps − 1` samples at the very start of the stream.

use std::f64::consts::PI;

/// Streaming decimator for one device (all channels share one kernel).
#[derive(Debug, Clone)]
pub struct Decimator {
    factor: usize,
    taps: Vec<f64>,
    /// Per-channel tail of the previous chunk, length `taps.len() − 1`.
    state: Vec<Vec<f64>>,
    /// Offset into the next chunk's filtered output of the next kept sample.
    phase: usize,
}

/// Decimation factor for a hardware/effective rate pair.
pub fn decimation_factor(fs_hw: f64, fs_eff: f64) -> usize {
    if fs_eff <= 0.0 || fs_hw <= 0.0 {
        return 1;
    }
    ((fs_hw / fs_eff).round() as usize).max(1)
}

/// Windowed-sinc low-pass kernel: length `max(31, 8M + 1)` forced odd,
/// normalized cutoff `clamp(0.45 · (fs_eff/2) / fs_hw, 0.001, 0.49)`,
/// Hanning-windowed, unity-sum normalized.
pub fn design_lowpass(factor: usize, fs_hw: f64, fs_eff: f64) -> Vec<f64> {
    let mut len = (8 * factor + 1).max(31);
    if len % 2 == 0 {
        len += 1;
    }
    let fc = (0.45 * (fs_eff / 2.0) / fs_hw).clamp(0.001, 0.49);
    let mid = (len - 1) as f64 / 2.0;

    let mut taps = vec![0.0; len];
    for (n, tap) in taps.iter_mut().enumerate() {
        let x = n as f64 - mid;
        let sinc = if x == 0.0 {
            2.0 * fc
        } else {
            (2.0 * PI * fc * x).sin() / (PI * x)
        };
        let hann = 0.5 - 0.5 * (2.0 * PI * n as f64 / (len - 1) as f64).cos();
        *tap = sinc * hann;
    }

    let sum: f64 = taps.iter().sum();
    if sum.abs() > f64::EPSILON {
        for t in &mut taps {
            *t /= sum;
        }
    }
    taps
}

impl Decimator {
    pub fn new(channel_count: usize, fs_hw: f64, fs_eff: f64) -> Self {
        let factor = decimation_factor(fs_hw, fs_eff);
        if factor == 1 {
            // Pass-through; no filter state needed.
            return Self {
                factor,
                taps: Vec::new(),
                state: vec![Vec::new(); channel_count],
                phase: 0,
            };
        }
        let taps = design_lowpass(factor, fs_hw, fs_eff);
        let state_len = taps.len() - 1;
        Self {
            factor,
            taps,
            state: vec![vec![0.0; state_len]; channel_count],
            phase: 0,
        }
    }

    pub fn factor(&self) -> usize {
        self.factor
    }

    pub fn taps(&self) -> &[f64] {
        &self.taps
    }

    /// Filter and downsample one chunk. Each inner vec is one channel; all
    /// channels must have equal length.
    pub fn process(&mut self, chunk: &[Vec<f64>]) -> Vec<Vec<f64>> {
        if self.factor == 1 {
            return chunk.to_vec();
        }

        let len = chunk.first().map_or(0, Vec::len);
        if len == 0 {
            return vec![Vec::new(); chunk.len()];
        }

        let tail = self.taps.len() - 1;
        let mut out = Vec::with_capacity(chunk.len());
        for (ch, samples) in chunk.iter().enumerate() {
            if ch >= self.state.len() {
                self.state.push(vec![0.0; tail]);
            }

            let mut extended = Vec::with_capacity(tail + samples.len());
            extended.extend_from_slice(&self.state[ch]);
            extended.extend_from_slice(samples);

            let mut kept = Vec::with_capacity(len / self.factor + 1);
            let mut i = self.phase;
            while i < len {
                kept.push(self.fir_at(&extended, i));
                i += self.factor;
            }
            out.push(kept);

            self.state[ch].clear();
            self.state[ch].extend_from_slice(&extended[extended.len() - tail..]);
        }
        // All channels advanced by the same number of input samples.
        self.phase = next_phase(self.phase, len, self.factor);
        out
    }

    /// One output of `conv_valid(extended, taps)` at position `i`.
    fn fir_at(&self, extended: &[f64], i: usize) -> f64 {
        let t = self.taps.len();
        let window = &extended[i..i + t];
        let mut acc = 0.0;
        for (k, tap) in self.taps.iter().enumerate() {
            acc += tap * window[t - 1 - k];
        }
        acc
    }
}

fn next_phase(phase: usize, consumed: usize, factor: usize) -> usize {
    if consumed <= phase {
        phase - consumed
    } else {
        let past = consumed - phase;
        (factor - past % factor) % factor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, fs: f64, n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| (2.0 * PI * freq * i as f64 / fs).sin())
            .collect()
    }

    /// Reference: filter the whole signal at once, keep every M-th sample.
    fn filter_then_downsample(signal: &[f64], taps: &[f64], factor: usize) -> Vec<f64> {
        let tail = taps.len() - 1;
        let mut extended = vec![0.0; tail];
        extended.extend_from_slice(signal);
        let mut out = Vec::new();
        let mut i = 0;
        while i < signal.len() {
            let t = taps.len();
            let window = &extended[i..i + t];
            let mut acc = 0.0;
            for (k, tap) in taps.iter().enumerate() {
                acc += tap * window[t - 1 - k];
            }
            out.push(acc);
            i += factor;
        }
        out
    }

    #[test]
    fn kernel_is_odd_and_unity_sum() {
        for factor in [1usize, 2, 4, 8, 16] {
            let taps = design_lowpass(factor, 3200.0, 3200.0 / factor as f64);
            assert_eq!(taps.len() % 2, 1);
            assert!(taps.len() >= 31);
            assert!(taps.len() >= 8 * factor + 1);
            let sum: f64 = taps.iter().sum();
            assert!((sum - 1.0).abs() < 1e-12, "DC gain {} != 1", sum);
        }
    }

    #[test]
    fn unity_factor_is_pass_through() {
        let mut dec = Decimator::new(2, 1600.0, 1600.0);
        assert_eq!(dec.factor(), 1);
        let chunk = vec![sine(50.0, 1600.0, 400), sine(80.0, 1600.0, 400)];
        let out = dec.process(&chunk);
        assert_eq!(out, chunk);
    }

    #[test]
    fn chunked_output_matches_whole_stream_reference() {
        // Chunk lengths deliberately not multiples of M to exercise the
        // carried phase.
        let fs_hw = 3200.0;
        let fs_eff = 1600.0;
        let signal = sine(100.0, fs_hw, 2000);
        let mut dec = Decimator::new(1, fs_hw, fs_eff);
        assert_eq!(dec.factor(), 2);

        let mut streamed = Vec::new();
        for chunk in [&signal[0..333], &signal[333..1000], &signal[1000..2000]] {
            let out = dec.process(&[chunk.to_vec()]);
            streamed.extend_from_slice(&out[0]);
        }

        let reference = filter_then_downsample(&signal, dec.taps(), 2);
        assert_eq!(streamed.len(), reference.len());
        for (a, b) in streamed.iter().zip(reference.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn aligned_chunks_yield_ceil_len_over_m_outputs() {
        let mut dec = Decimator::new(1, 3200.0, 1600.0);
        let chunk = vec![sine(100.0, 3200.0, 400)];
        for _ in 0..5 {
            let out = dec.process(&chunk);
            assert_eq!(out[0].len(), 200);
        }
    }

    #[test]
    fn high_frequency_is_attenuated() {
        let fs_hw = 3200.0;
        let fs_eff = 1600.0;
        let mut dec = Decimator::new(1, fs_hw, fs_eff);
        // 1400 Hz sits above the decimated Nyquist band edge.
        let hi = sine(1400.0, fs_hw, 6400);
        let mut out = Vec::new();
        for chunk in hi.chunks(400) {
            out.extend_from_slice(&dec.process(&[chunk.to_vec()])[0]);
        }
        // Skip the startup transient, then compare RMS against the input.
        let steady = &out[out.len() / 2..];
        let rms_out =
            (steady.iter().map(|x| x * x).sum::<f64>() / steady.len() as f64).sqrt();
        let rms_in = (0.5f64).sqrt();
        let db = 20.0 * (rms_out / rms_in).log10();
        assert!(db < -40.0, "1400 Hz only attenuated by {:.1} dB", db);
    }

    #[test]
    fn empty_chunk_produces_empty_output() {
        let mut dec = Decimator::new(1, 3200.0, 1600.0);
        let out = dec.process(&[Vec::new()]);
        assert_eq!(out, vec![Vec::<f64>::new()]);
    }
}
