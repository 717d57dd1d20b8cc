//! Hann-windowed magnitude spectra for stream payloads and window summaries.

use num_complex::Complex;
use rustfft::FftPlanner;
use std::f64::consts::PI;

/// Floor added before the log so silent bins stay finite.
const DB_FLOOR: f64 = 1e-12;

/// Hann window of length `n`.
pub fn hann(n: usize) -> Vec<f64> {
    if n < 2 {
        return vec![1.0; n];
    }
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f64 / (n - 1) as f64).cos())
        .collect()
}

/// One-sided frequency axis for an `n`-point transform at rate `fs`.
pub fn frequency_axis(n: usize, fs: f64) -> Vec<f64> {
    let bins = n / 2 + 1;
    (0..bins).map(|k| k as f64 * fs / n as f64).collect()
}

/// One-sided magnitudes of the windowed transform.
pub fn magnitudes(signal: &[f64]) -> Vec<f64> {
    let n = signal.len();
    if n < 2 {
        return Vec::new();
    }
    let window = hann(n);
    let mut buf: Vec<Complex<f64>> = signal
        .iter()
        .zip(window.iter())
        .map(|(&x, &w)| Complex::new(x * w, 0.0))
        .collect();
    FftPlanner::new().plan_fft_forward(n).process(&mut buf);
    buf.iter().take(n / 2 + 1).map(|c| c.norm()).collect()
}

/// One-sided spectrum in dB: `20·log10(|X| + 1e-12)`.
pub fn magnitudes_db(signal: &[f64]) -> Vec<f64> {
    magnitudes(signal)
        .into_iter()
        .map(|m| 20.0 * (m + DB_FLOOR).log10())
        .collect()
}

/// Dominant frequency of a real signal (Hz), DC bin excluded.
/// `None` for fewer than two samples or a non-positive rate.
pub fn dominant_frequency(signal: &[f64], fs: f64) -> Option<f64> {
    if signal.len() < 2 || fs <= 0.0 {
        return None;
    }
    let mags = magnitudes(signal);
    if mags.len() < 2 {
        return None;
    }
    let axis = frequency_axis(signal.len(), fs);
    let (idx, _) = mags
        .iter()
        .enumerate()
        .skip(1)
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))?;
    axis.get(idx).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, fs: f64, n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| (2.0 * PI * freq * i as f64 / fs).sin())
            .collect()
    }

    #[test]
    fn hann_is_symmetric_and_zero_at_edges() {
        let w = hann(64);
        assert!(w[0].abs() < 1e-12);
        assert!(w[63].abs() < 1e-12);
        for i in 0..32 {
            assert!((w[i] - w[63 - i]).abs() < 1e-12);
        }
    }

    #[test]
    fn axis_spans_dc_to_nyquist() {
        let axis = frequency_axis(1024, 1600.0);
        assert_eq!(axis.len(), 513);
        assert_eq!(axis[0], 0.0);
        assert!((axis[512] - 800.0).abs() < 1e-9);
    }

    #[test]
    fn dominant_frequency_finds_the_tone() {
        let fs = 1600.0;
        let sig = sine(50.0, fs, 1600);
        let f = dominant_frequency(&sig, fs).unwrap();
        assert!((f - 50.0).abs() < 1.5, "dominant at {}", f);
    }

    #[test]
    fn dominant_frequency_skips_dc_offset() {
        let fs = 1600.0;
        let sig: Vec<f64> = sine(120.0, fs, 1600).iter().map(|x| x + 10.0).collect();
        let f = dominant_frequency(&sig, fs).unwrap();
        assert!((f - 120.0).abs() < 1.5, "dominant at {}", f);
    }

    #[test]
    fn degenerate_inputs_have_no_dominant_frequency() {
        assert!(dominant_frequency(&[], 1600.0).is_none());
        assert!(dominant_frequency(&[1.0], 1600.0).is_none());
        assert!(dominant_frequency(&[1.0, 2.0], 0.0).is_none());
    }

    #[test]
    fn db_spectrum_is_finite_for_silence() {
        let sig = vec![0.0; 256];
        let db = magnitudes_db(&sig);
        assert_eq!(db.len(), 129);
        assert!(db.iter().all(|x| x.is_finite()));
    }
}
