//! Acceleration → displacement via double integration.
//!
//! Two methods, selected by configuration:
//!
//! - **FFT**: divide the spectrum by −ω², suppressing everything below
//!   0.05 Hz (and the DC bin outright) to keep the low-frequency end from
//!   blowing up, then a linear detrend on the way out.
//! - **Time**: de-mean, cumulative-sum twice with 1/fs scaling, detrend.
//!
//! Inputs are expected in m/s²; callers convert "g" channels with
//! [`crate::types::STANDARD_GRAVITY`] first.

use num_complex::Complex;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Low-frequency suppression threshold for the FFT method (Hz).
const LOW_FREQ_CUTOFF_HZ: f64 = 0.05;

/// Integration method for displacement estimation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispMethod {
    #[default]
    Fft,
    Time,
}

/// Displacement from acceleration at sample rate `fs`.
///
/// Degenerate inputs pass through untouched: empty in → empty out, a single
/// sample or a non-positive rate returns the input unchanged.
pub fn acc_to_disp(acc: &[f64], fs: f64, method: DispMethod) -> Vec<f64> {
    if acc.len() < 2 || fs <= 0.0 {
        return acc.to_vec();
    }
    match method {
        DispMethod::Fft => acc_to_disp_fft(acc, fs),
        DispMethod::Time => acc_to_disp_time(acc, fs),
    }
}

fn acc_to_disp_fft(acc: &[f64], fs: f64) -> Vec<f64> {
    let n = acc.len();
    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(n);
    let ifft = planner.plan_fft_inverse(n);

    let mut buf: Vec<Complex<f64>> = acc.iter().map(|&a| Complex::new(a, 0.0)).collect();
    fft.process(&mut buf);

    // U[k] = -A[k] / ω², with ω forced to ∞ (U = 0) below the cutoff and at DC.
    for (k, v) in buf.iter_mut().enumerate() {
        let f = k as f64 * fs / n as f64;
        if k == 0 || f < LOW_FREQ_CUTOFF_HZ {
            *v = Complex::new(0.0, 0.0);
        } else {
            let omega = 2.0 * PI * f;
            *v = -*v / (omega * omega);
        }
    }

    ifft.process(&mut buf);
    // rustfft leaves the inverse unnormalized.
    let mut u: Vec<f64> = buf.iter().map(|c| c.re / n as f64).collect();
    detrend_linear(&mut u);
    u
}

fn acc_to_disp_time(acc: &[f64], fs: f64) -> Vec<f64> {
    let n = acc.len() as f64;
    let mean_a: f64 = acc.iter().sum::<f64>() / n;

    let mut vel = Vec::with_capacity(acc.len());
    let mut acc_sum = 0.0;
    for &a in acc {
        acc_sum += a - mean_a;
        vel.push(acc_sum / fs);
    }
    let mean_v: f64 = vel.iter().sum::<f64>() / n;

    let mut disp = Vec::with_capacity(acc.len());
    let mut vel_sum = 0.0;
    for v in vel {
        vel_sum += v - mean_v;
        disp.push(vel_sum / fs);
    }

    detrend_linear(&mut disp);
    disp
}

/// Subtract the least-squares degree-1 fit over the sample index.
pub fn detrend_linear(signal: &mut [f64]) {
    let n = signal.len();
    if n < 2 {
        return;
    }
    let nf = n as f64;
    // Closed-form least squares over t = 0..n-1.
    let sum_t = nf * (nf - 1.0) / 2.0;
    let sum_tt = (nf - 1.0) * nf * (2.0 * nf - 1.0) / 6.0;
    let sum_y: f64 = signal.iter().sum();
    let sum_ty: f64 = signal.iter().enumerate().map(|(t, &y)| t as f64 * y).sum();

    let denom = nf * sum_tt - sum_t * sum_t;
    if denom.abs() < f64::EPSILON {
        return;
    }
    let slope = (nf * sum_ty - sum_t * sum_y) / denom;
    let intercept = (sum_y - slope * sum_t) / nf;

    for (t, y) in signal.iter_mut().enumerate() {
        *y -= slope * t as f64 + intercept;
    }
}
