//! ASME S-N fatigue life and directional damage accumulation.
//!
//! Each analysis window's two-channel displacement is projected onto azimuth
//! bins, converted to stress, rainflow-counted, and folded through the ASME
//! design curve with Miner's rule. Stress amplitudes outside the admission
//! bounds contribute no damage.

use crate::dsp::integrate::{acc_to_disp, DispMethod};
use crate::dsp::rainflow::rainflow_ranges_counts;
use crate::types::{FatigueParams, FatigueWindow, SnCurve};

/// Display curve sampling range (MPa) and point count.
const SN_CURVE_SA_MIN: f64 = 50.0;
const SN_CURVE_SA_MAX: f64 = 500.0;
const SN_CURVE_POINTS: usize = 300;

/// Cycles to failure at stress amplitude `sa` (MPa) for elastic modulus `et`
/// (MPa), per the ASME fatigue design curve fit. `Sa ≤ 0` never fails.
pub fn asme_sn_cycles(sa: f64, et: f64) -> f64 {
    if sa <= 0.0 {
        return f64::INFINITY;
    }
    let y = (28_300.0 * sa / et).log10();
    let x = if 10f64.powf(y) >= 20.0 {
        -4706.5245 + 1813.6228 * y + 6785.5644 / y - 368.12404 * y.powi(2)
            - 5133.7345 / y.powi(2)
            + 30.708204 * y.powi(3)
            + 1596.1916 / y.powi(3)
    } else {
        (38.1309 - 60.1705 * y.powi(2) + 25.0352 * y.powi(4))
            / (1.0 + 1.80224 * y.powi(2) - 4.68904 * y.powi(4) + 2.26536 * y.powi(6))
    };
    10f64.powf(x)
}

/// S-N curve sampled linearly in Sa over [50, 500] MPa for display.
pub fn build_sn_curve(et: f64) -> SnCurve {
    let step = (SN_CURVE_SA_MAX - SN_CURVE_SA_MIN) / (SN_CURVE_POINTS - 1) as f64;
    let sa: Vec<f64> = (0..SN_CURVE_POINTS)
        .map(|i| SN_CURVE_SA_MIN + step * i as f64)
        .collect();
    let n = sa.iter().map(|&s| asme_sn_cycles(s, et)).collect();
    SnCurve { sa, n }
}

/// Directional damage over one window, from displacement signals.
///
/// For each bin center φ the projected displacement is mean-removed, scaled
/// to stress, rainflow-counted, and accumulated as `Σ count / N(Sa)` over
/// amplitudes inside `[sa_admit_min, sa_admit_max]`.
pub fn directional_damage(ux: &[f64], uy: &[f64], params: &FatigueParams) -> FatigueWindow {
    let bins = params.bin_count();
    let dphi = params.dphi_deg.to_radians();
    let n = ux.len().min(uy.len());

    let mut phi_deg_list = Vec::with_capacity(bins);
    let mut d_phi = Vec::with_capacity(bins);
    let mut sa_max_list = Vec::with_capacity(bins);

    for b in 0..bins {
        let phi = dphi / 2.0 + b as f64 * dphi;
        phi_deg_list.push(phi.to_degrees());

        let (cos_phi, sin_phi) = (phi.cos(), phi.sin());
        let mut u: Vec<f64> = (0..n).map(|i| ux[i] * cos_phi + uy[i] * sin_phi).collect();
        if !u.is_empty() {
            let mean = u.iter().sum::<f64>() / u.len() as f64;
            for v in &mut u {
                *v -= mean;
            }
        }

        let stress: Vec<f64> = u.iter().map(|&v| params.k_disp2stress * v).collect();
        let (ranges, counts) = rainflow_ranges_counts(&stress);
        if ranges.is_empty() {
            d_phi.push(0.0);
            sa_max_list.push(0.0);
            continue;
        }

        let mut damage = 0.0;
        let mut sa_max = 0.0f64;
        for (&range, &count) in ranges.iter().zip(counts.iter()) {
            let sa = range / 2.0;
            sa_max = sa_max.max(sa);
            if sa <= 0.0 || sa < params.sa_admit_min || sa > params.sa_admit_max {
                continue;
            }
            let cycles = asme_sn_cycles(sa, params.et);
            if cycles.is_finite() && cycles > 0.0 {
                damage += count / cycles;
            }
        }
        d_phi.push(damage);
        sa_max_list.push(sa_max);
    }

    let imax = argmax(&d_phi);
    FatigueWindow {
        dmax: d_phi.get(imax).copied().unwrap_or(0.0),
        phi_deg: phi_deg_list.get(imax).copied().unwrap_or(0.0),
        sa_max: sa_max_list.get(imax).copied().unwrap_or(0.0),
        phi_deg_list,
        d_phi,
        params: params.clone(),
    }
}

/// Directional damage from two-channel acceleration: integrate to
/// displacement at `params.fs`, then sweep the bins.
pub fn fatigue_from_accel(
    ax: &[f64],
    ay: &[f64],
    method: DispMethod,
    params: &FatigueParams,
) -> FatigueWindow {
    let ux = acc_to_disp(ax, params.fs, method);
    let uy = acc_to_disp(ay, params.fs, method);
    directional_damage(&ux, &uy, params)
}

fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    const ET: f64 = 2.05e5;

    #[test]
    fn non_positive_amplitude_never_fails() {
        assert!(asme_sn_cycles(0.0, ET).is_infinite());
        assert!(asme_sn_cycles(-10.0, ET).is_infinite());
    }

    #[test]
    fn sn_cycles_decrease_with_amplitude() {
        let mut prev = f64::INFINITY;
        for sa in [50.0, 100.0, 200.0, 400.0, 800.0, 1600.0] {
            let n = asme_sn_cycles(sa, ET);
            assert!(n > 0.0 && n.is_finite());
            assert!(n < prev, "N({}) = {} not monotone", sa, n);
            prev = n;
        }
    }

    #[test]
    fn sn_curve_samples_the_display_range() {
        let curve = build_sn_curve(ET);
        assert_eq!(curve.sa.len(), 300);
        assert_eq!(curve.n.len(), 300);
        assert!((curve.sa[0] - 50.0).abs() < 1e-12);
        assert!((curve.sa[299] - 500.0).abs() < 1e-12);
    }

    #[test]
    fn uniaxial_motion_damages_the_zero_degree_bin() {
        // u_x sinusoidal with stress swing well inside the admission band,
        // u_y flat: the worst bin must align with the x axis.
        let params = FatigueParams::at_rate(1600.0);
        let amp = 1.0; // k·amp = 226.55 MPa
        let ux: Vec<f64> = (0..1600)
            .map(|i| amp * (2.0 * PI * 5.0 * i as f64 / 1600.0).sin())
            .collect();
        let uy = vec![0.0; 1600];

        let window = directional_damage(&ux, &uy, &params);
        assert_eq!(window.d_phi.len(), 72);

        // Argmax bin center hugs 0° or 180° (equivalent under cos).
        let off_axis = {
            let d = window.phi_deg % 180.0;
            d.min(180.0 - d)
        };
        assert!(off_axis <= params.dphi_deg, "argmax at {}°", window.phi_deg);

        // Sa_max at the worst bin ≈ k·amp (cos of the half-bin offset).
        let expected = params.k_disp2stress * amp
            * (params.dphi_deg / 2.0).to_radians().cos();
        assert!(
            (window.sa_max - expected).abs() / expected < 0.05,
            "sa_max {} vs {}",
            window.sa_max,
            expected
        );

        // Perpendicular bin (center nearest 90°) sees essentially nothing.
        let i90 = window
            .phi_deg_list
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                (*a - 90.0).abs().partial_cmp(&(*b - 90.0).abs()).unwrap()
            })
            .map(|(i, _)| i)
            .unwrap();
        assert!(window.d_phi[i90] < window.dmax * 1e-3);
        assert!(window.dmax > 0.0);
    }

    #[test]
    fn amplitudes_outside_admission_band_contribute_nothing() {
        // k·amp = 22.7 MPa < 48 MPa: every cycle is discarded.
        let params = FatigueParams::at_rate(1600.0);
        let ux: Vec<f64> = (0..1600)
            .map(|i| 0.1 * (2.0 * PI * 5.0 * i as f64 / 1600.0).sin())
            .collect();
        let uy = vec![0.0; 1600];
        let window = directional_damage(&ux, &uy, &params);
        assert!(window.d_phi.iter().all(|&d| d == 0.0));
        assert!(window.sa_max > 0.0); // still reported for display
    }

    #[test]
    fn empty_input_yields_zero_vector() {
        let params = FatigueParams::at_rate(1600.0);
        let window = directional_damage(&[], &[], &params);
        assert_eq!(window.d_phi.len(), 72);
        assert!(window.d_phi.iter().all(|&d| d == 0.0));
        assert_eq!(window.dmax, 0.0);
    }

    #[test]
    fn bin_centers_start_at_half_step() {
        let params = FatigueParams::at_rate(1600.0);
        let window = directional_damage(&[0.0; 4], &[0.0; 4], &params);
        assert!((window.phi_deg_list[0] - 2.5).abs() < 1e-9);
        assert!((window.phi_deg_list[71] - 357.5).abs() < 1e-9);
    }
}
