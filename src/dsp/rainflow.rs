//! Simplified ASTM rainflow cycle counting.
//!
//! Extracts turning points, walks them with a three-point stack rule, and
//! emits every cycle as a half-cycle (count 0.5). For any input the total
//! count equals `(#turning points − 1) / 2`.

/// Turning points of a signal: the first sample, every interior sample where
/// the slope changes sign (plateaus included), and the last sample.
pub fn turning_points(signal: &[f64]) -> Vec<f64> {
    if signal.len() < 2 {
        return signal.to_vec();
    }
    let mut tp = Vec::with_capacity(signal.len());
    tp.push(signal[0]);
    for i in 1..signal.len() - 1 {
        let prev = signal[i - 1];
        let curr = signal[i];
        let next = signal[i + 1];
        if (curr - prev) * (next - curr) <= 0.0 {
            tp.push(curr);
        }
    }
    tp.push(signal[signal.len() - 1]);
    tp
}

/// Rainflow ranges and counts; every count is 0.5.
pub fn rainflow_ranges_counts(signal: &[f64]) -> (Vec<f64>, Vec<f64>) {
    if signal.len() < 2 {
        return (Vec::new(), Vec::new());
    }

    let tp = turning_points(signal);
    let mut stack: Vec<f64> = Vec::with_capacity(tp.len());
    let mut ranges = Vec::new();
    let mut counts = Vec::new();

    for &v in &tp {
        stack.push(v);
        while stack.len() >= 3 {
            let s0 = stack[stack.len() - 3];
            let s1 = stack[stack.len() - 2];
            let s2 = stack[stack.len() - 1];
            let r1 = (s1 - s0).abs();
            let r2 = (s2 - s1).abs();
            if r1 <= r2 {
                ranges.push(r1);
                counts.push(0.5);
                stack.remove(stack.len() - 2);
            } else {
                break;
            }
        }
    }

    // Remaining residue: adjacent pairs, half a cycle each.
    for pair in stack.windows(2) {
        ranges.push((pair[1] - pair[0]).abs());
        counts.push(0.5);
    }

    (ranges, counts)
}
