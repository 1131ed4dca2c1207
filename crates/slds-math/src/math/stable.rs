//! Numerically stable primitives for log-domain responsibility math.

/// Default floor applied to probabilities before taking a logarithm.
pub const PROBABILITY_FLOOR: f64 = 1e-10;

/// ln(2π).
pub const LN_2PI: f64 = 1.837_877_066_409_345_5;

/// Stable log(sum(exp(values))).
///
/// Returns NEG_INFINITY for empty input or all -inf inputs.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    log_sum_exp_iter(values.iter().copied())
}

/// Stable log(sum(exp(values))) over an iterator, without collecting.
///
/// The iterator is cloned once to locate the maximum.
pub fn log_sum_exp_iter<I>(values: I) -> f64
where
    I: Iterator<Item = f64> + Clone,
{
    let mut max = f64::NEG_INFINITY;
    for v in values.clone() {
        if v.is_nan() {
            return f64::NAN;
        }
        if v > max {
            max = v;
        }
    }
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if max == f64::INFINITY {
        return f64::INFINITY;
    }
    let sum: f64 = values.map(|v| (v - max).exp()).sum();
    max + sum.ln()
}

/// ln(max(p, floor)).
///
/// Used wherever a probability may be exactly zero before a logarithm.
pub fn floored_ln(p: f64, floor: f64) -> f64 {
    p.max(floor).ln()
}

/// Clamp an already-logged probability to ln(floor).
pub fn floored_log(log_p: f64, floor: f64) -> f64 {
    log_p.max(floor.ln())
}

/// p · ln(p) with the logarithm floored; zero mass contributes zero.
pub fn entropy_term(log_p: f64, floor: f64) -> f64 {
    let p = log_p.exp();
    if p == 0.0 {
        return 0.0;
    }
    p * floored_log(log_p, floor)
}

/// Normalize log-weights in place so that their exponentials sum to one.
///
/// Returns the log normalizer. Returns NEG_INFINITY (leaving the values
/// untouched) when every entry is -inf, and NaN when any entry is NaN.
pub fn normalize_log(values: &mut [f64]) -> f64 {
    let norm = log_sum_exp(values);
    if !norm.is_finite() {
        return norm;
    }
    for v in values.iter_mut() {
        *v -= norm;
    }
    norm
}

/// Clamp probabilities to `floor` and renormalize to sum to one.
///
/// An all-zero (or empty) input becomes the uniform distribution.
pub fn clamp_and_normalize(probs: &mut [f64], floor: f64) {
    if probs.is_empty() {
        return;
    }
    for p in probs.iter_mut() {
        if !p.is_finite() || *p < floor {
            *p = floor;
        }
    }
    let sum: f64 = probs.iter().sum();
    if sum > 0.0 && sum.is_finite() {
        for p in probs.iter_mut() {
            *p /= sum;
        }
    } else {
        let uniform = 1.0 / probs.len() as f64;
        probs.iter_mut().for_each(|p| *p = uniform);
    }
}
