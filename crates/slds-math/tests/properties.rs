//! Property-based tests for slds-math numerical functions.
//!
//! Uses proptest to verify mathematical properties hold across many random inputs.

use nalgebra::DMatrix;
use proptest::prelude::*;
use slds_math::{
    clamp_and_normalize, log_det, log_sum_exp, normalize_log, spd_cholesky,
    symmetrize, PROBABILITY_FLOOR,
};

/// Tolerance for floating point comparisons.
const TOL: f64 = 1e-10;

/// Helper to check approximate equality.
fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    if a.is_nan() || b.is_nan() {
        return false;
    }
    if a.is_infinite() && b.is_infinite() {
        return a.signum() == b.signum();
    }
    (a - b).abs() <= tol.max(tol * a.abs().max(b.abs()))
}

// ============================================================================
// log_sum_exp properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(1000))]

    /// log_sum_exp is commutative: order doesn't matter.
    #[test]
    fn log_sum_exp_commutative(a in -100.0..100.0f64, b in -100.0..100.0f64) {
        let ab = log_sum_exp(&[a, b]);
        let ba = log_sum_exp(&[b, a]);
        prop_assert!(approx_eq(ab, ba, TOL), "lse([{},{}])={} != lse([{},{}])={}", a, b, ab, b, a, ba);
    }

    /// log_sum_exp is associative: grouping doesn't matter.
    #[test]
    fn log_sum_exp_associative(a in -50.0..50.0f64, b in -50.0..50.0f64, c in -50.0..50.0f64) {
        let direct = log_sum_exp(&[a, b, c]);
        let grouped = log_sum_exp(&[log_sum_exp(&[a, b]), c]);
        prop_assert!(approx_eq(direct, grouped, TOL), "{} != {}", direct, grouped);
    }

    /// log_sum_exp numerical stability: no underflow with very negative values.
    #[test]
    fn log_sum_exp_no_underflow(a in -1500.0..-800.0f64, b in -1500.0..-800.0f64) {
        let result = log_sum_exp(&[a, b]);
        prop_assert!(result.is_finite(), "lse([{},{}])={} should be finite", a, b, result);
        prop_assert!(result >= a.max(b) - TOL);
    }
}

// ============================================================================
// Normalization properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Normalized log-weights form a probability simplex.
    #[test]
    fn normalize_log_is_simplex(mut values in prop::collection::vec(-900.0..50.0f64, 1..12)) {
        let norm = normalize_log(&mut values);
        prop_assert!(norm.is_finite());
        let total: f64 = values.iter().map(|v| v.exp()).sum();
        prop_assert!(approx_eq(total, 1.0, 1e-9), "sum={}", total);
    }

    /// Clamped probabilities are strictly positive and sum to one.
    #[test]
    fn clamp_and_normalize_is_positive_simplex(mut probs in prop::collection::vec(0.0..1.0f64, 1..10)) {
        clamp_and_normalize(&mut probs, PROBABILITY_FLOOR);
        let total: f64 = probs.iter().sum();
        prop_assert!(approx_eq(total, 1.0, 1e-9));
        prop_assert!(probs.iter().all(|p| *p > 0.0));
    }
}

// ============================================================================
// Cholesky properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// Gram matrices plus a ridge always factor, and ln|M| matches the product
    /// of eigenvalues.
    #[test]
    fn gram_plus_ridge_factors(entries in prop::collection::vec(-3.0..3.0f64, 9), ridge in 0.1..5.0f64) {
        let b = DMatrix::from_row_slice(3, 3, &entries);
        let m = &b * b.transpose() + DMatrix::identity(3, 3) * ridge;
        let chol = spd_cholesky(&m);
        prop_assert!(chol.is_some());
        let ld = log_det(&chol.unwrap());
        let eig = symmetrize(&m).symmetric_eigenvalues();
        let expected: f64 = eig.iter().map(|v| v.ln()).sum();
        prop_assert!(approx_eq(ld, expected, 1e-8), "{} != {}", ld, expected);
    }
}
