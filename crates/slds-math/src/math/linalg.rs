//! Small dense linear-algebra helpers for Gaussian state-space math.
//!
//! Every covariance that reaches a factorization goes through [`spd_cholesky`],
//! which symmetrizes first and reports failure instead of substituting a
//! regularized matrix. Callers decide how a failure is surfaced.

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};

use super::stable::LN_2PI;

/// (P + Pᵀ) / 2.
pub fn symmetrize(p: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (p + p.transpose())
}

/// Cholesky factor of the symmetrized matrix.
///
/// Returns `None` when the matrix is not square, has non-finite entries, or is
/// not positive definite.
pub fn spd_cholesky(m: &DMatrix<f64>) -> Option<Cholesky<f64, Dyn>> {
    if !m.is_square() || m.nrows() == 0 || m.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let chol = symmetrize(m).cholesky()?;
    let l = chol.l_dirty();
    if (0..l.nrows()).any(|i| {
        let d = l[(i, i)];
        d <= 0.0 || !d.is_finite()
    }) {
        return None;
    }
    Some(chol)
}

/// ln|M| from a Cholesky factor: 2·Σ ln Lᵢᵢ.
pub fn log_det(chol: &Cholesky<f64, Dyn>) -> f64 {
    let l = chol.l_dirty();
    2.0 * (0..l.nrows()).map(|i| l[(i, i)].ln()).sum::<f64>()
}

/// Differential entropy of a `dim`-dimensional Gaussian with the given ln|Σ|.
pub fn gaussian_entropy(log_det: f64, dim: usize) -> f64 {
    0.5 * (dim as f64 * (1.0 + LN_2PI) + log_det)
}

/// B·M⁻¹ for symmetric positive definite M.
pub fn solve_right_spd(b: &DMatrix<f64>, m: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    if b.ncols() != m.nrows() {
        return None;
    }
    let chol = spd_cholesky(m)?;
    Some(chol.solve(&b.transpose()).transpose())
}

/// tr(A·B) without forming the product.
pub fn trace_of_product(a: &DMatrix<f64>, b: &DMatrix<f64>) -> f64 {
    debug_assert_eq!(a.ncols(), b.nrows());
    debug_assert_eq!(a.nrows(), b.ncols());
    let mut tr = 0.0;
    for i in 0..a.nrows() {
        for j in 0..a.ncols() {
            tr += a[(i, j)] * b[(j, i)];
        }
    }
    tr
}

/// xᵀ·M⁻¹·x given the Cholesky factor of M.
pub fn mahalanobis_sq(chol: &Cholesky<f64, Dyn>, x: &DVector<f64>) -> f64 {
    x.dot(&chol.solve(x))
}

/// Build a matrix from nested rows, checking that every row has the same length.
pub fn matrix_from_rows(rows: &[Vec<f64>]) -> Option<DMatrix<f64>> {
    let nrows = rows.len();
    let ncols = rows.first().map_or(0, Vec::len);
    if rows.iter().any(|r| r.len() != ncols) {
        return None;
    }
    Some(DMatrix::from_fn(nrows, ncols, |i, j| rows[i][j]))
}

/// Inverse of [`matrix_from_rows`].
pub fn matrix_to_rows(m: &DMatrix<f64>) -> Vec<Vec<f64>> {
    m.row_iter().map(|r| r.iter().copied().collect()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol
    }

    #[test]
    fn symmetrize_averages_off_diagonal() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 4.0, 3.0]);
        let s = symmetrize(&m);
        assert_eq!(s[(0, 1)], 3.0);
        assert_eq!(s[(1, 0)], 3.0);
    }

    #[test]
    fn spd_cholesky_rejects_indefinite() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        assert!(spd_cholesky(&m).is_none());
    }

    #[test]
    fn spd_cholesky_rejects_non_finite() {
        let m = DMatrix::from_row_slice(1, 1, &[f64::NAN]);
        assert!(spd_cholesky(&m).is_none());
    }

    #[test]
    fn log_det_matches_diagonal() {
        let m = DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 3.0]);
        let chol = spd_cholesky(&m).unwrap();
        assert!(approx_eq(log_det(&chol), 6.0f64.ln(), 1e-12));
    }

    #[test]
    fn gaussian_entropy_standard_normal() {
        let h = gaussian_entropy(0.0, 1);
        assert!(approx_eq(h, 0.5 * (1.0 + LN_2PI), 1e-12));
    }

    #[test]
    fn solve_right_spd_recovers_b() {
        let m = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
        let b = DMatrix::from_row_slice(1, 2, &[1.0, 2.0]);
        let x = solve_right_spd(&b, &m).unwrap();
        let back = &x * &m;
        assert!(approx_eq(back[(0, 0)], 1.0, 1e-12));
        assert!(approx_eq(back[(0, 1)], 2.0, 1e-12));
    }

    #[test]
    fn trace_of_product_matches_dense() {
        let a = DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = DMatrix::from_row_slice(3, 2, &[1.0, 0.5, -1.0, 2.0, 0.0, 1.0]);
        assert!(approx_eq(trace_of_product(&a, &b), (&a * &b).trace(), 1e-12));
    }

    #[test]
    fn mahalanobis_identity_is_squared_norm() {
        let chol = spd_cholesky(&DMatrix::identity(3, 3)).unwrap();
        let x = DVector::from_row_slice(&[1.0, 2.0, 2.0]);
        assert!(approx_eq(mahalanobis_sq(&chol, &x), 9.0, 1e-12));
    }

    #[test]
    fn rows_roundtrip_and_ragged_rejected() {
        let rows = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
        let m = matrix_from_rows(&rows).unwrap();
        assert_eq!(m[(1, 0)], 3.0);
        assert_eq!(matrix_to_rows(&m), rows);
        assert!(matrix_from_rows(&[vec![1.0], vec![1.0, 2.0]]).is_none());
    }
}
