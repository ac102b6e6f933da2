// ─────────────────────────────────────────────────────────────────────
// SCPN Calibration — Linear Algebra
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Linear algebra utilities.
//!
//! Cholesky factorization, cyclic Jacobi eigendecomposition of symmetric
//! matrices, and the inverse / square-root forms built on top of them.
//! The matrices in this project are covariance-sized (Nθ, Nobs, Nensemble),
//! so dense O(n³) kernels are sufficient.

use eki_types::constants::{MAX_JACOBI_SWEEPS, PINV_CUTOFF};
use eki_types::error::{EkiError, EkiResult};
use ndarray::{Array1, Array2, ArrayView2};

fn check_square(a: &ArrayView2<'_, f64>, what: &str) -> EkiResult<usize> {
    let (m, n) = a.dim();
    if m != n {
        return Err(EkiError::ShapeMismatch(format!(
            "{what} must be square, got {m}x{n}"
        )));
    }
    if !a.iter().all(|v| v.is_finite()) {
        return Err(EkiError::LinAlg(format!("{what} contains non-finite values")));
    }
    Ok(n)
}

/// Lower-triangular Cholesky factor L with A = L Lᵀ.
pub fn cholesky(a: &ArrayView2<'_, f64>) -> EkiResult<Array2<f64>> {
    let n = check_square(a, "Cholesky input")?;
    let mut l = Array2::zeros((n, n));

    for j in 0..n {
        let mut diag = a[[j, j]];
        for k in 0..j {
            diag -= l[[j, k]] * l[[j, k]];
        }
        if !(diag > 0.0) || !diag.is_finite() {
            return Err(EkiError::LinAlg(format!(
                "matrix is not positive definite (pivot {j} = {diag:e})"
            )));
        }
        let ljj = diag.sqrt();
        l[[j, j]] = ljj;

        for i in (j + 1)..n {
            let mut sum = a[[i, j]];
            for k in 0..j {
                sum -= l[[i, k]] * l[[j, k]];
            }
            l[[i, j]] = sum / ljj;
        }
    }

    Ok(l)
}

/// Solve (L Lᵀ) X = B given the Cholesky factor L.
pub fn cholesky_solve(l: &Array2<f64>, b: &ArrayView2<'_, f64>) -> EkiResult<Array2<f64>> {
    let n = l.nrows();
    if b.nrows() != n {
        return Err(EkiError::ShapeMismatch(format!(
            "right-hand side has {} rows, factor is {n}x{n}",
            b.nrows()
        )));
    }
    let mut x = b.to_owned();

    for col in 0..x.ncols() {
        // Forward: L z = b
        for i in 0..n {
            let mut sum = x[[i, col]];
            for k in 0..i {
                sum -= l[[i, k]] * x[[k, col]];
            }
            x[[i, col]] = sum / l[[i, i]];
        }
        // Backward: Lᵀ x = z
        for i in (0..n).rev() {
            let mut sum = x[[i, col]];
            for k in (i + 1)..n {
                sum -= l[[k, i]] * x[[k, col]];
            }
            x[[i, col]] = sum / l[[i, i]];
        }
    }

    Ok(x)
}

/// Eigendecomposition of a symmetric matrix by cyclic Jacobi rotations.
///
/// Returns (eigenvalues, eigenvectors) with eigenvalues ascending and the
/// eigenvectors stored as columns, so A ≈ V diag(λ) Vᵀ. Only the symmetric
/// part (A + Aᵀ)/2 is used.
pub fn symmetric_eigen(a: &ArrayView2<'_, f64>) -> EkiResult<(Array1<f64>, Array2<f64>)> {
    let n = check_square(a, "eigensolver input")?;
    let mut m = Array2::from_shape_fn((n, n), |(i, j)| 0.5 * (a[[i, j]] + a[[j, i]]));
    let mut v = Array2::eye(n);

    let scale = m.iter().fold(0.0_f64, |acc, x| acc.max(x.abs())).max(1e-300);
    let mut converged = n < 2;

    for _ in 0..MAX_JACOBI_SWEEPS {
        let mut off_diag = 0.0;
        for i in 0..n {
            for j in (i + 1)..n {
                off_diag += m[[i, j]] * m[[i, j]];
            }
        }
        if off_diag.sqrt() <= 1e-15 * scale {
            converged = true;
            break;
        }

        for p in 0..n {
            for q in (p + 1)..n {
                let apq = m[[p, q]];
                if apq.abs() <= 1e-300 {
                    continue;
                }
                let theta = (m[[q, q]] - m[[p, p]]) / (2.0 * apq);
                let t = if theta >= 0.0 {
                    1.0 / (theta + (1.0 + theta * theta).sqrt())
                } else {
                    -1.0 / (-theta + (1.0 + theta * theta).sqrt())
                };
                let cos = 1.0 / (1.0 + t * t).sqrt();
                let sin = t * cos;

                // A ← A J
                for k in 0..n {
                    let mkp = m[[k, p]];
                    let mkq = m[[k, q]];
                    m[[k, p]] = cos * mkp - sin * mkq;
                    m[[k, q]] = sin * mkp + cos * mkq;
                }
                // A ← Jᵀ A
                for k in 0..n {
                    let mpk = m[[p, k]];
                    let mqk = m[[q, k]];
                    m[[p, k]] = cos * mpk - sin * mqk;
                    m[[q, k]] = sin * mpk + cos * mqk;
                }
                m[[p, q]] = 0.0;
                m[[q, p]] = 0.0;

                // V ← V J
                for k in 0..n {
                    let vkp = v[[k, p]];
                    let vkq = v[[k, q]];
                    v[[k, p]] = cos * vkp - sin * vkq;
                    v[[k, q]] = sin * vkp + cos * vkq;
                }
            }
        }
    }

    if !converged {
        return Err(EkiError::LinAlg(format!(
            "Jacobi eigensolver did not converge in {MAX_JACOBI_SWEEPS} sweeps"
        )));
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| {
        m[[i, i]]
            .partial_cmp(&m[[j, j]])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let values = Array1::from_iter(order.iter().map(|&k| m[[k, k]]));
    let mut vectors = Array2::zeros((n, n));
    for (dst, &src) in order.iter().enumerate() {
        vectors.column_mut(dst).assign(&v.column(src));
    }

    Ok((values, vectors))
}

/// V diag(f(λ)) Vᵀ.
fn spectral_map(
    values: &Array1<f64>,
    vectors: &Array2<f64>,
    f: impl Fn(f64) -> f64,
) -> Array2<f64> {
    let n = values.len();
    let mut scaled = vectors.clone();
    for k in 0..n {
        let s = f(values[k]);
        scaled.column_mut(k).mapv_inplace(|x| x * s);
    }
    scaled.dot(&vectors.t())
}

fn positive_spectrum(
    a: &ArrayView2<'_, f64>,
    what: &str,
) -> EkiResult<(Array1<f64>, Array2<f64>)> {
    let (values, vectors) = symmetric_eigen(a)?;
    if let Some(&smallest) = values.first() {
        if !(smallest > 0.0) {
            return Err(EkiError::LinAlg(format!(
                "{what} requires a positive definite matrix (smallest eigenvalue {smallest:e})"
            )));
        }
    }
    Ok((values, vectors))
}

/// A⁻¹ for symmetric positive definite A.
pub fn symmetric_inverse(a: &ArrayView2<'_, f64>) -> EkiResult<Array2<f64>> {
    let (values, vectors) = positive_spectrum(a, "inverse")?;
    Ok(spectral_map(&values, &vectors, |l| 1.0 / l))
}

/// A^{-1/2} for symmetric positive definite A.
pub fn symmetric_inverse_sqrt(a: &ArrayView2<'_, f64>) -> EkiResult<Array2<f64>> {
    let (values, vectors) = positive_spectrum(a, "inverse square root")?;
    Ok(spectral_map(&values, &vectors, |l| 1.0 / l.sqrt()))
}

/// Pseudo-inverse of a symmetric matrix, dropping eigenvalues with
/// |λ| ≤ cutoff · max|λ|.
pub fn pinv_symmetric(a: &ArrayView2<'_, f64>, cutoff: f64) -> EkiResult<Array2<f64>> {
    let (values, vectors) = symmetric_eigen(a)?;
    let largest = values.iter().fold(0.0_f64, |acc, l| acc.max(l.abs()));
    let floor = cutoff * largest;
    Ok(spectral_map(&values, &vectors, |l| {
        if l.abs() > floor && largest > 0.0 {
            1.0 / l
        } else {
            0.0
        }
    }))
}

/// Solve A X = B for symmetric A.
///
/// Uses Cholesky when A is positive definite and falls back to the
/// symmetric pseudo-inverse otherwise.
pub fn solve_symmetric(
    a: &ArrayView2<'_, f64>,
    b: &ArrayView2<'_, f64>,
) -> EkiResult<Array2<f64>> {
    if a.nrows() != b.nrows() {
        return Err(EkiError::ShapeMismatch(format!(
            "system is {}x{}, right-hand side has {} rows",
            a.nrows(),
            a.ncols(),
            b.nrows()
        )));
    }
    match cholesky(a) {
        Ok(l) => cholesky_solve(&l, b),
        Err(EkiError::LinAlg(_)) => {
            let pinv = pinv_symmetric(a, PINV_CUTOFF)?;
            Ok(pinv.dot(b))
        }
        Err(other) => Err(other),
    }
}

/// ln det A for a symmetric positive semi-definite matrix.
///
/// Returns `-inf` for singular matrices.
pub fn log_det_psd(a: &ArrayView2<'_, f64>) -> EkiResult<f64> {
    if let Ok(l) = cholesky(a) {
        return Ok(2.0 * l.diag().iter().map(|d| d.ln()).sum::<f64>());
    }
    let (values, _) = symmetric_eigen(a)?;
    Ok(values
        .iter()
        .map(|&l| if l > 0.0 { l.ln() } else { f64::NEG_INFINITY })
        .sum())
}

/// Block-diagonal matrix [A, 0; 0, B].
pub fn block_diag(a: &ArrayView2<'_, f64>, b: &ArrayView2<'_, f64>) -> Array2<f64> {
    let (ma, na) = a.dim();
    let (mb, nb) = b.dim();
    let mut out = Array2::zeros((ma + mb, na + nb));
    for i in 0..ma {
        for j in 0..na {
            out[[i, j]] = a[[i, j]];
        }
    }
    for i in 0..mb {
        for j in 0..nb {
            out[[ma + i, na + j]] = b[[i, j]];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn spd_3x3() -> Array2<f64> {
        array![[4.0, 1.0, 0.5], [1.0, 3.0, 0.2], [0.5, 0.2, 2.0]]
    }

    fn max_abs_diff(a: &Array2<f64>, b: &Array2<f64>) -> f64 {
        a.iter()
            .zip(b.iter())
            .fold(0.0_f64, |acc, (x, y)| acc.max((x - y).abs()))
    }

    #[test]
    fn test_cholesky_reconstructs() {
        let a = spd_3x3();
        let l = cholesky(&a.view()).unwrap();
        for i in 0..3 {
            for j in (i + 1)..3 {
                assert_eq!(l[[i, j]], 0.0, "L must be lower triangular");
            }
        }
        let rec = l.dot(&l.t());
        assert!(max_abs_diff(&rec, &a) < 1e-12);
    }

    #[test]
    fn test_cholesky_rejects_indefinite() {
        let a = array![[1.0, 2.0], [2.0, 1.0]];
        let err = cholesky(&a.view()).unwrap_err();
        match err {
            EkiError::LinAlg(msg) => assert!(msg.contains("not positive definite")),
            other => panic!("Unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_eigen_symmetric_2x2() {
        let a = array![[2.0, 1.0], [1.0, 2.0]];
        let (vals, vecs) = symmetric_eigen(&a.view()).unwrap();
        assert!((vals[0] - 1.0).abs() < 1e-12);
        assert!((vals[1] - 3.0).abs() < 1e-12);
        let rec = spectral_map(&vals, &vecs, |l| l);
        assert!(max_abs_diff(&rec, &a) < 1e-12);
    }

    #[test]
    fn test_inverse_sqrt_squares_to_inverse() {
        let a = spd_3x3();
        let inv = symmetric_inverse(&a.view()).unwrap();
        let inv_sqrt = symmetric_inverse_sqrt(&a.view()).unwrap();
        assert!(max_abs_diff(&inv_sqrt.dot(&inv_sqrt), &inv) < 1e-12);
        assert!(max_abs_diff(&a.dot(&inv), &Array2::eye(3)) < 1e-12);
    }

    #[test]
    fn test_solve_symmetric_singular_falls_back() {
        // Rank-1 system with a consistent right-hand side.
        let a = array![[1.0, 1.0], [1.0, 1.0]];
        let b = array![[2.0], [2.0]];
        let x = solve_symmetric(&a.view(), &b.view()).unwrap();
        assert!((x[[0, 0]] - 1.0).abs() < 1e-12);
        assert!((x[[1, 0]] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_log_det_matches_product() {
        let a = array![[2.0, 0.0], [0.0, 5.0]];
        assert!((log_det_psd(&a.view()).unwrap() - 10.0_f64.ln()).abs() < 1e-12);
        let singular = array![[1.0, 1.0], [1.0, 1.0]];
        assert_eq!(log_det_psd(&singular.view()).unwrap(), f64::NEG_INFINITY);
    }

    #[test]
    fn test_block_diag_layout() {
        let a = array![[1.0, 2.0], [3.0, 4.0]];
        let b = array![[5.0]];
        let out = block_diag(&a.view(), &b.view());
        assert_eq!(out.dim(), (3, 3));
        assert_eq!(out[[1, 0]], 3.0);
        assert_eq!(out[[2, 2]], 5.0);
        assert_eq!(out[[0, 2]], 0.0);
        assert_eq!(out[[2, 1]], 0.0);
    }
}
