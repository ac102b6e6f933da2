// ─────────────────────────────────────────────────────────────────────
// SCPN Calibration — Ensemble Statistics
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Ensemble statistics.
//!
//! Ensembles are stored column-wise: an `(n, J)` matrix holds J samples
//! of an n-vector. Matrix covariances are population (divide by J) unless
//! `corrected` is requested.

use ndarray::{Array1, Array2, ArrayView2, Axis};

/// Mean over the ensemble (columns).
pub fn ensemble_mean(x: &ArrayView2<'_, f64>) -> Array1<f64> {
    x.mean_axis(Axis(1))
        .unwrap_or_else(|| Array1::zeros(x.nrows()))
}

/// Deviations from the ensemble mean, column-wise.
pub fn ensemble_deviations(x: &ArrayView2<'_, f64>) -> Array2<f64> {
    let mean = ensemble_mean(x);
    let mut dev = x.to_owned();
    for mut col in dev.columns_mut() {
        col -= &mean;
    }
    dev
}

/// Covariance of an ensemble.
///
/// `corrected = true` divides by J − 1 (J = 1 falls back to J).
pub fn covariance(x: &ArrayView2<'_, f64>, corrected: bool) -> Array2<f64> {
    let j = x.ncols();
    if j == 0 {
        return Array2::zeros((x.nrows(), x.nrows()));
    }
    let dev = ensemble_deviations(x);
    let denom = if corrected && j > 1 { j - 1 } else { j };
    dev.dot(&dev.t()) / denom as f64
}

/// Population cross-covariance between two ensembles with equal member count.
///
/// Returns an `(a.nrows(), b.nrows())` matrix.
pub fn cross_covariance(a: &ArrayView2<'_, f64>, b: &ArrayView2<'_, f64>) -> Array2<f64> {
    debug_assert_eq!(a.ncols(), b.ncols());
    let j = a.ncols();
    if j == 0 {
        return Array2::zeros((a.nrows(), b.nrows()));
    }
    let da = ensemble_deviations(a);
    let db = ensemble_deviations(b);
    da.dot(&db.t()) / j as f64
}

/// Median of a slice. Empty input gives 0.
pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        0.5 * (sorted[n / 2 - 1] + sorted[n / 2])
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population variance.
pub fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64
}

pub fn standard_deviation(values: &[f64]) -> f64 {
    variance(values).sqrt()
}

/// median(|v − median(v)|)
pub fn median_absolute_deviation(values: &[f64]) -> f64 {
    let m = median(values);
    let dev: Vec<f64> = values.iter().map(|v| (v - m).abs()).collect();
    median(&dev)
}

/// mean(|v − mean(v)|)
pub fn mean_absolute_deviation(values: &[f64]) -> f64 {
    let m = mean(values);
    let dev: Vec<f64> = values.iter().map(|v| (v - m).abs()).collect();
    mean(&dev)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_covariance_population_vs_corrected() {
        let x = array![[1.0, 2.0, 3.0, 4.0], [2.0, 4.0, 6.0, 8.0]];
        let pop = covariance(&x.view(), false);
        let cor = covariance(&x.view(), true);
        assert!((pop[[0, 0]] - 1.25).abs() < 1e-12);
        assert!((cor[[0, 0]] - 5.0 / 3.0).abs() < 1e-12);
        assert!((pop[[0, 1]] - 2.5).abs() < 1e-12);
        assert!((pop[[0, 1]] - pop[[1, 0]]).abs() < 1e-15);
    }

    #[test]
    fn test_cross_covariance_shape() {
        let x = array![[1.0, 2.0, 3.0]];
        let g = array![[3.0, 2.0, 1.0], [0.0, 0.0, 0.0]];
        let c = cross_covariance(&x.view(), &g.view());
        assert_eq!(c.dim(), (1, 2));
        assert!((c[[0, 0]] + 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(c[[0, 1]], 0.0);
    }

    #[test]
    fn test_median_even_odd_empty() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), 2.5);
        assert_eq!(median(&[]), 0.0);
    }

    #[test]
    fn test_spreads() {
        let v = [1.0, 2.0, 3.0, 4.0, 100.0];
        assert_eq!(median_absolute_deviation(&v), 1.0);
        assert!((mean(&v) - 22.0).abs() < 1e-12);
        assert!((mean_absolute_deviation(&v) - 31.2).abs() < 1e-12);
        assert!(standard_deviation(&v) > median_absolute_deviation(&v));
    }
}
