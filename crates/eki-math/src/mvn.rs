// ─────────────────────────────────────────────────────────────────────
// SCPN Calibration — Multivariate Normal Sampling
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Multivariate normal distribution with a precomputed factor.
//!
//! Draws are `mean + F z` with z ~ N(0, I) and F Fᵀ = Σ. F is the
//! Cholesky factor when Σ is positive definite, otherwise the eigen
//! factor V diag(√max(λ, 0)), so rank-deficient ensembles still sample.

use crate::linalg::{cholesky, symmetric_eigen};
use crate::stats::{covariance, ensemble_mean};
use eki_types::error::{EkiError, EkiResult};
use ndarray::{Array1, Array2, ArrayView2};
use rand::Rng;
use rand_distr::StandardNormal;

#[derive(Debug, Clone)]
pub struct MultivariateNormal {
    mean: Array1<f64>,
    factor: Array2<f64>,
}

impl MultivariateNormal {
    pub fn new(mean: Array1<f64>, cov: &ArrayView2<'_, f64>) -> EkiResult<Self> {
        let n = mean.len();
        if cov.dim() != (n, n) {
            return Err(EkiError::ShapeMismatch(format!(
                "covariance is {}x{}, mean has length {n}",
                cov.nrows(),
                cov.ncols()
            )));
        }
        let factor = match cholesky(cov) {
            Ok(l) => l,
            Err(EkiError::LinAlg(_)) => {
                let (values, mut vectors) = symmetric_eigen(cov)?;
                for (k, &l) in values.iter().enumerate() {
                    let s = l.max(0.0).sqrt();
                    vectors.column_mut(k).mapv_inplace(|v| v * s);
                }
                vectors
            }
            Err(other) => return Err(other),
        };
        Ok(Self { mean, factor })
    }

    /// Fit to an ensemble (columns are samples) with the corrected covariance.
    pub fn fit(samples: &ArrayView2<'_, f64>) -> EkiResult<Self> {
        if samples.ncols() == 0 {
            return Err(EkiError::ShapeMismatch(
                "cannot fit a distribution to an empty ensemble".to_string(),
            ));
        }
        let mean = ensemble_mean(samples);
        let cov = covariance(samples, true);
        Self::new(mean, &cov.view())
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Array1<f64> {
        let z = Array1::from_iter((0..self.dim()).map(|_| rng.sample::<f64, _>(StandardNormal)));
        &self.mean + &self.factor.dot(&z)
    }

    /// `count` independent draws stored as columns of a `(dim, count)` matrix.
    pub fn sample_columns<R: Rng + ?Sized>(&self, count: usize, rng: &mut R) -> Array2<f64> {
        let n = self.dim();
        let z = Array2::from_shape_fn((n, count), |_| rng.sample::<f64, _>(StandardNormal));
        let mut out = self.factor.dot(&z);
        for mut col in out.columns_mut() {
            col += &self.mean;
        }
        out
    }
}
