// ─────────────────────────────────────────────────────────────────────
// SCPN Calibration — Observation Space
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Observations, noise and prior covariances with their precomputed
//! inverse and inverse-square-root forms.
//!
//! Everything here is computed once at engine construction. In Tikhonov
//! mode the observation vector is augmented with the prior mean and the
//! noise covariance with the prior covariance:
//!
//! ```text
//! y_aug = [y; μθ]    Γ_aug = [Γy 0; 0 Γθ]    G_aug = [G; X]
//! ```

use crate::transforms::prior_moments;
use eki_math::linalg::{block_diag, cholesky, symmetric_inverse, symmetric_inverse_sqrt};
use eki_types::config::{NoiseCovariance, Prior};
use eki_types::error::{EkiError, EkiResult};
use ndarray::{
    concatenate, Array, Array1, Array2, ArrayView, ArrayView1, ArrayView2, Axis, RemoveAxis,
};

const SYMMETRY_TOLERANCE: f64 = 1e-10;

fn stack_rows<D: RemoveAxis>(parts: &[ArrayView<'_, f64, D>]) -> EkiResult<Array<f64, D>> {
    concatenate(Axis(0), parts).map_err(|e| EkiError::ShapeMismatch(e.to_string()))
}

/// Promote a noise model to a dense `n × n` covariance and check it is SPD.
pub fn noise_matrix(noise: &NoiseCovariance, n: usize) -> EkiResult<Array2<f64>> {
    let matrix = match noise {
        NoiseCovariance::Scalar { variance } => {
            if !variance.is_finite() || *variance <= 0.0 {
                return Err(EkiError::ConfigError(format!(
                    "noise variance must be finite and > 0, got {variance}"
                )));
            }
            Array2::eye(n) * *variance
        }
        NoiseCovariance::Diagonal { variances } => {
            if variances.len() != n {
                return Err(EkiError::ShapeMismatch(format!(
                    "{} noise variances for {n} observations",
                    variances.len()
                )));
            }
            let mut m = Array2::zeros((n, n));
            for (i, &v) in variances.iter().enumerate() {
                if !v.is_finite() || v <= 0.0 {
                    return Err(EkiError::ConfigError(format!(
                        "noise variance {i} must be finite and > 0, got {v}"
                    )));
                }
                m[[i, i]] = v;
            }
            m
        }
        NoiseCovariance::Full { matrix } => {
            if matrix.len() != n || matrix.iter().any(|row| row.len() != n) {
                return Err(EkiError::ShapeMismatch(format!(
                    "noise covariance must be {n}x{n}"
                )));
            }
            let m = Array2::from_shape_fn((n, n), |(i, j)| matrix[i][j]);
            let scale = m.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
            for i in 0..n {
                for j in (i + 1)..n {
                    if (m[[i, j]] - m[[j, i]]).abs() > SYMMETRY_TOLERANCE * scale.max(1.0) {
                        return Err(EkiError::ConfigError(format!(
                            "noise covariance is not symmetric at ({i}, {j})"
                        )));
                    }
                }
            }
            m
        }
    };
    cholesky(&matrix.view()).map_err(|_| {
        EkiError::ConfigError("noise covariance must be positive definite".to_string())
    })?;
    Ok(matrix)
}

#[derive(Debug, Clone)]
pub struct ObservationSpace {
    y: Array1<f64>,
    noise: Array2<f64>,
    noise_inv: Array2<f64>,
    noise_inv_sqrt: Array2<f64>,
    prior_mean: Array1<f64>,
    prior_cov: Array2<f64>,
    prior_cov_inv: Array2<f64>,
    prior_cov_inv_sqrt: Array2<f64>,
    tikhonov: bool,
    y_aug: Array1<f64>,
    noise_aug: Array2<f64>,
    noise_aug_inv: Array2<f64>,
    noise_aug_factor: Array2<f64>,
}

impl ObservationSpace {
    pub fn new(
        y: Array1<f64>,
        noise: &NoiseCovariance,
        priors: &[Prior],
        tikhonov: bool,
    ) -> EkiResult<Self> {
        let noise = noise_matrix(noise, y.len())?;
        let noise_inv = symmetric_inverse(&noise.view())?;
        let noise_inv_sqrt = symmetric_inverse_sqrt(&noise.view())?;

        let (prior_mean, prior_cov) = prior_moments(priors);
        let prior_cov_inv = symmetric_inverse(&prior_cov.view())?;
        let prior_cov_inv_sqrt = symmetric_inverse_sqrt(&prior_cov.view())?;

        let (y_aug, noise_aug, noise_aug_inv) = if tikhonov {
            let y_aug = stack_rows(&[y.view(), prior_mean.view()])?;
            let noise_aug = block_diag(&noise.view(), &prior_cov.view());
            let noise_aug_inv = block_diag(&noise_inv.view(), &prior_cov_inv.view());
            (y_aug, noise_aug, noise_aug_inv)
        } else {
            (y.clone(), noise.clone(), noise_inv.clone())
        };
        let noise_aug_factor = cholesky(&noise_aug.view())?;

        Ok(Self {
            y,
            noise,
            noise_inv,
            noise_inv_sqrt,
            prior_mean,
            prior_cov,
            prior_cov_inv,
            prior_cov_inv_sqrt,
            tikhonov,
            y_aug,
            noise_aug,
            noise_aug_inv,
            noise_aug_factor,
        })
    }

    pub fn observations(&self) -> &Array1<f64> {
        &self.y
    }

    pub fn observation_len(&self) -> usize {
        self.y.len()
    }

    pub fn noise_covariance(&self) -> &Array2<f64> {
        &self.noise
    }

    pub fn prior_mean(&self) -> &Array1<f64> {
        &self.prior_mean
    }

    pub fn prior_covariance(&self) -> &Array2<f64> {
        &self.prior_cov
    }

    pub fn prior_covariance_inverse(&self) -> &Array2<f64> {
        &self.prior_cov_inv
    }

    pub fn tikhonov(&self) -> bool {
        self.tikhonov
    }

    /// Target of the update: `y`, or `[y; μθ]` in Tikhonov mode.
    pub fn target(&self) -> &Array1<f64> {
        &self.y_aug
    }

    /// Noise of the update: `Γy`, or `blockdiag(Γy, Γθ)` in Tikhonov mode.
    pub fn target_noise(&self) -> &Array2<f64> {
        &self.noise_aug
    }

    pub fn target_noise_inverse(&self) -> &Array2<f64> {
        &self.noise_aug_inv
    }

    /// Lower Cholesky factor L of the update noise, L Lᵀ = Γ.
    pub fn target_noise_factor(&self) -> &Array2<f64> {
        &self.noise_aug_factor
    }

    /// Forward outputs as seen by the update: `G`, or `[G; X]` in Tikhonov mode.
    pub fn augment(
        &self,
        x: &ArrayView2<'_, f64>,
        g: &ArrayView2<'_, f64>,
    ) -> EkiResult<Array2<f64>> {
        if self.tikhonov {
            stack_rows(&[g.view(), x.view()])
        } else {
            Ok(g.to_owned())
        }
    }

    /// Φ_data = ½‖Γy^{-1/2}(y − g)‖².
    pub fn data_misfit(&self, g: &ArrayView1<'_, f64>) -> f64 {
        let r = &self.y - g;
        0.5 * self.noise_inv_sqrt.dot(&r).mapv(|v| v * v).sum()
    }

    /// Φ_prior = ½‖Γθ^{-1/2}(θ − μθ)‖² in Tikhonov mode, otherwise 0.
    pub fn prior_misfit(&self, theta: &ArrayView1<'_, f64>) -> f64 {
        if !self.tikhonov {
            return 0.0;
        }
        let r = theta - &self.prior_mean;
        0.5 * self.prior_cov_inv_sqrt.dot(&r).mapv(|v| v * v).sum()
    }

    /// Per-column Φ_data.
    pub fn data_misfits(&self, g: &ArrayView2<'_, f64>) -> Vec<f64> {
        g.columns()
            .into_iter()
            .map(|col| self.data_misfit(&col))
            .collect()
    }

    /// Per-column misfit against the update target, used by adaptive steps.
    pub fn target_misfits(&self, g_aug: &ArrayView2<'_, f64>) -> Vec<f64> {
        g_aug
            .columns()
            .into_iter()
            .map(|col| {
                let r = &self.y_aug - &col;
                0.5 * r.dot(&self.noise_aug_inv.dot(&r))
            })
            .collect()
    }

    /// ‖y − g‖² / Nobs.
    pub fn mean_square_error(&self, g: &ArrayView1<'_, f64>) -> f64 {
        let r = &self.y - g;
        r.dot(&r) / self.y.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn priors() -> Vec<Prior> {
        vec![
            Prior::Normal { mean: 1.0, std: 2.0 },
            Prior::LogNormal { mu: 0.5, sigma: 0.5 },
        ]
    }

    #[test]
    fn test_scalar_noise_promotes_to_identity() {
        let m = noise_matrix(&NoiseCovariance::Scalar { variance: 0.01 }, 3).unwrap();
        assert_eq!(m.dim(), (3, 3));
        assert!((m[[1, 1]] - 0.01).abs() < 1e-18);
        assert_eq!(m[[0, 1]], 0.0);
    }

    #[test]
    fn test_noise_validation() {
        let asym = NoiseCovariance::Full {
            matrix: vec![vec![1.0, 0.2], vec![0.1, 1.0]],
        };
        assert!(noise_matrix(&asym, 2).is_err());
        let indefinite = NoiseCovariance::Full {
            matrix: vec![vec![1.0, 2.0], vec![2.0, 1.0]],
        };
        assert!(noise_matrix(&indefinite, 2).is_err());
        let short = NoiseCovariance::Diagonal {
            variances: vec![1.0],
        };
        assert!(matches!(noise_matrix(&short, 2), Err(EkiError::ShapeMismatch(_))));
    }

    #[test]
    fn test_tikhonov_augmentation_shapes() {
        let obs = ObservationSpace::new(
            array![0.0, 1.0, 2.0],
            &NoiseCovariance::Scalar { variance: 0.5 },
            &priors(),
            true,
        )
        .unwrap();
        assert_eq!(obs.target().len(), 5);
        assert_eq!(obs.target()[3], 1.0);
        assert_eq!(obs.target()[4], 0.5);
        assert_eq!(obs.target_noise().dim(), (5, 5));
        assert!((obs.target_noise()[[3, 3]] - 4.0).abs() < 1e-15);
        assert!((obs.target_noise_inverse()[[4, 4]] - 4.0).abs() < 1e-12);

        let x = Array2::zeros((2, 4));
        let g = Array2::ones((3, 4));
        assert_eq!(obs.augment(&x.view(), &g.view()).unwrap().dim(), (5, 4));
    }

    #[test]
    fn test_cached_noise_factor_reproduces_target_noise() {
        let full = NoiseCovariance::Full {
            matrix: vec![vec![2.0, 0.3], vec![0.3, 1.0]],
        };
        for tikhonov in [false, true] {
            let obs = ObservationSpace::new(array![0.5, -0.5], &full, &priors(), tikhonov).unwrap();
            let l = obs.target_noise_factor();
            let rebuilt = l.dot(&l.t());
            let diff = (&rebuilt - obs.target_noise())
                .iter()
                .fold(0.0_f64, |acc, v| acc.max(v.abs()));
            assert!(diff < 1e-12, "tikhonov={tikhonov}, diff={diff}");
            assert_eq!(l[[0, 1]], 0.0);
        }
        let plain = ObservationSpace::new(array![0.5, -0.5], &full, &priors(), false).unwrap();
        assert_eq!(plain.noise_covariance(), plain.target_noise());
        assert_eq!(plain.observations(), plain.target());
    }

    #[test]
    fn test_misfits() {
        let obs = ObservationSpace::new(
            array![1.0, 1.0],
            &NoiseCovariance::Scalar { variance: 0.25 },
            &priors(),
            true,
        )
        .unwrap();
        // r = (1, 1), Γ^{-1/2} = 2 I → ½ · 8 = 4
        assert!((obs.data_misfit(&array![0.0, 0.0].view()) - 4.0).abs() < 1e-12);
        // θ − μ = (2, 0.5) scaled by (1/2, 2) → ½ (1 + 1) = 1
        assert!((obs.prior_misfit(&array![3.0, 1.0].view()) - 1.0).abs() < 1e-12);
        assert!((obs.mean_square_error(&array![0.0, 3.0].view()) - 2.5).abs() < 1e-12);

        let plain = ObservationSpace::new(
            array![1.0, 1.0],
            &NoiseCovariance::Scalar { variance: 0.25 },
            &priors(),
            false,
        )
        .unwrap();
        assert_eq!(plain.prior_misfit(&array![3.0, 1.0].view()), 0.0);
        assert_eq!(plain.target().len(), 2);
    }
}
