// ─────────────────────────────────────────────────────────────────────
// SCPN Calibration — Iteration Summary
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Immutable per-iteration snapshot of the ensemble in constrained space.

use crate::observations::ObservationSpace;
use crate::resampling::count_failures;
use crate::transforms::{covariance_transform, constrained_point, transform_to_constrained};
use eki_math::stats::{covariance, ensemble_mean};
use eki_types::config::Prior;
use eki_types::error::EkiResult;
use ndarray::{Array1, Array2, ArrayView2};
use std::fmt;

#[derive(Debug, Clone)]
pub struct IterationSummary {
    pub iteration: i64,
    pub pseudotime: f64,
    pub pseudo_step: f64,
    pub parameter_names: Vec<String>,
    /// Constrained particles, `(Nθ, J)`.
    pub parameters: Array2<f64>,
    /// Constrained image of the unconstrained ensemble mean.
    pub ensemble_mean: Array1<f64>,
    /// Linearized constrained covariance at the unconstrained mean.
    pub ensemble_covariance: Array2<f64>,
    pub ensemble_variance: Array1<f64>,
    /// ‖y − G_k‖² / Nobs per particle.
    pub mean_square_errors: Vec<f64>,
    /// (Φ_data, Φ_prior) per particle.
    pub objective_values: Vec<(f64, f64)>,
    pub failed_particles: usize,
}

impl IterationSummary {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        iteration: i64,
        pseudotime: f64,
        pseudo_step: f64,
        parameter_names: &[String],
        priors: &[Prior],
        x: &ArrayView2<'_, f64>,
        g: &ArrayView2<'_, f64>,
        failures: &[bool],
        observations: &ObservationSpace,
    ) -> EkiResult<Self> {
        let mean_u = ensemble_mean(x);
        let cov_u = covariance(x, true);
        let ensemble_covariance = covariance_transform(priors, &mean_u.view(), &cov_u.view())?;
        let ensemble_variance = ensemble_covariance.diag().to_owned();

        let mean_square_errors = g
            .columns()
            .into_iter()
            .map(|col| observations.mean_square_error(&col))
            .collect();
        let objective_values = x
            .columns()
            .into_iter()
            .zip(g.columns())
            .map(|(theta, gk)| {
                (
                    observations.data_misfit(&gk),
                    observations.prior_misfit(&theta),
                )
            })
            .collect();

        Ok(Self {
            iteration,
            pseudotime,
            pseudo_step,
            parameter_names: parameter_names.to_vec(),
            parameters: transform_to_constrained(priors, x)?,
            ensemble_mean: constrained_point(priors, &mean_u.view()),
            ensemble_covariance,
            ensemble_variance,
            mean_square_errors,
            objective_values,
            failed_particles: count_failures(failures),
        })
    }

    pub fn ensemble_size(&self) -> usize {
        self.parameters.ncols()
    }

    /// Φ_data + Φ_prior per particle.
    pub fn total_objectives(&self) -> Vec<f64> {
        self.objective_values.iter().map(|(d, p)| d + p).collect()
    }

    /// Indices of the particles with the lowest and highest finite objective.
    pub fn best_and_worst(&self) -> Option<(usize, usize)> {
        let totals = self.total_objectives();
        let finite = totals.iter().enumerate().filter(|(_, v)| v.is_finite());
        let mut best: Option<(usize, f64)> = None;
        let mut worst: Option<(usize, f64)> = None;
        for (k, &v) in finite {
            if best.map_or(true, |(_, b)| v < b) {
                best = Some((k, v));
            }
            if worst.map_or(true, |(_, w)| v > w) {
                worst = Some((k, v));
            }
        }
        Some((best?.0, worst?.0))
    }

    /// Mean of the per-particle mean-square errors over finite entries.
    pub fn mean_square_error(&self) -> f64 {
        let finite: Vec<f64> = self
            .mean_square_errors
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .collect();
        eki_math::stats::mean(&finite)
    }
}

impl fmt::Display for IterationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "IterationSummary(iteration={}, pseudotime={:.4e}, pseudo_step={:.4e}, failed={})",
            self.iteration, self.pseudotime, self.pseudo_step, self.failed_particles
        )?;
        let width = self
            .parameter_names
            .iter()
            .map(|n| n.chars().count())
            .max()
            .unwrap_or(0)
            .max(9);
        writeln!(
            f,
            "{:>width$} {:>12} {:>12} {:>12} {:>12} {:>12} {:>12}",
            "", "mean", "best", "worst", "min", "max", "std"
        )?;
        let extremes = self.best_and_worst();
        for (i, name) in self.parameter_names.iter().enumerate() {
            let row = self.parameters.row(i);
            let min = row.iter().copied().fold(f64::INFINITY, f64::min);
            let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let (best, worst) = match extremes {
                Some((b, w)) => (row[b], row[w]),
                None => (f64::NAN, f64::NAN),
            };
            writeln!(
                f,
                "{:>width$} {:>12.4e} {:>12.4e} {:>12.4e} {:>12.4e} {:>12.4e} {:>12.4e}",
                name,
                self.ensemble_mean[i],
                best,
                worst,
                min,
                max,
                self.ensemble_variance[i].sqrt()
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eki_types::config::NoiseCovariance;
    use ndarray::array;

    fn summary() -> IterationSummary {
        let priors = [
            Prior::LogNormal { mu: 0.0, sigma: 1.0 },
            Prior::Normal { mean: 0.0, std: 1.0 },
        ];
        let obs = ObservationSpace::new(
            array![1.0, 2.0],
            &NoiseCovariance::Scalar { variance: 1.0 },
            &priors,
            false,
        )
        .unwrap();
        let x = array![[0.0, 1.0, -1.0], [2.0, 0.0, 1.0]];
        let g = array![[1.0, 0.0, 5.0], [2.0, 2.0, 0.0]];
        IterationSummary::new(
            0,
            1.0,
            1.0,
            &["Cᴷu".to_string(), "offset".to_string()],
            &priors,
            &x.view(),
            &g.view(),
            &[false; 3],
            &obs,
        )
        .unwrap()
    }

    #[test]
    fn test_summary_statistics() {
        let s = summary();
        assert_eq!(s.ensemble_size(), 3);
        assert!((s.ensemble_mean[0] - 1.0).abs() < 1e-15);
        assert!((s.ensemble_mean[1] - 1.0).abs() < 1e-15);
        assert!((s.parameters[[0, 1]] - std::f64::consts::E).abs() < 1e-12);
        assert_eq!(s.mean_square_errors, vec![0.0, 0.5, 10.0]);
        assert_eq!(s.objective_values[0], (0.0, 0.0));
        assert_eq!(s.best_and_worst(), Some((0, 2)));
        assert_eq!(s.ensemble_variance.len(), 2);
    }

    #[test]
    fn test_display_lists_every_parameter() {
        let text = summary().to_string();
        assert!(text.contains("iteration=0"));
        assert!(text.contains("Cᴷu"));
        assert!(text.contains("offset"));
        assert!(text.contains("worst"));
        assert_eq!(text.lines().count(), 4);
    }
}
