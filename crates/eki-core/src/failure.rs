// ─────────────────────────────────────────────────────────────────────
// SCPN Calibration — Particle Failure Detection
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Classification of ensemble members whose forward evaluation failed.

use crate::observations::ObservationSpace;
use eki_math::stats::{
    mean, mean_absolute_deviation, median, median_absolute_deviation, standard_deviation,
};
use eki_types::config::{Baseline, FailureCriterion, Spread};
use ndarray::ArrayView2;
use std::fmt;

/// Flags failed particles. `true` marks a failed column of `g`.
pub trait FailureDetector: fmt::Debug {
    fn classify(
        &self,
        x: &ArrayView2<'_, f64>,
        g: &ArrayView2<'_, f64>,
        observations: &ObservationSpace,
    ) -> Vec<bool>;
}

/// A column fails when its Euclidean norm is non-finite or exceeds
/// `threshold × median(finite norms)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormExceedsMedian {
    pub threshold: f64,
}

impl FailureDetector for NormExceedsMedian {
    fn classify(
        &self,
        _x: &ArrayView2<'_, f64>,
        g: &ArrayView2<'_, f64>,
        _observations: &ObservationSpace,
    ) -> Vec<bool> {
        let norms: Vec<f64> = g
            .columns()
            .into_iter()
            .map(|col| col.dot(&col).sqrt())
            .collect();
        let finite: Vec<f64> = norms.iter().copied().filter(|n| n.is_finite()).collect();
        let limit = self.threshold * median(&finite);
        norms.iter().map(|&n| !n.is_finite() || n > limit).collect()
    }
}

/// A column fails when its data misfit Φ is non-finite or exceeds
/// `baseline(Φ) + multiple × spread(Φ)`, statistics taken over finite Φ.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObjectiveLossThreshold {
    pub multiple: f64,
    pub baseline: Baseline,
    pub spread: Spread,
}

impl ObjectiveLossThreshold {
    pub fn limit(&self, losses: &[f64]) -> f64 {
        let center = match self.baseline {
            Baseline::Median => median(losses),
            Baseline::Mean => mean(losses),
        };
        let spread = match self.spread {
            Spread::MedianAbsoluteDeviation => median_absolute_deviation(losses),
            Spread::MeanAbsoluteDeviation => mean_absolute_deviation(losses),
            Spread::StandardDeviation => standard_deviation(losses),
        };
        center + self.multiple * spread
    }
}

impl FailureDetector for ObjectiveLossThreshold {
    fn classify(
        &self,
        _x: &ArrayView2<'_, f64>,
        g: &ArrayView2<'_, f64>,
        observations: &ObservationSpace,
    ) -> Vec<bool> {
        let losses = observations.data_misfits(g);
        let finite: Vec<f64> = losses.iter().copied().filter(|l| l.is_finite()).collect();
        if finite.is_empty() {
            return vec![true; losses.len()];
        }
        let limit = self.limit(&finite);
        losses.iter().map(|&l| !l.is_finite() || l > limit).collect()
    }
}

impl FailureDetector for FailureCriterion {
    fn classify(
        &self,
        x: &ArrayView2<'_, f64>,
        g: &ArrayView2<'_, f64>,
        observations: &ObservationSpace,
    ) -> Vec<bool> {
        match *self {
            FailureCriterion::NormExceedsMedian { threshold } => {
                NormExceedsMedian { threshold }.classify(x, g, observations)
            }
            FailureCriterion::ObjectiveLossThreshold {
                multiple,
                baseline,
                spread,
            } => ObjectiveLossThreshold {
                multiple,
                baseline,
                spread,
            }
            .classify(x, g, observations),
        }
    }
}

impl<D: FailureDetector + ?Sized> FailureDetector for Box<D> {
    fn classify(
        &self,
        x: &ArrayView2<'_, f64>,
        g: &ArrayView2<'_, f64>,
        observations: &ObservationSpace,
    ) -> Vec<bool> {
        (**self).classify(x, g, observations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eki_types::config::{NoiseCovariance, Prior};
    use ndarray::{array, Array1, Array2};

    fn space(n_obs: usize) -> ObservationSpace {
        ObservationSpace::new(
            Array1::zeros(n_obs),
            &NoiseCovariance::Scalar { variance: 1.0 },
            &[Prior::Normal { mean: 0.0, std: 1.0 }],
            false,
        )
        .unwrap()
    }

    #[test]
    fn test_norm_detector_flags_non_finite_and_outliers() {
        let g = array![[1.0, 1.0, f64::NAN, 1.0, 1e12], [0.0, 0.0, 0.0, f64::INFINITY, 0.0]];
        let x = Array2::zeros((1, 5));
        let flags = NormExceedsMedian { threshold: 1e9 }.classify(&x.view(), &g.view(), &space(2));
        assert_eq!(flags, vec![false, false, true, true, true]);
    }

    #[test]
    fn test_norm_detector_all_non_finite_fails_all() {
        let g = array![[f64::NAN, f64::INFINITY]];
        let x = Array2::zeros((1, 2));
        let flags = NormExceedsMedian { threshold: 1e9 }.classify(&x.view(), &g.view(), &space(1));
        assert_eq!(flags, vec![true, true]);
    }

    #[test]
    fn test_loss_detector_uses_median_and_mad() {
        // Φ = ½ g² → 0.5, 0.5, 2.0, 0.5, 50
        let g = array![[1.0, -1.0, 2.0, 1.0, 10.0]];
        let x = Array2::zeros((1, 5));
        let detector = ObjectiveLossThreshold {
            multiple: 4.0,
            baseline: Baseline::Median,
            spread: Spread::MedianAbsoluteDeviation,
        };
        // median 0.5, MAD 0 → limit 0.5
        let flags = detector.classify(&x.view(), &g.view(), &space(1));
        assert_eq!(flags, vec![false, false, true, false, true]);
    }

    #[test]
    fn test_criterion_dispatch_matches_struct() {
        let g = array![[1.0, f64::NAN, 3.0]];
        let x = Array2::zeros((1, 3));
        let obs = space(1);
        let from_enum = FailureCriterion::default().classify(&x.view(), &g.view(), &obs);
        let direct = NormExceedsMedian { threshold: 1e9 }.classify(&x.view(), &g.view(), &obs);
        assert_eq!(from_enum, direct);

        let boxed: Box<dyn FailureDetector> = Box::new(FailureCriterion::default_objective_loss());
        assert_eq!(boxed.classify(&x.view(), &g.view(), &obs), vec![false, true, false]);
    }
}
