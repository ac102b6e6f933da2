// ─────────────────────────────────────────────────────────────────────
// SCPN Calibration — Parameter Transforms
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Bijections between constrained (physical) and unconstrained parameter space.
//!
//! | prior                | unconstrained → constrained        |
//! |----------------------|------------------------------------|
//! | normal               | identity                           |
//! | log-normal           | `exp(x)`                           |
//! | scaled logit-normal  | `L + (U − L) / (1 + exp(−x))`      |
//!
//! The estimation runs entirely in unconstrained space; summaries are
//! reported in constrained space.

use eki_math::stats::ensemble_mean;
use eki_types::config::Prior;
use eki_types::error::{EkiError, EkiResult};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::Rng;
use rand_distr::{Distribution, Normal};

fn logistic(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Constrained value → unconstrained value.
///
/// Values on or outside the support map to ±∞ or NaN; use
/// [`try_to_unconstrained`] when the input is not trusted.
pub fn to_unconstrained(prior: &Prior, value: f64) -> f64 {
    match *prior {
        Prior::Normal { .. } => value,
        Prior::LogNormal { .. } => value.ln(),
        Prior::ScaledLogitNormal { lower, upper, .. } => ((value - lower) / (upper - value)).ln(),
    }
}

/// Checked [`to_unconstrained`].
pub fn try_to_unconstrained(prior: &Prior, value: f64) -> EkiResult<f64> {
    let in_support = value.is_finite()
        && match *prior {
            Prior::Normal { .. } => true,
            Prior::LogNormal { .. } => value > 0.0,
            Prior::ScaledLogitNormal { lower, upper, .. } => lower < value && value < upper,
        };
    if !in_support {
        return Err(EkiError::OutOfSupport {
            value,
            message: support_description(prior),
        });
    }
    Ok(to_unconstrained(prior, value))
}

fn support_description(prior: &Prior) -> String {
    match *prior {
        Prior::Normal { .. } => "normal prior requires a finite value".to_string(),
        Prior::LogNormal { .. } => "log-normal prior requires a value > 0".to_string(),
        Prior::ScaledLogitNormal { lower, upper, .. } => {
            format!("scaled logit-normal prior requires {lower} < value < {upper}")
        }
    }
}

/// Unconstrained value → constrained value.
pub fn to_constrained(prior: &Prior, x: f64) -> f64 {
    match *prior {
        Prior::Normal { .. } => x,
        Prior::LogNormal { .. } => x.exp(),
        Prior::ScaledLogitNormal { lower, upper, .. } => lower + (upper - lower) * logistic(x),
    }
}

/// d(to_constrained)/dx at `x`.
pub fn constrained_derivative(prior: &Prior, x: f64) -> f64 {
    match *prior {
        Prior::Normal { .. } => 1.0,
        Prior::LogNormal { .. } => x.exp(),
        Prior::ScaledLogitNormal { lower, upper, .. } => {
            let s = logistic(x);
            (upper - lower) * s * (1.0 - s)
        }
    }
}

/// Mean and standard deviation of the prior in unconstrained space.
pub fn unconstrained_normal(prior: &Prior) -> (f64, f64) {
    match *prior {
        Prior::Normal { mean, std } => (mean, std),
        Prior::LogNormal { mu, sigma } | Prior::ScaledLogitNormal { mu, sigma, .. } => (mu, sigma),
    }
}

/// Prior mean vector μθ and diagonal covariance Γθ in unconstrained space.
pub fn prior_moments(priors: &[Prior]) -> (Array1<f64>, Array2<f64>) {
    let n = priors.len();
    let mut mean = Array1::zeros(n);
    let mut cov = Array2::zeros((n, n));
    for (i, prior) in priors.iter().enumerate() {
        let (mu, sigma) = unconstrained_normal(prior);
        mean[i] = mu;
        cov[[i, i]] = sigma * sigma;
    }
    (mean, cov)
}

/// Draw `count` particles from the priors, returned as an `(Nθ, count)`
/// unconstrained ensemble.
pub fn sample_unconstrained<R: Rng + ?Sized>(
    priors: &[Prior],
    count: usize,
    rng: &mut R,
) -> EkiResult<Array2<f64>> {
    let mut x = Array2::zeros((priors.len(), count));
    for (i, prior) in priors.iter().enumerate() {
        let (mu, sigma) = unconstrained_normal(prior);
        let normal = Normal::new(mu, sigma).map_err(|e| {
            EkiError::ConfigError(format!("prior {i} cannot be sampled: {e}"))
        })?;
        for k in 0..count {
            x[[i, k]] = normal.sample(rng);
        }
    }
    Ok(x)
}

fn check_rows(priors: &[Prior], rows: usize) -> EkiResult<()> {
    if priors.len() != rows {
        return Err(EkiError::ShapeMismatch(format!(
            "{} priors for an ensemble with {rows} parameter rows",
            priors.len()
        )));
    }
    Ok(())
}

/// Column-wise [`to_constrained`] over an `(Nθ, J)` ensemble.
pub fn transform_to_constrained(
    priors: &[Prior],
    x: &ArrayView2<'_, f64>,
) -> EkiResult<Array2<f64>> {
    check_rows(priors, x.nrows())?;
    Ok(Array2::from_shape_fn(x.dim(), |(i, k)| {
        to_constrained(&priors[i], x[[i, k]])
    }))
}

/// Column-wise [`try_to_unconstrained`] over an `(Nθ, J)` ensemble.
pub fn transform_to_unconstrained(
    priors: &[Prior],
    values: &ArrayView2<'_, f64>,
) -> EkiResult<Array2<f64>> {
    check_rows(priors, values.nrows())?;
    let mut x = Array2::zeros(values.dim());
    for ((i, k), v) in values.indexed_iter() {
        x[[i, k]] = try_to_unconstrained(&priors[i], *v)?;
    }
    Ok(x)
}

/// Constrained-space point for an unconstrained vector.
pub fn constrained_point(priors: &[Prior], x: &ArrayView1<'_, f64>) -> Array1<f64> {
    Array1::from_iter(
        priors
            .iter()
            .zip(x.iter())
            .map(|(p, &v)| to_constrained(p, v)),
    )
}

/// Linearized push-forward of an unconstrained covariance: `D Σ Dᵀ`,
/// `D = diag(d to_constrained / dx)` evaluated at `point`.
pub fn covariance_transform(
    priors: &[Prior],
    point: &ArrayView1<'_, f64>,
    cov: &ArrayView2<'_, f64>,
) -> EkiResult<Array2<f64>> {
    let n = priors.len();
    if point.len() != n || cov.dim() != (n, n) {
        return Err(EkiError::ShapeMismatch(format!(
            "covariance transform expects a point of length {n} and a {n}x{n} covariance"
        )));
    }
    let d: Vec<f64> = priors
        .iter()
        .zip(point.iter())
        .map(|(p, &x)| constrained_derivative(p, x))
        .collect();
    Ok(Array2::from_shape_fn((n, n), |(i, j)| d[i] * cov[[i, j]] * d[j]))
}

/// Constrained image of the unconstrained ensemble mean.
pub fn constrained_ensemble_mean(priors: &[Prior], x: &ArrayView2<'_, f64>) -> Array1<f64> {
    constrained_point(priors, &ensemble_mean(x).view())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn bounded() -> Prior {
        Prior::ScaledLogitNormal {
            lower: -1.0,
            upper: 3.0,
            mu: 0.0,
            sigma: 1.0,
        }
    }

    #[test]
    fn test_bounded_midpoint_is_zero() {
        assert!(to_unconstrained(&bounded(), 1.0).abs() < 1e-15);
        assert!((to_constrained(&bounded(), 0.0) - 1.0).abs() < 1e-15);
    }

    #[test]
    fn test_logistic_extremes_stay_in_bounds() {
        let p = bounded();
        assert_eq!(to_constrained(&p, 800.0), 3.0);
        assert_eq!(to_constrained(&p, -800.0), -1.0);
        assert!(constrained_derivative(&p, 800.0).abs() < 1e-300);
    }

    #[test]
    fn test_try_to_unconstrained_rejects_outside_support() {
        let lognormal = Prior::LogNormal { mu: 0.0, sigma: 1.0 };
        assert!(matches!(
            try_to_unconstrained(&lognormal, -1.0),
            Err(EkiError::OutOfSupport { .. })
        ));
        assert!(try_to_unconstrained(&bounded(), 3.0).is_err());
        assert!(try_to_unconstrained(&bounded(), 2.999).is_ok());
        assert!(try_to_unconstrained(&Prior::Normal { mean: 0.0, std: 1.0 }, f64::NAN).is_err());
    }

    #[test]
    fn test_derivative_matches_finite_difference() {
        let priors = [
            Prior::Normal { mean: 0.0, std: 1.0 },
            Prior::LogNormal { mu: 0.0, sigma: 1.0 },
            bounded(),
        ];
        let h = 1e-6;
        for p in &priors {
            for &x in &[-1.3, 0.0, 0.7] {
                let fd = (to_constrained(p, x + h) - to_constrained(p, x - h)) / (2.0 * h);
                assert!((fd - constrained_derivative(p, x)).abs() < 1e-7, "{p:?} at {x}");
            }
        }
    }

    #[test]
    fn test_covariance_transform_scales_by_jacobian() {
        let priors = [
            Prior::LogNormal { mu: 0.0, sigma: 1.0 },
            Prior::Normal { mean: 0.0, std: 1.0 },
        ];
        let point = array![2.0_f64.ln(), 5.0];
        let cov = array![[1.0, 0.5], [0.5, 4.0]];
        let out = covariance_transform(&priors, &point.view(), &cov.view()).unwrap();
        assert!((out[[0, 0]] - 4.0).abs() < 1e-12);
        assert!((out[[0, 1]] - 1.0).abs() < 1e-12);
        assert!((out[[1, 1]] - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_sample_unconstrained_moments() {
        let priors = [Prior::Normal { mean: 3.0, std: 0.5 }, bounded()];
        let mut rng = StdRng::seed_from_u64(11);
        let x = sample_unconstrained(&priors, 10_000, &mut rng).unwrap();
        assert_eq!(x.dim(), (2, 10_000));
        let mean = ensemble_mean(&x.view());
        assert!((mean[0] - 3.0).abs() < 0.03);
        assert!(mean[1].abs() < 0.05);
    }

    #[test]
    fn test_ensemble_transform_shape_check() {
        let priors = [bounded()];
        let x = Array2::zeros((2, 4));
        assert!(matches!(
            transform_to_constrained(&priors, &x.view()),
            Err(EkiError::ShapeMismatch(_))
        ));
    }
}
