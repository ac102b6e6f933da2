// ─────────────────────────────────────────────────────────────────────
// SCPN Calibration — Failed Particle Resampling
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Replacement of failed ensemble members.
//!
//! Replacements are drawn from a multivariate normal fitted to the
//! successful (or all) particles and are only accepted once their own
//! forward evaluation succeeds. Successful columns are never moved.

use crate::failure::FailureDetector;
use crate::observations::ObservationSpace;
use crate::problem::{ForwardMap, InverseProblem};
use eki_math::mvn::MultivariateNormal;
use eki_types::config::{Resampler, ResamplingDistribution};
use eki_types::error::{EkiError, EkiResult};
use ndarray::{Array2, ArrayView2, Axis};
use rand::Rng;
use tracing::{info, warn};

/// Ensemble state after the failure/resample cycle.
#[derive(Debug, Clone)]
pub struct Resampled {
    pub x: Array2<f64>,
    pub g: Array2<f64>,
    pub failures: Vec<bool>,
    /// Number of columns replaced.
    pub replaced: usize,
}

pub fn count_failures(failures: &[bool]) -> usize {
    failures.iter().filter(|&&f| f).count()
}

/// Indices of columns with `flag == wanted`.
pub fn columns_where(failures: &[bool], wanted: bool) -> Vec<usize> {
    failures
        .iter()
        .enumerate()
        .filter(|&(_, &f)| f == wanted)
        .map(|(k, _)| k)
        .collect()
}

/// Fatal-threshold checks in order: all failed, then the abort fraction.
pub fn check_failure_fraction(
    resampler: &Resampler,
    failures: &[bool],
    iteration: i64,
) -> EkiResult<()> {
    let failed = count_failures(failures);
    let ensemble_size = failures.len();
    if failed == 0 {
        return Ok(());
    }
    if failed == ensemble_size {
        return Err(EkiError::AllParticlesFailed {
            iteration,
            ensemble_size,
        });
    }
    let fraction = failed as f64 / ensemble_size as f64;
    if fraction >= resampler.abort_failure_fraction {
        return Err(EkiError::FatalResamplingFailure {
            failed,
            ensemble_size,
            fraction,
            threshold: resampler.abort_failure_fraction,
        });
    }
    Ok(())
}

/// Run the failure/resample cycle on a freshly evaluated ensemble.
#[allow(clippy::too_many_arguments)]
pub fn resample<F, D, R>(
    resampler: &Resampler,
    detector: &D,
    problem: &InverseProblem<F>,
    observations: &ObservationSpace,
    x: Array2<f64>,
    g: Array2<f64>,
    failures: Vec<bool>,
    iteration: i64,
    rng: &mut R,
) -> EkiResult<Resampled>
where
    F: ForwardMap,
    D: FailureDetector + ?Sized,
    R: Rng + ?Sized,
{
    let failed = count_failures(&failures);
    if failed == 0 {
        return Ok(Resampled {
            x,
            g,
            failures,
            replaced: 0,
        });
    }
    check_failure_fraction(resampler, &failures, iteration)?;

    let ensemble_size = failures.len();
    let fraction = failed as f64 / ensemble_size as f64;
    if fraction < resampler.resample_failure_fraction {
        warn!(
            iteration,
            failed,
            ensemble_size,
            "{failed} particles failed; below the resampling fraction, keeping them"
        );
        return Ok(Resampled {
            x,
            g,
            failures,
            replaced: 0,
        });
    }
    warn!(
        iteration,
        failed,
        ensemble_size,
        "{failed} particles failed; resampling"
    );

    let source = match resampler.distribution {
        ResamplingDistribution::SuccessfulParticles => {
            x.select(Axis(1), &columns_where(&failures, false))
        }
        ResamplingDistribution::FullEnsemble => x.clone(),
    };
    let targets = if resampler.only_failed_particles {
        columns_where(&failures, true)
    } else {
        (0..ensemble_size).collect()
    };
    let needed = targets.len();
    let (new_x, new_g) = search_replacements(
        resampler,
        detector,
        problem,
        observations,
        &source.view(),
        needed,
        ensemble_size,
        rng,
    )?;

    let mut x = x;
    let mut g = g;
    for (slot, &k) in targets.iter().enumerate() {
        x.column_mut(k).assign(&new_x.column(slot));
        g.column_mut(k).assign(&new_g.column(slot));
    }
    info!(iteration, replaced = needed, "resampled failed particles");

    Ok(Resampled {
        x,
        g,
        failures: vec![false; ensemble_size],
        replaced: needed,
    })
}

/// Draw candidate batches until `needed` successful candidates are found.
#[allow(clippy::too_many_arguments)]
fn search_replacements<F, D, R>(
    resampler: &Resampler,
    detector: &D,
    problem: &InverseProblem<F>,
    observations: &ObservationSpace,
    source: &ArrayView2<'_, f64>,
    needed: usize,
    batch_size: usize,
    rng: &mut R,
) -> EkiResult<(Array2<f64>, Array2<f64>)>
where
    F: ForwardMap,
    D: FailureDetector + ?Sized,
    R: Rng + ?Sized,
{
    let distribution = MultivariateNormal::fit(source)?;
    let mut batches: Vec<(Array2<f64>, Array2<f64>)> = Vec::new();
    let mut accepted: Vec<(usize, usize)> = Vec::with_capacity(needed);

    for round in 0..resampler.max_search_rounds {
        let candidates = distribution.sample_columns(batch_size, rng);
        let outputs = problem.evaluate(&candidates)?;
        let flags = detector.classify(&candidates.view(), &outputs.view(), observations);
        for k in columns_where(&flags, false) {
            if accepted.len() == needed {
                break;
            }
            accepted.push((round, k));
        }
        batches.push((candidates, outputs));
        if accepted.len() == needed {
            break;
        }
    }

    if accepted.len() < needed {
        return Err(EkiError::ResamplingExhausted {
            rounds: resampler.max_search_rounds,
            found: accepted.len(),
            needed,
        });
    }

    let mut new_x = Array2::zeros((source.nrows(), needed));
    let mut new_g = Array2::zeros((observations.observation_len(), needed));
    for (slot, &(round, k)) in accepted.iter().enumerate() {
        let (cx, cg) = &batches[round];
        new_x.column_mut(slot).assign(&cx.column(k));
        new_g.column_mut(slot).assign(&cg.column(k));
    }
    Ok((new_x, new_g))
}

/// Fill the failed columns of an updated ensemble from a normal fitted to
/// its successful columns.
pub fn fill_failed_particles<R: Rng + ?Sized>(
    x: &mut Array2<f64>,
    failures: &[bool],
    rng: &mut R,
) -> EkiResult<()> {
    let failed = columns_where(failures, true);
    if failed.is_empty() {
        return Ok(());
    }
    let successful = x.select(Axis(1), &columns_where(failures, false));
    let distribution = MultivariateNormal::fit(&successful.view())?;
    let draws = distribution.sample_columns(failed.len(), rng);
    for (slot, &k) in failed.iter().enumerate() {
        x.column_mut(k).assign(&draws.column(slot));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::NormExceedsMedian;
    use crate::problem::FreeParameters;
    use eki_types::config::{NamedPrior, NoiseCovariance, Prior};
    use ndarray::{array, Array1};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    type Map = fn(&Array2<f64>) -> Array2<f64>;

    fn identity(x: &Array2<f64>) -> Array2<f64> {
        x.clone()
    }

    fn setup() -> (InverseProblem<Map>, ObservationSpace) {
        let params = FreeParameters::new(vec![
            NamedPrior {
                name: "a".to_string(),
                prior: Prior::Normal { mean: 0.0, std: 1.0 },
            },
            NamedPrior {
                name: "b".to_string(),
                prior: Prior::Normal { mean: 0.0, std: 1.0 },
            },
        ])
        .unwrap();
        let problem = InverseProblem::new(Array1::zeros(2), params, identity as Map).unwrap();
        let obs = ObservationSpace::new(
            Array1::zeros(2),
            &NoiseCovariance::Scalar { variance: 1.0 },
            &problem.free_parameters().priors(),
            false,
        )
        .unwrap();
        (problem, obs)
    }

    fn ensemble() -> Array2<f64> {
        array![
            [0.1, 0.5, -0.3, 0.2, 0.9, -0.7, 0.0, 0.4, -0.1, 0.6],
            [0.3, -0.2, 0.8, -0.5, 0.1, 0.2, -0.9, 0.7, 0.4, -0.6]
        ]
    }

    #[test]
    fn test_successful_columns_are_untouched() {
        let (problem, obs) = setup();
        let x = ensemble();
        let mut g = x.clone();
        g[[0, 2]] = f64::NAN;
        g[[1, 7]] = f64::INFINITY;
        let detector = NormExceedsMedian { threshold: 1e9 };
        let failures = detector.classify(&x.view(), &g.view(), &obs);
        let mut rng = StdRng::seed_from_u64(5);
        let out = resample(
            &Resampler::default(),
            &detector,
            &problem,
            &obs,
            x.clone(),
            g,
            failures,
            0,
            &mut rng,
        )
        .unwrap();

        assert_eq!(out.x.dim(), (2, 10));
        assert_eq!(out.replaced, 2);
        for k in [0, 1, 3, 4, 5, 6, 8, 9] {
            assert_eq!(out.x.column(k), x.column(k));
        }
        assert!(out.g.iter().all(|v| v.is_finite()));
        assert!(out.failures.iter().all(|f| !f));
    }

    #[test]
    fn test_abort_threshold_is_inclusive() {
        let resampler = Resampler {
            abort_failure_fraction: 0.3,
            ..Default::default()
        };
        let mut failures = vec![false; 10];
        failures[0] = true;
        failures[1] = true;
        assert!(check_failure_fraction(&resampler, &failures, 0).is_ok());
        failures[2] = true;
        let err = check_failure_fraction(&resampler, &failures, 0).unwrap_err();
        assert!(matches!(err, EkiError::FatalResamplingFailure { failed: 3, .. }));
    }

    #[test]
    fn test_all_failed_is_reported_first() {
        let resampler = Resampler {
            abort_failure_fraction: 0.5,
            ..Default::default()
        };
        let err = check_failure_fraction(&resampler, &[true; 4], 2).unwrap_err();
        assert!(matches!(
            err,
            EkiError::AllParticlesFailed {
                iteration: 2,
                ensemble_size: 4
            }
        ));
    }

    #[test]
    fn test_tolerated_failures_are_kept() {
        let (problem, obs) = setup();
        let x = ensemble();
        let mut g = x.clone();
        g[[0, 4]] = f64::NAN;
        let mut failures = vec![false; 10];
        failures[4] = true;
        let resampler = Resampler {
            resample_failure_fraction: 0.2,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(0);
        let detector = NormExceedsMedian { threshold: 1e9 };
        let out = resample(
            &resampler,
            &detector,
            &problem,
            &obs,
            x,
            g,
            failures,
            0,
            &mut rng,
        )
        .unwrap();
        assert_eq!(out.replaced, 0);
        assert!(out.failures[4]);
        assert!(out.g[[0, 4]].is_nan());
    }

    #[test]
    fn test_search_exhausts_when_every_candidate_fails() {
        let params = FreeParameters::new(vec![NamedPrior {
            name: "a".to_string(),
            prior: Prior::Normal { mean: 0.0, std: 1.0 },
        }])
        .unwrap();
        fn always_nan(x: &Array2<f64>) -> Array2<f64> {
            Array2::from_elem((1, x.ncols()), f64::NAN)
        }
        let problem = InverseProblem::new(array![0.0], params, always_nan as Map).unwrap();
        let obs = ObservationSpace::new(
            array![0.0],
            &NoiseCovariance::Scalar { variance: 1.0 },
            &problem.free_parameters().priors(),
            false,
        )
        .unwrap();
        let x = array![[0.0, 1.0, 2.0, 3.0]];
        let g = array![[0.0, f64::NAN, 2.0, 3.0]];
        let failures = vec![false, true, false, false];
        let resampler = Resampler {
            max_search_rounds: 3,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(1);
        let err = resample(
            &resampler,
            &NormExceedsMedian { threshold: 1e9 },
            &problem,
            &obs,
            x,
            g,
            failures,
            0,
            &mut rng,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            EkiError::ResamplingExhausted {
                rounds: 3,
                found: 0,
                needed: 1
            }
        ));
    }

    #[test]
    fn test_fill_failed_particles_only_touches_failed() {
        let mut x = ensemble();
        let before = x.clone();
        let mut failures = vec![false; 10];
        failures[3] = true;
        let mut rng = StdRng::seed_from_u64(9);
        fill_failed_particles(&mut x, &failures, &mut rng).unwrap();
        for k in 0..10 {
            if k != 3 {
                assert_eq!(x.column(k), before.column(k));
            }
        }
        assert!(x.column(3).iter().all(|v| v.is_finite()));
    }
}
