// ─────────────────────────────────────────────────────────────────────
// SCPN Calibration — Config
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Serializable calibration vocabulary.
//!
//! Every enum is internally tagged with `"kind"` so calibration files read
//! naturally, e.g. `{"kind": "log_normal", "mu": 0.0, "sigma": 0.5}`.

use crate::constants::{DEFAULT_LOSS_MULTIPLE, DEFAULT_MAX_SEARCH_ROUNDS, DEFAULT_NORM_THRESHOLD};
use crate::error::{EkiError, EkiResult};
use serde::{Deserialize, Serialize};
use statrs::function::erf::erf_inv;
use std::collections::HashSet;

/// Independent prior on one free parameter.
///
/// Each family is a normal distribution in unconstrained space pushed through
/// a fixed bijection: identity, `exp`, or a logistic scaled onto `[lower, upper]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Prior {
    Normal { mean: f64, std: f64 },
    LogNormal { mu: f64, sigma: f64 },
    ScaledLogitNormal { lower: f64, upper: f64, mu: f64, sigma: f64 },
}

impl Prior {
    /// Log-normal prior whose constrained mean and standard deviation are given.
    pub fn lognormal_from_moments(mean: f64, std: f64) -> EkiResult<Self> {
        if !mean.is_finite() || mean <= 0.0 {
            return Err(EkiError::ConfigError(
                "log-normal mean must be finite and > 0".to_string(),
            ));
        }
        if !std.is_finite() || std <= 0.0 {
            return Err(EkiError::ConfigError(
                "log-normal std must be finite and > 0".to_string(),
            ));
        }
        let sigma_sq = (1.0 + (std / mean).powi(2)).ln();
        Ok(Prior::LogNormal {
            mu: mean.ln() - 0.5 * sigma_sq,
            sigma: sigma_sq.sqrt(),
        })
    }

    /// Bounded prior on `bounds`.
    ///
    /// Without an `interval` the unconstrained distribution is N(0, 1). With an
    /// interval `(a, b)` inside the bounds, μ sits at the unconstrained midpoint
    /// of the interval and σ is chosen so that `mass` of the probability lies
    /// inside it.
    pub fn scaled_logit_normal(
        bounds: (f64, f64),
        interval: Option<(f64, f64)>,
        mass: f64,
    ) -> EkiResult<Self> {
        let (lower, upper) = bounds;
        if !lower.is_finite() || !upper.is_finite() || lower >= upper {
            return Err(EkiError::ConfigError(format!(
                "scaled logit-normal bounds must be finite with lower < upper, got ({lower}, {upper})"
            )));
        }
        let Some((a, b)) = interval else {
            return Ok(Prior::ScaledLogitNormal {
                lower,
                upper,
                mu: 0.0,
                sigma: 1.0,
            });
        };
        if !(lower < a && a < b && b < upper) {
            return Err(EkiError::ConfigError(format!(
                "interval ({a}, {b}) must lie strictly inside bounds ({lower}, {upper})"
            )));
        }
        if !mass.is_finite() || mass <= 0.0 || mass >= 1.0 {
            return Err(EkiError::ConfigError(
                "interval mass must be in (0, 1)".to_string(),
            ));
        }
        let logit = |v: f64| ((v - lower) / (upper - v)).ln();
        let (la, lb) = (logit(a), logit(b));
        let mu = 0.5 * (la + lb);
        let sigma = (lb - mu) / (std::f64::consts::SQRT_2 * erf_inv(mass));
        Ok(Prior::ScaledLogitNormal {
            lower,
            upper,
            mu,
            sigma,
        })
    }

    pub fn validate(&self) -> EkiResult<()> {
        let (location, scale) = match *self {
            Prior::Normal { mean, std } => (mean, std),
            Prior::LogNormal { mu, sigma } => (mu, sigma),
            Prior::ScaledLogitNormal {
                lower,
                upper,
                mu,
                sigma,
            } => {
                if !lower.is_finite() || !upper.is_finite() || lower >= upper {
                    return Err(EkiError::ConfigError(format!(
                        "prior bounds must be finite with lower < upper, got ({lower}, {upper})"
                    )));
                }
                (mu, sigma)
            }
        };
        if !location.is_finite() {
            return Err(EkiError::ConfigError(
                "prior location must be finite".to_string(),
            ));
        }
        if !scale.is_finite() || scale <= 0.0 {
            return Err(EkiError::ConfigError(
                "prior scale must be finite and > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedPrior {
    pub name: String,
    #[serde(flatten)]
    pub prior: Prior,
}

/// Ensemble Kalman process variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Process {
    /// Collapses the ensemble onto a point estimate.
    #[default]
    Inversion,
    /// Ensemble Kalman sampler; keeps approximate posterior spread.
    Sampler,
}

/// Adaptive pseudo-time stepping schemes. `None` at the use site means the
/// caller's step is used unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PseudoStepping {
    Kovachki2018 { initial_step_size: f64 },
    Kovachki2018InitialConvergenceRatio { initial_convergence_ratio: f64 },
    Iglesias2021,
    Chada2021 { initial_step_size: f64, beta: f64 },
    ConstantConvergence { convergence_ratio: f64 },
}

impl PseudoStepping {
    pub fn validate(&self) -> EkiResult<()> {
        match *self {
            PseudoStepping::Kovachki2018 { initial_step_size }
            | PseudoStepping::Chada2021 {
                initial_step_size, ..
            } if !initial_step_size.is_finite() || initial_step_size <= 0.0 => {
                Err(EkiError::ConfigError(
                    "pseudo_stepping.initial_step_size must be finite and > 0".to_string(),
                ))
            }
            PseudoStepping::Chada2021 { beta, .. } if !beta.is_finite() => Err(
                EkiError::ConfigError("pseudo_stepping.beta must be finite".to_string()),
            ),
            PseudoStepping::Kovachki2018InitialConvergenceRatio {
                initial_convergence_ratio: ratio,
            }
            | PseudoStepping::ConstantConvergence {
                convergence_ratio: ratio,
            } if !ratio.is_finite() || ratio <= 0.0 || ratio >= 1.0 => Err(EkiError::ConfigError(
                "pseudo_stepping convergence ratio must be in (0, 1)".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Which particles the replacement distribution is fitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResamplingDistribution {
    FullEnsemble,
    #[default]
    SuccessfulParticles,
}

/// Failed-particle resampling policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resampler {
    /// Replace only failed columns; otherwise the whole ensemble is redrawn.
    pub only_failed_particles: bool,
    /// Failure fraction below which failures are tolerated without resampling.
    pub resample_failure_fraction: f64,
    /// Failure fraction at or above which the calibration aborts.
    pub abort_failure_fraction: f64,
    pub distribution: ResamplingDistribution,
    /// Candidate batches drawn before giving up on finding replacements.
    pub max_search_rounds: usize,
}

impl Default for Resampler {
    fn default() -> Self {
        Self {
            only_failed_particles: true,
            resample_failure_fraction: 0.0,
            abort_failure_fraction: 1.0,
            distribution: ResamplingDistribution::SuccessfulParticles,
            max_search_rounds: DEFAULT_MAX_SEARCH_ROUNDS,
        }
    }
}

impl Resampler {
    pub fn validate(&self) -> EkiResult<()> {
        if !self.abort_failure_fraction.is_finite()
            || self.abort_failure_fraction <= 0.0
            || self.abort_failure_fraction > 1.0
        {
            return Err(EkiError::ConfigError(
                "resampler.abort_failure_fraction must be in (0, 1]".to_string(),
            ));
        }
        if !self.resample_failure_fraction.is_finite()
            || !(0.0..=1.0).contains(&self.resample_failure_fraction)
        {
            return Err(EkiError::ConfigError(
                "resampler.resample_failure_fraction must be in [0, 1]".to_string(),
            ));
        }
        if self.max_search_rounds == 0 {
            return Err(EkiError::ConfigError(
                "resampler.max_search_rounds must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Central value of the particle losses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Baseline {
    #[default]
    Median,
    Mean,
}

/// Spread of the particle losses around the baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Spread {
    #[default]
    MedianAbsoluteDeviation,
    MeanAbsoluteDeviation,
    StandardDeviation,
}

/// Built-in particle failure criteria.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCriterion {
    NormExceedsMedian {
        threshold: f64,
    },
    ObjectiveLossThreshold {
        multiple: f64,
        #[serde(default)]
        baseline: Baseline,
        #[serde(default)]
        spread: Spread,
    },
}

impl Default for FailureCriterion {
    fn default() -> Self {
        FailureCriterion::NormExceedsMedian {
            threshold: DEFAULT_NORM_THRESHOLD,
        }
    }
}

impl FailureCriterion {
    /// Loss threshold at the default multiple, median baseline and MAD spread.
    pub fn default_objective_loss() -> Self {
        Self::objective_loss_threshold(DEFAULT_LOSS_MULTIPLE)
    }

    pub fn objective_loss_threshold(multiple: f64) -> Self {
        FailureCriterion::ObjectiveLossThreshold {
            multiple,
            baseline: Baseline::Median,
            spread: Spread::MedianAbsoluteDeviation,
        }
    }

    pub fn validate(&self) -> EkiResult<()> {
        match *self {
            FailureCriterion::NormExceedsMedian { threshold }
                if !threshold.is_finite() || threshold <= 0.0 =>
            {
                Err(EkiError::ConfigError(
                    "failure_criterion.threshold must be finite and > 0".to_string(),
                ))
            }
            FailureCriterion::ObjectiveLossThreshold { multiple, .. }
                if !multiple.is_finite() || multiple < 0.0 =>
            {
                Err(EkiError::ConfigError(
                    "failure_criterion.multiple must be finite and >= 0".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }
}

/// Observation noise covariance before promotion to a dense matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NoiseCovariance {
    /// `variance · I`.
    Scalar { variance: f64 },
    Diagonal { variances: Vec<f64> },
    /// Row-major dense matrix.
    Full { matrix: Vec<Vec<f64>> },
}

impl Default for NoiseCovariance {
    fn default() -> Self {
        NoiseCovariance::Scalar { variance: 1.0 }
    }
}

impl From<f64> for NoiseCovariance {
    fn from(variance: f64) -> Self {
        NoiseCovariance::Scalar { variance }
    }
}

/// Full calibration setup as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    pub parameters: Vec<NamedPrior>,
    pub ensemble_size: usize,
    #[serde(default = "default_pseudo_step")]
    pub pseudo_step: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pseudo_step: Option<f64>,
    #[serde(default)]
    pub process: Process,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pseudo_stepping: Option<PseudoStepping>,
    #[serde(default)]
    pub resampler: Resampler,
    #[serde(default)]
    pub failure_criterion: FailureCriterion,
    #[serde(default)]
    pub tikhonov: bool,
    #[serde(default)]
    pub noise: NoiseCovariance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

fn default_pseudo_step() -> f64 {
    1.0
}

/// Rejects process/stepping combinations the sampler cannot honor.
pub fn validate_process_compatibility(
    process: Process,
    pseudo_stepping: Option<&PseudoStepping>,
    tikhonov: bool,
) -> EkiResult<()> {
    if process == Process::Sampler {
        if tikhonov {
            return Err(EkiError::ConfigError(
                "the ensemble Kalman sampler already includes the prior; tikhonov must be false"
                    .to_string(),
            ));
        }
        if pseudo_stepping.is_some() {
            return Err(EkiError::ConfigError(
                "the ensemble Kalman sampler sets its own step; pseudo_stepping must be unset"
                    .to_string(),
            ));
        }
    }
    Ok(())
}

pub fn validate_pseudo_step(pseudo_step: f64, max_pseudo_step: Option<f64>) -> EkiResult<()> {
    if !pseudo_step.is_finite() || pseudo_step <= 0.0 {
        return Err(EkiError::ConfigError(
            "pseudo_step must be finite and > 0".to_string(),
        ));
    }
    if let Some(ceiling) = max_pseudo_step {
        if !ceiling.is_finite() || ceiling <= 0.0 {
            return Err(EkiError::ConfigError(
                "max_pseudo_step must be finite and > 0".to_string(),
            ));
        }
    }
    Ok(())
}

impl CalibrationConfig {
    pub fn from_file(path: &str) -> EkiResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn from_json_str(contents: &str) -> EkiResult<Self> {
        let config: Self = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EkiResult<()> {
        if self.parameters.is_empty() {
            return Err(EkiError::ConfigError(
                "at least one free parameter is required".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for named in &self.parameters {
            if !seen.insert(named.name.as_str()) {
                return Err(EkiError::ConfigError(format!(
                    "duplicate parameter name '{}'",
                    named.name
                )));
            }
            named.prior.validate()?;
        }
        if self.ensemble_size < 2 {
            return Err(EkiError::ConfigError(
                "ensemble_size must be >= 2".to_string(),
            ));
        }
        validate_pseudo_step(self.pseudo_step, self.max_pseudo_step)?;
        if let Some(scheme) = &self.pseudo_stepping {
            scheme.validate()?;
        }
        validate_process_compatibility(self.process, self.pseudo_stepping.as_ref(), self.tikhonov)?;
        self.resampler.validate()?;
        self.failure_criterion.validate()?;
        Ok(())
    }

    pub fn parameter_names(&self) -> Vec<String> {
        self.parameters.iter().map(|p| p.name.clone()).collect()
    }
}
