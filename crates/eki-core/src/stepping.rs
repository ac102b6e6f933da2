// ─────────────────────────────────────────────────────────────────────
// SCPN Calibration — Pseudo-Time Stepping
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Ensemble updates and pseudo-step selection.
//!
//! All updates act on column ensembles: `x` is `(Nθ, J)` and `g` is the
//! (possibly Tikhonov-augmented) `(M, J)` forward output. Covariances are
//! population covariances.
//!
//! - perturbed-observation EKI: `x + C^{θg}(C^{gg} + Γ/Δt)⁻¹(y + ξ − g)`,
//!   `ξ ~ N(0, Γ/Δt)`
//! - Kovachki & Stuart (2018): `x − (Δt/J) x Dᵀ`, `Δt = Δt₀/(‖D‖_F + ε)`
//! - ensemble Kalman sampler (Garbuno-Inigo et al. 2020): implicit prior
//!   drift plus `√(2Δt)` noise shaped by the ensemble covariance

use crate::observations::ObservationSpace;
use eki_math::linalg::{log_det_psd, solve_symmetric};
use eki_math::mvn::MultivariateNormal;
use eki_math::stats::{covariance, cross_covariance, ensemble_deviations, ensemble_mean};
use eki_types::config::{Process, PseudoStepping};
use eki_types::constants::{
    CONVERGENCE_ACCELERATION, CONVERGENCE_RATIO_ATOL, CONVERGENCE_RATIO_RTOL, KOVACHKI_EPSILON,
    MAX_CONVERGENCE_TRIALS, SAMPLER_EPSILON,
};
use eki_types::error::{EkiError, EkiResult};
use ndarray::{Array1, Array2, ArrayView2};
use rand::Rng;
use rand_distr::StandardNormal;
use tracing::{debug, warn};

/// Per-call overrides for a step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOptions {
    /// Replaces the engine's carried Δt for this call.
    pub pseudo_step: Option<f64>,
    /// α ≥ 0; deviations from the mean are scaled by √(1 + α).
    pub covariance_inflation: f64,
    /// λ ∈ [0, 1); weight of the previous update in the running average.
    pub momentum_parameter: f64,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            pseudo_step: None,
            covariance_inflation: 0.0,
            momentum_parameter: 0.0,
        }
    }
}

impl StepOptions {
    pub fn with_pseudo_step(pseudo_step: f64) -> Self {
        Self {
            pseudo_step: Some(pseudo_step),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> EkiResult<()> {
        if let Some(dt) = self.pseudo_step {
            if !dt.is_finite() || dt <= 0.0 {
                return Err(EkiError::ConfigError(
                    "pseudo_step must be finite and > 0".to_string(),
                ));
            }
        }
        if !self.covariance_inflation.is_finite() || self.covariance_inflation < 0.0 {
            return Err(EkiError::ConfigError(
                "covariance_inflation must be finite and >= 0".to_string(),
            ));
        }
        if !self.momentum_parameter.is_finite() || !(0.0..1.0).contains(&self.momentum_parameter)
        {
            return Err(EkiError::ConfigError(
                "momentum_parameter must be in [0, 1)".to_string(),
            ));
        }
        Ok(())
    }
}

/// Inputs shared by every update rule.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    /// Successful particles, unconstrained.
    pub x: ArrayView2<'a, f64>,
    /// Forward outputs of `x`, augmented in Tikhonov mode.
    pub g: ArrayView2<'a, f64>,
    pub observations: &'a ObservationSpace,
    pub process: Process,
    /// Carried (or overridden) Δt.
    pub pseudo_step: f64,
    pub max_pseudo_step: Option<f64>,
    /// Index of the step being taken; the first step is 0.
    pub iteration: i64,
    pub pseudotime: f64,
}

impl StepContext<'_> {
    fn cap(&self, dt: f64) -> f64 {
        match self.max_pseudo_step {
            Some(ceiling) => dt.min(ceiling),
            None => dt,
        }
    }
}

/// Policy memory carried between steps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SteppingState {
    /// Δt₀ found by the initial convergence-ratio search.
    pub initial_step_size: Option<f64>,
}

/// Result of a policy: the updated successful particles and step sizes.
#[derive(Debug, Clone)]
pub struct StepProposal {
    pub x: Array2<f64>,
    /// Δt added to pseudotime.
    pub accepted_step: f64,
    /// Δt the engine carries into the next step; `None` keeps the current one.
    pub carried_step: Option<f64>,
}

/// Standard normal draws for the observation perturbation.
pub fn white_noise<R: Rng + ?Sized>(rows: usize, cols: usize, rng: &mut R) -> Array2<f64> {
    Array2::from_shape_fn((rows, cols), |_| rng.sample::<f64, _>(StandardNormal))
}

/// Perturbed-observation EKI update with pre-drawn white noise.
///
/// `noise_factor` is any L with L Lᵀ = Γ; ξ = L·white/√Δt. Δt ≤ 0 leaves
/// the ensemble unchanged.
pub fn perturbed_update(
    x: &ArrayView2<'_, f64>,
    g: &ArrayView2<'_, f64>,
    y: &Array1<f64>,
    gamma: &Array2<f64>,
    noise_factor: &Array2<f64>,
    white: &Array2<f64>,
    dt: f64,
) -> EkiResult<Array2<f64>> {
    if dt <= 0.0 {
        return Ok(x.to_owned());
    }
    let c_xg = cross_covariance(x, g);
    let s = covariance(g, false) + gamma / dt;

    let mut residual = noise_factor.dot(white) / dt.sqrt();
    for (mut col, g_col) in residual.columns_mut().into_iter().zip(g.columns()) {
        col += y;
        col -= &g_col;
    }
    let z = solve_symmetric(&s.view(), &residual.view())?;
    Ok(x.to_owned() + c_xg.dot(&z))
}

/// One perturbed-observation update with fresh noise.
pub fn inversion_update<R: Rng + ?Sized>(
    ctx: &StepContext<'_>,
    dt: f64,
    rng: &mut R,
) -> EkiResult<Array2<f64>> {
    let gamma = ctx.observations.target_noise();
    let white = white_noise(gamma.nrows(), ctx.x.ncols(), rng);
    perturbed_update(
        &ctx.x,
        &ctx.g,
        ctx.observations.target(),
        gamma,
        ctx.observations.target_noise_factor(),
        &white,
        dt,
    )
}

fn frobenius(m: &Array2<f64>) -> f64 {
    m.iter().map(|v| v * v).sum::<f64>().sqrt()
}

/// D_ij = ⟨Γ⁻¹(g_i − y), g_j − ḡ⟩ / scale.
fn misfit_interaction(
    g: &ArrayView2<'_, f64>,
    y: &Array1<f64>,
    gamma_inv: &Array2<f64>,
    scale: f64,
) -> Array2<f64> {
    let deviations = ensemble_deviations(g);
    let mut residual = g.to_owned();
    for mut col in residual.columns_mut() {
        col -= y;
    }
    gamma_inv.dot(&residual).t().dot(&deviations) / scale
}

/// Kovachki & Stuart (2018) deterministic update.
///
/// Returns the new ensemble and the Δt actually used.
pub fn kovachki_update(ctx: &StepContext<'_>, initial_step_size: f64) -> (Array2<f64>, f64) {
    let j = ctx.x.ncols() as f64;
    let d = misfit_interaction(
        &ctx.g,
        ctx.observations.target(),
        ctx.observations.target_noise_inverse(),
        1.0,
    );
    let dt = ctx.cap(initial_step_size / (frobenius(&d) + KOVACHKI_EPSILON));
    let x_new = ctx.x.to_owned() - ctx.x.dot(&d.t()) * (dt / j);
    (x_new, dt)
}

/// Ensemble Kalman sampler update.
///
/// Returns the new ensemble and the effective Δt.
pub fn sampler_update<R: Rng + ?Sized>(
    ctx: &StepContext<'_>,
    rng: &mut R,
) -> EkiResult<(Array2<f64>, f64)> {
    let obs = ctx.observations;
    let j = ctx.x.ncols() as f64;
    // D_ij = ⟨g_i − ḡ, Γ⁻¹(g_j − y)⟩ / J, transposed relative to Kovachki.
    let d = misfit_interaction(&ctx.g, obs.target(), obs.target_noise_inverse(), j)
        .t()
        .to_owned();
    let dt = ctx.pseudo_step / (frobenius(&d) + SAMPLER_EPSILON);

    let c_xx = covariance(&ctx.x, false);
    let drift = c_xx.dot(&obs.prior_covariance_inverse().dot(obs.prior_mean())) * dt;
    let mut rhs = ctx.x.to_owned() - ensemble_deviations(&ctx.x).dot(&d) * dt;
    for mut col in rhs.columns_mut() {
        col += &drift;
    }

    // (I + Δt C Γ₀⁻¹)⁻¹ = Γ₀ (Γ₀ + Δt C)⁻¹
    let prior_cov = obs.prior_covariance();
    let system = prior_cov + &(&c_xx * dt);
    let implicit = prior_cov.dot(&solve_symmetric(&system.view(), &rhs.view())?);

    let zero = Array1::zeros(c_xx.nrows());
    let spread = MultivariateNormal::new(zero, &c_xx.view())?;
    let noise = spread.sample_columns(ctx.x.ncols(), rng) * (2.0 * dt).sqrt();
    Ok((implicit + noise, dt))
}

/// Iglesias & Yang (2021) data-misfit controller.
///
/// Returns Δt = min(q, 1 − t); zero once pseudotime reaches 1.
pub fn iglesias_step(ctx: &StepContext<'_>) -> f64 {
    let remaining = 1.0 - ctx.pseudotime;
    if remaining <= 0.0 {
        return 0.0;
    }
    let misfits = ctx.observations.target_misfits(&ctx.g);
    let m = ctx.observations.target().len() as f64;
    let mean = eki_math::stats::mean(&misfits);
    let var = eki_math::stats::variance(&misfits);
    let q = (m / (2.0 * mean)).max((m / (2.0 * var)).sqrt());
    ctx.cap(q.min(remaining))
}

/// Chada & Tong (2021) power-law schedule Δt₀ (n + 1)^β.
pub fn chada_step(ctx: &StepContext<'_>, initial_step_size: f64, beta: f64) -> f64 {
    let n = ctx.iteration.max(0) as f64;
    ctx.cap(initial_step_size * (n + 1.0).powf(beta))
}

/// det cov(x_new) / det cov(x_old) via log-determinants.
pub fn volume_ratio(x_old: &ArrayView2<'_, f64>, x_new: &ArrayView2<'_, f64>) -> EkiResult<f64> {
    let before = log_det_psd(&covariance(x_old, false).view())?;
    let after = log_det_psd(&covariance(x_new, false).view())?;
    Ok((after - before).exp())
}

fn ratio_converged(ratio: f64, target: f64) -> bool {
    (ratio - target).abs() <= CONVERGENCE_RATIO_ATOL + CONVERGENCE_RATIO_RTOL * ratio.max(target)
}

/// Accelerated fixed-point search on a step parameter so that the volume
/// ratio of the proposed update matches `target`.
///
/// `update(parameter)` returns the proposal and the Δt it used. The
/// parameter is multiplied by `(ratio / target)^1.1` after every miss.
fn search_convergence_ratio<U>(
    x: &ArrayView2<'_, f64>,
    target: f64,
    start: f64,
    ceiling: Option<f64>,
    mut update: U,
) -> EkiResult<(Array2<f64>, f64, f64)>
where
    U: FnMut(f64) -> EkiResult<(Array2<f64>, f64)>,
{
    let cap = |p: f64| ceiling.map_or(p, |c| p.min(c));
    let mut parameter = cap(start);
    let (mut x_new, mut used) = update(parameter)?;

    for trial in 0..MAX_CONVERGENCE_TRIALS {
        let ratio = volume_ratio(x, &x_new.view())?;
        if !ratio.is_finite() || ratio <= 0.0 {
            warn!(trial, ratio, "ensemble volume ratio is not usable; keeping current step");
            break;
        }
        if ratio_converged(ratio, target) {
            debug!(trial, ratio, parameter, "convergence ratio reached");
            break;
        }
        if trial + 1 == MAX_CONVERGENCE_TRIALS {
            warn!(
                ratio,
                target,
                "convergence ratio not reached after {MAX_CONVERGENCE_TRIALS} trials"
            );
            break;
        }
        parameter = cap(parameter * (ratio / target).powf(CONVERGENCE_ACCELERATION));
        (x_new, used) = update(parameter)?;
    }

    Ok((x_new, parameter, used))
}

/// Dispatch to the configured policy.
///
/// `state` is updated in place when a policy memoizes a value; callers
/// that need atomic steps pass a scratch copy.
pub fn propose<R: Rng + ?Sized>(
    policy: Option<&PseudoStepping>,
    ctx: &StepContext<'_>,
    state: &mut SteppingState,
    rng: &mut R,
) -> EkiResult<StepProposal> {
    if ctx.process == Process::Sampler {
        let (x, dt) = sampler_update(ctx, rng)?;
        debug!(iteration = ctx.iteration, dt, "sampler step");
        return Ok(StepProposal {
            x,
            accepted_step: dt,
            carried_step: None,
        });
    }

    let (x, dt, carried) = match policy {
        None => {
            let x = inversion_update(ctx, ctx.pseudo_step, rng)?;
            (x, ctx.pseudo_step, None)
        }
        Some(PseudoStepping::Kovachki2018 { initial_step_size }) => {
            let (x, dt) = kovachki_update(ctx, *initial_step_size);
            (x, dt, Some(dt))
        }
        Some(PseudoStepping::Kovachki2018InitialConvergenceRatio {
            initial_convergence_ratio,
        }) => {
            let initial = match state.initial_step_size {
                Some(dt0) => dt0,
                None => {
                    let (_, dt0, _) = search_convergence_ratio(
                        &ctx.x,
                        *initial_convergence_ratio,
                        ctx.pseudo_step,
                        None,
                        |dt0| Ok(kovachki_update(ctx, dt0)),
                    )?;
                    debug!(dt0, "initial Kovachki step size");
                    state.initial_step_size = Some(dt0);
                    dt0
                }
            };
            let (x, dt) = kovachki_update(ctx, initial);
            (x, dt, Some(dt))
        }
        Some(PseudoStepping::Iglesias2021) => {
            let dt = iglesias_step(ctx);
            let x = inversion_update(ctx, dt, rng)?;
            (x, dt, Some(dt).filter(|&dt| dt > 0.0))
        }
        Some(PseudoStepping::Chada2021 {
            initial_step_size,
            beta,
        }) => {
            let dt = chada_step(ctx, *initial_step_size, *beta);
            let x = inversion_update(ctx, dt, rng)?;
            (x, dt, Some(dt))
        }
        Some(PseudoStepping::ConstantConvergence { convergence_ratio }) => {
            let gamma = ctx.observations.target_noise();
            let factor = ctx.observations.target_noise_factor();
            let white = white_noise(gamma.nrows(), ctx.x.ncols(), rng);
            let (x, dt, _) = search_convergence_ratio(
                &ctx.x,
                *convergence_ratio,
                ctx.pseudo_step,
                ctx.max_pseudo_step,
                |dt| {
                    let x = perturbed_update(
                        &ctx.x,
                        &ctx.g,
                        ctx.observations.target(),
                        gamma,
                        factor,
                        &white,
                        dt,
                    )?;
                    Ok((x, dt))
                },
            )?;
            (x, dt, Some(dt))
        }
    };

    debug!(iteration = ctx.iteration, dt, "pseudo-step accepted");
    Ok(StepProposal {
        x,
        accepted_step: dt,
        carried_step: carried,
    })
}

/// Exponential averaging of updates: v = λ v_prev + (1 − λ)(x_new − x).
///
/// Returns the moved ensemble and the new velocity.
pub fn apply_momentum(
    x: &ArrayView2<'_, f64>,
    x_new: Array2<f64>,
    velocity: Option<&Array2<f64>>,
    lambda: f64,
) -> (Array2<f64>, Array2<f64>) {
    let update = &x_new - x;
    if lambda == 0.0 {
        return (x_new, update);
    }
    let v = match velocity {
        Some(prev) if prev.dim() == update.dim() => prev * lambda + &update * (1.0 - lambda),
        _ => update * (1.0 - lambda),
    };
    (x.to_owned() + &v, v)
}

/// Scale deviations from the ensemble mean by √(1 + α).
pub fn inflate(x: &mut Array2<f64>, alpha: f64) {
    if alpha == 0.0 {
        return;
    }
    let mean = ensemble_mean(&x.view());
    let scale = (1.0 + alpha).sqrt();
    for mut col in x.columns_mut() {
        col.zip_mut_with(&mean, |v, &m| *v = m + scale * (*v - m));
    }
}
