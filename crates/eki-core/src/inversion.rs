// ─────────────────────────────────────────────────────────────────────
// SCPN Calibration — Ensemble Kalman Inversion Engine
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Stateful ensemble Kalman inversion.
//!
//! One step is strictly serialized:
//! update → forward map → failure detection → resampling → summary.
//! Every intermediate lives in locals until the step has succeeded, so a
//! fatal error leaves the engine exactly as it was.

use crate::failure::FailureDetector;
use crate::observations::ObservationSpace;
use crate::problem::{ForwardMap, InverseProblem};
use crate::resampling::{columns_where, count_failures, fill_failed_particles, resample};
use crate::stepping::{apply_momentum, inflate, propose, StepContext, StepOptions, SteppingState};
use crate::summary::IterationSummary;
use crate::transforms::{constrained_ensemble_mean, sample_unconstrained, transform_to_constrained};
use eki_types::config::{
    validate_pseudo_step, CalibrationConfig, Process, PseudoStepping, Resampler,
};
use eki_types::constants::INITIAL_ITERATION;
use eki_types::error::{EkiError, EkiResult};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fmt;
use tracing::{debug, info};

pub struct EnsembleKalmanInversion<F> {
    problem: InverseProblem<F>,
    observations: ObservationSpace,
    detector: Box<dyn FailureDetector>,
    resampler: Resampler,
    process: Process,
    pseudo_stepping: Option<PseudoStepping>,
    max_pseudo_step: Option<f64>,
    ensemble_size: usize,

    x: Array2<f64>,
    g: Array2<f64>,
    failures: Vec<bool>,
    iteration: i64,
    pseudotime: f64,
    pseudo_step: f64,
    stepping_state: SteppingState,
    velocity: Option<Array2<f64>>,
    summaries: Vec<IterationSummary>,
    rng: StdRng,
}

impl<F: ForwardMap> EnsembleKalmanInversion<F> {
    /// Build the engine with the failure criterion named in `config`.
    pub fn new(problem: InverseProblem<F>, config: &CalibrationConfig) -> EkiResult<Self> {
        let detector = Box::new(config.failure_criterion);
        Self::with_detector(problem, config, detector)
    }

    /// Build the engine with a custom failure detector.
    ///
    /// Samples the initial ensemble from the priors, evaluates the forward
    /// map once, resamples initial failures and records the iteration −1
    /// summary.
    pub fn with_detector(
        problem: InverseProblem<F>,
        config: &CalibrationConfig,
        detector: Box<dyn FailureDetector>,
    ) -> EkiResult<Self> {
        config.validate()?;
        if config.parameters.as_slice() != problem.free_parameters().named() {
            return Err(EkiError::ConfigError(
                "configured parameters differ from the inverse problem's free parameters"
                    .to_string(),
            ));
        }

        let priors = problem.free_parameters().priors();
        let observations = ObservationSpace::new(
            problem.observations().clone(),
            &config.noise,
            &priors,
            config.tikhonov,
        )?;
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let x = sample_unconstrained(&priors, config.ensemble_size, &mut rng)?;
        let g = problem.evaluate(&x)?;
        let failures = detector.classify(&x.view(), &g.view(), &observations);
        let resampled = resample(
            &config.resampler,
            detector.as_ref(),
            &problem,
            &observations,
            x,
            g,
            failures,
            INITIAL_ITERATION,
            &mut rng,
        )?;

        let summary = IterationSummary::new(
            INITIAL_ITERATION,
            0.0,
            config.pseudo_step,
            &problem.free_parameters().names(),
            &priors,
            &resampled.x.view(),
            &resampled.g.view(),
            &resampled.failures,
            &observations,
        )?;

        info!(
            ensemble_size = config.ensemble_size,
            parameters = priors.len(),
            observations = observations.observation_len(),
            tikhonov = config.tikhonov,
            "ensemble Kalman inversion initialized"
        );

        Ok(Self {
            problem,
            observations,
            detector,
            resampler: config.resampler,
            process: config.process,
            pseudo_stepping: config.pseudo_stepping,
            max_pseudo_step: config.max_pseudo_step,
            ensemble_size: config.ensemble_size,
            x: resampled.x,
            g: resampled.g,
            failures: resampled.failures,
            iteration: INITIAL_ITERATION,
            pseudotime: 0.0,
            pseudo_step: config.pseudo_step,
            stepping_state: SteppingState::default(),
            velocity: None,
            summaries: vec![summary],
            rng,
        })
    }

    /// One pseudo-time step with the carried Δt.
    pub fn step(&mut self) -> EkiResult<()> {
        self.step_with(&StepOptions::default())
    }

    /// One pseudo-time step with per-call overrides.
    pub fn step_with(&mut self, options: &StepOptions) -> EkiResult<()> {
        options.validate()?;
        let pseudo_step = options.pseudo_step.unwrap_or(self.pseudo_step);
        validate_pseudo_step(pseudo_step, self.max_pseudo_step)?;

        let next_iteration = self.iteration + 1;
        let mut rng = self.rng.clone();
        let mut stepping_state = self.stepping_state.clone();
        let priors = self.problem.free_parameters().priors();

        // Failed particles sit out the update.
        let successful = columns_where(&self.failures, false);
        if successful.is_empty() {
            return Err(EkiError::AllParticlesFailed {
                iteration: self.iteration,
                ensemble_size: self.ensemble_size,
            });
        }
        let x_ok = self.x.select(Axis(1), &successful);
        let g_ok = self.g.select(Axis(1), &successful);
        let g_aug = self.observations.augment(&x_ok.view(), &g_ok.view())?;

        let ctx = StepContext {
            x: x_ok.view(),
            g: g_aug.view(),
            observations: &self.observations,
            process: self.process,
            pseudo_step,
            max_pseudo_step: self.max_pseudo_step,
            iteration: next_iteration,
            pseudotime: self.pseudotime,
        };
        let proposal = propose(
            self.pseudo_stepping.as_ref(),
            &ctx,
            &mut stepping_state,
            &mut rng,
        )?;

        let mut x_new = self.x.clone();
        for (slot, &k) in successful.iter().enumerate() {
            x_new.column_mut(k).assign(&proposal.x.column(slot));
        }
        let (mut x_new, mut velocity) = apply_momentum(
            &self.x.view(),
            x_new,
            self.velocity.as_ref(),
            options.momentum_parameter,
        );
        // Refilled columns start without update history.
        fill_failed_particles(&mut x_new, &self.failures, &mut rng)?;
        for k in columns_where(&self.failures, true) {
            velocity.column_mut(k).fill(0.0);
        }
        inflate(&mut x_new, options.covariance_inflation);

        let g_new = self.problem.evaluate(&x_new)?;
        let failures = self
            .detector
            .classify(&x_new.view(), &g_new.view(), &self.observations);
        let resampled = resample(
            &self.resampler,
            self.detector.as_ref(),
            &self.problem,
            &self.observations,
            x_new,
            g_new,
            failures,
            next_iteration,
            &mut rng,
        )?;

        let pseudotime = self.pseudotime + proposal.accepted_step;
        let summary = IterationSummary::new(
            next_iteration,
            pseudotime,
            proposal.accepted_step,
            &self.problem.free_parameters().names(),
            &priors,
            &resampled.x.view(),
            &resampled.g.view(),
            &resampled.failures,
            &self.observations,
        )?;

        debug!(
            iteration = next_iteration,
            pseudotime,
            dt = proposal.accepted_step,
            replaced = resampled.replaced,
            "step committed"
        );

        self.x = resampled.x;
        self.g = resampled.g;
        self.failures = resampled.failures;
        self.iteration = next_iteration;
        self.pseudotime = pseudotime;
        if let Some(dt) = proposal.carried_step {
            self.pseudo_step = dt;
        }
        self.stepping_state = stepping_state;
        self.velocity = Some(velocity);
        self.summaries.push(summary);
        self.rng = rng;
        Ok(())
    }

    /// Step `n` times; returns the constrained ensemble mean.
    pub fn iterate(&mut self, n: usize) -> EkiResult<Array1<f64>> {
        self.iterate_with(n, &StepOptions::default())
    }

    pub fn iterate_with(&mut self, n: usize, options: &StepOptions) -> EkiResult<Array1<f64>> {
        for _ in 0..n {
            self.step_with(options)?;
        }
        Ok(self.constrained_mean())
    }

    /// Replace the unconstrained ensemble and re-evaluate the forward map.
    ///
    /// Failures are classified but not resampled, and no summary is added.
    /// Momentum history is discarded.
    pub fn set_parameters(&mut self, x: Array2<f64>) -> EkiResult<()> {
        let expected = (self.problem.parameter_len(), self.ensemble_size);
        if x.dim() != expected {
            return Err(EkiError::ShapeMismatch(format!(
                "ensemble must be {}x{}, got {}x{}",
                expected.0,
                expected.1,
                x.nrows(),
                x.ncols()
            )));
        }
        if !x.iter().all(|v| v.is_finite()) {
            return Err(EkiError::ConfigError(
                "ensemble parameters must be finite".to_string(),
            ));
        }
        let g = self.problem.evaluate(&x)?;
        self.failures = self
            .detector
            .classify(&x.view(), &g.view(), &self.observations);
        self.x = x;
        self.g = g;
        self.velocity = None;
        Ok(())
    }

    /// (Φ_data, Φ_prior) for one unconstrained particle and its output.
    pub fn objective(&self, theta: &ArrayView1<'_, f64>, g: &ArrayView1<'_, f64>) -> (f64, f64) {
        (
            self.observations.data_misfit(g),
            self.observations.prior_misfit(theta),
        )
    }

    /// Constrained image of the unconstrained ensemble mean.
    pub fn constrained_mean(&self) -> Array1<f64> {
        constrained_ensemble_mean(&self.problem.free_parameters().priors(), &self.x.view())
    }

    pub fn constrained_ensemble(&self) -> EkiResult<Array2<f64>> {
        transform_to_constrained(&self.problem.free_parameters().priors(), &self.x.view())
    }

    pub fn ensemble(&self) -> &Array2<f64> {
        &self.x
    }

    pub fn forward_output(&self) -> &Array2<f64> {
        &self.g
    }

    pub fn failures(&self) -> &[bool] {
        &self.failures
    }

    pub fn failed_count(&self) -> usize {
        count_failures(&self.failures)
    }

    pub fn iteration(&self) -> i64 {
        self.iteration
    }

    pub fn pseudotime(&self) -> f64 {
        self.pseudotime
    }

    pub fn pseudo_step(&self) -> f64 {
        self.pseudo_step
    }

    pub fn ensemble_size(&self) -> usize {
        self.ensemble_size
    }

    pub fn summaries(&self) -> &[IterationSummary] {
        &self.summaries
    }

    pub fn latest_summary(&self) -> Option<&IterationSummary> {
        self.summaries.last()
    }

    pub fn problem(&self) -> &InverseProblem<F> {
        &self.problem
    }

    pub fn observations(&self) -> &ObservationSpace {
        &self.observations
    }

    pub fn stepping_state(&self) -> &SteppingState {
        &self.stepping_state
    }
}

impl<F> fmt::Display for EnsembleKalmanInversion<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "EnsembleKalmanInversion")?;
        writeln!(f, "├── inverse problem: {}", self.problem)?;
        writeln!(f, "├── process: {:?}", self.process)?;
        match &self.pseudo_stepping {
            Some(policy) => writeln!(f, "├── pseudo_stepping: {policy:?}")?,
            None => writeln!(f, "├── pseudo_stepping: fixed")?,
        }
        writeln!(f, "├── failure detector: {:?}", self.detector)?;
        writeln!(f, "├── resampler: {:?}", self.resampler)?;
        writeln!(f, "├── tikhonov: {}", self.observations.tikhonov())?;
        writeln!(f, "├── ensemble_size: {}", self.ensemble_size)?;
        writeln!(f, "├── iteration: {}", self.iteration)?;
        writeln!(f, "├── pseudotime: {:.4e}", self.pseudotime)?;
        write!(f, "└── pseudo_step: {:.4e}", self.pseudo_step)
    }
}
