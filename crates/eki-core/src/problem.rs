// ─────────────────────────────────────────────────────────────────────
// SCPN Calibration — Inverse Problem
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Inverse problem definition: observations, free parameters and the
//! forward map that links them.

use crate::transforms::transform_to_constrained;
use eki_types::config::{NamedPrior, Prior};
use eki_types::error::{EkiError, EkiResult};
use ndarray::{Array1, Array2};
use std::collections::HashSet;
use std::fmt;

/// Forward map from an `(Nθ, N)` unconstrained ensemble to `(Nobs, N)` outputs.
///
/// Failed simulations are reported by returning non-finite entries in the
/// corresponding column. `Err` is reserved for malformed input and aborts
/// the step.
pub trait ForwardMap {
    fn evaluate(&self, parameters: &Array2<f64>) -> EkiResult<Array2<f64>>;
}

impl<F> ForwardMap for F
where
    F: Fn(&Array2<f64>) -> Array2<f64>,
{
    fn evaluate(&self, parameters: &Array2<f64>) -> EkiResult<Array2<f64>> {
        Ok(self(parameters))
    }
}

/// Adapter for simulators written against physical parameter values.
///
/// Columns are mapped through `to_constrained` before the inner map runs.
#[derive(Debug, Clone)]
pub struct ConstrainedForwardMap<M> {
    priors: Vec<Prior>,
    inner: M,
}

impl<M: ForwardMap> ConstrainedForwardMap<M> {
    pub fn new(free_parameters: &FreeParameters, inner: M) -> Self {
        Self {
            priors: free_parameters.priors(),
            inner,
        }
    }
}

impl<M: ForwardMap> ForwardMap for ConstrainedForwardMap<M> {
    fn evaluate(&self, parameters: &Array2<f64>) -> EkiResult<Array2<f64>> {
        let constrained = transform_to_constrained(&self.priors, &parameters.view())?;
        self.inner.evaluate(&constrained)
    }
}

/// Ordered, uniquely named free parameters with independent priors.
#[derive(Debug, Clone, PartialEq)]
pub struct FreeParameters {
    parameters: Vec<NamedPrior>,
}

impl FreeParameters {
    pub fn new(parameters: Vec<NamedPrior>) -> EkiResult<Self> {
        if parameters.is_empty() {
            return Err(EkiError::ConfigError(
                "at least one free parameter is required".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for named in &parameters {
            if !seen.insert(named.name.as_str()) {
                return Err(EkiError::ConfigError(format!(
                    "duplicate parameter name '{}'",
                    named.name
                )));
            }
            named.prior.validate()?;
        }
        Ok(Self { parameters })
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.parameters.iter().map(|p| p.name.clone()).collect()
    }

    pub fn priors(&self) -> Vec<Prior> {
        self.parameters.iter().map(|p| p.prior).collect()
    }

    pub fn named(&self) -> &[NamedPrior] {
        &self.parameters
    }
}

/// Observations y, free parameters θ and the forward map G(θ).
pub struct InverseProblem<F> {
    observations: Array1<f64>,
    free_parameters: FreeParameters,
    forward_map: F,
    description: String,
}

impl<F: ForwardMap> InverseProblem<F> {
    pub fn new(
        observations: Array1<f64>,
        free_parameters: FreeParameters,
        forward_map: F,
    ) -> EkiResult<Self> {
        if observations.is_empty() {
            return Err(EkiError::ConfigError(
                "observation vector must not be empty".to_string(),
            ));
        }
        if !observations.iter().all(|v| v.is_finite()) {
            return Err(EkiError::ConfigError(
                "observation vector must be finite".to_string(),
            ));
        }
        Ok(Self {
            observations,
            free_parameters,
            forward_map,
            description: "InverseProblem".to_string(),
        })
    }

    /// Label used in the engine's printed summary.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn observations(&self) -> &Array1<f64> {
        &self.observations
    }

    pub fn free_parameters(&self) -> &FreeParameters {
        &self.free_parameters
    }

    pub fn observation_len(&self) -> usize {
        self.observations.len()
    }

    pub fn parameter_len(&self) -> usize {
        self.free_parameters.len()
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Evaluate the forward map and check the output shape.
    pub fn evaluate(&self, parameters: &Array2<f64>) -> EkiResult<Array2<f64>> {
        let g = self.forward_map.evaluate(parameters)?;
        let expected = (self.observation_len(), parameters.ncols());
        if g.dim() != expected {
            return Err(EkiError::ShapeMismatch(format!(
                "forward map returned {}x{}, expected {}x{}",
                g.nrows(),
                g.ncols(),
                expected.0,
                expected.1
            )));
        }
        Ok(g)
    }
}

impl<F> fmt::Display for InverseProblem<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} observations, {} free parameters: {})",
            self.description,
            self.observations.len(),
            self.free_parameters.len(),
            self.free_parameters.names().join(", ")
        )
    }
}
