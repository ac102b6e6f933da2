// ─────────────────────────────────────────────────────────────────────
// SCPN Calibration — Error Taxonomy
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
use thiserror::Error;

const REMEDIATION: &str = "Consider\n    \
    1. increasing `Resampler.abort_failure_fraction`;\n    \
    2. reducing the pseudo-step size or the simulation time-step;\n    \
    3. evolving the simulation for less time;\n    \
    4. narrowing the parameter priors.";

#[derive(Error, Debug)]
pub enum EkiError {
    #[error(
        "The forward map failed for {failed} of {ensemble_size} particles ({:.1}%), \
         at or above the abort threshold of {:.1}%. {}",
        100.0 * .fraction,
        100.0 * .threshold,
        REMEDIATION
    )]
    FatalResamplingFailure {
        failed: usize,
        ensemble_size: usize,
        fraction: f64,
        threshold: f64,
    },

    #[error(
        "All {ensemble_size} particles failed at iteration {iteration}; \
         ensemble statistics cannot be recovered. {}",
        REMEDIATION
    )]
    AllParticlesFailed { iteration: i64, ensemble_size: usize },

    #[error(
        "Resampling found only {found} of {needed} successful particles after {rounds} rounds. \
         {}",
        REMEDIATION
    )]
    ResamplingExhausted {
        rounds: usize,
        found: usize,
        needed: usize,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Value {value} is outside the prior support: {message}")]
    OutOfSupport { value: f64, message: String },

    #[error("Linear algebra error: {0}")]
    LinAlg(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EkiError {
    /// True for errors after which the iteration loop must stop.
    pub fn is_fatal_particle_failure(&self) -> bool {
        matches!(
            self,
            EkiError::FatalResamplingFailure { .. }
                | EkiError::AllParticlesFailed { .. }
                | EkiError::ResamplingExhausted { .. }
        )
    }
}

pub type EkiResult<T> = Result<T, EkiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_message_names_remediation() {
        let err = EkiError::FatalResamplingFailure {
            failed: 5,
            ensemble_size: 20,
            fraction: 0.25,
            threshold: 0.25,
        };
        let msg = err.to_string();
        assert!(msg.contains("5 of 20"), "{msg}");
        assert!(msg.contains("25.0%"), "{msg}");
        assert!(msg.contains("abort_failure_fraction"), "{msg}");
        assert!(msg.contains("narrowing the parameter priors"), "{msg}");
        assert!(err.is_fatal_particle_failure());
    }

    #[test]
    fn test_config_error_is_not_particle_failure() {
        let err = EkiError::ConfigError("ensemble_size must be >= 2".to_string());
        assert!(!err.is_fatal_particle_failure());
        assert_eq!(
            err.to_string(),
            "Configuration error: ensemble_size must be >= 2"
        );
    }
}
