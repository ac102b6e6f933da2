// ─────────────────────────────────────────────────────────────────────
// SCPN Calibration — Ensemble Kalman Inversion
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Ensemble Kalman inversion engine.
//!
//! Leaves first: parameter transforms, failure detection, resampling,
//! pseudo-stepping, iteration summaries, and the engine that composes them.

pub mod failure;
pub mod inversion;
pub mod observations;
pub mod problem;
pub mod resampling;
pub mod stepping;
pub mod summary;
pub mod transforms;

pub use failure::FailureDetector;
pub use inversion::EnsembleKalmanInversion;
pub use problem::{ConstrainedForwardMap, ForwardMap, FreeParameters, InverseProblem};
pub use stepping::StepOptions;
pub use summary::IterationSummary;
