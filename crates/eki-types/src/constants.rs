// ─────────────────────────────────────────────────────────────────────
// SCPN Calibration — Constants
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
/// Regularizer added to ‖D‖_F in the Kovachki (2018) step size.
pub const KOVACHKI_EPSILON: f64 = 1e-10;

/// Regularizer added to ‖D‖_F in the ensemble Kalman sampler step size.
pub const SAMPLER_EPSILON: f64 = 1e-8;

/// Exponent of the accelerated fixed-point iteration on the step size.
pub const CONVERGENCE_ACCELERATION: f64 = 1.1;

/// Maximum number of trial updates in a convergence-ratio search.
pub const MAX_CONVERGENCE_TRIALS: usize = 10;

/// Absolute tolerance on the achieved convergence ratio.
pub const CONVERGENCE_RATIO_ATOL: f64 = 0.03;

/// Relative tolerance on the achieved convergence ratio.
pub const CONVERGENCE_RATIO_RTOL: f64 = 0.1;

/// Default multiple of the median norm beyond which a particle is failed.
pub const DEFAULT_NORM_THRESHOLD: f64 = 1e9;

/// Default multiple of the loss spread beyond which a particle is failed.
pub const DEFAULT_LOSS_MULTIPLE: f64 = 4.0;

/// Default number of candidate batches drawn while searching for replacements.
pub const DEFAULT_MAX_SEARCH_ROUNDS: usize = 10;

/// Singular values below this are dropped by the symmetric pseudo-inverse.
pub const PINV_CUTOFF: f64 = 1e-12;

/// Jacobi sweeps before the eigensolver gives up.
pub const MAX_JACOBI_SWEEPS: usize = 100;

/// Iteration index carried by the summary recorded at construction.
pub const INITIAL_ITERATION: i64 = -1;
