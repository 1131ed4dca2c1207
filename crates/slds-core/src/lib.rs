//! Switching linear dynamical systems fitted by variational EM.
//!
//! A discrete Markov chain picks which of `K` linear-Gaussian regimes emits
//! each observation. Exact inference is exponential in `T`, so the posterior
//! is approximated by `q(s) · Π_k q(x^k)` and fitted by coordinate ascent on
//! the evidence lower bound, alternating with closed-form parameter updates.
//!
//! ```ignore
//! use slds_core::{fit, FitConfig, SwitchingModel};
//!
//! let result = fit(model, &observations, &FitConfig::default())?;
//! println!("{} after {} iterations", result.status, result.iterations());
//! ```

pub mod config;
pub mod exit_codes;
pub mod inference;
pub mod logging;
pub mod simulate;

pub use config::{FitConfig, ModelSpec, UpdateMask};
pub use exit_codes::ExitCode;
pub use inference::{
    fit, FitResult, FitSession, FitStatus, ForwardBackward, GaussianHmm, HiddenChain,
    RegimeModel, SwitchingModel,
};
pub use simulate::{simulate, Simulation};
