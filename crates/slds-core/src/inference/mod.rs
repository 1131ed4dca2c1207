//! Inference and estimation for switching linear dynamical systems.
//!
//! - [`chain`]: log-space forward-backward over a discrete hidden chain
//! - [`lds`]: per-regime linear-Gaussian model, weighted smoother, updates
//! - [`slds`]: the switching model tying regimes to a Markov chain
//! - [`elbo`]: evidence lower bound and its decomposition
//! - [`estep`] / [`mstep`] / [`em`]: variational EM
//! - [`hmm`]: Gaussian-emission HMM on the same forward-backward core

pub mod chain;
pub mod elbo;
pub mod em;
pub mod estep;
pub mod hmm;
pub mod lds;
pub mod mstep;
pub mod slds;

pub use chain::{validate_chain_parameters, ForwardBackward, HiddenChain};
pub use elbo::{ChainEntropy, ChainTerms, ElboTerms, RegimeTerms};
pub use em::{fit, FitResult, FitSession, FitStatus};
pub use estep::{variational_e_step, EStepOutcome, VariationalPosterior};
pub use hmm::GaussianHmm;
pub use lds::{sufficient_statistics, RegimeModel, RegimePosterior, SufficientStats, MIN_WEIGHT};
pub use mstep::m_step;
pub use slds::{observations_from_rows, SwitchingEvidence, SwitchingModel};
