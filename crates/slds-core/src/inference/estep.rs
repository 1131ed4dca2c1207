//! Variational E-step.
//!
//! Coordinate ascent on the structured mean-field posterior
//! `q(s) · Π_k q(x^k)`:
//!
//! 1. score every regime against its smoothed trajectory (`ℓ`)
//! 2. forward-backward on `ℓ` → new `γ`, `ξ`
//! 3. re-smooth every regime with weights `γ[k, ·]`
//! 4. re-score and evaluate the bound
//!
//! The loop stops when the bound changes by less than `inner_tol` or after
//! `inner_max_iter` sweeps.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use slds_common::Result;

use super::chain::ForwardBackward;
use super::elbo::{self, ElboTerms};
use super::lds::RegimePosterior;
use super::slds::{SwitchingEvidence, SwitchingModel};
use crate::config::FitConfig;
use crate::logging::{event_names, Stage};

/// Current `q(s)` (with its emission scores) and every `q(x^k)`.
#[derive(Debug, Clone)]
pub struct VariationalPosterior {
    chain: ForwardBackward,
    regimes: Vec<RegimePosterior>,
}

impl VariationalPosterior {
    /// Uniform responsibilities `1/K`, then smooth every regime under them.
    pub fn initialize(
        model: &SwitchingModel,
        observations: &DMatrix<f64>,
        parallel: bool,
    ) -> Result<Self> {
        model.check_observations(observations)?;
        let chain = ForwardBackward::new(model.num_regimes(), observations.ncols());
        let regimes = model.smooth_regimes(observations, &chain, parallel)?;
        Ok(Self { chain, regimes })
    }

    /// `q(s)`: marginals, pairwise marginals and the last emission scores.
    pub fn responsibilities(&self) -> &ForwardBackward {
        &self.chain
    }

    /// `q(x^k)` for every regime.
    pub fn regimes(&self) -> &[RegimePosterior] {
        &self.regimes
    }

    /// Re-smooth every regime under the current responsibilities.
    pub fn refresh_regimes(
        &mut self,
        model: &SwitchingModel,
        observations: &DMatrix<f64>,
        parallel: bool,
    ) -> Result<()> {
        self.regimes = model.smooth_regimes(observations, &self.chain, parallel)?;
        Ok(())
    }

    /// Recompute `ℓ` from the current regime posteriors.
    pub fn refresh_scores(
        &mut self,
        model: &SwitchingModel,
        observations: &DMatrix<f64>,
        parallel: bool,
    ) -> Result<()> {
        let evidence = SwitchingEvidence {
            observations,
            posteriors: &self.regimes,
            parallel,
        };
        self.chain.score(model, evidence)
    }

    /// Bound at the current posterior. Expects fresh scores.
    pub fn evaluate(&self, model: &SwitchingModel, config: &FitConfig) -> Result<ElboTerms> {
        elbo::evaluate(
            model,
            &self.chain,
            &self.regimes,
            config.probability_floor,
            config.entropy,
        )
    }
}

/// Result of one variational E-step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EStepOutcome {
    /// Bound after the final sweep.
    pub elbo: f64,
    pub terms: ElboTerms,
    /// Bound after each sweep.
    pub trajectory: Vec<f64>,
    pub iterations: usize,
    /// Whether the inner tolerance was met before the budget ran out.
    pub converged: bool,
}

/// Run the inner loop to (approximate) convergence.
///
/// Starts by re-smoothing under the stored responsibilities, since the
/// parameters may have changed since they were computed.
pub fn variational_e_step(
    model: &SwitchingModel,
    observations: &DMatrix<f64>,
    posterior: &mut VariationalPosterior,
    config: &FitConfig,
) -> Result<EStepOutcome> {
    let parallel = config.parallel;
    posterior.refresh_regimes(model, observations, parallel)?;
    posterior.refresh_scores(model, observations, parallel)?;

    let mut trajectory = Vec::with_capacity(config.inner_max_iter);
    let mut terms = ElboTerms::default();
    let mut converged = false;

    for iteration in 1..=config.inner_max_iter {
        posterior.chain.infer(model)?;
        posterior.refresh_regimes(model, observations, parallel)?;
        posterior.refresh_scores(model, observations, parallel)?;
        terms = posterior.evaluate(model, config)?;

        let value = terms.total();
        let delta = trajectory.last().map(|prev: &f64| value - prev);
        trajectory.push(value);
        tracing::debug!(
            event = event_names::E_STEP_ITERATION,
            stage = %Stage::EStep,
            iteration,
            elbo = value,
            delta = delta.unwrap_or(f64::NAN),
            "inner iteration"
        );

        if delta.is_some_and(|d| d.abs() < config.inner_tol) {
            converged = true;
            break;
        }
    }

    let iterations = trajectory.len();
    let elbo = terms.total();
    if converged {
        tracing::debug!(
            event = event_names::E_STEP_FINISHED,
            stage = %Stage::EStep,
            iterations,
            elbo,
            "E-step converged"
        );
    } else {
        tracing::warn!(
            event = event_names::E_STEP_BUDGET_EXHAUSTED,
            stage = %Stage::EStep,
            iterations,
            elbo,
            "E-step stopped at its iteration budget"
        );
    }

    Ok(EStepOutcome {
        elbo,
        terms,
        trajectory,
        iterations,
        converged,
    })
}
