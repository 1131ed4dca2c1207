//! Outer variational EM loop.
//!
//! A [`FitSession`] owns everything one fit mutates: the model, the
//! variational posterior and the histories. Each outer iteration runs the
//! variational E-step to (inner) convergence, records the bound, then
//! re-estimates parameters. The loop stops once the bound moves by less than
//! `tol`, or after `max_iter` iterations; the latter is a normal outcome.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use slds_common::Result;

use super::elbo::ElboTerms;
use super::estep::{variational_e_step, EStepOutcome, VariationalPosterior};
use super::lds::RegimePosterior;
use super::mstep::m_step;
use super::slds::SwitchingModel;
use crate::config::FitConfig;
use crate::logging::{event_names, Stage};

/// How a fit ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStatus {
    Converged,
    MaxIterReached,
}

impl std::fmt::Display for FitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FitStatus::Converged => write!(f, "converged"),
            FitStatus::MaxIterReached => write!(f, "max_iter_reached"),
        }
    }
}

/// Everything a finished fit reports.
#[derive(Debug, Clone)]
pub struct FitResult {
    /// Parameters after the last M-step.
    pub model: SwitchingModel,
    pub status: FitStatus,
    /// Bound after each E-step.
    pub ml_history: Vec<f64>,
    /// Parameter change of each M-step.
    pub param_change_history: Vec<f64>,
    /// Inner sweeps used by each E-step.
    pub inner_iterations: Vec<usize>,
    /// Bound decomposition from the last E-step.
    pub final_terms: ElboTerms,
    /// Posterior from the last E-step.
    pub posterior: VariationalPosterior,
}

impl FitResult {
    pub fn iterations(&self) -> usize {
        self.ml_history.len()
    }

    /// Final bound, or `-inf` if no E-step ran.
    pub fn final_elbo(&self) -> f64 {
        self.ml_history.last().copied().unwrap_or(f64::NEG_INFINITY)
    }

    /// `q(s_t = k)` as a `K × T` matrix.
    pub fn responsibilities(&self) -> DMatrix<f64> {
        self.posterior.responsibilities().gamma()
    }

    /// Most probable regime per step.
    pub fn most_likely_regimes(&self) -> Vec<usize> {
        self.posterior.responsibilities().most_likely_regimes()
    }

    pub fn posteriors(&self) -> &[RegimePosterior] {
        self.posterior.regimes()
    }
}

/// State of one variational EM fit.
#[derive(Debug, Clone)]
pub struct FitSession<'a> {
    model: SwitchingModel,
    observations: &'a DMatrix<f64>,
    config: FitConfig,
    posterior: VariationalPosterior,
    ml_history: Vec<f64>,
    param_change_history: Vec<f64>,
    inner_iterations: Vec<usize>,
    last_terms: ElboTerms,
}

impl<'a> FitSession<'a> {
    /// Validate inputs and build the initial posterior (uniform
    /// responsibilities, regimes smoothed under them).
    pub fn new(
        model: SwitchingModel,
        observations: &'a DMatrix<f64>,
        config: FitConfig,
    ) -> Result<Self> {
        config.validate()?;
        model.check_observations(observations)?;
        let posterior = VariationalPosterior::initialize(&model, observations, config.parallel)?;
        Ok(Self {
            model,
            observations,
            config,
            posterior,
            ml_history: Vec::new(),
            param_change_history: Vec::new(),
            inner_iterations: Vec::new(),
            last_terms: ElboTerms::default(),
        })
    }

    pub fn model(&self) -> &SwitchingModel {
        &self.model
    }

    pub fn posterior(&self) -> &VariationalPosterior {
        &self.posterior
    }

    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    pub fn ml_history(&self) -> &[f64] {
        &self.ml_history
    }

    /// Variational E-step under the current parameters.
    pub fn e_step(&mut self) -> Result<EStepOutcome> {
        let outcome = variational_e_step(
            &self.model,
            self.observations,
            &mut self.posterior,
            &self.config,
        )?;
        self.ml_history.push(outcome.elbo);
        self.inner_iterations.push(outcome.iterations);
        self.last_terms = outcome.terms.clone();
        Ok(outcome)
    }

    /// Re-estimate parameters from the current posterior. Returns the
    /// parameter change.
    pub fn m_step(&mut self) -> Result<f64> {
        let change = m_step(
            &mut self.model,
            self.observations,
            &self.posterior,
            &self.config,
        )?;
        self.param_change_history.push(change);
        Ok(change)
    }

    /// Alternate E- and M-steps until the bound settles or the budget runs out.
    pub fn run(mut self) -> Result<FitResult> {
        tracing::info!(
            event = event_names::FIT_STARTED,
            stage = %Stage::Fit,
            regimes = self.model.num_regimes(),
            steps = self.observations.ncols(),
            max_iter = self.config.max_iter,
            "starting variational EM"
        );

        let mut status = FitStatus::MaxIterReached;
        let mut ml_prev = f64::NEG_INFINITY;
        for iteration in 1..=self.config.max_iter {
            let ml = self.e_step()?.elbo;
            let change = self.m_step()?;
            tracing::info!(
                event = event_names::FIT_ITERATION,
                stage = %Stage::Fit,
                iteration,
                elbo = ml,
                param_change = change,
                "EM iteration"
            );
            if (ml - ml_prev).abs() < self.config.tol {
                status = FitStatus::Converged;
                break;
            }
            ml_prev = ml;
        }

        let final_elbo = self.ml_history.last().copied().unwrap_or(f64::NEG_INFINITY);
        match status {
            FitStatus::Converged => tracing::info!(
                event = event_names::FIT_CONVERGED,
                stage = %Stage::Fit,
                iterations = self.ml_history.len(),
                elbo = final_elbo,
                "fit converged"
            ),
            FitStatus::MaxIterReached => tracing::warn!(
                event = event_names::FIT_MAX_ITER_REACHED,
                stage = %Stage::Fit,
                iterations = self.ml_history.len(),
                elbo = final_elbo,
                "fit stopped at its iteration budget"
            ),
        }

        Ok(FitResult {
            model: self.model,
            status,
            ml_history: self.ml_history,
            param_change_history: self.param_change_history,
            inner_iterations: self.inner_iterations,
            final_terms: self.last_terms,
            posterior: self.posterior,
        })
    }
}

/// Fit `model` to an `obs_dim × T` observation matrix.
pub fn fit(
    model: SwitchingModel,
    observations: &DMatrix<f64>,
    config: &FitConfig,
) -> Result<FitResult> {
    FitSession::new(model, observations, config.clone())?.run()
}
