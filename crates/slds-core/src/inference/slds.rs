//! Switching linear dynamical system.
//!
//! A discrete Markov chain `s_t` selects which of `K` linear-Gaussian
//! regimes produced `y_t`. Every regime's latent chain keeps evolving while
//! inactive, so the joint model is
//! ```text
//! s_0 ~ π,  s_{t+1} | s_t = j ~ A[j, ·]
//! x^k_{t+1} = A_k x^k_t + w^k_t               for every k
//! y_t | s_t = k ~ N(C_k x^k_t, R_k)
//! ```
//! As a [`HiddenChain`] the model scores each regime against its own
//! smoothed trajectory (expected emission log-likelihood).

use nalgebra::{DMatrix, DVector};
use slds_common::{Error, Result};
use slds_math::matrix_from_rows;

use super::chain::{validate_chain_parameters, ForwardBackward, HiddenChain};
use super::lds::{RegimeModel, RegimePosterior};

/// Switching model: regime chain plus one linear-Gaussian sub-model per regime.
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchingModel {
    initial: DVector<f64>,
    transition: DMatrix<f64>,
    regimes: Vec<RegimeModel>,
}

/// Evidence for scoring regimes: the data and each regime's smoothed posterior.
#[derive(Debug, Clone, Copy)]
pub struct SwitchingEvidence<'a> {
    pub observations: &'a DMatrix<f64>,
    pub posteriors: &'a [RegimePosterior],
    /// Score regimes on the rayon pool when the `parallel` feature is on.
    pub parallel: bool,
}

/// Run `f` over every regime, optionally on the rayon pool.
///
/// Results come back in regime order either way.
pub(crate) fn map_regimes<T, F>(regimes: &[RegimeModel], parallel: bool, f: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(usize, &RegimeModel) -> Result<T> + Send + Sync,
{
    #[cfg(feature = "parallel")]
    let results = if parallel && regimes.len() > 1 {
        use rayon::prelude::*;
        regimes
            .par_iter()
            .enumerate()
            .map(|(k, regime)| f(k, regime))
            .collect()
    } else {
        regimes
            .iter()
            .enumerate()
            .map(|(k, regime)| f(k, regime))
            .collect()
    };

    #[cfg(not(feature = "parallel"))]
    let results = {
        let _ = parallel;
        regimes
            .iter()
            .enumerate()
            .map(|(k, regime)| f(k, regime))
            .collect()
    };

    results
}

/// Convert `T` rows of length `obs_dim` into an `obs_dim × T` matrix.
pub fn observations_from_rows(rows: &[Vec<f64>]) -> Result<DMatrix<f64>> {
    if rows.is_empty() {
        return Err(Error::InvalidObservations("sequence is empty".into()));
    }
    let matrix = matrix_from_rows(rows).ok_or_else(|| {
        Error::InvalidObservations("every observation row must have the same length".into())
    })?;
    if matrix.ncols() == 0 {
        return Err(Error::InvalidObservations(
            "observation rows must not be empty".into(),
        ));
    }
    Ok(matrix.transpose())
}

impl SwitchingModel {
    /// Build a switching model. Every regime must share the observation
    /// dimension; latent dimensions may differ.
    pub fn new(
        initial: DVector<f64>,
        transition: DMatrix<f64>,
        regimes: Vec<RegimeModel>,
    ) -> Result<Self> {
        validate_chain_parameters(&initial, &transition)?;
        if regimes.len() != initial.len() {
            return Err(Error::dimension("regime models", initial.len(), regimes.len()));
        }
        let obs_dim = regimes[0].obs_dim();
        for regime in &regimes {
            if regime.obs_dim() != obs_dim {
                return Err(Error::dimension(
                    "regime observation dimension",
                    obs_dim,
                    regime.obs_dim(),
                ));
            }
        }
        Ok(Self {
            initial,
            transition,
            regimes,
        })
    }

    pub fn num_regimes(&self) -> usize {
        self.regimes.len()
    }

    pub fn obs_dim(&self) -> usize {
        self.regimes[0].obs_dim()
    }

    pub fn regimes(&self) -> &[RegimeModel] {
        &self.regimes
    }

    pub fn regime(&self, k: usize) -> Option<&RegimeModel> {
        self.regimes.get(k)
    }

    pub(crate) fn regimes_mut(&mut self) -> &mut [RegimeModel] {
        &mut self.regimes
    }

    pub fn set_initial_distribution(&mut self, initial: DVector<f64>) -> Result<()> {
        validate_chain_parameters(&initial, &self.transition)?;
        self.initial = initial;
        Ok(())
    }

    pub fn set_transition_matrix(&mut self, transition: DMatrix<f64>) -> Result<()> {
        validate_chain_parameters(&self.initial, &transition)?;
        self.transition = transition;
        Ok(())
    }

    /// Check an `obs_dim × T` observation matrix.
    pub fn check_observations(&self, observations: &DMatrix<f64>) -> Result<()> {
        if observations.ncols() == 0 {
            return Err(Error::InvalidObservations("sequence is empty".into()));
        }
        if observations.nrows() != self.obs_dim() {
            return Err(Error::dimension(
                "observation dimension",
                self.obs_dim(),
                observations.nrows(),
            ));
        }
        if let Some(pos) = observations.iter().position(|v| !v.is_finite()) {
            return Err(Error::InvalidObservations(format!(
                "non-finite value at t={}",
                pos / observations.nrows()
            )));
        }
        Ok(())
    }

    /// Smooth every regime's chain under the current responsibilities.
    pub fn smooth_regimes(
        &self,
        observations: &DMatrix<f64>,
        responsibilities: &ForwardBackward,
        parallel: bool,
    ) -> Result<Vec<RegimePosterior>> {
        map_regimes(&self.regimes, parallel, |k, regime| {
            regime.smooth(observations, &responsibilities.responsibilities(k))
        })
    }

    /// Flattened regime parameters: for each regime, state parameters
    /// followed by observation parameters.
    pub fn parameter_vector(&self) -> Vec<f64> {
        self.regimes
            .iter()
            .flat_map(|regime| {
                let mut params = regime.state_params();
                params.extend(regime.obs_params());
                params
            })
            .collect()
    }
}

impl HiddenChain for SwitchingModel {
    type Evidence<'a> = SwitchingEvidence<'a>;

    fn num_states(&self) -> usize {
        self.regimes.len()
    }

    fn initial_distribution(&self) -> &DVector<f64> {
        &self.initial
    }

    fn transition_matrix(&self) -> &DMatrix<f64> {
        &self.transition
    }

    fn emission_log_likelihoods(
        &self,
        evidence: Self::Evidence<'_>,
        out: &mut DMatrix<f64>,
    ) -> Result<()> {
        if evidence.posteriors.len() != self.regimes.len() {
            return Err(Error::dimension(
                "regime posteriors",
                self.regimes.len(),
                evidence.posteriors.len(),
            ));
        }
        if out.shape() != (self.regimes.len(), evidence.observations.ncols()) {
            return Err(Error::dimension(
                "emission score columns",
                evidence.observations.ncols(),
                out.ncols(),
            ));
        }
        let rows = map_regimes(&self.regimes, evidence.parallel, |k, regime| {
            regime.emission_log_likelihoods(evidence.observations, &evidence.posteriors[k])
        })?;
        for (k, row) in rows.iter().enumerate() {
            for (t, score) in row.iter().enumerate() {
                out[(k, t)] = *score;
            }
        }
        Ok(())
    }
}
