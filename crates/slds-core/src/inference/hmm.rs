//! Gaussian hidden Markov model on the shared forward-backward engine.
//!
//! Each hidden state emits `y_t ~ N(μ_k, Σ_k)` directly, with no latent
//! continuous dynamics. Useful on its own and as a quick way to seed regime
//! assignments before fitting a switching model.

use nalgebra::{DMatrix, DVector};
use slds_common::{Error, Result};
use slds_math::{log_det, mahalanobis_sq, spd_cholesky, LN_2PI};

use super::chain::{validate_chain_parameters, ForwardBackward, HiddenChain};

/// Hidden Markov model with multivariate Gaussian emissions.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianHmm {
    initial: DVector<f64>,
    transition: DMatrix<f64>,
    means: Vec<DVector<f64>>,
    covariances: Vec<DMatrix<f64>>,
}

impl GaussianHmm {
    pub fn new(
        initial: DVector<f64>,
        transition: DMatrix<f64>,
        means: Vec<DVector<f64>>,
        covariances: Vec<DMatrix<f64>>,
    ) -> Result<Self> {
        validate_chain_parameters(&initial, &transition)?;
        let k = initial.len();
        if means.len() != k {
            return Err(Error::dimension("emission means", k, means.len()));
        }
        if covariances.len() != k {
            return Err(Error::dimension("emission covariances", k, covariances.len()));
        }
        let dim = means[0].len();
        for (mean, cov) in means.iter().zip(&covariances) {
            if mean.len() != dim {
                return Err(Error::dimension("emission mean length", dim, mean.len()));
            }
            if cov.nrows() != dim || cov.ncols() != dim {
                return Err(Error::dimension("emission covariance size", dim, cov.nrows()));
            }
        }
        Ok(Self {
            initial,
            transition,
            means,
            covariances,
        })
    }

    pub fn obs_dim(&self) -> usize {
        self.means[0].len()
    }

    /// Posterior marginals for an `obs_dim × T` observation matrix.
    pub fn posterior(&self, observations: &DMatrix<f64>) -> Result<ForwardBackward> {
        let mut fb = ForwardBackward::new(self.num_states(), observations.ncols());
        fb.score_and_infer(self, observations)?;
        Ok(fb)
    }
}

impl HiddenChain for GaussianHmm {
    type Evidence<'a> = &'a DMatrix<f64>;

    fn num_states(&self) -> usize {
        self.initial.len()
    }

    fn initial_distribution(&self) -> &DVector<f64> {
        &self.initial
    }

    fn transition_matrix(&self) -> &DMatrix<f64> {
        &self.transition
    }

    fn emission_log_likelihoods(
        &self,
        observations: Self::Evidence<'_>,
        out: &mut DMatrix<f64>,
    ) -> Result<()> {
        if observations.nrows() != self.obs_dim() {
            return Err(Error::dimension(
                "observation rows",
                self.obs_dim(),
                observations.nrows(),
            ));
        }
        if out.shape() != (self.num_states(), observations.ncols()) {
            return Err(Error::dimension(
                "emission score columns",
                observations.ncols(),
                out.ncols(),
            ));
        }
        let dim = self.obs_dim() as f64;
        for (k, (mean, cov)) in self.means.iter().zip(&self.covariances).enumerate() {
            let chol = spd_cholesky(cov).ok_or_else(|| {
                Error::NumericalInstability(format!(
                    "emission covariance of state {k} is not positive definite"
                ))
            })?;
            let norm = dim * LN_2PI + log_det(&chol);
            for t in 0..observations.ncols() {
                let residual = observations.column(t).into_owned() - mean;
                out[(k, t)] = -0.5 * (norm + mahalanobis_sq(&chol, &residual));
            }
        }
        Ok(())
    }
}
