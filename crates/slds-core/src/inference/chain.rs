//! Discrete hidden chains and log-space forward-backward.
//!
//! Any model with a finite Markov chain over hidden states can implement
//! [`HiddenChain`]: it supplies an initial distribution, a row-stochastic
//! transition matrix, and per-step emission log-likelihoods for some kind of
//! evidence. [`ForwardBackward`] then computes the posterior marginals
//! `γ[k, t] = q(s_t = k)` and pairwise marginals
//! `ξ_t[j, k] = q(s_t = j, s_{t+1} = k)`, both kept in log space.
//!
//! ```text
//! ln α[k, 0] = ln π_k + ℓ[k, 0]
//! ln α[k, t] = ℓ[k, t] + lse_j(ln α[j, t-1] + ln A[j, k])
//! ln β[j, T-1] = 0
//! ln β[j, t] = lse_k(ln A[j, k] + ℓ[k, t+1] + ln β[k, t+1])
//! ```

use nalgebra::{DMatrix, DVector};
use slds_common::{Error, Result};
use slds_math::{log_sum_exp, log_sum_exp_iter, normalize_log};

/// Tolerance for "rows sum to one" checks on chain parameters.
const STOCHASTIC_TOL: f64 = 1e-6;

/// A finite-state Markov chain with per-step emission scores.
pub trait HiddenChain {
    /// What the chain scores against (raw observations, smoothed
    /// trajectories, ...).
    type Evidence<'a>;

    /// Number of hidden states `K`.
    fn num_states(&self) -> usize;

    /// Initial state distribution `π`, length `K`.
    fn initial_distribution(&self) -> &DVector<f64>;

    /// Row-stochastic transition matrix, `A[j, k] = P(s_{t+1} = k | s_t = j)`.
    fn transition_matrix(&self) -> &DMatrix<f64>;

    /// Write `ℓ[k, t]` into `out` (`K × T`, already sized).
    fn emission_log_likelihoods(
        &self,
        evidence: Self::Evidence<'_>,
        out: &mut DMatrix<f64>,
    ) -> Result<()>;
}

/// Validate an initial distribution and transition matrix for `K` states.
pub fn validate_chain_parameters(initial: &DVector<f64>, transition: &DMatrix<f64>) -> Result<()> {
    let k = initial.len();
    if k == 0 {
        return Err(Error::InvalidModel("chain needs at least one state".into()));
    }
    if transition.nrows() != k {
        return Err(Error::dimension("transition matrix rows", k, transition.nrows()));
    }
    if transition.ncols() != k {
        return Err(Error::dimension(
            "transition matrix columns",
            k,
            transition.ncols(),
        ));
    }
    if initial.iter().any(|p| !p.is_finite() || *p < 0.0) {
        return Err(Error::InvalidModel(
            "initial distribution entries must be finite and non-negative".into(),
        ));
    }
    if (initial.sum() - 1.0).abs() > STOCHASTIC_TOL {
        return Err(Error::InvalidModel(format!(
            "initial distribution sums to {}",
            initial.sum()
        )));
    }
    for (j, row) in transition.row_iter().enumerate() {
        if row.iter().any(|p| !p.is_finite() || *p < 0.0) {
            return Err(Error::InvalidModel(format!(
                "transition row {j} has negative or non-finite entries"
            )));
        }
        if (row.sum() - 1.0).abs() > STOCHASTIC_TOL {
            return Err(Error::InvalidModel(format!(
                "transition row {j} sums to {}",
                row.sum()
            )));
        }
    }
    Ok(())
}

/// Log-space forward-backward buffers and posterior marginals.
///
/// The emission matrix `ℓ` lives here too, so a scorer can refresh it in
/// place between passes.
#[derive(Debug, Clone)]
pub struct ForwardBackward {
    log_emission: DMatrix<f64>,
    log_alpha: DMatrix<f64>,
    log_beta: DMatrix<f64>,
    log_gamma: DMatrix<f64>,
    log_xi: Vec<DMatrix<f64>>,
    log_likelihood: f64,
}

impl ForwardBackward {
    /// Allocate buffers for `num_states × num_steps` with uniform marginals.
    pub fn new(num_states: usize, num_steps: usize) -> Self {
        let k = num_states.max(1) as f64;
        Self {
            log_emission: DMatrix::zeros(num_states, num_steps),
            log_alpha: DMatrix::zeros(num_states, num_steps),
            log_beta: DMatrix::zeros(num_states, num_steps),
            log_gamma: DMatrix::from_element(num_states, num_steps, -k.ln()),
            log_xi: vec![
                DMatrix::from_element(num_states, num_states, -2.0 * k.ln());
                num_steps.saturating_sub(1)
            ],
            log_likelihood: f64::NEG_INFINITY,
        }
    }

    pub fn num_states(&self) -> usize {
        self.log_gamma.nrows()
    }

    pub fn num_steps(&self) -> usize {
        self.log_gamma.ncols()
    }

    /// Current emission scores `ℓ` (`K × T`).
    pub fn log_emission(&self) -> &DMatrix<f64> {
        &self.log_emission
    }

    /// Recompute `ℓ` from the chain's evidence.
    pub fn score<C: HiddenChain>(&mut self, chain: &C, evidence: C::Evidence<'_>) -> Result<()> {
        chain.emission_log_likelihoods(evidence, &mut self.log_emission)
    }

    /// Score then run forward-backward. Returns `ln p(evidence)`.
    pub fn score_and_infer<C: HiddenChain>(
        &mut self,
        chain: &C,
        evidence: C::Evidence<'_>,
    ) -> Result<f64> {
        self.score(chain, evidence)?;
        self.infer(chain)
    }

    /// Run forward-backward against the current `ℓ`.
    ///
    /// Fails with `DegenerateLikelihood` when some step has no state with a
    /// finite score, or when the messages or marginals cannot be normalized.
    /// The stored marginals are only replaced on success.
    pub fn infer<C: HiddenChain>(&mut self, chain: &C) -> Result<f64> {
        let k = self.num_states();
        let steps = self.num_steps();
        if chain.num_states() != k {
            return Err(Error::dimension("chain states", k, chain.num_states()));
        }
        if steps == 0 {
            return Err(Error::InvalidObservations("sequence is empty".into()));
        }

        for t in 0..steps {
            let column = self.log_emission.column(t);
            if column.iter().any(|l| l.is_nan()) {
                return Err(Error::DegenerateLikelihood(format!(
                    "emission score is NaN at t={t}"
                )));
            }
            if column.iter().all(|l| *l == f64::NEG_INFINITY) {
                return Err(Error::DegenerateLikelihood(format!(
                    "every state has zero likelihood at t={t}"
                )));
            }
        }

        let log_pi = chain.initial_distribution().map(f64::ln);
        let log_a = chain.transition_matrix().map(f64::ln);

        // Forward
        for j in 0..k {
            self.log_alpha[(j, 0)] = log_pi[j] + self.log_emission[(j, 0)];
        }
        for t in 1..steps {
            for j in 0..k {
                let incoming =
                    log_sum_exp_iter((0..k).map(|i| self.log_alpha[(i, t - 1)] + log_a[(i, j)]));
                self.log_alpha[(j, t)] = self.log_emission[(j, t)] + incoming;
            }
            let mass = log_sum_exp_iter(self.log_alpha.column(t).iter().copied());
            if !mass.is_finite() {
                return Err(Error::DegenerateLikelihood(format!(
                    "forward messages vanished at t={t}"
                )));
            }
        }

        // Backward
        self.log_beta.column_mut(steps - 1).fill(0.0);
        for t in (0..steps - 1).rev() {
            for i in 0..k {
                self.log_beta[(i, t)] = log_sum_exp_iter((0..k).map(|j| {
                    log_a[(i, j)] + self.log_emission[(j, t + 1)] + self.log_beta[(j, t + 1)]
                }));
            }
        }

        let log_likelihood = log_sum_exp_iter(self.log_alpha.column(steps - 1).iter().copied());
        if !log_likelihood.is_finite() {
            return Err(Error::DegenerateLikelihood(
                "sequence has zero likelihood under every state path".into(),
            ));
        }

        let mut log_gamma = DMatrix::zeros(k, steps);
        let mut column = vec![0.0; k];
        for t in 0..steps {
            for j in 0..k {
                column[j] = self.log_alpha[(j, t)] + self.log_beta[(j, t)];
            }
            if !normalize_log(&mut column).is_finite() {
                return Err(Error::DegenerateLikelihood(format!(
                    "state marginals cannot be normalized at t={t}"
                )));
            }
            for j in 0..k {
                log_gamma[(j, t)] = column[j];
            }
        }

        let mut log_xi = Vec::with_capacity(steps - 1);
        for t in 0..steps - 1 {
            let pair = DMatrix::from_fn(k, k, |i, j| {
                self.log_alpha[(i, t)]
                    + log_a[(i, j)]
                    + self.log_emission[(j, t + 1)]
                    + self.log_beta[(j, t + 1)]
            });
            let norm = log_sum_exp(pair.as_slice());
            if !norm.is_finite() {
                return Err(Error::DegenerateLikelihood(format!(
                    "pairwise marginals cannot be normalized at t={t}"
                )));
            }
            log_xi.push(pair.add_scalar(-norm));
        }

        self.log_gamma = log_gamma;
        self.log_xi = log_xi;
        self.log_likelihood = log_likelihood;
        Ok(log_likelihood)
    }

    /// `ln γ` (`K × T`).
    pub fn log_gamma(&self) -> &DMatrix<f64> {
        &self.log_gamma
    }

    /// `ln ξ_t` for t = 0..T-1 (each `K × K`).
    pub fn log_xi(&self) -> &[DMatrix<f64>] {
        &self.log_xi
    }

    /// Posterior marginals `γ` in probability space.
    pub fn gamma(&self) -> DMatrix<f64> {
        self.log_gamma.map(f64::exp)
    }

    /// Pairwise marginals `ξ_t` in probability space.
    pub fn xi(&self, t: usize) -> DMatrix<f64> {
        self.log_xi[t].map(f64::exp)
    }

    /// `q(s_t = state)` over all steps.
    pub fn responsibilities(&self, state: usize) -> Vec<f64> {
        self.log_gamma.row(state).iter().map(|l| l.exp()).collect()
    }

    /// `ln p(evidence)` from the last successful pass.
    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    /// Index of the most probable state at each step (marginal MAP).
    pub fn most_likely_regimes(&self) -> Vec<usize> {
        self.log_gamma
            .column_iter()
            .map(|column| {
                column
                    .iter()
                    .enumerate()
                    .fold((0, f64::NEG_INFINITY), |best, (k, v)| {
                        if *v > best.1 {
                            (k, *v)
                        } else {
                            best
                        }
                    })
                    .0
            })
            .collect()
    }
}
