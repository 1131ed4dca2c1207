//! Per-regime linear dynamical system with responsibility-weighted smoothing.
//!
//! # Model
//!
//! Each regime `k` owns a latent chain that evolves at every step, whether
//! or not the regime is active:
//! ```text
//! x_0     ~ N(x0, P0)
//! x_{t+1} = A × x_t + w_t      w_t ~ N(0, Q)
//! y_t     = C × x_t + v_t      v_t ~ N(0, R)
//! ```
//!
//! Under the structured mean-field posterior the observation at step `t`
//! reaches regime `k` with weight `w_t = q(s_t = k)`. Smoothing that chain is
//! an ordinary Kalman filter + RTS pass with observation noise `R / w_t`;
//! steps with a negligible weight are treated as unobserved.
//!
//! # Algorithm
//!
//! 1. **Forward filter**: weighted predict/update, Joseph-form covariance
//! 2. **Backward smoother** (RTS): smoothed moments, lag-one cross
//!    covariances, and the entropy of the joint Gaussian posterior
//! 3. **Sufficient statistics**: `E[z_t]`, `E[z_t z_tᵀ]`, `E[z_t z_{t-1}ᵀ]`

use nalgebra::{DMatrix, DVector};
use slds_common::{Error, Result};
use slds_math::{
    gaussian_entropy, log_det, mahalanobis_sq, solve_right_spd, spd_cholesky, symmetrize,
    trace_of_product, LN_2PI,
};

/// Weights below this are treated as "regime absent at this step".
pub const MIN_WEIGHT: f64 = 1e-12;

/// Parameters of one regime's linear-Gaussian sub-model.
#[derive(Debug, Clone, PartialEq)]
pub struct RegimeModel {
    a: DMatrix<f64>,
    q: DMatrix<f64>,
    c: DMatrix<f64>,
    r: DMatrix<f64>,
    x0: DVector<f64>,
    p0: DMatrix<f64>,
}

/// Expected sufficient statistics of one regime's latent chain.
#[derive(Debug, Clone, PartialEq)]
pub struct SufficientStats {
    /// `E[z_t]`, length T.
    pub e_z: Vec<DVector<f64>>,
    /// `E[z_t z_tᵀ]`, length T.
    pub e_zz: Vec<DMatrix<f64>>,
    /// `E[z_t z_{t-1}ᵀ]` for t = 1..T, stored at index t-1 (length T-1).
    pub e_zz_prev: Vec<DMatrix<f64>>,
}

/// Build statistics from smoothed moments.
///
/// `cross_covariances[t]` is `Cov(x_{t+1}, x_t)`.
pub fn sufficient_statistics(
    means: &[DVector<f64>],
    covariances: &[DMatrix<f64>],
    cross_covariances: &[DMatrix<f64>],
) -> SufficientStats {
    let e_z = means.to_vec();
    let e_zz = means
        .iter()
        .zip(covariances)
        .map(|(m, p)| p + m * m.transpose())
        .collect();
    let e_zz_prev = cross_covariances
        .iter()
        .enumerate()
        .map(|(t, cross)| cross + &means[t + 1] * means[t].transpose())
        .collect();
    SufficientStats {
        e_z,
        e_zz,
        e_zz_prev,
    }
}

impl SufficientStats {
    /// Number of time steps covered.
    pub fn len(&self) -> usize {
        self.e_z.len()
    }

    pub fn is_empty(&self) -> bool {
        self.e_z.is_empty()
    }

    /// Expected residual scatter of the transition model:
    /// `Σ_{t≥1} E[(z_t − A z_{t-1})(z_t − A z_{t-1})ᵀ]`.
    fn transition_scatter(&self, a: &DMatrix<f64>) -> DMatrix<f64> {
        let n = a.nrows();
        let mut scatter = DMatrix::zeros(n, n);
        for t in 1..self.len() {
            let prev = &self.e_zz_prev[t - 1];
            scatter += &self.e_zz[t] - prev * a.transpose() - a * prev.transpose()
                + a * &self.e_zz[t - 1] * a.transpose();
        }
        scatter
    }
}

/// Smoothed posterior over one regime's latent trajectory.
#[derive(Debug, Clone)]
pub struct RegimePosterior {
    /// Smoothed means `E[x_t | y]`.
    pub means: Vec<DVector<f64>>,
    /// Smoothed covariances `Cov(x_t | y)`.
    pub covariances: Vec<DMatrix<f64>>,
    /// Lag-one cross covariances `Cov(x_{t+1}, x_t | y)`, length T-1.
    pub cross_covariances: Vec<DMatrix<f64>>,
    /// Differential entropy of the joint trajectory posterior.
    pub entropy: f64,
    /// Log-likelihood of the weighted filter (exact when all weights are 1).
    pub log_likelihood: f64,
    /// Expected sufficient statistics derived from the moments above.
    pub stats: SufficientStats,
}

impl RegimePosterior {
    pub fn len(&self) -> usize {
        self.means.len()
    }

    pub fn is_empty(&self) -> bool {
        self.means.is_empty()
    }
}

fn check_finite(what: &str, values: &[f64]) -> Result<()> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(Error::InvalidModel(format!("{what} contains non-finite entries")))
    }
}

fn check_square(what: &str, m: &DMatrix<f64>, dim: usize) -> Result<()> {
    if m.nrows() != dim {
        return Err(Error::dimension(format!("{what} rows"), dim, m.nrows()));
    }
    if m.ncols() != dim {
        return Err(Error::dimension(format!("{what} columns"), dim, m.ncols()));
    }
    Ok(())
}

fn not_positive_definite(what: &str) -> Error {
    Error::NumericalInstability(format!("{what} is not positive definite"))
}

impl RegimeModel {
    /// Create a regime sub-model, validating shapes and finiteness.
    ///
    /// Positive definiteness of `Q`, `R` and `P0` is checked where they are
    /// factored, not here.
    pub fn new(
        a: DMatrix<f64>,
        q: DMatrix<f64>,
        c: DMatrix<f64>,
        r: DMatrix<f64>,
        x0: DVector<f64>,
        p0: DMatrix<f64>,
    ) -> Result<Self> {
        let n = a.nrows();
        if n == 0 {
            return Err(Error::InvalidModel("state dimension must be positive".into()));
        }
        check_square("state transition", &a, n)?;
        check_square("process noise", &q, n)?;
        check_square("initial state covariance", &p0, n)?;
        if x0.len() != n {
            return Err(Error::dimension("initial state mean", n, x0.len()));
        }
        let m = c.nrows();
        if m == 0 {
            return Err(Error::InvalidModel(
                "observation dimension must be positive".into(),
            ));
        }
        if c.ncols() != n {
            return Err(Error::dimension("observation matrix columns", n, c.ncols()));
        }
        check_square("observation noise", &r, m)?;

        check_finite("state transition", a.as_slice())?;
        check_finite("process noise", q.as_slice())?;
        check_finite("observation matrix", c.as_slice())?;
        check_finite("observation noise", r.as_slice())?;
        check_finite("initial state mean", x0.as_slice())?;
        check_finite("initial state covariance", p0.as_slice())?;

        Ok(Self { a, q, c, r, x0, p0 })
    }

    pub fn state_dim(&self) -> usize {
        self.a.nrows()
    }

    pub fn obs_dim(&self) -> usize {
        self.c.nrows()
    }

    pub fn transition(&self) -> &DMatrix<f64> {
        &self.a
    }

    pub fn process_noise(&self) -> &DMatrix<f64> {
        &self.q
    }

    pub fn observation_matrix(&self) -> &DMatrix<f64> {
        &self.c
    }

    pub fn observation_noise(&self) -> &DMatrix<f64> {
        &self.r
    }

    pub fn initial_mean(&self) -> &DVector<f64> {
        &self.x0
    }

    pub fn initial_covariance(&self) -> &DMatrix<f64> {
        &self.p0
    }

    fn check_observations(&self, observations: &DMatrix<f64>, weights: &[f64]) -> Result<()> {
        if observations.nrows() != self.obs_dim() {
            return Err(Error::dimension(
                "observation rows",
                self.obs_dim(),
                observations.nrows(),
            ));
        }
        if observations.ncols() == 0 {
            return Err(Error::InvalidObservations("sequence is empty".into()));
        }
        if weights.len() != observations.ncols() {
            return Err(Error::dimension(
                "responsibility weights",
                observations.ncols(),
                weights.len(),
            ));
        }
        Ok(())
    }

    /// Smooth the latent chain given per-step responsibility weights.
    ///
    /// `observations` is `obs_dim × T`. Fails with `DegenerateLikelihood` when
    /// the weights are non-finite, negative or all zero, and with
    /// `NumericalInstability` when a covariance loses positive definiteness.
    pub fn smooth(&self, observations: &DMatrix<f64>, weights: &[f64]) -> Result<RegimePosterior> {
        self.check_observations(observations, weights)?;
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(Error::DegenerateLikelihood(
                "responsibility weights must be finite and non-negative".into(),
            ));
        }
        if weights.iter().all(|w| *w == 0.0) {
            return Err(Error::DegenerateLikelihood(
                "regime carries zero responsibility at every step".into(),
            ));
        }

        let n = self.state_dim();
        let m = self.obs_dim();
        let steps = observations.ncols();
        let identity = DMatrix::<f64>::identity(n, n);

        let mut pred_means: Vec<DVector<f64>> = Vec::with_capacity(steps);
        let mut pred_covs: Vec<DMatrix<f64>> = Vec::with_capacity(steps);
        let mut filt_means: Vec<DVector<f64>> = Vec::with_capacity(steps);
        let mut filt_covs: Vec<DMatrix<f64>> = Vec::with_capacity(steps);
        let mut log_likelihood = 0.0;

        for t in 0..steps {
            let (m_pred, p_pred) = if t == 0 {
                (self.x0.clone(), symmetrize(&self.p0))
            } else {
                (
                    &self.a * &filt_means[t - 1],
                    symmetrize(&(&self.a * &filt_covs[t - 1] * self.a.transpose() + &self.q)),
                )
            };

            let w = weights[t];
            let (m_filt, p_filt) = if w < MIN_WEIGHT {
                (m_pred.clone(), p_pred.clone())
            } else {
                let r_eff = &self.r * (1.0 / w);
                let y = observations.column(t).into_owned();
                let innovation = y - &self.c * &m_pred;
                let cp = &self.c * &p_pred;
                let s = &cp * self.c.transpose() + &r_eff;
                let chol = spd_cholesky(&s).ok_or_else(|| {
                    Error::NumericalInstability(format!(
                        "innovation covariance is not positive definite at t={t}"
                    ))
                })?;
                log_likelihood -= 0.5
                    * (m as f64 * LN_2PI
                        + log_det(&chol)
                        + mahalanobis_sq(&chol, &innovation));

                // K = P Cᵀ S⁻¹ = (S⁻¹ C P)ᵀ
                let gain = chol.solve(&cp).transpose();
                let m_filt = &m_pred + &gain * innovation;
                let i_kc = &identity - &gain * &self.c;
                let p_filt = symmetrize(
                    &(&i_kc * &p_pred * i_kc.transpose() + &gain * r_eff * gain.transpose()),
                );
                (m_filt, p_filt)
            };

            pred_means.push(m_pred);
            pred_covs.push(p_pred);
            filt_means.push(m_filt);
            filt_covs.push(p_filt);
        }

        let mut means = filt_means.clone();
        let mut covariances = filt_covs.clone();
        let mut cross_covariances = vec![DMatrix::zeros(n, n); steps.saturating_sub(1)];
        let mut entropy = 0.0;

        for t in (0..steps.saturating_sub(1)).rev() {
            let chol_pred = spd_cholesky(&pred_covs[t + 1]).ok_or_else(|| {
                Error::NumericalInstability(format!(
                    "predicted state covariance is not positive definite at t={}",
                    t + 1
                ))
            })?;
            // J = P_{t|t} Aᵀ P_{t+1|t}⁻¹ = (P_{t+1|t}⁻¹ A P_{t|t})ᵀ
            let smoother_gain = chol_pred.solve(&(&self.a * &filt_covs[t])).transpose();

            means[t] = &filt_means[t] + &smoother_gain * (&means[t + 1] - &pred_means[t + 1]);
            covariances[t] = symmetrize(
                &(&filt_covs[t]
                    + &smoother_gain * (&covariances[t + 1] - &pred_covs[t + 1])
                        * smoother_gain.transpose()),
            );
            cross_covariances[t] = &covariances[t + 1] * smoother_gain.transpose();

            // Cov(x_t | x_{t+1}, y) does not depend on x_{t+1}.
            let conditional = symmetrize(
                &(&filt_covs[t] - &smoother_gain * &pred_covs[t + 1] * smoother_gain.transpose()),
            );
            let chol_cond = spd_cholesky(&conditional).ok_or_else(|| {
                Error::NumericalInstability(format!(
                    "backward conditional covariance is not positive definite at t={t}"
                ))
            })?;
            entropy += gaussian_entropy(log_det(&chol_cond), n);
        }

        let chol_last = spd_cholesky(&covariances[steps - 1])
            .ok_or_else(|| not_positive_definite("final smoothed state covariance"))?;
        entropy += gaussian_entropy(log_det(&chol_last), n);

        let stats = sufficient_statistics(&means, &covariances, &cross_covariances);
        Ok(RegimePosterior {
            means,
            covariances,
            cross_covariances,
            entropy,
            log_likelihood,
            stats,
        })
    }

    /// Expected per-step emission log-likelihood under the smoothed posterior:
    /// `E_q[ln N(y_t; C x_t, R)]`.
    pub fn emission_log_likelihoods(
        &self,
        observations: &DMatrix<f64>,
        posterior: &RegimePosterior,
    ) -> Result<Vec<f64>> {
        if observations.nrows() != self.obs_dim() {
            return Err(Error::dimension(
                "observation rows",
                self.obs_dim(),
                observations.nrows(),
            ));
        }
        if posterior.len() != observations.ncols() {
            return Err(Error::dimension(
                "smoothed trajectory length",
                observations.ncols(),
                posterior.len(),
            ));
        }

        let chol_r =
            spd_cholesky(&self.r).ok_or_else(|| not_positive_definite("observation noise"))?;
        let norm = self.obs_dim() as f64 * LN_2PI + log_det(&chol_r);
        let ct_rinv_c = self.c.transpose() * chol_r.solve(&self.c);

        let scores = posterior
            .means
            .iter()
            .zip(&posterior.covariances)
            .enumerate()
            .map(|(t, (mean, cov))| {
                let residual = observations.column(t).into_owned() - &self.c * mean;
                -0.5 * (norm
                    + mahalanobis_sq(&chol_r, &residual)
                    + trace_of_product(&ct_rinv_c, cov))
            })
            .collect();
        Ok(scores)
    }

    /// Expected log-density of the latent trajectory under the dynamics prior.
    pub fn dynamics_log_prior(&self, stats: &SufficientStats) -> Result<f64> {
        if stats.is_empty() {
            return Err(Error::InvalidObservations("sequence is empty".into()));
        }
        let n = self.state_dim() as f64;
        let steps = stats.len();

        let chol_p0 = spd_cholesky(&self.p0)
            .ok_or_else(|| not_positive_definite("initial state covariance"))?;
        let e_z0 = &stats.e_z[0];
        let scatter0 = &stats.e_zz[0] - e_z0 * self.x0.transpose() - &self.x0 * e_z0.transpose()
            + &self.x0 * self.x0.transpose();
        let mut log_prior = -0.5 * (n * LN_2PI + log_det(&chol_p0) + chol_p0.solve(&scatter0).trace());

        if steps > 1 {
            let chol_q =
                spd_cholesky(&self.q).ok_or_else(|| not_positive_definite("process noise"))?;
            let scatter = stats.transition_scatter(&self.a);
            log_prior -= 0.5
                * ((steps - 1) as f64 * (n * LN_2PI + log_det(&chol_q))
                    + chol_q.solve(&scatter).trace());
        }
        Ok(log_prior)
    }

    /// Per-regime evidence lower bound: dynamics prior, weighted expected
    /// emissions, and trajectory entropy.
    ///
    /// With unit weights and a single regime this equals the exact
    /// log-likelihood of the linear-Gaussian model.
    pub fn calculate_elbo(
        &self,
        posterior: &RegimePosterior,
        observations: &DMatrix<f64>,
        weights: &[f64],
    ) -> Result<f64> {
        self.check_observations(observations, weights)?;
        let emissions = self.emission_log_likelihoods(observations, posterior)?;
        let weighted: f64 = emissions.iter().zip(weights).map(|(l, w)| w * l).sum();
        Ok(self.dynamics_log_prior(&posterior.stats)? + weighted + posterior.entropy)
    }

    /// `x0 ← E[z_0]`.
    pub fn update_initial_state_mean(&mut self, stats: &SufficientStats) {
        if let Some(e_z0) = stats.e_z.first() {
            self.x0 = e_z0.clone();
        }
    }

    /// `P0 ← E[(z_0 − x0)(z_0 − x0)ᵀ]` about the current `x0`.
    pub fn update_initial_state_covariance(&mut self, stats: &SufficientStats) -> Result<()> {
        let (Some(e_z0), Some(e_zz0)) = (stats.e_z.first(), stats.e_zz.first()) else {
            return Err(Error::InvalidObservations("sequence is empty".into()));
        };
        let p0 = symmetrize(
            &(e_zz0 - e_z0 * self.x0.transpose() - &self.x0 * e_z0.transpose()
                + &self.x0 * self.x0.transpose()),
        );
        if spd_cholesky(&p0).is_none() {
            return Err(not_positive_definite("re-estimated initial state covariance"));
        }
        self.p0 = p0;
        Ok(())
    }

    /// `A ← (Σ E[z_t z_{t-1}ᵀ]) (Σ E[z_{t-1} z_{t-1}ᵀ])⁻¹`.
    pub fn update_transition_matrix(&mut self, stats: &SufficientStats) -> Result<()> {
        let steps = stats.len();
        if steps < 2 {
            return Err(Error::InvalidObservations(
                "re-estimating the state transition needs at least two steps".into(),
            ));
        }
        let n = self.state_dim();
        let mut numerator = DMatrix::zeros(n, n);
        let mut denominator = DMatrix::zeros(n, n);
        for t in 1..steps {
            numerator += &stats.e_zz_prev[t - 1];
            denominator += &stats.e_zz[t - 1];
        }
        self.a = solve_right_spd(&numerator, &denominator)
            .ok_or_else(|| not_positive_definite("accumulated state second moment"))?;
        Ok(())
    }

    /// `Q ← scatter(A) / (T − 1)` using the current `A`.
    pub fn update_process_noise(&mut self, stats: &SufficientStats) -> Result<()> {
        let steps = stats.len();
        if steps < 2 {
            return Err(Error::InvalidObservations(
                "re-estimating the process noise needs at least two steps".into(),
            ));
        }
        let q = symmetrize(&(stats.transition_scatter(&self.a) / (steps - 1) as f64));
        if spd_cholesky(&q).is_none() {
            return Err(not_positive_definite("re-estimated process noise"));
        }
        self.q = q;
        Ok(())
    }

    /// `C ← (Σ w_t y_t E[z_t]ᵀ) (Σ w_t E[z_t z_tᵀ])⁻¹`.
    pub fn update_observation_matrix(
        &mut self,
        stats: &SufficientStats,
        observations: &DMatrix<f64>,
        weights: &[f64],
    ) -> Result<()> {
        self.check_observations(observations, weights)?;
        let n = self.state_dim();
        let mut numerator = DMatrix::zeros(self.obs_dim(), n);
        let mut denominator = DMatrix::zeros(n, n);
        for (t, w) in weights.iter().enumerate() {
            numerator += observations.column(t) * stats.e_z[t].transpose() * *w;
            denominator += &stats.e_zz[t] * *w;
        }
        self.c = solve_right_spd(&numerator, &denominator)
            .ok_or_else(|| not_positive_definite("weighted state second moment"))?;
        Ok(())
    }

    /// `R ← Σ w_t E[(y_t − C z_t)(y_t − C z_t)ᵀ] / Σ w_t` using the current `C`.
    pub fn update_observation_noise(
        &mut self,
        stats: &SufficientStats,
        observations: &DMatrix<f64>,
        weights: &[f64],
    ) -> Result<()> {
        self.check_observations(observations, weights)?;
        let total: f64 = weights.iter().sum();
        if total <= 0.0 || !total.is_finite() {
            return Err(Error::DegenerateLikelihood(
                "regime carries zero responsibility at every step".into(),
            ));
        }
        let m = self.obs_dim();
        let mut scatter = DMatrix::zeros(m, m);
        for (t, w) in weights.iter().enumerate() {
            let y = observations.column(t).into_owned();
            let c_ez = &self.c * &stats.e_z[t];
            scatter += (&y * y.transpose() - &c_ez * y.transpose() - &y * c_ez.transpose()
                + &self.c * &stats.e_zz[t] * self.c.transpose())
                * *w;
        }
        let r = symmetrize(&(scatter / total));
        if spd_cholesky(&r).is_none() {
            return Err(not_positive_definite("re-estimated observation noise"));
        }
        self.r = r;
        Ok(())
    }

    /// Flattened `[A, Q, x0, P0]` in column-major order.
    pub fn state_params(&self) -> Vec<f64> {
        self.a
            .iter()
            .chain(self.q.iter())
            .chain(self.x0.iter())
            .chain(self.p0.iter())
            .copied()
            .collect()
    }

    /// Flattened `[C, R]` in column-major order.
    pub fn obs_params(&self) -> Vec<f64> {
        self.c.iter().chain(self.r.iter()).copied().collect()
    }
}
