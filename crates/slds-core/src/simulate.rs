//! Sampling from the generative switching model.
//!
//! The regime path is drawn from `(π, A)`; every regime's latent chain
//! evolves under its own dynamics at every step; `y_t` is emitted by the
//! regime active at `t`. Seeded, so a given `(model, steps, seed)` always
//! produces the same sample.

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::Serialize;
use slds_common::{Error, Result};
use slds_math::{matrix_to_rows, spd_cholesky};

use crate::inference::chain::HiddenChain;
use crate::inference::slds::SwitchingModel;
use crate::logging::{event_names, Stage};

/// One sampled sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Simulation {
    /// Active regime per step.
    pub regimes: Vec<usize>,
    /// Each regime's latent path (`state_dim_k × T`).
    pub latents: Vec<DMatrix<f64>>,
    /// Observations (`obs_dim × T`).
    pub observations: DMatrix<f64>,
}

/// JSON shape written by `slds simulate`; readable by `load_observations`.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationOutput {
    pub seed: u64,
    pub regimes: Vec<usize>,
    /// T rows of length `obs_dim`.
    pub observations: Vec<Vec<f64>>,
}

impl Simulation {
    pub fn to_output(&self, seed: u64) -> SimulationOutput {
        SimulationOutput {
            seed,
            regimes: self.regimes.clone(),
            observations: matrix_to_rows(&self.observations.transpose()),
        }
    }
}

/// Draws `N(0, Σ)` through a Cholesky factor.
struct GaussianSampler {
    factor: DMatrix<f64>,
}

impl GaussianSampler {
    fn new(covariance: &DMatrix<f64>, what: &str) -> Result<Self> {
        let chol = spd_cholesky(covariance).ok_or_else(|| {
            Error::NumericalInstability(format!("{what} is not positive definite"))
        })?;
        Ok(Self { factor: chol.l() })
    }

    fn sample<R: Rng>(&self, rng: &mut R) -> DVector<f64> {
        let z = DVector::from_fn(self.factor.nrows(), |_, _| rng.sample(StandardNormal));
        &self.factor * z
    }
}

fn sample_categorical<R: Rng>(rng: &mut R, probs: impl Iterator<Item = f64>) -> usize {
    let u: f64 = rng.random();
    let mut cumulative = 0.0;
    let mut last = 0;
    for (k, p) in probs.enumerate() {
        cumulative += p;
        last = k;
        if u < cumulative {
            return k;
        }
    }
    last
}

/// Sample `steps` observations from `model` with a fixed seed.
pub fn simulate(model: &SwitchingModel, steps: usize, seed: u64) -> Result<Simulation> {
    if steps == 0 {
        return Err(Error::InvalidObservations(
            "simulation needs at least one step".into(),
        ));
    }
    let mut rng = StdRng::seed_from_u64(seed);

    struct RegimeSamplers {
        initial: GaussianSampler,
        process: GaussianSampler,
        observation: GaussianSampler,
    }
    let samplers = model
        .regimes()
        .iter()
        .enumerate()
        .map(|(k, regime)| {
            Ok(RegimeSamplers {
                initial: GaussianSampler::new(
                    regime.initial_covariance(),
                    &format!("initial state covariance of regime {k}"),
                )?,
                process: GaussianSampler::new(
                    regime.process_noise(),
                    &format!("process noise of regime {k}"),
                )?,
                observation: GaussianSampler::new(
                    regime.observation_noise(),
                    &format!("observation noise of regime {k}"),
                )?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut regimes = Vec::with_capacity(steps);
    let mut latents: Vec<DMatrix<f64>> = model
        .regimes()
        .iter()
        .map(|r| DMatrix::zeros(r.state_dim(), steps))
        .collect();
    let mut observations = DMatrix::zeros(model.obs_dim(), steps);
    let mut states: Vec<DVector<f64>> = Vec::with_capacity(model.num_regimes());

    for t in 0..steps {
        let active = if t == 0 {
            sample_categorical(&mut rng, model.initial_distribution().iter().copied())
        } else {
            let prev = regimes[t - 1];
            sample_categorical(&mut rng, model.transition_matrix().row(prev).iter().copied())
        };
        regimes.push(active);

        for (k, (regime, sampler)) in model.regimes().iter().zip(&samplers).enumerate() {
            let next = if t == 0 {
                regime.initial_mean() + sampler.initial.sample(&mut rng)
            } else {
                regime.transition() * &states[k] + sampler.process.sample(&mut rng)
            };
            latents[k].set_column(t, &next);
            if t == 0 {
                states.push(next);
            } else {
                states[k] = next;
            }
        }

        let regime = &model.regimes()[active];
        let y = regime.observation_matrix() * &states[active]
            + samplers[active].observation.sample(&mut rng);
        observations.set_column(t, &y);
    }

    tracing::debug!(
        event = event_names::SIMULATE_FINISHED,
        stage = %Stage::Simulate,
        steps,
        seed,
        "simulated sequence"
    );

    Ok(Simulation {
        regimes,
        latents,
        observations,
    })
}
