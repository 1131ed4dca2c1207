//! M-step: closed-form parameter updates from the variational posterior.
//!
//! - `π ← γ[·, 0]`, `A[j, ·] ∝ Σ_t ξ_t[j, ·]`, both normalized, floored and
//!   renormalized
//! - per regime, the linear-Gaussian updates from its sufficient statistics,
//!   with the observation-side updates weighted by `γ[k, ·]`
//!
//! Updates never regularize: a re-estimate that is not positive definite
//! fails the step with `NumericalInstability`.

use nalgebra::{DMatrix, DVector};
use slds_common::Result;
use slds_math::clamp_and_normalize;

use super::estep::VariationalPosterior;
use super::slds::SwitchingModel;
use crate::config::FitConfig;
use crate::logging::{event_names, Stage};

/// Update `model` in place. Returns the Euclidean norm of the change in the
/// flattened regime parameters.
pub fn m_step(
    model: &mut SwitchingModel,
    observations: &DMatrix<f64>,
    posterior: &VariationalPosterior,
    config: &FitConfig,
) -> Result<f64> {
    let updates = &config.updates;
    let floor = config.probability_floor;
    let marginals = posterior.responsibilities();
    let k = model.num_regimes();
    let steps = observations.ncols();
    let before = model.parameter_vector();

    if updates.initial_distribution {
        let mut initial: Vec<f64> = marginals
            .log_gamma()
            .column(0)
            .iter()
            .map(|l| l.exp())
            .collect();
        clamp_and_normalize(&mut initial, floor);
        model.set_initial_distribution(DVector::from_vec(initial))?;
    }

    if updates.chain_transition && steps > 1 {
        let mut counts = DMatrix::zeros(k, k);
        for t in 0..steps - 1 {
            counts += marginals.xi(t);
        }
        let mut transition = DMatrix::zeros(k, k);
        for j in 0..k {
            let mut row: Vec<f64> = counts.row(j).iter().copied().collect();
            // Counts sum to roughly T; the floor applies to probabilities.
            let visits: f64 = row.iter().sum();
            if visits > 0.0 {
                row.iter_mut().for_each(|c| *c /= visits);
            }
            clamp_and_normalize(&mut row, floor);
            for (i, p) in row.into_iter().enumerate() {
                transition[(j, i)] = p;
            }
        }
        model.set_transition_matrix(transition)?;
    }

    for (index, regime) in model.regimes_mut().iter_mut().enumerate() {
        let stats = &posterior.regimes()[index].stats;
        let weights = marginals.responsibilities(index);

        if updates.initial_state_mean {
            regime.update_initial_state_mean(stats);
        }
        if updates.initial_state_covariance {
            regime.update_initial_state_covariance(stats)?;
        }
        if steps > 1 {
            if updates.regime_transition {
                regime.update_transition_matrix(stats)?;
            }
            if updates.process_noise {
                regime.update_process_noise(stats)?;
            }
        }
        if updates.observation_matrix {
            regime.update_observation_matrix(stats, observations, &weights)?;
        }
        if updates.observation_noise {
            regime.update_observation_noise(stats, observations, &weights)?;
        }
    }

    let after = model.parameter_vector();
    let change = before
        .iter()
        .zip(&after)
        .map(|(b, a)| (a - b).powi(2))
        .sum::<f64>()
        .sqrt();
    tracing::debug!(
        event = event_names::M_STEP_FINISHED,
        stage = %Stage::MStep,
        param_change = change,
        "parameters re-estimated"
    );
    Ok(change)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpdateMask;
    use crate::inference::chain::HiddenChain;
    use crate::inference::estep::variational_e_step;
    use crate::inference::lds::RegimeModel;

    fn scalar_regime(a: f64, q: f64) -> RegimeModel {
        RegimeModel::new(
            DMatrix::from_element(1, 1, a),
            DMatrix::from_element(1, 1, q),
            DMatrix::from_element(1, 1, 1.0),
            DMatrix::from_element(1, 1, 0.05),
            DVector::zeros(1),
            DMatrix::identity(1, 1),
        )
        .unwrap()
    }

    fn setup() -> (SwitchingModel, DMatrix<f64>) {
        let model = SwitchingModel::new(
            DVector::from_vec(vec![0.5, 0.5]),
            DMatrix::from_row_slice(2, 2, &[0.7, 0.3, 0.3, 0.7]),
            vec![scalar_regime(0.9, 0.05), scalar_regime(0.1, 2.0)],
        )
        .unwrap();
        let values: Vec<f64> = (0..30)
            .map(|t| if t < 15 { 0.1 * (t as f64).sin() } else { 1.5 * (-1.0f64).powi(t) })
            .collect();
        (model, DMatrix::from_row_slice(1, 30, &values))
    }

    fn posterior_for(
        model: &SwitchingModel,
        obs: &DMatrix<f64>,
        config: &FitConfig,
    ) -> VariationalPosterior {
        let mut posterior = VariationalPosterior::initialize(model, obs, false).unwrap();
        variational_e_step(model, obs, &mut posterior, config).unwrap();
        posterior
    }

    #[test]
    fn test_empty_mask_changes_nothing() {
        let (mut model, obs) = setup();
        let config = FitConfig {
            parallel: false,
            updates: UpdateMask::none(),
            ..FitConfig::default()
        };
        let posterior = posterior_for(&model, &obs, &config);
        let original = model.clone();
        let change = m_step(&mut model, &obs, &posterior, &config).unwrap();
        assert_eq!(change, 0.0);
        assert_eq!(model, original);
    }

    #[test]
    fn test_chain_updates_stay_stochastic() {
        let (mut model, obs) = setup();
        let config = FitConfig {
            parallel: false,
            ..FitConfig::default()
        };
        let posterior = posterior_for(&model, &obs, &config);
        let change = m_step(&mut model, &obs, &posterior, &config).unwrap();
        assert!(change > 0.0);
        assert!((model.initial_distribution().sum() - 1.0).abs() < 1e-12);
        let floor = config.probability_floor;
        for row in model.transition_matrix().row_iter() {
            assert!((row.sum() - 1.0).abs() < 1e-12);
            assert!(row.iter().all(|p| *p >= floor * (1.0 - 1e-6)));
        }
        // Long runs in each regime make self-transitions dominate.
        assert!(model.transition_matrix()[(0, 0)] > 0.5);
    }

    #[test]
    fn test_unused_transitions_keep_the_floor() {
        // Regime 0 is absorbing and regime 1 is never entered, so ξ puts
        // exactly zero mass on 0 -> 1 and on the whole of row 1.
        let (_, obs) = setup();
        let mut model = SwitchingModel::new(
            DVector::from_vec(vec![1.0, 0.0]),
            DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.5, 0.5]),
            vec![scalar_regime(0.9, 0.05), scalar_regime(0.1, 2.0)],
        )
        .unwrap();
        let config = FitConfig {
            parallel: false,
            updates: UpdateMask {
                initial_distribution: true,
                chain_transition: true,
                ..UpdateMask::none()
            },
            ..FitConfig::default()
        };
        let posterior = posterior_for(&model, &obs, &config);
        m_step(&mut model, &obs, &posterior, &config).unwrap();

        let floor = config.probability_floor;
        let transition = model.transition_matrix();
        assert!(transition[(0, 1)] >= floor * (1.0 - 1e-6), "A[0,1] = {}", transition[(0, 1)]);
        assert!((transition[(0, 0)] + transition[(0, 1)] - 1.0).abs() < 1e-12);
        assert!((transition[(1, 0)] - 0.5).abs() < 1e-12);
        assert!((transition[(1, 1)] - 0.5).abs() < 1e-12);
        assert!(model.initial_distribution()[1] >= floor * (1.0 - 1e-6));
    }

    #[test]
    fn test_observation_noise_only_with_flag() {
        let (mut model, obs) = setup();
        let config = FitConfig {
            parallel: false,
            ..FitConfig::default()
        };
        let posterior = posterior_for(&model, &obs, &config);
        let r_before = model.regimes()[0].observation_noise().clone();
        m_step(&mut model, &obs, &posterior, &config).unwrap();
        assert_eq!(model.regimes()[0].observation_noise(), &r_before);

        let (mut model, obs) = setup();
        let config = FitConfig {
            parallel: false,
            updates: UpdateMask::all(),
            ..FitConfig::default()
        };
        let posterior = posterior_for(&model, &obs, &config);
        m_step(&mut model, &obs, &posterior, &config).unwrap();
        assert_ne!(model.regimes()[0].observation_noise(), &r_before);
    }
}
