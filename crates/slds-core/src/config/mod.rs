//! Configuration loading and validation for slds-core.
//!
//! This module handles:
//! - Fit settings (iteration budgets, tolerances, which parameters to update)
//! - Model definition files (TOML or JSON, chosen by extension)
//! - Observation files (JSON rows)

pub mod model;

pub use model::{load_model_spec, ModelSpec, RegimeSpec};

use std::path::Path;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use slds_common::{Error, Result};
use slds_math::PROBABILITY_FLOOR;

pub use crate::inference::elbo::ChainEntropy;
use crate::inference::slds::observations_from_rows;

/// Largest probability floor accepted by [`FitConfig::validate`].
pub const MAX_PROBABILITY_FLOOR: f64 = 1e-3;

/// Which parameters the M-step re-estimates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpdateMask {
    /// Regime chain initial distribution `π`.
    pub initial_distribution: bool,
    /// Regime chain transition matrix.
    pub chain_transition: bool,
    /// Per-regime initial state mean `x0`.
    pub initial_state_mean: bool,
    /// Per-regime initial state covariance `P0`.
    pub initial_state_covariance: bool,
    /// Per-regime state transition `A`.
    pub regime_transition: bool,
    /// Per-regime process noise `Q`.
    pub process_noise: bool,
    /// Per-regime observation matrix `C`.
    pub observation_matrix: bool,
    /// Per-regime observation noise `R`. Off by default.
    pub observation_noise: bool,
}

impl Default for UpdateMask {
    fn default() -> Self {
        Self {
            initial_distribution: true,
            chain_transition: true,
            initial_state_mean: true,
            initial_state_covariance: true,
            regime_transition: true,
            process_noise: true,
            observation_matrix: true,
            observation_noise: false,
        }
    }
}

impl UpdateMask {
    /// Update nothing.
    pub fn none() -> Self {
        Self {
            initial_distribution: false,
            chain_transition: false,
            initial_state_mean: false,
            initial_state_covariance: false,
            regime_transition: false,
            process_noise: false,
            observation_matrix: false,
            observation_noise: false,
        }
    }

    /// Regime chain plus each regime's `A` and `Q`; the observation model
    /// and initial state stay fixed.
    pub fn dynamics_only() -> Self {
        Self {
            initial_distribution: true,
            chain_transition: true,
            regime_transition: true,
            process_noise: true,
            ..Self::none()
        }
    }

    /// Every parameter, including the observation noise.
    pub fn all() -> Self {
        Self {
            observation_noise: true,
            ..Self::default()
        }
    }
}

/// Settings for one variational EM fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FitConfig {
    /// Outer EM iteration budget.
    pub max_iter: usize,
    /// Outer tolerance on the change in the bound between EM iterations.
    pub tol: f64,
    /// Inner (variational E-step) iteration budget.
    pub inner_max_iter: usize,
    /// Inner tolerance on the change in the bound between E-step sweeps.
    pub inner_tol: f64,
    /// Floor applied to probabilities before logarithms and in the M-step.
    pub probability_floor: f64,
    /// Entropy of `q(s)` used in the bound. Defaults to
    /// [`ChainEntropy::Exact`]; [`ChainEntropy::Marginal`] gives the plain
    /// `−Σ γ ln γ` term.
    pub entropy: ChainEntropy,
    /// Score and smooth regimes on the rayon pool (needs the `parallel` feature).
    pub parallel: bool,
    pub updates: UpdateMask,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            max_iter: 1000,
            tol: 1e-3,
            inner_max_iter: 100,
            inner_tol: 1e-6,
            probability_floor: PROBABILITY_FLOOR,
            entropy: ChainEntropy::Exact,
            parallel: true,
            updates: UpdateMask::default(),
        }
    }
}

impl FitConfig {
    /// Validate budgets, tolerances and the probability floor.
    pub fn validate(&self) -> Result<()> {
        if self.max_iter == 0 {
            return Err(Error::Config("max_iter must be at least 1".into()));
        }
        if self.inner_max_iter == 0 {
            return Err(Error::Config("inner_max_iter must be at least 1".into()));
        }
        if !(self.tol.is_finite() && self.tol > 0.0) {
            return Err(Error::Config(format!("tol must be positive, got {}", self.tol)));
        }
        if !(self.inner_tol.is_finite() && self.inner_tol > 0.0) {
            return Err(Error::Config(format!(
                "inner_tol must be positive, got {}",
                self.inner_tol
            )));
        }
        if !(self.probability_floor > 0.0 && self.probability_floor <= MAX_PROBABILITY_FLOOR) {
            return Err(Error::Config(format!(
                "probability_floor must lie in (0, {MAX_PROBABILITY_FLOOR}], got {}",
                self.probability_floor
            )));
        }
        Ok(())
    }

    /// Parse and validate a TOML fit configuration.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: FitConfig = toml::from_str(text).map_err(|e| Error::Toml(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

/// Load a fit configuration from a TOML (or `.json`) file.
pub fn load_fit_config(path: &Path) -> Result<FitConfig> {
    let text = std::fs::read_to_string(path)?;
    let config: FitConfig = if is_json(path) {
        serde_json::from_str(&text)?
    } else {
        toml::from_str(&text).map_err(|e| Error::Toml(e.to_string()))?
    };
    config.validate()?;
    tracing::debug!(path = %path.display(), "loaded fit config");
    Ok(config)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ObservationFile {
    Rows(Vec<Vec<f64>>),
    Wrapped { observations: Vec<Vec<f64>> },
}

/// Load observations from JSON: either an array of T rows, or an object with
/// an `observations` array (the shape `slds simulate` writes).
///
/// Returns an `obs_dim × T` matrix.
pub fn load_observations(path: &Path) -> Result<DMatrix<f64>> {
    let text = std::fs::read_to_string(path)?;
    parse_observations(&text)
}

/// Parse observation JSON (see [`load_observations`]).
pub fn parse_observations(text: &str) -> Result<DMatrix<f64>> {
    let rows = match serde_json::from_str::<ObservationFile>(text)? {
        ObservationFile::Rows(rows) => rows,
        ObservationFile::Wrapped { observations } => observations,
    };
    observations_from_rows(&rows)
}

/// Whether `path` names a JSON file (by extension, case-insensitive).
pub fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = FitConfig::default();
        assert_eq!(config.max_iter, 1000);
        assert_eq!(config.tol, 1e-3);
        assert_eq!(config.inner_max_iter, 100);
        assert_eq!(config.inner_tol, 1e-6);
        assert_eq!(config.entropy, ChainEntropy::Exact);
        assert!(!config.updates.observation_noise);
        assert!(config.updates.observation_matrix);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = FitConfig::from_toml_str(
            r#"
            max_iter = 50
            entropy = "marginal"

            [updates]
            observation_noise = true
            "#,
        )
        .unwrap();
        assert_eq!(config.max_iter, 50);
        assert_eq!(config.inner_max_iter, 100);
        assert_eq!(config.entropy, ChainEntropy::Marginal);
        assert!(config.updates.observation_noise);
        assert!(config.updates.process_noise);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let err = FitConfig::from_toml_str("max_iters = 5").unwrap_err();
        assert_eq!(err.code(), 62);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = FitConfig {
            tol: 0.0,
            ..FitConfig::default()
        };
        assert!(config.validate().is_err());
        config.tol = 1e-3;
        config.inner_max_iter = 0;
        assert!(config.validate().is_err());
        config.inner_max_iter = 10;
        config.probability_floor = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_masks() {
        let dynamics = UpdateMask::dynamics_only();
        assert!(dynamics.regime_transition && dynamics.process_noise);
        assert!(!dynamics.observation_matrix && !dynamics.initial_state_mean);
        assert!(UpdateMask::all().observation_noise);
    }

    #[test]
    fn test_parse_observations_both_shapes() {
        let rows = parse_observations("[[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]").unwrap();
        assert_eq!(rows.shape(), (2, 3));
        let wrapped =
            parse_observations(r#"{"observations": [[1.0], [2.0]], "regimes": [0, 1]}"#).unwrap();
        assert_eq!(wrapped.shape(), (1, 2));
        assert_eq!(wrapped[(0, 1)], 2.0);
        assert!(parse_observations("[]").is_err());
    }

    #[test]
    fn test_is_json_by_extension() {
        assert!(is_json(Path::new("fitted.json")));
        assert!(is_json(Path::new("out/FITTED.JSON")));
        assert!(!is_json(Path::new("fitted.toml")));
        assert!(!is_json(Path::new("json")));
    }

    #[test]
    fn test_load_fit_config_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "tol = 0.01\nparallel = false").unwrap();
        let config = load_fit_config(file.path()).unwrap();
        assert_eq!(config.tol, 0.01);
        assert!(!config.parallel);
    }
}
