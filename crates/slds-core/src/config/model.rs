//! Model definition files.
//!
//! A model file describes a switching model as nested row vectors:
//!
//! ```toml
//! initial = [0.5, 0.5]
//! transition = [[0.95, 0.05], [0.05, 0.95]]
//!
//! [[regimes]]
//! a = [[0.9]]
//! q = [[0.01]]
//! c = [[1.0]]
//! r = [[0.1]]
//! x0 = [0.0]
//! p0 = [[1.0]]
//! ```

use std::path::Path;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use slds_common::{Error, Result};
use slds_math::{matrix_from_rows, matrix_to_rows};

use super::is_json;
use crate::inference::lds::RegimeModel;
use crate::inference::slds::SwitchingModel;

/// One regime's parameters as nested rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegimeSpec {
    pub a: Vec<Vec<f64>>,
    pub q: Vec<Vec<f64>>,
    pub c: Vec<Vec<f64>>,
    pub r: Vec<Vec<f64>>,
    pub x0: Vec<f64>,
    pub p0: Vec<Vec<f64>>,
}

/// Serializable switching model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelSpec {
    pub initial: Vec<f64>,
    pub transition: Vec<Vec<f64>>,
    pub regimes: Vec<RegimeSpec>,
}

fn rows_to_matrix(what: &str, regime: Option<usize>, rows: &[Vec<f64>]) -> Result<DMatrix<f64>> {
    matrix_from_rows(rows).ok_or_else(|| {
        let location = regime.map_or(String::new(), |k| format!(" of regime {k}"));
        Error::InvalidModel(format!("{what}{location} has rows of unequal length"))
    })
}

impl RegimeSpec {
    pub fn to_regime(&self, index: usize) -> Result<RegimeModel> {
        RegimeModel::new(
            rows_to_matrix("a", Some(index), &self.a)?,
            rows_to_matrix("q", Some(index), &self.q)?,
            rows_to_matrix("c", Some(index), &self.c)?,
            rows_to_matrix("r", Some(index), &self.r)?,
            DVector::from_column_slice(&self.x0),
            rows_to_matrix("p0", Some(index), &self.p0)?,
        )
    }

    pub fn from_regime(regime: &RegimeModel) -> Self {
        Self {
            a: matrix_to_rows(regime.transition()),
            q: matrix_to_rows(regime.process_noise()),
            c: matrix_to_rows(regime.observation_matrix()),
            r: matrix_to_rows(regime.observation_noise()),
            x0: regime.initial_mean().iter().copied().collect(),
            p0: matrix_to_rows(regime.initial_covariance()),
        }
    }
}

impl ModelSpec {
    /// Build a validated switching model.
    pub fn to_model(&self) -> Result<SwitchingModel> {
        if self.regimes.is_empty() {
            return Err(Error::InvalidModel("model needs at least one regime".into()));
        }
        let regimes = self
            .regimes
            .iter()
            .enumerate()
            .map(|(k, spec)| spec.to_regime(k))
            .collect::<Result<Vec<_>>>()?;
        SwitchingModel::new(
            DVector::from_column_slice(&self.initial),
            rows_to_matrix("transition", None, &self.transition)?,
            regimes,
        )
    }

    pub fn from_model(model: &SwitchingModel) -> Self {
        use crate::inference::chain::HiddenChain;
        Self {
            initial: model.initial_distribution().iter().copied().collect(),
            transition: matrix_to_rows(model.transition_matrix()),
            regimes: model.regimes().iter().map(RegimeSpec::from_regime).collect(),
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Toml(e.to_string()))
    }
}

/// Load a model definition; `.json` files are JSON, anything else TOML.
pub fn load_model_spec(path: &Path) -> Result<ModelSpec> {
    let text = std::fs::read_to_string(path)?;
    let spec = if is_json(path) {
        serde_json::from_str(&text)?
    } else {
        ModelSpec::from_toml_str(&text)?
    };
    tracing::debug!(path = %path.display(), "loaded model spec");
    Ok(spec)
}
