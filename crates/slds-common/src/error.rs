//! Error types for switching state-space inference.
//!
//! This module provides structured error handling with:
//! - Stable error codes for machine parsing
//! - Category classification for error grouping
//! - Recoverability hints for automation
//! - Remediation suggestions for humans
//!
//! # Agent-Facing Output
//!
//! Errors serialize to structured JSON:
//! ```json
//! {
//!   "code": 31,
//!   "category": "inference",
//!   "message": "numerical instability detected: observation noise covariance of regime 1 is not positive definite",
//!   "recoverable": false,
//!   "context": { "regime": 1 }
//! }
//! ```
//!
//! Non-convergence is deliberately absent from this taxonomy: an exhausted
//! iteration budget is a normal outcome reported through fit status, not an
//! error.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Result type alias for slds operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Configuration and model-definition errors.
    Config,
    /// Observation data errors.
    Data,
    /// Numerical failures during inference or estimation.
    Inference,
    /// File I/O and serialization errors.
    Io,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Config => write!(f, "config"),
            ErrorCategory::Data => write!(f, "data"),
            ErrorCategory::Inference => write!(f, "inference"),
            ErrorCategory::Io => write!(f, "io"),
        }
    }
}

/// Unified error type.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors (10-19)
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid model: {0}")]
    InvalidModel(String),

    #[error("dimension mismatch for {what}: expected {expected}, got {got}")]
    DimensionMismatch {
        what: String,
        expected: usize,
        got: usize,
    },

    // Data errors (20-29)
    #[error("invalid observations: {0}")]
    InvalidObservations(String),

    // Inference errors (30-39)
    #[error("numerical instability detected: {0}")]
    NumericalInstability(String),

    #[error("degenerate likelihood: {0}")]
    DegenerateLikelihood(String),

    // I/O errors (60-69)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(String),
}

impl Error {
    /// Returns the error code for this error type.
    ///
    /// Error codes are stable and grouped by category:
    /// - 10-19: Configuration errors
    /// - 20-29: Data errors
    /// - 30-39: Inference errors
    /// - 60-69: I/O errors
    pub fn code(&self) -> u32 {
        match self {
            Error::Config(_) => 10,
            Error::InvalidModel(_) => 11,
            Error::DimensionMismatch { .. } => 12,
            Error::InvalidObservations(_) => 20,
            Error::NumericalInstability(_) => 31,
            Error::DegenerateLikelihood(_) => 32,
            Error::Io(_) => 60,
            Error::Json(_) => 61,
            Error::Toml(_) => 62,
        }
    }

    /// Returns the error category for grouping and filtering.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_) | Error::InvalidModel(_) | Error::DimensionMismatch { .. } => {
                ErrorCategory::Config
            }
            Error::InvalidObservations(_) => ErrorCategory::Data,
            Error::NumericalInstability(_) | Error::DegenerateLikelihood(_) => {
                ErrorCategory::Inference
            }
            Error::Io(_) | Error::Json(_) | Error::Toml(_) => ErrorCategory::Io,
        }
    }

    /// Returns whether this error is potentially recoverable.
    ///
    /// Numerical failures abort a fit and are never retried internally; they
    /// are recoverable only by changing the model or data.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Config(_) | Error::InvalidModel(_) | Error::DimensionMismatch { .. } => true,
            Error::InvalidObservations(_) => true,
            Error::NumericalInstability(_) | Error::DegenerateLikelihood(_) => false,
            Error::Io(_) => true,
            Error::Json(_) | Error::Toml(_) => true,
        }
    }

    /// Returns a human-readable remediation hint.
    pub fn remediation(&self) -> &'static str {
        match self {
            Error::Config(_) => "Check the fit configuration file against 'slds check'.",
            Error::InvalidModel(_) => {
                "Check that transition rows and the initial distribution are non-negative and sum to 1."
            }
            Error::DimensionMismatch { .. } => {
                "Check matrix shapes against each regime's state dimension and the shared observation dimension."
            }
            Error::InvalidObservations(_) => {
                "Observations must be a non-empty list of finite rows of the model's observation dimension."
            }
            Error::NumericalInstability(_) => {
                "A covariance lost positive definiteness. Rescale the data or start from a better-conditioned model."
            }
            Error::DegenerateLikelihood(_) => {
                "Every regime assigns zero likelihood somewhere. Check the initial model against the data."
            }
            Error::Io(_) => "Check that the path exists and is readable.",
            Error::Json(_) => "Invalid JSON. Check syntax with 'jq .'.",
            Error::Toml(_) => "Invalid TOML. Check key names and value types.",
        }
    }

    /// Returns a short headline for human-readable output.
    pub fn headline(&self) -> &'static str {
        match self {
            Error::Config(_) => "Configuration Error",
            Error::InvalidModel(_) => "Invalid Model",
            Error::DimensionMismatch { .. } => "Dimension Mismatch",
            Error::InvalidObservations(_) => "Invalid Observations",
            Error::NumericalInstability(_) => "Numerical Instability",
            Error::DegenerateLikelihood(_) => "Degenerate Likelihood",
            Error::Io(_) => "I/O Error",
            Error::Json(_) => "JSON Parse Error",
            Error::Toml(_) => "TOML Parse Error",
        }
    }

    /// Shorthand for a dimension mismatch.
    pub fn dimension(what: impl Into<String>, expected: usize, got: usize) -> Self {
        Error::DimensionMismatch {
            what: what.into(),
            expected,
            got,
        }
    }
}

/// Structured error response for JSON output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredError {
    /// Stable error code.
    pub code: u32,

    /// Error category for grouping.
    pub category: ErrorCategory,

    /// Human-readable error message.
    pub message: String,

    /// Whether the error is potentially recoverable.
    pub recoverable: bool,

    /// Remediation hint.
    pub remediation: String,

    /// Additional structured context.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
}

impl From<&Error> for StructuredError {
    fn from(err: &Error) -> Self {
        let mut context = HashMap::new();

        if let Error::DimensionMismatch {
            what,
            expected,
            got,
        } = err
        {
            context.insert("what".to_string(), serde_json::json!(what));
            context.insert("expected".to_string(), serde_json::json!(expected));
            context.insert("got".to_string(), serde_json::json!(got));
        }

        StructuredError {
            code: err.code(),
            category: err.category(),
            message: err.to_string(),
            recoverable: err.is_recoverable(),
            remediation: err.remediation().to_string(),
            context,
        }
    }
}

impl StructuredError {
    /// Add additional context to the error.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"code":{},"error":"serialization_failed"}}"#, self.code)
        })
    }
}
