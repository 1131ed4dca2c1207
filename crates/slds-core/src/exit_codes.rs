//! Exit codes for the `slds` CLI.
//!
//! Exit codes communicate the outcome without requiring output parsing.
//!
//! Exit code ranges:
//! - 0-1: Operational outcomes (a fit that exhausts its budget is not an error)
//! - 10-19: User errors (arguments, config, model files, I/O)
//! - 20-29: Inference failures and internal errors

use slds_common::Error;

use crate::inference::em::FitStatus;

/// Exit codes for `slds` operations.
///
/// These codes are a stable contract for automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Success: command completed, fit converged
    Ok = 0,

    /// Fit stopped at its iteration budget without converging
    MaxIterReached = 1,

    /// Invalid arguments
    ArgsError = 10,

    /// Invalid fit config, model definition or observations
    ConfigError = 11,

    /// File could not be read or written
    IoError = 12,

    /// A covariance lost positive definiteness
    NumericalInstability = 20,

    /// Every regime assigned zero likelihood somewhere
    DegenerateLikelihood = 21,

    /// Internal error (bug - please report)
    InternalError = 29,
}

impl ExitCode {
    /// Convert to i32 for process exit.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Whether the command did what was asked (codes 0-1).
    pub fn is_operational(self) -> bool {
        (self as i32) < 10
    }

    /// Whether the user can fix this by changing inputs (codes 10-19).
    pub fn is_user_error(self) -> bool {
        (10..20).contains(&(self as i32))
    }

    /// Stable name for JSON output.
    pub fn code_name(&self) -> &'static str {
        match self {
            ExitCode::Ok => "OK",
            ExitCode::MaxIterReached => "MAX_ITER_REACHED",
            ExitCode::ArgsError => "ARGS_ERROR",
            ExitCode::ConfigError => "CONFIG_ERROR",
            ExitCode::IoError => "IO_ERROR",
            ExitCode::NumericalInstability => "NUMERICAL_INSTABILITY",
            ExitCode::DegenerateLikelihood => "DEGENERATE_LIKELIHOOD",
            ExitCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl From<FitStatus> for ExitCode {
    fn from(status: FitStatus) -> Self {
        match status {
            FitStatus::Converged => ExitCode::Ok,
            FitStatus::MaxIterReached => ExitCode::MaxIterReached,
        }
    }
}

impl From<&Error> for ExitCode {
    fn from(err: &Error) -> Self {
        match err {
            Error::Config(_)
            | Error::InvalidModel(_)
            | Error::DimensionMismatch { .. }
            | Error::InvalidObservations(_)
            | Error::Toml(_)
            | Error::Json(_) => ExitCode::ConfigError,
            Error::Io(_) => ExitCode::IoError,
            Error::NumericalInstability(_) => ExitCode::NumericalInstability,
            Error::DegenerateLikelihood(_) => ExitCode::DegenerateLikelihood,
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> i32 {
        code as i32
    }
}
