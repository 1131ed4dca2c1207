//! Structured event definitions for logging.
//!
//! Every event carries the run id and the stage it was emitted from, so a
//! JSONL log of one `slds` invocation can be filtered per fit phase.

use serde::{Deserialize, Serialize};

/// Phases of an `slds` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Startup, config and model loading.
    Init,
    /// Sampling from a model.
    Simulate,
    /// Variational E-step (inner loop).
    EStep,
    /// Parameter re-estimation.
    MStep,
    /// Outer EM loop.
    Fit,
    /// Writing command payloads.
    Output,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Init => "init",
            Stage::Simulate => "simulate",
            Stage::EStep => "e_step",
            Stage::MStep => "m_step",
            Stage::Fit => "fit",
            Stage::Output => "output",
        };
        write!(f, "{}", s)
    }
}

/// Standard event names used in logging.
pub mod event_names {
    // Fit lifecycle
    pub const FIT_STARTED: &str = "fit.started";
    pub const FIT_ITERATION: &str = "fit.iteration";
    pub const FIT_CONVERGED: &str = "fit.converged";
    pub const FIT_MAX_ITER_REACHED: &str = "fit.max_iter_reached";

    // E-step
    pub const E_STEP_ITERATION: &str = "e_step.iteration";
    pub const E_STEP_FINISHED: &str = "e_step.finished";
    pub const E_STEP_BUDGET_EXHAUSTED: &str = "e_step.budget_exhausted";

    // M-step
    pub const M_STEP_FINISHED: &str = "m_step.finished";

    // Simulation
    pub const SIMULATE_FINISHED: &str = "simulate.finished";

    // Config/init events
    pub const CONFIG_LOADED: &str = "config.loaded";
    pub const CONFIG_DEFAULT_USED: &str = "config.default_used";
    pub const MODEL_LOADED: &str = "model.loaded";
    pub const OBSERVATIONS_LOADED: &str = "observations.loaded";

    // Errors
    pub const COMMAND_FAILED: &str = "command.failed";
}

/// Correlation fields shared by every event of one invocation.
#[derive(Debug, Clone)]
pub struct LogContext {
    /// Unique ID for this invocation.
    pub run_id: String,
    /// Model file the invocation works on, when there is one.
    pub model: Option<String>,
}

impl LogContext {
    pub fn new(run_id: impl Into<String>) -> Self {
        LogContext {
            run_id: run_id.into(),
            model: None,
        }
    }

    /// Attach the model source.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_context() {
        let ctx = LogContext::new("run-abc").with_model("model.toml");
        assert_eq!(ctx.run_id, "run-abc");
        assert_eq!(ctx.model.as_deref(), Some("model.toml"));
    }

    #[test]
    fn test_stage_display_matches_serde() {
        for stage in [
            Stage::Init,
            Stage::Simulate,
            Stage::EStep,
            Stage::MStep,
            Stage::Fit,
            Stage::Output,
        ] {
            let json = serde_json::to_string(&stage).unwrap();
            assert_eq!(json, format!("\"{}\"", stage));
        }
    }

    #[test]
    fn test_event_names() {
        assert_eq!(event_names::FIT_CONVERGED, "fit.converged");
        assert_eq!(event_names::E_STEP_ITERATION, "e_step.iteration");
        assert_eq!(event_names::M_STEP_FINISHED, "m_step.finished");
    }
}
