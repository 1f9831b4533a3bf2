//! Error types for plan execution

use crate::agent::loop_detector::LoopReport;
use crate::plan::ActionKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a run did not complete.
///
/// Carried on the final `OrchestratorState` rather than returned as `Err`.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrchestratorError {
    #[error("Connectivity error: {message}")]
    Connectivity { message: String },

    #[error("Step {index} ({action}) failed: {last_error}")]
    StepFailed {
        index: u32,
        action: ActionKind,
        last_error: String,
    },

    #[error("Loop detected before step {index}: {}", report.suggestion)]
    LoopDetected { index: u32, report: Box<LoopReport> },

    #[error("Step {index} exceeds the maximum of {max_steps} steps")]
    MaxStepsExceeded { index: u32, max_steps: usize },

    #[error("Invalid plan: {message}")]
    InvalidPlan { message: String },

    #[error("Policy violation at step {index}: {message}")]
    PolicyViolation { index: u32, message: String },

    #[error("Run aborted")]
    Aborted,
}

impl OrchestratorError {
    pub fn connectivity(message: impl Into<String>) -> Self {
        Self::Connectivity {
            message: message.into(),
        }
    }

    /// Aborts are cancellations, everything else counts as a failure.
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Aborted)
    }

    /// Whether another attempt of the same step may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connectivity { .. })
    }

    /// Index of the step the error is attributed to, if any.
    pub fn step_index(&self) -> Option<u32> {
        match self {
            Self::StepFailed { index, .. }
            | Self::LoopDetected { index, .. }
            | Self::MaxStepsExceeded { index, .. }
            | Self::PolicyViolation { index, .. } => Some(*index),
            Self::Connectivity { .. } | Self::InvalidPlan { .. } | Self::Aborted => None,
        }
    }
}

impl From<anyhow::Error> for OrchestratorError {
    fn from(e: anyhow::Error) -> Self {
        Self::connectivity(format!("{e:#}"))
    }
}
