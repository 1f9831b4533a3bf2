use crate::agent::orchestrator::{OrchestratorState, StepExecution};
use crate::plan::{Plan, PlanStep};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        })
    }
}

/// A log line mirrored to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            data: None,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Lifecycle callbacks a caller can subscribe to.
///
/// Callbacks run inline on the orchestrator task and must not block.
pub trait Observer: Send + Sync {
    /// Human-readable observer name
    fn name(&self) -> &str;

    fn on_state_change(&self, _state: &OrchestratorState) {}

    fn on_log(&self, _entry: &LogEntry) {}

    fn on_step_start(&self, _step: &PlanStep, _index: usize) {}

    fn on_step_complete(&self, _execution: &StepExecution, _index: usize) {}

    fn on_plan_created(&self, _plan: &Plan) {}
}
