#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::similar_names,
    clippy::too_many_lines
)]

pub mod agent;
pub mod browser;
pub mod cache;
pub mod config;
pub mod coords;
pub mod error;
pub mod locator;
pub mod observability;
pub mod plan;
pub mod security;

pub use agent::{Orchestrator, OrchestratorState, RunOptions, RunStatus, StepExecution};
pub use config::Config;
pub use error::OrchestratorError;
pub use plan::{ActionKind, Plan, PlanStep};
