pub mod loop_detector;
pub mod orchestrator;

pub use loop_detector::{ActionRecord, LoopDetector, LoopKind, LoopReport};
pub use orchestrator::{Orchestrator, OrchestratorState, RunOptions, RunStatus, StepExecution};
