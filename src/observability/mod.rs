pub mod metrics;
pub mod traits;

pub use metrics::PrometheusObserver;
pub use traits::{LogEntry, LogLevel, Observer};

use crate::agent::orchestrator::{OrchestratorState, StepExecution};
use crate::plan::{Plan, PlanStep};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Discards everything.
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn name(&self) -> &str {
        "noop"
    }
}

/// Writes lifecycle events to `tracing`.
///
/// `on_log` is not forwarded: the orchestrator already emits those lines
/// through `tracing` itself.
pub struct LogObserver;

impl Observer for LogObserver {
    fn name(&self) -> &str {
        "log"
    }

    fn on_state_change(&self, state: &OrchestratorState) {
        tracing::info!(
            run_id = %state.run_id,
            status = %state.status,
            step = state.current_step_index,
            "Run state changed"
        );
    }

    fn on_step_start(&self, step: &PlanStep, index: usize) {
        tracing::info!(
            step = step.index,
            position = index,
            action = %step.action,
            target = %step.target_description,
            "Step started"
        );
    }

    fn on_step_complete(&self, execution: &StepExecution, _index: usize) {
        tracing::info!(
            step = execution.step.index,
            success = execution.success,
            retries = execution.retries,
            used_fallback = execution.used_fallback,
            used_cache = execution.used_cache,
            duration_ms = execution.duration_ms,
            "Step finished"
        );
    }

    fn on_plan_created(&self, plan: &Plan) {
        tracing::info!(goal = %plan.goal, steps = plan.steps.len(), "Plan received");
    }
}

/// Event forwarded by [`ChannelObserver`].
#[derive(Debug, Clone)]
pub enum ObserverEvent {
    StateChanged(Box<OrchestratorState>),
    Log(LogEntry),
    StepStarted { step: PlanStep, index: usize },
    StepCompleted { execution: Box<StepExecution>, index: usize },
    PlanCreated(Box<Plan>),
}

/// Forwards every callback into an unbounded tokio channel.
///
/// A dropped receiver is not an error; events are discarded.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<ObserverEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ObserverEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: ObserverEvent) {
        let _ = self.tx.send(event);
    }
}

impl Observer for ChannelObserver {
    fn name(&self) -> &str {
        "channel"
    }

    fn on_state_change(&self, state: &OrchestratorState) {
        self.send(ObserverEvent::StateChanged(Box::new(state.clone())));
    }

    fn on_log(&self, entry: &LogEntry) {
        self.send(ObserverEvent::Log(entry.clone()));
    }

    fn on_step_start(&self, step: &PlanStep, index: usize) {
        self.send(ObserverEvent::StepStarted {
            step: step.clone(),
            index,
        });
    }

    fn on_step_complete(&self, execution: &StepExecution, index: usize) {
        self.send(ObserverEvent::StepCompleted {
            execution: Box::new(execution.clone()),
            index,
        });
    }

    fn on_plan_created(&self, plan: &Plan) {
        self.send(ObserverEvent::PlanCreated(Box::new(plan.clone())));
    }
}

/// Fans every callback out to several observers, in order.
#[derive(Default)]
pub struct MultiObserver {
    observers: Vec<Arc<dyn Observer>>,
}

impl MultiObserver {
    pub fn new(observers: Vec<Arc<dyn Observer>>) -> Self {
        Self { observers }
    }

    #[must_use]
    pub fn with(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl Observer for MultiObserver {
    fn name(&self) -> &str {
        "multi"
    }

    fn on_state_change(&self, state: &OrchestratorState) {
        for o in &self.observers {
            o.on_state_change(state);
        }
    }

    fn on_log(&self, entry: &LogEntry) {
        for o in &self.observers {
            o.on_log(entry);
        }
    }

    fn on_step_start(&self, step: &PlanStep, index: usize) {
        for o in &self.observers {
            o.on_step_start(step, index);
        }
    }

    fn on_step_complete(&self, execution: &StepExecution, index: usize) {
        for o in &self.observers {
            o.on_step_complete(execution, index);
        }
    }

    fn on_plan_created(&self, plan: &Plan) {
        for o in &self.observers {
            o.on_plan_created(plan);
        }
    }
}
