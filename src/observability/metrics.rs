use super::traits::Observer;
use crate::agent::orchestrator::{OrchestratorState, StepExecution};
use anyhow::Context;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Prometheus counters for runs, steps and verification patterns.
///
/// Aborted runs are counted under `status="aborted"` and never as failures.
pub struct PrometheusObserver {
    registry: Registry,
    runs_total: IntCounterVec,
    steps_total: IntCounterVec,
    verification_patterns_total: IntCounterVec,
    step_retries_total: IntCounter,
}

impl PrometheusObserver {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_registry(Registry::new())
    }

    /// Register the counters on an existing registry.
    pub fn with_registry(registry: Registry) -> anyhow::Result<Self> {
        let runs_total = IntCounterVec::new(
            Opts::new("browser_pilot_runs_total", "Plan runs by terminal status"),
            &["status"],
        )?;
        let steps_total = IntCounterVec::new(
            Opts::new("browser_pilot_steps_total", "Executed plan steps by outcome"),
            &["outcome"],
        )?;
        let verification_patterns_total = IntCounterVec::new(
            Opts::new(
                "browser_pilot_verification_patterns_total",
                "Triple verification outcomes by pattern",
            ),
            &["pattern"],
        )?;
        let step_retries_total = IntCounter::new(
            "browser_pilot_step_retries_total",
            "Retry attempts spent across all steps",
        )?;

        registry
            .register(Box::new(runs_total.clone()))
            .context("register runs_total")?;
        registry
            .register(Box::new(steps_total.clone()))
            .context("register steps_total")?;
        registry
            .register(Box::new(verification_patterns_total.clone()))
            .context("register verification_patterns_total")?;
        registry
            .register(Box::new(step_retries_total.clone()))
            .context("register step_retries_total")?;

        Ok(Self {
            registry,
            runs_total,
            steps_total,
            verification_patterns_total,
            step_retries_total,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all counters in the Prometheus text format.
    pub fn encode(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .context("failed to encode prometheus metrics")?;
        String::from_utf8(buffer).context("metrics are not valid UTF-8")
    }
}

impl Observer for PrometheusObserver {
    fn name(&self) -> &str {
        "prometheus"
    }

    fn on_state_change(&self, state: &OrchestratorState) {
        if state.status.is_terminal() {
            self.runs_total
                .with_label_values(&[state.status.as_str()])
                .inc();
        }
    }

    fn on_step_complete(&self, execution: &StepExecution, _index: usize) {
        let outcome = match (execution.success, execution.used_cache) {
            (true, true) => "cached",
            (true, false) => "success",
            (false, _) => "failure",
        };
        self.steps_total.with_label_values(&[outcome]).inc();
        self.step_retries_total.inc_by(u64::from(execution.retries));
        for pattern in &execution.patterns {
            self.verification_patterns_total
                .with_label_values(&[pattern.as_str()])
                .inc();
        }
    }
}
