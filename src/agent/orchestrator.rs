//! Plan execution state machine.
//!
//! `idle → initializing → executing → {completed | failed | aborted | loop_detected}`
//!
//! Steps run strictly in order. Spatial steps (click, type, scroll,
//! keypress) go through triple verification before anything is clicked;
//! navigate and wait steps are applied directly. The first step that runs
//! out of attempts fails the whole run.

use super::loop_detector::{ActionRecord, LoopDetector};
use crate::browser::{
    normalize_key_combo, ActionOutcome, BrowserAction, BrowserToolClient, HttpBrowserClient,
    ScrollDirection, Screenshot,
};
use crate::cache::ActionCache;
use crate::config::{Config, OrchestratorConfig};
use crate::coords::{Coordinate, Space, ViewportPoint};
use crate::error::OrchestratorError;
use crate::locator::{
    CoordinateResolver, HttpVisionLocator, LocatorSource, ResolveRequest, VerificationOutcome,
    VerificationPattern, VisionLocator,
};
use crate::observability::{LogEntry, LogLevel, NoopObserver, Observer};
use crate::plan::{ActionKind, Plan, PlanStep};
use crate::security::ActionPolicy;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Longest pause a wait step may request.
const MAX_WAIT: Duration = Duration::from_secs(60);
const DEFAULT_SCROLL_AMOUNT: u32 = 500;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Initializing,
    Executing,
    Completed,
    Failed,
    Aborted,
    LoopDetected,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
            Self::LoopDetected => "loop_detected",
        }
    }

    /// Terminal states are final for the run.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Aborted | Self::LoopDetected
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened while executing one step. One per attempted step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub step: PlanStep,
    /// Last verification outcome; `None` for direct and cached steps.
    pub verification: Option<VerificationOutcome>,
    /// Pattern of every verification attempted, refused ones included.
    #[serde(default)]
    pub patterns: Vec<VerificationPattern>,
    pub action_result: Option<ActionOutcome>,
    pub success: bool,
    /// Attempts beyond the first.
    pub retries: u32,
    pub used_fallback: bool,
    pub used_cache: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl StepExecution {
    pub fn new(step: PlanStep) -> Self {
        Self {
            step,
            verification: None,
            patterns: Vec::new(),
            action_result: None,
            success: false,
            retries: 0,
            used_fallback: false,
            used_cache: false,
            duration_ms: 0,
            error: None,
        }
    }
}

/// State of one `execute_plan` call, returned when it settles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorState {
    pub run_id: String,
    pub goal: String,
    pub session_id: Option<String>,
    pub current_url: Option<String>,
    pub plan: Plan,
    /// Position of the current step within `plan.steps`.
    pub current_step_index: usize,
    pub executed_steps: Vec<StepExecution>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Rendered failure text. Stays `None` for aborted runs.
    pub error: Option<String>,
    pub failure: Option<OrchestratorError>,
}

impl OrchestratorState {
    pub fn new(plan: Plan) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            goal: plan.goal.clone(),
            session_id: None,
            current_url: None,
            plan,
            current_step_index: 0,
            executed_steps: Vec::new(),
            status: RunStatus::Idle,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            failure: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// How a run obtains its browser session.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Continue an existing remote session.
    pub session_id: Option<String>,
    /// Open this page, in a new session or the reused one.
    pub start_url: Option<String>,
}

impl RunOptions {
    pub fn with_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            start_url: None,
        }
    }

    pub fn with_start_url(start_url: impl Into<String>) -> Self {
        Self {
            session_id: None,
            start_url: Some(start_url.into()),
        }
    }
}

pub struct Orchestrator {
    browser: Arc<dyn BrowserToolClient>,
    resolver: CoordinateResolver,
    cache: Arc<ActionCache>,
    loop_detector: LoopDetector,
    observer: Arc<dyn Observer>,
    policy: Arc<ActionPolicy>,
    config: OrchestratorConfig,
    max_image_bytes: usize,
    cancel: CancellationToken,
    session_id: Option<String>,
}

impl Orchestrator {
    pub fn new(
        browser: Arc<dyn BrowserToolClient>,
        resolver: CoordinateResolver,
        config: &Config,
    ) -> Self {
        Self {
            browser,
            resolver,
            cache: Arc::new(ActionCache::new(&config.cache)),
            loop_detector: LoopDetector::new(&config.loop_detector),
            observer: Arc::new(NoopObserver),
            policy: Arc::new(ActionPolicy::from_config(&config.policy)),
            config: config.orchestrator.clone(),
            max_image_bytes: config.resolver.max_image_bytes,
            cancel: CancellationToken::new(),
            session_id: None,
        }
    }

    /// Wire up the HTTP browser client and whichever vision services are configured.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let browser: Arc<dyn BrowserToolClient> = Arc::new(
            HttpBrowserClient::new(&config.browser).context("Failed to build browser client")?,
        );
        let timeout = Duration::from_millis(config.resolver.vision_timeout_ms);
        let vision_a = HttpVisionLocator::from_config(LocatorSource::VisionA, &config.vision_a, timeout)?
            .map(|l| Arc::new(l) as Arc<dyn VisionLocator>);
        let vision_b = HttpVisionLocator::from_config(LocatorSource::VisionB, &config.vision_b, timeout)?
            .map(|l| Arc::new(l) as Arc<dyn VisionLocator>);
        if vision_a.is_none() && vision_b.is_none() {
            tracing::warn!("No vision service configured; spatial steps will never verify");
        }

        let resolver = CoordinateResolver::new(
            Arc::clone(&browser),
            vision_a,
            vision_b,
            config.resolver.clone(),
        );
        Ok(Self::new(browser, resolver, config))
    }

    /// Share an action cache across orchestrators.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<ActionCache>) -> Self {
        self.cache = cache;
        self
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: Arc<ActionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Continue an existing remote session on the next run.
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn cache(&self) -> &Arc<ActionCache> {
        &self.cache
    }

    /// Stop the remote session and forget it.
    pub async fn reset_session(&mut self) -> anyhow::Result<()> {
        if let Some(id) = self.session_id.take() {
            self.browser
                .stop_session(&id)
                .await
                .with_context(|| format!("Failed to stop session {id}"))?;
            self.log(
                LogLevel::Info,
                "Browser session closed",
                Some(json!({ "session_id": id })),
            );
        }
        Ok(())
    }

    /// Request cooperative cancellation of the current run.
    ///
    /// The token stays cancelled; later runs settle as aborted until a
    /// fresh token is installed with [`Self::with_cancellation_token`].
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether the browser automation service answers its health probe.
    pub async fn health_check(&self) -> bool {
        self.browser.health_check().await
    }

    pub async fn execute_plan(&mut self, plan: Plan, options: RunOptions) -> OrchestratorState {
        let mut state = OrchestratorState::new(plan);
        self.loop_detector.reset();
        self.observer.on_plan_created(&state.plan);
        self.log(
            LogLevel::Info,
            format!("Executing plan: {}", state.goal),
            Some(json!({ "run_id": state.run_id, "steps": state.plan.steps.len() })),
        );

        if let Err(e) = state.plan.validate() {
            self.settle(
                &mut state,
                OrchestratorError::InvalidPlan {
                    message: e.to_string(),
                },
            );
            return state;
        }

        self.transition(&mut state, RunStatus::Initializing);
        if let Err(failure) = self.initialize(&mut state, &options).await {
            self.settle(&mut state, failure);
            return state;
        }

        self.transition(&mut state, RunStatus::Executing);
        let steps = state.plan.steps.clone();
        for (position, step) in steps.iter().enumerate() {
            state.current_step_index = position;
            if let Err(failure) = self.check_before_step(step, position) {
                self.settle(&mut state, failure);
                return state;
            }

            self.observer.on_step_start(step, position);
            self.log(
                LogLevel::Info,
                format!("Step {}: {} '{}'", step.index, step.action, step.target_description),
                Some(json!({ "step": step.index, "position": position })),
            );

            let started = Instant::now();
            let mut execution = StepExecution::new(step.clone());
            let result = match step.action {
                ActionKind::Navigate => self.run_navigate(step, &mut state, &mut execution).await,
                ActionKind::Wait => self.run_wait(step, &mut execution).await,
                ActionKind::Click | ActionKind::Type | ActionKind::Scroll | ActionKind::Keypress => {
                    self.run_spatial(step, &mut state, &mut execution).await
                }
            };
            execution.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            execution.success = result.is_ok();
            if let Err(failure) = &result {
                execution.error = Some(failure.to_string());
            }

            self.observer.on_step_complete(&execution, position);
            state.executed_steps.push(execution);

            match result {
                Ok(()) => {
                    self.log(
                        LogLevel::Info,
                        format!("Step {} completed", step.index),
                        Some(json!({ "step": step.index })),
                    );
                    self.observer.on_state_change(&state);
                }
                Err(failure) => {
                    self.settle(&mut state, failure);
                    return state;
                }
            }
        }

        self.transition(&mut state, RunStatus::Completed);
        self.log(
            LogLevel::Info,
            format!("Plan completed in {} steps", state.executed_steps.len()),
            None,
        );
        state
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    async fn initialize(
        &mut self,
        state: &mut OrchestratorState,
        options: &RunOptions,
    ) -> Result<(), OrchestratorError> {
        if self.cancel.is_cancelled() {
            return Err(OrchestratorError::Aborted);
        }
        let start_url = options
            .start_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty());
        if let Some(reason) = start_url.and_then(|url| self.policy.check_url(url)) {
            return Err(OrchestratorError::PolicyViolation {
                index: 0,
                message: reason,
            });
        }

        match options.session_id.clone().or_else(|| self.session_id.clone()) {
            Some(id) => {
                self.session_id = Some(id.clone());
                state.session_id = Some(id.clone());
                self.log(
                    LogLevel::Info,
                    "Reusing browser session",
                    Some(json!({ "session_id": id })),
                );
                if let Some(url) = start_url {
                    let action = BrowserAction::Navigate { url: url.to_string() };
                    let outcome = self.apply(&id, &action, 0).await?;
                    if !outcome.success {
                        return Err(OrchestratorError::connectivity(format!(
                            "Failed to open {url}: {}",
                            outcome.error.unwrap_or_default()
                        )));
                    }
                    state.current_url = outcome.url.or_else(|| Some(url.to_string()));
                }
            }
            None => {
                let started = tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => return Err(OrchestratorError::Aborted),
                    result = self.browser.start_session(start_url) => result,
                };
                let info = started.map_err(|e| {
                    OrchestratorError::connectivity(format!("Failed to start browser session: {e:#}"))
                })?;
                self.log(
                    LogLevel::Info,
                    "Browser session started",
                    Some(json!({ "session_id": info.session_id, "backend": self.browser.name() })),
                );
                self.session_id = Some(info.session_id.clone());
                state.session_id = Some(info.session_id);
                state.current_url = info.url.or_else(|| start_url.map(str::to_string));
            }
        }
        Ok(())
    }

    fn check_before_step(&self, step: &PlanStep, position: usize) -> Result<(), OrchestratorError> {
        if self.cancel.is_cancelled() {
            return Err(OrchestratorError::Aborted);
        }
        let report = self.loop_detector.detect_loop();
        if report.is_loop {
            return Err(OrchestratorError::LoopDetected {
                index: step.index,
                report: Box::new(report),
            });
        }
        if position >= self.config.max_steps {
            return Err(OrchestratorError::MaxStepsExceeded {
                index: step.index,
                max_steps: self.config.max_steps,
            });
        }
        if step.action != ActionKind::Wait && self.policy.is_rate_limited() {
            return Err(OrchestratorError::PolicyViolation {
                index: step.index,
                message: format!(
                    "Hourly action budget of {} exhausted",
                    self.policy.max_actions_per_hour
                ),
            });
        }
        Ok(())
    }

    fn transition(&self, state: &mut OrchestratorState, status: RunStatus) {
        if state.status.is_terminal() {
            return;
        }
        state.status = status;
        if status.is_terminal() {
            state.completed_at = Some(Utc::now());
        }
        self.observer.on_state_change(state);
    }

    /// Move to the terminal state matching `failure`. No-op once terminal.
    fn settle(&self, state: &mut OrchestratorState, failure: OrchestratorError) {
        if state.status.is_terminal() {
            return;
        }
        let status = match &failure {
            OrchestratorError::Aborted => RunStatus::Aborted,
            OrchestratorError::LoopDetected { .. } => RunStatus::LoopDetected,
            _ => RunStatus::Failed,
        };
        if failure.is_failure() {
            self.log(
                LogLevel::Error,
                failure.to_string(),
                Some(json!({ "step": failure.step_index(), "status": status.as_str() })),
            );
            state.error = Some(failure.to_string());
        } else {
            self.log(LogLevel::Info, "Run aborted", None);
        }
        state.failure = Some(failure);
        self.transition(state, status);
    }

    // ── Direct steps ────────────────────────────────────────────────

    async fn run_navigate(
        &mut self,
        step: &PlanStep,
        state: &mut OrchestratorState,
        execution: &mut StepExecution,
    ) -> Result<(), OrchestratorError> {
        let Some(url) = step.navigation_url().map(str::to_string) else {
            return Err(OrchestratorError::InvalidPlan {
                message: format!("Step {} is a navigate action without a URL", step.index),
            });
        };
        if let Some(reason) = self.policy.check_url(&url) {
            return Err(OrchestratorError::PolicyViolation {
                index: step.index,
                message: reason,
            });
        }
        let session = active_session(state)?;
        let action = BrowserAction::Navigate { url: url.clone() };

        let mut last_error = String::from("no attempt made");
        for attempt in 0..self.config.max_retries {
            if attempt > 0 {
                execution.retries = attempt;
                if !self.pause(self.config.retry_delay_ms).await {
                    return Err(OrchestratorError::Aborted);
                }
            }
            match self.apply(&session, &action, step.index).await {
                Ok(outcome) if outcome.success => {
                    state.current_url = outcome.url.clone().or_else(|| Some(url.clone()));
                    execution.action_result = Some(outcome);
                    self.pause(self.config.settle_delay_ms).await;
                    return Ok(());
                }
                Ok(outcome) => {
                    last_error = outcome
                        .error
                        .clone()
                        .unwrap_or_else(|| format!("navigation to {url} was refused"));
                    execution.action_result = Some(outcome);
                }
                Err(e) if e.is_retryable() => last_error = e.to_string(),
                Err(e) => return Err(e),
            }
            self.log(
                LogLevel::Warn,
                format!("Step {} attempt {attempt} failed: {last_error}", step.index),
                Some(json!({ "step": step.index, "attempt": attempt })),
            );
        }

        Err(OrchestratorError::StepFailed {
            index: step.index,
            action: step.action,
            last_error,
        })
    }

    async fn run_wait(
        &self,
        step: &PlanStep,
        execution: &mut StepExecution,
    ) -> Result<(), OrchestratorError> {
        let duration = wait_duration(
            step.input_value.as_deref(),
            Duration::from_millis(self.config.default_wait_ms),
        );
        self.log(
            LogLevel::Debug,
            format!("Waiting {}ms", duration.as_millis()),
            Some(json!({ "step": step.index })),
        );
        if !self.pause_for(duration).await {
            return Err(OrchestratorError::Aborted);
        }
        execution.action_result = Some(ActionOutcome::ok(None));
        Ok(())
    }

    // ── Spatial steps ───────────────────────────────────────────────

    async fn run_spatial(
        &mut self,
        step: &PlanStep,
        state: &mut OrchestratorState,
        execution: &mut StepExecution,
    ) -> Result<(), OrchestratorError> {
        let session = active_session(state)?;
        let mut last_error = String::from("no attempt made");

        for attempt in 0..self.config.max_retries {
            if attempt > 0 {
                let report = self.loop_detector.detect_loop();
                if report.is_loop {
                    return Err(OrchestratorError::LoopDetected {
                        index: step.index,
                        report: Box::new(report),
                    });
                }
                if !self.pause(self.config.retry_delay_ms).await {
                    return Err(OrchestratorError::Aborted);
                }
            }
            if self.cancel.is_cancelled() {
                return Err(OrchestratorError::Aborted);
            }

            let (target, used_fallback) = step.description_for_attempt(attempt);
            let target = target.to_string();
            execution.retries = attempt;
            execution.used_fallback = used_fallback;
            execution.used_cache = false;

            if attempt == 0 && self.config.use_cache {
                let cached = state
                    .current_url
                    .as_deref()
                    .and_then(|url| self.cache.get(url, &target));
                if let Some(hit) = cached {
                    execution.used_cache = true;
                    self.log(
                        LogLevel::Debug,
                        format!("Using cached coordinate {} for '{target}'", hit.coordinate),
                        Some(json!({ "step": step.index, "successes": hit.success_count })),
                    );
                    match self
                        .act_at(step, &session, hit.coordinate, &target, state, execution)
                        .await?
                    {
                        Ok(()) => return Ok(()),
                        Err(e) => {
                            // A stale entry costs no attempt: verify the same target below.
                            execution.used_cache = false;
                            self.log(
                                LogLevel::Warn,
                                format!("Cached coordinate for '{target}' failed: {e}"),
                                Some(json!({ "step": step.index, "attempt": attempt })),
                            );
                        }
                    }
                }
            }

            let screenshot = match self.capture(&session).await {
                Ok(shot) => shot,
                Err(e) if e.is_retryable() => {
                    last_error = e.to_string();
                    self.record_attempt(step, &target, None, false, state);
                    self.log_attempt_failure(step, attempt, &last_error);
                    continue;
                }
                Err(e) => return Err(e),
            };
            if self.cancel.is_cancelled() {
                return Err(OrchestratorError::Aborted);
            }

            let request = ResolveRequest {
                screenshot: &screenshot,
                target: &target,
                selector: None,
                context: Some(state.goal.as_str()),
            };
            let verification = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(OrchestratorError::Aborted),
                outcome = self.resolver.resolve(&session, request) => outcome,
            };
            self.log(
                LogLevel::Debug,
                format!(
                    "Verification for '{target}': {} (confidence {:.2})",
                    verification.pattern, verification.confidence
                ),
                Some(json!({
                    "step": step.index,
                    "attempt": attempt,
                    "pattern": verification.pattern,
                    "proceed": verification.proceed,
                })),
            );

            let resolved = verification.coordinate.filter(|_| verification.proceed);
            let refusal = format!(
                "Verification refused to act on '{target}' ({}){}",
                verification.pattern,
                verification
                    .warning
                    .as_deref()
                    .map(|w| format!(": {w}"))
                    .unwrap_or_default()
            );
            execution.patterns.push(verification.pattern);
            execution.verification = Some(verification);

            let Some(at) = resolved else {
                last_error = refusal;
                self.record_attempt(step, &target, None, false, state);
                self.log_attempt_failure(step, attempt, &last_error);
                continue;
            };

            match self
                .act_at(step, &session, at, &target, state, execution)
                .await?
            {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_error = e;
                    self.log_attempt_failure(step, attempt, &last_error);
                }
            }
        }

        Err(OrchestratorError::StepFailed {
            index: step.index,
            action: step.action,
            last_error,
        })
    }

    /// Apply the step's action at `at` (viewport space).
    ///
    /// The outer error is fatal for the run; the inner one is a failed
    /// attempt that may be retried.
    async fn act_at(
        &mut self,
        step: &PlanStep,
        session: &str,
        at: Coordinate,
        target: &str,
        state: &mut OrchestratorState,
        execution: &mut StepExecution,
    ) -> Result<Result<(), String>, OrchestratorError> {
        let action = build_action(step, at)?;
        let point = (at.space == Space::Viewport).then(|| ViewportPoint::new(at.x, at.y));
        let page = state.current_url.clone();

        let outcome = match self.apply(session, &action, step.index).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_retryable() => {
                self.record_attempt(step, target, point, false, state);
                return Ok(Err(e.to_string()));
            }
            Err(e) => return Err(e),
        };

        let success = outcome.success;
        self.record_attempt(step, target, point, success, state);
        if let Some(page) = page.as_deref() {
            if success {
                self.cache.record_success(page, target, at);
            } else {
                self.cache.record_failure(page, target);
            }
        }

        let error = outcome.error.clone();
        if let Some(url) = &outcome.url {
            state.current_url = Some(url.clone());
        }
        execution.action_result = Some(outcome);

        if success {
            self.pause(self.config.settle_delay_ms).await;
            Ok(Ok(()))
        } else {
            Ok(Err(error.unwrap_or_else(|| {
                format!("{} at {at} was refused", action.name())
            })))
        }
    }

    fn record_attempt(
        &mut self,
        step: &PlanStep,
        target: &str,
        point: Option<ViewportPoint>,
        success: bool,
        state: &OrchestratorState,
    ) {
        self.loop_detector.record(
            ActionRecord::new(step.action, target, point, success)
                .with_url(state.current_url.clone()),
        );
    }

    fn log_attempt_failure(&self, step: &PlanStep, attempt: u32, error: &str) {
        self.log(
            LogLevel::Warn,
            format!("Step {} attempt {attempt} failed: {error}", step.index),
            Some(json!({ "step": step.index, "attempt": attempt })),
        );
    }

    // ── Remote calls ────────────────────────────────────────────────

    async fn capture(&self, session: &str) -> Result<Screenshot, OrchestratorError> {
        let result = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(OrchestratorError::Aborted),
            result = self.browser.screenshot(session) => result,
        };
        let shot = result
            .map_err(|e| OrchestratorError::connectivity(format!("Screenshot failed: {e:#}")))?;
        let size = shot
            .decoded_len()
            .map_err(|e| OrchestratorError::connectivity(format!("{e:#}")))?;
        if size > self.max_image_bytes {
            return Err(OrchestratorError::connectivity(format!(
                "Screenshot is {size} bytes, above the {} byte limit",
                self.max_image_bytes
            )));
        }
        Ok(shot)
    }

    async fn apply(
        &self,
        session: &str,
        action: &BrowserAction,
        index: u32,
    ) -> Result<ActionOutcome, OrchestratorError> {
        if self.cancel.is_cancelled() {
            return Err(OrchestratorError::Aborted);
        }
        if !self.policy.record_action() {
            return Err(OrchestratorError::PolicyViolation {
                index,
                message: format!(
                    "Hourly action budget of {} exhausted",
                    self.policy.max_actions_per_hour
                ),
            });
        }
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(OrchestratorError::Aborted),
            result = self.browser.perform(session, action) => result.map_err(|e| {
                OrchestratorError::connectivity(format!("{} failed: {e:#}", action.name()))
            }),
        }
    }

    /// Sleep `ms`; `false` when cancelled first.
    async fn pause(&self, ms: u64) -> bool {
        self.pause_for(Duration::from_millis(ms)).await
    }

    async fn pause_for(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return !self.cancel.is_cancelled();
        }
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(duration) => true,
        }
    }

    fn log(&self, level: LogLevel, message: impl Into<String>, data: Option<serde_json::Value>) {
        let mut entry = LogEntry::new(level, message);
        entry.data = data;
        match level {
            LogLevel::Debug => tracing::debug!(data = ?entry.data, "{}", entry.message),
            LogLevel::Info => tracing::info!(data = ?entry.data, "{}", entry.message),
            LogLevel::Warn => tracing::warn!(data = ?entry.data, "{}", entry.message),
            LogLevel::Error => tracing::error!(data = ?entry.data, "{}", entry.message),
        }
        self.observer.on_log(&entry);
    }
}

fn active_session(state: &OrchestratorState) -> Result<String, OrchestratorError> {
    state
        .session_id
        .clone()
        .ok_or_else(|| OrchestratorError::connectivity("No active browser session"))
}

fn build_action(step: &PlanStep, at: Coordinate) -> Result<BrowserAction, OrchestratorError> {
    match step.action {
        ActionKind::Click => Ok(BrowserAction::Click { at }),
        ActionKind::Type => Ok(BrowserAction::Type {
            at,
            text: step.input_value.clone().unwrap_or_default(),
        }),
        ActionKind::Scroll => {
            let (direction, amount) = scroll_params(step.input_value.as_deref());
            Ok(BrowserAction::Scroll {
                at,
                direction,
                amount,
            })
        }
        ActionKind::Keypress => {
            let raw = step
                .input_value
                .as_deref()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(&step.target_description);
            let key = normalize_key_combo(raw).ok_or_else(|| OrchestratorError::StepFailed {
                index: step.index,
                action: step.action,
                last_error: format!("Unrecognised key '{raw}'"),
            })?;
            Ok(BrowserAction::Keypress { at: Some(at), key })
        }
        ActionKind::Navigate | ActionKind::Wait => Err(OrchestratorError::InvalidPlan {
            message: format!("Step {} ({}) has no on-screen target", step.index, step.action),
        }),
    }
}

/// `"down 600"`, `"up"`, `"300"`; defaults to down 500.
fn scroll_params(input: Option<&str>) -> (ScrollDirection, u32) {
    let mut direction = ScrollDirection::Down;
    let mut amount = DEFAULT_SCROLL_AMOUNT;
    for token in input.unwrap_or_default().split_whitespace() {
        match token.to_ascii_lowercase().as_str() {
            "up" => direction = ScrollDirection::Up,
            "down" => direction = ScrollDirection::Down,
            "left" => direction = ScrollDirection::Left,
            "right" => direction = ScrollDirection::Right,
            other => {
                if let Ok(n) = other.trim_end_matches("px").parse::<u32>() {
                    amount = n;
                }
            }
        }
    }
    (direction, amount)
}

/// `"1500"`, `"1500ms"`, `"2s"`, `"0.5s"`; capped at one minute.
fn wait_duration(input: Option<&str>, default: Duration) -> Duration {
    let parsed = input
        .map(|raw| raw.trim().to_ascii_lowercase())
        .filter(|raw| !raw.is_empty())
        .and_then(|raw| {
            if let Some(ms) = raw.strip_suffix("ms") {
                ms.trim().parse::<u64>().ok().map(Duration::from_millis)
            } else if let Some(secs) = raw.strip_suffix('s') {
                secs.trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|s| s.is_finite() && *s >= 0.0)
                    .map(|s| Duration::from_secs_f64(s.min(MAX_WAIT.as_secs_f64())))
            } else {
                raw.parse::<u64>().ok().map(Duration::from_millis)
            }
        });
    parsed.unwrap_or(default).min(MAX_WAIT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{ElementQuery, ElementRect, SessionInfo};
    use crate::locator::{VerificationPattern, VisionHit, VisionQuery};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WIDTH: u32 = 1280;
    const HEIGHT: u32 = 800;
    const HOME: &str = "https://www.google.com/";

    // ── Fakes ───────────────────────────────────────────────────────

    #[derive(Default)]
    struct FakeBrowser {
        rects: HashMap<String, ElementRect>,
        refuse_actions: bool,
        /// Refuse actions landing within a pixel of this point.
        refuse_near: Option<(f64, f64)>,
        cancel_at_screenshot: Option<(usize, CancellationToken)>,
        started: AtomicUsize,
        stopped: AtomicUsize,
        screenshots: AtomicUsize,
        element_rects: AtomicUsize,
        actions: Mutex<Vec<BrowserAction>>,
    }

    impl FakeBrowser {
        fn performs(&self) -> usize {
            self.actions.lock().len()
        }
    }

    #[async_trait]
    impl BrowserToolClient for FakeBrowser {
        fn name(&self) -> &str {
            "fake"
        }

        async fn start_session(&self, start_url: Option<&str>) -> anyhow::Result<SessionInfo> {
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(SessionInfo {
                session_id: "sess-1".into(),
                url: start_url.map(str::to_string),
            })
        }

        async fn stop_session(&self, _session_id: &str) -> anyhow::Result<()> {
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn screenshot(&self, _session_id: &str) -> anyhow::Result<Screenshot> {
            let n = self.screenshots.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((at, token)) = &self.cancel_at_screenshot {
                if n == *at {
                    token.cancel();
                }
            }
            Ok(Screenshot {
                image_base64: "aGVsbG8=".into(),
                width: WIDTH,
                height: HEIGHT,
            })
        }

        async fn element_rect(
            &self,
            _session_id: &str,
            query: &ElementQuery,
        ) -> anyhow::Result<ElementRect> {
            self.element_rects.fetch_add(1, Ordering::SeqCst);
            let key = match query {
                ElementQuery::Selector { selector } => selector,
                ElementQuery::Text { text } => text,
                ElementQuery::Role { role, .. } => role,
            };
            Ok(self.rects.get(key).copied().unwrap_or_default())
        }

        async fn perform(
            &self,
            _session_id: &str,
            action: &BrowserAction,
        ) -> anyhow::Result<ActionOutcome> {
            self.actions.lock().push(action.clone());
            let stale = match (self.refuse_near, action.coordinate()) {
                (Some((x, y)), Some(at)) => (at.x - x).abs() <= 1.0 && (at.y - y).abs() <= 1.0,
                _ => false,
            };
            if self.refuse_actions || stale {
                return Ok(ActionOutcome::failed("element detached"));
            }
            let url = match action {
                BrowserAction::Navigate { url } => Some(url.clone()),
                _ => None,
            };
            Ok(ActionOutcome::ok(url))
        }
    }

    struct FakeVision {
        source: LocatorSource,
        space: Space,
        hits: HashMap<String, (f64, f64)>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl VisionLocator for FakeVision {
        fn source(&self) -> LocatorSource {
            self.source
        }

        fn native_space(&self) -> Space {
            self.space
        }

        async fn locate(&self, query: &VisionQuery<'_>) -> anyhow::Result<VisionHit> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(match self.hits.get(query.target) {
                Some(&(x, y)) => VisionHit {
                    found: true,
                    x,
                    y,
                    confidence: 0.9,
                    reasoning: None,
                },
                None => VisionHit {
                    found: false,
                    x: 0.0,
                    y: 0.0,
                    confidence: 0.0,
                    reasoning: Some("not visible".into()),
                },
            })
        }
    }

    #[derive(Default)]
    struct Recorder {
        statuses: Mutex<Vec<RunStatus>>,
        logs: AtomicUsize,
        completed_steps: AtomicUsize,
    }

    impl Observer for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn on_state_change(&self, state: &OrchestratorState) {
            self.statuses.lock().push(state.status);
        }

        fn on_log(&self, _entry: &LogEntry) {
            self.logs.fetch_add(1, Ordering::SeqCst);
        }

        fn on_step_complete(&self, _execution: &StepExecution, _index: usize) {
            self.completed_steps.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        browser: Arc<FakeBrowser>,
        vision_a: Arc<FakeVision>,
        vision_b: Arc<FakeVision>,
        recorder: Arc<Recorder>,
        orchestrator: Orchestrator,
    }

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.orchestrator.retry_delay_ms = 0;
        config.orchestrator.settle_delay_ms = 0;
        config.orchestrator.use_cache = false;
        config
    }

    /// Every target is found by all three sources at the given viewport point.
    fn harness(targets: &[(&str, f64, f64)], config: Config, mut browser: FakeBrowser) -> Harness {
        let mut hits_a = HashMap::new();
        let mut hits_b = HashMap::new();
        for &(target, x, y) in targets {
            browser.rects.insert(
                target.to_string(),
                ElementRect {
                    found: true,
                    visible: true,
                    x: x - 20.0,
                    y: y - 10.0,
                    width: 40.0,
                    height: 20.0,
                },
            );
            hits_a.insert(
                target.to_string(),
                (x / f64::from(WIDTH) * 1000.0, y / f64::from(HEIGHT) * 1000.0),
            );
            hits_b.insert(target.to_string(), (x + 2.0, y + 1.0));
        }

        let browser = Arc::new(browser);
        let vision_a = Arc::new(FakeVision {
            source: LocatorSource::VisionA,
            space: Space::Normalized,
            hits: hits_a,
            calls: AtomicUsize::new(0),
        });
        let vision_b = Arc::new(FakeVision {
            source: LocatorSource::VisionB,
            space: Space::VendorSdk,
            hits: hits_b,
            calls: AtomicUsize::new(0),
        });
        let recorder = Arc::new(Recorder::default());

        let resolver = CoordinateResolver::new(
            browser.clone(),
            Some(vision_a.clone() as Arc<dyn VisionLocator>),
            Some(vision_b.clone() as Arc<dyn VisionLocator>),
            config.resolver.clone(),
        );
        let orchestrator =
            Orchestrator::new(browser.clone(), resolver, &config).with_observer(recorder.clone());

        Harness {
            browser,
            vision_a,
            vision_b,
            recorder,
            orchestrator,
        }
    }

    fn plan(steps: Vec<PlanStep>) -> Plan {
        Plan {
            goal: "Search for OpenAI".into(),
            analysis: String::new(),
            success_criteria: String::new(),
            steps,
        }
    }

    fn locator_calls(h: &Harness) -> usize {
        h.browser.element_rects.load(Ordering::SeqCst)
            + h.vision_a.calls.load(Ordering::SeqCst)
            + h.vision_b.calls.load(Ordering::SeqCst)
    }

    // ── Runs ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn navigational_plan_never_locates() {
        let mut h = harness(&[], fast_config(), FakeBrowser::default());
        let state = h
            .orchestrator
            .execute_plan(
                plan(vec![
                    PlanStep::new(1, ActionKind::Navigate, "https://example.com"),
                    PlanStep::new(2, ActionKind::Wait, "").with_input("5ms"),
                ]),
                RunOptions::default(),
            )
            .await;

        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.executed_steps.len(), 2);
        assert_eq!(locator_calls(&h), 0);
        assert_eq!(h.browser.screenshots.load(Ordering::SeqCst), 0);
        assert_eq!(state.current_url.as_deref(), Some("https://example.com"));
        assert_eq!(state.session_id.as_deref(), Some("sess-1"));
    }

    #[tokio::test]
    async fn three_step_search_completes_on_first_attempts() {
        let mut h = harness(
            &[("search input field", 640.0, 100.0)],
            fast_config(),
            FakeBrowser::default(),
        );
        let state = h
            .orchestrator
            .execute_plan(
                plan(vec![
                    PlanStep::new(1, ActionKind::Click, "search input field"),
                    PlanStep::new(2, ActionKind::Type, "search input field").with_input("OpenAI"),
                    PlanStep::new(3, ActionKind::Keypress, "search input field")
                        .with_input("enter"),
                ]),
                RunOptions::with_start_url(HOME),
            )
            .await;

        assert_eq!(state.status, RunStatus::Completed);
        assert!(state.is_success());
        assert_eq!(state.executed_steps.len(), 3);
        for execution in &state.executed_steps {
            assert!(execution.success);
            assert_eq!(execution.retries, 0);
            assert!(!execution.used_fallback);
            let verification = execution.verification.as_ref().unwrap();
            assert_eq!(verification.pattern, VerificationPattern::AllAgree);
        }

        let at = Coordinate::viewport(641.0, 100.0);
        let actions = h.browser.actions.lock().clone();
        assert_eq!(
            actions,
            vec![
                BrowserAction::Click { at },
                BrowserAction::Type {
                    at,
                    text: "OpenAI".into()
                },
                BrowserAction::Keypress {
                    at: Some(at),
                    key: "Enter".into()
                },
            ]
        );
        assert_eq!(h.recorder.completed_steps.load(Ordering::SeqCst), 3);
        assert!(h.recorder.logs.load(Ordering::SeqCst) > 0);
        assert_eq!(
            h.recorder.statuses.lock().last().copied(),
            Some(RunStatus::Completed)
        );
        assert!(state.completed_at.is_some());
    }

    #[tokio::test]
    async fn abort_mid_retry_settles_once() {
        let token = CancellationToken::new();
        let browser = FakeBrowser {
            cancel_at_screenshot: Some((2, token.clone())),
            ..FakeBrowser::default()
        };
        let mut h = harness(&[], fast_config(), browser);
        h.orchestrator = h.orchestrator.with_cancellation_token(token);

        let state = h
            .orchestrator
            .execute_plan(
                plan(vec![PlanStep::new(1, ActionKind::Click, "ghost button")]),
                RunOptions::with_start_url(HOME),
            )
            .await;

        assert_eq!(state.status, RunStatus::Aborted);
        assert_eq!(state.failure, Some(OrchestratorError::Aborted));
        assert!(state.error.is_none());
        assert_eq!(h.browser.screenshots.load(Ordering::SeqCst), 2);
        // Only the first attempt reached the locators.
        assert_eq!(h.browser.element_rects.load(Ordering::SeqCst), 1);
        assert_eq!(h.vision_a.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.browser.performs(), 0);

        let statuses = h.recorder.statuses.lock().clone();
        assert_eq!(statuses.last().copied(), Some(RunStatus::Aborted));
        assert_eq!(
            statuses.iter().filter(|s| s.is_terminal()).count(),
            1,
            "terminal state must be reported exactly once: {statuses:?}"
        );
    }

    #[tokio::test]
    async fn aborted_before_start_issues_no_calls() {
        let mut h = harness(&[], fast_config(), FakeBrowser::default());
        h.orchestrator.abort();
        let state = h
            .orchestrator
            .execute_plan(
                plan(vec![PlanStep::new(1, ActionKind::Navigate, "https://example.com")]),
                RunOptions::default(),
            )
            .await;
        assert_eq!(state.status, RunStatus::Aborted);
        assert_eq!(h.browser.started.load(Ordering::SeqCst), 0);
        assert_eq!(h.browser.performs(), 0);
    }

    #[tokio::test]
    async fn repeated_identical_clicks_end_in_loop_detected() {
        let mut h = harness(&[("Next", 900.0, 700.0)], fast_config(), FakeBrowser::default());
        let steps = (1..=4)
            .map(|i| PlanStep::new(i, ActionKind::Click, "Next"))
            .collect();
        let state = h
            .orchestrator
            .execute_plan(plan(steps), RunOptions::with_start_url(HOME))
            .await;

        assert_eq!(state.status, RunStatus::LoopDetected);
        assert_eq!(state.executed_steps.len(), 3);
        assert_eq!(h.browser.performs(), 3);
        match state.failure {
            Some(OrchestratorError::LoopDetected { index, report }) => {
                assert_eq!(index, 4);
                assert!(report.is_loop);
                assert_eq!(report.loop_length, 1);
            }
            other => panic!("expected loop failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn exhausted_retries_fail_with_step_index() {
        let mut h = harness(&[], fast_config(), FakeBrowser::default());
        let state = h
            .orchestrator
            .execute_plan(
                plan(vec![PlanStep::new(7, ActionKind::Click, "ghost button")]),
                RunOptions::with_start_url(HOME),
            )
            .await;

        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(h.browser.screenshots.load(Ordering::SeqCst), 3);
        assert_eq!(h.browser.performs(), 0);
        match &state.failure {
            Some(OrchestratorError::StepFailed {
                index,
                action,
                last_error,
            }) => {
                assert_eq!(*index, 7);
                assert_eq!(*action, ActionKind::Click);
                assert!(last_error.contains("none_found"), "{last_error}");
            }
            other => panic!("expected step failure, got {other:?}"),
        }
        assert!(state.error.as_deref().unwrap().starts_with("Step 7 (click) failed"));
        let execution = &state.executed_steps[0];
        assert!(!execution.success);
        assert_eq!(execution.retries, 2);
    }

    #[tokio::test]
    async fn refused_actions_are_retried_then_fail() {
        let browser = FakeBrowser {
            refuse_actions: true,
            ..FakeBrowser::default()
        };
        let mut h = harness(&[("Submit", 300.0, 300.0)], fast_config(), browser);
        let state = h
            .orchestrator
            .execute_plan(
                plan(vec![PlanStep::new(1, ActionKind::Click, "Submit")]),
                RunOptions::with_start_url(HOME),
            )
            .await;

        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(h.browser.performs(), 3);
        assert!(state.error.unwrap().contains("element detached"));
    }

    #[tokio::test]
    async fn fallback_description_used_on_retry() {
        let mut h = harness(&[("Login link", 1100.0, 40.0)], fast_config(), FakeBrowser::default());
        let state = h
            .orchestrator
            .execute_plan(
                plan(vec![
                    PlanStep::new(1, ActionKind::Click, "Sign in button").with_fallback("Login link")
                ]),
                RunOptions::with_start_url(HOME),
            )
            .await;

        assert_eq!(state.status, RunStatus::Completed);
        let execution = &state.executed_steps[0];
        assert!(execution.used_fallback);
        assert_eq!(execution.retries, 1);
        assert_eq!(
            execution.patterns,
            vec![VerificationPattern::NoneFound, VerificationPattern::AllAgree]
        );
        assert_eq!(h.browser.screenshots.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stale_cache_entry_still_verifies_primary_target() {
        let mut config = fast_config();
        config.orchestrator.use_cache = true;
        let cache = Arc::new(ActionCache::new(&config.cache));
        let stale = Coordinate::viewport(5.0, 5.0);
        cache.record_success(HOME, "Sign in button", stale);
        cache.record_success(HOME, "Sign in button", stale);

        let browser = FakeBrowser {
            refuse_near: Some((5.0, 5.0)),
            ..FakeBrowser::default()
        };
        let mut h = harness(
            &[("Sign in button", 1100.0, 40.0), ("Login link", 1000.0, 40.0)],
            config,
            browser,
        );
        h.orchestrator = h.orchestrator.with_cache(cache.clone());
        let state = h
            .orchestrator
            .execute_plan(
                plan(vec![
                    PlanStep::new(1, ActionKind::Click, "Sign in button").with_fallback("Login link")
                ]),
                RunOptions::with_start_url(HOME),
            )
            .await;

        assert_eq!(state.status, RunStatus::Completed);
        let execution = &state.executed_steps[0];
        assert_eq!(execution.retries, 0);
        assert!(!execution.used_fallback);
        assert!(!execution.used_cache);
        assert_eq!(
            execution.verification.as_ref().unwrap().pattern,
            VerificationPattern::AllAgree
        );
        assert_eq!(h.vision_a.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.browser.actions.lock().clone(),
            vec![
                BrowserAction::Click { at: stale },
                BrowserAction::Click {
                    at: Coordinate::viewport(1101.0, 40.0)
                },
            ]
        );
    }

    #[tokio::test]
    async fn loop_history_is_cleared_between_runs() {
        let config = fast_config();
        let runs = config.loop_detector.threshold + 1;
        let mut h = harness(&[("Next", 900.0, 700.0)], config, FakeBrowser::default());

        for _ in 0..runs {
            let state = h
                .orchestrator
                .execute_plan(
                    plan(vec![PlanStep::new(1, ActionKind::Click, "Next")]),
                    RunOptions::with_start_url(HOME),
                )
                .await;
            assert_eq!(state.status, RunStatus::Completed);
        }
        assert_eq!(h.browser.performs(), runs);
    }

    #[tokio::test]
    async fn exhausted_action_budget_stops_before_locating() {
        let mut config = fast_config();
        config.policy.max_actions_per_hour = 1;
        let mut h = harness(&[("Search", 640.0, 100.0)], config, FakeBrowser::default());
        let state = h
            .orchestrator
            .execute_plan(
                plan(vec![
                    PlanStep::new(1, ActionKind::Navigate, HOME),
                    PlanStep::new(2, ActionKind::Click, "Search"),
                ]),
                RunOptions::default(),
            )
            .await;

        assert_eq!(state.status, RunStatus::Failed);
        assert!(matches!(
            state.failure,
            Some(OrchestratorError::PolicyViolation { index: 2, .. })
        ));
        assert_eq!(h.browser.screenshots.load(Ordering::SeqCst), 0);
        assert_eq!(h.browser.performs(), 1);
    }

    #[tokio::test]
    async fn health_check_delegates_to_browser() {
        let h = harness(&[], fast_config(), FakeBrowser::default());
        assert!(h.orchestrator.health_check().await);
    }

    #[tokio::test]
    async fn trusted_cache_entry_skips_locators() {
        let mut config = fast_config();
        config.orchestrator.use_cache = true;
        let cache = Arc::new(ActionCache::new(&config.cache));
        let at = Coordinate::viewport(300.0, 40.0);
        cache.record_success(HOME, "Search", at);
        cache.record_success(HOME, "Search", at);

        let mut h = harness(&[], config, FakeBrowser::default());
        h.orchestrator = h.orchestrator.with_cache(cache.clone());
        let state = h
            .orchestrator
            .execute_plan(
                plan(vec![PlanStep::new(1, ActionKind::Click, "search")]),
                RunOptions::with_start_url(HOME),
            )
            .await;

        assert_eq!(state.status, RunStatus::Completed);
        let execution = &state.executed_steps[0];
        assert!(execution.used_cache);
        assert!(execution.verification.is_none());
        assert_eq!(h.browser.screenshots.load(Ordering::SeqCst), 0);
        assert_eq!(locator_calls(&h), 0);
        assert_eq!(h.browser.actions.lock()[0], BrowserAction::Click { at });
        assert_eq!(cache.get(HOME, "Search").unwrap().success_count, 3);
    }

    #[tokio::test]
    async fn verified_success_is_cached_across_runs() {
        let mut config = fast_config();
        config.orchestrator.use_cache = true;
        let mut h = harness(&[("Search", 640.0, 100.0)], config, FakeBrowser::default());
        let search = || plan(vec![PlanStep::new(1, ActionKind::Click, "Search")]);

        for _ in 0..2 {
            let state = h
                .orchestrator
                .execute_plan(search(), RunOptions::with_start_url(HOME))
                .await;
            assert!(!state.executed_steps[0].used_cache);
        }
        let state = h
            .orchestrator
            .execute_plan(search(), RunOptions::with_start_url(HOME))
            .await;
        assert!(state.executed_steps[0].used_cache);
        assert_eq!(h.browser.screenshots.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn max_steps_exceeded_fails_run() {
        let mut config = fast_config();
        config.orchestrator.max_steps = 1;
        let mut h = harness(&[], config, FakeBrowser::default());
        let state = h
            .orchestrator
            .execute_plan(
                plan(vec![
                    PlanStep::new(1, ActionKind::Wait, "").with_input("1ms"),
                    PlanStep::new(2, ActionKind::Wait, "").with_input("1ms"),
                ]),
                RunOptions::default(),
            )
            .await;

        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.executed_steps.len(), 1);
        assert_eq!(
            state.failure,
            Some(OrchestratorError::MaxStepsExceeded {
                index: 2,
                max_steps: 1
            })
        );
    }

    #[tokio::test]
    async fn navigation_outside_allowlist_is_a_policy_violation() {
        let mut config = fast_config();
        config.policy.allowed_domains = vec!["example.com".into()];
        let mut h = harness(&[], config, FakeBrowser::default());
        let state = h
            .orchestrator
            .execute_plan(
                plan(vec![PlanStep::new(1, ActionKind::Navigate, "https://evil.net/login")]),
                RunOptions::default(),
            )
            .await;

        assert_eq!(state.status, RunStatus::Failed);
        assert!(matches!(
            state.failure,
            Some(OrchestratorError::PolicyViolation { index: 1, .. })
        ));
        assert_eq!(h.browser.performs(), 0);
    }

    #[tokio::test]
    async fn invalid_plan_fails_before_session_starts() {
        let mut h = harness(&[], fast_config(), FakeBrowser::default());
        let state = h
            .orchestrator
            .execute_plan(plan(Vec::new()), RunOptions::default())
            .await;
        assert_eq!(state.status, RunStatus::Failed);
        assert!(matches!(state.failure, Some(OrchestratorError::InvalidPlan { .. })));
        assert_eq!(h.browser.started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn injected_session_is_reused_and_reset() {
        let mut h = harness(&[], fast_config(), FakeBrowser::default());
        h.orchestrator = h.orchestrator.with_session("existing");
        let state = h
            .orchestrator
            .execute_plan(
                plan(vec![PlanStep::new(1, ActionKind::Wait, "").with_input("1ms")]),
                RunOptions::default(),
            )
            .await;

        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.session_id.as_deref(), Some("existing"));
        assert_eq!(h.browser.started.load(Ordering::SeqCst), 0);

        h.orchestrator.reset_session().await.unwrap();
        assert!(h.orchestrator.session_id().is_none());
        assert_eq!(h.browser.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn oversized_screenshot_counts_as_failed_attempt() {
        let mut config = fast_config();
        config.resolver.max_image_bytes = 2;
        let mut h = harness(&[("Search", 640.0, 100.0)], config, FakeBrowser::default());
        let state = h
            .orchestrator
            .execute_plan(
                plan(vec![PlanStep::new(1, ActionKind::Click, "Search")]),
                RunOptions::with_start_url(HOME),
            )
            .await;
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(locator_calls(&h), 0);
        assert!(state.error.unwrap().contains("byte limit"));
    }

    // ── Helpers ─────────────────────────────────────────────────────

    #[test]
    fn scroll_params_parse_direction_and_amount() {
        assert_eq!(scroll_params(None), (ScrollDirection::Down, 500));
        assert_eq!(scroll_params(Some("up")), (ScrollDirection::Up, 500));
        assert_eq!(scroll_params(Some("down 600")), (ScrollDirection::Down, 600));
        assert_eq!(scroll_params(Some("Left 200px")), (ScrollDirection::Left, 200));
        assert_eq!(scroll_params(Some("300")), (ScrollDirection::Down, 300));
    }

    #[test]
    fn wait_duration_units_and_cap() {
        let default = Duration::from_millis(1000);
        assert_eq!(wait_duration(None, default), default);
        assert_eq!(wait_duration(Some("1500"), default), Duration::from_millis(1500));
        assert_eq!(wait_duration(Some("250ms"), default), Duration::from_millis(250));
        assert_eq!(wait_duration(Some("2s"), default), Duration::from_secs(2));
        assert_eq!(wait_duration(Some("0.5s"), default), Duration::from_millis(500));
        assert_eq!(wait_duration(Some("soon"), default), default);
        assert_eq!(wait_duration(Some("10m"), default), default);
        assert_eq!(wait_duration(Some("600s"), default), MAX_WAIT);
        assert_eq!(wait_duration(Some("999999"), default), MAX_WAIT);
    }

    #[test]
    fn keypress_with_unknown_combo_is_not_retried() {
        let step = PlanStep::new(1, ActionKind::Keypress, "field").with_input("ctrl+");
        let err = build_action(&step, Coordinate::viewport(1.0, 1.0)).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn run_status_terminal_states() {
        assert!(RunStatus::Aborted.is_terminal());
        assert!(RunStatus::LoopDetected.is_terminal());
        assert!(!RunStatus::Executing.is_terminal());
        assert_eq!(
            serde_json::to_string(&RunStatus::LoopDetected).unwrap(),
            "\"loop_detected\""
        );
    }
}
