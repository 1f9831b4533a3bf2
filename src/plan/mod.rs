//! Automation plans as handed over by the planning collaborator.
//!
//! A [`Plan`] is read-only once parsed: the orchestrator walks its steps in
//! order and never rewrites them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The six kinds of UI action a plan step may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Click,
    Type,
    Scroll,
    Navigate,
    Wait,
    Keypress,
}

impl ActionKind {
    pub const ALL: [ActionKind; 6] = [
        Self::Click,
        Self::Type,
        Self::Scroll,
        Self::Navigate,
        Self::Wait,
        Self::Keypress,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Click => "click",
            Self::Type => "type",
            Self::Scroll => "scroll",
            Self::Navigate => "navigate",
            Self::Wait => "wait",
            Self::Keypress => "keypress",
        }
    }

    /// Whether the action needs an on-screen location before it can be applied.
    pub fn is_spatial(self) -> bool {
        match self {
            Self::Click | Self::Type | Self::Scroll | Self::Keypress => true,
            Self::Navigate | Self::Wait => false,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> anyhow::Result<Self> {
        let key = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match key.as_str() {
            "click" | "tap" | "press_button" => Ok(Self::Click),
            "type" | "fill" | "input" | "type_text" => Ok(Self::Type),
            "scroll" => Ok(Self::Scroll),
            "navigate" | "goto" | "go_to" | "open" | "open_url" => Ok(Self::Navigate),
            "wait" | "sleep" | "pause" => Ok(Self::Wait),
            "keypress" | "key_press" | "press" | "key" | "press_key" => Ok(Self::Keypress),
            _ => anyhow::bail!(
                "Unsupported action_type '{raw}'. Use 'click', 'type', 'scroll', 'navigate', 'wait', or 'keypress'"
            ),
        }
    }
}

/// One ordered instruction inside a [`Plan`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub index: u32,
    pub action: ActionKind,
    /// Natural-language, vision-resolvable description of the target.
    pub target_description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_outcome: Option<String>,
}

impl PlanStep {
    pub fn new(index: u32, action: ActionKind, target_description: impl Into<String>) -> Self {
        Self {
            index,
            action,
            target_description: target_description.into(),
            fallback_description: None,
            input_value: None,
            expected_outcome: None,
        }
    }

    #[must_use]
    pub fn with_input(mut self, value: impl Into<String>) -> Self {
        self.input_value = Some(value.into());
        self
    }

    #[must_use]
    pub fn with_fallback(mut self, description: impl Into<String>) -> Self {
        self.fallback_description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_expected_outcome(mut self, outcome: impl Into<String>) -> Self {
        self.expected_outcome = Some(outcome.into());
        self
    }

    /// Description to locate on a given attempt: the primary target first,
    /// the fallback (when present) on every retry.
    pub fn description_for_attempt(&self, attempt: u32) -> (&str, bool) {
        match (&self.fallback_description, attempt) {
            (Some(fallback), n) if n >= 1 && !fallback.trim().is_empty() => (fallback, true),
            _ => (&self.target_description, false),
        }
    }

    /// URL a navigate step points at: `input_value`, else a URL-looking target.
    pub fn navigation_url(&self) -> Option<&str> {
        self.input_value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .or_else(|| {
                let target = self.target_description.trim();
                looks_like_url(target).then_some(target)
            })
    }
}

fn looks_like_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

/// Ordered automation plan produced by the external planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub goal: String,
    #[serde(default)]
    pub analysis: String,
    #[serde(default)]
    pub success_criteria: String,
    pub steps: Vec<PlanStep>,
}

// ── Planner wire contract ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WirePlan {
    #[serde(default)]
    analysis: String,
    goal: String,
    steps: Vec<WireStep>,
    #[serde(default, deserialize_with = "string_or_list")]
    success_criteria: String,
}

#[derive(Debug, Deserialize)]
struct WireStep {
    step_number: u32,
    action_type: String,
    #[serde(default)]
    target_description: String,
    #[serde(default)]
    input_value: Option<String>,
    #[serde(default)]
    fallback_description: Option<String>,
    #[serde(default)]
    expected_outcome: Option<String>,
}

/// Planners sometimes emit success criteria as a list of bullet strings.
fn string_or_list<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Criteria {
        One(String),
        Many(Vec<String>),
    }
    Ok(match Criteria::deserialize(deserializer)? {
        Criteria::One(s) => s,
        Criteria::Many(items) => items.join("\n"),
    })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl Plan {
    /// Parse the planner's JSON output and validate it.
    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let wire: WirePlan = serde_json::from_str(raw.trim())
            .map_err(|e| anyhow::anyhow!("Plan is not valid JSON: {e}"))?;

        let steps = wire
            .steps
            .into_iter()
            .map(|s| {
                Ok(PlanStep {
                    index: s.step_number,
                    action: s.action_type.parse()?,
                    target_description: s.target_description.trim().to_string(),
                    fallback_description: non_blank(s.fallback_description),
                    input_value: s.input_value,
                    expected_outcome: non_blank(s.expected_outcome),
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let plan = Self {
            goal: wire.goal,
            analysis: wire.analysis,
            success_criteria: wire.success_criteria,
            steps,
        };
        plan.validate()?;
        Ok(plan)
    }

    /// Structural checks that must hold before execution starts.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.steps.is_empty() {
            anyhow::bail!("Plan has no steps");
        }

        let mut previous: Option<u32> = None;
        for step in &self.steps {
            if let Some(prev) = previous {
                if step.index <= prev {
                    anyhow::bail!(
                        "Step numbers must be strictly increasing (step {} follows step {prev})",
                        step.index
                    );
                }
            }
            previous = Some(step.index);

            match step.action {
                ActionKind::Type => {
                    if step.input_value.as_deref().map_or(true, str::is_empty) {
                        anyhow::bail!("Step {} is a type action without input_value", step.index);
                    }
                }
                ActionKind::Navigate => {
                    if step.navigation_url().is_none() {
                        anyhow::bail!("Step {} is a navigate action without a URL", step.index);
                    }
                }
                ActionKind::Click | ActionKind::Scroll | ActionKind::Keypress => {
                    if step.target_description.trim().is_empty() {
                        anyhow::bail!(
                            "Step {} ({}) has an empty target_description",
                            step.index,
                            step.action
                        );
                    }
                }
                ActionKind::Wait => {}
            }
        }
        Ok(())
    }

    /// True when no step needs an on-screen location.
    pub fn is_navigational_only(&self) -> bool {
        self.steps.iter().all(|s| !s.action.is_spatial())
    }
}
