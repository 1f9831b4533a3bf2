//! Detects when execution is stuck repeating itself.
//!
//! Two independent signals:
//! - the tail of the history is `threshold` back-to-back copies of the same
//!   `L`-length action sequence
//! - within the recent failure window, the same target failed `threshold` times

use crate::config::LoopDetectorConfig;
use crate::coords::ViewportPoint;
use crate::plan::ActionKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// One attempted action, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub timestamp: DateTime<Utc>,
    pub action: ActionKind,
    pub target_description: String,
    pub coordinate: Option<ViewportPoint>,
    pub url: Option<String>,
    pub success: bool,
}

impl ActionRecord {
    pub fn new(
        action: ActionKind,
        target_description: impl Into<String>,
        coordinate: Option<ViewportPoint>,
        success: bool,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            target_description: target_description.into(),
            coordinate,
            url: None,
            success,
        }
    }

    #[must_use]
    pub fn with_url(mut self, url: Option<String>) -> Self {
        self.url = url;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopKind {
    RepeatedPattern,
    RepeatedFailures,
}

/// Result of [`LoopDetector::detect_loop`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopReport {
    pub is_loop: bool,
    pub kind: Option<LoopKind>,
    /// Length of the repeating sequence (1 for a failure cluster).
    pub loop_length: usize,
    pub repeated_actions: Vec<ActionRecord>,
    /// Advisory text for diagnostics only.
    pub suggestion: String,
}

impl LoopReport {
    fn none() -> Self {
        Self {
            is_loop: false,
            kind: None,
            loop_length: 0,
            repeated_actions: Vec::new(),
            suggestion: String::new(),
        }
    }
}

/// Bounded history of recent actions.
#[derive(Debug, Clone)]
pub struct LoopDetector {
    history: VecDeque<ActionRecord>,
    capacity: usize,
    threshold: usize,
    failure_window: usize,
    tolerance_px: f64,
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new(&LoopDetectorConfig::default())
    }
}

impl LoopDetector {
    pub fn new(config: &LoopDetectorConfig) -> Self {
        Self {
            history: VecDeque::with_capacity(config.history),
            capacity: config.history.max(1),
            threshold: config.threshold.max(2),
            failure_window: config.failure_window,
            tolerance_px: config.coordinate_tolerance_px,
        }
    }

    pub fn record(&mut self, record: ActionRecord) {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn history(&self) -> impl Iterator<Item = &ActionRecord> {
        self.history.iter()
    }

    fn same_action(&self, a: &ActionRecord, b: &ActionRecord) -> bool {
        if a.action != b.action
            || !a
                .target_description
                .trim()
                .eq_ignore_ascii_case(b.target_description.trim())
        {
            return false;
        }
        match (a.coordinate, b.coordinate) {
            (Some(p), Some(q)) => p.distance(q) <= self.tolerance_px,
            (None, None) => true,
            _ => false,
        }
    }

    pub fn detect_loop(&self) -> LoopReport {
        if let Some(report) = self.detect_repeated_pattern() {
            return report;
        }
        self.detect_repeated_failures()
            .unwrap_or_else(LoopReport::none)
    }

    fn detect_repeated_pattern(&self) -> Option<LoopReport> {
        let n = self.history.len();
        let records: Vec<&ActionRecord> = self.history.iter().collect();

        for len in 1..=n / 2 {
            let span = self.threshold * len;
            if span > n {
                break;
            }
            let window = &records[n - span..];
            let pattern = &window[..len];
            let repeats = (1..self.threshold).all(|rep| {
                (0..len).all(|i| self.same_action(window[rep * len + i], pattern[i]))
            });
            if repeats {
                let repeated: Vec<ActionRecord> = pattern.iter().map(|r| (*r).clone()).collect();
                let suggestion = suggestion_for(&repeated);
                return Some(LoopReport {
                    is_loop: true,
                    kind: Some(LoopKind::RepeatedPattern),
                    loop_length: len,
                    repeated_actions: repeated,
                    suggestion,
                });
            }
        }
        None
    }

    fn detect_repeated_failures(&self) -> Option<LoopReport> {
        let recent = self
            .history
            .iter()
            .rev()
            .take(self.failure_window)
            .filter(|r| !r.success);

        let mut groups: HashMap<String, Vec<&ActionRecord>> = HashMap::new();
        for record in recent {
            groups
                .entry(record.target_description.trim().to_lowercase())
                .or_default()
                .push(record);
        }

        let (target, failures) = groups
            .into_iter()
            .filter(|(_, v)| v.len() >= self.threshold)
            .max_by_key(|(_, v)| v.len())?;

        let mut repeated: Vec<ActionRecord> = failures.into_iter().cloned().collect();
        repeated.reverse();
        let suggestion = format!(
            "Repeated failures on '{target}'. {}",
            suggestion_for(&repeated)
        );
        Some(LoopReport {
            is_loop: true,
            kind: Some(LoopKind::RepeatedFailures),
            loop_length: 1,
            repeated_actions: repeated,
            suggestion,
        })
    }
}

/// Diagnostic hint keyed on the most common action in the pattern.
fn suggestion_for(records: &[ActionRecord]) -> String {
    let mut counts: HashMap<ActionKind, usize> = HashMap::new();
    for r in records {
        *counts.entry(r.action).or_default() += 1;
    }
    let dominant = ActionKind::ALL
        .into_iter()
        .max_by_key(|kind| counts.get(kind).copied().unwrap_or(0));

    match dominant {
        Some(ActionKind::Scroll) => {
            "Scrolling is not revealing the target; it may not exist on this page or the container may not scroll."
        }
        Some(ActionKind::Click) => {
            "Clicks are not changing the page; the element may be covered by an overlay or disabled."
        }
        Some(ActionKind::Type) => {
            "Typing into the same field keeps repeating; check that the field accepts input."
        }
        Some(ActionKind::Keypress) => {
            "Key presses are not advancing the page; the focused element may be wrong."
        }
        Some(ActionKind::Navigate) => {
            "Navigation keeps landing on the same page; check for redirects or a login wall."
        }
        Some(ActionKind::Wait) | None => {
            "Waiting is not changing the page; the expected content may never load."
        }
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn click(target: &str, x: f64, success: bool) -> ActionRecord {
        ActionRecord::new(
            ActionKind::Click,
            target,
            Some(ViewportPoint::new(x, 100.0)),
            success,
        )
    }

    #[test]
    fn empty_history_is_not_a_loop() {
        let detector = LoopDetector::default();
        let report = detector.detect_loop();
        assert!(!report.is_loop);
        assert!(report.kind.is_none());
    }

    #[test]
    fn same_action_three_times_is_a_loop() {
        let mut detector = LoopDetector::default();
        detector.record(click("Next", 100.0, true));
        detector.record(click("Next", 104.0, true));
        assert!(!detector.detect_loop().is_loop);

        detector.record(click("next", 108.0, true));
        let report = detector.detect_loop();
        assert!(report.is_loop);
        assert_eq!(report.kind, Some(LoopKind::RepeatedPattern));
        assert_eq!(report.loop_length, 1);
        assert!(report.suggestion.contains("overlay"));
    }

    #[test]
    fn coordinates_beyond_tolerance_do_not_match() {
        let mut detector = LoopDetector::default();
        detector.record(click("Next", 100.0, true));
        detector.record(click("Next", 130.0, true));
        detector.record(click("Next", 160.0, true));
        assert!(!detector.detect_loop().is_loop);
    }

    #[test]
    fn two_step_cycle_detected() {
        let mut detector = LoopDetector::default();
        for _ in 0..3 {
            detector.record(ActionRecord::new(
                ActionKind::Scroll,
                "results list",
                Some(ViewportPoint::new(500.0, 500.0)),
                true,
            ));
            detector.record(click("Load more", 300.0, true));
        }
        let report = detector.detect_loop();
        assert!(report.is_loop);
        assert_eq!(report.loop_length, 2);
        assert_eq!(report.repeated_actions.len(), 2);
    }

    #[test]
    fn interleaved_progress_is_not_a_loop() {
        let mut detector = LoopDetector::default();
        detector.record(click("Search", 100.0, true));
        detector.record(ActionRecord::new(ActionKind::Type, "Search", None, true));
        detector.record(ActionRecord::new(ActionKind::Keypress, "Search", None, true));
        detector.record(click("First result", 200.0, true));
        assert!(!detector.detect_loop().is_loop);
    }

    #[test]
    fn repeated_failures_on_one_target() {
        let mut detector = LoopDetector::default();
        detector.record(click("Submit", 100.0, false));
        detector.record(ActionRecord::new(ActionKind::Scroll, "page", None, true));
        detector.record(click("submit", 400.0, false));
        detector.record(ActionRecord::new(ActionKind::Wait, "", None, true));
        detector.record(click("Submit ", 700.0, false));

        let report = detector.detect_loop();
        assert!(report.is_loop);
        assert_eq!(report.kind, Some(LoopKind::RepeatedFailures));
        assert_eq!(report.repeated_actions.len(), 3);
        assert!(report.suggestion.starts_with("Repeated failures on 'submit'"));
    }

    #[test]
    fn failures_outside_window_are_ignored() {
        let mut detector = LoopDetector::default();
        detector.record(click("Submit", 100.0, false));
        detector.record(click("Submit", 400.0, false));
        for i in 0..9 {
            detector.record(click(&format!("item {i}"), 100.0, true));
        }
        detector.record(click("Submit", 700.0, false));
        assert!(!detector.detect_loop().is_loop);
    }

    #[test]
    fn history_is_bounded() {
        let mut detector = LoopDetector::new(&LoopDetectorConfig {
            history: 5,
            ..LoopDetectorConfig::default()
        });
        for i in 0..20 {
            detector.record(click(&format!("item {i}"), 100.0, true));
        }
        assert_eq!(detector.len(), 5);
        assert_eq!(detector.history().next().unwrap().target_description, "item 15");
    }

    #[test]
    fn reset_clears_history() {
        let mut detector = LoopDetector::default();
        for _ in 0..3 {
            detector.record(click("Next", 100.0, true));
        }
        assert!(detector.detect_loop().is_loop);
        detector.reset();
        assert!(detector.is_empty());
        assert!(!detector.detect_loop().is_loop);
    }

    #[test]
    fn scroll_loop_suggestion() {
        let mut detector = LoopDetector::default();
        for _ in 0..3 {
            detector.record(ActionRecord::new(
                ActionKind::Scroll,
                "footer",
                Some(ViewportPoint::new(500.0, 500.0)),
                true,
            ));
        }
        assert!(detector.detect_loop().suggestion.starts_with("Scrolling"));
    }
}
