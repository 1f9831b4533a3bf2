//! Triple verification: reconcile the DOM and two vision estimates of an
//! element's position and decide whether it is safe to act on.
//!
//! The policy is conservative. Ambiguity never produces a click; it produces
//! `proceed = false`, which sends the orchestrator into its retry/fallback
//! path instead.

use super::traits::{LocatorResult, LocatorSource, VisionLocator, VisionQuery};
use crate::browser::{BrowserToolClient, ElementQuery, Screenshot};
use crate::config::ResolverConfig;
use crate::coords::{average, Coordinate, Viewport, ViewportPoint};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Agreement pattern among the sources that reported a find.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationPattern {
    NoneFound,
    DomOnly,
    VisionOnly,
    VisionDisagree,
    DomOneVision,
    VisionAgreeDomFar,
    VisionAgreeDomVeryFar,
    AllAgree,
}

impl VerificationPattern {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoneFound => "none_found",
            Self::DomOnly => "dom_only",
            Self::VisionOnly => "vision_only",
            Self::VisionDisagree => "vision_disagree",
            Self::DomOneVision => "dom_one_vision",
            Self::VisionAgreeDomFar => "vision_agree_dom_far",
            Self::VisionAgreeDomVeryFar => "vision_agree_dom_very_far",
            Self::AllAgree => "all_agree",
        }
    }
}

impl fmt::Display for VerificationPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pairwise distances (viewport pixels) between sources that both found the element.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceDistances {
    pub dom_vision_a: Option<f64>,
    pub dom_vision_b: Option<f64>,
    pub vision_a_vision_b: Option<f64>,
}

/// Decision produced by triple verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub pattern: VerificationPattern,
    pub proceed: bool,
    pub confidence: f64,
    /// Best estimate in viewport space: the mean of the agreeing sources,
    /// clamped to the viewport and rounded to whole pixels.
    pub coordinate: Option<Coordinate>,
    pub warning: Option<String>,
    pub distances: SourceDistances,
    pub sources: Vec<LocatorResult>,
}

/// Distance bands used for classification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub match_px: f64,
    pub warn_px: f64,
    pub far_px: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            match_px: 50.0,
            warn_px: 100.0,
            far_px: 150.0,
        }
    }
}

impl From<&ResolverConfig> for Thresholds {
    fn from(config: &ResolverConfig) -> Self {
        Self {
            match_px: config.match_px,
            warn_px: config.warn_px,
            far_px: config.far_px,
        }
    }
}

struct Decision {
    pattern: VerificationPattern,
    proceed: bool,
    confidence: f64,
    point: Option<ViewportPoint>,
    warning: Option<String>,
}

impl Decision {
    fn refuse(pattern: VerificationPattern, confidence: f64, warning: Option<String>) -> Self {
        Self {
            pattern,
            proceed: false,
            confidence,
            point: None,
            warning,
        }
    }

    fn go(pattern: VerificationPattern, confidence: f64, point: Option<ViewportPoint>) -> Self {
        Self {
            pattern,
            proceed: point.is_some(),
            confidence,
            point,
            warning: None,
        }
    }
}

/// Classify already-converted viewport points.
fn decide(
    dom: Option<ViewportPoint>,
    vision_a: Option<ViewportPoint>,
    vision_b: Option<ViewportPoint>,
    t: Thresholds,
) -> Decision {
    use VerificationPattern as P;

    match (dom, vision_a, vision_b) {
        (None, None, None) => Decision::refuse(P::NoneFound, 0.0, None),
        (Some(_), None, None) => Decision::refuse(
            P::DomOnly,
            0.1,
            Some("Element exists in the DOM but no vision source can see it".into()),
        ),
        (None, Some(v), None) | (None, None, Some(v)) => Decision::go(P::VisionOnly, 0.6, Some(v)),
        (None, Some(a), Some(b)) => {
            let d = a.distance(b);
            if d <= t.match_px {
                Decision::go(P::VisionOnly, 0.7, average(&[a, b]))
            } else {
                Decision::refuse(
                    P::VisionDisagree,
                    0.2,
                    Some(format!("Vision sources disagree by {d:.0}px")),
                )
            }
        }
        (Some(d), Some(v), None) | (Some(d), None, Some(v)) => {
            let mut decision = Decision::go(P::DomOneVision, 0.75, average(&[d, v]));
            let gap = d.distance(v);
            if gap > t.match_px {
                decision.warning = Some(format!("DOM and vision are {gap:.0}px apart"));
            }
            decision
        }
        (Some(d), Some(a), Some(b)) => {
            let vision_gap = a.distance(b);
            if vision_gap > t.match_px {
                return Decision::refuse(
                    P::VisionDisagree,
                    0.2,
                    Some(format!("Vision sources disagree by {vision_gap:.0}px")),
                );
            }
            let dom_gap = d.distance(a).max(d.distance(b));
            if dom_gap <= t.match_px {
                Decision::go(P::AllAgree, 1.0, average(&[d, a, b]))
            } else if dom_gap <= t.far_px {
                let mut decision = Decision::go(P::VisionAgreeDomFar, 0.8, average(&[a, b]));
                decision.warning = Some(if dom_gap <= t.warn_px {
                    format!("DOM position is {dom_gap:.0}px from the vision consensus")
                } else {
                    format!(
                        "DOM position is {dom_gap:.0}px from the vision consensus; possible overlay"
                    )
                });
                decision
            } else {
                Decision::refuse(
                    P::VisionAgreeDomVeryFar,
                    0.3,
                    Some(format!(
                        "DOM position is {dom_gap:.0}px from the vision consensus; overlay or scroll state is ambiguous"
                    )),
                )
            }
        }
    }
}

/// Classify a set of locator results against the given viewport.
pub fn classify(
    results: &[LocatorResult],
    viewport: Viewport,
    thresholds: Thresholds,
) -> VerificationOutcome {
    let point_of = |source: LocatorSource| {
        results
            .iter()
            .find(|r| r.source == source)
            .and_then(LocatorResult::coordinate)
            .map(|c| c.to_viewport(viewport))
    };
    let dom = point_of(LocatorSource::Dom);
    let vision_a = point_of(LocatorSource::VisionA);
    let vision_b = point_of(LocatorSource::VisionB);

    let pair = |p: Option<ViewportPoint>, q: Option<ViewportPoint>| Some(p?.distance(q?));
    let distances = SourceDistances {
        dom_vision_a: pair(dom, vision_a),
        dom_vision_b: pair(dom, vision_b),
        vision_a_vision_b: pair(vision_a, vision_b),
    };

    let decision = decide(dom, vision_a, vision_b, thresholds);
    VerificationOutcome {
        pattern: decision.pattern,
        proceed: decision.proceed,
        confidence: decision.confidence,
        coordinate: decision
            .point
            .map(|p| p.clamp(viewport).rounded().to_coordinate()),
        warning: decision.warning,
        distances,
        sources: results.to_vec(),
    }
}

/// What to locate.
#[derive(Debug, Clone, Copy)]
pub struct ResolveRequest<'a> {
    pub screenshot: &'a Screenshot,
    pub target: &'a str,
    pub selector: Option<&'a str>,
    pub context: Option<&'a str>,
}

/// Runs the three locators concurrently and classifies their answers.
pub struct CoordinateResolver {
    browser: Arc<dyn BrowserToolClient>,
    vision_a: Option<Arc<dyn VisionLocator>>,
    vision_b: Option<Arc<dyn VisionLocator>>,
    config: ResolverConfig,
}

impl CoordinateResolver {
    pub fn new(
        browser: Arc<dyn BrowserToolClient>,
        vision_a: Option<Arc<dyn VisionLocator>>,
        vision_b: Option<Arc<dyn VisionLocator>>,
        config: ResolverConfig,
    ) -> Self {
        Self {
            browser,
            vision_a,
            vision_b,
            config,
        }
    }

    pub async fn resolve(&self, session_id: &str, request: ResolveRequest<'_>) -> VerificationOutcome {
        let viewport = request.screenshot.viewport();
        let vision_query = VisionQuery {
            image_base64: &request.screenshot.image_base64,
            target: request.target,
            context: request.context,
            viewport,
        };
        let vision_timeout = Duration::from_millis(self.config.vision_timeout_ms);

        let (dom, vision_a, vision_b) = tokio::join!(
            self.locate_dom(session_id, &request),
            locate_vision(
                LocatorSource::VisionA,
                self.vision_a.as_deref(),
                &vision_query,
                vision_timeout
            ),
            locate_vision(
                LocatorSource::VisionB,
                self.vision_b.as_deref(),
                &vision_query,
                vision_timeout
            ),
        );

        let outcome = classify(&[dom, vision_a, vision_b], viewport, Thresholds::from(&self.config));
        tracing::debug!(
            target_description = request.target,
            pattern = %outcome.pattern,
            proceed = outcome.proceed,
            confidence = outcome.confidence,
            "Triple verification finished"
        );
        if let Some(warning) = &outcome.warning {
            tracing::warn!(pattern = %outcome.pattern, "{warning}");
        }
        outcome
    }

    async fn locate_dom(&self, session_id: &str, request: &ResolveRequest<'_>) -> LocatorResult {
        let query = match request.selector.filter(|s| !s.trim().is_empty()) {
            Some(selector) => ElementQuery::selector(selector),
            None => ElementQuery::text(request.target),
        };
        let timeout = Duration::from_millis(self.config.dom_timeout_ms);

        match bounded(timeout, self.browser.element_rect(session_id, &query)).await {
            Ok(rect) if rect.is_usable() => LocatorResult::found(
                LocatorSource::Dom,
                rect.bounding_box().center().to_coordinate(),
                1.0,
            ),
            Ok(rect) if rect.found => {
                LocatorResult::not_found(LocatorSource::Dom, "element present but not visible")
            }
            Ok(_) => LocatorResult::not_found(LocatorSource::Dom, "no matching element"),
            Err(e) => {
                tracing::debug!("DOM locator failed: {e}");
                LocatorResult::not_found(LocatorSource::Dom, e)
            }
        }
    }
}

async fn locate_vision(
    slot: LocatorSource,
    locator: Option<&dyn VisionLocator>,
    query: &VisionQuery<'_>,
    timeout: Duration,
) -> LocatorResult {
    let Some(locator) = locator else {
        return LocatorResult::not_found(slot, "source not configured");
    };
    match bounded(timeout, locator.locate(query)).await {
        Ok(hit) if hit.found => LocatorResult::found(
            slot,
            Coordinate::new(hit.x, hit.y, locator.native_space()),
            hit.confidence,
        ),
        Ok(hit) => LocatorResult::not_found(slot, hit.reasoning.unwrap_or_default()),
        Err(e) => {
            tracing::debug!("{slot} locator failed: {e}");
            LocatorResult::not_found(slot, e)
        }
    }
}

/// Await `fut`, folding a timeout into the error string.
async fn bounded<T>(
    timeout: Duration,
    fut: impl Future<Output = anyhow::Result<T>>,
) -> Result<T, String> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("timed out after {}ms", timeout.as_millis())),
    }
}
