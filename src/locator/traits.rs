use crate::coords::{Coordinate, Space, Viewport};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the three independent ways of estimating an element's position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LocatorSource {
    Dom,
    VisionA,
    VisionB,
}

impl LocatorSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dom => "dom",
            Self::VisionA => "visionA",
            Self::VisionB => "visionB",
        }
    }
}

impl fmt::Display for LocatorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a source thinks the element is, if anywhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Location {
    Found { at: Coordinate },
    NotFound { reason: Option<String> },
}

/// A single source's answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocatorResult {
    pub source: LocatorSource,
    pub location: Location,
    /// Source-reported confidence in `0..=1`.
    pub confidence: f64,
}

impl LocatorResult {
    pub fn found(source: LocatorSource, at: Coordinate, confidence: f64) -> Self {
        Self {
            source,
            location: Location::Found { at },
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    pub fn not_found(source: LocatorSource, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            source,
            location: Location::NotFound {
                reason: (!reason.is_empty()).then_some(reason),
            },
            confidence: 0.0,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self.location, Location::Found { .. })
    }

    pub fn coordinate(&self) -> Option<Coordinate> {
        match self.location {
            Location::Found { at } => Some(at),
            Location::NotFound { .. } => None,
        }
    }
}

/// Input handed to a vision service.
#[derive(Debug, Clone, Copy)]
pub struct VisionQuery<'a> {
    pub image_base64: &'a str,
    pub target: &'a str,
    pub context: Option<&'a str>,
    pub viewport: Viewport,
}

/// A vision service's raw answer, in its native coordinate space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionHit {
    pub found: bool,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: Option<String>,
}

/// A vision model that estimates where a described element is on a screenshot.
#[async_trait]
pub trait VisionLocator: Send + Sync {
    /// Which vision slot this locator fills.
    fn source(&self) -> LocatorSource;

    /// Coordinate space the service answers in.
    fn native_space(&self) -> Space;

    async fn locate(&self, query: &VisionQuery<'_>) -> anyhow::Result<VisionHit>;
}
