use crate::coords::{BoundingBox, Coordinate, Viewport};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A remote browser session as reported by the automation service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    #[serde(default)]
    pub url: Option<String>,
}

/// Screenshot of the current viewport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Screenshot {
    /// Base64-encoded image bytes (PNG or JPEG).
    pub image_base64: String,
    pub width: u32,
    pub height: u32,
}

impl Screenshot {
    pub fn viewport(&self) -> Viewport {
        Viewport::new(self.width, self.height)
    }

    /// Size of the decoded image payload in bytes.
    pub fn decoded_len(&self) -> anyhow::Result<usize> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(self.image_base64.trim())
            .map_err(|e| anyhow::anyhow!("Screenshot is not valid base64: {e}"))?;
        Ok(bytes.len())
    }
}

/// How to look an element up in the DOM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum ElementQuery {
    Selector { selector: String },
    Text { text: String },
    Role { role: String, name: Option<String> },
}

impl ElementQuery {
    pub fn selector(selector: impl Into<String>) -> Self {
        Self::Selector {
            selector: selector.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// DOM element rectangle in viewport pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ElementRect {
    pub found: bool,
    #[serde(default)]
    pub visible: bool,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
}

impl ElementRect {
    pub fn bounding_box(&self) -> BoundingBox {
        BoundingBox {
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
        }
    }

    /// Present, visible and with a non-empty box.
    pub fn is_usable(&self) -> bool {
        self.found && self.visible && !self.bounding_box().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

impl fmt::Display for ScrollDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Left => "left",
            Self::Right => "right",
        })
    }
}

/// A side effect to apply in the remote browser.
#[derive(Debug, Clone, PartialEq)]
pub enum BrowserAction {
    Navigate {
        url: String,
    },
    Click {
        at: Coordinate,
    },
    Type {
        at: Coordinate,
        text: String,
    },
    Scroll {
        at: Coordinate,
        direction: ScrollDirection,
        amount: u32,
    },
    Keypress {
        at: Option<Coordinate>,
        key: String,
    },
}

impl BrowserAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Navigate { .. } => "navigate",
            Self::Click { .. } => "click",
            Self::Type { .. } => "type",
            Self::Scroll { .. } => "scroll",
            Self::Keypress { .. } => "keypress",
        }
    }

    pub fn coordinate(&self) -> Option<Coordinate> {
        match self {
            Self::Navigate { .. } => None,
            Self::Click { at } | Self::Type { at, .. } | Self::Scroll { at, .. } => Some(*at),
            Self::Keypress { at, .. } => *at,
        }
    }
}

/// Result of applying a [`BrowserAction`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,
    /// Page URL after the action, when the service reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ActionOutcome {
    pub fn ok(url: Option<String>) -> Self {
        Self {
            success: true,
            url,
            error: None,
            data: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            url: None,
            error: Some(error.into()),
            data: None,
        }
    }
}

/// Façade over the remote browser-automation service.
///
/// Implementations must be safe to share; the orchestrator is the only
/// caller that mutates session state.
#[async_trait]
pub trait BrowserToolClient: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    /// Start a new remote session, optionally opening `start_url`.
    async fn start_session(&self, start_url: Option<&str>) -> anyhow::Result<SessionInfo>;

    /// Close a remote session.
    async fn stop_session(&self, session_id: &str) -> anyhow::Result<()>;

    /// Capture the current viewport.
    async fn screenshot(&self, session_id: &str) -> anyhow::Result<Screenshot>;

    /// Look an element up in the DOM and report its rectangle.
    async fn element_rect(
        &self,
        session_id: &str,
        query: &ElementQuery,
    ) -> anyhow::Result<ElementRect>;

    /// Apply a side effect. Transport failures are `Err`; the service
    /// refusing the action is `Ok` with `success == false`.
    async fn perform(
        &self,
        session_id: &str,
        action: &BrowserAction,
    ) -> anyhow::Result<ActionOutcome>;

    /// Check if the service is reachable
    async fn health_check(&self) -> bool {
        true
    }
}
