//! Coordinate systems and the conversions between them.
//!
//! Three spaces are in play:
//! - **normalized**: model-relative grid where both axes run `0..=999`
//! - **vendor-sdk**: pixel space reported by the automation vendor's SDK
//! - **viewport**: pixel space of the execution viewport (canonical)
//!
//! Only [`ViewportPoint`] supports distance and averaging, so a value has to
//! pass through [`Coordinate::to_viewport`] before it can be compared.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of the normalized grid. Model output in `0..=999` maps onto `0..width`.
pub const NORMALIZED_SCALE: f64 = 1000.0;
/// Largest value a normalized coordinate may hold.
pub const NORMALIZED_MAX: f64 = 999.0;

/// Tag naming the coordinate system a value was expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Space {
    Viewport,
    VendorSdk,
    Normalized,
}

impl Space {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Viewport => "viewport",
            Self::VendorSdk => "vendor-sdk",
            Self::Normalized => "normalized",
        }
    }
}

impl fmt::Display for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pixel dimensions of the execution viewport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// A space-tagged coordinate as reported by a locator or sent over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub x: f64,
    pub y: f64,
    pub space: Space,
}

impl Coordinate {
    pub fn new(x: f64, y: f64, space: Space) -> Self {
        Self { x, y, space }
    }

    pub fn viewport(x: f64, y: f64) -> Self {
        Self::new(x, y, Space::Viewport)
    }

    pub fn normalized(x: f64, y: f64) -> Self {
        Self::new(x, y, Space::Normalized)
    }

    pub fn vendor_sdk(x: f64, y: f64) -> Self {
        Self::new(x, y, Space::VendorSdk)
    }

    /// Convert into the canonical viewport space.
    pub fn to_viewport(self, viewport: Viewport) -> ViewportPoint {
        match self.space {
            Space::Viewport => ViewportPoint::new(self.x, self.y),
            Space::VendorSdk => vendor_sdk_to_viewport(self.x, self.y),
            Space::Normalized => normalized_to_viewport(self.x, self.y, viewport),
        }
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.0}, {:.0}) [{}]", self.x, self.y, self.space)
    }
}

/// A point in the canonical viewport space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewportPoint {
    pub x: f64,
    pub y: f64,
}

impl ViewportPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance in pixels.
    pub fn distance(self, other: Self) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    /// Clamp into `[0, width-1] x [0, height-1]`.
    pub fn clamp(self, viewport: Viewport) -> Self {
        let max_x = f64::from(viewport.width.saturating_sub(1));
        let max_y = f64::from(viewport.height.saturating_sub(1));
        Self {
            x: self.x.clamp(0.0, max_x),
            y: self.y.clamp(0.0, max_y),
        }
    }

    /// Round to whole pixels.
    pub fn rounded(self) -> Self {
        Self {
            x: self.x.round(),
            y: self.y.round(),
        }
    }

    pub fn to_coordinate(self) -> Coordinate {
        Coordinate::viewport(self.x, self.y)
    }
}

impl fmt::Display for ViewportPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.0}, {:.0})", self.x, self.y)
    }
}

/// Axis-aligned rectangle in viewport pixels (origin = top-left).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn center(&self) -> ViewportPoint {
        ViewportPoint::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }
}

/// Map a `0..=999` model coordinate onto viewport pixels.
pub fn normalized_to_viewport(x: f64, y: f64, viewport: Viewport) -> ViewportPoint {
    let x = x.clamp(0.0, NORMALIZED_MAX);
    let y = y.clamp(0.0, NORMALIZED_MAX);
    ViewportPoint::new(
        x / NORMALIZED_SCALE * f64::from(viewport.width),
        y / NORMALIZED_SCALE * f64::from(viewport.height),
    )
}

/// Vendor SDK pixels currently coincide with viewport pixels.
pub fn vendor_sdk_to_viewport(x: f64, y: f64) -> ViewportPoint {
    ViewportPoint::new(x, y)
}

/// Map viewport pixels back onto the `0..=999` model grid.
pub fn viewport_to_normalized(point: ViewportPoint, viewport: Viewport) -> Coordinate {
    let scale = |value: f64, extent: u32| {
        if extent == 0 {
            return 0.0;
        }
        (value / f64::from(extent) * NORMALIZED_SCALE)
            .round()
            .clamp(0.0, NORMALIZED_MAX)
    };
    Coordinate::normalized(
        scale(point.x, viewport.width),
        scale(point.y, viewport.height),
    )
}

/// Arithmetic mean of a set of points. `None` for an empty slice.
pub fn average(points: &[ViewportPoint]) -> Option<ViewportPoint> {
    if points.is_empty() {
        return None;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = points.len() as f64;
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
    Some(ViewportPoint::new(sx / n, sy / n))
}
