//! Integer pixel geometry shared by every stage.
//!
//! All regions live in source-image pixel space with the origin at the
//! top-left corner. A [`BBox`] is never empty and never negative: values
//! coming from collaborators or editing clients go through
//! [`BBox::clamped`] before they enter the data model.
//!
//! Areas are computed in `u64` so a full-frame region on a very large
//! image cannot overflow.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default coverage ratio for [`contains`]: a box "backs" a text region when
/// it covers at least 90% of the region's area.
pub const DEFAULT_CONTAINMENT: f64 = 0.9;

/// Axis-aligned rectangle in source-image pixels.
///
/// Deserialising rejects zero width or height, so a hand-edited report
/// cannot smuggle in an empty box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawBBox")]
pub struct BBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Deserialize)]
struct RawBBox {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

impl TryFrom<RawBBox> for BBox {
    type Error = String;

    fn try_from(r: RawBBox) -> Result<Self, Self::Error> {
        BBox::new(r.x, r.y, r.width, r.height)
            .ok_or_else(|| format!("bbox at ({}, {}) has empty size {}x{}", r.x, r.y, r.width, r.height))
    }
}

impl BBox {
    /// Construct a box. Returns `None` for zero width or height.
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Option<Self> {
        if width == 0 || height == 0 {
            return None;
        }
        Some(Self {
            x,
            y,
            width,
            height,
        })
    }

    /// Exclusive right edge.
    pub fn right(&self) -> u64 {
        self.x as u64 + self.width as u64
    }

    /// Exclusive bottom edge.
    pub fn bottom(&self) -> u64 {
        self.y as u64 + self.height as u64
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Clamp a signed rectangle to an image of `img_w × img_h` pixels.
    ///
    /// Negative origins are pulled to zero and extents past the right or
    /// bottom edge are cut. Returns `None` when nothing of the rectangle is
    /// left inside the image.
    pub fn clamped(x: i64, y: i64, width: i64, height: i64, img_w: u32, img_h: u32) -> Option<Self> {
        if width <= 0 || height <= 0 {
            return None;
        }
        let x0 = x.max(0);
        let y0 = y.max(0);
        let x1 = x.saturating_add(width).min(img_w as i64);
        let y1 = y.saturating_add(height).min(img_h as i64);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Self::new(x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32)
    }

    /// Whether the box lies entirely inside an image of the given size.
    pub fn fits_within(&self, img_w: u32, img_h: u32) -> bool {
        self.right() <= img_w as u64 && self.bottom() <= img_h as u64
    }

    /// Translate by a signed delta, keeping the size where possible.
    ///
    /// The result is clamped to the image, so a box dragged half off-canvas
    /// shrinks instead of wrapping.
    pub fn translated(&self, dx: i64, dy: i64, img_w: u32, img_h: u32) -> Option<Self> {
        Self::clamped(
            self.x as i64 + dx,
            self.y as i64 + dy,
            self.width as i64,
            self.height as i64,
            img_w,
            img_h,
        )
    }

    /// Axis-aligned bounding rectangle of a polygon, clamped to the image.
    ///
    /// Detectors such as CRAFT report quadrilaterals; the data model only
    /// needs their rectangular hull. Coordinates are floored/ceiled so the
    /// hull always encloses every vertex.
    pub fn from_polygon(points: &[[f64; 2]], img_w: u32, img_h: u32) -> Option<Self> {
        if points.iter().any(|p| !p[0].is_finite() || !p[1].is_finite()) {
            return None;
        }
        let min_x = points.iter().map(|p| p[0]).fold(f64::INFINITY, f64::min);
        let min_y = points.iter().map(|p| p[1]).fold(f64::INFINITY, f64::min);
        let max_x = points.iter().map(|p| p[0]).fold(f64::NEG_INFINITY, f64::max);
        let max_y = points.iter().map(|p| p[1]).fold(f64::NEG_INFINITY, f64::max);
        if !min_x.is_finite() {
            return None;
        }
        let x = min_x.floor() as i64;
        let y = min_y.floor() as i64;
        let w = max_x.ceil() as i64 - x;
        let h = max_y.ceil() as i64 - y;
        Self::clamped(x, y, w, h, img_w, img_h)
    }

    /// Overlapping rectangle of two boxes, if any.
    pub fn intersection(&self, other: &BBox) -> Option<BBox> {
        let x0 = self.x.max(other.x) as u64;
        let y0 = self.y.max(other.y) as u64;
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        BBox::new(x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32)
    }

    /// Does this box contain the pixel at `(px, py)`?
    pub fn contains_point(&self, px: u32, py: u32) -> bool {
        px >= self.x && (px as u64) < self.right() && py >= self.y && (py as u64) < self.bottom()
    }
}

impl fmt::Display for BBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@({},{})", self.width, self.height, self.x, self.y)
    }
}

// ── Free functions ───────────────────────────────────────────────────────

pub fn area(bbox: &BBox) -> u64 {
    bbox.area()
}

pub fn intersection_area(a: &BBox, b: &BBox) -> u64 {
    a.intersection(b).map_or(0, |r| r.area())
}

/// Intersection over union in `[0, 1]`.
pub fn iou(a: &BBox, b: &BBox) -> f64 {
    let inter = intersection_area(a, b);
    let union = a.area() + b.area() - inter;
    if union == 0 {
        return 0.0;
    }
    inter as f64 / union as f64
}

/// True when `outer` covers at least `tolerance` of `inner`'s area.
///
/// Coverage is measured against the *inner* region only, so a large panel
/// that fully encloses a small label qualifies even though their IoU is tiny.
/// `tolerance` is resolved to parts per million and compared in integers.
pub fn contains(outer: &BBox, inner: &BBox, tolerance: f64) -> bool {
    const PPM: u128 = 1_000_000;
    let inner_area = inner.area() as u128;
    if inner_area == 0 {
        return false;
    }
    let ppm = (tolerance.clamp(0.0, 1.0) * PPM as f64).round() as u128;
    intersection_area(outer, inner) as u128 * PPM >= ppm * inner_area
}
