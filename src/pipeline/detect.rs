//! Text detection: normalise raw detector output into text regions.
//!
//! Detectors return either axis-aligned rectangles or polygons in
//! floating-point pixel coordinates. Both reduce to a [`BBox`] hull clamped
//! to the image. A box that is non-finite, has non-positive size or lies
//! entirely outside the image is a contract violation and fails the stage
//! with [`DetectionError::MalformedGeometry`]; nothing is silently dropped.

use crate::artifacts::ImageDimensions;
use crate::error::DetectionError;
use crate::geometry::BBox;
use crate::region::{FontWeight, IdAllocator, RegionKind, Rgb, Role, Stage, TextCase, TextRegion};
use async_trait::async_trait;
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One unrefined detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawBox {
    Rect { x: f64, y: f64, w: f64, h: f64 },
    Polygon { points: Vec<[f64; 2]> },
}

impl RawBox {
    pub fn rect(x: f64, y: f64, w: f64, h: f64) -> Self {
        RawBox::Rect { x, y, w, h }
    }
}

/// Text detector collaborator.
///
/// Must return boxes in a stable order for identical input; region IDs are
/// assigned in that order.
#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, image: &RgbaImage) -> Result<Vec<RawBox>, DetectionError>;
}

/// Validate and reduce raw boxes to clamped rectangles, preserving order.
pub fn normalize(raw: &[RawBox], dims: ImageDimensions) -> Result<Vec<BBox>, DetectionError> {
    raw.iter()
        .enumerate()
        .map(|(index, rb)| normalize_one(index, rb, dims))
        .collect()
}

fn normalize_one(index: usize, rb: &RawBox, dims: ImageDimensions) -> Result<BBox, DetectionError> {
    let malformed = |detail: String| DetectionError::MalformedGeometry { index, detail };
    match rb {
        RawBox::Rect { x, y, w, h } => {
            if ![x, y, w, h].iter().all(|v| v.is_finite()) {
                return Err(malformed(format!("non-finite rectangle ({x}, {y}, {w}, {h})")));
            }
            if *w <= 0.0 || *h <= 0.0 {
                return Err(malformed(format!("non-positive size {w}x{h}")));
            }
            let x0 = x.floor() as i64;
            let y0 = y.floor() as i64;
            let x1 = (x + w).ceil() as i64;
            let y1 = (y + h).ceil() as i64;
            dims.clamp(x0, y0, x1 - x0, y1 - y0).ok_or_else(|| {
                malformed(format!(
                    "rectangle ({x}, {y}, {w}, {h}) lies outside the {}x{} image",
                    dims.width, dims.height
                ))
            })
        }
        RawBox::Polygon { points } => {
            if points.len() < 3 {
                return Err(malformed(format!("polygon has {} points", points.len())));
            }
            BBox::from_polygon(points, dims.width, dims.height)
                .ok_or_else(|| malformed("polygon is degenerate or outside the image".into()))
        }
    }
}

/// Turn normalised boxes into text regions with IDs `text_0`, `text_1`, …
///
/// Attributes other than geometry start at defaults; classification fills
/// them in.
pub fn build_text_regions(boxes: &[BBox], default_font: &str, default_weight: FontWeight) -> Vec<TextRegion> {
    let mut ids = IdAllocator::new(RegionKind::Text);
    boxes
        .iter()
        .map(|bbox| {
            let id = ids.next_id();
            debug!("{} at {}", id, bbox);
            TextRegion {
                id,
                bbox: *bbox,
                created_by: Stage::Detected,
                text: String::new(),
                role: Role::Other,
                font: default_font.to_string(),
                weight: default_weight,
                color: Rgb::BLACK,
                text_case: TextCase::AsIs,
                font_size: None,
                removed: false,
            }
        })
        .collect()
}
