//! Region overrides submitted by an editing client.
//!
//! An [`EditSet`] never touches a stored artifact set in place:
//! [`EditSet::apply`] clones the base, applies each override and returns the
//! new set together with any per-region problems. Whether the result becomes
//! the canonical state is the orchestrator's decision (commit vs preview).

use crate::artifacts::RunArtifactSet;
use crate::error::CompositionError;
use crate::geometry::BBox;
use crate::region::{FontWeight, RegionId, Rgb, Role, TextCase};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

/// Signed rectangle as sent by an editor. May lie partly off-canvas; it is
/// clamped to the image before entering the data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditBBox {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
}

impl From<BBox> for EditBBox {
    fn from(b: BBox) -> Self {
        Self {
            x: b.x as i64,
            y: b.y as i64,
            width: b.width as i64,
            height: b.height as i64,
        }
    }
}

/// New attribute values for one text region. `None` leaves a field unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextOverride {
    pub id: RegionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbox: Option<EditBBox>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub font: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<FontWeight>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<Rgb>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_case: Option<TextCase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub font_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removed: Option<bool>,
}

impl TextOverride {
    pub fn new(id: impl Into<RegionId>) -> Self {
        Self {
            id: id.into(),
            text: None,
            bbox: None,
            font: None,
            weight: None,
            color: None,
            role: None,
            text_case: None,
            font_size: None,
            removed: None,
        }
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn bbox(mut self, x: i64, y: i64, width: i64, height: i64) -> Self {
        self.bbox = Some(EditBBox {
            x,
            y,
            width,
            height,
        });
        self
    }

    pub fn font(mut self, family: impl Into<String>, weight: FontWeight) -> Self {
        self.font = Some(family.into());
        self.weight = Some(weight);
        self
    }

    pub fn color(mut self, color: Rgb) -> Self {
        self.color = Some(color);
        self
    }

    pub fn font_size(mut self, px: u32) -> Self {
        self.font_size = Some(px);
        self
    }
}

/// New bbox and/or fill colour for one box region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxOverride {
    pub id: RegionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbox: Option<EditBBox>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<Rgb>,
}

impl BoxOverride {
    pub fn new(id: impl Into<RegionId>) -> Self {
        Self {
            id: id.into(),
            bbox: None,
            color: None,
        }
    }

    pub fn bbox(mut self, x: i64, y: i64, width: i64, height: i64) -> Self {
        self.bbox = Some(EditBBox {
            x,
            y,
            width,
            height,
        });
        self
    }

    pub fn color(mut self, color: Rgb) -> Self {
        self.color = Some(color);
        self
    }
}

/// All overrides of one editing round trip.
///
/// Overrides for the same ID are applied in order, so the last one wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditSet {
    pub text: Vec<TextOverride>,
    pub boxes: Vec<BoxOverride>,
}

impl EditSet {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.boxes.is_empty()
    }

    /// Apply every override to a copy of `base`.
    ///
    /// Never fails as a whole. Overrides naming an unknown region, and
    /// bboxes that end up entirely off-canvas, are reported and skipped;
    /// the rest still apply. With `sync_box_moves`, a box associated with a
    /// moved text region follows the move unless the same edit set gives
    /// that box its own bbox.
    pub fn apply(
        &self,
        base: &RunArtifactSet,
        sync_box_moves: bool,
    ) -> (RunArtifactSet, Vec<CompositionError>) {
        let mut out = base.clone();
        let mut issues = Vec::new();
        let dims = base.dimensions;

        // ── Boxes first, so sync knows which ones were placed explicitly ──
        let mut placed_boxes: HashSet<RegionId> = HashSet::new();
        for ov in &self.boxes {
            let id = ov.id.clone();
            let Some(region) = out.box_region_mut(&id) else {
                issues.push(CompositionError::UnknownRegion { region: id });
                continue;
            };
            if let Some(eb) = ov.bbox {
                match dims.clamp(eb.x, eb.y, eb.width, eb.height) {
                    Some(bbox) => {
                        region.bbox = bbox;
                        placed_boxes.insert(id.clone());
                    }
                    None => issues.push(CompositionError::RegionOutOfBounds {
                        region: id.clone(),
                        width: dims.width,
                        height: dims.height,
                    }),
                }
            }
            if let Some(color) = ov.color {
                region.color = color;
            }
        }

        // ── Text ──
        let mut moves: Vec<(RegionId, i64, i64)> = Vec::new();
        for ov in &self.text {
            let id = ov.id.clone();
            let Some(region) = out.text_mut(&id) else {
                issues.push(CompositionError::UnknownRegion { region: id });
                continue;
            };
            if let Some(text) = &ov.text {
                region.text = text.clone();
            }
            if let Some(eb) = ov.bbox {
                match dims.clamp(eb.x, eb.y, eb.width, eb.height) {
                    Some(bbox) => {
                        let dx = bbox.x as i64 - region.bbox.x as i64;
                        let dy = bbox.y as i64 - region.bbox.y as i64;
                        region.bbox = bbox;
                        if dx != 0 || dy != 0 {
                            moves.push((id.clone(), dx, dy));
                        }
                    }
                    None => issues.push(CompositionError::RegionOutOfBounds {
                        region: id.clone(),
                        width: dims.width,
                        height: dims.height,
                    }),
                }
            }
            if let Some(font) = &ov.font {
                region.font = font.clone();
            }
            if let Some(weight) = ov.weight {
                region.weight = weight;
            }
            if let Some(color) = ov.color {
                region.color = color;
            }
            if let Some(role) = ov.role {
                region.role = role;
            }
            if let Some(case) = ov.text_case {
                region.text_case = case;
            }
            match ov.font_size {
                Some(0) => issues.push(CompositionError::InvalidOverride {
                    region: id.clone(),
                    detail: "font_size must be at least 1px".into(),
                }),
                Some(px) if px > dims.max_font_px() => issues.push(CompositionError::InvalidOverride {
                    region: id.clone(),
                    detail: format!("font_size {px}px exceeds the {}px limit for this image", dims.max_font_px()),
                }),
                Some(px) => region.font_size = Some(px),
                None => {}
            }
            if let Some(removed) = ov.removed {
                region.removed = removed;
            }
        }

        // ── Drag associated boxes along with moved text ──
        if sync_box_moves {
            for (text_id, dx, dy) in &moves {
                for b in out.box_regions.iter_mut() {
                    if b.associated_text_id.as_ref() != Some(text_id) || placed_boxes.contains(&b.id)
                    {
                        continue;
                    }
                    match b.bbox.translated(*dx, *dy, dims.width, dims.height) {
                        Some(bbox) => {
                            debug!("{} follows {} by ({}, {})", b.id, text_id, dx, dy);
                            b.bbox = bbox;
                        }
                        None => issues.push(CompositionError::RegionOutOfBounds {
                            region: b.id.clone(),
                            width: dims.width,
                            height: dims.height,
                        }),
                    }
                }
            }
        }

        (out, issues)
    }
}
