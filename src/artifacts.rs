//! The per-run artifact set and its identifier.
//!
//! A [`RunArtifactSet`] is the value object every stage reads and the
//! orchestrator persists. Stage functions take it by reference and return
//! their additions; only the orchestrator writes it to disk. Once a run is
//! composed, the set is serialised as `report.json`, which is also the
//! document an editing client reads back.

use crate::geometry::BBox;
use crate::region::{BoxRegion, RegionId, Stage, TextRegion};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ── Run identifier ───────────────────────────────────────────────────────

/// Unique, creation-time-sortable run identifier.
///
/// Format: `run_<UTC yyyymmddTHHMMSSmmm>_<8 hex>`. The timestamp gives
/// lexical creation order; the random suffix keeps two runs started in the
/// same millisecond apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn generate() -> Self {
        let ts = Utc::now().format("%Y%m%dT%H%M%S%3f");
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("run_{}_{}", ts, &suffix[..8]))
    }

    /// Accept an externally supplied ID (CLI argument, API path segment).
    ///
    /// Rejects anything that could escape the output root.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let safe = !s.is_empty()
            && s != "."
            && s != ".."
            && s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
        safe.then(|| Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Supporting records ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDimensions {
    pub width: u32,
    pub height: u32,
}

impl ImageDimensions {
    /// Clamp a signed rectangle to these dimensions.
    pub fn clamp(&self, x: i64, y: i64, w: i64, h: i64) -> Option<BBox> {
        BBox::clamped(x, y, w, h, self.width, self.height)
    }

    /// Largest text size that may be drawn on this canvas. Glyph rasters
    /// scale with the square of the pixel size.
    pub fn max_font_px(&self) -> u32 {
        self.height.max(1).saturating_mul(2)
    }
}

/// Paths of the generated layer rasters, relative to the run directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRefs {
    pub background_clean: String,
    pub text_layer: String,
    pub ui_layer: String,
}

impl Default for LayerRefs {
    fn default() -> Self {
        Self {
            background_clean: "layers/background_clean.png".into(),
            text_layer: "layers/text_layer.png".into(),
            ui_layer: "layers/ui_layer.png".into(),
        }
    }
}

// ── Artifact set ─────────────────────────────────────────────────────────

/// Everything a run has produced so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunArtifactSet {
    pub run_id: RunId,
    /// Original input (file name or URL) as supplied by the caller.
    pub source_name: String,
    /// Normalised source raster, relative to the run directory.
    pub source_image: String,
    pub dimensions: ImageDimensions,
    /// Furthest stage whose artifacts are present.
    pub stage: Stage,
    #[serde(default)]
    pub text_regions: Vec<TextRegion>,
    #[serde(default)]
    pub box_regions: Vec<BoxRegion>,
    #[serde(default)]
    pub layers: Option<LayerRefs>,
    #[serde(default)]
    pub final_composed: Option<String>,
    /// Incremented on every committed edit.
    #[serde(default)]
    pub revision: u64,
}

impl RunArtifactSet {
    pub fn new(run_id: RunId, source_name: impl Into<String>, dimensions: ImageDimensions) -> Self {
        Self {
            run_id,
            source_name: source_name.into(),
            source_image: "source.png".into(),
            dimensions,
            stage: Stage::Created,
            text_regions: Vec::new(),
            box_regions: Vec::new(),
            layers: None,
            final_composed: None,
            revision: 0,
        }
    }

    pub fn text(&self, id: &RegionId) -> Option<&TextRegion> {
        self.text_regions.iter().find(|t| &t.id == id)
    }

    pub fn text_mut(&mut self, id: &RegionId) -> Option<&mut TextRegion> {
        self.text_regions.iter_mut().find(|t| &t.id == id)
    }

    pub fn box_region(&self, id: &RegionId) -> Option<&BoxRegion> {
        self.box_regions.iter().find(|b| &b.id == id)
    }

    pub fn box_region_mut(&mut self, id: &RegionId) -> Option<&mut BoxRegion> {
        self.box_regions.iter_mut().find(|b| &b.id == id)
    }

    /// Resolve a box's weak text reference.
    ///
    /// Returns `None` for unassociated boxes and for stale references; a
    /// soft-deleted text region still resolves.
    pub fn associated_text(&self, b: &BoxRegion) -> Option<&TextRegion> {
        b.associated_text_id.as_ref().and_then(|id| self.text(id))
    }

    /// First region whose bbox reaches past the image edges.
    pub fn out_of_bounds_region(&self) -> Option<&RegionId> {
        let (w, h) = (self.dimensions.width, self.dimensions.height);
        self.text_regions
            .iter()
            .filter(|t| !t.bbox.fits_within(w, h))
            .map(|t| &t.id)
            .chain(
                self.box_regions
                    .iter()
                    .filter(|b| !b.bbox.fits_within(w, h))
                    .map(|b| &b.id),
            )
            .next()
    }

    /// Text regions that composition will draw, in stored order.
    pub fn visible_texts(&self) -> impl Iterator<Item = &TextRegion> {
        self.text_regions.iter().filter(|t| t.is_visible())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{FontWeight, RegionKind, Rgb, Role, TextCase};

    fn text(idx: usize, label: &str) -> TextRegion {
        TextRegion {
            id: RegionId::new(RegionKind::Text, idx),
            bbox: BBox::new(0, 0, 10, 10).unwrap(),
            created_by: Stage::Detected,
            text: label.into(),
            role: Role::Body,
            font: "Roboto".into(),
            weight: FontWeight::REGULAR,
            color: Rgb::BLACK,
            text_case: TextCase::AsIs,
            font_size: None,
            removed: false,
        }
    }

    #[test]
    fn run_ids_sort_by_creation() {
        let a = RunId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = RunId::generate();
        assert!(a < b, "{a} should sort before {b}");
        assert!(a.as_str().starts_with("run_"));
        assert_eq!(a.as_str().len(), "run_20240101T000000000_abcdef01".len());
    }

    #[test]
    fn run_id_parse_rejects_traversal() {
        assert!(RunId::parse("run_20240101T000000000_abcdef01").is_some());
        assert!(RunId::parse("../etc").is_none());
        assert!(RunId::parse("a/b").is_none());
        assert!(RunId::parse("..").is_none());
        assert!(RunId::parse("").is_none());
    }

    #[test]
    fn weak_reference_survives_soft_delete() {
        let mut set = RunArtifactSet::new(
            RunId::parse("run_x").unwrap(),
            "in.png",
            ImageDimensions {
                width: 100,
                height: 100,
            },
        );
        let mut t = text(0, "");
        t.removed = true;
        set.text_regions.push(t);
        set.text_regions.push(text(1, "Buy"));
        let b = BoxRegion {
            id: RegionId::new(RegionKind::Box, 0),
            bbox: BBox::new(0, 0, 20, 20).unwrap(),
            created_by: Stage::BoxesAssociated,
            color: Rgb::WHITE,
            associated_text_id: Some(RegionId::from("text_0")),
        };
        assert_eq!(set.associated_text(&b).map(|t| t.id.as_str()), Some("text_0"));
        assert_eq!(set.visible_texts().count(), 1);

        let stale = BoxRegion {
            associated_text_id: Some(RegionId::from("text_42")),
            ..b
        };
        assert!(set.associated_text(&stale).is_none());
    }

    #[test]
    fn report_roundtrips_through_json() {
        let mut set = RunArtifactSet::new(
            RunId::generate(),
            "https://example.com/banner.jpg",
            ImageDimensions {
                width: 640,
                height: 480,
            },
        );
        set.text_regions.push(text(0, "Sale"));
        set.layers = Some(LayerRefs::default());
        let json = serde_json::to_string_pretty(&set).unwrap();
        let back: RunArtifactSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }
}
