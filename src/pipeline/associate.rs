//! Box association: link detected background/CTA boxes to the text regions
//! they visually back.
//!
//! For each box, every non-removed text region it contains (coverage of the
//! text's area at or above the tolerance) is a candidate. The smallest
//! candidate wins, then the lower numeric ID. Afterwards each text region
//! keeps only its tightest box: when several boxes picked the same text
//! (a button nested in a panel), the smallest box keeps the link and the
//! others become unassociated decoration.

use crate::artifacts::ImageDimensions;
use crate::error::AssociationError;
use crate::geometry::{contains, BBox};
use crate::pipeline::layer::LayerSet;
use crate::region::{BoxRegion, IdAllocator, RegionId, RegionKind, Rgb, Stage, TextRegion};
use async_trait::async_trait;
use image::{GrayImage, Luma, RgbaImage};
use imageproc::region_labelling::{connected_components, Connectivity};
use std::collections::HashMap;
use tracing::debug;

/// Finds candidate boxes once layers exist.
#[async_trait]
pub trait BoxDetector: Send + Sync {
    async fn detect_boxes(&self, source: &RgbaImage, layers: &LayerSet) -> Result<Vec<BBox>, AssociationError>;
}

/// Boxes are the opaque connected components of the UI layer.
#[derive(Debug, Clone, Copy)]
pub struct UiLayerBoxDetector {
    /// Pixels with alpha above this count as opaque.
    pub alpha_threshold: u8,
    /// Components with fewer opaque pixels are ignored (specks, anti-aliasing).
    pub min_area: u64,
}

impl Default for UiLayerBoxDetector {
    fn default() -> Self {
        Self {
            alpha_threshold: 16,
            min_area: 64,
        }
    }
}

#[async_trait]
impl BoxDetector for UiLayerBoxDetector {
    async fn detect_boxes(&self, _source: &RgbaImage, layers: &LayerSet) -> Result<Vec<BBox>, AssociationError> {
        let ui = layers.ui_layer.clone();
        let (threshold, min_area) = (self.alpha_threshold, self.min_area);
        tokio::task::spawn_blocking(move || find_opaque_components(&ui, threshold, min_area))
            .await
            .map_err(|e| AssociationError::DetectorFailed {
                detail: format!("labelling task panicked: {e}"),
            })
    }
}

/// Bounding boxes of the 8-connected opaque regions of `ui`, ordered
/// top-to-bottom then left-to-right.
pub fn find_opaque_components(ui: &RgbaImage, alpha_threshold: u8, min_area: u64) -> Vec<BBox> {
    let (w, h) = ui.dimensions();
    let mask = GrayImage::from_fn(w, h, |x, y| {
        if ui.get_pixel(x, y)[3] > alpha_threshold {
            Luma([255u8])
        } else {
            Luma([0u8])
        }
    });
    let labeled = connected_components(&mask, Connectivity::Eight, Luma([0u8]));

    // label -> (min_x, min_y, max_x, max_y, pixel count)
    let mut regions: HashMap<u32, (u32, u32, u32, u32, u64)> = HashMap::new();
    for (x, y, label) in labeled.enumerate_pixels() {
        let label = label[0];
        if label == 0 {
            continue;
        }
        regions
            .entry(label)
            .and_modify(|(min_x, min_y, max_x, max_y, count)| {
                *min_x = (*min_x).min(x);
                *min_y = (*min_y).min(y);
                *max_x = (*max_x).max(x);
                *max_y = (*max_y).max(y);
                *count += 1;
            })
            .or_insert((x, y, x, y, 1));
    }

    let mut boxes: Vec<BBox> = regions
        .into_values()
        .filter(|r| r.4 >= min_area)
        .filter_map(|(min_x, min_y, max_x, max_y, _)| BBox::new(min_x, min_y, max_x - min_x + 1, max_y - min_y + 1))
        .collect();
    boxes.sort_by_key(|b| (b.y, b.x, b.height, b.width));
    boxes
}

/// Every box must lie inside the image.
pub fn validate_boxes(boxes: &[BBox], dims: ImageDimensions) -> Result<(), AssociationError> {
    for (index, b) in boxes.iter().enumerate() {
        if !b.fits_within(dims.width, dims.height) {
            return Err(AssociationError::MalformedGeometry {
                index,
                detail: format!("{} exceeds the {}x{} image", b, dims.width, dims.height),
            });
        }
    }
    Ok(())
}

/// Sort key for tie-breaks: numeric ID index, then the raw ID.
fn id_key(id: &RegionId) -> (usize, &str) {
    (id.index().unwrap_or(usize::MAX), id.as_str())
}

/// The text region each box backs, index-aligned with `boxes`.
pub fn associate(boxes: &[BBox], texts: &[TextRegion], tolerance: f64) -> Vec<Option<RegionId>> {
    // Each box picks its tightest containing text.
    let mut picks: Vec<Option<&TextRegion>> = boxes
        .iter()
        .map(|b| {
            texts
                .iter()
                .filter(|t| !t.removed && contains(b, &t.bbox, tolerance))
                .min_by(|a, c| {
                    a.bbox
                        .area()
                        .cmp(&c.bbox.area())
                        .then_with(|| id_key(&a.id).cmp(&id_key(&c.id)))
                })
        })
        .collect();

    // Each text keeps only its smallest box; ties go to the earlier box.
    let mut owner: HashMap<&RegionId, usize> = HashMap::new();
    for (i, pick) in picks.iter().enumerate() {
        let Some(t) = *pick else { continue };
        let held = owner
            .get(&t.id)
            .is_some_and(|&j| boxes[j].area() <= boxes[i].area());
        if !held {
            owner.insert(&t.id, i);
        }
    }
    for (i, pick) in picks.iter_mut().enumerate() {
        if let Some(t) = *pick {
            if owner.get(&t.id) != Some(&i) {
                debug!("box #{} loses {} to a tighter box", i, t.id);
                *pick = None;
            }
        }
    }

    picks.into_iter().map(|p| p.map(|t| t.id.clone())).collect()
}

/// Mean source colour inside `bbox`, ignoring pixels under `exclude`.
///
/// Falls back to every pixel of the box when the exclusion covers it.
pub fn sample_color(source: &RgbaImage, bbox: &BBox, exclude: Option<&BBox>) -> Rgb {
    let (iw, ih) = source.dimensions();
    let x_end = (bbox.right() as u32).min(iw);
    let y_end = (bbox.bottom() as u32).min(ih);

    let mean = |skip: Option<&BBox>| -> Option<Rgb> {
        let (mut r, mut g, mut b, mut n) = (0u64, 0u64, 0u64, 0u64);
        for y in bbox.y..y_end {
            for x in bbox.x..x_end {
                if skip.is_some_and(|s| s.contains_point(x, y)) {
                    continue;
                }
                let p = source.get_pixel(x, y);
                r += p[0] as u64;
                g += p[1] as u64;
                b += p[2] as u64;
                n += 1;
            }
        }
        (n > 0).then(|| Rgb::new(((r + n / 2) / n) as u8, ((g + n / 2) / n) as u8, ((b + n / 2) / n) as u8))
    };

    mean(exclude).or_else(|| mean(None)).unwrap_or(Rgb::WHITE)
}

/// Associate, sample colours and assign `box_0`, `box_1`, … in box order.
pub fn build_box_regions(
    source: &RgbaImage,
    boxes: &[BBox],
    texts: &[TextRegion],
    tolerance: f64,
) -> Vec<BoxRegion> {
    let links = associate(boxes, texts, tolerance);
    let mut ids = IdAllocator::new(RegionKind::Box);
    boxes
        .iter()
        .zip(links)
        .map(|(bbox, link)| {
            let exclude = link
                .as_ref()
                .and_then(|id| texts.iter().find(|t| &t.id == id))
                .map(|t| t.bbox);
            let id = ids.next_id();
            let color = sample_color(source, bbox, exclude.as_ref());
            debug!(
                "{} at {} colour {} -> {}",
                id,
                bbox,
                color.to_hex(),
                link.as_ref().map_or("none", |l| l.as_str())
            );
            BoxRegion {
                id,
                bbox: *bbox,
                created_by: Stage::BoxesAssociated,
                color,
                associated_text_id: link,
            }
        })
        .collect()
}
