//! Composition: merge the clean background, box fills and text into one
//! raster.
//!
//! Z-order is fixed, back to front:
//!
//! 1. the cleaned background layer
//! 2. every [`BoxRegion`] as a filled rectangle, in stored order
//! 3. every visible [`TextRegion`], in stored order
//!
//! Text is drawn single-line, centred in its bbox. The pixel size is the
//! region's explicit `font_size` or `round(bbox.height × font_size_ratio)`,
//! capped at [`ImageDimensions::max_font_px`].
//!
//! Composition never touches the artifact set it is given. Per-region
//! problems (missing font) are collected as [`CompositionError`] issues and
//! the rest of the image is still produced.

use crate::artifacts::{ImageDimensions, RunArtifactSet};
use crate::error::CompositionError;
use crate::pipeline::fonts::{FontHandle, FontResolver};
use crate::region::{BoxRegion, FontWeight, TextRegion};
use ab_glyph::{Font, PxScale, ScaleFont};
use image::RgbaImage;
use imageproc::drawing::{draw_filled_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use tracing::{debug, warn};

/// Rendering parameters shared by every region.
#[derive(Debug, Clone)]
pub struct CompositionOptions {
    pub font_size_ratio: f32,
    pub default_family: String,
    pub default_weight: FontWeight,
}

impl Default for CompositionOptions {
    fn default() -> Self {
        Self {
            font_size_ratio: 0.7,
            default_family: "Roboto".to_string(),
            default_weight: FontWeight::REGULAR,
        }
    }
}

/// Pixel size a region's text is drawn at.
pub fn font_px(region: &TextRegion, ratio: f32, dims: ImageDimensions) -> u32 {
    region
        .font_size
        .unwrap_or_else(|| (region.bbox.height as f32 * ratio).round() as u32)
        .clamp(1, dims.max_font_px())
}

/// Render `artifacts` over `background`.
///
/// Fails only when the background does not match the run's dimensions.
pub fn compose(
    background: &RgbaImage,
    artifacts: &RunArtifactSet,
    fonts: &dyn FontResolver,
    opts: &CompositionOptions,
) -> Result<(RgbaImage, Vec<CompositionError>), CompositionError> {
    let dims = artifacts.dimensions;
    if background.dimensions() != (dims.width, dims.height) {
        let (w, h) = background.dimensions();
        return Err(CompositionError::LayerMissing {
            path: artifacts
                .layers
                .as_ref()
                .map(|l| l.background_clean.clone())
                .unwrap_or_default(),
            detail: format!("background is {w}x{h}, run is {}x{}", dims.width, dims.height),
        });
    }

    let mut canvas = background.clone();
    let mut issues = Vec::new();

    for b in &artifacts.box_regions {
        draw_box(&mut canvas, b);
    }

    for region in artifacts.visible_texts() {
        let Some(handle) = resolve_font(region, fonts, opts, &mut issues) else {
            continue;
        };
        draw_region_text(&mut canvas, region, &handle, font_px(region, opts.font_size_ratio, dims));
    }

    debug!(
        "Composed {} boxes, {} texts, {} issues",
        artifacts.box_regions.len(),
        artifacts.visible_texts().count(),
        issues.len()
    );
    Ok((canvas, issues))
}

fn draw_box(canvas: &mut RgbaImage, b: &BoxRegion) {
    let rect = Rect::at(b.bbox.x as i32, b.bbox.y as i32).of_size(b.bbox.width, b.bbox.height);
    draw_filled_rect_mut(canvas, rect, b.color.to_rgba());
}

/// Requested font, else the default (reported), else `None` (reported).
fn resolve_font(
    region: &TextRegion,
    fonts: &dyn FontResolver,
    opts: &CompositionOptions,
    issues: &mut Vec<CompositionError>,
) -> Option<FontHandle> {
    let err = match fonts.resolve(&region.font, region.weight) {
        Ok(handle) => return Some(handle),
        Err(e) => e,
    };

    let is_default = region.font == opts.default_family && region.weight == opts.default_weight;
    if !is_default {
        if let Ok(handle) = fonts.resolve(&opts.default_family, opts.default_weight) {
            warn!(
                "{}: font '{}' {} unavailable ({}), using '{}'",
                region.id, region.font, region.weight, err, opts.default_family
            );
            issues.push(CompositionError::FontSubstituted {
                region: region.id.clone(),
                family: region.font.clone(),
                weight: region.weight.value(),
                fallback: opts.default_family.clone(),
            });
            return Some(handle);
        }
    }

    warn!("{}: no usable font, region skipped: {}", region.id, err);
    issues.push(CompositionError::FontUnresolved {
        region: region.id.clone(),
        family: region.font.clone(),
        weight: region.weight.value(),
        detail: err.to_string(),
    });
    None
}

fn draw_region_text(canvas: &mut RgbaImage, region: &TextRegion, handle: &FontHandle, px: u32) {
    let text = region.display_text();
    let scale = PxScale::from(px as f32);

    let (text_w, _) = text_size(scale, &handle.font, &text);
    let scaled = handle.font.as_scaled(scale);
    let line_h = (scaled.ascent() - scaled.descent()).ceil() as i64;

    let bbox = region.bbox;
    let x = bbox.x as i64 + (bbox.width as i64 - text_w as i64) / 2;
    let y = bbox.y as i64 + (bbox.height as i64 - line_h) / 2;

    draw_text_mut(
        canvas,
        region.color.to_rgba(),
        x as i32,
        y as i32,
        scale,
        &handle.font,
        &text,
    );
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::artifacts::{ImageDimensions, RunId};
    use crate::geometry::BBox;
    use crate::pipeline::detect::build_text_regions;
    use crate::pipeline::fonts::{MemoryFontResolver, NoFonts};
    use crate::region::{RegionId, RegionKind, Rgb, Stage};
    use image::Rgba;

    /// A TrueType font from the host, if one is installed.
    pub(crate) fn system_font_bytes() -> Option<Vec<u8>> {
        const CANDIDATES: &[&str] = &[
            "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
            "/usr/share/fonts/dejavu/DejaVuSans.ttf",
            "/usr/share/fonts/TTF/DejaVuSans.ttf",
            "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
            "/Library/Fonts/Arial.ttf",
            "/System/Library/Fonts/Supplemental/Arial.ttf",
            "C:\\Windows\\Fonts\\arial.ttf",
        ];
        CANDIDATES.iter().find_map(|p| std::fs::read(p).ok())
    }

    fn artifacts() -> RunArtifactSet {
        let mut set = RunArtifactSet::new(
            RunId::generate(),
            "t.png",
            ImageDimensions {
                width: 120,
                height: 60,
            },
        );
        let mut texts = build_text_regions(&[BBox::new(20, 15, 80, 30).unwrap()], "Roboto", FontWeight::REGULAR);
        texts[0].text = "Sale".into();
        texts[0].color = Rgb::WHITE;
        set.text_regions = texts;
        set.box_regions = vec![BoxRegion {
            id: RegionId::new(RegionKind::Box, 0),
            bbox: BBox::new(10, 10, 100, 40).unwrap(),
            created_by: Stage::BoxesAssociated,
            color: Rgb::new(200, 0, 0),
            associated_text_id: Some(RegionId::new(RegionKind::Text, 0)),
        }];
        set
    }

    fn background() -> RgbaImage {
        RgbaImage::from_pixel(120, 60, Rgba([10, 20, 30, 255]))
    }

    #[test]
    fn derived_font_size_uses_ratio() {
        let set = artifacts();
        let dims = set.dimensions;
        assert_eq!(font_px(&set.text_regions[0], 0.7, dims), 21);
        let mut r = set.text_regions[0].clone();
        r.font_size = Some(12);
        assert_eq!(font_px(&r, 0.7, dims), 12);
        r.font_size = None;
        r.bbox = BBox::new(0, 0, 5, 1).unwrap();
        assert_eq!(font_px(&r, 0.1, dims), 1);
    }

    #[test]
    fn stored_font_size_is_capped_to_the_canvas() {
        let mut set = artifacts();
        set.text_regions[0].font_size = Some(200_000);
        assert_eq!(font_px(&set.text_regions[0], 0.7, set.dimensions), 120);

        // Renders without trying to rasterise enormous glyphs.
        let (_, issues) = compose(&background(), &set, &NoFonts, &CompositionOptions::default()).unwrap();
        assert!(matches!(issues[0], CompositionError::FontUnresolved { .. }));
        if let Some(bytes) = system_font_bytes() {
            let mut fonts = MemoryFontResolver::new();
            fonts.register("Roboto", FontWeight::REGULAR, bytes).unwrap();
            let (img, issues) = compose(&background(), &set, &fonts, &CompositionOptions::default()).unwrap();
            assert!(issues.is_empty());
            assert_eq!(img.dimensions(), (120, 60));
        }
    }

    #[test]
    fn boxes_paint_over_background() {
        let set = artifacts();
        let (img, issues) = compose(&background(), &set, &NoFonts, &CompositionOptions::default()).unwrap();
        assert_eq!(*img.get_pixel(0, 0), Rgba([10, 20, 30, 255]));
        assert_eq!(*img.get_pixel(12, 12), Rgba([200, 0, 0, 255]));
        assert_eq!(*img.get_pixel(109, 49), Rgba([200, 0, 0, 255]));
        assert_eq!(*img.get_pixel(110, 50), Rgba([10, 20, 30, 255]));
        // No font anywhere: the text is reported and skipped, the box still drawn.
        assert_eq!(issues.len(), 1);
        assert!(matches!(issues[0], CompositionError::FontUnresolved { .. }));
    }

    #[test]
    fn input_is_not_mutated() {
        let set = artifacts();
        let before = set.clone();
        let bg = background();
        let _ = compose(&bg, &set, &NoFonts, &CompositionOptions::default()).unwrap();
        assert_eq!(set, before);
        assert_eq!(*bg.get_pixel(12, 12), Rgba([10, 20, 30, 255]));
    }

    #[test]
    fn wrong_background_size_aborts() {
        let set = artifacts();
        let bg = RgbaImage::new(10, 10);
        assert!(matches!(
            compose(&bg, &set, &NoFonts, &CompositionOptions::default()),
            Err(CompositionError::LayerMissing { .. })
        ));
    }

    #[test]
    fn hidden_regions_need_no_font() {
        let mut set = artifacts();
        set.text_regions[0].text.clear();
        let (_, issues) = compose(&background(), &set, &NoFonts, &CompositionOptions::default()).unwrap();
        assert!(issues.is_empty());
    }

    #[test]
    fn text_is_drawn_inside_its_box() {
        let Some(bytes) = system_font_bytes() else {
            eprintln!("no system font found, skipping");
            return;
        };
        let mut fonts = MemoryFontResolver::new();
        fonts.register("Roboto", FontWeight::REGULAR, bytes).unwrap();
        let set = artifacts();
        let (img, issues) = compose(&background(), &set, &fonts, &CompositionOptions::default()).unwrap();
        assert!(issues.is_empty());

        let bbox = set.text_regions[0].bbox;
        let changed_inside = (bbox.y..bbox.y + bbox.height)
            .flat_map(|y| (bbox.x..bbox.x + bbox.width).map(move |x| (x, y)))
            .filter(|&(x, y)| *img.get_pixel(x, y) != Rgba([200, 0, 0, 255]))
            .count();
        assert!(changed_inside > 0);
        // Deterministic: a second pass is pixel-identical.
        let (again, _) = compose(&background(), &set, &fonts, &CompositionOptions::default()).unwrap();
        assert_eq!(img, again);
    }

    #[test]
    fn unknown_family_falls_back_to_default() {
        let Some(bytes) = system_font_bytes() else {
            eprintln!("no system font found, skipping");
            return;
        };
        let mut fonts = MemoryFontResolver::new();
        fonts.register("Roboto", FontWeight::REGULAR, bytes).unwrap();
        let mut set = artifacts();
        set.text_regions[0].font = "Comic Neue".into();
        let (_, issues) = compose(&background(), &set, &fonts, &CompositionOptions::default()).unwrap();
        assert_eq!(issues.len(), 1);
        match &issues[0] {
            CompositionError::FontSubstituted { family, fallback, .. } => {
                assert_eq!(family, "Comic Neue");
                assert_eq!(fallback, "Roboto");
            }
            other => panic!("unexpected: {other}"),
        }
    }
}
