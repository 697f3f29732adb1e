//! Layering: split the source into background, text and UI rasters.

use crate::artifacts::ImageDimensions;
use crate::error::LayeringError;
use crate::region::TextRegion;
use async_trait::async_trait;
use image::RgbaImage;

/// The three rasters a layering service produces.
#[derive(Debug, Clone)]
pub struct LayerSet {
    /// Source with all detected text removed (inpainted).
    pub background: RgbaImage,
    /// Text only; kept for inspection.
    pub text_layer: RgbaImage,
    /// UI elements (panels, buttons, badges) on a transparent canvas.
    pub ui_layer: RgbaImage,
}

impl LayerSet {
    /// Every layer must match the source's pixel dimensions.
    pub fn validate(&self, dims: ImageDimensions) -> Result<(), LayeringError> {
        for (name, img) in [
            ("background_clean", &self.background),
            ("text_layer", &self.text_layer),
            ("ui_layer", &self.ui_layer),
        ] {
            let (w, h) = img.dimensions();
            if (w, h) != (dims.width, dims.height) {
                return Err(LayeringError::DimensionMismatch {
                    layer: name.to_string(),
                    expected_w: dims.width,
                    expected_h: dims.height,
                    got_w: w,
                    got_h: h,
                });
            }
        }
        Ok(())
    }
}

/// Generative layering collaborator.
#[async_trait]
pub trait Layerer: Send + Sync {
    async fn layer(&self, image: &RgbaImage, regions: &[TextRegion]) -> Result<LayerSet, LayeringError>;
}
