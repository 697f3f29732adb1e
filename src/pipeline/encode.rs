//! Image encoding: RGBA rasters ⇄ base64 PNG.
//!
//! The VLM classifier sends one crop per text region wrapped in
//! [`ImageData`]; the remote collaborators exchange whole rasters as plain
//! base64 strings inside JSON. PNG keeps glyph edges and layer alpha intact.

use crate::geometry::BBox;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::{imageops, DynamicImage, RgbaImage};
use std::io::Cursor;
use tracing::debug;

/// Encode a raster as base64 PNG.
pub fn png_base64(img: &RgbaImage) -> Result<String, image::ImageError> {
    let mut buf = Vec::new();
    DynamicImage::ImageRgba8(img.clone()).write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(STANDARD.encode(&buf))
}

/// Decode a base64 PNG (an optional `data:` URI prefix is accepted).
pub fn decode_png_base64(data: &str) -> Result<RgbaImage, String> {
    let payload = match data.split_once("base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => data,
    };
    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| format!("invalid base64: {e}"))?;
    image::load_from_memory_with_format(&bytes, image::ImageFormat::Png)
        .map(|img| img.to_rgba8())
        .map_err(|e| format!("invalid PNG: {e}"))
}

/// Crop one region out of the source and wrap it for a vision request.
///
/// `detail: "high"` keeps small print legible to the model.
pub fn encode_crop(source: &RgbaImage, bbox: &BBox) -> Result<ImageData, image::ImageError> {
    let crop = imageops::crop_imm(source, bbox.x, bbox.y, bbox.width, bbox.height).to_image();
    let b64 = png_base64(&crop)?;
    debug!("Encoded crop {} → {} bytes base64", bbox, b64.len());
    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn crop_is_region_sized() {
        let mut img = RgbaImage::from_pixel(40, 30, Rgba([255, 255, 255, 255]));
        img.put_pixel(12, 7, Rgba([255, 0, 0, 255]));
        let data = encode_crop(&img, &BBox::new(10, 5, 8, 4).unwrap()).expect("encode should succeed");
        assert_eq!(data.mime_type, "image/png");

        let crop = decode_png_base64(&data.data).unwrap();
        assert_eq!(crop.dimensions(), (8, 4));
        assert_eq!(*crop.get_pixel(2, 2), Rgba([255, 0, 0, 255]));
    }

    #[test]
    fn data_uri_prefix_is_accepted() {
        let img = RgbaImage::from_pixel(3, 2, Rgba([0, 0, 0, 0]));
        let b64 = png_base64(&img).unwrap();
        let decoded = decode_png_base64(&format!("data:image/png;base64,{b64}")).unwrap();
        assert_eq!(decoded, img);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(decode_png_base64("%%%").unwrap_err().contains("base64"));
        assert!(decode_png_base64(&STANDARD.encode(b"not a png")).unwrap_err().contains("PNG"));
    }
}
