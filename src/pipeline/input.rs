//! Input resolution: turn a user-supplied path or URL into decoded pixels.
//!
//! The magic bytes are checked before decoding so a mislabelled file gets a
//! clear [`PipelineError::UnsupportedImage`] rather than a decoder message.
//! Decoding runs on the blocking pool.

use crate::error::PipelineError;
use image::RgbaImage;
use std::path::PathBuf;
use tracing::{debug, info};

/// A decoded source image and the name it was supplied under.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub name: String,
    pub pixels: RgbaImage,
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Recognised raster formats.
pub fn sniff_format(bytes: &[u8]) -> Option<image::ImageFormat> {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        Some(image::ImageFormat::Png)
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some(image::ImageFormat::Jpeg)
    } else {
        None
    }
}

/// Resolve and decode the input.
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<SourceImage, PipelineError> {
    let (bytes, origin) = if is_url(input) {
        (download_url(input, timeout_secs).await?, PathBuf::from(input))
    } else {
        (read_local(input).await?, PathBuf::from(input))
    };
    let pixels = decode(bytes, origin).await?;
    Ok(SourceImage {
        name: input.to_string(),
        pixels,
    })
}

/// Decode PNG/JPEG bytes to RGBA on the blocking pool.
pub async fn decode(bytes: Vec<u8>, origin: PathBuf) -> Result<RgbaImage, PipelineError> {
    let Some(format) = sniff_format(&bytes) else {
        let mut magic = [0u8; 4];
        let n = bytes.len().min(4);
        magic[..n].copy_from_slice(&bytes[..n]);
        return Err(PipelineError::UnsupportedImage { path: origin, magic });
    };
    tokio::task::spawn_blocking(move || {
        image::load_from_memory_with_format(&bytes, format)
            .map(|img| img.to_rgba8())
            .map_err(|e| PipelineError::ImageDecode {
                path: origin,
                detail: e.to_string(),
            })
    })
    .await
    .map_err(|e| PipelineError::Internal(format!("decode task panicked: {e}")))?
}

async fn read_local(path_str: &str) -> Result<Vec<u8>, PipelineError> {
    let path = PathBuf::from(path_str);
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            debug!("Read local image: {} ({} bytes)", path.display(), bytes.len());
            Ok(bytes)
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            Err(PipelineError::PermissionDenied { path })
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(PipelineError::ImageNotFound { path }),
        Err(_) if path.is_dir() => Err(PipelineError::InvalidInput {
            input: path_str.to_string(),
        }),
        Err(_) => Err(PipelineError::ImageNotFound { path }),
    }
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<Vec<u8>, PipelineError> {
    info!("Downloading image from: {}", url);

    if reqwest::Url::parse(url).is_err() {
        return Err(PipelineError::InvalidInput {
            input: url.to_string(),
        });
    }

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| PipelineError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let map_err = |e: reqwest::Error| {
        if e.is_timeout() {
            PipelineError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            PipelineError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    };

    let response = client.get(url).send().await.map_err(map_err)?;
    if !response.status().is_success() {
        return Err(PipelineError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }
    let bytes = response.bytes().await.map_err(map_err)?;
    info!("Downloaded {} bytes", bytes.len());
    Ok(bytes.to_vec())
}
