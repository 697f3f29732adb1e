//! HTTP clients for externally hosted detection and layering models.
//!
//! Both services take a JSON body with the source as base64 PNG and answer
//! with JSON:
//!
//! ```text
//! POST <detector-url>   {"image", "width", "height"}
//!                    →  {"boxes": [{"x","y","w","h"} | {"points": [[x,y], …]}, …]}
//!
//! POST <layering-url>   {"image", "width", "height", "text_regions": [{"id","bbox"}, …]}
//!                    →  {"background_clean", "text_layer", "ui_layer"}   (base64 PNG each)
//! ```
//!
//! Transport failures and 5xx/429 answers are transient; other 4xx answers
//! and bodies that do not match the schema are validation failures.

use crate::error::{DetectionError, LayeringError, PipelineError};
use crate::geometry::BBox;
use crate::pipeline::detect::{Detector, RawBox};
use crate::pipeline::encode;
use crate::pipeline::layer::{LayerSet, Layerer};
use crate::region::{RegionId, TextRegion};
use async_trait::async_trait;
use image::RgbaImage;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

// ── Wire types ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct DetectRequest {
    image: String,
    width: u32,
    height: u32,
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    boxes: Vec<RawBox>,
}

#[derive(Debug, Serialize)]
struct RegionRef<'a> {
    id: &'a RegionId,
    bbox: &'a BBox,
}

#[derive(Debug, Serialize)]
struct LayerRequest<'a> {
    image: String,
    width: u32,
    height: u32,
    text_regions: Vec<RegionRef<'a>>,
}

#[derive(Debug, Deserialize)]
struct LayerResponse {
    background_clean: String,
    text_layer: String,
    ui_layer: String,
}

// ── Transport ────────────────────────────────────────────────────────────

/// Outcome classes shared by both services.
#[derive(Debug, Clone, PartialEq)]
enum RemoteFailure {
    Unavailable(String),
    Rejected(String),
    Malformed(String),
}

impl From<RemoteFailure> for DetectionError {
    fn from(f: RemoteFailure) -> Self {
        match f {
            RemoteFailure::Unavailable(detail) => DetectionError::Unavailable { detail },
            RemoteFailure::Rejected(detail) => DetectionError::Rejected { detail },
            RemoteFailure::Malformed(detail) => DetectionError::MalformedResponse { detail },
        }
    }
}

impl From<RemoteFailure> for LayeringError {
    fn from(f: RemoteFailure) -> Self {
        match f {
            RemoteFailure::Unavailable(detail) => LayeringError::Unavailable { detail },
            RemoteFailure::Rejected(detail) => LayeringError::Rejected { detail },
            RemoteFailure::Malformed(detail) => LayeringError::MalformedResponse { detail },
        }
    }
}

fn status_failure(status: StatusCode, body: &str) -> RemoteFailure {
    let detail = format!("HTTP {status}: {}", body.chars().take(200).collect::<String>());
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT {
        RemoteFailure::Unavailable(detail)
    } else {
        RemoteFailure::Rejected(detail)
    }
}

fn build_client() -> Result<reqwest::Client, PipelineError> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| PipelineError::Internal(format!("HTTP client init failed: {e}")))
}

async fn post_json<Req: Serialize + ?Sized, Resp: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    body: &Req,
) -> Result<Resp, RemoteFailure> {
    let response = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| RemoteFailure::Unavailable(format!("{url}: {e}")))?;

    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| RemoteFailure::Unavailable(format!("{url}: reading body failed: {e}")))?;
    if !status.is_success() {
        return Err(status_failure(status, &text));
    }
    serde_json::from_str(&text).map_err(|e| RemoteFailure::Malformed(format!("{url}: {e}")))
}

async fn encode_source(image: &RgbaImage) -> Result<String, RemoteFailure> {
    let img = image.clone();
    tokio::task::spawn_blocking(move || encode::png_base64(&img))
        .await
        .map_err(|e| RemoteFailure::Unavailable(format!("encode task panicked: {e}")))?
        .map_err(|e| RemoteFailure::Malformed(format!("source encoding failed: {e}")))
}

// ── Detector ─────────────────────────────────────────────────────────────

/// [`Detector`] calling a text-detection service over HTTP.
pub struct RemoteDetector {
    url: String,
    client: reqwest::Client,
}

impl RemoteDetector {
    pub fn new(url: impl Into<String>) -> Result<Self, PipelineError> {
        Ok(Self {
            url: url.into(),
            client: build_client()?,
        })
    }
}

#[async_trait]
impl Detector for RemoteDetector {
    async fn detect(&self, image: &RgbaImage) -> Result<Vec<RawBox>, DetectionError> {
        let req = DetectRequest {
            image: encode_source(image).await?,
            width: image.width(),
            height: image.height(),
        };
        let resp: DetectResponse = post_json(&self.client, &self.url, &req).await?;
        debug!("Remote detector returned {} boxes", resp.boxes.len());
        Ok(resp.boxes)
    }
}

// ── Layerer ──────────────────────────────────────────────────────────────

/// [`Layerer`] calling a generative layering service over HTTP.
pub struct RemoteLayerer {
    url: String,
    client: reqwest::Client,
}

impl RemoteLayerer {
    pub fn new(url: impl Into<String>) -> Result<Self, PipelineError> {
        Ok(Self {
            url: url.into(),
            client: build_client()?,
        })
    }
}

fn decode_layers(resp: LayerResponse) -> Result<LayerSet, RemoteFailure> {
    let decode = |name: &str, data: &str| {
        encode::decode_png_base64(data).map_err(|e| RemoteFailure::Malformed(format!("{name}: {e}")))
    };
    Ok(LayerSet {
        background: decode("background_clean", &resp.background_clean)?,
        text_layer: decode("text_layer", &resp.text_layer)?,
        ui_layer: decode("ui_layer", &resp.ui_layer)?,
    })
}

#[async_trait]
impl Layerer for RemoteLayerer {
    async fn layer(&self, image: &RgbaImage, regions: &[TextRegion]) -> Result<LayerSet, LayeringError> {
        let req = LayerRequest {
            image: encode_source(image).await?,
            width: image.width(),
            height: image.height(),
            text_regions: regions
                .iter()
                .map(|r| RegionRef {
                    id: &r.id,
                    bbox: &r.bbox,
                })
                .collect(),
        };
        let resp: LayerResponse = post_json(&self.client, &self.url, &req).await?;
        let layers = tokio::task::spawn_blocking(move || decode_layers(resp))
            .await
            .map_err(|e| LayeringError::Unavailable {
                detail: format!("decode task panicked: {e}"),
            })??;
        Ok(layers)
    }
}
