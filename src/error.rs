//! Error types for the layersmith library.
//!
//! Two tiers of failure exist:
//!
//! * [`PipelineError`] — **Fatal** for the call that returns it: a stage
//!   could not produce its artifacts, a run directory is missing, an input
//!   image cannot be read. Stage failures are wrapped in
//!   [`PipelineError::RunFailed`] with the originating stage recorded.
//!
//! * [`CompositionError`] — **Non-fatal**, attributed to a single region
//!   (unresolvable font, edit that pushes a region off the canvas). A render
//!   collects these in [`crate::output::RenderOutput::issues`] and still
//!   delivers the rest of the composite.
//!
//! Each stage error enum separates *transient* variants (external service
//! unavailable) from *validation* variants (malformed geometry, count
//! mismatch). Only transient errors are retried; see
//! [`PipelineError::is_transient`].

use crate::region::{RegionId, Stage};
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the layersmith library.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Image file not found: '{path}'\nCheck the path exists and is readable.")]
    ImageNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// The file exists but is not a PNG or JPEG image.
    #[error("Unsupported image format: '{path}'\nFirst bytes: {magic:?}")]
    UnsupportedImage { path: PathBuf, magic: [u8; 4] },

    /// The file looked like an image but could not be decoded.
    #[error("Failed to decode image '{path}': {detail}")]
    ImageDecode { path: PathBuf, detail: String },

    // ── Stage errors ──────────────────────────────────────────────────────
    #[error(transparent)]
    Detection(#[from] DetectionError),

    #[error(transparent)]
    Classification(#[from] ClassificationError),

    #[error(transparent)]
    Layering(#[from] LayeringError),

    #[error(transparent)]
    Association(#[from] AssociationError),

    /// A whole-render composition failure (missing layer, encode error).
    #[error(transparent)]
    Composition(#[from] CompositionError),

    /// An external call exceeded its time budget.
    #[error("Stage '{stage}' timed out after {elapsed_ms}ms")]
    StageTimeout { stage: Stage, elapsed_ms: u64 },

    /// A stage failed and the run was marked failed.
    #[error("Run {run_id} failed at stage '{stage}' after {attempts} attempt(s): {source}")]
    RunFailed {
        run_id: String,
        stage: Stage,
        attempts: u32,
        #[source]
        source: Box<PipelineError>,
    },

    // ── Store errors ──────────────────────────────────────────────────────
    /// No run directory exists for this ID.
    #[error("Run not found: '{run_id}' (looked in {root})")]
    RunNotFound { run_id: String, root: PathBuf },

    /// The run has not produced the artifacts this operation needs.
    #[error("Run '{run_id}' has only reached '{reached}'; '{required}' is required\nResume the run first.")]
    NotReady {
        run_id: String,
        required: Stage,
        reached: Stage,
    },

    /// Another process or session holds the run lock.
    #[error("Run '{run_id}' is locked by another writer (waited {waited_ms}ms)")]
    RunLocked { run_id: String, waited_ms: u64 },

    /// Filesystem error inside the artifact store.
    #[error("Artifact store I/O failed for '{path}': {source}")]
    Store {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A persisted JSON record could not be parsed.
    #[error("Corrupt run record '{path}': {detail}")]
    ReportCorrupt { path: PathBuf, detail: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// The configured LLM provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Whether retrying the same call may succeed.
    ///
    /// Timeouts and unavailable services are transient. Validation failures
    /// (bad geometry, count mismatches, wrong layer sizes) are deterministic
    /// and never retried.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::StageTimeout { .. } => true,
            PipelineError::Detection(e) => e.is_transient(),
            PipelineError::Classification(e) => e.is_transient(),
            PipelineError::Layering(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Short machine-readable category, stored in failure records.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::StageTimeout { .. } => "timeout",
            PipelineError::RunFailed { source, .. } => source.kind(),
            e if e.is_transient() => "transient",
            PipelineError::Detection(_)
            | PipelineError::Classification(_)
            | PipelineError::Layering(_)
            | PipelineError::Association(_) => "validation",
            PipelineError::Composition(_) => "composition",
            _ => "fatal",
        }
    }

    pub(crate) fn store(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Store {
            path: path.into(),
            source,
        }
    }
}

/// Failures from the text detector.
#[derive(Debug, Clone, Error)]
pub enum DetectionError {
    /// The detector could not be reached or returned a server error.
    #[error("Detector unavailable: {detail}")]
    Unavailable { detail: String },

    /// The detector rejected the request (bad input, auth).
    #[error("Detector rejected the request: {detail}")]
    Rejected { detail: String },

    /// A returned box has non-positive size, non-finite or out-of-image coordinates.
    #[error("Detector returned malformed geometry for box #{index}: {detail}")]
    MalformedGeometry { index: usize, detail: String },

    /// The response did not match the expected schema.
    #[error("Detector response is malformed: {detail}")]
    MalformedResponse { detail: String },
}

impl DetectionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DetectionError::Unavailable { .. })
    }
}

/// Failures from the role classifier.
#[derive(Debug, Clone, Error)]
pub enum ClassificationError {
    #[error("Classifier unavailable: {detail}")]
    Unavailable { detail: String },

    /// Count-preservation violated: one label per input box is required.
    #[error("Classifier returned {got} labels for {expected} text boxes")]
    CountMismatch { expected: usize, got: usize },

    #[error("Classifier response is malformed: {detail}")]
    MalformedResponse { detail: String },
}

impl ClassificationError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ClassificationError::Unavailable { .. })
    }
}

/// Failures from the generative layering service.
#[derive(Debug, Clone, Error)]
pub enum LayeringError {
    #[error("Layering service unavailable: {detail}")]
    Unavailable { detail: String },

    #[error("Layering service rejected the request: {detail}")]
    Rejected { detail: String },

    /// A layer does not have the source image's pixel dimensions.
    #[error("Layer '{layer}' is {got_w}x{got_h}, expected {expected_w}x{expected_h}")]
    DimensionMismatch {
        layer: String,
        expected_w: u32,
        expected_h: u32,
        got_w: u32,
        got_h: u32,
    },

    #[error("Layering response is malformed: {detail}")]
    MalformedResponse { detail: String },
}

impl LayeringError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LayeringError::Unavailable { .. })
    }
}

/// Failures while associating boxes with text regions.
#[derive(Debug, Clone, Error)]
pub enum AssociationError {
    #[error("Box detector returned malformed geometry for box #{index}: {detail}")]
    MalformedGeometry { index: usize, detail: String },

    #[error("Box detection failed: {detail}")]
    DetectorFailed { detail: String },
}

/// A composition failure, usually attributed to one region.
///
/// Region-level variants are collected as render issues; only
/// [`CompositionError::LayerMissing`] and [`CompositionError::Encode`] abort
/// a render.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum CompositionError {
    /// Neither the requested nor the default font could be loaded.
    #[error("Region {region}: font '{family}' ({weight}) unresolved: {detail}")]
    FontUnresolved {
        region: RegionId,
        family: String,
        weight: u16,
        detail: String,
    },

    /// The requested font was unavailable; the region was drawn with the default.
    #[error("Region {region}: font '{family}' ({weight}) unavailable, used '{fallback}'")]
    FontSubstituted {
        region: RegionId,
        family: String,
        weight: u16,
        fallback: String,
    },

    /// An edited bbox lies entirely outside the image; the old bbox was kept.
    #[error("Region {region}: edited bbox is outside the {width}x{height} image")]
    RegionOutOfBounds {
        region: RegionId,
        width: u32,
        height: u32,
    },

    /// An override references an ID that does not exist in the run.
    #[error("Override references unknown region {region}")]
    UnknownRegion { region: RegionId },

    /// An override value was rejected (e.g. zero font size).
    #[error("Region {region}: invalid override: {detail}")]
    InvalidOverride { region: RegionId, detail: String },

    #[error("Layer '{path}' is missing or unreadable: {detail}")]
    LayerMissing { path: String, detail: String },

    #[error("Failed to encode composed image: {detail}")]
    Encode { detail: String },
}

impl CompositionError {
    /// The region this error is attributed to, if any.
    pub fn region(&self) -> Option<&RegionId> {
        match self {
            CompositionError::FontUnresolved { region, .. }
            | CompositionError::FontSubstituted { region, .. }
            | CompositionError::RegionOutOfBounds { region, .. }
            | CompositionError::UnknownRegion { region }
            | CompositionError::InvalidOverride { region, .. } => Some(region),
            CompositionError::LayerMissing { .. } | CompositionError::Encode { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let e: PipelineError = LayeringError::Unavailable {
            detail: "503".into(),
        }
        .into();
        assert!(e.is_transient());
        assert_eq!(e.kind(), "transient");

        let e: PipelineError = ClassificationError::CountMismatch {
            expected: 4,
            got: 3,
        }
        .into();
        assert!(!e.is_transient());
        assert_eq!(e.kind(), "validation");
    }

    #[test]
    fn timeout_is_transient_but_distinct() {
        let e = PipelineError::StageTimeout {
            stage: Stage::Detected,
            elapsed_ms: 30_000,
        };
        assert!(e.is_transient());
        assert_eq!(e.kind(), "timeout");
        assert!(e.to_string().contains("detected"));
    }

    #[test]
    fn run_failed_carries_stage_and_kind() {
        let e = PipelineError::RunFailed {
            run_id: "run_x".into(),
            stage: Stage::Classified,
            attempts: 1,
            source: Box::new(
                ClassificationError::CountMismatch {
                    expected: 4,
                    got: 3,
                }
                .into(),
            ),
        };
        let msg = e.to_string();
        assert!(msg.contains("classified"), "got: {msg}");
        assert!(msg.contains("3 labels for 4"), "got: {msg}");
        assert_eq!(e.kind(), "validation");
    }

    #[test]
    fn count_mismatch_display() {
        let e = ClassificationError::CountMismatch {
            expected: 4,
            got: 3,
        };
        assert_eq!(e.to_string(), "Classifier returned 3 labels for 4 text boxes");
    }

    #[test]
    fn composition_error_region_attribution() {
        let e = CompositionError::UnknownRegion {
            region: RegionId::from("text_9"),
        };
        assert_eq!(e.region().map(|r| r.as_str()), Some("text_9"));
        let e = CompositionError::Encode {
            detail: "disk full".into(),
        };
        assert!(e.region().is_none());
    }
}
