//! Values returned by the orchestrator.

use crate::artifacts::{RunArtifactSet, RunId};
use crate::error::CompositionError;
use crate::region::{RegionId, Stage};
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Result of [`crate::orchestrator::Pipeline::run`] and friends.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutput {
    pub run_id: RunId,
    pub run_dir: PathBuf,
    /// Furthest stage reached; equals the requested target on success.
    pub stage: Stage,
    pub artifacts: RunArtifactSet,
    /// Per-region problems hit during composition (fonts, geometry).
    pub issues: Vec<CompositionError>,
    pub stats: RunStats,
}

/// Timing and counting information for one invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    /// Stages executed by this invocation, in order.
    pub stages_run: Vec<StageTiming>,
    /// Stages whose artifacts were already present.
    pub stages_skipped: Vec<Stage>,
    pub text_regions: usize,
    pub box_regions: usize,
    pub associated_boxes: usize,
    pub total_duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: Stage,
    /// Attempts made; greater than 1 only after transient failures.
    pub attempts: u32,
    pub duration_ms: u64,
}

/// A re-render of an existing run.
#[derive(Debug, Clone)]
pub struct RenderOutput {
    pub image: RgbaImage,
    /// The artifact set with the overrides applied. Not persisted unless committed.
    pub artifacts: RunArtifactSet,
    pub issues: Vec<CompositionError>,
}

/// Answer to an editing client's `submit_edits` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditOutcome {
    /// Where the rendered raster was written.
    pub image_path: PathBuf,
    /// Canonical revision after this call (unchanged for previews).
    pub revision: u64,
    pub committed: bool,
    pub issues: Vec<CompositionError>,
}

/// Last failure of a run, persisted as `failure.json`.
///
/// Informational only: stage completion is always derived from artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub stage: Stage,
    /// `transient`, `timeout`, `validation` or `fatal`.
    pub kind: String,
    pub attempts: u32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<RegionId>,
    /// RFC 3339 UTC timestamp.
    pub at: String,
}

/// One row of [`crate::orchestrator::Pipeline::list_runs`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub source_name: String,
    pub stage: Stage,
    pub revision: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureRecord>,
}
