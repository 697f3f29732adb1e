//! Run orchestration: staged, resumable execution and editing round trips.
//!
//! A [`Pipeline`] owns the collaborators (detector, classifier, layerer, box
//! detector, font resolver), the configuration and the artifact store. Runs
//! progress through
//!
//! ```text
//! Created → Detected → Classified → Layered → BoxesAssociated → Composed
//! ```
//!
//! and each stage persists its artifacts before the next one starts. Where
//! a run stands is always read back from the run directory (see
//! [`ArtifactStore::completed_stage`]), so resuming after a crash, an
//! interrupt or a deliberate `run_until` re-executes exactly the missing
//! stages.
//!
//! External calls go through [`call_with_retry`]: transient failures are
//! retried with backoff, validation failures stop the run at once, and
//! every failure is recorded in `failure.json` and returned as
//! [`PipelineError::RunFailed`].
//!
//! Writers (stage execution, committed edits) hold the per-run lock.
//! Previews only read.

use crate::artifacts::{ImageDimensions, LayerRefs, RunArtifactSet, RunId};
use crate::config::PipelineConfig;
use crate::edit::EditSet;
use crate::error::{AssociationError, CompositionError, DetectionError, PipelineError};
use crate::geometry::BBox;
use crate::output::{EditOutcome, FailureRecord, RenderOutput, RunOutput, RunStats, RunSummary, StageTiming};
use crate::pipeline::associate::{self, BoxDetector, UiLayerBoxDetector};
use crate::pipeline::classify::{self, Classifier};
use crate::pipeline::compose::{self, CompositionOptions};
use crate::pipeline::detect::{self, Detector};
use crate::pipeline::fonts::{DirectoryFontResolver, FontResolver, NoFonts};
use crate::pipeline::input::{self, SourceImage};
use crate::pipeline::layer::{LayerSet, Layerer};
use crate::pipeline::llm::LlmClassifier;
use crate::pipeline::retry::{call_with_retry, RetryFailure, RetryPolicy};
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::region::{RegionId, RegionKind, Stage, TextRegion};
use crate::store::{self, ArtifactStore, RunLock, RunRecord};
use image::RgbaImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// ── Builder ──────────────────────────────────────────────────────────────

/// Assembles a [`Pipeline`] from a config and its collaborators.
///
/// The detector and the layerer have no built-in implementation and must
/// be supplied. Unset, the classifier is an [`LlmClassifier`] resolved from
/// the config, the box detector is a [`UiLayerBoxDetector`] and fonts come
/// from `config.font_dir`.
pub struct PipelineBuilder {
    config: PipelineConfig,
    detector: Option<Arc<dyn Detector>>,
    classifier: Option<Arc<dyn Classifier>>,
    layerer: Option<Arc<dyn Layerer>>,
    box_detector: Option<Arc<dyn BoxDetector>>,
    fonts: Option<Arc<dyn FontResolver>>,
}

impl PipelineBuilder {
    pub fn detector(mut self, detector: Arc<dyn Detector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn layerer(mut self, layerer: Arc<dyn Layerer>) -> Self {
        self.layerer = Some(layerer);
        self
    }

    pub fn box_detector(mut self, box_detector: Arc<dyn BoxDetector>) -> Self {
        self.box_detector = Some(box_detector);
        self
    }

    pub fn fonts(mut self, fonts: Arc<dyn FontResolver>) -> Self {
        self.fonts = Some(fonts);
        self
    }

    pub fn build(self) -> Result<Pipeline, PipelineError> {
        let detector = self
            .detector
            .ok_or_else(|| PipelineError::InvalidConfig("no text detector configured".into()))?;
        let layerer = self
            .layerer
            .ok_or_else(|| PipelineError::InvalidConfig("no layering service configured".into()))?;
        let classifier = match self.classifier {
            Some(c) => c,
            None => Arc::new(LlmClassifier::from_config(&self.config)?),
        };
        let box_detector = self
            .box_detector
            .unwrap_or_else(|| Arc::new(UiLayerBoxDetector::default()));
        let fonts: Arc<dyn FontResolver> = match (self.fonts, &self.config.font_dir) {
            (Some(f), _) => f,
            (None, Some(dir)) => Arc::new(DirectoryFontResolver::new(dir)),
            (None, None) => {
                warn!("No font directory configured; text regions will not be drawn");
                Arc::new(NoFonts)
            }
        };

        Ok(Pipeline {
            store: ArtifactStore::new(&self.config.output_root),
            config: self.config,
            detector,
            classifier,
            layerer,
            box_detector,
            fonts,
        })
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────

/// The run orchestrator. Cheap to clone; clones share collaborators.
#[derive(Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    store: ArtifactStore,
    detector: Arc<dyn Detector>,
    classifier: Arc<dyn Classifier>,
    layerer: Arc<dyn Layerer>,
    box_detector: Arc<dyn BoxDetector>,
    fonts: Arc<dyn FontResolver>,
}

impl Pipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder {
            config,
            detector: None,
            classifier: None,
            layerer: None,
            box_detector: None,
            fonts: None,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    fn progress(&self) -> ProgressCallback {
        self.config
            .progress_callback
            .clone()
            .unwrap_or_else(|| Arc::new(NoopProgressCallback))
    }

    fn composition_options(&self) -> CompositionOptions {
        CompositionOptions {
            font_size_ratio: self.config.font_size_ratio,
            default_family: self.config.default_font_family.clone(),
            default_weight: self.config.default_font_weight,
        }
    }

    async fn lock(&self, run_id: &RunId) -> Result<RunLock, PipelineError> {
        self.store
            .lock(
                run_id,
                Duration::from_millis(self.config.lock_timeout_ms),
                Duration::from_secs(self.config.lock_stale_secs),
            )
            .await
    }

    // ── Starting runs ────────────────────────────────────────────────────

    /// Run a new image (path or URL) through every stage.
    pub async fn run(&self, input: &str) -> Result<RunOutput, PipelineError> {
        self.run_until(input, Stage::Composed).await
    }

    /// Run a new image up to and including `target`.
    pub async fn run_until(&self, input: &str, target: Stage) -> Result<RunOutput, PipelineError> {
        info!("Starting run: {}", input);
        let source = input::resolve_input(input, self.config.download_timeout_secs).await?;
        self.run_source(source, target).await
    }

    /// Run already-decoded pixels up to and including `target`.
    pub async fn run_source(&self, source: SourceImage, target: Stage) -> Result<RunOutput, PipelineError> {
        let started = Instant::now();
        let run_id = RunId::generate();
        let (width, height) = source.pixels.dimensions();
        let record = RunRecord {
            run_id: run_id.clone(),
            source_name: source.name,
            dimensions: ImageDimensions { width, height },
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        self.store.create_run(&record, source.pixels).await?;
        info!("Created run {} ({}x{})", run_id, width, height);
        self.advance(&run_id, target, started).await
    }

    /// Continue an existing run to completion.
    pub async fn resume(&self, run_id: &RunId) -> Result<RunOutput, PipelineError> {
        self.resume_until(run_id, Stage::Composed).await
    }

    /// Continue an existing run up to and including `target`.
    ///
    /// Stages whose artifacts already exist are skipped; a run that is
    /// already at or past `target` is returned unchanged.
    pub async fn resume_until(&self, run_id: &RunId, target: Stage) -> Result<RunOutput, PipelineError> {
        let started = Instant::now();
        self.store.completed_stage(run_id).await?;
        info!("Resuming run {} towards '{}'", run_id, target);
        self.advance(run_id, target, started).await
    }

    // ── Stage loop ───────────────────────────────────────────────────────

    async fn advance(&self, run_id: &RunId, target: Stage, started: Instant) -> Result<RunOutput, PipelineError> {
        let lock = self.lock(run_id).await?;
        let cb = self.progress();
        let reached = self.store.completed_stage(run_id).await?;

        let pending: Vec<Stage> = Stage::ALL
            .into_iter()
            .filter(|s| *s > reached && *s <= target)
            .collect();
        cb.on_run_start(run_id.as_str(), pending.len());

        let mut stats = RunStats::default();
        let mut issues = Vec::new();
        for stage in Stage::ALL.into_iter().filter(|s| *s != Stage::Created && *s <= target) {
            if stage <= reached {
                debug!("{}: '{}' already complete", run_id, stage);
                stats.stages_skipped.push(stage);
                cb.on_stage_skipped(run_id.as_str(), stage);
                continue;
            }

            if let Err(e) = lock.refresh().await {
                warn!("{}: could not refresh run lock: {}", run_id, e);
            }
            cb.on_stage_start(run_id.as_str(), stage);
            let stage_start = Instant::now();
            match self.execute_stage(run_id, stage, &cb).await {
                Ok((attempts, stage_issues)) => {
                    let duration_ms = stage_start.elapsed().as_millis() as u64;
                    info!("{}: '{}' done in {}ms ({} attempt(s))", run_id, stage, duration_ms, attempts);
                    issues.extend(stage_issues);
                    stats.stages_run.push(StageTiming {
                        stage,
                        attempts,
                        duration_ms,
                    });
                    cb.on_stage_complete(run_id.as_str(), stage, duration_ms);
                }
                Err(RetryFailure { error, attempts }) => {
                    return Err(self.fail_run(run_id, stage, attempts, error, &cb).await);
                }
            }
        }

        if let Err(e) = self.store.clear_failure(run_id).await {
            warn!("{}: could not clear failure record: {}", run_id, e);
        }

        let artifacts = self.store.load(run_id).await?;
        stats.text_regions = artifacts.text_regions.len();
        stats.box_regions = artifacts.box_regions.len();
        stats.associated_boxes = artifacts
            .box_regions
            .iter()
            .filter(|b| b.associated_text_id.is_some())
            .count();
        stats.total_duration_ms = started.elapsed().as_millis() as u64;

        cb.on_run_complete(run_id.as_str(), artifacts.stage);
        Ok(RunOutput {
            run_id: run_id.clone(),
            run_dir: self.store.run_dir(run_id),
            stage: artifacts.stage,
            artifacts,
            issues,
            stats,
        })
    }

    async fn fail_run(
        &self,
        run_id: &RunId,
        stage: Stage,
        attempts: u32,
        error: PipelineError,
        cb: &ProgressCallback,
    ) -> PipelineError {
        warn!("{}: '{}' failed after {} attempt(s): {}", run_id, stage, attempts, error);
        let record = FailureRecord {
            stage,
            kind: error.kind().to_string(),
            attempts,
            message: error.to_string(),
            region: failure_region(&error),
            at: chrono::Utc::now().to_rfc3339(),
        };
        if let Err(e) = self.store.write_failure(run_id, &record).await {
            warn!("{}: could not write failure record: {}", run_id, e);
        }
        cb.on_run_failed(run_id.as_str(), stage, &error.to_string());
        PipelineError::RunFailed {
            run_id: run_id.to_string(),
            stage,
            attempts,
            source: Box::new(error),
        }
    }

    async fn execute_stage(
        &self,
        run_id: &RunId,
        stage: Stage,
        cb: &ProgressCallback,
    ) -> Result<(u32, Vec<CompositionError>), RetryFailure> {
        let policy = RetryPolicy::from_config(&self.config);
        let on_retry = |attempt: u32, e: &PipelineError| {
            cb.on_stage_retry(run_id.as_str(), stage, attempt, &e.to_string())
        };
        match stage {
            Stage::Created => Ok((0, Vec::new())),
            Stage::Detected => self.detect_stage(run_id, &policy, on_retry).await.map(|a| (a, Vec::new())),
            Stage::Classified => self.classify_stage(run_id, &policy, on_retry).await.map(|a| (a, Vec::new())),
            Stage::Layered => self.layer_stage(run_id, &policy, on_retry).await.map(|a| (a, Vec::new())),
            Stage::BoxesAssociated => self.associate_stage(run_id, &policy, on_retry).await.map(|a| (a, Vec::new())),
            Stage::Composed => self.compose_stage(run_id).await,
        }
    }

    // ── Stages ───────────────────────────────────────────────────────────

    async fn detect_stage(
        &self,
        run_id: &RunId,
        policy: &RetryPolicy,
        on_retry: impl FnMut(u32, &PipelineError),
    ) -> Result<u32, RetryFailure> {
        let record = self.store.read_record(run_id).await?;
        let source = self.store.load_source(run_id).await?;
        let source = &source;
        let dims = record.dimensions;
        let detector = &self.detector;

        let (boxes, attempts) = call_with_retry(Stage::Detected, policy, on_retry, move || async move {
            let raw = detector.detect(source).await?;
            Ok::<_, PipelineError>(detect::normalize(&raw, dims)?)
        })
        .await?;

        let regions = detect::build_text_regions(
            &boxes,
            &self.config.default_font_family,
            self.config.default_font_weight,
        );
        info!("{}: {} text regions detected", run_id, regions.len());
        store::write_json(&self.store.run_dir(run_id).join(store::DETECTION_FILE), &regions).await?;
        Ok(attempts)
    }

    async fn classify_stage(
        &self,
        run_id: &RunId,
        policy: &RetryPolicy,
        on_retry: impl FnMut(u32, &PipelineError),
    ) -> Result<u32, RetryFailure> {
        let dir = self.store.run_dir(run_id);
        let source = self.store.load_source(run_id).await?;
        let detected: Vec<TextRegion> = store::read_json(&dir.join(store::DETECTION_FILE)).await?;
        let boxes: Vec<BBox> = detected.iter().map(|r| r.bbox).collect();
        let (source, detected, boxes) = (&source, &detected, &boxes);
        let classifier = &self.classifier;

        let (classified, attempts) = call_with_retry(Stage::Classified, policy, on_retry, move || async move {
            let analyses = classifier.classify(source, boxes).await?;
            Ok::<_, PipelineError>(classify::apply_analyses(detected, analyses)?)
        })
        .await?;

        store::write_json(&dir.join(store::CLASSIFICATION_FILE), &classified).await?;
        Ok(attempts)
    }

    async fn layer_stage(
        &self,
        run_id: &RunId,
        policy: &RetryPolicy,
        on_retry: impl FnMut(u32, &PipelineError),
    ) -> Result<u32, RetryFailure> {
        let dir = self.store.run_dir(run_id);
        let record = self.store.read_record(run_id).await?;
        let source = self.store.load_source(run_id).await?;
        let regions: Vec<TextRegion> = store::read_json(&dir.join(store::CLASSIFICATION_FILE)).await?;
        let (source, regions) = (&source, &regions);
        let dims = record.dimensions;
        let layerer = &self.layerer;

        let (layers, attempts) = call_with_retry(Stage::Layered, policy, on_retry, move || async move {
            let layers = layerer.layer(source, regions).await?;
            layers.validate(dims)?;
            Ok::<_, PipelineError>(layers)
        })
        .await?;

        // Rasters first: layers.json is the stage marker.
        let refs = LayerRefs::default();
        let LayerSet {
            background,
            text_layer,
            ui_layer,
        } = layers;
        store::write_png(&dir.join(&refs.background_clean), background).await?;
        store::write_png(&dir.join(&refs.text_layer), text_layer).await?;
        store::write_png(&dir.join(&refs.ui_layer), ui_layer).await?;
        store::write_json(&dir.join(store::LAYERS_FILE), &refs).await?;
        Ok(attempts)
    }

    async fn associate_stage(
        &self,
        run_id: &RunId,
        policy: &RetryPolicy,
        on_retry: impl FnMut(u32, &PipelineError),
    ) -> Result<u32, RetryFailure> {
        let dir = self.store.run_dir(run_id);
        let record = self.store.read_record(run_id).await?;
        let source = self.store.load_source(run_id).await?;
        let texts: Vec<TextRegion> = store::read_json(&dir.join(store::CLASSIFICATION_FILE)).await?;
        let layers = load_layers(&dir).await?;
        let (source, layers) = (&source, &layers);
        let dims = record.dimensions;
        let box_detector = &self.box_detector;

        let (boxes, attempts) = call_with_retry(Stage::BoxesAssociated, policy, on_retry, move || async move {
            let boxes = box_detector.detect_boxes(source, layers).await?;
            associate::validate_boxes(&boxes, dims)?;
            Ok::<_, PipelineError>(boxes)
        })
        .await?;

        let tolerance = self.config.containment_tolerance;
        let source = source.clone();
        let regions = tokio::task::spawn_blocking(move || associate::build_box_regions(&source, &boxes, &texts, tolerance))
            .await
            .map_err(|e| PipelineError::Internal(format!("association task panicked: {e}")))?;
        info!(
            "{}: {} boxes, {} associated",
            run_id,
            regions.len(),
            regions.iter().filter(|b| b.associated_text_id.is_some()).count()
        );
        store::write_json(&dir.join(store::BOXES_FILE), &regions).await?;
        Ok(attempts)
    }

    async fn compose_stage(&self, run_id: &RunId) -> Result<(u32, Vec<CompositionError>), RetryFailure> {
        let dir = self.store.run_dir(run_id);
        let mut set = self.store.load(run_id).await?;
        set.layers.get_or_insert_with(LayerRefs::default);
        let (image, issues) = self.compose_blocking(&dir, &set).await?;

        set.stage = Stage::Composed;
        set.final_composed = Some(store::COMPOSED_FILE.to_string());
        // The image first: report.json completes the stage.
        store::write_png(&dir.join(store::COMPOSED_FILE), image).await?;
        store::write_json(&dir.join(store::REPORT_FILE), &set).await?;
        Ok((1, issues))
    }

    /// Read the background layer and compose on the blocking pool.
    async fn compose_blocking(
        &self,
        dir: &Path,
        set: &RunArtifactSet,
    ) -> Result<(RgbaImage, Vec<CompositionError>), PipelineError> {
        let rel = set
            .layers
            .as_ref()
            .map(|l| l.background_clean.clone())
            .unwrap_or_else(|| LayerRefs::default().background_clean);
        let background = store::read_png(&dir.join(&rel))
            .await
            .map_err(|e| CompositionError::LayerMissing {
                path: rel.clone(),
                detail: e.to_string(),
            })?;

        let fonts = Arc::clone(&self.fonts);
        let opts = self.composition_options();
        let set = set.clone();
        let (image, issues) =
            tokio::task::spawn_blocking(move || compose::compose(&background, &set, fonts.as_ref(), &opts))
                .await
                .map_err(|e| PipelineError::Internal(format!("composition task panicked: {e}")))??;
        for issue in &issues {
            debug!("composition issue: {}", issue);
        }
        Ok((image, issues))
    }

    // ── Editing ──────────────────────────────────────────────────────────

    async fn require_stage(&self, run_id: &RunId, required: Stage) -> Result<(), PipelineError> {
        let reached = self.store.completed_stage(run_id).await?;
        if reached < required {
            return Err(PipelineError::NotReady {
                run_id: run_id.to_string(),
                required,
                reached,
            });
        }
        Ok(())
    }

    /// Render `edits` over the stored artifacts without persisting anything.
    ///
    /// Needs a run that has at least associated its boxes. With an empty
    /// edit set on a composed run the result matches `final_composed.png`.
    pub async fn render(&self, run_id: &RunId, edits: &EditSet) -> Result<RenderOutput, PipelineError> {
        self.require_stage(run_id, Stage::BoxesAssociated).await?;
        let base = self.store.load(run_id).await?;
        self.render_from(run_id, &base, edits).await
    }

    async fn render_from(
        &self,
        run_id: &RunId,
        base: &RunArtifactSet,
        edits: &EditSet,
    ) -> Result<RenderOutput, PipelineError> {
        let (artifacts, mut issues) = edits.apply(base, self.config.sync_box_moves);
        for issue in &issues {
            warn!("{}: edit skipped: {}", run_id, issue);
        }
        let (image, render_issues) = self
            .compose_blocking(&self.store.run_dir(run_id), &artifacts)
            .await?;
        issues.extend(render_issues);
        Ok(RenderOutput {
            image,
            artifacts,
            issues,
        })
    }

    /// The editing client's entry point.
    ///
    /// Without `commit` the render is written to `renders/<timestamp>.png`
    /// and canonical state is untouched. With `commit` the canonical report
    /// is reloaded under the run lock, the edits are applied, the revision
    /// is bumped and both `final_composed.png` and `report.json` are
    /// replaced. Concurrent commits are serialised and none is lost.
    pub async fn submit_edits(
        &self,
        run_id: &RunId,
        edits: &EditSet,
        commit: bool,
    ) -> Result<EditOutcome, PipelineError> {
        let dir = self.store.run_dir(run_id);

        if !commit {
            let out = self.render(run_id, edits).await?;
            let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%3f");
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            let path = dir
                .join(store::RENDERS_DIR)
                .join(format!("{stamp}_{}.png", &suffix[..6]));
            store::write_png(&path, out.image).await?;
            info!("{}: preview written to {}", run_id, path.display());
            return Ok(EditOutcome {
                image_path: path,
                revision: out.artifacts.revision,
                committed: false,
                issues: out.issues,
            });
        }

        self.require_stage(run_id, Stage::Composed).await?;
        let _lock = self.lock(run_id).await?;
        let base = self.store.load(run_id).await?;
        let out = self.render_from(run_id, &base, edits).await?;

        let mut committed = out.artifacts;
        committed.revision = base.revision + 1;
        committed.stage = Stage::Composed;
        committed.final_composed = Some(store::COMPOSED_FILE.to_string());

        let image_path: PathBuf = dir.join(store::COMPOSED_FILE);
        store::write_png(&image_path, out.image).await?;
        store::write_json(&dir.join(store::REPORT_FILE), &committed).await?;
        info!("{}: committed revision {}", run_id, committed.revision);

        Ok(EditOutcome {
            image_path,
            revision: committed.revision,
            committed: true,
            issues: out.issues,
        })
    }

    // ── Inspection ───────────────────────────────────────────────────────

    /// Every run under the output root, newest first.
    pub async fn list_runs(&self) -> Result<Vec<RunSummary>, PipelineError> {
        self.store.list().await
    }

    /// The current artifact set of a run, whatever stage it has reached.
    pub async fn inspect(&self, run_id: &RunId) -> Result<RunArtifactSet, PipelineError> {
        self.store.load(run_id).await
    }
}

async fn load_layers(dir: &Path) -> Result<LayerSet, PipelineError> {
    let refs: LayerRefs = store::read_json(&dir.join(store::LAYERS_FILE)).await?;
    Ok(LayerSet {
        background: store::read_png(&dir.join(&refs.background_clean)).await?,
        text_layer: store::read_png(&dir.join(&refs.text_layer)).await?,
        ui_layer: store::read_png(&dir.join(&refs.ui_layer)).await?,
    })
}

/// Region a failure can be pinned on, when there is one.
fn failure_region(error: &PipelineError) -> Option<RegionId> {
    match error {
        PipelineError::Detection(DetectionError::MalformedGeometry { index, .. }) => {
            Some(RegionId::new(RegionKind::Text, *index))
        }
        PipelineError::Association(AssociationError::MalformedGeometry { index, .. }) => {
            Some(RegionId::new(RegionKind::Box, *index))
        }
        PipelineError::Composition(e) => e.region().cloned(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_region_points_at_the_bad_box() {
        let e = PipelineError::Detection(DetectionError::MalformedGeometry {
            index: 3,
            detail: String::new(),
        });
        assert_eq!(failure_region(&e).unwrap().as_str(), "text_3");
        let e = PipelineError::Association(AssociationError::MalformedGeometry {
            index: 1,
            detail: String::new(),
        });
        assert_eq!(failure_region(&e).unwrap().as_str(), "box_1");
        assert!(failure_region(&PipelineError::Internal("x".into())).is_none());
    }

    #[test]
    fn builder_requires_detector_and_layerer() {
        let config = PipelineConfig::default();
        assert!(matches!(
            Pipeline::builder(config).build(),
            Err(PipelineError::InvalidConfig(_))
        ));
    }
}
