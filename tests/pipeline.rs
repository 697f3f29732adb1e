//! Orchestrator integration tests.
//!
//! Every collaborator is an in-process mock with call counters, so these
//! run offline and exercise the real artifact store in a temp directory.

use async_trait::async_trait;
use image::{Rgba, RgbaImage};
use layersmith::{
    run_batch, BBox, BoxOverride, ClassificationError, Classifier, DetectionError, Detector, EditSet,
    LayerSet, Layerer, LayeringError, Pipeline, PipelineConfig, PipelineError, RawBox, RegionAnalysis,
    RegionId, Rgb, Role, RunId, Stage, TextOverride, TextRegion,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// ── Fixtures ─────────────────────────────────────────────────────────────────

const W: u32 = 64;
const H: u32 = 48;

/// Headline strip near the top, price line inside a CTA panel below it.
const HEADLINE: (f64, f64, f64, f64) = (10.0, 10.0, 20.0, 8.0);
const PRICE: (f64, f64, f64, f64) = (10.0, 30.0, 30.0, 10.0);
/// UI panel that fully contains PRICE.
const PANEL: (u32, u32, u32, u32) = (5, 25, 44, 20);

fn source_image() -> RgbaImage {
    RgbaImage::from_fn(W, H, |x, y| {
        let (px, py, pw, ph) = PANEL;
        if x >= px && x < px + pw && y >= py && y < py + ph {
            Rgba([200, 30, 30, 255])
        } else {
            Rgba([240, 240, 240, 255])
        }
    })
}

fn write_source(dir: &Path, name: &str) -> String {
    let path = dir.join(name);
    source_image().save(&path).unwrap();
    path.to_string_lossy().to_string()
}

struct MockDetector {
    calls: AtomicU32,
    delay: Option<Duration>,
}

impl MockDetector {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            delay: None,
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            delay: Some(delay),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Detector for MockDetector {
    async fn detect(&self, _image: &RgbaImage) -> Result<Vec<RawBox>, DetectionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        let (x, y, w, h) = HEADLINE;
        let (px, py, pw, ph) = PRICE;
        Ok(vec![RawBox::rect(x, y, w, h), RawBox::rect(px, py, pw, ph)])
    }
}

/// Answers with one analysis per box unless `short` is set.
struct MockClassifier {
    calls: AtomicU32,
    texts: Vec<&'static str>,
    short: bool,
}

impl MockClassifier {
    fn new(texts: Vec<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            texts,
            short: false,
        })
    }

    fn short() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            texts: vec!["only one"],
            short: true,
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Classifier for MockClassifier {
    async fn classify(
        &self,
        _image: &RgbaImage,
        boxes: &[BBox],
    ) -> Result<Vec<Option<RegionAnalysis>>, ClassificationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let n = if self.short { 1 } else { boxes.len() };
        Ok((0..n)
            .map(|i| {
                let role = if i == 0 { Role::Heading } else { Role::Cta };
                let text = self.texts.get(i).copied().unwrap_or("");
                Some(RegionAnalysis::role(role).with_text(text))
            })
            .collect())
    }
}

/// Fails the first `failures` calls with a transient error.
struct MockLayerer {
    calls: AtomicU32,
    failures: u32,
}

impl MockLayerer {
    fn new() -> Arc<Self> {
        Self::flaky(0)
    }

    fn flaky(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            failures,
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Layerer for MockLayerer {
    async fn layer(&self, image: &RgbaImage, _regions: &[TextRegion]) -> Result<LayerSet, LayeringError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.failures {
            return Err(LayeringError::Unavailable {
                detail: "503 Service Unavailable".into(),
            });
        }
        let (px, py, pw, ph) = PANEL;
        let ui_layer = RgbaImage::from_fn(W, H, |x, y| {
            if x >= px && x < px + pw && y >= py && y < py + ph {
                Rgba([200, 30, 30, 255])
            } else {
                Rgba([0, 0, 0, 0])
            }
        });
        Ok(LayerSet {
            background: image.clone(),
            text_layer: RgbaImage::from_pixel(W, H, Rgba([0, 0, 0, 0])),
            ui_layer,
        })
    }
}

struct Harness {
    _tmp: TempDir,
    root: PathBuf,
    input: String,
    detector: Arc<MockDetector>,
    classifier: Arc<MockClassifier>,
    layerer: Arc<MockLayerer>,
    pipeline: Pipeline,
}

fn config(root: &Path) -> PipelineConfig {
    PipelineConfig::builder()
        .output_root(root)
        .retry_backoff_ms(1)
        .stage_timeout_ms(5_000)
        .build()
        .unwrap()
}

fn pipeline_with(
    config: PipelineConfig,
    detector: Arc<MockDetector>,
    classifier: Arc<MockClassifier>,
    layerer: Arc<MockLayerer>,
) -> Pipeline {
    Pipeline::builder(config)
        .detector(detector)
        .classifier(classifier)
        .layerer(layerer)
        .build()
        .unwrap()
}

fn harness_with(classifier: Arc<MockClassifier>, layerer: Arc<MockLayerer>) -> Harness {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("runs");
    let input = write_source(tmp.path(), "banner.png");
    let detector = MockDetector::new();
    let pipeline = pipeline_with(config(&root), detector.clone(), classifier.clone(), layerer.clone());
    Harness {
        _tmp: tmp,
        root,
        input,
        detector,
        classifier,
        layerer,
        pipeline,
    }
}

fn harness() -> Harness {
    harness_with(MockClassifier::new(vec!["NEW IN", "Shop now"]), MockLayerer::new())
}

fn run_dir(root: &Path, run_id: &RunId) -> PathBuf {
    root.join(run_id.as_str())
}

fn read_json(path: &Path) -> serde_json::Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

fn id(s: &str) -> RegionId {
    RegionId::from(s)
}

// ── Full runs ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn full_run_produces_report_and_composite() {
    let h = harness();
    let out = h.pipeline.run(&h.input).await.unwrap();

    assert_eq!(out.stage, Stage::Composed);
    let dir = run_dir(&h.root, &out.run_id);
    for name in [
        "run.json",
        "source.png",
        "detection.json",
        "classification.json",
        "layers.json",
        "boxes.json",
        "final_composed.png",
        "report.json",
    ] {
        assert!(dir.join(name).exists(), "missing {name}");
    }
    assert!(!dir.join(".lock").exists(), "lock must be released");

    let ids: Vec<&str> = out.artifacts.text_regions.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["text_0", "text_1"]);
    assert_eq!(out.artifacts.text_regions[0].role, Role::Heading);
    assert_eq!(out.artifacts.text_regions[1].text, "Shop now");
    assert_eq!(out.stats.stages_run.len(), 5);
    assert!(out.stats.stages_skipped.is_empty());

    let composed = image::open(dir.join("final_composed.png")).unwrap();
    assert_eq!((composed.width(), composed.height()), (W, H));
}

#[tokio::test]
async fn panel_is_associated_with_the_text_it_contains() {
    let h = harness();
    let out = h.pipeline.run(&h.input).await.unwrap();

    let boxes = &out.artifacts.box_regions;
    assert_eq!(boxes.len(), 1);
    assert_eq!(boxes[0].id.as_str(), "box_0");
    assert_eq!(boxes[0].associated_text_id, Some(id("text_1")));
    assert_eq!(boxes[0].bbox, BBox::new(5, 25, 44, 20).unwrap());
    // Sampled outside the price text: the panel's own red.
    assert_eq!(boxes[0].color, Rgb::new(200, 30, 30));
    assert_eq!(out.stats.associated_boxes, 1);
}

#[tokio::test]
async fn empty_text_region_is_kept_and_still_associated() {
    let h = harness_with(MockClassifier::new(vec!["NEW IN", ""]), MockLayerer::new());
    let out = h.pipeline.run(&h.input).await.unwrap();

    let report = read_json(&run_dir(&h.root, &out.run_id).join("report.json"));
    let texts = report["text_regions"].as_array().unwrap();
    assert_eq!(texts.len(), 2);
    assert_eq!(texts[1]["id"], "text_1");
    assert_eq!(texts[1]["text"], "");
    assert!(!out.artifacts.text_regions[1].is_visible());
    assert_eq!(out.artifacts.box_regions[0].associated_text_id, Some(id("text_1")));
}

// ── Resume ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn resume_skips_completed_stages() {
    let h = harness();
    let partial = h.pipeline.run_until(&h.input, Stage::Layered).await.unwrap();
    assert_eq!(partial.stage, Stage::Layered);
    let dir = run_dir(&h.root, &partial.run_id);
    assert!(dir.join("layers.json").exists());
    assert!(!dir.join("boxes.json").exists());

    let done = h.pipeline.resume(&partial.run_id).await.unwrap();
    assert_eq!(done.stage, Stage::Composed);
    assert_eq!(h.detector.calls(), 1);
    assert_eq!(h.classifier.calls(), 1);
    assert_eq!(h.layerer.calls(), 1);
    assert_eq!(
        done.stats.stages_skipped,
        vec![Stage::Detected, Stage::Classified, Stage::Layered]
    );

    // Resuming a complete run recomputes nothing.
    let again = h.pipeline.resume(&partial.run_id).await.unwrap();
    assert!(again.stats.stages_run.is_empty());
    assert_eq!(h.detector.calls(), 1);
}

#[tokio::test]
async fn resume_after_layering_matches_uninterrupted_boxes() {
    let h = harness();
    let straight = h.pipeline.run(&h.input).await.unwrap();

    let partial = h.pipeline.run_until(&h.input, Stage::Layered).await.unwrap();
    assert_ne!(partial.run_id, straight.run_id);
    assert!(partial.artifacts.box_regions.is_empty());
    let resumed = h.pipeline.resume(&partial.run_id).await.unwrap();

    assert!(!straight.artifacts.box_regions.is_empty());
    assert_eq!(resumed.artifacts.box_regions, straight.artifacts.box_regions);
    assert_eq!(resumed.artifacts.text_regions, straight.artifacts.text_regions);
}

#[tokio::test]
async fn region_ids_are_stable_across_resume() {
    let h = harness();
    let partial = h.pipeline.run_until(&h.input, Stage::Detected).await.unwrap();
    let before: Vec<(String, BBox)> = partial
        .artifacts
        .text_regions
        .iter()
        .map(|t| (t.id.to_string(), t.bbox))
        .collect();

    let done = h.pipeline.resume(&partial.run_id).await.unwrap();
    let after: Vec<(String, BBox)> = done
        .artifacts
        .text_regions
        .iter()
        .map(|t| (t.id.to_string(), t.bbox))
        .collect();
    assert_eq!(before, after);
}

#[tokio::test]
async fn resume_of_unknown_run_is_not_found() {
    let h = harness();
    let missing = RunId::parse("run_19700101T000000000_deadbeef").unwrap();
    let err = h.pipeline.resume(&missing).await.unwrap_err();
    assert!(matches!(err, PipelineError::RunNotFound { .. }), "{err}");
}

// ── Failures ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn count_mismatch_fails_without_classification_artifact() {
    let h = harness_with(MockClassifier::short(), MockLayerer::new());
    let err = h.pipeline.run(&h.input).await.unwrap_err();

    let PipelineError::RunFailed { stage, attempts, source, .. } = &err else {
        panic!("expected RunFailed, got {err}");
    };
    assert_eq!(*stage, Stage::Classified);
    assert_eq!(*attempts, 1);
    assert!(matches!(
        **source,
        PipelineError::Classification(ClassificationError::CountMismatch { expected: 2, got: 1 })
    ));
    assert_eq!(h.classifier.calls(), 1, "validation errors are not retried");
    assert_eq!(h.layerer.calls(), 0);

    let runs = h.pipeline.list_runs().await.unwrap();
    let dir = run_dir(&h.root, &runs[0].run_id);
    assert!(dir.join("detection.json").exists());
    assert!(!dir.join("classification.json").exists());

    let failure = read_json(&dir.join("failure.json"));
    assert_eq!(failure["stage"], "classified");
    assert_eq!(failure["kind"], "validation");
    assert_eq!(runs[0].stage, Stage::Detected);
    assert!(runs[0].failure.is_some());
}

#[tokio::test]
async fn transient_layering_failure_is_retried() {
    let h = harness_with(MockClassifier::new(vec!["NEW IN", "Shop now"]), MockLayerer::flaky(1));
    let out = h.pipeline.run(&h.input).await.unwrap();

    assert_eq!(out.stage, Stage::Composed);
    assert_eq!(h.layerer.calls(), 2);
    let layered = out
        .stats
        .stages_run
        .iter()
        .find(|t| t.stage == Stage::Layered)
        .unwrap();
    assert_eq!(layered.attempts, 2);
    assert!(!run_dir(&h.root, &out.run_id).join("failure.json").exists());
}

#[tokio::test]
async fn timeout_is_recorded_then_cleared_on_resume() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("runs");
    let input = write_source(tmp.path(), "banner.png");

    let slow_config = PipelineConfig::builder()
        .output_root(&root)
        .retry_backoff_ms(1)
        .max_attempts(2)
        .stage_timeout_ms(30)
        .build()
        .unwrap();
    let slow = MockDetector::slow(Duration::from_secs(5));
    let classifier = MockClassifier::new(vec!["NEW IN", "Shop now"]);
    let layerer = MockLayerer::new();
    let pipeline = pipeline_with(slow_config, slow.clone(), classifier.clone(), layerer.clone());

    let err = pipeline.run(&input).await.unwrap_err();
    assert_eq!(err.kind(), "timeout");
    assert_eq!(slow.calls(), 2);

    let runs = pipeline.list_runs().await.unwrap();
    let run_id = runs[0].run_id.clone();
    let dir = run_dir(&root, &run_id);
    let failure = read_json(&dir.join("failure.json"));
    assert_eq!(failure["stage"], "detected");
    assert_eq!(failure["kind"], "timeout");
    assert_eq!(failure["attempts"], 2);
    assert!(!dir.join("detection.json").exists());

    let healthy = pipeline_with(config(&root), MockDetector::new(), classifier, layerer);
    let out = healthy.resume(&run_id).await.unwrap();
    assert_eq!(out.stage, Stage::Composed);
    assert!(!dir.join("failure.json").exists());
}

// ── Editing ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn empty_edit_set_reproduces_the_composite() {
    let h = harness();
    let out = h.pipeline.run(&h.input).await.unwrap();

    let rendered = h.pipeline.render(&out.run_id, &EditSet::default()).await.unwrap();
    let stored = image::open(run_dir(&h.root, &out.run_id).join("final_composed.png"))
        .unwrap()
        .to_rgba8();
    assert_eq!(rendered.image, stored);
    assert_eq!(rendered.artifacts, out.artifacts);
}

#[tokio::test]
async fn preview_leaves_canonical_state_untouched() {
    let h = harness();
    let out = h.pipeline.run(&h.input).await.unwrap();
    let dir = run_dir(&h.root, &out.run_id);
    let report_before = std::fs::read_to_string(dir.join("report.json")).unwrap();

    let edits = EditSet {
        boxes: vec![BoxOverride::new("box_0").color(Rgb::new(0, 0, 255))],
        ..Default::default()
    };
    let outcome = h.pipeline.submit_edits(&out.run_id, &edits, false).await.unwrap();

    assert!(!outcome.committed);
    assert_eq!(outcome.revision, 0);
    assert!(outcome.image_path.starts_with(dir.join("renders")));
    assert!(outcome.image_path.exists());
    assert_eq!(std::fs::read_to_string(dir.join("report.json")).unwrap(), report_before);

    let preview = image::open(&outcome.image_path).unwrap().to_rgba8();
    assert_eq!(preview.get_pixel(6, 26), &Rgba([0, 0, 255, 255]));
}

#[tokio::test]
async fn commit_applies_edits_and_bumps_revision() {
    let h = harness();
    let out = h.pipeline.run(&h.input).await.unwrap();

    let edits = EditSet {
        text: vec![TextOverride::new("text_0").text("SALE")],
        boxes: vec![BoxOverride::new("box_0").color(Rgb::new(0, 128, 0))],
    };
    let outcome = h.pipeline.submit_edits(&out.run_id, &edits, true).await.unwrap();
    assert!(outcome.committed);
    assert_eq!(outcome.revision, 1);

    let set = h.pipeline.inspect(&out.run_id).await.unwrap();
    assert_eq!(set.revision, 1);
    assert_eq!(set.text(&id("text_0")).unwrap().text, "SALE");
    assert_eq!(set.box_region(&id("box_0")).unwrap().color, Rgb::new(0, 128, 0));
    // Untouched regions keep their IDs and attributes.
    assert_eq!(set.text(&id("text_1")), out.artifacts.text(&id("text_1")));
}

#[tokio::test]
async fn concurrent_commits_are_serialised() {
    let h = harness();
    let out = h.pipeline.run(&h.input).await.unwrap();

    let a = EditSet {
        text: vec![TextOverride::new("text_0").text("A")],
        ..Default::default()
    };
    let b = EditSet {
        text: vec![TextOverride::new("text_1").text("B")],
        ..Default::default()
    };
    let (ra, rb) = tokio::join!(
        h.pipeline.submit_edits(&out.run_id, &a, true),
        h.pipeline.submit_edits(&out.run_id, &b, true),
    );
    let mut revisions = vec![ra.unwrap().revision, rb.unwrap().revision];
    revisions.sort();
    assert_eq!(revisions, vec![1, 2]);

    let set = h.pipeline.inspect(&out.run_id).await.unwrap();
    assert_eq!(set.revision, 2);
    assert_eq!(set.text(&id("text_0")).unwrap().text, "A");
    assert_eq!(set.text(&id("text_1")).unwrap().text, "B");
}

#[tokio::test]
async fn unknown_region_is_reported_not_fatal() {
    let h = harness();
    let out = h.pipeline.run(&h.input).await.unwrap();

    let edits = EditSet {
        text: vec![TextOverride::new("text_9").text("ghost")],
        ..Default::default()
    };
    let rendered = h.pipeline.render(&out.run_id, &edits).await.unwrap();
    assert!(rendered
        .issues
        .iter()
        .any(|i| i.region() == Some(&id("text_9"))));
}

#[tokio::test]
async fn edits_before_completion_are_not_ready() {
    let h = harness();
    let partial = h.pipeline.run_until(&h.input, Stage::Layered).await.unwrap();

    let err = h.pipeline.render(&partial.run_id, &EditSet::default()).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::NotReady {
            required: Stage::BoxesAssociated,
            reached: Stage::Layered,
            ..
        }
    ));

    h.pipeline
        .resume_until(&partial.run_id, Stage::BoxesAssociated)
        .await
        .unwrap();
    assert!(h.pipeline.render(&partial.run_id, &EditSet::default()).await.is_ok());
    let err = h
        .pipeline
        .submit_edits(&partial.run_id, &EditSet::default(), true)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::NotReady { required: Stage::Composed, .. }));
}

// ── Batch and listing ────────────────────────────────────────────────────────

#[tokio::test]
async fn batch_keeps_input_order_and_isolates_failures() {
    let h = harness();
    let missing = h.root.parent().unwrap().join("missing.png");
    let inputs = vec![h.input.clone(), missing.to_string_lossy().to_string()];

    let items = run_batch(&h.pipeline, &inputs, Stage::Composed).await;
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].index, 0);
    assert!(items[0].result.is_ok());
    assert_eq!(items[1].index, 1);
    assert!(items[1].result.is_err());
}

#[tokio::test]
async fn runs_are_listed_newest_first() {
    let h = harness();
    let first = h.pipeline.run_until(&h.input, Stage::Detected).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = h.pipeline.run(&h.input).await.unwrap();

    let runs = h.pipeline.list_runs().await.unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].run_id, second.run_id);
    assert_eq!(runs[0].stage, Stage::Composed);
    assert_eq!(runs[1].run_id, first.run_id);
    assert_eq!(runs[1].stage, Stage::Detected);
    assert!(runs.iter().all(|r| r.source_name.ends_with("banner.png")));
}
