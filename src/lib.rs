//! # layersmith
//!
//! Decompose a product or advertising image into independently editable
//! layers (a clean background, filled boxes, text regions) and re-render the
//! composite after edits to text, position, font or colour.
//!
//! ## Pipeline Overview
//!
//! ```text
//! image (path / URL)
//!  │
//!  ├─ 1. Detect     text boxes from a detector service → text_0, text_1, …
//!  ├─ 2. Classify   role + typography per box (vision LLM)
//!  ├─ 3. Layer      background_clean / text_layer / ui_layer rasters
//!  ├─ 4. Associate  UI boxes ↔ tightest containing text region → box_0, …
//!  └─ 5. Compose    background → boxes → text, written with report.json
//! ```
//!
//! Every stage persists its artifacts under `<output_root>/<run_id>/` before
//! the next begins. Resuming a run re-executes only what is missing, and
//! region IDs never change once assigned, so an editor can address the
//! same region across any number of round trips.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use layersmith::{EditSet, Pipeline, PipelineConfig, RemoteDetector, RemoteLayerer, TextOverride};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Classifier provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / …
//!     let config = PipelineConfig::builder().font_dir("fonts").build()?;
//!     let pipeline = Pipeline::builder(config)
//!         .detector(Arc::new(RemoteDetector::new("http://localhost:8001/detect")?))
//!         .layerer(Arc::new(RemoteLayerer::new("http://localhost:8002/layer")?))
//!         .build()?;
//!
//!     let run = pipeline.run("banner.png").await?;
//!     println!("{}: {} text regions", run.run_id, run.artifacts.text_regions.len());
//!
//!     let edits = EditSet {
//!         text: vec![TextOverride::new("text_0").text("Summer Sale")],
//!         ..Default::default()
//!     };
//!     let outcome = pipeline.submit_edits(&run.run_id, &edits, true).await?;
//!     println!("revision {} → {}", outcome.revision, outcome.image_path.display());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `layersmith` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! layersmith = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod artifacts;
pub mod batch;
pub mod config;
pub mod edit;
pub mod error;
pub mod geometry;
pub mod orchestrator;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod region;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use artifacts::{ImageDimensions, LayerRefs, RunArtifactSet, RunId};
pub use batch::{run_batch, run_stream, BatchItem, RunStream};
pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use edit::{BoxOverride, EditBBox, EditSet, TextOverride};
pub use error::{
    AssociationError, ClassificationError, CompositionError, DetectionError, LayeringError, PipelineError,
};
pub use geometry::{area, contains, intersection_area, iou, BBox};
pub use orchestrator::{Pipeline, PipelineBuilder};
pub use output::{EditOutcome, FailureRecord, RenderOutput, RunOutput, RunStats, RunSummary, StageTiming};
pub use pipeline::associate::{BoxDetector, UiLayerBoxDetector};
pub use pipeline::classify::{Classifier, RegionAnalysis};
pub use pipeline::detect::{Detector, RawBox};
pub use pipeline::fonts::{DirectoryFontResolver, FontHandle, FontResolver, MemoryFontResolver};
pub use pipeline::layer::{LayerSet, Layerer};
pub use pipeline::llm::LlmClassifier;
pub use pipeline::remote::{RemoteDetector, RemoteLayerer};
pub use progress::{NoopProgressCallback, ProgressCallback, RunProgressCallback};
pub use region::{BoxRegion, FontWeight, RegionId, Rgb, Role, Stage, TextCase, TextRegion};
