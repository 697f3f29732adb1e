//! Progress-callback trait for stage-level run events.
//!
//! Inject an [`Arc<dyn RunProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to observe a
//! run as it moves through its stages. The CLI drives an `indicatif` bar
//! from these events; a server could forward them to a websocket instead.
//!
//! # Example
//!
//! ```rust
//! use layersmith::{PipelineConfig, RunProgressCallback, Stage};
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! impl RunProgressCallback for Printer {
//!     fn on_stage_complete(&self, run_id: &str, stage: Stage, elapsed_ms: u64) {
//!         eprintln!("{run_id}: {stage} in {elapsed_ms}ms");
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(Arc::new(Printer))
//!     .build()
//!     .unwrap();
//! ```

use crate::region::Stage;
use std::sync::Arc;

/// Called by the orchestrator as a run advances.
///
/// Implementations must be `Send + Sync`: batch mode drives several runs
/// concurrently and every one of them reports through the same callback.
/// All methods default to no-ops.
pub trait RunProgressCallback: Send + Sync {
    /// A run (new or resumed) is about to execute `stages_remaining` stages.
    fn on_run_start(&self, run_id: &str, stages_remaining: usize) {
        let _ = (run_id, stages_remaining);
    }

    fn on_stage_start(&self, run_id: &str, stage: Stage) {
        let _ = (run_id, stage);
    }

    /// The stage's artifacts were already on disk; nothing was recomputed.
    fn on_stage_skipped(&self, run_id: &str, stage: Stage) {
        let _ = (run_id, stage);
    }

    /// A transient failure is being retried.
    ///
    /// * `attempt` — 1-indexed number of the attempt that just failed
    /// * `error`   — human-readable description of that failure
    fn on_stage_retry(&self, run_id: &str, stage: Stage, attempt: u32, error: &str) {
        let _ = (run_id, stage, attempt, error);
    }

    fn on_stage_complete(&self, run_id: &str, stage: Stage, elapsed_ms: u64) {
        let _ = (run_id, stage, elapsed_ms);
    }

    /// The run stopped at `stage`; a failure record has been written.
    fn on_run_failed(&self, run_id: &str, stage: Stage, error: &str) {
        let _ = (run_id, stage, error);
    }

    /// The run reached `stage` (its target, usually [`Stage::Composed`]).
    fn on_run_complete(&self, run_id: &str, stage: Stage) {
        let _ = (run_id, stage);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl RunProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn RunProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl RunProgressCallback for Recorder {
        fn on_stage_start(&self, _run_id: &str, stage: Stage) {
            self.events.lock().unwrap().push(format!("start:{stage}"));
        }

        fn on_stage_retry(&self, _run_id: &str, stage: Stage, attempt: u32, _error: &str) {
            self.events
                .lock()
                .unwrap()
                .push(format!("retry:{stage}:{attempt}"));
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_run_start("run_a", 5);
        cb.on_stage_start("run_a", Stage::Detected);
        cb.on_stage_skipped("run_a", Stage::Detected);
        cb.on_stage_retry("run_a", Stage::Layered, 1, "503");
        cb.on_stage_complete("run_a", Stage::Layered, 12);
        cb.on_run_failed("run_a", Stage::Layered, "boom");
        cb.on_run_complete("run_a", Stage::Composed);
    }

    #[test]
    fn overridden_methods_receive_events() {
        let rec = Recorder::default();
        let cb: &dyn RunProgressCallback = &rec;
        cb.on_stage_start("r", Stage::Layered);
        cb.on_stage_retry("r", Stage::Layered, 1, "503");
        cb.on_stage_complete("r", Stage::Layered, 5);
        assert_eq!(
            *rec.events.lock().unwrap(),
            vec!["start:layered".to_string(), "retry:layered:1".to_string()]
        );
    }
}
