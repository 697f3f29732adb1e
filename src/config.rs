//! Configuration for the layering pipeline.
//!
//! Every knob lives in [`PipelineConfig`], built via
//! [`PipelineConfigBuilder`]. Collaborators (detector, classifier, layering
//! service, font resolver) are not configuration; they are handed to
//! [`crate::orchestrator::Pipeline`] directly.

use crate::error::PipelineError;
use crate::geometry::DEFAULT_CONTAINMENT;
use crate::progress::ProgressCallback;
use crate::region::FontWeight;
use edgequake_llm::LLMProvider;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for pipeline runs and re-renders.
///
/// # Example
/// ```rust
/// use layersmith::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .output_root("/tmp/layersmith")
///     .max_attempts(5)
///     .stage_timeout_ms(10_000)
///     .build()
///     .unwrap();
/// assert_eq!(config.max_attempts, 5);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Root of the run-directory namespace. Default: `pipeline_outputs`.
    pub output_root: PathBuf,

    /// Attempts per stage call when the failure is transient. Default: 3.
    ///
    /// Validation failures (malformed geometry, count mismatch) are never
    /// retried regardless of this value.
    pub max_attempts: u32,

    /// Initial retry delay in milliseconds. Default: 500.
    ///
    /// Doubles after each attempt: 500 ms → 1 s → 2 s.
    pub retry_backoff_ms: u64,

    /// Time budget for one external call (detect, classify, layer). Default: 30 000.
    pub stage_timeout_ms: u64,

    /// Coverage a box needs over a text region to back it. Default: 0.9.
    pub containment_tolerance: f64,

    /// Rendered font size as a fraction of bbox height. Default: 0.7.
    pub font_size_ratio: f32,

    /// Family used when a region's own font cannot be resolved. Default: Roboto.
    pub default_font_family: String,

    /// Weight used together with `default_font_family`. Default: 400.
    pub default_font_weight: FontWeight,

    /// Directory searched by the built-in font resolver.
    pub font_dir: Option<PathBuf>,

    /// Move associated boxes together with an edited text region. Default: true.
    pub sync_box_moves: bool,

    /// Runs processed at once by [`crate::batch::run_batch`]. Default: 4.
    pub concurrency: usize,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// How long a writer waits for the per-run lock. Default: 10 000.
    pub lock_timeout_ms: u64,

    /// Age after which an abandoned lock file is broken. Default: 600.
    pub lock_stale_secs: u64,

    /// VLM model identifier for the LLM classifier, e.g. "gpt-4.1-mini".
    pub model: Option<String>,

    /// VLM provider name (e.g. "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature for the classifier. Default: 0.1.
    pub temperature: f32,

    /// Token cap for one classifier response. Default: 4096.
    pub max_tokens: usize,

    /// Stage-level progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("pipeline_outputs"),
            max_attempts: 3,
            retry_backoff_ms: 500,
            stage_timeout_ms: 30_000,
            containment_tolerance: DEFAULT_CONTAINMENT,
            font_size_ratio: 0.7,
            default_font_family: "Roboto".to_string(),
            default_font_weight: FontWeight::REGULAR,
            font_dir: None,
            sync_box_moves: true,
            concurrency: 4,
            download_timeout_secs: 120,
            lock_timeout_ms: 10_000,
            lock_stale_secs: 600,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.1,
            max_tokens: 4096,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("output_root", &self.output_root)
            .field("max_attempts", &self.max_attempts)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("stage_timeout_ms", &self.stage_timeout_ms)
            .field("containment_tolerance", &self.containment_tolerance)
            .field("font_size_ratio", &self.font_size_ratio)
            .field("default_font_family", &self.default_font_family)
            .field("default_font_weight", &self.default_font_weight)
            .field("font_dir", &self.font_dir)
            .field("sync_box_moves", &self.sync_box_moves)
            .field("concurrency", &self.concurrency)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn RunProgressCallback>"),
            )
            .finish()
    }
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn output_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.output_root = root.into();
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn stage_timeout_ms(mut self, ms: u64) -> Self {
        self.config.stage_timeout_ms = ms;
        self
    }

    pub fn stage_timeout(mut self, d: Duration) -> Self {
        self.config.stage_timeout_ms = d.as_millis() as u64;
        self
    }

    pub fn containment_tolerance(mut self, t: f64) -> Self {
        self.config.containment_tolerance = t;
        self
    }

    pub fn font_size_ratio(mut self, r: f32) -> Self {
        self.config.font_size_ratio = r;
        self
    }

    pub fn default_font(mut self, family: impl Into<String>, weight: FontWeight) -> Self {
        self.config.default_font_family = family.into();
        self.config.default_font_weight = weight;
        self
    }

    pub fn font_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.font_dir = Some(dir.into());
        self
    }

    pub fn sync_box_moves(mut self, v: bool) -> Self {
        self.config.sync_box_moves = v;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn lock_timeout_ms(mut self, ms: u64) -> Self {
        self.config.lock_timeout_ms = ms;
        self
    }

    pub fn lock_stale_secs(mut self, secs: u64) -> Self {
        self.config.lock_stale_secs = secs;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if c.max_attempts == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_attempts must be ≥ 1".into(),
            ));
        }
        if c.stage_timeout_ms == 0 {
            return Err(PipelineError::InvalidConfig(
                "stage_timeout_ms must be ≥ 1".into(),
            ));
        }
        let stage_budget_ms = c.stage_timeout_ms.saturating_mul(c.max_attempts as u64);
        if c.lock_stale_secs.saturating_mul(1000) <= stage_budget_ms {
            return Err(PipelineError::InvalidConfig(format!(
                "lock_stale_secs ({}s) must exceed stage_timeout_ms × max_attempts ({}ms)",
                c.lock_stale_secs, stage_budget_ms
            )));
        }
        if !(c.containment_tolerance > 0.0 && c.containment_tolerance <= 1.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "containment_tolerance must be in (0, 1], got {}",
                c.containment_tolerance
            )));
        }
        if !(c.font_size_ratio > 0.0 && c.font_size_ratio <= 2.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "font_size_ratio must be in (0, 2], got {}",
                c.font_size_ratio
            )));
        }
        if c.default_font_family.trim().is_empty() {
            return Err(PipelineError::InvalidConfig(
                "default_font_family must not be empty".into(),
            ));
        }
        if c.output_root.as_os_str().is_empty() {
            return Err(PipelineError::InvalidConfig(
                "output_root must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}
