//! CLI binary for layersmith.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PipelineConfig`, wires the remote detector and layering services, and
//! prints results.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use image::RgbaImage;
use layersmith::{
    run_batch, BBox, ClassificationError, Classifier, EditSet, Pipeline, PipelineConfig, ProgressCallback,
    RegionAnalysis, RemoteDetector, RemoteLayerer, RunId, RunOutput, RunProgressCallback, Stage,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one bar counting stages across every run in
/// the invocation, with a log line per stage. Runs in a batch report
/// interleaved, so start times are keyed by run and stage.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<(String, Stage), Instant>>,
    failures: AtomicUsize,
}

impl CliProgressCallback {
    /// Start as a spinner; the bar grows as each run announces its stages.
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Loading image…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            failures: AtomicUsize::new(0),
        })
    }

    fn grow_bar(&self, stages: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>2}/{len} stages  \
             ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        let len = self.bar.length().unwrap_or(0) + stages as u64;
        self.bar.set_length(len);
        self.bar.set_style(style);
        self.bar.set_prefix("Decomposing");
    }

    fn take_elapsed(&self, run_id: &str, stage: Stage) -> u128 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut m| m.remove(&(run_id.to_string(), stage)))
            .map(|t| t.elapsed().as_millis())
            .unwrap_or(0)
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl RunProgressCallback for CliProgressCallback {
    fn on_run_start(&self, run_id: &str, stages_remaining: usize) {
        self.grow_bar(stages_remaining);
        self.bar.println(format!(
            "{} {}  {}",
            cyan("◆"),
            bold(run_id),
            dim(&format!("{stages_remaining} stages to run")),
        ));
    }

    fn on_stage_start(&self, run_id: &str, stage: Stage) {
        if let Ok(mut m) = self.start_times.lock() {
            m.insert((run_id.to_string(), stage), Instant::now());
        }
        self.bar.set_message(format!("{stage}"));
    }

    fn on_stage_skipped(&self, run_id: &str, stage: Stage) {
        self.bar.println(format!(
            "  {} {:<17} {}",
            dim("·"),
            stage.as_str(),
            dim(&format!("{run_id}  already on disk")),
        ));
    }

    fn on_stage_retry(&self, _run_id: &str, stage: Stage, attempt: u32, error: &str) {
        let msg = truncate(error, 70);
        self.bar.println(format!(
            "  {} {:<17} attempt {} failed: {}",
            yellow("↻"),
            stage.as_str(),
            attempt,
            dim(&msg),
        ));
    }

    fn on_stage_complete(&self, run_id: &str, stage: Stage, _elapsed_ms: u64) {
        let elapsed = self.take_elapsed(run_id, stage);
        self.bar.println(format!(
            "  {} {:<17} {}",
            green("✓"),
            stage.as_str(),
            dim(&format!("{:.1}s", elapsed as f64 / 1000.0)),
        ));
        self.bar.inc(1);
    }

    fn on_run_failed(&self, run_id: &str, stage: Stage, error: &str) {
        let elapsed = self.take_elapsed(run_id, stage);
        self.failures.fetch_add(1, Ordering::SeqCst);
        self.bar.println(format!(
            "  {} {:<17} {}  {}",
            red("✗"),
            stage.as_str(),
            red(&truncate(error, 80)),
            dim(&format!("{:.1}s", elapsed as f64 / 1000.0)),
        ));
    }

    fn on_run_complete(&self, run_id: &str, stage: Stage) {
        self.bar
            .println(format!("{} {} reached {}", green("✔"), bold(run_id), stage));
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let cut: String = s.chars().take(max - 1).collect();
        format!("{cut}\u{2026}")
    } else {
        s.to_string()
    }
}

const AFTER_HELP: &str = r##"EXAMPLES:
  # Decompose an image end to end
  layersmith run banner.png

  # Several inputs, four at a time
  layersmith --concurrency 4 run a.png b.png https://example.com/c.jpg

  # Stop after layering, finish later
  layersmith run banner.png --until layered
  layersmith resume run_20260101T120000123_1a2b3c4d

  # Preview edits without touching the run
  layersmith render run_20260101T120000123_1a2b3c4d --edits edits.json

  # Commit edits (bumps the revision, rewrites final_composed.png)
  layersmith render run_20260101T120000123_1a2b3c4d --edits edits.json --commit

  # List runs, newest first
  layersmith list

  # Full report for one run as JSON
  layersmith --json inspect run_20260101T120000123_1a2b3c4d

EDITS FILE:
  {
    "text":  [{ "id": "text_0", "text": "Summer Sale", "color": "#FFFFFF" }],
    "boxes": [{ "id": "box_0", "color": "#D02020" }]
  }

STAGES:
  detected, classified, layered, boxes_associated, composed

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY            OpenAI API key (classifier)
  ANTHROPIC_API_KEY         Anthropic API key (classifier)
  GEMINI_API_KEY            Google Gemini API key (classifier)
  EDGEQUAKE_PROVIDER        Classifier provider (same as --provider)
  EDGEQUAKE_LLM_PROVIDER    Provider used with EDGEQUAKE_MODEL when no flag is set
  EDGEQUAKE_MODEL           Override classifier model ID
  LAYERSMITH_DETECTOR_URL   Text detection service endpoint
  LAYERSMITH_LAYERING_URL   Layer separation service endpoint
  LAYERSMITH_OUTPUT_ROOT    Directory holding one folder per run
  LAYERSMITH_FONT_DIR       Directory of .ttf/.otf files named Family-Weight
"##;

/// Decompose images into editable layers and re-render them after edits.
#[derive(Parser, Debug)]
#[command(
    name = "layersmith",
    version,
    about = "Decompose images into editable text and box layers",
    long_about = "Decompose product and advertising images into a clean background, filled UI \
boxes and classified text regions, persisted per run so that any stage can be resumed and the \
composite can be re-rendered after edits to text, position, font or colour.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Directory holding one folder per run.
    #[arg(long, global = true, env = "LAYERSMITH_OUTPUT_ROOT", default_value = "pipeline_outputs")]
    output_root: PathBuf,

    /// Text detection service endpoint.
    #[arg(long, global = true, env = "LAYERSMITH_DETECTOR_URL")]
    detector_url: Option<String>,

    /// Layer separation service endpoint.
    #[arg(long, global = true, env = "LAYERSMITH_LAYERING_URL")]
    layering_url: Option<String>,

    /// Classifier LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, global = true, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Classifier model ID (default: gpt-4.1-nano).
    #[arg(long, global = true, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// Directory of font files named `Family-Weight.ttf`.
    #[arg(long, global = true, env = "LAYERSMITH_FONT_DIR")]
    font_dir: Option<PathBuf>,

    /// Attempts per external call on transient failure.
    #[arg(long, global = true, env = "LAYERSMITH_MAX_ATTEMPTS", default_value_t = 3,
          value_parser = clap::value_parser!(u32).range(1..=10))]
    max_attempts: u32,

    /// Per-call timeout for external services, in milliseconds.
    #[arg(long, global = true, env = "LAYERSMITH_STAGE_TIMEOUT_MS", default_value_t = 120_000)]
    stage_timeout_ms: u64,

    /// Number of runs processed at once in batch mode.
    #[arg(short, long, global = true, env = "LAYERSMITH_CONCURRENCY", default_value_t = 2)]
    concurrency: usize,

    /// Output structured JSON instead of a summary.
    #[arg(long, global = true, env = "LAYERSMITH_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, global = true, env = "LAYERSMITH_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "LAYERSMITH_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "LAYERSMITH_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start new runs from image files or URLs.
    Run {
        /// One or more local image paths or HTTP/HTTPS URLs.
        #[arg(required = true)]
        inputs: Vec<String>,

        /// Stop once this stage is complete.
        #[arg(long, default_value = "composed")]
        until: Stage,
    },
    /// Continue an existing run from its last completed stage.
    Resume {
        run_id: String,

        #[arg(long, default_value = "composed")]
        until: Stage,
    },
    /// Re-render a run with edits, as a preview or a committed revision.
    Render {
        run_id: String,

        /// JSON file with `text` and `boxes` override lists.
        #[arg(long)]
        edits: PathBuf,

        /// Replace the canonical report and composite.
        #[arg(long)]
        commit: bool,
    },
    /// List runs under the output root, newest first.
    List,
    /// Print the artifact set of a run.
    Inspect { run_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let g = &cli.global;

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO-level library logs.
    let show_progress = !g.quiet && !g.no_progress && !g.json && runs_stages(&cli.command);
    let filter = if g.verbose {
        "debug"
    } else if g.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(io::stderr)
        .init();

    let progress = show_progress.then(CliProgressCallback::new_dynamic);
    let callback: Option<ProgressCallback> = progress
        .clone()
        .map(|cb| cb as Arc<dyn RunProgressCallback>);

    let config = build_config(g, callback)?;
    let pipeline = build_pipeline(g, config, runs_stages(&cli.command))?;

    let outcome = dispatch(&cli, &pipeline).await;
    if let Some(p) = &progress {
        p.finish();
        let failed = p.failures.load(Ordering::SeqCst);
        if failed > 0 && !g.quiet {
            eprintln!("{} {} run(s) failed", red("✘"), bold(&failed.to_string()));
        }
    }
    outcome
}

fn runs_stages(command: &Command) -> bool {
    matches!(command, Command::Run { .. } | Command::Resume { .. })
}

async fn dispatch(cli: &Cli, pipeline: &Pipeline) -> Result<()> {
    let g = &cli.global;
    match &cli.command {
        Command::Run { inputs, until } => {
            if let [input] = inputs.as_slice() {
                let out = pipeline
                    .run_until(input, *until)
                    .await
                    .with_context(|| format!("Run failed for {input}"))?;
                print_run(g, &out)?;
                return Ok(());
            }

            let items = run_batch(pipeline, inputs, *until).await;
            let mut failed = 0;
            for item in &items {
                match &item.result {
                    Ok(out) => print_run(g, out)?,
                    Err(e) => {
                        failed += 1;
                        eprintln!("{} {}  {}", red("✗"), item.input, red(&e.to_string()));
                    }
                }
            }
            if failed > 0 {
                anyhow::bail!("{failed} of {} inputs failed", items.len());
            }
        }
        Command::Resume { run_id, until } => {
            let id = parse_run_id(run_id)?;
            let out = pipeline
                .resume_until(&id, *until)
                .await
                .with_context(|| format!("Resume failed for {id}"))?;
            print_run(g, &out)?;
        }
        Command::Render { run_id, edits, commit } => {
            let id = parse_run_id(run_id)?;
            let raw = tokio::fs::read_to_string(edits)
                .await
                .with_context(|| format!("Failed to read edits from {:?}", edits))?;
            let edit_set: EditSet = serde_json::from_str(&raw)
                .with_context(|| format!("Invalid edits file {:?}", edits))?;

            let outcome = pipeline
                .submit_edits(&id, &edit_set, *commit)
                .await
                .with_context(|| format!("Render failed for {id}"))?;

            if g.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&outcome).context("Failed to serialise outcome")?
                );
            } else if !g.quiet {
                for issue in &outcome.issues {
                    eprintln!("  {} {}", yellow("⚠"), issue);
                }
                let verb = if outcome.committed { "committed" } else { "preview" };
                eprintln!(
                    "{}  {} revision {}  →  {}",
                    green("✔"),
                    verb,
                    outcome.revision,
                    bold(&outcome.image_path.display().to_string()),
                );
            }
        }
        Command::List => {
            let runs = pipeline.list_runs().await.context("Failed to list runs")?;
            if g.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&runs).context("Failed to serialise run list")?
                );
            } else {
                for r in &runs {
                    let status = match &r.failure {
                        Some(f) => red(&format!("failed at {} ({})", f.stage, f.kind)),
                        None => green(r.stage.as_str()),
                    };
                    println!("{}  {:<24} rev {:<3} {}", r.run_id, r.source_name, r.revision, status);
                }
                if runs.is_empty() && !g.quiet {
                    eprintln!("{}", dim(&format!("No runs under {}", g.output_root.display())));
                }
            }
        }
        Command::Inspect { run_id } => {
            let id = parse_run_id(run_id)?;
            let set = pipeline
                .inspect(&id)
                .await
                .with_context(|| format!("Failed to inspect {id}"))?;
            if g.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&set).context("Failed to serialise report")?
                );
            } else {
                println!("Run:          {}", set.run_id);
                println!("Source:       {}", set.source_name);
                println!("Size:         {}x{}", set.dimensions.width, set.dimensions.height);
                println!("Stage:        {}", set.stage);
                println!("Revision:     {}", set.revision);
                for t in &set.text_regions {
                    println!(
                        "  {:<8} {:<10} {:>4},{:<4} {:>4}x{:<4} {}",
                        t.id.as_str(),
                        format!("{:?}", t.role).to_lowercase(),
                        t.bbox.x,
                        t.bbox.y,
                        t.bbox.width,
                        t.bbox.height,
                        if t.is_visible() { t.display_text() } else { dim("(deleted)") },
                    );
                }
                for b in &set.box_regions {
                    let owner = b.associated_text_id.as_ref().map(|id| id.as_str()).unwrap_or("-");
                    println!(
                        "  {:<8} {:<10} {:>4},{:<4} {:>4}x{:<4} {}",
                        b.id.as_str(),
                        owner,
                        b.bbox.x,
                        b.bbox.y,
                        b.bbox.width,
                        b.bbox.height,
                        b.color.to_hex(),
                    );
                }
            }
        }
    }
    Ok(())
}

fn print_run(g: &GlobalArgs, out: &RunOutput) -> Result<()> {
    if g.json {
        println!(
            "{}",
            serde_json::to_string_pretty(out).context("Failed to serialise run output")?
        );
        return Ok(());
    }
    for issue in &out.issues {
        eprintln!("  {} {}", yellow("⚠"), issue);
    }
    if g.quiet {
        return Ok(());
    }
    eprintln!(
        "{}  {}  {}  {} text / {} boxes ({} associated)  {}ms  →  {}",
        green("✔"),
        bold(out.run_id.as_str()),
        out.stage,
        out.stats.text_regions,
        out.stats.box_regions,
        out.stats.associated_boxes,
        out.stats.total_duration_ms,
        bold(&out.run_dir.display().to_string()),
    );
    Ok(())
}

fn parse_run_id(raw: &str) -> Result<RunId> {
    RunId::parse(raw).with_context(|| format!("Invalid run id '{raw}'"))
}

/// Map CLI args to `PipelineConfig`.
fn build_config(g: &GlobalArgs, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    // A live lock must outlast the slowest stage, retries included.
    let stage_budget_secs = g.stage_timeout_ms.saturating_mul(g.max_attempts as u64) / 1000;
    let mut builder = PipelineConfig::builder()
        .output_root(&g.output_root)
        .max_attempts(g.max_attempts)
        .stage_timeout_ms(g.stage_timeout_ms)
        .lock_stale_secs(stage_budget_secs.saturating_add(60).max(600))
        .concurrency(g.concurrency);

    if let Some(dir) = &g.font_dir {
        builder = builder.font_dir(dir);
    }
    if let Some(model) = &g.model {
        builder = builder.model(model);
    }
    if let Some(provider) = &g.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// Classifier used by commands that never execute a stage, so that `list`,
/// `inspect` and `render` work without any LLM credentials.
struct Offline;

#[async_trait]
impl Classifier for Offline {
    async fn classify(
        &self,
        _image: &RgbaImage,
        _boxes: &[BBox],
    ) -> Result<Vec<Option<RegionAnalysis>>, ClassificationError> {
        Err(ClassificationError::Unavailable {
            detail: "no classifier configured for this command".into(),
        })
    }
}

/// Wire the remote services. Endpoints default to local ports.
fn build_pipeline(g: &GlobalArgs, config: PipelineConfig, needs_classifier: bool) -> Result<Pipeline> {
    let detector_url = g
        .detector_url
        .clone()
        .unwrap_or_else(|| "http://127.0.0.1:8001/detect".to_string());
    let layering_url = g
        .layering_url
        .clone()
        .unwrap_or_else(|| "http://127.0.0.1:8002/layer".to_string());

    let detector = RemoteDetector::new(detector_url).context("Failed to create detector client")?;
    let layerer = RemoteLayerer::new(layering_url).context("Failed to create layering client")?;

    let mut builder = Pipeline::builder(config)
        .detector(Arc::new(detector))
        .layerer(Arc::new(layerer));
    if !needs_classifier {
        builder = builder.classifier(Arc::new(Offline));
    }
    builder.build().context("Failed to build pipeline")
}
