//! On-disk run layout.
//!
//! ```text
//! <output_root>/<run_id>/
//!   run.json              Created
//!   source.png            Created
//!   detection.json        Detected
//!   classification.json   Classified
//!   layers/*.png          (rasters, written before layers.json)
//!   layers.json           Layered
//!   boxes.json            BoxesAssociated
//!   final_composed.png    Composed
//!   report.json           Composed (the editing document)
//!   renders/<ts>.png      previews
//!   failure.json          last failure, informational
//!   .lock                 advisory writer lock
//! ```
//!
//! A run's stage is never stored. [`ArtifactStore::completed_stage`] walks
//! the stages in order and stops at the first one whose marker files are
//! missing, so a crash between two writes simply leaves the later stage
//! incomplete. Every file is written to a temporary sibling and renamed
//! into place, so a marker is either absent or complete.

use crate::artifacts::{ImageDimensions, LayerRefs, RunArtifactSet, RunId};
use crate::error::PipelineError;
use crate::output::{FailureRecord, RunSummary};
use crate::region::{BoxRegion, Stage, TextRegion};
use image::RgbaImage;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::Write;
use tokio::io::AsyncWriteExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

pub const RUN_FILE: &str = "run.json";
pub const SOURCE_FILE: &str = "source.png";
pub const DETECTION_FILE: &str = "detection.json";
pub const CLASSIFICATION_FILE: &str = "classification.json";
pub const LAYERS_FILE: &str = "layers.json";
pub const BOXES_FILE: &str = "boxes.json";
pub const COMPOSED_FILE: &str = "final_composed.png";
pub const REPORT_FILE: &str = "report.json";
pub const FAILURE_FILE: &str = "failure.json";
pub const LOCK_FILE: &str = ".lock";
pub const RENDERS_DIR: &str = "renders";

/// Files whose presence marks a stage as complete.
pub fn stage_markers(stage: Stage) -> &'static [&'static str] {
    match stage {
        Stage::Created => &[RUN_FILE, SOURCE_FILE],
        Stage::Detected => &[DETECTION_FILE],
        Stage::Classified => &[CLASSIFICATION_FILE],
        Stage::Layered => &[LAYERS_FILE],
        Stage::BoxesAssociated => &[BOXES_FILE],
        Stage::Composed => &[COMPOSED_FILE, REPORT_FILE],
    }
}

/// Contents of `run.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub source_name: String,
    pub dimensions: ImageDimensions,
    pub created_at: String,
}

/// Filesystem-backed artifact store rooted at the configured output root.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.root.join(run_id.as_str())
    }

    fn not_found(&self, run_id: &RunId) -> PipelineError {
        PipelineError::RunNotFound {
            run_id: run_id.to_string(),
            root: self.root.clone(),
        }
    }

    // ── Run creation ─────────────────────────────────────────────────────

    /// Create the run directory with its source image and `run.json`.
    pub async fn create_run(&self, record: &RunRecord, source: RgbaImage) -> Result<(), PipelineError> {
        let dir = self.run_dir(&record.run_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| PipelineError::store(&dir, e))?;
        // source.png first: run.json is the marker that the run exists.
        write_png(&dir.join(SOURCE_FILE), source).await?;
        write_json(&dir.join(RUN_FILE), record).await
    }

    pub async fn read_record(&self, run_id: &RunId) -> Result<RunRecord, PipelineError> {
        let path = self.run_dir(run_id).join(RUN_FILE);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(self.not_found(run_id));
        }
        read_json(&path).await
    }

    // ── Stage inspection ─────────────────────────────────────────────────

    /// The furthest stage whose artifacts, and those of every earlier stage,
    /// are all present.
    pub async fn completed_stage(&self, run_id: &RunId) -> Result<Stage, PipelineError> {
        let dir = self.run_dir(run_id);
        let mut reached: Option<Stage> = None;
        for stage in Stage::ALL {
            let mut complete = true;
            for name in stage_markers(stage) {
                if !tokio::fs::try_exists(dir.join(name)).await.unwrap_or(false) {
                    complete = false;
                    break;
                }
            }
            if !complete {
                break;
            }
            reached = Some(stage);
        }
        reached.ok_or_else(|| self.not_found(run_id))
    }

    /// Rebuild the artifact set from whatever the run directory holds.
    ///
    /// A composed run is read from `report.json`, which carries committed
    /// edits. Earlier runs are assembled from the per-stage records.
    pub async fn load(&self, run_id: &RunId) -> Result<RunArtifactSet, PipelineError> {
        let stage = self.completed_stage(run_id).await?;
        let dir = self.run_dir(run_id);
        if stage == Stage::Composed {
            let path = dir.join(REPORT_FILE);
            let mut set: RunArtifactSet = read_json(&path).await?;
            set.stage = Stage::Composed;
            return checked(set, path);
        }

        let record = self.read_record(run_id).await?;
        let mut set = RunArtifactSet::new(record.run_id, record.source_name, record.dimensions);
        set.stage = stage;
        if stage >= Stage::Classified {
            set.text_regions = read_json::<Vec<TextRegion>>(&dir.join(CLASSIFICATION_FILE)).await?;
        } else if stage >= Stage::Detected {
            set.text_regions = read_json::<Vec<TextRegion>>(&dir.join(DETECTION_FILE)).await?;
        }
        if stage >= Stage::Layered {
            set.layers = Some(read_json::<LayerRefs>(&dir.join(LAYERS_FILE)).await?);
        }
        if stage >= Stage::BoxesAssociated {
            set.box_regions = read_json::<Vec<BoxRegion>>(&dir.join(BOXES_FILE)).await?;
        }
        checked(set, dir)
    }

    pub async fn load_source(&self, run_id: &RunId) -> Result<RgbaImage, PipelineError> {
        read_png(&self.run_dir(run_id).join(SOURCE_FILE)).await
    }

    // ── Failure records ──────────────────────────────────────────────────

    pub async fn write_failure(&self, run_id: &RunId, record: &FailureRecord) -> Result<(), PipelineError> {
        write_json(&self.run_dir(run_id).join(FAILURE_FILE), record).await
    }

    pub async fn read_failure(&self, run_id: &RunId) -> Option<FailureRecord> {
        let path = self.run_dir(run_id).join(FAILURE_FILE);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return None;
        }
        match read_json(&path).await {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Ignoring unreadable failure record {}: {}", path.display(), e);
                None
            }
        }
    }

    pub async fn clear_failure(&self, run_id: &RunId) -> Result<(), PipelineError> {
        let path = self.run_dir(run_id).join(FAILURE_FILE);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PipelineError::store(path, e)),
        }
    }

    // ── Listing ──────────────────────────────────────────────────────────

    /// All runs under the root, newest first.
    pub async fn list(&self) -> Result<Vec<RunSummary>, PipelineError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PipelineError::store(&self.root, e)),
        };

        let mut runs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PipelineError::store(&self.root, e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(run_id) = RunId::parse(&name) else { continue };
            let record = match self.read_record(&run_id).await {
                Ok(r) => r,
                Err(e) => {
                    debug!("Skipping {}: {}", name, e);
                    continue;
                }
            };
            let stage = self.completed_stage(&run_id).await?;
            let revision = if stage == Stage::Composed {
                self.load(&run_id).await.map(|s| s.revision).unwrap_or(0)
            } else {
                0
            };
            runs.push(RunSummary {
                failure: self.read_failure(&run_id).await,
                run_id,
                source_name: record.source_name,
                stage,
                revision,
            });
        }
        runs.sort_by(|a, b| b.run_id.cmp(&a.run_id));
        Ok(runs)
    }

    // ── Locking ──────────────────────────────────────────────────────────

    /// Acquire the run's advisory writer lock, waiting up to `timeout`.
    ///
    /// A lock file older than `stale_after` is assumed abandoned by a
    /// crashed writer and is broken.
    pub async fn lock(
        &self,
        run_id: &RunId,
        timeout: Duration,
        stale_after: Duration,
    ) -> Result<RunLock, PipelineError> {
        let dir = self.run_dir(run_id);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(self.not_found(run_id));
        }
        let path = dir.join(LOCK_FILE);
        let start = Instant::now();
        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut f) => {
                    let _ = f.write_all(lock_stamp().as_bytes()).await;
                    debug!("Locked {}", run_id);
                    return Ok(RunLock { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path, stale_after).await {
                        warn!("Breaking stale lock on {}", run_id);
                        let _ = tokio::fs::remove_file(&path).await;
                        continue;
                    }
                    if start.elapsed() >= timeout {
                        return Err(PipelineError::RunLocked {
                            run_id: run_id.to_string(),
                            waited_ms: start.elapsed().as_millis() as u64,
                        });
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Err(e) => return Err(PipelineError::store(path, e)),
            }
        }
    }
}

fn lock_stamp() -> String {
    format!("pid={} at={}\n", std::process::id(), chrono::Utc::now().to_rfc3339())
}

async fn lock_is_stale(path: &Path, stale_after: Duration) -> bool {
    tokio::fs::metadata(path)
        .await
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| SystemTime::now().duration_since(t).ok())
        .is_some_and(|age| age > stale_after)
}

/// Held while a process writes into a run directory. Released on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Rewrite the lock file so its mtime shows the holder is still alive.
    pub async fn refresh(&self) -> Result<(), PipelineError> {
        tokio::fs::write(&self.path, lock_stamp())
            .await
            .map_err(|e| PipelineError::store(&self.path, e))
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

// ── Atomic file I/O ──────────────────────────────────────────────────────

/// Write `bytes` to a temporary sibling of `path`, then rename into place.
fn atomic_write_blocking(path: &Path, bytes: &[u8]) -> Result<(), PipelineError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| PipelineError::store(parent, e))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| PipelineError::store(parent, e))?;
    tmp.write_all(bytes).map_err(|e| PipelineError::store(path, e))?;
    tmp.as_file().sync_all().map_err(|e| PipelineError::store(path, e))?;
    tmp.persist(path).map_err(|e| PipelineError::store(path, e.error))?;
    Ok(())
}

pub async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), PipelineError> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| PipelineError::Internal(format!("serialise {}: {e}", path.display())))?;
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || atomic_write_blocking(&path, &bytes))
        .await
        .map_err(|e| PipelineError::Internal(format!("write task panicked: {e}")))?
}

/// Reject a loaded set whose regions reach outside the image.
fn checked(set: RunArtifactSet, path: PathBuf) -> Result<RunArtifactSet, PipelineError> {
    match set.out_of_bounds_region() {
        None => Ok(set),
        Some(id) => Err(PipelineError::ReportCorrupt {
            detail: format!(
                "{} lies outside the {}x{} image",
                id, set.dimensions.width, set.dimensions.height
            ),
            path,
        }),
    }
}

pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, PipelineError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| PipelineError::store(path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| PipelineError::ReportCorrupt {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}

/// PNG-encode on the blocking pool and write atomically.
pub async fn write_png(path: &Path, img: RgbaImage) -> Result<(), PipelineError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut buf = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
            .map_err(|e| PipelineError::Internal(format!("PNG encode {}: {e}", path.display())))?;
        atomic_write_blocking(&path, &buf)
    })
    .await
    .map_err(|e| PipelineError::Internal(format!("write task panicked: {e}")))?
}

pub async fn read_png(path: &Path) -> Result<RgbaImage, PipelineError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| PipelineError::store(path, e))?;
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        image::load_from_memory(&bytes)
            .map(|img| img.to_rgba8())
            .map_err(|e| PipelineError::ReportCorrupt {
                path,
                detail: e.to_string(),
            })
    })
    .await
    .map_err(|e| PipelineError::Internal(format!("decode task panicked: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn record(id: &str) -> RunRecord {
        RunRecord {
            run_id: RunId::parse(id).unwrap(),
            source_name: "banner.png".into(),
            dimensions: ImageDimensions {
                width: 4,
                height: 3,
            },
            created_at: "2024-01-01T00:00:00Z".into(),
        }
    }

    async fn created(store: &ArtifactStore, id: &str) -> RunId {
        let rec = record(id);
        store
            .create_run(&rec, RgbaImage::from_pixel(4, 3, Rgba([1, 2, 3, 255])))
            .await
            .unwrap();
        rec.run_id
    }

    #[tokio::test]
    async fn fresh_run_is_created() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let id = created(&store, "run_a").await;
        assert_eq!(store.completed_stage(&id).await.unwrap(), Stage::Created);
        let src = store.load_source(&id).await.unwrap();
        assert_eq!(src.dimensions(), (4, 3));
        assert_eq!(src.get_pixel(0, 0), &Rgba([1, 2, 3, 255]));
    }

    #[tokio::test]
    async fn missing_run_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let err = store
            .completed_stage(&RunId::parse("run_nope").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::RunNotFound { .. }));
    }

    #[tokio::test]
    async fn stage_stops_at_first_gap() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let id = created(&store, "run_b").await;
        let dir = store.run_dir(&id);
        write_json(&dir.join(DETECTION_FILE), &Vec::<TextRegion>::new()).await.unwrap();
        // boxes.json without classification.json does not count
        write_json(&dir.join(BOXES_FILE), &Vec::<BoxRegion>::new()).await.unwrap();
        assert_eq!(store.completed_stage(&id).await.unwrap(), Stage::Detected);
    }

    async fn composed(store: &ArtifactStore, id: &str, report: serde_json::Value) -> RunId {
        let id = created(store, id).await;
        let dir = store.run_dir(&id);
        for stage in Stage::ALL {
            for name in stage_markers(stage) {
                if !dir.join(name).exists() {
                    std::fs::write(dir.join(name), "[]").unwrap();
                }
            }
        }
        std::fs::write(dir.join(REPORT_FILE), report.to_string()).unwrap();
        id
    }

    fn report(id: &str, bbox: serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "run_id": id,
            "source_name": "banner.png",
            "source_image": "source.png",
            "dimensions": {"width": 4, "height": 3},
            "stage": "composed",
            "box_regions": [{
                "id": "box_0",
                "bbox": bbox,
                "created_by": "boxes_associated",
                "color": "#ff0000",
                "associated_text_id": null
            }]
        })
    }

    #[tokio::test]
    async fn hand_edited_report_with_empty_box_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let bbox = serde_json::json!({"x": 0, "y": 0, "width": 0, "height": 2});
        let id = composed(&store, "run_f", report("run_f", bbox)).await;
        let err = store.load(&id).await.unwrap_err();
        assert!(matches!(err, PipelineError::ReportCorrupt { .. }), "{err}");
    }

    #[tokio::test]
    async fn hand_edited_report_with_offcanvas_box_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let bbox = serde_json::json!({"x": 2, "y": 0, "width": 5, "height": 2});
        let id = composed(&store, "run_g", report("run_g", bbox)).await;
        match store.load(&id).await.unwrap_err() {
            PipelineError::ReportCorrupt { detail, .. } => assert!(detail.contains("box_0")),
            other => panic!("unexpected: {other}"),
        }

        let bbox = serde_json::json!({"x": 2, "y": 0, "width": 2, "height": 3});
        let id = composed(&store, "run_h", report("run_h", bbox)).await;
        let set = store.load(&id).await.unwrap();
        assert_eq!(set.box_regions.len(), 1);
    }

    #[tokio::test]
    async fn failure_record_roundtrip_and_clear() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let id = created(&store, "run_c").await;
        let rec = FailureRecord {
            stage: Stage::Layered,
            kind: "transient".into(),
            attempts: 3,
            message: "503".into(),
            region: None,
            at: "now".into(),
        };
        store.write_failure(&id, &rec).await.unwrap();
        assert_eq!(store.read_failure(&id).await, Some(rec));
        store.clear_failure(&id).await.unwrap();
        assert_eq!(store.read_failure(&id).await, None);
        store.clear_failure(&id).await.unwrap();
    }

    #[tokio::test]
    async fn list_is_newest_first() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        created(&store, "run_20240101T000000000_aaaaaaaa").await;
        created(&store, "run_20250101T000000000_bbbbbbbb").await;
        std::fs::create_dir_all(tmp.path().join("not a run")).unwrap();
        let runs = store.list().await.unwrap();
        let ids: Vec<&str> = runs.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["run_20250101T000000000_bbbbbbbb", "run_20240101T000000000_aaaaaaaa"]
        );
    }

    #[tokio::test]
    async fn lock_excludes_second_writer_until_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let id = created(&store, "run_d").await;
        let stale = Duration::from_secs(600);
        let first = store.lock(&id, Duration::from_millis(50), stale).await.unwrap();
        let err = store
            .lock(&id, Duration::from_millis(50), stale)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::RunLocked { .. }));
        drop(first);
        let _second = store.lock(&id, Duration::from_millis(50), stale).await.unwrap();
    }

    #[tokio::test]
    async fn refreshed_lock_is_not_stale() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let id = created(&store, "run_i").await;
        let held = store
            .lock(&id, Duration::from_millis(10), Duration::from_secs(600))
            .await
            .unwrap();
        std::thread::sleep(Duration::from_millis(150));
        held.refresh().await.unwrap();

        let err = store
            .lock(&id, Duration::from_millis(10), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::RunLocked { .. }));
        drop(held);
        assert!(!store.run_dir(&id).join(LOCK_FILE).exists());
    }

    #[tokio::test]
    async fn stale_lock_is_broken() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let id = created(&store, "run_e").await;
        std::fs::write(store.run_dir(&id).join(LOCK_FILE), "pid=0").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let lock = store
            .lock(&id, Duration::from_millis(10), Duration::from_millis(1))
            .await;
        assert!(lock.is_ok());
    }
}
