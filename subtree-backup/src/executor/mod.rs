//! Backup run executor.
//!
//! Pulls units from the traversal one at a time and runs each through
//! fingerprint, change detection, archive, optional validation and upload.
//! Units never overlap; the only parallel work is inside fingerprinting and the
//! producer/consumer pipe of a streamed archive.

pub mod detect;
pub mod events;

pub use detect::{detect_change, ChangeDecision, RebuildReason};
pub use events::{EventKind, EventSink, JsonLinesSink, SkipReason, TracingSink, UnitEvent};

use crate::archive::{is_consumer_hangup, render_listing, validate_archive, ArchiveArtifact, MaterializedArchive, TarProducer};
use crate::config::RunConfig;
use crate::fingerprint::{ContentFingerprint, Fingerprinter};
use crate::fs::{collect_file_set, plan_units, BackupUnit, FileSet};
use crate::remote::{ByteReader, ObjectStore, RemoteKeys};
use crate::transfer::progress::{bytes_per_second, format_bytes, format_duration, format_speed};
use crate::transfer::progress_stream::track_upload;
use crate::utils::errors::{BackupError, Phase, Result};
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// What happened to one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    /// Archive and both companions were written
    Uploaded {
        fingerprint: ContentFingerprint,
        files: usize,
        archive_bytes: u64,
    },

    /// Nothing was written
    Skipped(SkipReason),

    /// Dry run: would be created or refreshed
    Planned {
        fingerprint: ContentFingerprint,
        files: usize,
    },
}

impl UnitOutcome {
    fn event(&self) -> EventKind {
        match self {
            UnitOutcome::Uploaded {
                fingerprint,
                files,
                archive_bytes,
            } => EventKind::Succeeded {
                fingerprint: fingerprint.to_hex(),
                files: *files,
                archive_bytes: *archive_bytes,
            },
            UnitOutcome::Skipped(reason) => EventKind::Skipped { reason: *reason },
            UnitOutcome::Planned { .. } => EventKind::Skipped {
                reason: SkipReason::DryRun,
            },
        }
    }
}

/// Totals for a whole run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub created: usize,
    pub unchanged: usize,
    pub empty: usize,
    pub planned: usize,
    pub failed: usize,
    pub uploaded_bytes: u64,
    pub duration: Duration,

    /// Exit code of the first failed unit
    pub first_failure_code: Option<i32>,
}

impl RunReport {
    pub fn total(&self) -> usize {
        self.created + self.unchanged + self.empty + self.planned + self.failed
    }

    pub fn succeeded(&self) -> usize {
        self.total() - self.failed
    }

    pub fn exit_code(&self) -> i32 {
        self.first_failure_code.unwrap_or(0)
    }

    fn record(&mut self, outcome: &UnitOutcome) {
        match outcome {
            UnitOutcome::Uploaded { archive_bytes, .. } => {
                self.created += 1;
                self.uploaded_bytes += archive_bytes;
            }
            UnitOutcome::Skipped(SkipReason::Unchanged) => self.unchanged += 1,
            UnitOutcome::Skipped(SkipReason::Empty) => self.empty += 1,
            UnitOutcome::Skipped(SkipReason::DryRun) | UnitOutcome::Planned { .. } => self.planned += 1,
        }
    }

    fn record_failure(&mut self, err: &BackupError) {
        self.failed += 1;
        self.first_failure_code.get_or_insert(err.exit_code());
    }

    /// Log the final summary.
    pub fn log(&self) {
        info!(
            "Run finished: {}/{} units ok, duration: {}",
            self.succeeded(),
            self.total(),
            format_duration(self.duration.as_secs())
        );
        info!(
            "  created: {}, unchanged: {}, empty: {}, planned: {}, failed: {}",
            self.created, self.unchanged, self.empty, self.planned, self.failed
        );
        if self.uploaded_bytes > 0 {
            info!(
                "  uploaded: {} ({})",
                format_bytes(self.uploaded_bytes),
                format_speed(bytes_per_second(self.uploaded_bytes, self.duration))
            );
        }
    }
}

/// Runs every unit of one source tree against one store.
pub struct Executor {
    config: Arc<RunConfig>,
    store: Option<Arc<dyn ObjectStore>>,
    fingerprinter: Arc<Fingerprinter>,
    sink: Arc<dyn EventSink>,
}

impl Executor {
    /// Build the executor, opening the configured store unless this is a dry run.
    pub fn new(config: RunConfig, sink: Arc<dyn EventSink>) -> Result<Self> {
        let store = if config.dry_run {
            None
        } else {
            Some(config.target.open(config.http_token.clone())?)
        };
        Self::build(config, store, sink)
    }

    /// Build the executor around an existing store. A dry run never touches it.
    pub fn with_store(config: RunConfig, store: Arc<dyn ObjectStore>, sink: Arc<dyn EventSink>) -> Result<Self> {
        let store = (!config.dry_run).then_some(store);
        Self::build(config, store, sink)
    }

    fn build(config: RunConfig, store: Option<Arc<dyn ObjectStore>>, sink: Arc<dyn EventSink>) -> Result<Self> {
        let fingerprinter = Fingerprinter::new(config.hash_workers)?;
        Ok(Self {
            config: Arc::new(config),
            store,
            fingerprinter: Arc::new(fingerprinter),
            sink,
        })
    }

    /// Process every unit of the source tree in traversal order.
    ///
    /// The first unit failure ends the run unless `keep_going` is set. Access
    /// and configuration failures always end it.
    pub async fn run(&self) -> Result<RunReport> {
        let started = Instant::now();
        let mut report = RunReport::default();

        info!(
            "Starting backup of {} as '{}' (split depth: {}, target: {})",
            self.config.source.display(),
            self.config.backup_name,
            self.config.split_depth,
            self.store.as_ref().map(|s| s.describe()).unwrap_or_else(|| "dry run".to_string())
        );

        let source = self.config.source.clone();
        let split_depth = self.config.split_depth;
        let mut walker = tokio::task::spawn_blocking(move || plan_units(&source, split_depth)).await??;

        loop {
            // Directory listing is blocking I/O; advance the walker off the runtime
            let (next, returned) = tokio::task::spawn_blocking(move || {
                let next = walker.next();
                (next, walker)
            })
            .await?;
            walker = returned;

            let unit = match next {
                Some(Ok(unit)) => unit,
                Some(Err(e)) => {
                    report.duration = started.elapsed();
                    report.log();
                    return Err(e);
                }
                None => break,
            };

            match self.run_unit(&unit).await {
                Ok(outcome) => report.record(&outcome),
                Err(e) => {
                    report.record_failure(&e);
                    if e.is_fatal() || !self.config.keep_going {
                        report.duration = started.elapsed();
                        report.log();
                        return Err(e);
                    }
                }
            }
        }

        report.duration = started.elapsed();
        report.log();
        Ok(report)
    }

    /// Run one unit and emit its `Started` and outcome events.
    pub async fn run_unit(&self, unit: &BackupUnit) -> Result<UnitOutcome> {
        let name = unit.logical_name.to_string();
        self.sink.emit(&UnitEvent::new(name.clone(), EventKind::Started));

        let result = self.process_unit(unit).await;
        let kind = match &result {
            Ok(outcome) => outcome.event(),
            Err(e) => EventKind::Failed {
                phase: e.phase(),
                error: failure_message(e),
            },
        };
        self.sink.emit(&UnitEvent::new(name, kind));

        result
    }

    async fn process_unit(&self, unit: &BackupUnit) -> Result<UnitOutcome> {
        let name = unit.logical_name.as_str();
        let keys = RemoteKeys::new(&self.config.backup_name, &unit.logical_name);

        let (files, fingerprint) = self
            .fingerprint_unit(unit)
            .await
            .map_err(|e| e.in_unit(name, Phase::Fingerprint))?;
        debug!("{}: {} files, fingerprint {}", name, files.len(), fingerprint);

        let Some(store) = self.store.as_deref() else {
            return Ok(self.plan_only(&keys, &files, fingerprint));
        };

        if fingerprint.is_empty() {
            return Ok(UnitOutcome::Skipped(SkipReason::Empty));
        }

        let reason = match detect_change(store, &keys, &fingerprint)
            .await
            .map_err(|e| e.in_unit(name, Phase::ChangeDetection))?
        {
            ChangeDecision::Unchanged => return Ok(UnitOutcome::Skipped(SkipReason::Unchanged)),
            ChangeDecision::Rebuild(reason) => reason,
        };
        info!("Rebuilding {} ({:?})", name, reason);

        // The old fingerprint must not outlive the archive it describes
        if reason != RebuildReason::NoRecord {
            store
                .delete(&keys.fingerprint)
                .await
                .map_err(|e| e.in_unit(name, Phase::Upload))?;
        }

        let files = Arc::new(files);
        let artifact = if self.config.materialize() {
            let dest = self.config.scratch_path(&unit.logical_name);
            ArchiveArtifact::materialized(Arc::clone(&files), &dest)
                .await
                .map_err(|e| e.in_unit(name, Phase::Archive))?
        } else {
            ArchiveArtifact::streamed(Arc::clone(&files))
        };
        let archive_bytes = self.upload_artifact(store, &keys, name, artifact, &files).await?;

        self.upload_companions(store, &keys, unit, &files, &fingerprint)
            .await
            .map_err(|e| e.in_unit(name, Phase::Upload))?;

        Ok(UnitOutcome::Uploaded {
            fingerprint,
            files: files.len(),
            archive_bytes,
        })
    }

    async fn fingerprint_unit(&self, unit: &BackupUnit) -> Result<(FileSet, ContentFingerprint)> {
        let unit = unit.clone();
        let fingerprinter = Arc::clone(&self.fingerprinter);

        tokio::task::spawn_blocking(move || {
            let files = collect_file_set(&unit)?;
            let fingerprint = fingerprinter.fingerprint(&files);
            Ok((files, fingerprint))
        })
        .await?
    }

    fn plan_only(&self, keys: &RemoteKeys, files: &FileSet, fingerprint: ContentFingerprint) -> UnitOutcome {
        if fingerprint.is_empty() {
            println!("SKIP (empty)    {}", keys.archive);
            return UnitOutcome::Skipped(SkipReason::Empty);
        }

        println!(
            "CREATE/REFRESH  {} ({} files, fingerprint {})",
            keys.archive,
            files.len(),
            fingerprint
        );
        UnitOutcome::Planned {
            fingerprint,
            files: files.len(),
        }
    }

    async fn upload_artifact(
        &self,
        store: &dyn ObjectStore,
        keys: &RemoteKeys,
        name: &str,
        artifact: ArchiveArtifact,
        files: &FileSet,
    ) -> Result<u64> {
        match artifact {
            ArchiveArtifact::Streamed { body, producer } => {
                self.upload_streamed(store, keys, name, body, producer).await
            }
            ArchiveArtifact::Materialized(archive) => {
                self.upload_materialized(store, keys, name, archive, files).await
            }
        }
    }

    /// Pipe the archive straight from the tar producer into the store.
    async fn upload_streamed(
        &self,
        store: &dyn ObjectStore,
        keys: &RemoteKeys,
        name: &str,
        body: ByteReader,
        producer: TarProducer,
    ) -> Result<u64> {
        let started = Instant::now();
        let body = track_upload(body, keys.archive.clone());

        let uploaded = store
            .put_stream(&keys.archive, body, &self.config.archive_put_options())
            .await;
        let produced = producer.finish().await;

        let bytes = match (uploaded, produced) {
            // The producer's own failure explains the failed upload
            (_, Err(e)) if !is_consumer_hangup(&e) => {
                return Err(e.in_unit(name, Phase::Archive));
            }
            (Err(e), _) => return Err(e.in_unit(name, Phase::Upload)),
            (Ok(_), Err(e)) => return Err(e.in_unit(name, Phase::Archive)),
            (Ok(bytes), Ok(_)) => bytes,
        };

        info!(
            "Streamed {} ({}, {})",
            keys.archive,
            format_bytes(bytes),
            format_speed(bytes_per_second(bytes, started.elapsed()))
        );
        Ok(bytes)
    }

    /// Validate (when enabled) and upload a scratch archive, then clean it up.
    async fn upload_materialized(
        &self,
        store: &dyn ObjectStore,
        keys: &RemoteKeys,
        name: &str,
        archive: MaterializedArchive,
        files: &FileSet,
    ) -> Result<u64> {
        let archive = validation_gate(archive, files, self.config.validate)
            .await
            .map_err(|e| e.in_unit(name, Phase::Validation))?;

        let started = Instant::now();
        let uploaded = async {
            let body = track_upload(archive.open().await?, keys.archive.clone());
            store
                .put_stream(&keys.archive, body, &self.config.archive_put_options())
                .await
        }
        .await;

        if self.config.keep_local {
            info!("Keeping local copy at {}", archive.path.display());
        } else {
            archive.discard().await;
        }

        let bytes = uploaded.map_err(|e| e.in_unit(name, Phase::Upload))?;
        info!(
            "Uploaded {} ({}, {})",
            keys.archive,
            format_bytes(bytes),
            format_speed(bytes_per_second(bytes, started.elapsed()))
        );
        Ok(bytes)
    }

    async fn upload_companions(
        &self,
        store: &dyn ObjectStore,
        keys: &RemoteKeys,
        unit: &BackupUnit,
        files: &FileSet,
        fingerprint: &ContentFingerprint,
    ) -> Result<()> {
        let options = self.config.archive_put_options().companion();

        let body = fingerprint.companion_body(keys.archive_file_name());
        store.put_bytes(&keys.fingerprint, Bytes::from(body), &options).await?;

        let listing = render_listing(&unit.source_path, files, chrono::Utc::now());
        store.put_bytes(&keys.listing, Bytes::from(listing), &options).await?;

        Ok(())
    }
}

/// Check a scratch archive before it may be uploaded.
///
/// When `enabled` and the check fails, the file is deleted and the error
/// returned. When disabled the archive passes through unchecked.
pub async fn validation_gate(
    archive: MaterializedArchive,
    expected: &FileSet,
    enabled: bool,
) -> Result<MaterializedArchive> {
    if !enabled {
        return Ok(archive);
    }

    match validate_archive(&archive.path, expected).await {
        Ok(()) => Ok(archive),
        Err(e) => {
            error!("Validation failed for {}: {}", archive.path.display(), e);
            archive.discard().await;
            Err(e)
        }
    }
}

fn failure_message(err: &BackupError) -> String {
    match err {
        BackupError::Unit { source, .. } => source.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LogicalPath;
    use crate::remote::{ChunkPlan, MemoryStore, Target};
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<UnitEvent>>);

    impl EventSink for Recorder {
        fn emit(&self, event: &UnitEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    impl Recorder {
        fn events(&self) -> Vec<UnitEvent> {
            self.0.lock().unwrap().clone()
        }
    }

    fn config(source: &Path, scratch: &Path) -> RunConfig {
        RunConfig {
            target: Target::Local {
                dir: PathBuf::from("/nonexistent"),
            },
            backup_name: LogicalPath::normalize("bk").unwrap(),
            source: source.to_path_buf(),
            storage_class: "DEEP_ARCHIVE".into(),
            chunk_plan: ChunkPlan::for_budget(1).unwrap(),
            split_depth: 1,
            dry_run: false,
            validate: false,
            keep_local: false,
            keep_going: false,
            scratch_dir: scratch.to_path_buf(),
            hash_workers: 2,
            http_token: None,
        }
    }

    /// `/data` with subdirs `a` and `b` and no loose files.
    fn data_tree() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        std::fs::create_dir_all(root.join("a/sub")).unwrap();
        std::fs::create_dir_all(root.join("b")).unwrap();
        std::fs::write(root.join("a/one.txt"), b"one").unwrap();
        std::fs::write(root.join("a/sub/two.txt"), b"two").unwrap();
        std::fs::write(root.join("b/three.txt"), b"three").unwrap();
        temp_dir
    }

    async fn run(cfg: RunConfig, store: &MemoryStore) -> (Result<RunReport>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let executor = Executor::with_store(cfg, Arc::new(store.clone()), recorder.clone()).unwrap();
        let result = executor.run().await;
        (result, recorder)
    }

    async fn untar_names(data: &[u8]) -> Vec<String> {
        use async_compression::tokio::bufread::GzipDecoder;
        use tokio::io::AsyncReadExt;

        let mut tar_bytes = Vec::new();
        GzipDecoder::new(tokio::io::BufReader::new(data))
            .read_to_end(&mut tar_bytes)
            .await
            .unwrap();
        let mut archive = tar::Archive::new(&tar_bytes[..]);
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_split_depth_one_layout() {
        let tree = data_tree();
        let scratch = TempDir::new().unwrap();
        let store = MemoryStore::new();

        let (result, _) = run(config(tree.path(), scratch.path()), &store).await;
        let report = result.unwrap();
        assert_eq!(report.created, 2);

        assert_eq!(
            store.keys().await,
            vec![
                "bk/a.tar.gz",
                "bk/a.tar.gz.md5",
                "bk/a_files.txt",
                "bk/b.tar.gz",
                "bk/b.tar.gz.md5",
                "bk/b_files.txt",
            ]
        );

        let archive = store.get("bk/a.tar.gz").await.unwrap();
        assert_eq!(archive.storage_class, "DEEP_ARCHIVE");
        assert_eq!(untar_names(&archive.data).await, vec!["one.txt", "sub/two.txt"]);

        let md5 = store.get("bk/a.tar.gz.md5").await.unwrap();
        assert_eq!(md5.storage_class, "STANDARD");
        let text = String::from_utf8(md5.data.to_vec()).unwrap();
        assert!(text.ends_with("  a.tar.gz\n"));
        assert!(ContentFingerprint::parse_companion(&text).is_some());

        let listing = store.get("bk/a_files.txt").await.unwrap();
        assert_eq!(listing.storage_class, "STANDARD");
        assert!(String::from_utf8_lossy(&listing.data).contains("sub/two.txt (3 bytes)"));

        // Loose top-level files add a `_files` unit
        std::fs::write(tree.path().join("README"), b"hi").unwrap();
        let (result, _) = run(config(tree.path(), scratch.path()), &store).await;
        assert_eq!(result.unwrap().created, 1);
        let archive = store.get("bk/_files.tar.gz").await.unwrap();
        assert_eq!(untar_names(&archive.data).await, vec!["README"]);
    }

    #[tokio::test]
    async fn test_split_depth_zero_single_archive() {
        let tree = data_tree();
        let scratch = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let mut cfg = config(tree.path(), scratch.path());
        cfg.split_depth = 0;

        let (result, _) = run(cfg, &store).await;
        assert_eq!(result.unwrap().created, 1);

        let root_name = std::fs::canonicalize(tree.path())
            .unwrap()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .to_string();
        let key = format!("bk/{}.tar.gz", root_name);
        let archive = store.get(&key).await.unwrap();
        assert_eq!(
            untar_names(&archive.data).await,
            vec!["a/one.txt", "a/sub/two.txt", "b/three.txt"]
        );
        assert_eq!(store.keys().await.len(), 3);
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let tree = data_tree();
        let scratch = TempDir::new().unwrap();
        let store = MemoryStore::new();

        run(config(tree.path(), scratch.path()), &store).await.0.unwrap();
        let puts = store.puts();
        let before = store.get("bk/a.tar.gz").await.unwrap().data;

        let (result, _) = run(config(tree.path(), scratch.path()), &store).await;
        let report = result.unwrap();
        assert_eq!(report.unchanged, 2);
        assert_eq!(report.created, 0);
        assert_eq!(store.puts(), puts);
        assert_eq!(store.get("bk/a.tar.gz").await.unwrap().data, before);
    }

    #[tokio::test]
    async fn test_change_isolation() {
        let tree = data_tree();
        let scratch = TempDir::new().unwrap();
        let store = MemoryStore::new();

        run(config(tree.path(), scratch.path()), &store).await.0.unwrap();
        let a_md5 = store.get("bk/a.tar.gz.md5").await.unwrap().data;
        let b_md5 = store.get("bk/b.tar.gz.md5").await.unwrap().data;
        let b_archive = store.get("bk/b.tar.gz").await.unwrap().data;
        let puts = store.puts();

        std::fs::write(tree.path().join("a/new.txt"), b"new").unwrap();
        let (result, _) = run(config(tree.path(), scratch.path()), &store).await;
        let report = result.unwrap();

        assert_eq!((report.created, report.unchanged), (1, 1));
        assert_eq!(store.puts(), puts + 3);
        assert_ne!(store.get("bk/a.tar.gz.md5").await.unwrap().data, a_md5);
        assert_eq!(store.get("bk/b.tar.gz.md5").await.unwrap().data, b_md5);
        assert_eq!(store.get("bk/b.tar.gz").await.unwrap().data, b_archive);
    }

    #[tokio::test]
    async fn test_missing_archive_is_rebuilt() {
        let tree = data_tree();
        let scratch = TempDir::new().unwrap();
        let store = MemoryStore::new();

        run(config(tree.path(), scratch.path()), &store).await.0.unwrap();
        store.remove("bk/b.tar.gz").await.unwrap();

        let (result, _) = run(config(tree.path(), scratch.path()), &store).await;
        let report = result.unwrap();
        assert_eq!((report.created, report.unchanged), (1, 1));
        assert!(store.get("bk/b.tar.gz").await.is_some());
    }

    #[tokio::test]
    async fn test_dry_run_never_touches_store() {
        let tree = data_tree();
        std::fs::create_dir(tree.path().join("empty")).unwrap();
        let scratch = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let mut cfg = config(tree.path(), scratch.path());
        cfg.dry_run = true;

        let (result, recorder) = run(cfg, &store).await;
        let report = result.unwrap();
        assert_eq!((report.planned, report.empty), (2, 1));
        assert_eq!(store.calls(), 0);
        assert!(store.keys().await.is_empty());

        let events = recorder.events();
        assert_eq!(events.len(), 6);
        assert!(events
            .iter()
            .any(|e| e.unit == "a" && e.kind == EventKind::Skipped { reason: SkipReason::DryRun }));
    }

    #[tokio::test]
    async fn test_empty_unit_skips_without_remote_calls() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir(temp_dir.path().join("empty")).unwrap();
        let scratch = TempDir::new().unwrap();
        let store = MemoryStore::new();

        let (result, recorder) = run(config(temp_dir.path(), scratch.path()), &store).await;
        assert_eq!(result.unwrap().empty, 1);
        assert_eq!(store.calls(), 0);
        assert_eq!(
            recorder.events()[1],
            UnitEvent::new("empty", EventKind::Skipped { reason: SkipReason::Empty })
        );
    }

    #[tokio::test]
    async fn test_events_once_per_unit() {
        let tree = data_tree();
        let scratch = TempDir::new().unwrap();
        let store = MemoryStore::new();

        let (result, recorder) = run(config(tree.path(), scratch.path()), &store).await;
        result.unwrap();

        let events = recorder.events();
        for unit in ["a", "b"] {
            let mine: Vec<_> = events.iter().filter(|e| e.unit == unit).collect();
            assert_eq!(mine.len(), 2);
            assert_eq!(mine[0].kind, EventKind::Started);
            assert!(matches!(mine[1].kind, EventKind::Succeeded { files, .. } if files > 0));
        }
    }

    #[tokio::test]
    async fn test_upload_failure_aborts_run() {
        let tree = data_tree();
        let scratch = TempDir::new().unwrap();
        let store = MemoryStore::new();
        store.fail_puts_ending_with(Some(".md5")).await;

        let (result, recorder) = run(config(tree.path(), scratch.path()), &store).await;
        let err = result.unwrap_err();
        assert_eq!(err.phase(), Some(Phase::Upload));
        assert_eq!(err.exit_code(), 5);

        // Stopped after the first unit; its archive landed but no fingerprint did
        let events = recorder.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[1].kind,
            EventKind::Failed { phase: Some(Phase::Upload), .. }
        ));
        assert!(store.get("bk/a.tar.gz.md5").await.is_none());
        assert!(store.get("bk/b.tar.gz").await.is_none());

        // Next run rebuilds the half-written unit
        store.fail_puts_ending_with(None).await;
        let (result, _) = run(config(tree.path(), scratch.path()), &store).await;
        assert_eq!(result.unwrap().created, 2);
    }

    #[tokio::test]
    async fn test_keep_going_counts_failures() {
        let tree = data_tree();
        let scratch = TempDir::new().unwrap();
        let store = MemoryStore::new();
        store.fail_puts_ending_with(Some(".tar.gz")).await;
        let mut cfg = config(tree.path(), scratch.path());
        cfg.keep_going = true;

        let (result, recorder) = run(cfg, &store).await;
        let report = result.unwrap();
        assert_eq!(report.failed, 2);
        assert_eq!(report.exit_code(), 5);
        assert_eq!(recorder.events().iter().filter(|e| e.is_terminal()).count(), 2);
        assert!(store.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_materialized_with_validation() {
        let tree = data_tree();
        let scratch = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let mut cfg = config(tree.path(), scratch.path());
        cfg.validate = true;

        let (result, _) = run(cfg, &store).await;
        assert_eq!(result.unwrap().created, 2);
        assert!(!scratch.path().join("bk/a.tar.gz").exists());
        let archive = store.get("bk/a.tar.gz").await.unwrap();
        assert_eq!(untar_names(&archive.data).await, vec!["one.txt", "sub/two.txt"]);
    }

    #[tokio::test]
    async fn test_keep_local_retains_scratch_copy() {
        let tree = data_tree();
        let scratch = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let mut cfg = config(tree.path(), scratch.path());
        cfg.keep_local = true;

        run(cfg, &store).await.0.unwrap();
        let local = std::fs::read(scratch.path().join("bk/b.tar.gz")).unwrap();
        assert_eq!(local, store.get("bk/b.tar.gz").await.unwrap().data.to_vec());
    }

    #[tokio::test]
    async fn test_local_directory_target() {
        let tree = data_tree();
        let scratch = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        let mut cfg = config(tree.path(), scratch.path());
        cfg.target = Target::Local {
            dir: target.path().to_path_buf(),
        };

        let executor = Executor::new(cfg.clone(), Arc::new(TracingSink)).unwrap();
        assert_eq!(executor.run().await.unwrap().created, 2);
        assert!(target.path().join("bk/a.tar.gz").is_file());
        assert!(target.path().join("bk/b_files.txt").is_file());
        assert!(!target.path().join("bk/a.tar.gz.partial").exists());

        let executor = Executor::new(cfg, Arc::new(TracingSink)).unwrap();
        assert_eq!(executor.run().await.unwrap().unchanged, 2);
    }

    fn unit_files(tree: &Path, name: &str) -> Arc<FileSet> {
        let unit = plan_units(tree, 1)
            .unwrap()
            .map(|u| u.unwrap())
            .find(|u| u.logical_name.as_str() == name)
            .unwrap();
        Arc::new(collect_file_set(&unit).unwrap())
    }

    fn keys_for(unit: &str) -> RemoteKeys {
        RemoteKeys::new(&LogicalPath::normalize("bk").unwrap(), &LogicalPath::normalize(unit).unwrap())
    }

    async fn truncated_archive(tree: &Path, scratch: &Path) -> (MaterializedArchive, Arc<FileSet>) {
        let files = unit_files(tree, "a");
        let artifact = ArchiveArtifact::materialized(Arc::clone(&files), &scratch.join("bk/a.tar.gz"))
            .await
            .unwrap();
        let ArchiveArtifact::Materialized(archive) = artifact else {
            panic!("expected a scratch archive");
        };

        let file = std::fs::OpenOptions::new().write(true).open(&archive.path).unwrap();
        file.set_len(archive.size / 2).unwrap();
        (archive, files)
    }

    #[tokio::test]
    async fn test_validation_gate_blocks_corrupt_archive() {
        let tree = data_tree();
        let scratch = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let mut cfg = config(tree.path(), scratch.path());
        cfg.validate = true;
        let executor = Executor::with_store(cfg, Arc::new(store.clone()), Arc::new(TracingSink)).unwrap();

        let (archive, files) = truncated_archive(tree.path(), scratch.path()).await;
        let path = archive.path.clone();

        let err = executor
            .upload_materialized(&store, &keys_for("a"), "a", archive, &files)
            .await
            .unwrap_err();
        assert!(matches!(
            &err,
            BackupError::Unit { phase: Phase::Validation, source, .. } if matches!(**source, BackupError::Validation(_))
        ));
        assert_ne!(err.exit_code(), 0);
        assert_eq!(store.puts(), 0);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_validation_gate_disabled_passes_through() {
        let tree = data_tree();
        let scratch = TempDir::new().unwrap();
        let (archive, files) = truncated_archive(tree.path(), scratch.path()).await;

        let archive = validation_gate(archive, &files, false).await.unwrap();
        assert!(archive.path.exists());
    }

    #[tokio::test]
    async fn test_vanished_file_never_commits_streamed_archive() {
        let tree = data_tree();
        let scratch = TempDir::new().unwrap();
        let store = MemoryStore::new();

        run(config(tree.path(), scratch.path()), &store).await.0.unwrap();
        store.remove("bk/a.tar.gz").await.unwrap();

        let executor =
            Executor::with_store(config(tree.path(), scratch.path()), Arc::new(store.clone()), Arc::new(TracingSink))
                .unwrap();
        let files = unit_files(tree.path(), "a");
        std::fs::remove_file(tree.path().join("a/sub/two.txt")).unwrap();

        let ArchiveArtifact::Streamed { body, producer } = ArchiveArtifact::streamed(files) else {
            panic!("expected a streamed archive");
        };
        let err = executor
            .upload_streamed(&store, &keys_for("a"), "a", body, producer)
            .await
            .unwrap_err();
        assert!(matches!(
            &err,
            BackupError::Unit { phase: Phase::Archive, source, .. } if matches!(**source, BackupError::Access { .. })
        ));
        assert!(store.get("bk/a.tar.gz").await.is_none());

        // The stored fingerprint still matches, but the missing archive forces a rebuild
        std::fs::write(tree.path().join("a/sub/two.txt"), b"two").unwrap();
        let (result, _) = run(config(tree.path(), scratch.path()), &store).await;
        let report = result.unwrap();
        assert_eq!((report.created, report.unchanged), (1, 1));
        let archive = store.get("bk/a.tar.gz").await.unwrap();
        assert_eq!(untar_names(&archive.data).await, vec!["one.txt", "sub/two.txt"]);
    }

    #[tokio::test]
    async fn test_rebuild_drops_stale_fingerprint_first() {
        let tree = data_tree();
        let scratch = TempDir::new().unwrap();
        let store = MemoryStore::new();

        run(config(tree.path(), scratch.path()), &store).await.0.unwrap();
        let old_archive = store.get("bk/a.tar.gz").await.unwrap().data;

        std::fs::write(tree.path().join("a/new.txt"), b"new").unwrap();
        store.fail_puts_ending_with(Some(".tar.gz")).await;
        let (result, _) = run(config(tree.path(), scratch.path()), &store).await;
        assert_eq!(result.unwrap_err().phase(), Some(Phase::Upload));

        // The old archive survives, but nothing vouches for it any more
        assert_eq!(store.get("bk/a.tar.gz").await.unwrap().data, old_archive);
        assert!(store.get("bk/a.tar.gz.md5").await.is_none());

        store.fail_puts_ending_with(None).await;
        let (result, _) = run(config(tree.path(), scratch.path()), &store).await;
        assert_eq!(result.unwrap().created, 1);
        let archive = store.get("bk/a.tar.gz").await.unwrap();
        assert_eq!(untar_names(&archive.data).await, vec!["new.txt", "one.txt", "sub/two.txt"]);
    }
}
