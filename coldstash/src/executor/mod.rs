//! Backup pipeline.
//!
//! For every content path of every task:
//! ledger check -> archive -> split -> encrypt -> gated upload -> ledger append.
//!
//! The upload gate is fail-closed: when the existence check itself cannot be
//! completed the whole run stops with `SafetyAbort` rather than risk
//! overwriting an object nobody looked at.

pub mod manifest;

use manifest::{Task, TaskManifest};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::archive::{ArchiveCodec, ARCHIVE_SUFFIX};
use crate::config::AppConfig;
use crate::crypto::CryptoEngine;
use crate::fs::walker::calculate_total_size;
use crate::fs::{remove_if_exists, sha256_file};
use crate::ledger::ProcessedTracker;
use crate::retry::RetryPolicy;
use crate::split::{split, write_rebuild_instruction};
use crate::store::{join_key, BlobStore, StorageClass};
use crate::transfer::progress::{format_bytes, format_duration, ProgressTracker};
use crate::utils::blocking;
use crate::{Result, StashError};

/// Totals of one backup run
#[derive(Debug, Default, Clone)]
pub struct BackupSummary {
    pub dry_run: bool,
    pub uploaded: usize,
    pub skipped_existing: usize,
    pub skipped_processed: usize,
    pub failed: usize,
    pub bytes: u64,
    pub preparation_time: Duration,
    pub upload_time: Duration,
    pub total_time: Duration,
    pub errors: Vec<String>,
}

impl BackupSummary {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

impl fmt::Display for BackupSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(50);
        writeln!(f, "{}", rule)?;
        if self.dry_run {
            writeln!(f, "BACKUP SUMMARY (DRY-RUN)")?;
        } else {
            writeln!(f, "BACKUP SUMMARY")?;
        }
        writeln!(f, "{}", rule)?;
        let verb = if self.dry_run { "Would upload" } else { "Uploaded" };
        writeln!(f, "{}: {}", verb, self.uploaded)?;
        writeln!(f, "Skipped (already in store): {}", self.skipped_existing)?;
        writeln!(f, "Skipped (already processed): {}", self.skipped_processed)?;
        writeln!(f, "Failed: {}", self.failed)?;
        writeln!(f, "Data: {}", format_bytes(self.bytes))?;
        writeln!(f, "Preparation time: {}", format_duration(self.preparation_time))?;
        writeln!(f, "Upload time: {}", format_duration(self.upload_time))?;
        writeln!(f, "Total time: {}", format_duration(self.total_time))?;
        for e in &self.errors {
            writeln!(f, "  - {}", e)?;
        }
        write!(f, "{}", rule)
    }
}

/// Files prepared for one content path, in upload order.
struct Prepared {
    files: Vec<PathBuf>,
    /// Parts, not counting the rebuild instruction
    part_count: usize,
}

/// Main backup executor
pub struct BackupExecutor {
    store: Arc<dyn BlobStore>,
    codec: ArchiveCodec,
    crypto: CryptoEngine,
    retry: RetryPolicy,
    cancel_token: CancellationToken,
    dry_run: bool,
}

impl BackupExecutor {
    /// Create a new backup executor (no cancellation support)
    pub fn new(config: &AppConfig, store: Arc<dyn BlobStore>) -> Self {
        Self::with_cancel(config, store, CancellationToken::new())
    }

    /// Create a new backup executor with cancellation support
    pub fn with_cancel(
        config: &AppConfig,
        store: Arc<dyn BlobStore>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            store,
            codec: ArchiveCodec::from_config(&config.archive),
            crypto: CryptoEngine::from_config(&config.crypto),
            retry: RetryPolicy::from_config(&config.retry),
            cancel_token,
            dry_run: false,
        }
    }

    /// Prepare everything locally but never touch the store or the ledger.
    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }

    pub fn with_crypto(mut self, crypto: CryptoEngine) -> Self {
        self.crypto = crypto;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Execute every task of the manifest at `manifest_path`.
    pub async fn execute(&self, manifest_path: &Path) -> Result<BackupSummary> {
        let start_time = Instant::now();
        let manifest = TaskManifest::load(manifest_path)?;
        let tasks = manifest.resolve()?;
        let ledger = ProcessedTracker::for_manifest(manifest_path);

        info!(
            "Starting backup of {} task(s) from {}{}",
            tasks.len(),
            manifest_path.display(),
            if self.dry_run { " (dry-run)" } else { "" }
        );

        let mut summary = BackupSummary {
            dry_run: self.dry_run,
            ..BackupSummary::default()
        };

        for task in &tasks {
            if let Err(e) = self.run_task(task, &ledger, &mut summary).await {
                match e {
                    StashError::SafetyAbort(_) | StashError::Cancelled => return Err(e),
                    other => {
                        error!("Task for bucket {} aborted: {}", task.bucket, other);
                        summary.failed += 1;
                        summary.errors.push(other.to_string());
                    }
                }
            }
        }

        if summary.is_success() {
            self.upload_additional_files(&manifest, &tasks, manifest_path, &ledger, &mut summary)
                .await?;
        } else {
            warn!("Skipping manifest and ledger upload because some tasks failed");
        }

        summary.total_time = start_time.elapsed();
        Ok(summary)
    }

    async fn run_task(
        &self,
        task: &Task,
        ledger: &ProcessedTracker,
        summary: &mut BackupSummary,
    ) -> Result<()> {
        for content in &task.content {
            if self.cancel_token.is_cancelled() {
                return Err(StashError::Cancelled);
            }

            let key = content.to_string_lossy().to_string();
            if ledger.is_processed(&key)? {
                info!("Skipping {} (already processed)", key);
                summary.skipped_processed += 1;
                continue;
            }

            let prep_start = Instant::now();
            let prepared = match self.prepare(task, content).await {
                Ok(prepared) => prepared,
                Err(e) => {
                    self.discard_temp(task, content).await;
                    return Err(e);
                }
            };
            summary.preparation_time += prep_start.elapsed();

            let upload_start = Instant::now();
            let uploaded = self.upload_parts(task, content, &prepared.files, summary).await;
            summary.upload_time += upload_start.elapsed();

            if task.cleanup && !self.dry_run {
                for file in &prepared.files {
                    if let Err(e) = remove_if_exists(file) {
                        warn!("Could not remove {}: {}", file.display(), e);
                    }
                }
            }
            uploaded?;

            if !self.dry_run {
                ledger.mark_processed(&key, prepared.part_count)?;
            }
        }
        Ok(())
    }

    /// Archive, split and (optionally) encrypt one content path inside the task's temp dir.
    async fn prepare(&self, task: &Task, content: &Path) -> Result<Prepared> {
        tokio::fs::create_dir_all(&task.temp_dir).await?;
        let archive = archive_path(task, content)?;

        let codec = self.codec.clone();
        let source = content.to_path_buf();
        let target = archive.clone();
        let chunk_size = task.chunk_size;

        let (mut files, part_count) = blocking(move || {
            if is_archive_file(&source) {
                info!("{} is already an archive, copying instead of rebuilding", source.display());
                std::fs::copy(&source, &target)?;
            } else {
                let size = calculate_total_size(&source)?;
                info!("Archiving {} ({})", source.display(), format_bytes(size));
                codec.build(std::slice::from_ref(&source), &target)?;
            }

            let parts = split(&target, chunk_size)?;
            if parts.len() == 1 {
                return Ok((parts, 1));
            }
            std::fs::remove_file(&target)?;
            let instruction = write_rebuild_instruction(&target, &parts)?;
            let count = parts.len();
            let mut files = parts;
            files.push(instruction);
            Ok((files, count))
        })
        .await?;

        if let Some(secret) = &task.secret {
            let crypto = self.crypto.clone();
            let secret = secret.clone();
            files = blocking(move || {
                files
                    .iter()
                    .map(|file| {
                        let encrypted = crypto.encrypt_file(file, &secret)?;
                        std::fs::remove_file(file)?;
                        Ok(encrypted)
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .await?;
        }

        Ok(Prepared { files, part_count })
    }

    async fn upload_parts(
        &self,
        task: &Task,
        content: &Path,
        files: &[PathBuf],
        summary: &mut BackupSummary,
    ) -> Result<()> {
        let mut sizes = Vec::with_capacity(files.len());
        for file in files {
            sizes.push(tokio::fs::metadata(file).await?.len());
        }
        let mut tracker = ProgressTracker::new(sizes.iter().sum(), files.len());

        for (file, size) in files.iter().zip(sizes) {
            if self.cancel_token.is_cancelled() {
                return Err(StashError::Cancelled);
            }
            let name = file_name(file);
            let key = task.remote_key(content, &name);

            if self
                .upload_gated(&task.bucket, &key, file, task.storage_class, size, summary)
                .await?
            {
                tracker.record(size);
                info!("{}", tracker.describe("Uploaded", &name));
            }
        }
        Ok(())
    }

    /// Upload `file` unless `key` already exists. Returns whether bytes were sent.
    async fn upload_gated(
        &self,
        bucket: &str,
        key: &str,
        file: &Path,
        class: StorageClass,
        size: u64,
        summary: &mut BackupSummary,
    ) -> Result<bool> {
        let path = file.to_path_buf();
        let checksum = blocking(move || Ok(sha256_file(&path)?)).await?;

        if self.dry_run {
            info!(
                "[dry-run] Would upload {} ({}) to {}/{} as {}",
                file.display(),
                format_bytes(size),
                bucket,
                key,
                class
            );
            summary.uploaded += 1;
            summary.bytes += size;
            return Ok(false);
        }

        let existing = self
            .retry
            .run(&format!("Check existence of {}", key), &self.cancel_token, || {
                self.store.head(bucket, key)
            })
            .await
            .map_err(|e| match e {
                StashError::Cancelled => StashError::Cancelled,
                other => StashError::SafetyAbort(format!(
                    "cannot verify whether {} exists ({}); upload aborted to avoid overwriting",
                    key, other
                )),
            })?;

        if existing.is_some() {
            info!("Skipping {} (already exists in store)", key);
            summary.skipped_existing += 1;
            return Ok(false);
        }

        info!("Uploading {} ({}) as {}", key, format_bytes(size), class);
        let result = self
            .retry
            .run(&format!("Upload {}", key), &self.cancel_token, || {
                self.store.put_file(bucket, key, file, class, &checksum)
            })
            .await;

        if let Err(e) = result {
            if let Err(cleanup) = self.store.delete(bucket, key).await {
                warn!("Could not remove partial object {}: {}", key, cleanup);
            }
            return Err(e);
        }

        summary.uploaded += 1;
        summary.bytes += size;
        Ok(true)
    }

    /// Sanitized manifest and ledger, next to the first task's prefix.
    /// Upload the sanitized manifest and the ledger under the first task's
    /// prefix. Both go through the existence gate, so a remote copy from an
    /// earlier run is kept and the remote ledger stays at its first version.
    async fn upload_additional_files(
        &self,
        manifest: &TaskManifest,
        tasks: &[Task],
        manifest_path: &Path,
        ledger: &ProcessedTracker,
        summary: &mut BackupSummary,
    ) -> Result<()> {
        let Some(first) = tasks.first() else {
            return Ok(());
        };

        tokio::fs::create_dir_all(&first.temp_dir).await?;
        let manifest_name = file_name(manifest_path);
        let sanitized = first.temp_dir.join(format!("{}.sanitized", manifest_name));
        tokio::fs::write(&sanitized, manifest.sanitized_json()?).await?;

        let mut uploads = vec![(sanitized.clone(), manifest_name)];
        if ledger.exists() {
            uploads.push((ledger.path().to_path_buf(), file_name(ledger.path())));
        }

        let mut result = Ok(());
        for (path, name) in uploads {
            let key = join_key([first.prefix.as_str(), name.as_str()]);
            let size = tokio::fs::metadata(&path).await?.len();
            result = self
                .upload_gated(&first.bucket, &key, &path, StorageClass::Standard, size, summary)
                .await
                .map(|_| ());
            if result.is_err() {
                break;
            }
        }

        if let Err(e) = remove_if_exists(&sanitized) {
            warn!("Could not remove {}: {}", sanitized.display(), e);
        }
        result
    }

    /// Remove whatever a failed preparation left behind.
    async fn discard_temp(&self, task: &Task, content: &Path) {
        if !task.cleanup {
            return;
        }
        let Ok(archive) = archive_path(task, content) else {
            return;
        };
        let prefix = file_name(&archive);
        let Ok(mut entries) = tokio::fs::read_dir(&task.temp_dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
    }
}

fn archive_path(task: &Task, content: &Path) -> Result<PathBuf> {
    let name = content
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| {
            StashError::Validation(format!("{} has no file name", content.display()))
        })?;
    if is_archive_file(content) {
        Ok(task.temp_dir.join(name))
    } else {
        Ok(task.temp_dir.join(format!("{}{}", name, ARCHIVE_SUFFIX)))
    }
}

fn is_archive_file(path: &Path) -> bool {
    path.is_file() && path.to_string_lossy().ends_with(ARCHIVE_SUFFIX)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveCodec;
    use crate::crypto::KdfParams;
    use crate::split::combine;
    use crate::testing::{Fault, MockStore};
    use std::fs;
    use tempfile::TempDir;

    const SECRET: &str = "Tr0ub4dor&3_Test";

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        manifest: PathBuf,
        store: Arc<MockStore>,
    }

    fn fixture(split_mb: u64, secret: Option<&str>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let data = root.join("home/me/docs");
        fs::create_dir_all(data.join("letters")).unwrap();
        // xorshift64: incompressible, so the archive stays above the split size
        let mut state = 0x9E37_79B9_7F4A_7C15u64;
        let noise: Vec<u8> = (0..3_000_000)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state >> 32) as u8
            })
            .collect();
        fs::write(data.join("letters/noise.bin"), &noise).unwrap();
        fs::write(data.join("todo.txt"), b"backup everything").unwrap();

        let secret_field = secret
            .map(|s| format!(r#","EncryptionSecret":"{}""#, s))
            .unwrap_or_default();
        let manifest = root.join("tasks.json");
        fs::write(
            &manifest,
            format!(
                r#"{{"tasks":[{{"S3Bucket":"vault","S3Prefix":"laptop","TrimBeginningOfPathInS3":"{trim}",
                "StorageClass":"DEEP_ARCHIVE","ArchiveSplitEachMB":"{mb}",
                "TmpStorageToBuildArchives":"{tmp}","Content":["{content}"]{secret}}}]}}"#,
                trim = root.join("home").display(),
                mb = split_mb,
                tmp = root.join("tmp").display(),
                content = data.display(),
                secret = secret_field
            ),
        )
        .unwrap();

        Fixture {
            _dir: dir,
            root,
            manifest,
            store: Arc::new(MockStore::new()),
        }
    }

    fn executor(store: Arc<MockStore>) -> BackupExecutor {
        let cheap = KdfParams::new(4, 8, 1);
        BackupExecutor::new(&AppConfig::default(), store)
            .with_crypto(CryptoEngine::with_params(cheap, cheap))
            .with_retry(RetryPolicy::new(
                Duration::from_millis(1),
                Duration::from_millis(4),
                Duration::from_millis(200),
            ))
    }

    #[tokio::test]
    async fn test_split_backup_uploads_parts_and_records() -> Result<()> {
        let fx = fixture(1, None);
        let summary = executor(fx.store.clone()).execute(&fx.manifest).await?;

        assert!(summary.is_success());
        let keys = fx.store.keys();
        let parts: Vec<&String> = keys.iter().filter(|k| k.contains("-part")).collect();
        assert!(parts.len() >= 2, "expected a split archive, got {:?}", keys);
        assert!(keys.contains(&"laptop/me/docs.tar.gz-part00001".to_string()));
        assert!(keys.contains(&"laptop/me/docs.tar.gz-HowToBuild.txt".to_string()));
        assert!(keys.contains(&"laptop/tasks.json".to_string()));
        assert!(keys.contains(&"laptop/tasks.json-processed.txt".to_string()));
        assert_eq!(
            fx.store.class_of("vault", "laptop/me/docs.tar.gz-part00001"),
            Some(StorageClass::DeepArchive)
        );
        assert_eq!(fx.store.class_of("vault", "laptop/tasks.json"), Some(StorageClass::Standard));

        let ledger = fs::read_to_string(fx.root.join("tasks.json-processed.txt"))?;
        assert!(ledger.contains(&format!(" * Number of file parts: {}", parts.len())));

        // Temp storage is cleaned by default.
        assert_eq!(fs::read_dir(fx.root.join("tmp"))?.count(), 0);

        // Reassemble from the store and unpack.
        let out = fx.root.join("out");
        fs::create_dir_all(&out)?;
        for key in &keys {
            if let Some(name) = key.strip_prefix("laptop/me/") {
                fs::write(out.join(name), fx.store.object("vault", key).unwrap())?;
            }
        }
        combine(&out)?;
        ArchiveCodec::new(Some(1)).extract(&out.join("docs.tar.gz"), &out)?;
        assert_eq!(fs::read(out.join("docs/todo.txt"))?, b"backup everything");
        Ok(())
    }

    #[tokio::test]
    async fn test_rerun_only_touches_manifest_and_ledger() -> Result<()> {
        let fx = fixture(250, None);
        executor(fx.store.clone()).execute(&fx.manifest).await?;

        let second = Arc::new(MockStore::new());
        let summary = executor(second.clone()).execute(&fx.manifest).await?;
        assert_eq!(summary.skipped_processed, 1);
        assert_eq!(summary.uploaded, 2);

        let manifest_name = file_name(&fx.manifest);
        let calls = second.calls();
        assert_eq!(calls.len(), 4, "{:?}", calls);
        for call in &calls {
            let key = call.rsplit('/').next().unwrap_or_default();
            assert!(key.starts_with(&manifest_name), "unexpected call: {}", call);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_existing_objects_are_skipped() -> Result<()> {
        let fx = fixture(250, None);
        fx.store
            .insert("vault", "laptop/me/docs.tar.gz", b"older copy", StorageClass::DeepArchive);

        let summary = executor(fx.store.clone()).execute(&fx.manifest).await?;
        assert_eq!(summary.skipped_existing, 1);
        assert_eq!(fx.store.object("vault", "laptop/me/docs.tar.gz").unwrap(), b"older copy");
        assert_eq!(fx.store.count("put"), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_encrypted_backup_uploads_only_ciphertext() -> Result<()> {
        let fx = fixture(1, Some(SECRET));
        let summary = executor(fx.store.clone()).execute(&fx.manifest).await?;
        assert!(summary.is_success());

        let keys = fx.store.keys();
        let content: Vec<&String> = keys.iter().filter(|k| k.starts_with("laptop/me/")).collect();
        assert!(content.iter().all(|k| k.ends_with(".enc")), "{:?}", content);
        assert!(keys.contains(&"laptop/me/docs.tar.gz-HowToBuild.txt.enc".to_string()));

        let manifest_copy =
            String::from_utf8(fx.store.object("vault", "laptop/tasks.json").unwrap()).unwrap();
        assert!(!manifest_copy.contains(SECRET));
        Ok(())
    }

    #[tokio::test]
    async fn test_transient_head_failure_is_retried() -> Result<()> {
        let fx = fixture(250, None);
        fx.store.fail_next("head", Fault::Reset);

        let summary = executor(fx.store.clone()).execute(&fx.manifest).await?;
        assert!(summary.is_success());
        assert_eq!(fx.store.count("put"), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_unverifiable_existence_aborts_run() {
        let fx = fixture(250, None);
        fx.store.fail_next("head", Fault::Denied);

        let err = executor(fx.store.clone()).execute(&fx.manifest).await.unwrap_err();
        assert!(matches!(err, StashError::SafetyAbort(_)));
        assert_eq!(fx.store.count("put"), 0);
        assert!(!fx.root.join("tasks.json-processed.txt").exists());
    }

    #[tokio::test]
    async fn test_failed_upload_removes_partial_object() -> Result<()> {
        let fx = fixture(250, None);
        fx.store.fail_next("put", Fault::Denied);

        let summary = executor(fx.store.clone()).execute(&fx.manifest).await?;
        assert_eq!(summary.failed, 1);
        assert!(!summary.is_success());
        assert_eq!(fx.store.count("delete"), 1);
        assert!(fx.store.keys().is_empty());
        assert!(!fx.root.join("tasks.json-processed.txt").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() -> Result<()> {
        let fx = fixture(1, None);
        let summary = executor(fx.store.clone())
            .dry_run(true)
            .execute(&fx.manifest)
            .await?;

        assert!(summary.dry_run);
        assert!(summary.uploaded >= 3);
        assert!(fx.store.calls().is_empty());
        assert!(!fx.root.join("tasks.json-processed.txt").exists());
        // Prepared files stay for inspection.
        assert!(fx.root.join("tmp/docs.tar.gz-part00001").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_weak_secret_rejected_before_network() {
        let fx = fixture(250, Some("password"));
        let err = executor(fx.store.clone()).execute(&fx.manifest).await.unwrap_err();
        assert!(matches!(err, StashError::Validation(_)));
        assert!(fx.store.calls().is_empty());
    }
}
