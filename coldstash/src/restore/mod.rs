//! Restore pipeline.
//!
//! resolve objects -> drop finished ones -> archival retrieval requests ->
//! optional polling -> download -> decrypt -> combine -> unpack.
//!
//! Every stage skips work whose result already exists locally, so an
//! interrupted or partially pending restore is resumed by running it again.

pub mod objects;

use objects::{
    download_skip_reason, final_artifact_exists, load_object_list, local_path, save_object_list,
    scan_directory, GENERATED_LIST_NAME,
};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

use crate::archive::{unpacked_path, ArchiveCodec, ARCHIVE_SUFFIX};
use crate::config::{AppConfig, RestoreConfig};
use crate::crypto::{decrypted_path, CryptoEngine, ENCRYPTED_SUFFIX};
use crate::fs::walker::{walk, WalkOptions};
use crate::fs::{remove_if_exists, temp_sibling};
use crate::prompt::Prompter;
use crate::retry::RetryPolicy;
use crate::split::combine;
use crate::store::{BlobStore, ObjectInfo, RestoreState, StorageClass};
use crate::transfer::progress::{format_bytes, format_duration};
use crate::utils::blocking;
use crate::{Result, StashError};

/// Where the list of objects to restore comes from.
#[derive(Debug, Clone)]
pub enum ObjectSource {
    /// JSON list, hand-written or saved by an earlier listing.
    File(PathBuf),
    /// List the bucket below the request prefix.
    Listing,
    /// Walk a local directory that stands in for the bucket.
    LocalScan(PathBuf),
}

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub bucket: String,
    pub prefix: String,
    pub source: ObjectSource,
    pub destination: PathBuf,
}

/// Totals of one restore run
#[derive(Debug, Default, Clone)]
pub struct RestoreSummary {
    pub total_objects: usize,
    pub downloaded: usize,
    pub skipped: usize,
    pub pending: usize,
    pub failed: usize,
    pub retrievals_requested: usize,
    pub decrypted: usize,
    pub combined: usize,
    pub unpacked: usize,
    pub warnings: usize,
    pub bytes: u64,
    pub restore_wait_time: Duration,
    pub download_time: Duration,
    pub processing_time: Duration,
    pub total_time: Duration,
    pub errors: Vec<String>,
}

impl RestoreSummary {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    fn record_failure(&mut self, key: &str, err: impl fmt::Display) {
        self.failed += 1;
        self.errors.push(format!("{}: {}", key, err));
    }
}

impl fmt::Display for RestoreSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(50);
        writeln!(f, "{}", rule)?;
        writeln!(f, "RESTORE SUMMARY")?;
        writeln!(f, "{}", rule)?;
        writeln!(f, "Objects: {}", self.total_objects)?;
        writeln!(f, "Downloaded: {}", self.downloaded)?;
        writeln!(f, "Skipped (already exists): {}", self.skipped)?;
        if self.retrievals_requested > 0 {
            writeln!(f, "Retrievals requested: {}", self.retrievals_requested)?;
        }
        if self.pending > 0 {
            writeln!(f, "Restore pending (run again later): {}", self.pending)?;
        }
        writeln!(f, "Decrypted: {}", self.decrypted)?;
        writeln!(f, "Combined: {}", self.combined)?;
        writeln!(f, "Unpacked: {}", self.unpacked)?;
        writeln!(f, "Failed: {}", self.failed)?;
        if self.warnings > 0 {
            writeln!(f, "Warnings: {}", self.warnings)?;
        }
        writeln!(f, "Data: {}", format_bytes(self.bytes))?;
        if !self.restore_wait_time.is_zero() {
            writeln!(f, "Restore wait time: {}", format_duration(self.restore_wait_time))?;
        }
        writeln!(f, "Download time: {}", format_duration(self.download_time))?;
        writeln!(f, "Processing time: {}", format_duration(self.processing_time))?;
        writeln!(f, "Total time: {}", format_duration(self.total_time))?;
        for e in &self.errors {
            writeln!(f, "  - {}", e)?;
        }
        write!(f, "{}", rule)
    }
}

pub struct RestoreCoordinator {
    store: Arc<dyn BlobStore>,
    prompter: Arc<dyn Prompter>,
    codec: ArchiveCodec,
    crypto: CryptoEngine,
    retry: RetryPolicy,
    settings: RestoreConfig,
    poll_interval: Option<Duration>,
    cancel_token: CancellationToken,
}

impl RestoreCoordinator {
    pub fn new(config: &AppConfig, store: Arc<dyn BlobStore>, prompter: Arc<dyn Prompter>) -> Self {
        Self::with_cancel(config, store, prompter, CancellationToken::new())
    }

    pub fn with_cancel(
        config: &AppConfig,
        store: Arc<dyn BlobStore>,
        prompter: Arc<dyn Prompter>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            store,
            prompter,
            codec: ArchiveCodec::from_config(&config.archive),
            crypto: CryptoEngine::from_config(&config.crypto),
            retry: RetryPolicy::from_config(&config.retry),
            settings: config.restore.clone(),
            poll_interval: config.restore.poll_interval(),
            cancel_token,
        }
    }

    pub fn with_crypto(mut self, crypto: CryptoEngine) -> Self {
        self.crypto = crypto;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Poll pending retrievals every `interval`; `None` reports them and stops.
    pub fn with_poll_interval(mut self, interval: Option<Duration>) -> Self {
        self.poll_interval = interval;
        self
    }

    pub async fn run(&self, request: &RestoreRequest) -> Result<RestoreSummary> {
        let start_time = Instant::now();
        let mut summary = RestoreSummary::default();

        let Some(all_objects) = self.resolve_objects(request).await? else {
            summary.total_time = start_time.elapsed();
            return Ok(summary);
        };
        summary.total_objects = all_objects.len();

        let mut work = Vec::new();
        for object in &all_objects {
            match local_path(&request.destination, &object.key) {
                Ok(local) if final_artifact_exists(&local) => summary.skipped += 1,
                Ok(local) => work.push((object.clone(), local)),
                Err(e) => {
                    warn!("Ignoring {}: {}", object.key, e);
                    summary.record_failure(&object.key, e);
                }
            }
        }
        if summary.skipped > 0 {
            info!("Skipping {} object(s) whose final files already exist", summary.skipped);
        }

        let mut password = None;
        if work.iter().any(|(o, _)| o.key.ends_with(ENCRYPTED_SUFFIX)) {
            password = Some(
                self.prompter
                    .password("Encrypted files detected. Enter decryption password: ")?,
            );
        }

        let mut pending = self.prepare_retrievals(&request.bucket, &work, &mut summary).await?;
        if !pending.is_empty() {
            match self.poll_interval {
                Some(interval) => {
                    self.wait_for_retrievals(&request.bucket, &pending, interval, &mut summary)
                        .await?;
                    pending.clear();
                }
                None => warn!(
                    "{} object(s) are still being retrieved; run the restore again once they are available",
                    pending.len()
                ),
            }
        }

        let download_start = Instant::now();
        let mut download_failures = 0;
        for (object, local) in &work {
            if self.cancel_token.is_cancelled() {
                return Err(StashError::Cancelled);
            }
            if pending.contains(&object.key) {
                summary.pending += 1;
                continue;
            }
            match self.download(&request.bucket, object, local, &mut summary).await {
                Ok(()) => {}
                Err(StashError::Cancelled) => return Err(StashError::Cancelled),
                Err(e) => {
                    error!("Failed to download {}: {}", object.key, e);
                    download_failures += 1;
                    summary.record_failure(&object.key, e);
                }
            }
        }
        summary.download_time = download_start.elapsed();

        let processing_start = Instant::now();
        if request.destination.is_dir() {
            let failed_before = summary.failed;
            self.decrypt_stage(&request.destination, &all_objects, password, &mut summary)
                .await?;
            let decrypt_failures = summary.failed - failed_before;

            if summary.pending > 0 || download_failures > 0 {
                warn!("Some objects are missing; leaving parts and archives as they are");
            } else if decrypt_failures > 0 {
                warn!(
                    "{} file(s) are still encrypted; leaving parts and archives as they are",
                    decrypt_failures
                );
            } else {
                self.combine_stage(&request.destination, &mut summary).await;
                if self.settings.skip_decompression {
                    info!("Skipping archive decompression");
                } else {
                    self.unpack_stage(&request.destination, &mut summary).await?;
                }
            }
        }
        summary.processing_time = processing_start.elapsed();
        summary.total_time = start_time.elapsed();
        Ok(summary)
    }

    /// `None` when the operator stopped to edit a generated object list.
    async fn resolve_objects(&self, request: &RestoreRequest) -> Result<Option<Vec<ObjectInfo>>> {
        match &request.source {
            ObjectSource::File(path) => {
                let objects = load_object_list(path)?;
                info!("Loaded {} object(s) from {}", objects.len(), path.display());
                Ok(Some(objects))
            }
            ObjectSource::LocalScan(dir) => {
                let objects = scan_directory(dir, &request.prefix)?;
                info!("Found {} file(s) in local directory {}", objects.len(), dir.display());
                Ok(Some(objects))
            }
            ObjectSource::Listing => {
                info!("Listing objects in {} (prefix {:?})", request.bucket, request.prefix);
                let objects = self
                    .retry
                    .run(&format!("List {}", request.bucket), &self.cancel_token, || {
                        self.store.list(&request.bucket, &request.prefix)
                    })
                    .await?;

                tokio::fs::create_dir_all(&request.destination).await?;
                let saved = request.destination.join(GENERATED_LIST_NAME);
                save_object_list(&saved, &objects)?;
                info!("Saved {} object(s) to {}", objects.len(), saved.display());

                if !self.settings.without_confirmation
                    && !self.prompter.confirm(
                        "Continue with the restore without editing the generated object list?",
                        false,
                    )?
                {
                    info!(
                        "Restore stopped. Edit {} and run again with --json {}",
                        saved.display(),
                        saved.display()
                    );
                    return Ok(None);
                }
                Ok(Some(objects))
            }
        }
    }

    /// Inspect archival objects and request retrieval where none is running.
    /// Returns the keys that are not readable yet.
    async fn prepare_retrievals(
        &self,
        bucket: &str,
        work: &[(ObjectInfo, PathBuf)],
        summary: &mut RestoreSummary,
    ) -> Result<BTreeSet<String>> {
        let mut pending = BTreeSet::new();
        let archival: Vec<&ObjectInfo> = work
            .iter()
            .map(|(object, _)| object)
            .filter(|object| object.storage_class.is_archival())
            .collect();
        if archival.is_empty() {
            return Ok(pending);
        }
        info!("{} object(s) are on archival storage", archival.len());

        let mut to_request = Vec::new();
        let mut available = 0;
        for object in archival {
            match self.inspect(bucket, &object.key).await? {
                RestoreState::NotInitiated => to_request.push(object),
                RestoreState::InProgress => {
                    info!("Retrieval already running for {}", object.key);
                    pending.insert(object.key.clone());
                }
                RestoreState::Available | RestoreState::NotApplicable => available += 1,
            }
        }
        if available > 0 {
            info!("{} archival object(s) already readable", available);
        }
        if to_request.is_empty() {
            return Ok(pending);
        }

        info!("{} object(s) need a retrieval request:", to_request.len());
        for object in &to_request {
            info!("  - {} ({}, {})", object.key, object.storage_class, format_bytes(object.size));
        }

        // Auto-retry runs are unattended.
        if !self.settings.without_confirmation && self.poll_interval.is_none() {
            let question = format!(
                "Request retrieval of these {} object(s) from archival storage?",
                to_request.len()
            );
            if !self.prompter.confirm(&question, false)? {
                return Err(StashError::Incomplete("retrieval declined by operator".into()));
            }
        }

        let tier = self.settings.retrieval_tier;
        let days = self.settings.available_days;
        info!(
            "Requesting retrieval of {} object(s) ({} tier, readable for {} days)",
            to_request.len(),
            tier,
            days
        );

        let slowest = if to_request.iter().any(|o| o.storage_class == StorageClass::DeepArchive) {
            StorageClass::DeepArchive
        } else {
            StorageClass::Glacier
        };

        for object in to_request {
            let result = self
                .retry
                .run(
                    &format!("Request retrieval of {}", object.key),
                    &self.cancel_token,
                    || self.store.request_restore(bucket, &object.key, tier, days),
                )
                .await;
            match result {
                Ok(()) => {
                    info!("Retrieval requested for {}", object.key);
                    summary.retrievals_requested += 1;
                }
                Err(StashError::RestoreAlreadyInProgress(_)) => {
                    info!("Retrieval already in progress for {}", object.key);
                }
                Err(e) => return Err(e),
            }
            pending.insert(object.key.clone());
        }

        info!("{} retrieval typically takes {}", tier, tier.expected_wait(slowest));
        Ok(pending)
    }

    async fn inspect(&self, bucket: &str, key: &str) -> Result<RestoreState> {
        let head = self
            .retry
            .run(&format!("Check restore state of {}", key), &self.cancel_token, || {
                self.store.head(bucket, key)
            })
            .await?
            .ok_or_else(|| StashError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;
        Ok(RestoreState::from_head(&head))
    }

    async fn wait_for_retrievals(
        &self,
        bucket: &str,
        pending: &BTreeSet<String>,
        interval: Duration,
        summary: &mut RestoreSummary,
    ) -> Result<()> {
        info!("Checking retrieval state every {}", format_duration(interval));
        let start = Instant::now();
        let total = pending.len();
        let mut waiting: Vec<String> = pending.iter().cloned().collect();

        loop {
            let mut still_waiting = Vec::new();
            for key in waiting {
                if self.inspect(bucket, &key).await?.is_readable() {
                    info!("{} is now available", key);
                } else {
                    still_waiting.push(key);
                }
            }

            if still_waiting.is_empty() {
                summary.restore_wait_time = start.elapsed();
                info!("All requested objects are available");
                return Ok(());
            }

            info!(
                "Retrieval progress: {}/{} ready, {} waiting",
                total - still_waiting.len(),
                total,
                still_waiting.len()
            );
            waiting = still_waiting;

            tokio::select! {
                _ = self.cancel_token.cancelled() => return Err(StashError::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn download(
        &self,
        bucket: &str,
        object: &ObjectInfo,
        local: &Path,
        summary: &mut RestoreSummary,
    ) -> Result<()> {
        if let Some(reason) = download_skip_reason(local) {
            info!("Skipping {} ({})", object.key, reason);
            summary.skipped += 1;
            return Ok(());
        }
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!("Downloading {} ({})", object.key, format_bytes(object.size));
        let staging = temp_sibling(local);
        let dest = staging.as_path();
        let result = self
            .retry
            .run(&format!("Download {}", object.key), &self.cancel_token, || {
                self.store.get_to_file(bucket, &object.key, dest)
            })
            .await;

        let bytes = match result {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = remove_if_exists(&staging);
                return Err(e);
            }
        };
        tokio::fs::rename(&staging, local).await?;

        summary.downloaded += 1;
        summary.bytes += bytes;
        Ok(())
    }

    /// Decrypt every downloaded `.enc` object. A wrong password lets the
    /// operator try another one, which then applies to the remaining files,
    /// or skip the file.
    async fn decrypt_stage(
        &self,
        destination: &Path,
        objects: &[ObjectInfo],
        mut password: Option<Zeroizing<String>>,
        summary: &mut RestoreSummary,
    ) -> Result<()> {
        let mut targets = Vec::new();
        for object in objects.iter().filter(|o| o.key.ends_with(ENCRYPTED_SUFFIX)) {
            let Ok(local) = local_path(destination, &object.key) else {
                continue;
            };
            if !local.is_file() {
                continue;
            }
            if decrypted_path(&local).is_some_and(|p| p.exists()) {
                info!("Skipping decryption of {} (decrypted file exists)", object.key);
                continue;
            }
            targets.push((object.key.clone(), local));
        }
        if targets.is_empty() {
            return Ok(());
        }
        info!("Decrypting {} file(s)", targets.len());

        for (key, local) in targets {
            if self.cancel_token.is_cancelled() {
                return Err(StashError::Cancelled);
            }
            loop {
                let secret = match &password {
                    Some(secret) => secret.clone(),
                    None => {
                        let secret = self.prompter.password("Enter decryption password: ")?;
                        password = Some(secret.clone());
                        secret
                    }
                };

                let crypto = self.crypto.clone();
                let path = local.clone();
                match blocking(move || crypto.decrypt_file(&path, &secret)).await {
                    Ok(_) => {
                        if let Err(e) = remove_if_exists(&local) {
                            warn!("Could not remove {}: {}", local.display(), e);
                        }
                        info!("Decrypted {}", key);
                        summary.decrypted += 1;
                        break;
                    }
                    Err(StashError::Decryption(reason)) => {
                        warn!("Could not decrypt {}: {}", key, reason);
                        let answer = self.prompter.password(&format!(
                            "Enter password for {} (or 'skip' to skip this file): ",
                            key
                        ))?;
                        let trimmed = answer.trim();
                        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("skip") {
                            info!("Skipping decryption of {}", key);
                            summary.record_failure(&key, "not decrypted");
                            break;
                        }
                        password = Some(answer);
                    }
                    Err(e) => {
                        error!("Could not decrypt {}: {}", key, e);
                        summary.record_failure(&key, e);
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn combine_stage(&self, destination: &Path, summary: &mut RestoreSummary) {
        let dir = destination.to_path_buf();
        match blocking(move || combine(&dir)).await {
            Ok(report) => {
                summary.combined += report.combined;
                summary.warnings += report.skipped;
            }
            Err(e) => {
                warn!("Could not combine parts: {}", e);
                summary.warnings += 1;
            }
        }
    }

    async fn unpack_stage(&self, destination: &Path, summary: &mut RestoreSummary) -> Result<()> {
        let dir = destination.to_path_buf();
        let archives =
            blocking(move || Ok(walk(&dir, &WalkOptions::with_suffix(ARCHIVE_SUFFIX))?)).await?;

        for file in archives {
            if self.cancel_token.is_cancelled() {
                return Err(StashError::Cancelled);
            }
            let (Some(target), Some(parent)) = (unpacked_path(&file.path), file.path.parent())
            else {
                continue;
            };
            let name = file.slash_path();
            if target.exists() {
                info!("Skipping unpack of {} ({} exists)", name, target.display());
                continue;
            }

            info!("Unpacking {}", name);
            let codec = self.codec.clone();
            let archive = file.path.clone();
            let parent = parent.to_path_buf();
            match blocking(move || codec.extract_staged(&archive, &parent)).await {
                Ok(entries) => {
                    if let Err(e) = remove_if_exists(&file.path) {
                        warn!("Could not remove {}: {}", name, e);
                    }
                    info!("Unpacked {} ({} entries)", name, entries);
                    summary.unpacked += 1;
                }
                Err(e) => {
                    error!("Failed to unpack {}: {}", name, e);
                    summary.record_failure(&name, e);
                }
            }
        }
        Ok(())
    }
}
