//! Filesystem-backed object store.
//!
//! Bucket `b` and key `k` live at `<root>/b/k`; an empty bucket name maps to
//! the root itself, which lets a plain local directory act as a bucket.
//! Everything stored here is `STANDARD`, so restore requests are no-ops.

use async_trait::async_trait;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use super::{BlobStore, HeadInfo, ObjectInfo, RetrievalTier, StorageClass};
use crate::fs::walker::{walk, WalkOptions};
use crate::fs::{remove_if_exists, sha256_file, temp_sibling};
use crate::utils::blocking;
use crate::{Result, StashError};

#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn bucket_dir(&self, bucket: &str) -> PathBuf {
        if bucket.is_empty() {
            self.root.clone()
        } else {
            self.root.join(bucket)
        }
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(StashError::Validation(format!("invalid object key: {}", key)));
        }
        Ok(self.bucket_dir(bucket).join(relative))
    }
}

#[async_trait]
impl BlobStore for LocalStore {
    async fn put_file(
        &self,
        bucket: &str,
        key: &str,
        source: &Path,
        class: StorageClass,
        sha256: &str,
    ) -> Result<()> {
        let target = self.object_path(bucket, key)?;
        let source = source.to_path_buf();
        let expected = sha256.to_string();
        debug!("Storing {} as {} ({})", source.display(), key, class);

        blocking(move || {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let staging = temp_sibling(&target);
            fs::copy(&source, &staging)?;

            let actual = sha256_file(&staging)?;
            if actual != expected {
                remove_if_exists(&staging)?;
                return Err(StashError::Format(format!(
                    "checksum mismatch for {}: expected {}, got {}",
                    target.display(),
                    expected,
                    actual
                )));
            }

            fs::rename(&staging, &target)?;
            Ok(())
        })
        .await
    }

    async fn get_to_file(&self, bucket: &str, key: &str, dest: &Path) -> Result<u64> {
        let source = self.object_path(bucket, key)?;
        let dest = dest.to_path_buf();
        let (bucket, key) = (bucket.to_string(), key.to_string());

        blocking(move || {
            if !source.is_file() {
                return Err(StashError::NotFound { bucket, key });
            }
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            Ok(fs::copy(&source, &dest)?)
        })
        .await
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<Option<HeadInfo>> {
        let path = self.object_path(bucket, key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(HeadInfo {
                size: meta.len(),
                storage_class: StorageClass::Standard,
                restore: None,
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let path = self.object_path(bucket, key)?;
        Ok(remove_if_exists(&path)?)
    }

    async fn request_restore(
        &self,
        _bucket: &str,
        key: &str,
        tier: RetrievalTier,
        days: u32,
    ) -> Result<()> {
        debug!(
            "Restore request for {} ({} tier, {} days) ignored by local store",
            key, tier, days
        );
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let dir = self.bucket_dir(bucket);
        let prefix = prefix.to_string();

        blocking(move || {
            if !dir.is_dir() {
                return Ok(Vec::new());
            }
            let mut objects: Vec<ObjectInfo> = walk(&dir, &WalkOptions::files())?
                .into_iter()
                .map(|f| ObjectInfo {
                    key: f.slash_path(),
                    size: f.size,
                    storage_class: StorageClass::Standard,
                })
                .filter(|o| o.key.starts_with(&prefix))
                .collect();
            objects.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(objects)
        })
        .await
    }
}
