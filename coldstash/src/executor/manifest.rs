//! Backup task manifest.
//!
//! ```json
//! {"tasks": [{
//!   "S3Bucket": "my-backups",
//!   "S3Prefix": "laptop",
//!   "TrimBeginningOfPathInS3": "/home/me",
//!   "StorageClass": "DEEP_ARCHIVE",
//!   "ArchiveSplitEachMB": "250",
//!   "TmpStorageToBuildArchives": "/tmp/coldstash",
//!   "CleanupTmpStorage": "yes",
//!   "EncryptionSecret": "...",
//!   "Content": ["/home/me/photos", "/home/me/notes.md"]
//! }]}
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

use crate::crypto::password::validate_password;
use crate::store::StorageClass;
use crate::{Result, StashError};

pub const DEFAULT_SPLIT_MB: u64 = 250;

/// The manifest file as written by the operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskManifest {
    pub tasks: Vec<TaskEntry>,
}

/// A number that may also be written as a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Lenient<T> {
    Value(T),
    Text(String),
}

/// One task as it appears in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEntry {
    #[serde(rename = "S3Bucket")]
    pub bucket: String,

    #[serde(rename = "S3Prefix", default)]
    pub prefix: String,

    #[serde(rename = "TrimBeginningOfPathInS3", default)]
    pub trim_prefix: String,

    #[serde(rename = "StorageClass", default)]
    pub storage_class: String,

    #[serde(rename = "ArchiveSplitEachMB", default, skip_serializing_if = "Option::is_none")]
    pub split_mb: Option<Lenient<u64>>,

    #[serde(rename = "TmpStorageToBuildArchives", default)]
    pub temp_dir: String,

    #[serde(rename = "CleanupTmpStorage", default, skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<Lenient<bool>>,

    #[serde(rename = "EncryptionSecret", default, skip_serializing_if = "Option::is_none")]
    pub encryption_secret: Option<String>,

    #[serde(rename = "Content", default)]
    pub content: Vec<String>,
}

/// A validated task, ready for the pipeline.
#[derive(Clone)]
pub struct Task {
    pub bucket: String,
    pub prefix: String,
    pub trim_prefix: String,
    pub storage_class: StorageClass,
    pub chunk_size: u64,
    pub temp_dir: PathBuf,
    pub cleanup: bool,
    pub secret: Option<Zeroizing<String>>,
    pub content: Vec<PathBuf>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("storage_class", &self.storage_class)
            .field("chunk_size", &self.chunk_size)
            .field("temp_dir", &self.temp_dir)
            .field("cleanup", &self.cleanup)
            .field("encrypted", &self.secret.is_some())
            .field("content", &self.content)
            .finish()
    }
}

impl Task {
    /// Remote key of `file_name` produced from `content`:
    /// `<prefix>/<dir of content without trim prefix>/<file_name>`.
    ///
    /// The trim prefix only matches whole path components, so `/home/me`
    /// trims `/home/me/docs` but not `/home/meow`.
    pub fn remote_key(&self, content: &Path, file_name: &str) -> String {
        let parent = content
            .parent()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default();
        crate::store::join_key([self.prefix.as_str(), self.trim(&parent), file_name])
    }

    fn trim<'a>(&self, dir: &'a str) -> &'a str {
        if self.trim_prefix.is_empty() {
            return dir;
        }
        let prefix = self.trim_prefix.trim_end_matches('/');
        if dir == prefix {
            return "";
        }
        dir.strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(dir)
    }
}

impl TaskManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let manifest: TaskManifest = serde_json::from_str(&content)?;
        if manifest.tasks.is_empty() {
            return Err(StashError::Validation(format!(
                "no tasks found in {}",
                path.display()
            )));
        }
        Ok(manifest)
    }

    /// Validate every task up front, before anything touches the network.
    pub fn resolve(&self) -> Result<Vec<Task>> {
        self.tasks.iter().map(TaskEntry::resolve).collect()
    }

    /// Pretty JSON of the manifest with every encryption secret removed.
    pub fn sanitized_json(&self) -> Result<String> {
        let mut copy = self.clone();
        for task in &mut copy.tasks {
            task.encryption_secret = None;
        }
        Ok(serde_json::to_string_pretty(&copy)?)
    }
}

impl TaskEntry {
    pub fn resolve(&self) -> Result<Task> {
        if self.bucket.trim().is_empty() {
            return Err(StashError::Validation("S3Bucket must not be empty".into()));
        }
        if self.content.is_empty() {
            return Err(StashError::Validation(format!(
                "task for bucket {} has no Content",
                self.bucket
            )));
        }

        let split_mb = parse_split_mb(self.split_mb.as_ref())?;
        let chunk_size = split_mb.checked_mul(1024 * 1024).ok_or_else(|| {
            StashError::Validation(format!("ArchiveSplitEachMB is too large: {}", split_mb))
        })?;
        let secret = match self.encryption_secret.as_deref() {
            Some(secret) if !secret.is_empty() => {
                validate_password(secret)?;
                Some(Zeroizing::new(secret.to_string()))
            }
            _ => None,
        };
        let temp_dir = if self.temp_dir.trim().is_empty() {
            std::env::temp_dir().join("coldstash")
        } else {
            PathBuf::from(&self.temp_dir)
        };

        Ok(Task {
            bucket: self.bucket.clone(),
            prefix: self.prefix.clone(),
            trim_prefix: self.trim_prefix.clone(),
            storage_class: StorageClass::parse_lenient(&self.storage_class),
            chunk_size,
            temp_dir,
            cleanup: parse_cleanup(self.cleanup.as_ref()),
            secret,
            content: self.content.iter().map(PathBuf::from).collect(),
        })
    }
}

fn parse_split_mb(value: Option<&Lenient<u64>>) -> Result<u64> {
    let mb = match value {
        None => DEFAULT_SPLIT_MB,
        Some(Lenient::Value(n)) => *n,
        Some(Lenient::Text(s)) if s.trim().is_empty() => DEFAULT_SPLIT_MB,
        Some(Lenient::Text(s)) => s.trim().parse().map_err(|_| {
            StashError::Validation(format!("invalid ArchiveSplitEachMB value: {}", s))
        })?,
    };
    if mb == 0 {
        return Err(StashError::Validation(
            "ArchiveSplitEachMB must be greater than zero".into(),
        ));
    }
    Ok(mb)
}

/// `true`/`yes` and `false`/`no`, any case; anything else keeps the default (cleanup on).
fn parse_cleanup(value: Option<&Lenient<bool>>) -> bool {
    match value {
        Some(Lenient::Value(flag)) => *flag,
        Some(Lenient::Text(s)) => !matches!(s.trim().to_ascii_lowercase().as_str(), "false" | "no"),
        None => true,
    }
}
