//! Object store seam consumed by the backup and restore pipelines.
//!
//! The pipelines only talk to [`BlobStore`]; [`local::LocalStore`] is the
//! filesystem implementation used for dry-runs, simulation and tests.

pub mod local;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::warn;

use crate::Result;

pub use local::LocalStore;

/// Storage classes understood by the pipelines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum StorageClass {
    #[default]
    Standard,
    StandardIa,
    OnezoneIa,
    IntelligentTiering,
    GlacierIr,
    Glacier,
    DeepArchive,
    ExpressOnezone,
    ReducedRedundancy,
}

impl StorageClass {
    /// Parse a class name. Unknown names fall back to `STANDARD` with a warning.
    pub fn parse_lenient(name: &str) -> Self {
        match name.trim().to_ascii_uppercase().as_str() {
            "STANDARD" => StorageClass::Standard,
            "STANDARD_IA" => StorageClass::StandardIa,
            "ONEZONE_IA" => StorageClass::OnezoneIa,
            "INTELLIGENT_TIERING" => StorageClass::IntelligentTiering,
            "GLACIER_IR" => StorageClass::GlacierIr,
            "GLACIER" | "GLACIER_FLEXIBLE_RETRIEVAL" => StorageClass::Glacier,
            "DEEP_ARCHIVE" => StorageClass::DeepArchive,
            "EXPRESS_ONEZONE" => StorageClass::ExpressOnezone,
            "REDUCED_REDUNDANCY" => StorageClass::ReducedRedundancy,
            other => {
                warn!("Unknown storage class '{}', using STANDARD", other);
                StorageClass::Standard
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StorageClass::Standard => "STANDARD",
            StorageClass::StandardIa => "STANDARD_IA",
            StorageClass::OnezoneIa => "ONEZONE_IA",
            StorageClass::IntelligentTiering => "INTELLIGENT_TIERING",
            StorageClass::GlacierIr => "GLACIER_IR",
            StorageClass::Glacier => "GLACIER",
            StorageClass::DeepArchive => "DEEP_ARCHIVE",
            StorageClass::ExpressOnezone => "EXPRESS_ONEZONE",
            StorageClass::ReducedRedundancy => "REDUCED_REDUNDANCY",
        }
    }

    /// Reads need an explicit retrieval first.
    pub fn is_archival(self) -> bool {
        matches!(self, StorageClass::Glacier | StorageClass::DeepArchive)
    }
}

impl fmt::Display for StorageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retrieval speed for archival objects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalTier {
    #[default]
    Bulk,
    Standard,
    Expedited,
}

impl RetrievalTier {
    pub fn parse_lenient(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "bulk" => RetrievalTier::Bulk,
            "standard" => RetrievalTier::Standard,
            "expedited" => RetrievalTier::Expedited,
            other => {
                warn!("Unknown retrieval tier '{}', using bulk", other);
                RetrievalTier::Bulk
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RetrievalTier::Bulk => "Bulk",
            RetrievalTier::Standard => "Standard",
            RetrievalTier::Expedited => "Expedited",
        }
    }

    /// Rough wait until a requested object becomes readable.
    pub fn expected_wait(self, class: StorageClass) -> &'static str {
        match (self, class) {
            (RetrievalTier::Expedited, _) => "1-5 minutes",
            (RetrievalTier::Standard, StorageClass::DeepArchive) => "up to 12 hours",
            (RetrievalTier::Standard, _) => "3-5 hours",
            (RetrievalTier::Bulk, StorageClass::DeepArchive) => "up to 48 hours",
            (RetrievalTier::Bulk, _) => "5-12 hours",
        }
    }
}

impl fmt::Display for RetrievalTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata returned by [`BlobStore::head`].
#[derive(Debug, Clone, PartialEq)]
pub struct HeadInfo {
    pub size: u64,
    pub storage_class: StorageClass,
    /// Raw restore header, e.g. `ongoing-request="true"`; `None` when no retrieval was requested.
    pub restore: Option<String>,
}

/// One entry of a bucket listing.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub storage_class: StorageClass,
}

/// Retrieval state of one remote object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreState {
    /// Not on an archival tier; readable right away.
    NotApplicable,
    NotInitiated,
    InProgress,
    Available,
}

impl RestoreState {
    pub fn from_head(head: &HeadInfo) -> Self {
        if !head.storage_class.is_archival() {
            return RestoreState::NotApplicable;
        }
        match head.restore.as_deref() {
            None => RestoreState::NotInitiated,
            Some(header) if header.contains("ongoing-request=\"false\"") => RestoreState::Available,
            Some(_) => RestoreState::InProgress,
        }
    }

    pub fn is_readable(self) -> bool {
        matches!(self, RestoreState::NotApplicable | RestoreState::Available)
    }
}

/// Primitive object store operations.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload a file. `sha256` is the hex digest of its content.
    async fn put_file(
        &self,
        bucket: &str,
        key: &str,
        source: &Path,
        class: StorageClass,
        sha256: &str,
    ) -> Result<()>;

    /// Download an object into `dest`, returning the byte count.
    /// Fails with `NotFound` when the key does not exist.
    async fn get_to_file(&self, bucket: &str, key: &str, dest: &Path) -> Result<u64>;

    /// Object metadata, or `None` when the key does not exist.
    async fn head(&self, bucket: &str, key: &str) -> Result<Option<HeadInfo>>;

    /// Delete an object. Deleting a missing key succeeds.
    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    /// Ask for an archival object to be made readable for `days` days.
    /// Fails with `RestoreAlreadyInProgress` when a request is already running.
    async fn request_restore(
        &self,
        bucket: &str,
        key: &str,
        tier: RetrievalTier,
        days: u32,
    ) -> Result<()>;

    /// All objects whose key starts with `prefix`, sorted by key.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>>;
}

/// Join key segments with `/`, dropping empty segments and stray slashes.
pub fn join_key<'a>(segments: impl IntoIterator<Item = &'a str>) -> String {
    segments
        .into_iter()
        .flat_map(|s| s.split('/'))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}
