//! Append-only record of source paths that were fully uploaded.
//!
//! Each completed path is one block:
//!
//! ```text
//! /data/photos
//!  * Timestamp of upload: 1700000000 (Tue, 14 Nov 2023 22:13:20 UTC)
//!  * Number of file parts: 3
//! ```
//!
//! Lookup is by exact line match on the path. The record is keyed by path
//! only, so a changed file at a recorded path is not uploaded again. Safe for
//! a single sequential writer.

use chrono::{DateTime, Utc};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::Result;

/// Appended to the manifest path to name its ledger.
pub const LEDGER_SUFFIX: &str = "-processed.txt";

#[derive(Debug, Clone)]
pub struct ProcessedTracker {
    path: PathBuf,
}

impl ProcessedTracker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Ledger that belongs to `manifest`: `<manifest>-processed.txt`.
    pub fn for_manifest(manifest: &Path) -> Self {
        let mut name = manifest.as_os_str().to_os_string();
        name.push(LEDGER_SUFFIX);
        Self::new(PathBuf::from(name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn is_processed(&self, key: &str) -> Result<bool> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(content.lines().any(|line| line == key)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn mark_processed(&self, key: &str, part_count: usize) -> Result<()> {
        self.mark_processed_at(key, part_count, Utc::now())
    }

    pub fn mark_processed_at(&self, key: &str, part_count: usize, at: DateTime<Utc>) -> Result<()> {
        let block = format!(
            "{}\n * Timestamp of upload: {} ({})\n * Number of file parts: {}\n\n",
            key,
            at.timestamp(),
            at.format("%a, %d %b %Y %H:%M:%S UTC"),
            part_count
        );

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(block.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_absent_ledger_means_unprocessed() -> Result<()> {
        let dir = TempDir::new()?;
        let tracker = ProcessedTracker::new(dir.path().join("none.txt"));
        assert!(!tracker.is_processed("/data")?);
        assert!(!tracker.exists());
        Ok(())
    }

    #[test]
    fn test_mark_then_lookup() -> Result<()> {
        let dir = TempDir::new()?;
        let tracker = ProcessedTracker::for_manifest(&dir.path().join("tasks.json"));
        assert_eq!(tracker.path(), dir.path().join("tasks.json-processed.txt"));

        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        tracker.mark_processed_at("/data/photos", 3, at)?;

        assert!(tracker.is_processed("/data/photos")?);
        assert!(!tracker.is_processed("/data")?);
        assert!(!tracker.is_processed("/data/photos/2020")?);

        let content = fs::read_to_string(tracker.path())?;
        assert_eq!(
            content,
            "/data/photos\n * Timestamp of upload: 1700000000 (Tue, 14 Nov 2023 22:13:20 UTC)\n * Number of file parts: 3\n\n"
        );
        Ok(())
    }

    #[test]
    fn test_appends_never_rewrite() -> Result<()> {
        let dir = TempDir::new()?;
        let tracker = ProcessedTracker::new(dir.path().join("ledger.txt"));
        tracker.mark_processed("/a", 1)?;
        tracker.mark_processed("/a", 1)?;
        tracker.mark_processed("/b", 2)?;

        let content = fs::read_to_string(tracker.path())?;
        assert_eq!(content.lines().filter(|l| *l == "/a").count(), 2);
        assert!(tracker.is_processed("/b")?);
        Ok(())
    }
}
