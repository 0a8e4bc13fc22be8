//! tar + parallel gzip packaging.
//!
//! Entries are named relative to the parent directory of each input, with
//! `/` separators, so `/data/photos` is stored as `photos/...`. Compression
//! favours speed and runs on a bounded worker pool; the pool only changes
//! throughput, never the order of the tar stream.

use filetime::FileTime;
use flate2::read::MultiGzDecoder;
use gzp::deflate::Gzip;
use gzp::par::compress::{ParCompress, ParCompressBuilder};
use gzp::ZWriter;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::ArchiveConfig;
use crate::fs::walker::{slash_path, walk, WalkOptions};
use crate::{Result, StashError};

/// Suffix of every archive this crate builds.
pub const ARCHIVE_SUFFIX: &str = ".tar.gz";

const BLOCK_SIZE: usize = 1024 * 1024;

/// Three quarters of the cores, between 1 and 8.
pub fn default_workers() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cores * 3 / 4).clamp(1, 8)
}

#[derive(Debug, Clone)]
pub struct ArchiveCodec {
    workers: usize,
}

impl ArchiveCodec {
    pub fn new(workers: Option<usize>) -> Self {
        Self {
            workers: workers.unwrap_or_else(default_workers).clamp(1, 8),
        }
    }

    pub fn from_config(config: &ArchiveConfig) -> Self {
        Self::new(config.workers)
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Pack `inputs` (files or directories, walked recursively) into `output`.
    /// Returns the archive size.
    pub fn build(&self, inputs: &[PathBuf], output: &Path) -> Result<u64> {
        info!(
            "Building archive {} from {} input(s) with {} worker(s)",
            output.display(),
            inputs.len(),
            self.workers
        );

        let file = File::create(output)?;
        let encoder: ParCompress<Gzip> = ParCompressBuilder::new()
            .num_threads(self.workers)
            .and_then(|b| b.buffer_size(BLOCK_SIZE))
            .map_err(|e| StashError::Config(format!("compression setup: {}", e)))?
            .compression_level(flate2::Compression::fast())
            .from_writer(file);

        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);

        for input in inputs {
            let base = input.parent().unwrap_or_else(|| Path::new(""));
            for entry in walk(input, &WalkOptions::files_and_dirs())? {
                let name = entry
                    .path
                    .strip_prefix(base)
                    .map(slash_path)
                    .unwrap_or_else(|_| slash_path(&entry.path));
                if name.is_empty() {
                    continue;
                }
                debug!("Adding {} to archive", name);
                builder.append_path_with_name(&entry.path, &name)?;
            }
        }

        let mut encoder = builder.into_inner()?;
        encoder
            .finish()
            .map_err(|e| StashError::Io(io::Error::other(e.to_string())))?;

        Ok(fs::metadata(output)?.len())
    }

    /// Unpack `archive` below `destination`. Returns the number of entries.
    pub fn extract(&self, archive: &Path, destination: &Path) -> Result<usize> {
        info!("Extracting {} into {}", archive.display(), destination.display());
        let file = File::open(archive)?;
        fs::create_dir_all(destination)?;

        unpack(file, destination).map_err(|e| match e.kind() {
            io::ErrorKind::PermissionDenied | io::ErrorKind::NotFound => StashError::Io(e),
            _ => StashError::Format(format!("{}: {}", archive.display(), e)),
        })
    }

    /// Unpack `archive` into a staging directory next to it, then move the
    /// top-level entries into `destination`. A failed extraction leaves
    /// nothing in `destination`, and an existing entry there is never
    /// overwritten.
    pub fn extract_staged(&self, archive: &Path, destination: &Path) -> Result<usize> {
        let staging = staging_dir(archive);
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }

        let count = match self.extract(archive, &staging) {
            Ok(count) => count,
            Err(e) => {
                discard_dir(&staging);
                return Err(e);
            }
        };

        let mut moves = Vec::new();
        for entry in fs::read_dir(&staging)? {
            let entry = entry?;
            let target = destination.join(entry.file_name());
            if target.exists() {
                discard_dir(&staging);
                return Err(StashError::Validation(format!(
                    "{} already exists, not unpacking {}",
                    target.display(),
                    archive.display()
                )));
            }
            moves.push((entry.path(), target));
        }

        fs::create_dir_all(destination)?;
        for (from, to) in moves {
            fs::rename(&from, &to)?;
        }
        fs::remove_dir(&staging)?;
        Ok(count)
    }
}

/// `<archive>.unpacking`
fn staging_dir(archive: &Path) -> PathBuf {
    let mut name = archive.as_os_str().to_os_string();
    name.push(".unpacking");
    PathBuf::from(name)
}

fn discard_dir(path: &Path) {
    if let Err(e) = fs::remove_dir_all(path) {
        warn!("Could not remove {}: {}", path.display(), e);
    }
}

fn unpack(file: File, destination: &Path) -> io::Result<usize> {
    let mut archive = tar::Archive::new(MultiGzDecoder::new(file));
    archive.set_preserve_mtime(true);

    // Directory mtimes are applied last; writing children bumps them.
    let mut directory_times: Vec<(PathBuf, FileTime)> = Vec::new();
    let mut count = 0;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let relative = entry.path()?.into_owned();
        if !is_contained(&relative) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("entry escapes destination: {}", relative.display()),
            ));
        }

        let target = destination.join(&relative);
        if entry.header().entry_type().is_dir() {
            fs::create_dir_all(&target)?;
            if let Ok(mtime) = entry.header().mtime() {
                directory_times.push((target, FileTime::from_unix_time(mtime as i64, 0)));
            }
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            entry.unpack(&target)?;
        }
        count += 1;
    }

    // Deepest first, so setting a child never disturbs an already-set parent.
    directory_times.sort_by_key(|(path, _)| std::cmp::Reverse(path.components().count()));
    for (path, mtime) in directory_times {
        filetime::set_file_mtime(&path, mtime)?;
    }

    Ok(count)
}

fn is_contained(path: &Path) -> bool {
    path.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// `<dir>/<name>.tar.gz -> <dir>/<name>`; `None` for other names.
pub fn unpacked_path(archive: &Path) -> Option<PathBuf> {
    archive
        .to_str()?
        .strip_suffix(ARCHIVE_SUFFIX)
        .filter(|rest| !rest.is_empty())
        .map(PathBuf::from)
}
