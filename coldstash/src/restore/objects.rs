//! Object lists for restore and the local-artifact skip rules.
//!
//! A list file is either a bare JSON array or the listing shape
//! `{"Contents": [{"Key": .., "Size": .., "StorageClass": ..}]}`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::archive::ARCHIVE_SUFFIX;
use crate::crypto::ENCRYPTED_SUFFIX;
use crate::fs::walker::{walk, WalkOptions};
use crate::split::{parse_part_name, REBUILD_SUFFIX};
use crate::store::{ObjectInfo, StorageClass};
use crate::{Result, StashError};

/// File name of the object list saved after a bucket listing.
pub const GENERATED_LIST_NAME: &str = "generated-restore-input.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ObjectRecord {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Size", default)]
    size: u64,
    #[serde(rename = "StorageClass", default)]
    storage_class: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Contents {
    #[serde(rename = "Contents")]
    contents: Vec<ObjectRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ObjectListFile {
    Wrapped(Contents),
    Bare(Vec<ObjectRecord>),
}

pub fn load_object_list(path: &Path) -> Result<Vec<ObjectInfo>> {
    let content = std::fs::read_to_string(path)?;
    let records = match serde_json::from_str(&content)? {
        ObjectListFile::Wrapped(c) => c.contents,
        ObjectListFile::Bare(records) => records,
    };
    Ok(records
        .into_iter()
        .map(|r| ObjectInfo {
            storage_class: StorageClass::parse_lenient(&r.storage_class),
            key: r.key,
            size: r.size,
        })
        .collect())
}

pub fn save_object_list(path: &Path, objects: &[ObjectInfo]) -> Result<()> {
    let contents = Contents {
        contents: objects
            .iter()
            .map(|o| ObjectRecord {
                key: o.key.clone(),
                size: o.size,
                storage_class: o.storage_class.as_str().to_string(),
            })
            .collect(),
    };
    std::fs::write(path, serde_json::to_string_pretty(&contents)?)?;
    Ok(())
}

/// Files below `dir` as `STANDARD` objects keyed by their slash path.
pub fn scan_directory(dir: &Path, prefix: &str) -> Result<Vec<ObjectInfo>> {
    if !dir.is_dir() {
        return Err(StashError::Validation(format!(
            "local directory does not exist: {}",
            dir.display()
        )));
    }
    Ok(walk(dir, &WalkOptions::files())?
        .into_iter()
        .map(|f| ObjectInfo {
            key: f.slash_path(),
            size: f.size,
            storage_class: StorageClass::Standard,
        })
        .filter(|o| o.key.starts_with(prefix))
        .collect())
}

/// `<destination>/<key>`. Keys that would leave `destination` are rejected.
pub fn local_path(destination: &Path, key: &str) -> Result<PathBuf> {
    let mut path = destination.to_path_buf();
    for segment in key.split('/').filter(|s| !s.is_empty()) {
        if segment == ".." || segment == "." {
            return Err(StashError::Validation(format!("unsafe object key: {}", key)));
        }
        path.push(segment);
    }
    if path == destination {
        return Err(StashError::Validation(format!("empty object key: {:?}", key)));
    }
    Ok(path)
}

/// Whether the fully processed form of the object at `local` already exists,
/// so the object need not be fetched or processed again.
pub fn final_artifact_exists(local: &Path) -> bool {
    let (Some(dir), Some(name)) = (local.parent(), file_name(local)) else {
        return false;
    };
    let plain = name.strip_suffix(ENCRYPTED_SUFFIX).unwrap_or(&name);

    if let Some(base) = group_base(plain) {
        return combined_or_unpacked(dir, base);
    }

    if let Some(stem) = plain.strip_suffix(ARCHIVE_SUFFIX) {
        if !stem.is_empty() && dir.join(stem).exists() {
            return true;
        }
        if plain == name {
            // A downloaded archive still has to be unpacked.
            return false;
        }
    }

    local.exists()
}

/// Why downloading the object at `local` can be skipped, if it can.
pub fn download_skip_reason(local: &Path) -> Option<String> {
    if local.exists() {
        return Some("already exists".to_string());
    }
    let dir = local.parent()?;
    let name = file_name(local)?;

    if let Some(plain) = name.strip_suffix(ENCRYPTED_SUFFIX) {
        if dir.join(plain).exists() {
            return Some(format!("decrypted version already exists: {}", plain));
        }
    }

    let plain = name.strip_suffix(ENCRYPTED_SUFFIX).unwrap_or(&name);
    let base = group_base(plain)?;
    if dir.join(base).exists() {
        return Some(format!("combined file already exists: {}", base));
    }
    None
}

/// Base name shared by a part or a rebuild instruction.
fn group_base(name: &str) -> Option<&str> {
    parse_part_name(name)
        .map(|(base, _)| base)
        .or_else(|| name.strip_suffix(REBUILD_SUFFIX).filter(|b| !b.is_empty()))
}

fn combined_or_unpacked(dir: &Path, base: &str) -> bool {
    let unpacked = base
        .strip_suffix(ARCHIVE_SUFFIX)
        .is_some_and(|stem| !stem.is_empty() && dir.join(stem).exists());
    unpacked || dir.join(base).exists()
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().to_string())
}
