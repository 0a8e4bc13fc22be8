//! Fixed-size chunking and lossless reassembly.
//!
//! A file larger than the chunk size becomes `<file>-part00001`,
//! `<file>-part00002`, ... plus a `<file>-HowToBuild.txt` shell recipe for
//! manual reassembly. Concatenating the parts in index order reproduces the
//! original bytes exactly.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::fs::walker::{walk, WalkOptions};
use crate::fs::{remove_if_exists, temp_sibling};
use crate::transfer::progress::format_bytes;
use crate::{Result, StashError};

pub const PART_MARKER: &str = "-part";
pub const REBUILD_SUFFIX: &str = "-HowToBuild.txt";
const INDEX_DIGITS: usize = 5;

/// `<path>-partNNNNN`
pub fn part_path(path: &Path, index: u32) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!("{}{:05}", PART_MARKER, index));
    PathBuf::from(name)
}

/// `<path>-HowToBuild.txt`
pub fn rebuild_instruction_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(REBUILD_SUFFIX);
    PathBuf::from(name)
}

/// Split a part file name into its base name and 1-based index.
pub fn parse_part_name(name: &str) -> Option<(&str, u32)> {
    let marker = name.rfind(PART_MARKER)?;
    let (base, rest) = name.split_at(marker);
    let digits = &rest[PART_MARKER.len()..];
    if base.is_empty() || digits.len() != INDEX_DIGITS || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().map(|index| (base, index))
}

/// Split `path` into parts of `chunk_size` bytes.
///
/// Files no larger than `chunk_size` are returned unchanged as a single
/// element. Otherwise the parts are returned in index order and the original
/// is left in place for the caller to remove.
pub fn split(path: &Path, chunk_size: u64) -> Result<Vec<PathBuf>> {
    if chunk_size == 0 {
        return Err(StashError::Validation("chunk size must be greater than zero".into()));
    }

    let size = fs::metadata(path)?.len();
    if size <= chunk_size {
        return Ok(vec![path.to_path_buf()]);
    }

    let count = size.div_ceil(chunk_size);
    info!(
        "Splitting {} ({}) into {} parts of {}",
        path.display(),
        format_bytes(size),
        count,
        format_bytes(chunk_size)
    );

    let mut reader = BufReader::new(File::open(path)?);
    let mut parts = Vec::with_capacity(count as usize);

    for index in 1..=count {
        let part = part_path(path, index as u32);
        let staging = temp_sibling(&part);
        let mut writer = BufWriter::new(File::create(&staging)?);
        let written = io::copy(&mut (&mut reader).take(chunk_size), &mut writer)?;
        writer.flush()?;
        drop(writer);

        if written == 0 {
            remove_if_exists(&staging)?;
            return Err(StashError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} shrank while splitting", path.display()),
            )));
        }
        fs::rename(&staging, &part)?;
        parts.push(part);
    }

    Ok(parts)
}

/// Write the manual reassembly recipe next to `original` and return its path.
pub fn write_rebuild_instruction(original: &Path, parts: &[PathBuf]) -> Result<PathBuf> {
    let target = original
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| StashError::Validation(format!("{} has no file name", original.display())))?;
    let names = parts
        .iter()
        .filter_map(|p| p.file_name())
        .map(|n| n.to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join(" ");

    let instruction = rebuild_instruction_path(original);
    let content = format!(
        "cat {names} > {target} && rm -f {names} {target}{suffix}\n",
        names = names,
        target = target,
        suffix = REBUILD_SUFFIX
    );
    fs::write(&instruction, content)?;
    Ok(instruction)
}

/// Outcome of [`combine`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CombineReport {
    pub combined: usize,
    pub skipped: usize,
}

/// Reassemble every part group below `directory`.
///
/// Groups are keyed by directory and base name. Only groups with at least two
/// members whose indices run 1..=N without gaps are combined. When a rebuild
/// instruction sits next to the group, N must also match the number of parts
/// it lists. The parts and the instruction are removed afterwards. A directory
/// with nothing to combine is left untouched.
pub fn combine(directory: &Path) -> Result<CombineReport> {
    let mut groups: BTreeMap<PathBuf, Vec<(u32, PathBuf)>> = BTreeMap::new();

    for file in walk(directory, &WalkOptions::files())? {
        let Some(name) = file.path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some((base, index)) = parse_part_name(name) {
            let target = file.path.with_file_name(base);
            groups.entry(target).or_default().push((index, file.path.clone()));
        }
    }

    let mut report = CombineReport::default();
    for (target, mut parts) in groups {
        if parts.len() < 2 {
            continue;
        }
        parts.sort_by_key(|(index, _)| *index);

        let contiguous = parts
            .iter()
            .enumerate()
            .all(|(i, (index, _))| *index as usize == i + 1);
        if !contiguous {
            warn!(
                "Parts of {} are not numbered 1..={}, leaving them alone",
                target.display(),
                parts.len()
            );
            report.skipped += 1;
            continue;
        }

        if let Some(expected) = listed_part_count(&rebuild_instruction_path(&target)) {
            if expected != parts.len() {
                warn!(
                    "{} lists {} parts but {} are present, leaving them alone",
                    rebuild_instruction_path(&target).display(),
                    expected,
                    parts.len()
                );
                report.skipped += 1;
                continue;
            }
        }

        let paths: Vec<PathBuf> = parts.into_iter().map(|(_, path)| path).collect();
        combine_group(&target, &paths)?;
        report.combined += 1;
    }

    Ok(report)
}

/// Number of part names on the `cat` side of a rebuild instruction.
fn listed_part_count(instruction: &Path) -> Option<usize> {
    let content = fs::read_to_string(instruction).ok()?;
    let (command, _) = content.split_once(" > ")?;
    let mut words = command.split_whitespace();
    if words.next()? != "cat" {
        return None;
    }
    Some(words.filter(|w| parse_part_name(w).is_some()).count())
}

fn combine_group(target: &Path, parts: &[PathBuf]) -> Result<()> {
    let total: u64 = parts
        .iter()
        .filter_map(|p| fs::metadata(p).ok())
        .map(|m| m.len())
        .sum();
    info!(
        "Combining {} parts into {} ({})",
        parts.len(),
        target.display(),
        format_bytes(total)
    );

    let staging = temp_sibling(target);
    let mut writer = BufWriter::new(File::create(&staging)?);
    for part in parts {
        io::copy(&mut File::open(part)?, &mut writer)?;
    }
    writer.flush()?;
    drop(writer);
    fs::rename(&staging, target)?;

    for part in parts {
        remove_if_exists(part)?;
    }
    remove_if_exists(&rebuild_instruction_path(target))?;
    Ok(())
}
