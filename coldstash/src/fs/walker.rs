//! Directory traversal for archiving, reassembly and local scans.

use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Report directories as well as files
    pub include_dirs: bool,

    /// Keep only files whose name ends with this suffix
    pub suffix: Option<String>,
}

impl WalkOptions {
    pub fn files() -> Self {
        Self::default()
    }

    pub fn files_and_dirs() -> Self {
        Self {
            include_dirs: true,
            ..Self::default()
        }
    }

    pub fn with_suffix(suffix: &str) -> Self {
        Self {
            suffix: Some(suffix.to_string()),
            ..Self::default()
        }
    }
}

/// Information about an entry discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the entry
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// File size in bytes (0 for directories)
    pub size: u64,

    pub is_dir: bool,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Self> {
        let metadata = entry.metadata()?;
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();

        Ok(Self {
            path,
            relative_path,
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            is_dir: metadata.is_dir(),
        })
    }

    /// Relative path with `/` separators.
    pub fn slash_path(&self) -> String {
        slash_path(&self.relative_path)
    }
}

/// Walk `root` in a stable, name-sorted order.
///
/// `root` itself is reported when it is a file, or when it is a directory and
/// `include_dirs` is set.
pub fn walk(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    let mut entries = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .sort_by_file_name();

    for entry in walker {
        let entry = entry?;

        if entry.file_type().is_dir() {
            if options.include_dirs {
                entries.push(FileInfo::from_entry(&entry, root)?);
            }
            continue;
        }

        if let Some(suffix) = &options.suffix {
            if !entry.file_name().to_string_lossy().ends_with(suffix.as_str()) {
                continue;
            }
        }

        entries.push(FileInfo::from_entry(&entry, root)?);
    }

    Ok(entries)
}

/// Calculate total size of all files below `root`
pub fn calculate_total_size(root: &Path) -> std::io::Result<u64> {
    Ok(walk(root, &WalkOptions::files())?
        .iter()
        .map(|f| f.size)
        .sum())
}

/// Join path components with `/`, independent of the host separator.
pub fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_walk_empty_directory() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let files = walk(temp_dir.path(), &WalkOptions::files())?;
        assert_eq!(files.len(), 0);
        Ok(())
    }

    #[test]
    fn test_walk_with_subdirectories() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join("subdir"))?;
        fs::write(temp_dir.path().join("file1.txt"), b"content1")?;
        fs::write(temp_dir.path().join("subdir/file2.txt"), b"content2")?;

        let files = walk(temp_dir.path(), &WalkOptions::files())?;
        let names: Vec<String> = files.iter().map(|f| f.slash_path()).collect();
        assert_eq!(names, vec!["file1.txt", "subdir/file2.txt"]);

        let all = walk(temp_dir.path(), &WalkOptions::files_and_dirs())?;
        assert_eq!(all.len(), 4);
        assert!(all[0].is_dir);
        assert_eq!(all[0].slash_path(), "");

        Ok(())
    }

    #[test]
    fn test_suffix_filter() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("a.tar.gz"), b"x")?;
        fs::write(temp_dir.path().join("b.txt"), b"y")?;

        let files = walk(temp_dir.path(), &WalkOptions::with_suffix(".tar.gz"))?;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].slash_path(), "a.tar.gz");
        Ok(())
    }

    #[test]
    fn test_single_file_root() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let file = temp_dir.path().join("only.bin");
        fs::write(&file, b"12345")?;

        let files = walk(&file, &WalkOptions::files())?;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].size, 5);
        Ok(())
    }

    #[test]
    fn test_calculate_total_size() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::write(temp_dir.path().join("file1.txt"), b"12345")?;
        fs::write(temp_dir.path().join("file2.txt"), b"1234567")?;

        let total = calculate_total_size(temp_dir.path())?;
        assert_eq!(total, 12);

        Ok(())
    }
}
