//! Directory traversal for protected directories.
//!
//! Produces a deterministic, sorted list of regular files with paths relative
//! to the walked directory, which is what manifest entries and directory
//! aggregates are keyed on. Symbolic links are never followed nor recorded.

use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Information about a file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Path relative to the walk root, `/`-separated
    pub relative_path: String,
}

impl FileInfo {
    /// `None` for anything that is not a regular file, symlinks included.
    fn from_entry(entry: &DirEntry, root: &Path) -> Option<Self> {
        if entry.path_is_symlink() || !entry.file_type().is_file() {
            return None;
        }

        let path = entry.path().to_path_buf();
        let relative = path.strip_prefix(root).unwrap_or(&path);
        let relative_path = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join("/");

        Some(Self {
            path,
            relative_path,
        })
    }
}

/// Walk a directory tree and collect all regular files, sorted by relative path
///
/// # Example
/// ```no_run
/// use backup_engine::fs::walker::walk_directory;
/// use std::path::Path;
///
/// let files = walk_directory(Path::new("/srv/data/reports")).unwrap();
/// println!("Found {} files", files.len());
/// ```
pub fn walk_directory(root: &Path) -> std::io::Result<Vec<FileInfo>> {
    let mut files = Vec::new();

    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        if let Some(file_info) = FileInfo::from_entry(&entry, root) {
            files.push(file_info);
        }
    }

    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(files)
}
