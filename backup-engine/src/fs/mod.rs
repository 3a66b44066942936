//! Filesystem helpers for reading the live-data root.

pub mod metadata;
pub mod walker;

use std::io;
use std::path::{Component, Path, PathBuf};

/// True when `path` is a directory and not a symlink to one.
pub async fn is_real_directory(path: &Path) -> bool {
    tokio::fs::symlink_metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

/// True when `path` is a symlink, whatever it points at.
pub async fn is_symlink(path: &Path) -> bool {
    tokio::fs::symlink_metadata(path)
        .await
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

/// Absolute form of `path` with symlinks and `..` resolved.
///
/// The path does not need to exist: its longest existing ancestor is
/// canonicalized and the remaining components are applied lexically.
pub fn resolve_path(path: &Path) -> io::Result<PathBuf> {
    let absolute = std::path::absolute(path)?;
    let mut existing = absolute.as_path();
    let mut rest = Vec::new();

    let mut resolved = loop {
        match std::fs::canonicalize(existing) {
            Ok(resolved) => break resolved,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let (Some(parent), Some(last)) = (existing.parent(), existing.components().next_back())
                else {
                    return Err(e);
                };
                rest.push(last.as_os_str().to_os_string());
                existing = parent;
            }
            Err(e) => return Err(e),
        }
    };

    for part in rest.iter().rev() {
        match Path::new(part).components().next() {
            Some(Component::ParentDir) => {
                resolved.pop();
            }
            Some(Component::Normal(name)) => resolved.push(name),
            _ => {}
        }
    }
    Ok(resolved)
}

/// True when `relative` is a non-empty `/`-separated path of plain names,
/// so joining it onto a root can never leave that root.
pub fn is_plain_relative(relative: &str) -> bool {
    !relative.is_empty()
        && relative.split('/').all(|segment| {
            let mut components = Path::new(segment).components();
            matches!(
                (components.next(), components.next()),
                (Some(Component::Normal(name)), None) if name == segment
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_path_handles_missing_tail_and_parent_dirs() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        let root = fs::canonicalize(temp_dir.path())?;
        fs::create_dir(root.join("live"))?;

        let tricky = temp_dir.path().join("missing/../live/staging");
        assert_eq!(resolve_path(&tricky)?, root.join("live/staging"));
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_resolve_path_follows_symlinked_roots() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        let root = fs::canonicalize(temp_dir.path())?;
        fs::create_dir(root.join("live"))?;
        std::os::unix::fs::symlink(root.join("live"), root.join("alias"))?;

        assert_eq!(resolve_path(&root.join("alias/restore-x"))?, root.join("live/restore-x"));
        Ok(())
    }

    #[test]
    fn test_plain_relative_paths() {
        assert!(is_plain_relative("colleges.json"));
        assert!(is_plain_relative("reports/2026/q1.json"));
        assert!(!is_plain_relative(""));
        assert!(!is_plain_relative("../etc"));
        assert!(!is_plain_relative("reports/../../etc"));
        assert!(!is_plain_relative("/etc/passwd"));
        assert!(!is_plain_relative("reports//q1.json"));
        assert!(!is_plain_relative("./reports"));
    }
}
