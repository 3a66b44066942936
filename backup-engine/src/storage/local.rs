//! Local-disk storage backend.

use super::{validate_key, EntryKind, StorageBackend, StorageEntry};
use crate::compression::{ByteBufReader, ByteReader};
use crate::utils::errors::{EngineError, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufReader};

/// Stores backups under a directory on the local filesystem.
///
/// Files are written to a temporary sibling and renamed into place, so a
/// reader never sees a partially written file under its final name.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path for a key.
    pub fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        let mut path = self.root.clone();
        for segment in key.split('/').filter(|s| !s.is_empty()) {
            path.push(segment);
        }
        Ok(path)
    }

    fn temp_path(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        path.with_file_name(format!(".{}.tmp-{}", name, uuid::Uuid::new_v4().simple()))
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                EngineError::WriteFailure(format!("create {}: {}", parent.display(), e))
            })?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StorageBackend for LocalStorage {
    async fn create_dir(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        fs::create_dir_all(&path)
            .await
            .map_err(|e| EngineError::WriteFailure(format!("create {}: {}", path.display(), e)))
    }

    async fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        self.write_stream(key, Box::pin(data)).await.map(|_| ())
    }

    async fn write_stream(&self, key: &str, mut reader: ByteReader<'_>) -> Result<u64> {
        let path = self.path_for(key)?;
        Self::ensure_parent(&path).await?;

        let temp = Self::temp_path(&path);
        let result = async {
            let mut file = fs::File::create(&temp).await?;
            let written = tokio::io::copy(&mut reader, &mut file).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok::<u64, std::io::Error>(written)
        }
        .await;

        match result {
            Ok(written) => {
                fs::rename(&temp, &path).await.map_err(|e| {
                    EngineError::WriteFailure(format!("rename into {}: {}", path.display(), e))
                })?;
                Ok(written)
            }
            Err(e) => {
                let _ = fs::remove_file(&temp).await;
                Err(EngineError::WriteFailure(format!("write {}: {}", path.display(), e)))
            }
        }
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn reader(&self, key: &str) -> Result<Option<ByteBufReader<'static>>> {
        let path = self.path_for(key)?;
        match fs::File::open(&path).await {
            Ok(file) => Ok(Some(Box::pin(BufReader::new(file)))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StorageEntry>> {
        let path = self.path_for(prefix)?;
        let mut entries = match fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut result = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let kind = if file_type.is_dir() {
                EntryKind::Directory
            } else if file_type.is_file() {
                EntryKind::File
            } else {
                continue;
            };
            result.push(StorageEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                kind,
            });
        }
        result.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(result)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from_path = self.path_for(from)?;
        let to_path = self.path_for(to)?;
        if fs::try_exists(&to_path).await? {
            return Err(EngineError::WriteFailure(format!(
                "rename target already exists: {}",
                to_path.display()
            )));
        }
        Self::ensure_parent(&to_path).await?;
        fs::rename(&from_path, &to_path).await.map_err(|e| {
            EngineError::WriteFailure(format!(
                "rename {} -> {}: {}",
                from_path.display(),
                to_path.display(),
                e
            ))
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        let metadata = match fs::symlink_metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let result = if metadata.is_dir() {
            fs::remove_dir_all(&path).await
        } else {
            fs::remove_file(&path).await
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
