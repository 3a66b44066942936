//! Storage backends for the backup root.
//!
//! Manifest building, validation, retention and the catalog only talk to a
//! [`StorageBackend`]. Keys are `/`-separated paths relative to the backup
//! root (`daily/20260101T000000000Z-1a2b3c4d/manifest.json`).

pub mod local;

pub use local::LocalStorage;

use crate::compression::{ByteBufReader, ByteReader};
use crate::utils::errors::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// An immediate child returned by [`StorageBackend::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEntry {
    pub name: String,
    pub kind: EntryKind,
}

impl StorageEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Dot-prefixed entries are work in progress and never part of the catalog.
    pub fn is_hidden(&self) -> bool {
        self.name.starts_with('.')
    }
}

#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
    async fn create_dir(&self, key: &str) -> Result<()>;

    async fn write(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Drain `reader` into `key`, returning the number of bytes stored.
    async fn write_stream(&self, key: &str, reader: ByteReader<'_>) -> Result<u64>;

    /// `None` if the key does not exist.
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// `None` if the key does not exist.
    async fn reader(&self, key: &str) -> Result<Option<ByteBufReader<'static>>>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Immediate children of `prefix`. A missing prefix lists as empty.
    async fn list(&self, prefix: &str) -> Result<Vec<StorageEntry>>;

    /// Rename a file or directory. The destination must not exist.
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Remove a file or a whole directory tree. Missing keys are not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Join key segments with `/`, skipping empty ones.
pub fn join_key(parts: &[&str]) -> String {
    parts
        .iter()
        .flat_map(|p| p.split('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Reject keys that are absolute or climb out of the root.
pub fn validate_key(key: &str) -> Result<()> {
    if key.starts_with('/') || key.contains('\\') {
        return Err(EngineError::InvalidInput(format!(
            "storage key must be relative: {}",
            key
        )));
    }
    if key.split('/').any(|segment| segment == ".." || segment == ".") {
        return Err(EngineError::InvalidInput(format!(
            "storage key must not contain relative segments: {}",
            key
        )));
    }
    Ok(())
}
