//! Backup manifests.
//!
//! A manifest is written once as `manifest.json` inside every published
//! backup and never mutated. It describes each stored file (uncompressed
//! size and checksum, plus the size and checksum of the stored bytes), each
//! protected directory's aggregate and the items that were absent at backup
//! time. Everything the catalog and the validator know about a backup comes
//! from this file.

use crate::checksum;
use crate::compression::CompressionAlgorithm;
use crate::fs::metadata::FileMetadata;
use crate::fs::walker::walk_directory;
use crate::fs::{is_plain_relative, is_real_directory, is_symlink};
use crate::models::{BackupCategory, ItemKind, ProtectedItem};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

/// File name of the manifest inside a backup directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Current manifest format version.
pub const MANIFEST_VERSION: u32 = 1;

/// One stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    /// Uncompressed size in bytes
    pub size: u64,

    /// Size of the stored (compressed) file
    pub stored_size: u64,

    /// SHA-256 of the uncompressed content
    pub checksum: String,

    /// SHA-256 of the stored bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored_checksum: Option<String>,

    /// Last modified time of the source
    pub modified: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

impl ManifestEntry {
    pub fn new(metadata: &FileMetadata, size: u64, checksum: String) -> Self {
        Self {
            size,
            stored_size: 0,
            checksum,
            stored_checksum: None,
            modified: metadata.modified,
            mode: metadata.mode,
        }
    }

    pub fn with_stored(mut self, stored_size: u64, stored_checksum: String) -> Self {
        self.stored_size = stored_size;
        self.stored_checksum = Some(stored_checksum);
        self
    }
}

/// Aggregate over the files of one protected directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    pub files: usize,
    pub size: u64,
    pub checksum: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestSummary {
    pub total_files: usize,
    pub total_directories: usize,
    pub total_size: u64,
    pub total_stored_size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    pub backup_id: String,
    pub timestamp: DateTime<Utc>,
    pub category: BackupCategory,
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default = "default_compression")]
    pub compression: CompressionAlgorithm,
    pub entries: BTreeMap<String, ManifestEntry>,
    #[serde(default)]
    pub directories: BTreeMap<String, DirectoryEntry>,
    #[serde(default)]
    pub absent: Vec<String>,
    pub summary: ManifestSummary,
}

fn default_compression() -> CompressionAlgorithm {
    CompressionAlgorithm::Zstd
}

/// Listing view of a backup, derived from its manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSummary {
    pub backup_id: String,
    pub category: BackupCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub file_count: usize,
    pub directory_count: usize,
    pub total_size: u64,
    pub stored_size: u64,
    pub absent: Vec<String>,
}

impl BackupManifest {
    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn to_json_pretty(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn to_summary(&self) -> BackupSummary {
        BackupSummary {
            backup_id: self.backup_id.clone(),
            category: self.category,
            label: self.label.clone(),
            timestamp: self.timestamp,
            file_count: self.summary.total_files,
            directory_count: self.summary.total_directories,
            total_size: self.summary.total_size,
            stored_size: self.summary.total_stored_size,
            absent: self.absent.clone(),
        }
    }

    /// Entries belonging to the protected directory `name`, keyed relative to it.
    pub fn directory_files<'a>(
        &'a self,
        name: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a ManifestEntry)> + 'a {
        let prefix = format!("{}/", name);
        self.entries
            .iter()
            .filter_map(move |(path, entry)| {
                path.strip_prefix(prefix.as_str())
                    .map(|relative| (relative, entry))
            })
    }

    /// Lists every way the manifest disagrees with itself.
    ///
    /// Empty when summary counters and directory aggregates recompute from
    /// the entries and the format version is understood.
    pub fn consistency_problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.version != MANIFEST_VERSION {
            problems.push(format!("unsupported version {}", self.version));
        }

        let expected = summarize(&self.entries, &self.directories);
        if expected != self.summary {
            problems.push("summary counters do not match entries".to_string());
        }

        let names = self
            .directories
            .keys()
            .chain(self.entries.keys())
            .chain(self.absent.iter());
        for name in names {
            if !is_plain_relative(name) {
                problems.push(format!("path {} leaves the backup root", name));
            }
        }

        for (name, directory) in &self.directories {
            let recomputed = directory_entry(self.directory_files(name));
            if &recomputed != directory {
                problems.push(format!("directory aggregate for {}", name));
            }
        }

        problems
    }

    pub fn is_self_consistent(&self) -> bool {
        self.consistency_problems().is_empty()
    }

    /// Self-consistent and recorded under the id and category it was found at.
    pub fn check_location(&self, backup_id: &str, category: BackupCategory) -> Result<()> {
        if self.backup_id != backup_id || self.category != category {
            return Err(EngineError::ValidationMismatch(format!(
                "manifest describes {}/{} but was read from {}/{}",
                self.category, self.backup_id, category, backup_id
            )));
        }

        let problems = self.consistency_problems();
        if !problems.is_empty() {
            return Err(EngineError::ValidationMismatch(problems.join("; ")));
        }

        Ok(())
    }
}

fn directory_entry<'a, I>(files: I) -> DirectoryEntry
where
    I: IntoIterator<Item = (&'a str, &'a ManifestEntry)>,
{
    let mut count = 0;
    let mut size = 0;
    let mut pairs = Vec::new();

    for (relative, entry) in files {
        count += 1;
        size += entry.size;
        pairs.push((relative, entry.checksum.as_str()));
    }

    DirectoryEntry {
        files: count,
        size,
        checksum: checksum::aggregate(pairs),
    }
}

fn summarize(
    entries: &BTreeMap<String, ManifestEntry>,
    directories: &BTreeMap<String, DirectoryEntry>,
) -> ManifestSummary {
    ManifestSummary {
        total_files: entries.len(),
        total_directories: directories.len(),
        total_size: entries.values().map(|e| e.size).sum(),
        total_stored_size: entries.values().map(|e| e.stored_size).sum(),
    }
}

/// Accumulates manifest entries while a backup is being written.
///
/// ```
/// use backup_engine::compression::CompressionAlgorithm;
/// use backup_engine::manifest::ManifestBuilder;
/// use backup_engine::models::BackupCategory;
///
/// let mut builder = ManifestBuilder::new(
///     "20260101T000000000Z-0a1b2c3d",
///     BackupCategory::Manual,
///     None,
///     CompressionAlgorithm::Zstd,
/// );
/// builder.record_absent("users.json");
/// let manifest = builder.finish();
/// assert_eq!(manifest.absent, vec!["users.json"]);
/// assert!(manifest.is_self_consistent());
/// ```
#[derive(Debug)]
pub struct ManifestBuilder {
    backup_id: String,
    timestamp: DateTime<Utc>,
    category: BackupCategory,
    label: Option<String>,
    compression: CompressionAlgorithm,
    entries: BTreeMap<String, ManifestEntry>,
    directory_names: Vec<String>,
    absent: Vec<String>,
}

impl ManifestBuilder {
    pub fn new(
        backup_id: impl Into<String>,
        category: BackupCategory,
        label: Option<String>,
        compression: CompressionAlgorithm,
    ) -> Self {
        Self {
            backup_id: backup_id.into(),
            timestamp: Utc::now(),
            category,
            label,
            compression,
            entries: BTreeMap::new(),
            directory_names: Vec::new(),
            absent: Vec::new(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn backup_id(&self) -> &str {
        &self.backup_id
    }

    /// Record one stored file under its path relative to the live root.
    pub fn record_file(&mut self, path: impl Into<String>, entry: ManifestEntry) {
        self.entries.insert(path.into(), entry);
    }

    /// Mark a protected directory as present. Its aggregate is computed from
    /// the files recorded beneath it when the builder finishes.
    pub fn record_directory(&mut self, name: impl Into<String>) {
        self.directory_names.push(name.into());
    }

    pub fn record_absent(&mut self, name: impl Into<String>) {
        self.absent.push(name.into());
    }

    pub fn finish(self) -> BackupManifest {
        let mut directories = BTreeMap::new();
        for name in &self.directory_names {
            let prefix = format!("{}/", name);
            let files = self.entries.iter().filter_map(|(path, entry)| {
                path.strip_prefix(prefix.as_str())
                    .map(|relative| (relative, entry))
            });
            directories.insert(name.clone(), directory_entry(files));
        }

        let mut absent = self.absent;
        absent.sort();
        absent.dedup();

        let summary = summarize(&self.entries, &directories);

        BackupManifest {
            backup_id: self.backup_id,
            timestamp: self.timestamp,
            category: self.category,
            version: MANIFEST_VERSION,
            label: self.label,
            compression: self.compression,
            entries: self.entries,
            directories,
            absent,
            summary,
        }
    }

    /// Capture the live state of `items` without storing anything.
    ///
    /// Used for dry runs and for comparing live data against a backup. The
    /// stored sizes of the resulting entries are zero.
    pub async fn build(
        mut self,
        items: &[ProtectedItem],
        live_root: &Path,
    ) -> Result<BackupManifest> {
        for item in items {
            let source = item.source_path(live_root);
            match item.kind {
                ItemKind::File => match capture_file(&source).await? {
                    Some(entry) => self.record_file(item.key(), entry),
                    None => {
                        warn!(item = %item.name, "{}", EngineError::SourceUnavailable(item.name.clone()));
                        self.record_absent(item.key());
                    }
                },
                ItemKind::Directory => {
                    if !is_real_directory(&source).await {
                        warn!(item = %item.name, "{}", EngineError::SourceUnavailable(item.name.clone()));
                        self.record_absent(item.key());
                        continue;
                    }

                    let walk_root = source.clone();
                    let files = tokio::task::spawn_blocking(move || walk_directory(&walk_root))
                    .await
                    .map_err(|e| EngineError::SourceUnavailable(e.to_string()))??;

                    self.record_directory(item.key());
                    for file in files {
                        match capture_file(&file.path).await? {
                            Some(entry) => self.record_file(
                                format!("{}/{}", item.key(), file.relative_path),
                                entry,
                            ),
                            None => debug!(path = %file.path.display(), "File vanished during walk"),
                        }
                    }
                }
            }
        }

        Ok(self.finish())
    }
}

/// Hash one live file. `None` when it does not exist, is a symlink or is not a file.
async fn capture_file(path: &Path) -> Result<Option<ManifestEntry>> {
    if is_symlink(path).await {
        return Ok(None);
    }
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(EngineError::SourceUnavailable(format!("{}: {}", path.display(), e))),
    };

    let std_meta = file.metadata().await?;
    if !std_meta.is_file() {
        return Ok(None);
    }
    let metadata = FileMetadata::from_std(&std_meta);

    let (checksum, size) = checksum::digest_reader(file).await?;
    Ok(Some(ManifestEntry::new(&metadata, size, checksum)))
}
