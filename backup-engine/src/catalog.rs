//! Read-only view of the backups present under the backup root.
//!
//! Everything here is derived from the `manifest.json` files on disk. A
//! directory without a readable, self-consistent manifest recorded under the
//! same id and category is not a backup and is skipped.

use crate::manifest::{BackupManifest, BackupSummary, MANIFEST_FILE};
use crate::models::BackupCategory;
use crate::storage::{join_key, StorageBackend};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Prefix of a backup directory that is still being written.
pub const PARTIAL_PREFIX: &str = ".partial-";

/// Prefix of a backup directory that is being removed.
pub const DELETING_PREFIX: &str = ".deleting-";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStats {
    pub count: usize,
    /// Sum of stored (compressed) sizes
    pub total_size: u64,
    pub total_uncompressed_size: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub by_category: BTreeMap<BackupCategory, usize>,
}

#[derive(Clone)]
pub struct BackupCatalog {
    storage: Arc<dyn StorageBackend>,
}

impl BackupCatalog {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Storage key of a published backup.
    pub fn backup_key(category: BackupCategory, backup_id: &str) -> String {
        join_key(&[category.as_str(), backup_id])
    }

    /// Summaries of every valid backup, newest first.
    pub async fn list(&self, category: Option<BackupCategory>) -> Result<Vec<BackupSummary>> {
        let mut manifests = match category {
            Some(category) => self.manifests(category).await?,
            None => {
                let mut all = Vec::new();
                for category in BackupCategory::ALL {
                    all.extend(self.manifests(category).await?);
                }
                all
            }
        };

        manifests.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.backup_id.cmp(&a.backup_id))
        });
        Ok(manifests.iter().map(BackupManifest::to_summary).collect())
    }

    /// Valid manifests of one category, oldest first by `(timestamp, id)`.
    pub async fn manifests(&self, category: BackupCategory) -> Result<Vec<BackupManifest>> {
        let mut manifests = Vec::new();

        for entry in self.storage.list(category.as_str()).await? {
            if !entry.is_dir() || entry.is_hidden() {
                continue;
            }
            if let Some(manifest) = self.load(category, &entry.name).await? {
                manifests.push(manifest);
            }
        }

        manifests.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.backup_id.cmp(&b.backup_id))
        });
        Ok(manifests)
    }

    /// Read and check the manifest of `category/backup_id`.
    ///
    /// Returns `None` for a directory that is not a valid backup.
    pub async fn load(
        &self,
        category: BackupCategory,
        backup_id: &str,
    ) -> Result<Option<BackupManifest>> {
        let key = join_key(&[category.as_str(), backup_id, MANIFEST_FILE]);
        let Some(data) = self.storage.read(&key).await? else {
            debug!(category = %category, backup_id = %backup_id, "Skipping directory without manifest");
            return Ok(None);
        };

        let manifest = match BackupManifest::from_json(&data) {
            Ok(manifest) => manifest,
            Err(e) => {
                debug!(category = %category, backup_id = %backup_id, "Skipping unreadable manifest: {}", e);
                return Ok(None);
            }
        };

        if let Err(e) = manifest.check_location(backup_id, category) {
            debug!(category = %category, backup_id = %backup_id, "Skipping invalid manifest: {}", e);
            return Ok(None);
        }

        Ok(Some(manifest))
    }

    /// Locate a backup by id in any category.
    pub async fn find(&self, backup_id: &str) -> Result<(BackupCategory, BackupManifest)> {
        if !is_listable_id(backup_id) {
            return Err(EngineError::NotFound(backup_id.to_string()));
        }

        for category in BackupCategory::ALL {
            if !self.storage.exists(&Self::backup_key(category, backup_id)).await? {
                continue;
            }
            if let Some(manifest) = self.load(category, backup_id).await? {
                return Ok((category, manifest));
            }
        }

        Err(EngineError::NotFound(backup_id.to_string()))
    }

    pub async fn manifest(&self, backup_id: &str) -> Result<BackupManifest> {
        Ok(self.find(backup_id).await?.1)
    }

    /// Newest valid backup of a category.
    pub async fn newest(&self, category: BackupCategory) -> Result<Option<BackupSummary>> {
        Ok(self
            .manifests(category)
            .await?
            .last()
            .map(BackupManifest::to_summary))
    }

    pub async fn stats(&self) -> Result<BackupStats> {
        let mut stats = BackupStats::default();

        for category in BackupCategory::ALL {
            let manifests = self.manifests(category).await?;
            if manifests.is_empty() {
                continue;
            }
            stats.by_category.insert(category, manifests.len());

            for manifest in &manifests {
                stats.count += 1;
                stats.total_size += manifest.summary.total_stored_size;
                stats.total_uncompressed_size += manifest.summary.total_size;
                stats.oldest = Some(match stats.oldest {
                    Some(oldest) => oldest.min(manifest.timestamp),
                    None => manifest.timestamp,
                });
                stats.newest = Some(match stats.newest {
                    Some(newest) => newest.max(manifest.timestamp),
                    None => manifest.timestamp,
                });
            }
        }

        Ok(stats)
    }

    /// Remove working directories left behind by an interrupted process.
    ///
    /// Only safe while no backup or deletion is running, i.e. at startup.
    pub async fn sweep_incomplete(&self) -> Result<usize> {
        let mut removed = 0;

        for category in BackupCategory::ALL {
            for entry in self.storage.list(category.as_str()).await? {
                if !entry.is_dir()
                    || !(entry.name.starts_with(PARTIAL_PREFIX)
                        || entry.name.starts_with(DELETING_PREFIX))
                {
                    continue;
                }

                let key = join_key(&[category.as_str(), &entry.name]);
                match self.storage.delete(&key).await {
                    Ok(()) => {
                        info!("Removed incomplete backup directory {}", key);
                        removed += 1;
                    }
                    Err(e) => warn!("Failed to remove incomplete backup directory {}: {}", key, e),
                }
            }
        }

        Ok(removed)
    }
}

/// Ids that can name a published backup directory.
fn is_listable_id(backup_id: &str) -> bool {
    !backup_id.is_empty()
        && !backup_id.starts_with('.')
        && backup_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
