//! Count-based retention per backup category.
//!
//! Each category keeps its newest N valid backups. `manual` and
//! `emergency` backups are only pruned when a caller asks for it
//! explicitly. Removal renames the backup to a hidden name first, so a
//! half-deleted backup is never visible under its real id.

use crate::catalog::{BackupCatalog, DELETING_PREFIX};
use crate::config::RetentionConfig;
use crate::models::BackupCategory;
use crate::storage::{join_key, StorageBackend};
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Lock shared by retention and restore for one backup root.
pub type RootLock = Arc<Mutex<()>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionReport {
    pub category: Option<BackupCategory>,
    pub kept: usize,
    pub removed: Vec<String>,
    /// Backups that should have been removed but could not be; retried next run
    pub failed: Vec<String>,
}

pub struct RetentionManager {
    storage: Arc<dyn StorageBackend>,
    catalog: BackupCatalog,
    limits: RetentionConfig,
    lock: RootLock,
}

impl RetentionManager {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        catalog: BackupCatalog,
        limits: RetentionConfig,
        lock: RootLock,
    ) -> Self {
        Self {
            storage,
            catalog,
            limits,
            lock,
        }
    }

    #[cfg(test)]
    pub(crate) fn root_lock(&self) -> RootLock {
        self.lock.clone()
    }

    pub fn limit(&self, category: BackupCategory) -> usize {
        self.limits.limit(category)
    }

    /// Delete the oldest backups of `category` beyond its limit.
    pub async fn enforce(
        &self,
        category: BackupCategory,
        include_exempt: bool,
    ) -> Result<RetentionReport> {
        let _guard = self.lock.lock().await;

        let manifests = self.catalog.manifests(category).await?;
        let mut report = RetentionReport {
            category: Some(category),
            kept: manifests.len(),
            ..Default::default()
        };

        if category.is_exempt_from_cleanup() && !include_exempt {
            debug!(category = %category, "Skipping retention for exempt category");
            return Ok(report);
        }

        let limit = self.limit(category);
        if manifests.len() <= limit {
            return Ok(report);
        }

        // Oldest first; everything before the newest `limit` goes.
        let excess = manifests.len() - limit;
        for manifest in manifests.iter().take(excess) {
            match self.remove(category, &manifest.backup_id).await {
                Ok(()) => report.removed.push(manifest.backup_id.clone()),
                Err(e) => {
                    warn!(category = %category, backup_id = %manifest.backup_id, "{}", e);
                    report.failed.push(manifest.backup_id.clone());
                }
            }
        }
        report.kept = manifests.len() - report.removed.len();

        info!(
            category = %category,
            "Retention kept {} backups, removed {}, failed {}",
            report.kept,
            report.removed.len(),
            report.failed.len()
        );

        Ok(report)
    }

    /// Enforce every category. Exempt categories are included only on request.
    pub async fn enforce_all(&self, include_exempt: bool) -> Result<Vec<RetentionReport>> {
        let mut reports = Vec::new();
        for category in BackupCategory::ALL {
            reports.push(self.enforce(category, include_exempt).await?);
        }
        Ok(reports)
    }

    /// Delete one backup by id regardless of retention limits.
    pub async fn delete(&self, backup_id: &str) -> Result<BackupCategory> {
        let _guard = self.lock.lock().await;

        let (category, _) = self.catalog.find(backup_id).await?;
        self.remove(category, backup_id).await?;
        info!(category = %category, backup_id = %backup_id, "Deleted backup");
        Ok(category)
    }

    async fn remove(&self, category: BackupCategory, backup_id: &str) -> Result<()> {
        let failure = |reason: String| EngineError::RetentionDeleteFailure {
            backup_id: backup_id.to_string(),
            reason,
        };

        let key = BackupCatalog::backup_key(category, backup_id);
        let hidden = join_key(&[
            category.as_str(),
            &format!("{}{}", DELETING_PREFIX, backup_id),
        ]);

        // A leftover from an earlier failed removal would block the rename.
        self.storage
            .delete(&hidden)
            .await
            .map_err(|e| failure(e.to_string()))?;
        self.storage
            .rename(&key, &hidden)
            .await
            .map_err(|e| failure(e.to_string()))?;

        if let Err(e) = self.storage.delete(&hidden).await {
            // Already invisible; the startup sweep removes it.
            warn!("Failed to remove {}: {}", hidden, e);
        }
        Ok(())
    }
}
