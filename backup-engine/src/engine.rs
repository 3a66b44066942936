//! Backup engine - The single entry point used by the CLI, the scheduler and
//! the HTTP control surface.
//!
//! Wires the storage backend, compressor, writer, validator, retention and
//! restore components together from a [`Config`] and enforces the
//! concurrency rules: one backup run per category, restore and retention
//! serialized per backup root, wall-clock budgets for backup and restore.

use crate::catalog::{BackupCatalog, BackupStats};
use crate::compression::build_compressor;
use crate::config::Config;
use crate::integrity::{IntegrityValidator, Location, ValidationReport};
use crate::manifest::{BackupManifest, BackupSummary, ManifestBuilder};
use crate::models::BackupCategory;
use crate::restore::{remove_staging, RestoreEngine, StagingHandle};
use crate::retention::{RetentionManager, RetentionReport};
use crate::storage::{LocalStorage, StorageBackend};
use crate::utils::errors::{EngineError, Result};
use crate::writer::{BackupResult, BackupWriter};
use dashmap::DashMap;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct BackupEngine {
    config: Config,
    catalog: BackupCatalog,
    validator: Arc<IntegrityValidator>,
    writer: BackupWriter,
    retention: Arc<RetentionManager>,
    restore: RestoreEngine,
    /// Categories with a backup run in progress
    running: Arc<Mutex<HashSet<BackupCategory>>>,
    /// Restores waiting in staging, by handle id
    staged: DashMap<String, StagingHandle>,
    backup_timeout: Duration,
    restore_timeout: Duration,
    shutdown: CancellationToken,
}

impl BackupEngine {
    /// Open the engine on the local filesystem.
    ///
    /// Creates the backup root if needed and removes working directories
    /// and staging left behind by a previous process.
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.engine.backup_root).await?;

        let storage = Arc::new(LocalStorage::new(&config.engine.backup_root));
        let engine = Self::with_storage(config, storage)?;

        let swept = engine.catalog.sweep_incomplete().await?;
        if swept > 0 {
            info!("Removed {} incomplete backup directories", swept);
        }
        engine.sweep_staging().await;

        Ok(engine)
    }

    /// Build the engine on any storage backend.
    pub fn with_storage(config: Config, storage: Arc<dyn StorageBackend>) -> Result<Self> {
        config.validate()?;

        let lock = Arc::new(Mutex::new(()));
        let catalog = BackupCatalog::new(storage.clone());
        let validator = Arc::new(IntegrityValidator::new(storage.clone()));
        let retention = Arc::new(RetentionManager::new(
            storage.clone(),
            catalog.clone(),
            config.retention.clone(),
            lock.clone(),
        ));
        let writer = BackupWriter::new(
            storage.clone(),
            build_compressor(config.compression.algorithm, config.compression.level),
            &config.engine.live_root,
            config.protected.clone(),
        )
        .with_validator(validator.clone())
        .with_retention(retention.clone());
        let restore = RestoreEngine::new(
            storage,
            catalog.clone(),
            validator.clone(),
            &config.engine.live_root,
            config.staging_root(),
            lock,
        );

        Ok(Self {
            backup_timeout: config.limits.backup_timeout(),
            restore_timeout: config.limits.restore_timeout(),
            config,
            catalog,
            validator,
            writer,
            retention,
            restore,
            running: Arc::new(Mutex::new(HashSet::new())),
            staged: DashMap::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Override the configured wall-clock budgets.
    pub fn with_timeouts(mut self, backup: Duration, restore: Duration) -> Self {
        self.backup_timeout = backup;
        self.restore_timeout = restore;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Cancelled on shutdown; running backups stop between items.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Create, validate and publish a backup of every protected item.
    pub async fn create_backup(
        &self,
        category: BackupCategory,
        label: Option<&str>,
    ) -> Result<BackupSummary> {
        Ok(self.run_backup(category, label).await?.manifest.to_summary())
    }

    /// Like [`create_backup`](Self::create_backup) but returns the full result.
    pub async fn run_backup(
        &self,
        category: BackupCategory,
        label: Option<&str>,
    ) -> Result<BackupResult> {
        // Only one run per category
        {
            let mut running = self.running.lock().await;
            if running.contains(&category) {
                return Err(EngineError::AlreadyRunning(category.to_string()));
            }
            running.insert(category);
        }

        let result = self.run_backup_inner(category, label).await;

        // Always remove from running set
        {
            let mut running = self.running.lock().await;
            running.remove(&category);
        }

        result
    }

    async fn run_backup_inner(
        &self,
        category: BackupCategory,
        label: Option<&str>,
    ) -> Result<BackupResult> {
        let pending = self.writer.prepare(category, label).await?;

        match tokio::time::timeout(
            self.backup_timeout,
            self.writer.execute(&pending, &self.shutdown),
        )
        .await
        {
            Ok(result) => {
                let mut result = result?;
                // Retention runs after publish and outside the budget
                result.retention = self.writer.apply_retention(category).await;
                Ok(result)
            }
            Err(_) => {
                warn!(
                    category = %category,
                    backup_id = %pending.backup_id,
                    "Backup exceeded {:?}, discarding",
                    self.backup_timeout
                );
                self.writer.discard(&pending).await;
                Err(EngineError::Timeout(self.backup_timeout))
            }
        }
    }

    /// Valid backups, newest first.
    pub async fn list_backups(&self, category: Option<BackupCategory>) -> Result<Vec<BackupSummary>> {
        self.catalog.list(category).await
    }

    pub async fn get_backup_stats(&self) -> Result<BackupStats> {
        self.catalog.stats().await
    }

    pub async fn get_backup(&self, backup_id: &str) -> Result<BackupManifest> {
        self.catalog.manifest(backup_id).await
    }

    pub async fn newest_backup(&self, category: BackupCategory) -> Result<Option<BackupSummary>> {
        self.catalog.newest(category).await
    }

    /// Re-check every stored item of a backup against its manifest.
    pub async fn verify_backup(&self, backup_id: &str) -> Result<ValidationReport> {
        let (category, manifest) = self.catalog.find(backup_id).await?;
        let prefix = BackupCatalog::backup_key(category, backup_id);
        self.validator
            .validate(Location::Stored(&prefix), &manifest)
            .await
    }

    /// Restore into a fresh staging directory. The live root is not touched.
    pub async fn restore_backup(&self, backup_id: &str) -> Result<StagingHandle> {
        self.restore_backup_to(backup_id, None).await
    }

    /// Restore under `staging_root` instead of the configured staging root.
    ///
    /// Staging under the configured root is removed when the engine is next
    /// opened; a custom root is left alone.
    pub async fn restore_backup_to(
        &self,
        backup_id: &str,
        staging_root: Option<&Path>,
    ) -> Result<StagingHandle> {
        let staging = self.restore.staging_path_for(backup_id, staging_root);

        let manifest = match tokio::time::timeout(
            self.restore_timeout,
            self.restore.restore_into(backup_id, &staging),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                warn!(backup_id = %backup_id, "Restore exceeded {:?}, discarding staging", self.restore_timeout);
                remove_staging(&staging).await;
                return Err(EngineError::Timeout(self.restore_timeout));
            }
        };

        let handle = StagingHandle {
            id: uuid::Uuid::new_v4().to_string(),
            backup_id: backup_id.to_string(),
            staging_path: staging,
            created_at: chrono::Utc::now(),
            manifest,
        };
        self.staged.insert(handle.id.clone(), handle.clone());
        Ok(handle)
    }

    /// Restores waiting in staging.
    pub fn pending_restores(&self) -> Vec<StagingHandle> {
        let mut handles: Vec<_> = self.staged.iter().map(|h| h.value().clone()).collect();
        handles.sort_by_key(|h| h.created_at);
        handles
    }

    /// Move a staged restore into the live root. Returns the promoted item names.
    pub async fn promote_restore(&self, handle_id: &str) -> Result<Vec<String>> {
        let handle = self
            .staged
            .get(handle_id)
            .map(|h| h.value().clone())
            .ok_or_else(|| EngineError::NotFound(format!("restore {}", handle_id)))?;

        let promoted = self.restore.promote(&handle).await?;
        self.staged.remove(handle_id);
        Ok(promoted)
    }

    /// Drop a staged restore without promoting it.
    pub async fn discard_restore(&self, handle_id: &str) -> Result<()> {
        let (_, handle) = self
            .staged
            .remove(handle_id)
            .ok_or_else(|| EngineError::NotFound(format!("restore {}", handle_id)))?;
        self.restore.discard(&handle).await;
        Ok(())
    }

    pub async fn delete_backup(&self, backup_id: &str) -> Result<()> {
        self.retention.delete(backup_id).await.map(|_| ())
    }

    pub async fn enforce_retention(
        &self,
        category: BackupCategory,
        include_exempt: bool,
    ) -> Result<RetentionReport> {
        self.retention.enforce(category, include_exempt).await
    }

    /// Apply retention to every category.
    pub async fn enforce_retention_all(&self, include_exempt: bool) -> Result<Vec<RetentionReport>> {
        self.retention.enforce_all(include_exempt).await
    }

    /// Capture the current live state without storing anything.
    pub async fn live_snapshot(&self) -> Result<BackupManifest> {
        ManifestBuilder::new(
            "live",
            BackupCategory::Manual,
            None,
            self.config.compression.algorithm,
        )
        .build(&self.config.protected, &self.config.engine.live_root)
        .await
    }

    /// Remove `restore-*` staging directories whose handles died with a previous process.
    async fn sweep_staging(&self) {
        let root = self.config.staging_root();
        let mut entries = match tokio::fs::read_dir(&root).await {
            Ok(entries) => entries,
            Err(_) => return,
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_name().to_string_lossy().starts_with("restore-") {
                remove_staging(&entry.path()).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProtectedItem;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        live: TempDir,
        backups: TempDir,
        engine: BackupEngine,
    }

    async fn fixture() -> Result<Fixture> {
        let live = TempDir::new()?;
        let backups = TempDir::new()?;
        fs::write(live.path().join("colleges.json"), vec![b'c'; 40])?;
        fs::create_dir(live.path().join("reports"))?;
        fs::write(live.path().join("reports/annual.json"), vec![b'r'; 120])?;

        let config = Config::new(
            live.path().to_path_buf(),
            backups.path().to_path_buf(),
            vec![
                ProtectedItem::file("colleges.json"),
                ProtectedItem::directory("reports"),
            ],
        );
        let engine = BackupEngine::open(config).await?;
        Ok(Fixture {
            live,
            backups,
            engine,
        })
    }

    #[tokio::test]
    async fn test_second_run_for_running_category_is_rejected() -> Result<()> {
        let f = fixture().await?;
        f.engine.running.lock().await.insert(BackupCategory::Daily);

        let result = f.engine.create_backup(BackupCategory::Daily, None).await;
        assert!(matches!(result, Err(EngineError::AlreadyRunning(_))));

        // Other categories are independent
        f.engine.create_backup(BackupCategory::Weekly, None).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_running_set_is_released() -> Result<()> {
        let f = fixture().await?;
        f.engine.create_backup(BackupCategory::Daily, None).await?;
        f.engine.create_backup(BackupCategory::Daily, None).await?;
        assert!(f.engine.running.lock().await.is_empty());
        assert_eq!(f.engine.list_backups(Some(BackupCategory::Daily)).await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_backup_timeout_leaves_no_directory() -> Result<()> {
        let f = fixture().await?;
        let engine = f.engine.with_timeouts(Duration::ZERO, Duration::from_secs(60));

        let result = engine.create_backup(BackupCategory::Manual, None).await;
        assert!(matches!(result, Err(EngineError::Timeout(_))));
        assert!(engine.list_backups(None).await?.is_empty());

        let leftovers = fs::read_dir(f.backups.path().join("manual"))
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(leftovers, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_waiting_for_retention_does_not_use_backup_budget() -> Result<()> {
        let f = fixture().await?;
        let engine = Arc::new(
            f.engine
                .with_timeouts(Duration::from_secs(1), Duration::from_secs(60)),
        );

        // Hold the root lock past the budget so retention has to wait
        let guard = engine.retention.root_lock().lock_owned().await;
        let running = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run_backup(BackupCategory::Daily, None).await })
        };
        tokio::time::sleep(Duration::from_millis(1500)).await;
        drop(guard);

        let result = running.await.unwrap()?;
        assert!(result.retention.is_some());
        let listed = engine.list_backups(Some(BackupCategory::Daily)).await?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].backup_id, result.backup_id);
        Ok(())
    }

    #[tokio::test]
    async fn test_promote_and_discard_handles() -> Result<()> {
        let f = fixture().await?;
        let summary = f.engine.create_backup(BackupCategory::Manual, None).await?;

        let first = f.engine.restore_backup(&summary.backup_id).await?;
        let second = f.engine.restore_backup(&summary.backup_id).await?;
        assert_eq!(f.engine.pending_restores().len(), 2);

        f.engine.discard_restore(&second.id).await?;
        assert!(!second.staging_path.exists());
        assert!(matches!(
            f.engine.discard_restore(&second.id).await,
            Err(EngineError::NotFound(_))
        ));

        fs::write(f.live.path().join("colleges.json"), b"[]")?;
        f.engine.promote_restore(&first.id).await?;
        assert_eq!(fs::read(f.live.path().join("colleges.json"))?, vec![b'c'; 40]);
        assert!(f.engine.pending_restores().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_open_sweeps_leftovers() -> Result<()> {
        let f = fixture().await?;
        let partial = f.backups.path().join("daily/.partial-20260101T000000000Z-00000000");
        fs::create_dir_all(&partial)?;
        let staging = f.backups.path().join(".staging/restore-x-1234");
        fs::create_dir_all(&staging)?;

        let reopened = BackupEngine::open(f.engine.config().clone()).await?;
        assert!(!partial.exists());
        assert!(!staging.exists());
        assert!(reopened.list_backups(None).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_live_snapshot_matches_backup_checksums() -> Result<()> {
        let f = fixture().await?;
        let summary = f.engine.create_backup(BackupCategory::Manual, None).await?;
        let stored = f.engine.get_backup(&summary.backup_id).await?;
        let live = f.engine.live_snapshot().await?;

        assert_eq!(
            stored.directories["reports"].checksum,
            live.directories["reports"].checksum
        );
        assert_eq!(
            stored.entries["colleges.json"].checksum,
            live.entries["colleges.json"].checksum
        );
        Ok(())
    }
}
