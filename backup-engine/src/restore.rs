//! Restore through an isolated staging directory.
//!
//! A restore never writes into the live-data root. It validates the stored
//! backup, decompresses it into a fresh staging directory and validates the
//! staged result. Moving staged data into the live root is a separate,
//! explicit step ([`RestoreEngine::promote`]).

use crate::catalog::BackupCatalog;
use crate::compression::decoder_for;
use crate::fs::metadata::apply_mode;
use crate::fs::resolve_path;
use crate::integrity::{IntegrityValidator, Location};
use crate::manifest::BackupManifest;
use crate::retention::RootLock;
use crate::storage::{join_key, StorageBackend};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// A validated restore waiting in staging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagingHandle {
    pub id: String,
    pub backup_id: String,
    pub staging_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub manifest: BackupManifest,
}

pub struct RestoreEngine {
    storage: Arc<dyn StorageBackend>,
    catalog: BackupCatalog,
    validator: Arc<IntegrityValidator>,
    live_root: PathBuf,
    staging_root: PathBuf,
    lock: RootLock,
}

impl RestoreEngine {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        catalog: BackupCatalog,
        validator: Arc<IntegrityValidator>,
        live_root: impl Into<PathBuf>,
        staging_root: impl Into<PathBuf>,
        lock: RootLock,
    ) -> Self {
        Self {
            storage,
            catalog,
            validator,
            live_root: live_root.into(),
            staging_root: staging_root.into(),
            lock,
        }
    }

    /// Fresh, not yet existing staging path for `backup_id`.
    pub fn staging_path_for(&self, backup_id: &str, staging_root: Option<&Path>) -> PathBuf {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        staging_root
            .unwrap_or(&self.staging_root)
            .join(format!("restore-{}-{}", backup_id, &suffix[..8]))
    }

    /// Restore `backup_id` into a new staging directory and return a handle to it.
    pub async fn restore(
        &self,
        backup_id: &str,
        staging_root: Option<&Path>,
    ) -> Result<StagingHandle> {
        let staging = self.staging_path_for(backup_id, staging_root);
        let manifest = self.restore_into(backup_id, &staging).await?;
        Ok(StagingHandle {
            id: uuid::Uuid::new_v4().to_string(),
            backup_id: backup_id.to_string(),
            staging_path: staging,
            created_at: Utc::now(),
            manifest,
        })
    }

    /// Validate the stored backup, decompress it into `staging` and validate the result.
    ///
    /// `staging` must not exist yet. It is removed again if any step fails.
    pub async fn restore_into(&self, backup_id: &str, staging: &Path) -> Result<BackupManifest> {
        let _guard = self.lock.lock().await;

        let resolved = resolve_path(staging).map_err(|e| {
            EngineError::InvalidInput(format!("staging directory {}: {}", staging.display(), e))
        })?;
        if resolved.starts_with(resolve_path(&self.live_root)?) {
            return Err(EngineError::InvalidInput(format!(
                "staging directory {} lies inside the live root",
                staging.display()
            )));
        }

        let (category, manifest) = self.catalog.find(backup_id).await?;
        let prefix = BackupCatalog::backup_key(category, backup_id);

        let report = self
            .validator
            .validate(Location::Stored(&prefix), &manifest)
            .await?;
        if !report.valid {
            warn!(backup_id = %backup_id, "Refusing to restore corrupt backup");
            return Err(EngineError::CorruptBackup {
                backup_id: backup_id.to_string(),
                mismatches: report.mismatches,
            });
        }

        if let Some(parent) = staging.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::create_dir(staging).await.map_err(|e| {
            EngineError::RestoreFailed(format!(
                "cannot create staging {}: {}",
                staging.display(),
                e
            ))
        })?;

        match self.fill_staging(&prefix, &manifest, staging).await {
            Ok(()) => {
                info!(
                    backup_id = %backup_id,
                    "Restored {} files into {}",
                    manifest.summary.total_files,
                    staging.display()
                );
                Ok(manifest)
            }
            Err(e) => {
                remove_staging(staging).await;
                Err(e)
            }
        }
    }

    async fn fill_staging(
        &self,
        prefix: &str,
        manifest: &BackupManifest,
        staging: &Path,
    ) -> Result<()> {
        let decoder = decoder_for(manifest.compression);

        for name in manifest.directories.keys() {
            fs::create_dir_all(staged_path(staging, name)).await?;
        }

        for (path, entry) in &manifest.entries {
            let target = staged_path(staging, path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).await?;
            }

            let Some(reader) = self.storage.reader(&join_key(&[prefix, path])).await? else {
                if entry.size == 0 {
                    fs::File::create(&target).await?;
                    continue;
                }
                return Err(EngineError::RestoreFailed(format!("{} missing from backup", path)));
            };

            let mut output = fs::File::create(&target).await?;
            tokio::io::copy(&mut decoder.decode_reader(reader), &mut output)
                .await
                .map_err(|e| EngineError::CorruptData(format!("{}: {}", path, e)))?;
            output.flush().await?;

            apply_mode(&target, entry.mode)?;
        }

        let report = self
            .validator
            .validate(Location::Plain(staging), manifest)
            .await?;
        if !report.valid {
            return Err(EngineError::RestoreVerificationFailed {
                mismatches: report.mismatches,
            });
        }

        Ok(())
    }

    /// Move a staged restore into the live root, one top-level item at a time.
    ///
    /// Each item is copied next to its destination under a hidden name and
    /// then renamed over it. Items recorded as absent are left untouched.
    /// The staging directory is removed afterwards. Returns the promoted item names.
    pub async fn promote(&self, handle: &StagingHandle) -> Result<Vec<String>> {
        let _guard = self.lock.lock().await;

        let staging = handle.staging_path.clone();
        if !fs::try_exists(&staging).await? {
            return Err(EngineError::NotFound(format!(
                "staging directory {}",
                staging.display()
            )));
        }

        let report = self
            .validator
            .validate(Location::Plain(&staging), &handle.manifest)
            .await?;
        if !report.valid {
            return Err(EngineError::RestoreVerificationFailed {
                mismatches: report.mismatches,
            });
        }

        fs::create_dir_all(&self.live_root).await?;
        let mut promoted = Vec::new();
        for name in top_level_items(&handle.manifest) {
            let source = staged_path(&staging, &name);
            let target = staged_path(&self.live_root, &name);
            swap_into_place(&source, &target)
                .await
                .map_err(|e| EngineError::RestoreFailed(format!("promote {}: {}", name, e)))?;
            debug!(item = %name, "Promoted");
            promoted.push(name);
        }

        remove_staging(&staging).await;
        info!(
            backup_id = %handle.backup_id,
            "Promoted {} items into {}",
            promoted.len(),
            self.live_root.display()
        );
        Ok(promoted)
    }

    /// Drop a staged restore without promoting it.
    pub async fn discard(&self, handle: &StagingHandle) {
        let _guard = self.lock.lock().await;
        remove_staging(&handle.staging_path).await;
    }
}

/// Protected items present in a manifest: each directory plus every file outside them.
fn top_level_items(manifest: &BackupManifest) -> Vec<String> {
    let mut items: Vec<String> = manifest.directories.keys().cloned().collect();
    for path in manifest.entries.keys() {
        let in_directory = manifest
            .directories
            .keys()
            .any(|dir| path.starts_with(&format!("{}/", dir)));
        if !in_directory {
            items.push(path.clone());
        }
    }
    items.sort();
    items
}

fn staged_path(root: &Path, relative: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    for segment in relative.split('/').filter(|s| !s.is_empty()) {
        path.push(segment);
    }
    path
}

pub(crate) async fn remove_staging(staging: &Path) {
    let result = match fs::symlink_metadata(staging).await {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(staging).await,
        Ok(_) => fs::remove_file(staging).await,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        warn!("Failed to remove staging {}: {}", staging.display(), e);
    }
}

fn sibling(target: &Path, tag: &str) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    target.with_file_name(format!(".{}.{}-{}", name, tag, &suffix[..8]))
}

async fn swap_into_place(source: &Path, target: &Path) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await?;
    }

    let incoming = sibling(target, "restore");
    let source_owned = source.to_path_buf();
    let incoming_owned = incoming.clone();
    let copied = tokio::task::spawn_blocking(move || copy_tree(&source_owned, &incoming_owned))
        .await
        .map_err(std::io::Error::other)?;
    if let Err(e) = copied {
        remove_staging(&incoming).await;
        return Err(e);
    }

    let is_dir = fs::metadata(&incoming).await?.is_dir();
    if !is_dir {
        // rename(2) replaces a file atomically
        return fs::rename(&incoming, target).await;
    }

    let previous = if fs::try_exists(target).await? {
        let aside = sibling(target, "replaced");
        fs::rename(target, &aside).await?;
        Some(aside)
    } else {
        None
    };

    if let Err(e) = fs::rename(&incoming, target).await {
        if let Some(aside) = &previous {
            let _ = fs::rename(aside, target).await;
        }
        remove_staging(&incoming).await;
        return Err(e);
    }

    if let Some(aside) = previous {
        remove_staging(&aside).await;
    }
    Ok(())
}

/// Copy a file or directory tree, preserving permission bits.
fn copy_tree(source: &Path, target: &Path) -> std::io::Result<()> {
    if std::fs::metadata(source)?.is_file() {
        std::fs::copy(source, target)?;
        return Ok(());
    }

    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry?;
        let relative = entry.path().strip_prefix(source).unwrap_or(entry.path());
        let destination = target.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&destination)?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &destination)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{build_compressor, CompressionAlgorithm};
    use crate::models::{BackupCategory, ProtectedItem};
    use crate::storage::LocalStorage;
    use crate::writer::BackupWriter;
    use std::fs as stdfs;
    use tempfile::TempDir;
    use tokio::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        live: TempDir,
        backups: TempDir,
        staging: TempDir,
        writer: BackupWriter,
        restore: RestoreEngine,
    }

    fn fixture() -> std::io::Result<Fixture> {
        let live = TempDir::new()?;
        let backups = TempDir::new()?;
        let staging = TempDir::new()?;
        stdfs::write(live.path().join("colleges.json"), br#"[{"name":"North"}]"#)?;
        stdfs::create_dir_all(live.path().join("reports/2026"))?;
        stdfs::write(live.path().join("reports/2026/q1.json"), br#"{"q":1}"#)?;

        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(backups.path()));
        let validator = Arc::new(IntegrityValidator::new(storage.clone()));
        let writer = BackupWriter::new(
            storage.clone(),
            build_compressor(CompressionAlgorithm::Zstd, 3),
            live.path(),
            vec![
                ProtectedItem::file("colleges.json"),
                ProtectedItem::directory("reports"),
                ProtectedItem::file("users.json"),
            ],
        );
        let restore = RestoreEngine::new(
            storage.clone(),
            BackupCatalog::new(storage),
            validator,
            live.path(),
            staging.path(),
            Arc::new(Mutex::new(())),
        );
        Ok(Fixture {
            live,
            backups,
            staging,
            writer,
            restore,
        })
    }

    #[tokio::test]
    async fn test_restore_to_staging_leaves_live_untouched() -> Result<()> {
        let f = fixture()?;
        let result = f
            .writer
            .run(BackupCategory::Manual, None, &CancellationToken::new())
            .await?;

        stdfs::write(f.live.path().join("colleges.json"), b"[]")?;

        let handle = f.restore.restore(&result.backup_id, None).await?;
        assert!(handle.staging_path.starts_with(f.staging.path()));
        assert_eq!(
            stdfs::read(handle.staging_path.join("colleges.json"))?,
            br#"[{"name":"North"}]"#
        );
        assert_eq!(
            stdfs::read(handle.staging_path.join("reports/2026/q1.json"))?,
            br#"{"q":1}"#
        );
        assert_eq!(stdfs::read(f.live.path().join("colleges.json"))?, b"[]");
        Ok(())
    }

    #[tokio::test]
    async fn test_promote_restores_live_data() -> Result<()> {
        let f = fixture()?;
        let result = f
            .writer
            .run(BackupCategory::Manual, None, &CancellationToken::new())
            .await?;

        stdfs::write(f.live.path().join("colleges.json"), b"[]")?;
        stdfs::remove_dir_all(f.live.path().join("reports"))?;
        stdfs::create_dir(f.live.path().join("reports"))?;
        stdfs::write(f.live.path().join("reports/stray.json"), b"{}")?;
        stdfs::write(f.live.path().join("users.json"), b"[\"kept\"]")?;

        let handle = f.restore.restore(&result.backup_id, None).await?;
        let promoted = f.restore.promote(&handle).await?;
        assert_eq!(promoted, vec!["colleges.json", "reports"]);

        assert_eq!(
            stdfs::read(f.live.path().join("colleges.json"))?,
            br#"[{"name":"North"}]"#
        );
        assert!(f.live.path().join("reports/2026/q1.json").is_file());
        assert!(!f.live.path().join("reports/stray.json").exists());
        // Absent at backup time, so left alone
        assert_eq!(stdfs::read(f.live.path().join("users.json"))?, b"[\"kept\"]");
        assert!(!handle.staging_path.exists());

        // No hidden swap leftovers in the live root
        let hidden: Vec<_> = stdfs::read_dir(f.live.path())?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(hidden.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupt_backup_is_refused() -> Result<()> {
        let f = fixture()?;
        let result = f
            .writer
            .run(BackupCategory::Manual, None, &CancellationToken::new())
            .await?;

        let stored = f
            .backups
            .path()
            .join("manual")
            .join(&result.backup_id)
            .join("colleges.json");
        let mut bytes = stdfs::read(&stored)?;
        bytes[0] ^= 0xff;
        stdfs::write(&stored, bytes)?;

        match f.restore.restore(&result.backup_id, None).await {
            Err(EngineError::CorruptBackup { mismatches, .. }) => {
                assert_eq!(mismatches, vec!["colleges.json"]);
            }
            other => panic!("expected CorruptBackup, got {:?}", other.map(|h| h.id)),
        }
        assert_eq!(stdfs::read_dir(f.staging.path())?.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_backup() -> Result<()> {
        let f = fixture()?;
        let result = f.restore.restore("20260101T000000000Z-00000000", None).await;
        assert!(matches!(result, Err(EngineError::NotFound(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_staging_inside_live_root_is_rejected() -> Result<()> {
        let f = fixture()?;
        let result = f
            .writer
            .run(BackupCategory::Manual, None, &CancellationToken::new())
            .await?;

        let inside = f.live.path().join("restore-here");
        let outcome = f.restore.restore_into(&result.backup_id, &inside).await;
        assert!(matches!(outcome, Err(EngineError::InvalidInput(_))));
        assert!(!inside.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_staging_reaching_live_root_through_parent_is_rejected() -> Result<()> {
        let f = fixture()?;
        let result = f
            .writer
            .run(BackupCategory::Manual, None, &CancellationToken::new())
            .await?;

        let live_name = f.live.path().file_name().map(PathBuf::from).unwrap_or_default();
        let sneaky = f.staging.path().join("..").join(&live_name).join("restore-here");
        let outcome = f.restore.restore_into(&result.backup_id, &sneaky).await;
        assert!(matches!(outcome, Err(EngineError::InvalidInput(_))));
        assert!(!f.live.path().join("restore-here").exists());
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_staging_reaching_live_root_through_symlink_is_rejected() -> Result<()> {
        let f = fixture()?;
        let result = f
            .writer
            .run(BackupCategory::Manual, None, &CancellationToken::new())
            .await?;

        let link = f.staging.path().join("live-link");
        std::os::unix::fs::symlink(f.live.path(), &link)?;
        let outcome = f
            .restore
            .restore_into(&result.backup_id, &link.join("restore-here"))
            .await;
        assert!(matches!(outcome, Err(EngineError::InvalidInput(_))));
        assert!(!f.live.path().join("restore-here").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_discard_waits_for_root_lock() -> Result<()> {
        let f = fixture()?;
        let result = f
            .writer
            .run(BackupCategory::Manual, None, &CancellationToken::new())
            .await?;
        let handle = f.restore.restore(&result.backup_id, None).await?;

        let guard = f.restore.lock.clone().lock_owned().await;
        let restore = Arc::new(f.restore);
        let discarding = {
            let restore = restore.clone();
            let handle = handle.clone();
            tokio::spawn(async move { restore.discard(&handle).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(handle.staging_path.exists());

        drop(guard);
        discarding.await.unwrap();
        assert!(!handle.staging_path.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_discard() -> Result<()> {
        let f = fixture()?;
        let result = f
            .writer
            .run(BackupCategory::Manual, None, &CancellationToken::new())
            .await?;
        let handle = f.restore.restore(&result.backup_id, None).await?;
        f.restore.discard(&handle).await;
        assert!(!handle.staging_path.exists());
        Ok(())
    }
}
