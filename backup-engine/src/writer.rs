//! Backup writer - Produces one published backup per run.
//!
//! A run streams every protected source file exactly once. While the bytes
//! are read they are hashed (content checksum), compressed, hashed again
//! (stored checksum) and written into a hidden working directory. The
//! manifest is built from that same pass, so it always describes what was
//! stored even if the live file changes while it is copied. The working
//! directory is validated and then renamed into place.

use crate::catalog::{BackupCatalog, PARTIAL_PREFIX};
use crate::checksum::HashingReader;
use crate::compression::Compressor;
use crate::fs::metadata::FileMetadata;
use crate::fs::walker::walk_directory;
use crate::fs::{is_real_directory, is_symlink};
use crate::integrity::{IntegrityValidator, Location};
use crate::manifest::{BackupManifest, ManifestBuilder, ManifestEntry, MANIFEST_FILE};
use crate::models::{BackupCategory, ItemKind, ProtectedItem};
use crate::retention::{RetentionManager, RetentionReport};
use crate::storage::{join_key, StorageBackend};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Maximum length of a sanitized label.
pub const MAX_LABEL_LEN: usize = 64;

/// Generate a backup id: `YYYYMMDDTHHMMSSmmmZ-<8 hex>`.
pub fn generate_backup_id(now: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", now.format("%Y%m%dT%H%M%S%3fZ"), &suffix[..8])
}

/// Keep alphanumerics, `-` and `_`, truncated to [`MAX_LABEL_LEN`].
/// Returns `None` when nothing survives.
pub fn sanitize_label(label: &str) -> Option<String> {
    let clean: String = label
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(MAX_LABEL_LEN)
        .collect();

    if clean.is_empty() {
        None
    } else {
        Some(clean)
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone)]
pub struct BackupResult {
    pub backup_id: String,
    pub manifest: BackupManifest,
    /// Retention pass run after publishing; `None` if it could not run at all
    pub retention: Option<RetentionReport>,
    pub duration_secs: f64,
}

/// A run whose working directory exists but which has not been published.
#[derive(Debug, Clone)]
pub struct PendingBackup {
    pub backup_id: String,
    pub category: BackupCategory,
    pub label: Option<String>,
    pub started_at: DateTime<Utc>,
    work_key: String,
    final_key: String,
}

impl PendingBackup {
    pub fn work_key(&self) -> &str {
        &self.work_key
    }
}

pub struct BackupWriter {
    storage: Arc<dyn StorageBackend>,
    compressor: Arc<dyn Compressor>,
    validator: Arc<IntegrityValidator>,
    retention: Option<Arc<RetentionManager>>,
    live_root: PathBuf,
    items: Vec<ProtectedItem>,
}

impl BackupWriter {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        compressor: Arc<dyn Compressor>,
        live_root: impl Into<PathBuf>,
        items: Vec<ProtectedItem>,
    ) -> Self {
        let validator = Arc::new(IntegrityValidator::new(storage.clone()));
        Self {
            storage,
            compressor,
            validator,
            retention: None,
            live_root: live_root.into(),
            items,
        }
    }

    /// Run retention for the category after every publish.
    pub fn with_retention(mut self, retention: Arc<RetentionManager>) -> Self {
        self.retention = Some(retention);
        self
    }

    pub fn with_validator(mut self, validator: Arc<IntegrityValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Prepare, execute and publish a backup, then apply retention.
    pub async fn run(
        &self,
        category: BackupCategory,
        label: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<BackupResult> {
        let pending = self.prepare(category, label).await?;
        let mut result = self.execute(&pending, cancel).await?;
        result.retention = self.apply_retention(category).await;
        Ok(result)
    }

    /// Allocate an id and create the hidden working directory.
    pub async fn prepare(
        &self,
        category: BackupCategory,
        label: Option<&str>,
    ) -> Result<PendingBackup> {
        let started_at = Utc::now();
        let backup_id = generate_backup_id(started_at);
        let work_key = join_key(&[
            category.as_str(),
            &format!("{}{}", PARTIAL_PREFIX, backup_id),
        ]);
        let final_key = BackupCatalog::backup_key(category, &backup_id);

        self.storage.create_dir(&work_key).await.map_err(|e| {
            error!(category = %category, "Failed to create working directory {}: {}", work_key, e);
            EngineError::BackupFailed(format!("cannot create working directory: {}", e))
        })?;

        Ok(PendingBackup {
            backup_id,
            category,
            label: label.and_then(sanitize_label),
            started_at,
            work_key,
            final_key,
        })
    }

    /// Copy, validate and publish a prepared backup.
    ///
    /// On any failure the working directory is removed. Retention is not
    /// applied here; see [`apply_retention`](Self::apply_retention).
    pub async fn execute(
        &self,
        pending: &PendingBackup,
        cancel: &CancellationToken,
    ) -> Result<BackupResult> {
        let start = std::time::Instant::now();
        info!(
            category = %pending.category,
            backup_id = %pending.backup_id,
            "Starting backup of {} items from {}",
            self.items.len(),
            self.live_root.display()
        );

        let manifest = match self.write_and_validate(pending, cancel).await {
            Ok(manifest) => manifest,
            Err(e) => {
                error!(backup_id = %pending.backup_id, "Backup failed: {}", e);
                self.discard(pending).await;
                return Err(match e {
                    EngineError::Cancelled => EngineError::Cancelled,
                    EngineError::BackupFailed(reason) => EngineError::BackupFailed(reason),
                    other => EngineError::BackupFailed(other.to_string()),
                });
            }
        };

        if let Err(e) = self.storage.rename(&pending.work_key, &pending.final_key).await {
            error!(backup_id = %pending.backup_id, "Failed to publish backup: {}", e);
            self.discard(pending).await;
            return Err(EngineError::BackupFailed(format!("publish failed: {}", e)));
        }

        info!(
            category = %pending.category,
            backup_id = %pending.backup_id,
            "Published backup: {} files, {} bytes ({} stored)",
            manifest.summary.total_files,
            manifest.summary.total_size,
            manifest.summary.total_stored_size
        );

        Ok(BackupResult {
            backup_id: pending.backup_id.clone(),
            manifest,
            retention: None,
            duration_secs: start.elapsed().as_secs_f64(),
        })
    }

    /// Enforce the retention limit of `category` after a publish.
    ///
    /// Failures are logged and never fail the backup that triggered them.
    pub async fn apply_retention(&self, category: BackupCategory) -> Option<RetentionReport> {
        let retention = self.retention.as_ref()?;
        match retention.enforce(category, false).await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(category = %category, "Retention after backup failed: {}", e);
                None
            }
        }
    }

    /// Remove the working directory of an unpublished run.
    pub async fn discard(&self, pending: &PendingBackup) {
        if let Err(e) = self.storage.delete(&pending.work_key).await {
            warn!("Failed to remove working directory {}: {}", pending.work_key, e);
        }
    }

    async fn write_and_validate(
        &self,
        pending: &PendingBackup,
        cancel: &CancellationToken,
    ) -> Result<BackupManifest> {
        let mut builder = ManifestBuilder::new(
            pending.backup_id.clone(),
            pending.category,
            pending.label.clone(),
            self.compressor.algorithm(),
        )
        .with_timestamp(pending.started_at);

        for item in &self.items {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let source = item.source_path(&self.live_root);
            match item.kind {
                ItemKind::File => {
                    match self.store_file(&source, &pending.work_key, item.key()).await? {
                        Some(entry) => builder.record_file(item.key(), entry),
                        None => {
                            warn!(item = %item.name, "{}", EngineError::SourceUnavailable(item.name.clone()));
                            builder.record_absent(item.key());
                        }
                    }
                }
                ItemKind::Directory => {
                    self.store_directory(&source, pending, item, &mut builder, cancel)
                        .await?
                }
            }
        }

        let manifest = builder.finish();
        self.storage
            .write(
                &join_key(&[&pending.work_key, MANIFEST_FILE]),
                &manifest.to_json_pretty()?,
            )
            .await?;

        let report = self
            .validator
            .validate(Location::Stored(&pending.work_key), &manifest)
            .await?;
        if !report.valid {
            return Err(EngineError::BackupFailed(format!(
                "validation failed for {}",
                report.mismatches.join(", ")
            )));
        }

        Ok(manifest)
    }

    async fn store_directory(
        &self,
        source: &Path,
        pending: &PendingBackup,
        item: &ProtectedItem,
        builder: &mut ManifestBuilder,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !is_real_directory(source).await {
            warn!(item = %item.name, "{}", EngineError::SourceUnavailable(item.name.clone()));
            builder.record_absent(item.key());
            return Ok(());
        }

        let walk_root = source.to_path_buf();
        let walked = tokio::task::spawn_blocking(move || walk_directory(&walk_root))
            .await
            .map_err(|e| EngineError::BackupFailed(format!("walk task failed: {}", e)))?;
        let files = match walked {
            Ok(files) => files,
            Err(e) => {
                let reason = format!("{}: {}", item.name, e);
                warn!(item = %item.name, "{}", EngineError::SourceUnavailable(reason));
                builder.record_absent(item.key());
                return Ok(());
            }
        };

        builder.record_directory(item.key());
        for file in files {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let key = format!("{}/{}", item.key(), file.relative_path);
            match self.store_file(&file.path, &pending.work_key, &key).await? {
                Some(entry) => builder.record_file(key, entry),
                None => debug!(path = %file.path.display(), "File disappeared before it was copied"),
            }
        }

        Ok(())
    }

    /// Hash, compress and store one source file in a single read pass.
    ///
    /// Returns `None` when the source is a symlink or cannot be opened.
    async fn store_file(
        &self,
        source: &Path,
        work_key: &str,
        relative: &str,
    ) -> Result<Option<ManifestEntry>> {
        if is_symlink(source).await {
            return Ok(None);
        }
        let file = match tokio::fs::File::open(source).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                warn!("Cannot read {}: {}", source.display(), e);
                return Ok(None);
            }
        };
        let std_meta = file.metadata().await?;
        if !std_meta.is_file() {
            return Ok(None);
        }
        let metadata = FileMetadata::from_std(&std_meta);

        let mut content = HashingReader::new(file);
        let mut stored = HashingReader::new(
            self.compressor
                .encode_reader(Box::pin(BufReader::new(&mut content))),
        );
        self.storage
            .write_stream(&join_key(&[work_key, relative]), Box::pin(&mut stored))
            .await?;

        let (stored_checksum, stored_size) = stored.finish();
        let (checksum, size) = content.finish();

        Ok(Some(
            ManifestEntry::new(&metadata, size, checksum).with_stored(stored_size, stored_checksum),
        ))
    }
}
