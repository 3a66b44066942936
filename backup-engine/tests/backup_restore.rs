//! End-to-end behaviour of the engine against real directories.

use backup_engine::checksum;
use backup_engine::{BackupCategory, BackupEngine, Config, EngineError, ProtectedItem, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Store {
    live: TempDir,
    backups: TempDir,
}

impl Store {
    /// colleges.json (40 bytes) plus reports/ holding one 120-byte file.
    fn new() -> Result<Self> {
        let live = TempDir::new()?;
        let backups = TempDir::new()?;
        fs::write(
            live.path().join("colleges.json"),
            br#"[{"id":1,"name":"North Campus","on":10}]"#,
        )?;
        fs::create_dir(live.path().join("reports"))?;
        fs::write(live.path().join("reports/2025.json"), vec![b'x'; 120])?;
        Ok(Self { live, backups })
    }

    fn config(&self) -> Config {
        Config::new(
            self.live.path().to_path_buf(),
            self.backups.path().to_path_buf(),
            vec![
                ProtectedItem::file("colleges.json"),
                ProtectedItem::directory("reports"),
            ],
        )
    }

    async fn open(&self) -> Result<BackupEngine> {
        BackupEngine::open(self.config()).await
    }

    fn stored(&self, category: &str, backup_id: &str, item: &str) -> PathBuf {
        self.backups.path().join(category).join(backup_id).join(item)
    }
}

fn snapshot(root: &Path) -> Result<Vec<(PathBuf, Vec<u8>)>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                let relative = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
                files.push((relative, fs::read(&path)?));
            }
        }
    }
    files.sort();
    Ok(files)
}

fn corrupt(path: &Path) -> Result<()> {
    let mut bytes = fs::read(path)?;
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0x55;
    fs::write(path, bytes)?;
    Ok(())
}

#[tokio::test]
async fn test_backup_summary_counts_files_and_directories() -> Result<()> {
    let store = Store::new()?;
    let engine = store.open().await?;

    let summary = engine.create_backup(BackupCategory::Manual, Some("before import")).await?;
    assert_eq!(summary.file_count, 2);
    assert_eq!(summary.directory_count, 1);
    assert_eq!(summary.total_size, 160);
    assert_eq!(summary.label.as_deref(), Some("beforeimport"));

    let manifest = engine.get_backup(&summary.backup_id).await?;
    assert_eq!(manifest.entries["colleges.json"].size, 40);
    assert_eq!(manifest.entries["reports/2025.json"].size, 120);
    assert_eq!(manifest.directories["reports"].files, 1);
    assert_eq!(
        manifest.entries["colleges.json"].checksum,
        checksum::digest(&fs::read(store.live.path().join("colleges.json"))?)
    );
    assert_eq!(
        manifest.entries["reports/2025.json"].checksum,
        checksum::digest(&[b'x'; 120])
    );
    assert!(manifest.is_self_consistent());
    Ok(())
}

#[tokio::test]
async fn test_restore_and_promote_reproduces_live_data() -> Result<()> {
    let store = Store::new()?;
    let engine = store.open().await?;
    let before = snapshot(store.live.path())?;

    let summary = engine.create_backup(BackupCategory::Daily, None).await?;

    fs::write(store.live.path().join("colleges.json"), b"[]")?;
    fs::remove_file(store.live.path().join("reports/2025.json"))?;
    fs::write(store.live.path().join("reports/stray.json"), b"{}")?;

    let handle = engine.restore_backup(&summary.backup_id).await?;
    assert_eq!(snapshot(&handle.staging_path)?, before);

    engine.promote_restore(&handle.id).await?;
    assert_eq!(snapshot(store.live.path())?, before);
    assert!(!handle.staging_path.exists());
    Ok(())
}

#[tokio::test]
async fn test_restore_without_promote_leaves_live_untouched() -> Result<()> {
    let store = Store::new()?;
    let engine = store.open().await?;
    let summary = engine.create_backup(BackupCategory::Manual, None).await?;

    fs::write(store.live.path().join("colleges.json"), b"[{\"id\":2}]")?;
    let live = snapshot(store.live.path())?;

    let handle = engine.restore_backup(&summary.backup_id).await?;
    assert!(handle.staging_path.exists());
    assert_eq!(snapshot(store.live.path())?, live);

    engine.discard_restore(&handle.id).await?;
    assert_eq!(snapshot(store.live.path())?, live);
    Ok(())
}

#[tokio::test]
async fn test_tampered_staging_is_not_promoted() -> Result<()> {
    let store = Store::new()?;
    let engine = store.open().await?;
    let summary = engine.create_backup(BackupCategory::Daily, None).await?;

    fs::write(store.live.path().join("colleges.json"), b"[{\"id\":2}]")?;
    let live = snapshot(store.live.path())?;

    let handle = engine.restore_backup(&summary.backup_id).await?;
    corrupt(&handle.staging_path.join("reports/2025.json"))?;

    match engine.promote_restore(&handle.id).await {
        Err(EngineError::RestoreVerificationFailed { mismatches }) => {
            assert_eq!(mismatches, vec!["reports/2025.json".to_string()]);
        }
        other => panic!("expected RestoreVerificationFailed, got {:?}", other),
    }
    assert_eq!(snapshot(store.live.path())?, live);
    assert_eq!(engine.pending_restores().len(), 1);

    engine.discard_restore(&handle.id).await?;
    assert!(!handle.staging_path.exists());
    Ok(())
}

#[tokio::test]
async fn test_promote_keeps_unprotected_files_and_restores_hidden_ones() -> Result<()> {
    let store = Store::new()?;
    fs::write(store.live.path().join("notes.txt"), b"operator notes")?;
    fs::write(store.live.path().join("reports/.DS_Store"), b"finder")?;
    fs::write(store.live.path().join("reports/import.tmp"), b"half-done import")?;
    let engine = store.open().await?;
    let summary = engine.create_backup(BackupCategory::Manual, None).await?;

    let manifest = engine.get_backup(&summary.backup_id).await?;
    assert!(manifest.entries.contains_key("reports/.DS_Store"));
    assert!(manifest.entries.contains_key("reports/import.tmp"));
    assert!(!manifest.entries.contains_key("notes.txt"));

    fs::write(store.live.path().join("notes.txt"), b"edited after backup")?;
    fs::remove_file(store.live.path().join("reports/.DS_Store"))?;
    fs::write(store.live.path().join("reports/import.tmp"), b"")?;

    let handle = engine.restore_backup(&summary.backup_id).await?;
    engine.promote_restore(&handle.id).await?;

    let live = store.live.path();
    assert_eq!(fs::read(live.join("notes.txt"))?, b"edited after backup");
    assert_eq!(fs::read(live.join("reports/.DS_Store"))?, b"finder");
    assert_eq!(fs::read(live.join("reports/import.tmp"))?, b"half-done import");
    assert_eq!(fs::read(live.join("reports/2025.json"))?, vec![b'x'; 120]);
    Ok(())
}

#[tokio::test]
async fn test_manifest_paths_leaving_the_root_are_refused() -> Result<()> {
    let store = Store::new()?;
    let engine = store.open().await?;
    let summary = engine.create_backup(BackupCategory::Manual, None).await?;

    // Rename reports/ to ../reports/ in the stored manifest; counters and aggregates still match
    let path = store.stored("manual", &summary.backup_id, "manifest.json");
    let mut manifest: serde_json::Value = serde_json::from_slice(&fs::read(&path)?)?;
    let directory = manifest["directories"]
        .as_object_mut()
        .and_then(|d| d.remove("reports"))
        .unwrap();
    manifest["directories"]["../reports"] = directory;
    let entry = manifest["entries"]
        .as_object_mut()
        .and_then(|e| e.remove("reports/2025.json"))
        .unwrap();
    manifest["entries"]["../reports/2025.json"] = entry;
    fs::write(&path, serde_json::to_vec_pretty(&manifest)?)?;

    let outcome = engine.restore_backup(&summary.backup_id).await;
    assert!(matches!(outcome, Err(EngineError::NotFound(_))));
    assert!(!store.backups.path().join("reports").exists());
    assert!(!store.backups.path().join(".staging/reports").exists());
    assert!(engine.list_backups(None).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_corrupted_backup_fails_restore_and_verify() -> Result<()> {
    let store = Store::new()?;
    let engine = store.open().await?;
    let summary = engine.create_backup(BackupCategory::Daily, None).await?;
    let live = snapshot(store.live.path())?;

    corrupt(&store.stored("daily", &summary.backup_id, "reports/2025.json"))?;

    let report = engine.verify_backup(&summary.backup_id).await?;
    assert!(!report.valid);
    assert_eq!(report.mismatches, vec!["reports/2025.json".to_string()]);

    match engine.restore_backup(&summary.backup_id).await {
        Err(EngineError::CorruptBackup { mismatches, .. }) => {
            assert_eq!(mismatches, vec!["reports/2025.json".to_string()]);
        }
        other => panic!("expected CorruptBackup, got {:?}", other.map(|h| h.id)),
    }

    assert_eq!(snapshot(store.live.path())?, live);
    assert!(engine.pending_restores().is_empty());
    let staging = store.backups.path().join(".staging");
    let staged = fs::read_dir(&staging).map(|e| e.count()).unwrap_or(0);
    assert_eq!(staged, 0);
    Ok(())
}

#[tokio::test]
async fn test_retention_keeps_newest_seven_daily() -> Result<()> {
    let store = Store::new()?;
    let engine = store.open().await?;

    let mut created = Vec::new();
    for _ in 0..12 {
        created.push(engine.create_backup(BackupCategory::Daily, None).await?.backup_id);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let mut kept: Vec<String> = engine
        .list_backups(Some(BackupCategory::Daily))
        .await?
        .into_iter()
        .map(|s| s.backup_id)
        .collect();
    kept.reverse();
    assert_eq!(kept, created[5..].to_vec());

    for removed in &created[..5] {
        assert!(!store.backups.path().join("daily").join(removed).exists());
    }
    Ok(())
}

#[tokio::test]
async fn test_manual_backups_survive_retention() -> Result<()> {
    let store = Store::new()?;
    let mut config = store.config();
    config.retention.set_limit(BackupCategory::Manual, 1);
    let engine = BackupEngine::open(config).await?;

    for _ in 0..3 {
        engine.create_backup(BackupCategory::Manual, None).await?;
    }
    assert_eq!(engine.list_backups(Some(BackupCategory::Manual)).await?.len(), 3);

    let report = engine.enforce_retention(BackupCategory::Manual, true).await?;
    assert_eq!(report.removed.len(), 2);
    assert_eq!(engine.list_backups(Some(BackupCategory::Manual)).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_timed_out_backup_is_invisible() -> Result<()> {
    let store = Store::new()?;
    let engine = store
        .open()
        .await?
        .with_timeouts(Duration::ZERO, Duration::from_secs(60));

    let result = engine.create_backup(BackupCategory::Weekly, None).await;
    assert!(matches!(result, Err(EngineError::Timeout(_))));
    assert!(engine.list_backups(None).await?.is_empty());

    let leftovers = fs::read_dir(store.backups.path().join("weekly"))
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0);
    Ok(())
}

#[tokio::test]
async fn test_unknown_backup_is_not_found() -> Result<()> {
    let store = Store::new()?;
    let engine = store.open().await?;

    assert!(matches!(
        engine.restore_backup("20250101T000000000Z-deadbeef").await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        engine.get_backup("does-not-exist").await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        engine.delete_backup("../../etc").await,
        Err(EngineError::NotFound(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_concurrent_runs_of_one_category() -> Result<()> {
    let store = Store::new()?;
    let engine = Arc::new(store.open().await?);

    let (first, second) = tokio::join!(
        engine.create_backup(BackupCategory::Emergency, None),
        engine.create_backup(BackupCategory::Emergency, None)
    );

    let outcomes = [first, second];
    let succeeded = outcomes.iter().filter(|r| r.is_ok()).count();
    let rejected = outcomes
        .iter()
        .filter(|r| matches!(r, Err(EngineError::AlreadyRunning(_))))
        .count();
    assert_eq!(succeeded, 1);
    assert_eq!(rejected, 1);
    assert_eq!(engine.list_backups(Some(BackupCategory::Emergency)).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_catalog_skips_invalid_directories() -> Result<()> {
    let store = Store::new()?;
    let engine = store.open().await?;
    let summary = engine.create_backup(BackupCategory::Monthly, None).await?;

    let monthly = store.backups.path().join("monthly");
    fs::create_dir(monthly.join("no-manifest"))?;
    fs::create_dir(monthly.join("20240101T000000000Z-0badf00d"))?;
    fs::write(
        monthly.join("20240101T000000000Z-0badf00d/manifest.json"),
        b"{ not json",
    )?;
    fs::write(monthly.join("stray-file"), b"x")?;

    let listed = engine.list_backups(None).await?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].backup_id, summary.backup_id);

    let stats = engine.get_backup_stats().await?;
    assert_eq!(stats.count, 1);
    assert_eq!(stats.total_uncompressed_size, 160);
    Ok(())
}

#[tokio::test]
async fn test_unchanged_data_produces_identical_checksums() -> Result<()> {
    let store = Store::new()?;
    let engine = store.open().await?;

    let first = engine.create_backup(BackupCategory::Daily, None).await?;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = engine.create_backup(BackupCategory::Daily, None).await?;
    assert_ne!(first.backup_id, second.backup_id);

    let a = engine.get_backup(&first.backup_id).await?;
    let b = engine.get_backup(&second.backup_id).await?;
    for (path, entry) in &a.entries {
        assert_eq!(entry.checksum, b.entries[path].checksum);
    }
    assert_eq!(a.directories["reports"].checksum, b.directories["reports"].checksum);
    Ok(())
}
