//! Configuration management for the backup engine.
//!
//! Loads configuration from a TOML file with environment variable overrides
//! (`BACKUP_ENGINE__<SECTION>__<KEY>`, e.g. `BACKUP_ENGINE__LOG__LEVEL=debug`).

use crate::compression::CompressionAlgorithm;
use crate::models::{validate_items, BackupCategory, ProtectedItem};
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "BACKUP_ENGINE";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub engine: EngineConfig,

    /// Items under the live-data root captured by every backup
    #[serde(default)]
    pub protected: Vec<ProtectedItem>,

    #[serde(default)]
    pub compression: CompressionConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    /// Periodic backups run by the scheduler
    #[serde(default = "default_schedules")]
    pub schedule: Vec<ScheduleConfig>,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding the live JSON documents
    pub live_root: PathBuf,

    /// Directory holding `<category>/<backupId>/` backups
    pub backup_root: PathBuf,

    /// Where restore staging directories are created (default: `<backup_root>/.staging`)
    #[serde(default)]
    pub staging_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Compression algorithm (zstd, none)
    #[serde(default = "default_compression")]
    pub algorithm: CompressionAlgorithm,

    /// Compression level (1-22 for zstd)
    #[serde(default = "default_compression_level")]
    pub level: i32,
}

/// Number of backups kept per category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_keep_daily")]
    pub daily: usize,
    #[serde(default = "default_keep_weekly")]
    pub weekly: usize,
    #[serde(default = "default_keep_monthly")]
    pub monthly: usize,
    #[serde(default = "default_keep_yearly")]
    pub yearly: usize,
    #[serde(default = "default_keep_emergency")]
    pub emergency: usize,
    #[serde(default = "default_keep_manual")]
    pub manual: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub category: BackupCategory,

    /// Seconds between two backups of this category
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Wall-clock budget for one backup run
    #[serde(default = "default_backup_timeout")]
    pub backup_timeout_secs: u64,

    /// Wall-clock budget for one restore
    #[serde(default = "default_restore_timeout")]
    pub restore_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

// Default values
fn default_compression() -> CompressionAlgorithm {
    CompressionAlgorithm::Zstd
}

fn default_compression_level() -> i32 {
    3
}

fn default_keep_daily() -> usize {
    7
}

fn default_keep_weekly() -> usize {
    4
}

fn default_keep_monthly() -> usize {
    12
}

fn default_keep_yearly() -> usize {
    3
}

fn default_keep_emergency() -> usize {
    10
}

fn default_keep_manual() -> usize {
    20
}

fn default_schedules() -> Vec<ScheduleConfig> {
    vec![ScheduleConfig {
        category: BackupCategory::Daily,
        interval_secs: 24 * 60 * 60,
    }]
}

fn default_backup_timeout() -> u64 {
    60 * 60
}

fn default_restore_timeout() -> u64 {
    60 * 60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: default_compression(),
            level: default_compression_level(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            daily: default_keep_daily(),
            weekly: default_keep_weekly(),
            monthly: default_keep_monthly(),
            yearly: default_keep_yearly(),
            emergency: default_keep_emergency(),
            manual: default_keep_manual(),
        }
    }
}

impl RetentionConfig {
    pub fn limit(&self, category: BackupCategory) -> usize {
        match category {
            BackupCategory::Daily => self.daily,
            BackupCategory::Weekly => self.weekly,
            BackupCategory::Monthly => self.monthly,
            BackupCategory::Yearly => self.yearly,
            BackupCategory::Emergency => self.emergency,
            BackupCategory::Manual => self.manual,
        }
    }

    pub fn set_limit(&mut self, category: BackupCategory, limit: usize) {
        match category {
            BackupCategory::Daily => self.daily = limit,
            BackupCategory::Weekly => self.weekly = limit,
            BackupCategory::Monthly => self.monthly = limit,
            BackupCategory::Yearly => self.yearly = limit,
            BackupCategory::Emergency => self.emergency = limit,
            BackupCategory::Manual => self.manual = limit,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            backup_timeout_secs: default_backup_timeout(),
            restore_timeout_secs: default_restore_timeout(),
        }
    }
}

impl LimitsConfig {
    pub fn backup_timeout(&self) -> Duration {
        Duration::from_secs(self.backup_timeout_secs)
    }

    pub fn restore_timeout(&self) -> Duration {
        Duration::from_secs(self.restore_timeout_secs)
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl ScheduleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file, applying environment overrides.
    pub fn from_file(path: &Path) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| EngineError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string, without environment overrides.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration with defaults for everything but the two roots and the protected items.
    pub fn new(live_root: PathBuf, backup_root: PathBuf, protected: Vec<ProtectedItem>) -> Self {
        Config {
            engine: EngineConfig {
                live_root,
                backup_root,
                staging_root: None,
            },
            protected,
            compression: CompressionConfig::default(),
            retention: RetentionConfig::default(),
            schedule: default_schedules(),
            limits: LimitsConfig::default(),
            log: LogConfig::default(),
        }
    }

    /// Create a default configuration
    pub fn default() -> Self {
        Config::new(
            PathBuf::from("/var/lib/dashboard/data"),
            PathBuf::from("/var/lib/dashboard/backups"),
            vec![
                ProtectedItem::file("colleges.json"),
                ProtectedItem::file("account-managers.json"),
                ProtectedItem::file("users.json"),
                ProtectedItem::directory("reports"),
            ],
        )
    }

    pub fn staging_root(&self) -> PathBuf {
        self.engine
            .staging_root
            .clone()
            .unwrap_or_else(|| self.engine.backup_root.join(".staging"))
    }

    /// Render as TOML (used by `backup-engine config`).
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        let live = &resolve_config_path(&self.engine.live_root)?;
        let backups = &resolve_config_path(&self.engine.backup_root)?;
        let staging = resolve_config_path(&self.staging_root())?;

        if live == backups {
            return Err(EngineError::Config(
                "backup_root must differ from live_root".into(),
            ));
        }
        if staging.starts_with(live) {
            return Err(EngineError::Config(
                "staging_root must not be the live_root or inside it".into(),
            ));
        }
        for item in &self.protected {
            if backups.starts_with(item.source_path(live)) {
                return Err(EngineError::Config(format!(
                    "backup_root lies inside protected item {}",
                    item.key()
                )));
            }
        }
        validate_items(&self.protected)?;

        if self.compression.algorithm == CompressionAlgorithm::Zstd
            && !(1..=22).contains(&self.compression.level)
        {
            return Err(EngineError::Config(format!(
                "zstd level must be between 1 and 22, got {}",
                self.compression.level
            )));
        }

        for category in BackupCategory::ALL {
            if self.retention.limit(category) == 0 {
                return Err(EngineError::Config(format!(
                    "retention for {} must keep at least one backup",
                    category
                )));
            }
        }

        for schedule in &self.schedule {
            if schedule.interval_secs == 0 {
                return Err(EngineError::Config(format!(
                    "schedule interval for {} must be positive",
                    schedule.category
                )));
            }
        }

        if self.limits.backup_timeout_secs == 0 || self.limits.restore_timeout_secs == 0 {
            return Err(EngineError::Config("timeouts must be positive".into()));
        }

        Ok(())
    }
}

fn resolve_config_path(path: &Path) -> Result<PathBuf> {
    crate::fs::resolve_path(path)
        .map_err(|e| EngineError::Config(format!("cannot resolve {}: {}", path.display(), e)))
}
