//! Backup Engine Library
//!
//! Point-in-time, compressed and checksummed copies of a directory of JSON
//! documents, with per-category retention and restores that go through a
//! validated staging directory before anything touches live data.

pub mod catalog;
pub mod checksum;
pub mod compression;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod fs;
pub mod integrity;
pub mod manifest;
pub mod models;
pub mod restore;
pub mod retention;
pub mod scheduler;
pub mod storage;
pub mod utils;
pub mod writer;

// Re-export commonly used types
pub use catalog::{BackupCatalog, BackupStats};
pub use config::Config;
pub use engine::BackupEngine;
pub use integrity::ValidationReport;
pub use manifest::{BackupManifest, BackupSummary};
pub use models::{BackupCategory, ProtectedItem};
pub use restore::StagingHandle;
pub use retention::RetentionReport;
pub use utils::errors::{EngineError, Result};
