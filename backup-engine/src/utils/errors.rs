//! Custom error types for the backup engine.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A protected item could not be read at backup time. Recorded as absent, not fatal to a run.
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// Writing into the backup root failed (disk full, permissions).
    #[error("Write failure: {0}")]
    WriteFailure(String),

    #[error("Validation mismatch: {0}")]
    ValidationMismatch(String),

    /// Decompression failed outright.
    #[error("Corrupt data: {0}")]
    CorruptData(String),

    #[error("Backup not found: {0}")]
    NotFound(String),

    #[error("Failed to delete backup {backup_id}: {reason}")]
    RetentionDeleteFailure { backup_id: String, reason: String },

    #[error("Backup failed: {0}")]
    BackupFailed(String),

    #[error("Backup {backup_id} failed integrity validation: {}", mismatches.join(", "))]
    CorruptBackup {
        backup_id: String,
        mismatches: Vec<String>,
    },

    #[error("Restored data failed verification: {}", mismatches.join(", "))]
    RestoreVerificationFailed { mismatches: Vec<String> },

    #[error("Restore failed: {0}")]
    RestoreFailed(String),

    #[error("A {0} backup is already running")]
    AlreadyRunning(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Operation cancelled")]
    Cancelled,
}

impl EngineError {
    /// True for errors that mean stored or staged bytes do not match their manifest.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            EngineError::ValidationMismatch(_)
                | EngineError::CorruptData(_)
                | EngineError::CorruptBackup { .. }
                | EngineError::RestoreVerificationFailed { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
