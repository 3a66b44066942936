//! Integrity validation of stored backups and restore staging directories.
//!
//! Validation is read-only and idempotent: it recomputes every entry's
//! checksum and size and reports the entries that disagree with the
//! manifest. Stored items are hashed twice in one pass, once as stored
//! bytes and once after decompression.

use crate::checksum::{self, HashingReader};
use crate::compression::decoder_for;
use crate::manifest::{BackupManifest, ManifestEntry};
use crate::storage::{join_key, StorageBackend};
use crate::utils::errors::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{debug, warn};

/// Mismatch name used when the manifest itself is not self-consistent.
pub const MANIFEST_MISMATCH: &str = "manifest";

/// Where the bytes described by a manifest live.
#[derive(Debug, Clone, Copy)]
pub enum Location<'a> {
    /// A backup directory in the storage backend, compressed with the
    /// algorithm recorded in the manifest.
    Stored(&'a str),

    /// An uncompressed tree on the local filesystem, such as a restore staging directory.
    Plain(&'a Path),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub backup_id: String,
    pub valid: bool,
    pub checked: usize,
    /// Entry paths that failed, plus `manifest` for an inconsistent manifest
    pub mismatches: Vec<String>,
}

enum Outcome {
    Ok,
    Tolerated,
    Mismatch(String),
}

pub struct IntegrityValidator {
    storage: Arc<dyn StorageBackend>,
}

impl IntegrityValidator {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    pub async fn validate(
        &self,
        location: Location<'_>,
        manifest: &BackupManifest,
    ) -> Result<ValidationReport> {
        let mut mismatches = Vec::new();

        let problems = manifest.consistency_problems();
        if !problems.is_empty() {
            warn!(backup_id = %manifest.backup_id, "Manifest inconsistent: {}", problems.join("; "));
            mismatches.push(MANIFEST_MISMATCH.to_string());
        }

        for (path, entry) in &manifest.entries {
            let outcome = match location {
                Location::Stored(prefix) => self.check_stored(prefix, path, entry, manifest).await?,
                Location::Plain(root) => check_plain(root, path, entry).await?,
            };

            match outcome {
                Outcome::Ok => {}
                Outcome::Tolerated => {
                    debug!(path = %path, "Zero-size entry missing from storage, tolerated")
                }
                Outcome::Mismatch(reason) => {
                    warn!(backup_id = %manifest.backup_id, path = %path, "Integrity mismatch: {}", reason);
                    mismatches.push(path.clone());
                }
            }
        }

        Ok(ValidationReport {
            backup_id: manifest.backup_id.clone(),
            valid: mismatches.is_empty(),
            checked: manifest.entries.len(),
            mismatches,
        })
    }

    async fn check_stored(
        &self,
        prefix: &str,
        path: &str,
        entry: &ManifestEntry,
        manifest: &BackupManifest,
    ) -> Result<Outcome> {
        let Some(reader) = self.storage.reader(&join_key(&[prefix, path])).await? else {
            return Ok(missing(entry));
        };

        let decoder = decoder_for(manifest.compression);
        let mut stored = HashingReader::new(reader);

        let decoded = {
            let mut content =
                HashingReader::new(decoder.decode_reader(Box::pin(BufReader::new(&mut stored))));
            match tokio::io::copy(&mut content, &mut tokio::io::sink()).await {
                Ok(_) => Ok(content.finish()),
                Err(e) => Err(e),
            }
        };

        let (content_checksum, content_size) = match decoded {
            Ok(result) => result,
            Err(e) => return Ok(Outcome::Mismatch(format!("corrupt data: {}", e))),
        };
        let (stored_checksum, stored_size) = stored.finish();

        if let Some(expected) = &entry.stored_checksum {
            if &stored_checksum != expected || stored_size != entry.stored_size {
                return Ok(Outcome::Mismatch(format!(
                    "stored bytes changed ({} bytes, expected {})",
                    stored_size, entry.stored_size
                )));
            }
        }

        Ok(compare(entry, &content_checksum, content_size))
    }
}

async fn check_plain(root: &Path, path: &str, entry: &ManifestEntry) -> Result<Outcome> {
    let mut full = root.to_path_buf();
    for segment in path.split('/') {
        full.push(segment);
    }

    let file = match tokio::fs::File::open(&full).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(missing(entry)),
        Err(e) => return Err(e.into()),
    };

    let (content_checksum, content_size) = checksum::digest_reader(file).await?;
    Ok(compare(entry, &content_checksum, content_size))
}

fn missing(entry: &ManifestEntry) -> Outcome {
    if entry.size == 0 {
        Outcome::Tolerated
    } else {
        Outcome::Mismatch("missing".to_string())
    }
}

fn compare(entry: &ManifestEntry, checksum: &str, size: u64) -> Outcome {
    if size != entry.size {
        Outcome::Mismatch(format!("size {} != {}", size, entry.size))
    } else if checksum != entry.checksum {
        Outcome::Mismatch("checksum differs".to_string())
    } else {
        Outcome::Ok
    }
}
