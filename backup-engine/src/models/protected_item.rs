use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    File,
    Directory,
}

/// A file or directory under the live-data root that every backup captures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedItem {
    /// Path relative to the live-data root, `/`-separated (`colleges.json`, `reports`).
    pub name: String,
    pub kind: ItemKind,
}

impl ProtectedItem {
    pub fn file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ItemKind::File,
        }
    }

    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ItemKind::Directory,
        }
    }

    /// Name without leading or trailing separators, as used in manifests and storage keys.
    pub fn key(&self) -> &str {
        self.name.trim_matches('/')
    }

    /// Absolute source path under `live_root`.
    pub fn source_path(&self, live_root: &Path) -> PathBuf {
        let mut path = live_root.to_path_buf();
        for segment in self.name.split('/').filter(|s| !s.is_empty()) {
            path.push(segment);
        }
        path
    }

    pub fn validate(&self) -> Result<()> {
        let name = self.key();
        if name.is_empty() {
            return Err(EngineError::Config("protected item name must not be empty".into()));
        }
        if name == "manifest.json" {
            return Err(EngineError::Config(
                "manifest.json is reserved and cannot be a protected item".into(),
            ));
        }
        let normal = Path::new(name)
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !normal || name.contains('\\') {
            return Err(EngineError::Config(format!(
                "protected item must be a plain relative path: {}",
                self.name
            )));
        }
        if name.split('/').any(|s| s.starts_with('.')) {
            return Err(EngineError::Config(format!(
                "protected item must not be hidden: {}",
                self.name
            )));
        }
        Ok(())
    }
}

/// Validate a full set of protected items: each valid, no duplicates, no item nested in another.
pub fn validate_items(items: &[ProtectedItem]) -> Result<()> {
    for item in items {
        item.validate()?;
    }
    for (i, a) in items.iter().enumerate() {
        for b in items.iter().skip(i + 1) {
            let (a_name, b_name) = (a.key(), b.key());
            if a_name == b_name {
                return Err(EngineError::Config(format!("duplicate protected item: {}", a_name)));
            }
            let nested = b_name.starts_with(&format!("{}/", a_name))
                || a_name.starts_with(&format!("{}/", b_name));
            if nested {
                return Err(EngineError::Config(format!(
                    "protected items overlap: {} and {}",
                    a_name, b_name
                )));
            }
        }
    }
    Ok(())
}
