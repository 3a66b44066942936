use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Retention bucket a backup belongs to. Each bucket has its own retention count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupCategory {
    Daily,
    Weekly,
    Monthly,
    Yearly,
    Emergency,
    Manual,
}

impl BackupCategory {
    pub const ALL: [BackupCategory; 6] = [
        BackupCategory::Daily,
        BackupCategory::Weekly,
        BackupCategory::Monthly,
        BackupCategory::Yearly,
        BackupCategory::Emergency,
        BackupCategory::Manual,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackupCategory::Daily => "daily",
            BackupCategory::Weekly => "weekly",
            BackupCategory::Monthly => "monthly",
            BackupCategory::Yearly => "yearly",
            BackupCategory::Emergency => "emergency",
            BackupCategory::Manual => "manual",
        }
    }

    /// Manual and emergency backups only go away when cleanup explicitly includes them.
    pub fn is_exempt_from_cleanup(&self) -> bool {
        matches!(self, BackupCategory::Manual | BackupCategory::Emergency)
    }
}

impl fmt::Display for BackupCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackupCategory::ALL
            .iter()
            .copied()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown backup category: {}", s))
    }
}
