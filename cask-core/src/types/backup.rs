//! Backup domain types.

use serde::{Deserialize, Serialize};

/// What a backup archive contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Container,
    Vm,
    Custom,
    Bucket,
}

impl BackupType {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::Vm => "vm",
            Self::Custom => "custom",
            Self::Bucket => "bucket",
        }
    }

    /// Parse from string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "container" => Some(Self::Container),
            "vm" => Some(Self::Vm),
            "custom" => Some(Self::Custom),
            "bucket" => Some(Self::Bucket),
            _ => None,
        }
    }

    /// Backup type for an instance kind.
    pub fn for_instance(instance_type: crate::types::InstanceType) -> Self {
        match instance_type {
            crate::types::InstanceType::Container => Self::Container,
            crate::types::InstanceType::VirtualMachine => Self::Vm,
        }
    }
}

impl std::fmt::Display for BackupType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a backup row is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupParent {
    /// Instance row id.
    Instance(i64),
    /// Volume row id.
    Volume(i64),
    /// Bucket volume row id.
    Bucket(i64),
}

/// A backup row.
#[derive(Debug, Clone)]
pub struct BackupRecord {
    pub id: i64,
    pub parent: BackupParent,
    /// Backup name, unique per parent.
    pub name: String,
    pub creation_date: i64,
    /// Unix timestamp after which the backup is pruned, if any.
    pub expiry_date: Option<i64>,
    /// Skip snapshots (instance-only / volume-only).
    pub instance_only: bool,
    /// Use the driver's own on-disk format instead of a generic tar.
    pub optimized_storage: bool,
    /// Explicit compression algorithm, empty for the configured default.
    pub compression_algorithm: String,
}

/// Structured data serialised into `backup/index.yaml` at the root of every
/// backup tarball.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupIndex {
    pub name: String,
    pub pool: String,
    /// Storage driver that produced the archive.
    pub backend: String,
    #[serde(rename = "type")]
    pub backup_type: BackupType,
    pub optimized_storage: bool,
    pub optimized_header: bool,
    #[serde(default)]
    pub snapshots: Vec<String>,
    pub config: BackupConfig,
}

/// Restorable metadata carried inside the index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupConfig {
    /// The instance row, for instance backups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<crate::types::InstanceRecord>,

    /// Snapshot rows included in the archive.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snapshots: Vec<crate::types::InstanceRecord>,

    /// The volume row, for custom volume backups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<crate::types::VolumeRecord>,

    /// The bucket name, for bucket backups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_type() {
        assert_eq!(BackupType::parse("vm"), Some(BackupType::Vm));
        assert_eq!(BackupType::Bucket.as_str(), "bucket");
        assert_eq!(
            BackupType::for_instance(crate::types::InstanceType::Container),
            BackupType::Container
        );
    }
}
