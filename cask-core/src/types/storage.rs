//! Storage pool and volume domain types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle state of a storage pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolState {
    /// Created on some members only.
    Pending,
    /// Fully created.
    #[default]
    Created,
    /// Creation failed on at least one member.
    Errored,
}

impl PoolState {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Created => "created",
            Self::Errored => "errored",
        }
    }

    /// Parse from string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "created" => Some(Self::Created),
            "errored" => Some(Self::Errored),
            _ => None,
        }
    }
}

/// A storage pool row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolRecord {
    pub id: i64,
    pub name: String,
    /// Driver name (e.g. `dir`, `ceph`).
    pub driver: String,
    pub description: String,
    pub state: PoolState,
    pub config: HashMap<String, String>,
}

/// Kind of volume held by a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeType {
    Container,
    Vm,
    Custom,
    Image,
    Bucket,
}

impl VolumeType {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::Vm => "vm",
            Self::Custom => "custom",
            Self::Image => "image",
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
            "image" => Some(Self::Image),
            "bucket" => Some(Self::Bucket),
            _ => None,
        }
    }

    /// Volume type backing instances of the given kind.
    pub fn for_instance(instance_type: crate::types::InstanceType) -> Self {
        match instance_type {
            crate::types::InstanceType::Container => Self::Container,
            crate::types::InstanceType::VirtualMachine => Self::Vm,
        }
    }
}

impl std::fmt::Display for VolumeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Content type of a volume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    /// Mountable filesystem.
    #[default]
    Fs,
    /// Raw block device.
    Block,
}

impl ContentType {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fs => "fs",
            Self::Block => "block",
        }
    }

    /// Parse from string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "fs" | "filesystem" => Some(Self::Fs),
            "block" => Some(Self::Block),
            _ => None,
        }
    }
}

/// Node id recorded for volumes on remote (shared) pools.
pub const VOLUME_NODE_REMOTE: i64 = -1;

/// A volume row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub id: i64,
    pub pool_id: i64,
    pub project: String,
    pub name: String,
    pub volume_type: VolumeType,
    pub content_type: ContentType,
    /// Owning cluster member row id, or [`VOLUME_NODE_REMOTE`] for volumes
    /// on remote pools.
    pub node_id: i64,
    pub config: HashMap<String, String>,
}
