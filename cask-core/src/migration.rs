//! Migration wire negotiation.
//!
//! Senders and receivers each advertise an ordered list of
//! (filesystem-type, feature-flags) pairs; the first entry is the preferred
//! wire format. The chosen transport is the receiver's first type also
//! offered by the sender, with the feature set intersected. An rsync-style
//! stream is the universal fallback every driver must offer.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Wire format of a migration stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationFsType {
    /// Generic file+delta stream. Universal fallback.
    Rsync,
    /// Raw block stream plus rsync for the filesystem config.
    BlockAndRsync,
    /// Driver-native snapshot stream (e.g. a send/receive pipe).
    Native,
}

impl MigrationFsType {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rsync => "rsync",
            Self::BlockAndRsync => "block-and-rsync",
            Self::Native => "native",
        }
    }
}

/// One negotiable transport offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationType {
    pub fs_type: MigrationFsType,
    pub features: Vec<String>,
}

/// Negotiated transfer parameters for a migration sink.
#[derive(Debug, Clone, Default)]
pub struct SinkArgs {
    /// Source operation URL (pull mode dials it).
    pub url: String,
    /// Push mode: the sink exposes the websocket instead of dialing.
    pub push: bool,
    /// Request in-flight memory/state transfer.
    pub live: bool,
    /// Skip snapshots entirely.
    pub instance_only: bool,
    /// Delta transfer onto an existing instance.
    pub refresh: bool,
    /// During refresh, do not backfill snapshots older than the newest
    /// snapshot already on the target.
    pub refresh_exclude_older: bool,
    /// Set when this is an internal cluster move (same instance name).
    pub cluster_move_source_name: String,
    /// Target storage pool override.
    pub storage_pool: String,
    /// Websocket secrets by connection name.
    pub secrets: HashMap<String, String>,
}

/// Wire transport seam. The stream implementation (websockets, rsync
/// sessions, driver pipes) lives outside this crate; the lifecycle hands it
/// a prepared instance record, the sink arguments and the local transport
/// offers.
#[async_trait::async_trait]
pub trait MigrationTransport: Send + Sync {
    /// Run the sink side of a transfer onto the prepared instance volume.
    async fn receive(
        &self,
        record: &crate::types::InstanceRecord,
        args: &SinkArgs,
        offers: &[MigrationType],
    ) -> crate::error::Result<()>;
}

/// Pick the transport: the first local offer the remote also supports, with
/// features intersected.
pub fn negotiate(local: &[MigrationType], remote: &[MigrationType]) -> Option<MigrationType> {
    for ours in local {
        if let Some(theirs) = remote.iter().find(|t| t.fs_type == ours.fs_type) {
            let features = ours
                .features
                .iter()
                .filter(|f| theirs.features.contains(f))
                .cloned()
                .collect();

            return Some(MigrationType { fs_type: ours.fs_type, features });
        }
    }

    None
}

/// A snapshot as seen by refresh negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub name: String,
    pub creation_date: i64,
}

/// Work out the snapshot delta for a transfer.
///
/// Without refresh everything is sent. With refresh, only source snapshots
/// missing on the target are sent and target snapshots absent from the
/// source are deleted. `refresh_exclude_older` additionally suppresses
/// source snapshots created before the target's newest snapshot.
pub fn snapshots_to_transfer(
    source: &[SnapshotEntry],
    target: &[SnapshotEntry],
    refresh: bool,
    refresh_exclude_older: bool,
) -> (Vec<String>, Vec<String>) {
    if !refresh {
        return (source.iter().map(|s| s.name.clone()).collect(), Vec::new());
    }

    let newest_target = target.iter().map(|s| s.creation_date).max().unwrap_or(0);

    let send = source
        .iter()
        .filter(|s| !target.iter().any(|t| t.name == s.name))
        .filter(|s| !refresh_exclude_older || s.creation_date >= newest_target)
        .map(|s| s.name.clone())
        .collect();

    let delete = target
        .iter()
        .filter(|t| !source.iter().any(|s| s.name == t.name))
        .map(|t| t.name.clone())
        .collect();

    (send, delete)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(fs_type: MigrationFsType, features: &[&str]) -> MigrationType {
        MigrationType {
            fs_type,
            features: features.iter().map(|f| f.to_string()).collect(),
        }
    }

    fn snap(name: &str, creation_date: i64) -> SnapshotEntry {
        SnapshotEntry { name: name.to_string(), creation_date }
    }

    #[test]
    fn test_negotiate_prefers_first_local_offer() {
        let local = vec![
            offer(MigrationFsType::Native, &["compress"]),
            offer(MigrationFsType::Rsync, &["xattrs", "delete"]),
        ];
        let remote = vec![offer(MigrationFsType::Rsync, &["delete"])];

        let chosen = negotiate(&local, &remote).unwrap();
        assert_eq!(chosen.fs_type, MigrationFsType::Rsync);
        assert_eq!(chosen.features, vec!["delete"]);
    }

    #[test]
    fn test_negotiate_native_when_both_support() {
        let local = vec![
            offer(MigrationFsType::Native, &["compress"]),
            offer(MigrationFsType::Rsync, &[]),
        ];
        let remote = vec![
            offer(MigrationFsType::Native, &["compress"]),
            offer(MigrationFsType::Rsync, &[]),
        ];

        assert_eq!(negotiate(&local, &remote).unwrap().fs_type, MigrationFsType::Native);
    }

    #[test]
    fn test_negotiate_no_overlap() {
        let local = vec![offer(MigrationFsType::Native, &[])];
        let remote = vec![offer(MigrationFsType::Rsync, &[])];
        assert!(negotiate(&local, &remote).is_none());
    }

    #[test]
    fn test_refresh_sends_only_missing() {
        let source = vec![
            snap("snap1", 100),
            snap("snap2", 200),
            snap("snap3", 300),
            snap("snap4", 400),
            snap("snap5", 500),
        ];
        let target = vec![snap("snap1", 100), snap("snap2", 200), snap("snap3", 300)];

        let (send, delete) = snapshots_to_transfer(&source, &target, true, false);
        assert_eq!(send, vec!["snap4", "snap5"]);
        assert!(delete.is_empty());
    }

    #[test]
    fn test_refresh_exclude_older() {
        let source = vec![snap("old", 50), snap("new", 500)];
        let target = vec![snap("current", 300)];

        let (send, delete) = snapshots_to_transfer(&source, &target, true, true);
        assert_eq!(send, vec!["new"]);
        assert_eq!(delete, vec!["current"]);
    }

    #[test]
    fn test_no_refresh_sends_everything() {
        let source = vec![snap("snap1", 100)];
        let target = vec![snap("other", 50)];

        let (send, delete) = snapshots_to_transfer(&source, &target, false, false);
        assert_eq!(send, vec!["snap1"]);
        assert!(delete.is_empty());
    }
}
