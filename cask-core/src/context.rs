//! Daemon-wide state handed to the subsystems.
//!
//! Bundles the database façade, the local member identity, global config
//! and the collaborator seams (runtime, firewall, OVN, cluster clients,
//! placement policy). Out-of-scope subsystems only appear here as trait
//! objects.

use std::path::PathBuf;
use std::sync::Arc;

use crate::acl::{Firewall, OvnNorth};
use crate::cluster::ClientConnector;
use crate::instance::runtime::InstanceRuntime;
use crate::placement::PlacementPolicy;
use crate::state::StateManager;
use crate::storage::DriverRegistry;

/// Cluster-wide configuration the core consumes.
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    /// Seconds without heartbeat before a member counts as offline.
    pub offline_threshold: i64,
    /// Default backup compression algorithm.
    pub backups_compression_algorithm: String,
    /// Fallback architecture when none can be derived from the source.
    pub images_default_architecture: String,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            offline_threshold: 20,
            backups_compression_algorithm: "gzip".to_string(),
            images_default_architecture: String::new(),
        }
    }
}

/// Shared daemon state.
pub struct State {
    pub db: Arc<StateManager>,
    /// Root of the on-disk layout (instances, backups, pools, logs).
    pub data_dir: PathBuf,
    /// This member's name.
    pub server_name: String,
    /// Whether this server is part of a cluster.
    pub clustered: bool,
    pub global: GlobalConfig,
    /// Architectures this member can run.
    pub architectures: Vec<String>,
    pub drivers: DriverRegistry,
    pub runtime: Arc<dyn InstanceRuntime>,
    pub firewall: Arc<dyn Firewall>,
    pub ovn: Option<Arc<dyn OvnNorth>>,
    pub connector: Arc<dyn ClientConnector>,
    pub placement_policy: Option<Arc<dyn PlacementPolicy>>,
    pub migration: Arc<dyn crate::migration::MigrationTransport>,
    /// OVN controller log file scanned by ACL log retrieval.
    pub ovn_log_path: PathBuf,
}

impl State {
    /// Whether the local member is evacuated (no new instances).
    pub async fn local_member_evacuated(&self) -> bool {
        if !self.clustered {
            return false;
        }

        match self.db.get_member(&self.server_name).await {
            Ok(member) => member.evacuated,
            Err(_) => false,
        }
    }
}
