//! Collaborator wiring for standalone servers.
//!
//! The hypervisor runtime, firewall backend, OVN northbound and cluster
//! transport ship as separate integrations; a standalone daemon runs with
//! these placeholders until one is configured.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use cask_core::acl::{AclUsage, Firewall};
use cask_core::cluster::{ClientConnector, MemberClient};
use cask_core::device::RunConfig;
use cask_core::error::{CaskError, Result};
use cask_core::instance::runtime::InstanceRuntime;
use cask_core::migration::{MigrationTransport, MigrationType, SinkArgs};
use cask_core::types::{InstanceRecord, Member};

/// Runtime placeholder: every process operation reports that no runtime
/// integration is configured.
pub struct NoRuntime;

#[async_trait]
impl InstanceRuntime for NoRuntime {
    async fn start(&self, _project: &str, _name: &str, _run: &RunConfig) -> Result<()> {
        Err(CaskError::Unavailable("No instance runtime is configured".to_string()))
    }

    async fn stop(&self, _project: &str, _name: &str, _force: bool) -> Result<()> {
        Err(CaskError::Unavailable("No instance runtime is configured".to_string()))
    }

    async fn shutdown(&self, _project: &str, _name: &str, _timeout: Duration) -> Result<()> {
        Err(CaskError::Unavailable("No instance runtime is configured".to_string()))
    }

    fn is_running(&self, _project: &str, _name: &str) -> bool {
        false
    }

    fn is_frozen(&self, _project: &str, _name: &str) -> bool {
        false
    }
}

/// Firewall placeholder: records the intent in the log only.
pub struct LogOnlyFirewall;

#[async_trait]
impl Firewall for LogOnlyFirewall {
    async fn apply_address_sets(
        &self,
        table_family: &str,
        project: &str,
        acl_names: &[String],
    ) -> Result<()> {
        info!(table_family, project, acls = ?acl_names, "Would apply address sets");
        Ok(())
    }

    async fn apply_acl_rules(&self, project: &str, usage: &AclUsage) -> Result<()> {
        info!(project, network = %usage.network.name, "Would apply ACL rules");
        Ok(())
    }

    async fn update_bridge_acls(&self, project: &str, usages: &[AclUsage]) -> Result<()> {
        info!(project, count = usages.len(), "Would update bridge ACLs");
        Ok(())
    }
}

/// Cluster connector placeholder for standalone servers.
pub struct NoCluster;

impl ClientConnector for NoCluster {
    fn connect(&self, member: &Member) -> Result<Arc<dyn MemberClient>> {
        Err(CaskError::Unavailable(format!(
            "Clustering is not configured; cannot reach member {:?}",
            member.name
        )))
    }
}

/// Migration transport placeholder for standalone servers.
pub struct NoTransport;

#[async_trait]
impl MigrationTransport for NoTransport {
    async fn receive(
        &self,
        _record: &InstanceRecord,
        _args: &SinkArgs,
        _offers: &[MigrationType],
    ) -> Result<()> {
        Err(CaskError::Unavailable("No migration transport is configured".to_string()))
    }
}
