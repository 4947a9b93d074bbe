//! Network ACL core.
//!
//! Validates rule sets, tracks usage across networks, profiles and instance
//! NICs, applies changes to the firewall/OVN collaborators and aggregates
//! log lines cluster-wide. The firewall and OVN northbound surfaces are
//! seams; only their contracts live here.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, instrument};

use crate::cluster::{Notifier, NotifyMode};
use crate::error::{CaskError, Result};
use crate::revert::{Hook, Reverter};
use crate::types::acl::{split_trimmed, AclRule, NetworkAcl};
use crate::types::NetworkRecord;

/// Valid rule actions.
pub const VALID_ACTIONS: &[&str] = &["allow", "allow-stateless", "drop", "reject"];

/// Valid rule states.
pub const VALID_STATES: &[&str] = &["enabled", "disabled", "logged"];

/// Valid rule protocols.
pub const VALID_PROTOCOLS: &[&str] = &["icmp4", "icmp6", "tcp", "udp"];

/// Reserved subject referring to the network's own managed endpoints.
pub const SUBJECT_INTERNAL: &str = "@internal";
/// Reserved subject referring to everything outside the network.
pub const SUBJECT_EXTERNAL: &str = "@external";

/// Deprecated aliases accepted as input but never emitted.
const SUBJECT_INTERNAL_ALIASES: &[&str] = &[SUBJECT_INTERNAL, "#internal"];
const SUBJECT_EXTERNAL_ALIASES: &[&str] = &[SUBJECT_EXTERNAL, "#external"];

/// Rule direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleDirection {
    Ingress,
    Egress,
}

impl RuleDirection {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Ingress => "ingress",
            Self::Egress => "egress",
        }
    }
}

/// Who is asking: a user request (applies cluster-wide state) or a replayed
/// cluster notification (applies local state only).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientType {
    Normal,
    Notification,
}

/// Mutable ACL fields for an update.
#[derive(Debug, Clone, Default)]
pub struct AclPut {
    pub description: String,
    pub config: HashMap<String, String>,
    pub ingress: Vec<AclRule>,
    pub egress: Vec<AclRule>,
}

/// One network affected by an ACL, with the NIC device name when the usage
/// is indirect through an instance device.
#[derive(Debug, Clone)]
pub struct AclUsage {
    pub network: NetworkRecord,
    pub device_name: Option<String>,
}

/// Firewall collaborator applying rules on this member.
#[async_trait]
pub trait Firewall: Send + Sync {
    /// Materialise address-set objects referenced by the named ACLs.
    async fn apply_address_sets(
        &self,
        table_family: &str,
        project: &str,
        acl_names: &[String],
    ) -> Result<()>;

    /// Apply an ACL's rules for one network on this member.
    async fn apply_acl_rules(&self, project: &str, usage: &AclUsage) -> Result<()>;

    /// Apply bridge interface filter rules for NIC-indirect usages.
    async fn update_bridge_acls(&self, project: &str, usages: &[AclUsage]) -> Result<()>;
}

/// OVN northbound collaborator (cluster-wide state, applied once).
#[async_trait]
pub trait OvnNorth: Send + Sync {
    /// Ensure port groups exist for the ACL (and any referenced ACLs) on
    /// the affected networks. Returns a cleanup hook for the reverter.
    async fn ensure_acls(
        &self,
        project: &str,
        acl_name_ids: &HashMap<String, i64>,
        networks: &[AclUsage],
        acl_names: &[String],
    ) -> Result<Hook>;

    /// Ensure address sets referenced by the ACLs exist. Returns a cleanup
    /// hook for the reverter.
    async fn ensure_address_sets(&self, project: &str, acl_names: &[String]) -> Result<Hook>;

    /// Remove port groups that stopped being referenced.
    async fn delete_unused_port_groups(&self, project: &str, keep_acl: &str) -> Result<()>;
}

/// A loaded network ACL.
pub struct Acl {
    id: i64,
    project: String,
    info: NetworkAcl,
}

/// Load an ACL by name, normalising its rules.
pub async fn load_by_name(
    state: &crate::context::State,
    project: &str,
    name: &str,
) -> Result<Acl> {
    let mut info = state.db.get_acl(project, name).await?;

    for rule in info.ingress.iter_mut().chain(info.egress.iter_mut()) {
        rule.normalise();
    }

    Ok(Acl { id: info.id, project: project.to_string(), info })
}

/// Create an ACL after validating its rule set.
pub async fn create(
    state: &crate::context::State,
    project: &str,
    name: &str,
    put: &AclPut,
) -> Result<Acl> {
    let mut acl = Acl {
        id: 0,
        project: project.to_string(),
        info: NetworkAcl {
            id: 0,
            project: project.to_string(),
            name: name.to_string(),
            description: put.description.clone(),
            config: put.config.clone(),
            ingress: put.ingress.clone(),
            egress: put.egress.clone(),
        },
    };

    let mut put = put.clone();
    acl.validate_config(state, &mut put).await?;
    acl.info.ingress = put.ingress;
    acl.info.egress = put.egress;

    let id = state.db.insert_acl(&acl.info).await?;
    acl.id = id;
    acl.info.id = id;

    info!(project, acl = name, "Created network ACL");
    Ok(acl)
}

impl Acl {
    /// The ACL's database id.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// The ACL's name.
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Copy of the ACL's contents.
    pub fn info(&self) -> NetworkAcl {
        self.info.clone()
    }

    /// Validate a full config update. Rules are normalised in place first so
    /// duplicate detection compares canonical forms.
    pub async fn validate_config(
        &self,
        state: &crate::context::State,
        put: &mut AclPut,
    ) -> Result<()> {
        for (key, _) in &put.config {
            if !crate::types::is_user_config(key) {
                return Err(CaskError::BadRequest(format!("Invalid config option {:?}", key)));
            }
        }

        for rule in put.ingress.iter_mut().chain(put.egress.iter_mut()) {
            rule.normalise();
        }

        let valid_subject_names = self.valid_subject_names(state).await?;

        for (i, rule) in put.ingress.iter().enumerate() {
            self.validate_rule(state, RuleDirection::Ingress, rule, &valid_subject_names)
                .await
                .map_err(|e| {
                    CaskError::BadRequest(format!("Invalid ingress rule {}: {}", i, e))
                })?;

            for (ri, other) in put.ingress.iter().enumerate() {
                if ri != i && other == rule {
                    return Err(CaskError::BadRequest(format!(
                        "Duplicate of ingress rule {}",
                        i
                    )));
                }
            }
        }

        for (i, rule) in put.egress.iter().enumerate() {
            self.validate_rule(state, RuleDirection::Egress, rule, &valid_subject_names)
                .await
                .map_err(|e| CaskError::BadRequest(format!("Invalid egress rule {}: {}", i, e)))?;

            for (ri, other) in put.egress.iter().enumerate() {
                if ri != i && other == rule {
                    return Err(CaskError::BadRequest(format!(
                        "Duplicate of egress rule {}",
                        i
                    )));
                }
            }
        }

        Ok(())
    }

    /// Names valid as ACL rule subjects: the reserved subjects plus every
    /// ACL in the project.
    async fn valid_subject_names(&self, state: &crate::context::State) -> Result<Vec<String>> {
        let acls = state.db.get_acl_ids_by_names(&self.project).await?;

        let mut names: Vec<String> = SUBJECT_INTERNAL_ALIASES
            .iter()
            .chain(SUBJECT_EXTERNAL_ALIASES.iter())
            .map(|s| s.to_string())
            .collect();

        names.extend(acls.into_keys());
        Ok(names)
    }

    /// Validate one rule.
    async fn validate_rule(
        &self,
        state: &crate::context::State,
        direction: RuleDirection,
        rule: &AclRule,
        valid_subject_names: &[String],
    ) -> Result<()> {
        if !VALID_ACTIONS.contains(&rule.action.as_str()) {
            return Err(CaskError::BadRequest(format!(
                "Action must be one of: {}",
                VALID_ACTIONS.join(", ")
            )));
        }

        if !VALID_STATES.contains(&rule.state.as_str()) {
            return Err(CaskError::BadRequest(format!(
                "State must be one of: {}",
                VALID_STATES.join(", ")
            )));
        }

        let mut src = SubjectKinds::default();
        let mut dst = SubjectKinds::default();

        if !rule.source.is_empty() {
            src = self
                .validate_rule_subjects(
                    state,
                    "Source",
                    direction,
                    &split_trimmed(&rule.source),
                    valid_subject_names,
                )
                .await
                .map_err(|e| CaskError::BadRequest(format!("Invalid Source: {}", e)))?;
        }

        if !rule.destination.is_empty() {
            dst = self
                .validate_rule_subjects(
                    state,
                    "Destination",
                    direction,
                    &split_trimmed(&rule.destination),
                    valid_subject_names,
                )
                .await
                .map_err(|e| CaskError::BadRequest(format!("Invalid Destination: {}", e)))?;
        }

        // IP families may not cross between the two ends unless a named
        // subject mediates.
        if !rule.source.is_empty() && !rule.destination.is_empty() {
            let conflict = (src.ipv4 && !dst.ipv4 && !dst.name)
                || (dst.ipv4 && !src.ipv4 && !src.name)
                || (src.ipv6 && !dst.ipv6 && !dst.name)
                || (dst.ipv6 && !src.ipv6 && !src.name);

            if conflict {
                return Err(CaskError::BadRequest(
                    "Conflicting IP family types used for Source and Destination".to_string(),
                ));
            }
        }

        if !rule.protocol.is_empty() && !VALID_PROTOCOLS.contains(&rule.protocol.as_str()) {
            return Err(CaskError::BadRequest(format!(
                "Protocol must be one of: {}",
                VALID_PROTOCOLS.join(", ")
            )));
        }

        match rule.protocol.as_str() {
            "tcp" | "udp" => {
                if !rule.icmp_type.is_empty() {
                    return Err(CaskError::BadRequest(
                        "ICMP type cannot be used with non-ICMP protocol".to_string(),
                    ));
                }

                if !rule.icmp_code.is_empty() {
                    return Err(CaskError::BadRequest(
                        "ICMP code cannot be used with non-ICMP protocol".to_string(),
                    ));
                }

                for port in split_trimmed(&rule.source_port) {
                    crate::validate::is_network_port_range(&port).map_err(|e| {
                        CaskError::BadRequest(format!("Invalid Source port: {}", e))
                    })?;
                }

                for port in split_trimmed(&rule.destination_port) {
                    crate::validate::is_network_port_range(&port).map_err(|e| {
                        CaskError::BadRequest(format!("Invalid Destination port: {}", e))
                    })?;
                }
            }
            "icmp4" | "icmp6" => {
                if !rule.source_port.is_empty() {
                    return Err(CaskError::BadRequest(format!(
                        "Source port cannot be used with {:?} protocol",
                        rule.protocol
                    )));
                }

                if !rule.destination_port.is_empty() {
                    return Err(CaskError::BadRequest(format!(
                        "Destination port cannot be used with {:?} protocol",
                        rule.protocol
                    )));
                }

                if rule.protocol == "icmp4" {
                    if src.ipv6 {
                        return Err(CaskError::BadRequest(format!(
                            "Cannot use IPv6 source addresses with {:?} protocol",
                            rule.protocol
                        )));
                    }

                    if dst.ipv6 {
                        return Err(CaskError::BadRequest(format!(
                            "Cannot use IPv6 destination addresses with {:?} protocol",
                            rule.protocol
                        )));
                    }
                } else {
                    if src.ipv4 {
                        return Err(CaskError::BadRequest(format!(
                            "Cannot use IPv4 source addresses with {:?} protocol",
                            rule.protocol
                        )));
                    }

                    if dst.ipv4 {
                        return Err(CaskError::BadRequest(format!(
                            "Cannot use IPv4 destination addresses with {:?} protocol",
                            rule.protocol
                        )));
                    }
                }

                if !rule.icmp_type.is_empty() {
                    crate::validate::is_uint8(&rule.icmp_type).map_err(|e| {
                        CaskError::BadRequest(format!("Invalid ICMP type: {}", e))
                    })?;
                }

                if !rule.icmp_code.is_empty() {
                    crate::validate::is_uint8(&rule.icmp_code).map_err(|e| {
                        CaskError::BadRequest(format!("Invalid ICMP code: {}", e))
                    })?;
                }
            }
            _ => {
                if !rule.icmp_type.is_empty() {
                    return Err(CaskError::BadRequest(
                        "ICMP type cannot be used without specifying protocol".to_string(),
                    ));
                }

                if !rule.icmp_code.is_empty() {
                    return Err(CaskError::BadRequest(
                        "ICMP code cannot be used without specifying protocol".to_string(),
                    ));
                }

                if !rule.source_port.is_empty() {
                    return Err(CaskError::BadRequest(
                        "Source port cannot be used without specifying protocol".to_string(),
                    ));
                }

                if !rule.destination_port.is_empty() {
                    return Err(CaskError::BadRequest(
                        "Destination port cannot be used without specifying protocol".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Validate the subjects of one end of a rule, returning which kinds
    /// were seen. Named subjects are only allowed in the origin position
    /// (Source for ingress, Destination for egress).
    async fn validate_rule_subjects(
        &self,
        state: &crate::context::State,
        field_name: &str,
        direction: RuleDirection,
        subjects: &[String],
        valid_subject_names: &[String],
    ) -> Result<SubjectKinds> {
        let allow_subject_names = (field_name == "Source"
            && direction == RuleDirection::Ingress)
            || (field_name == "Destination" && direction == RuleDirection::Egress);

        let mut kinds = SubjectKinds::default();

        for subject in subjects {
            let ip_version = crate::validate::network_address_version(subject)
                .or_else(|_| crate::validate::network_cidr_version(subject))
                .or_else(|_| crate::validate::network_range_version(subject))
                .ok();

            if let Some(version) = ip_version {
                match version {
                    4 => kinds.ipv4 = true,
                    _ => kinds.ipv6 = true,
                }

                continue;
            }

            if valid_subject_names.iter().any(|n| n == subject) {
                if !allow_subject_names {
                    return Err(CaskError::BadRequest(format!(
                        "Named subjects not allowed in {:?} for {:?} rules",
                        field_name,
                        direction.as_str()
                    )));
                }

                kinds.name = true;
                continue;
            }

            // Network peer connection reference.
            if subject.starts_with('@') {
                if !allow_subject_names {
                    return Err(CaskError::BadRequest(format!(
                        "Named subjects not allowed in {:?} for {:?} rules",
                        field_name,
                        direction.as_str()
                    )));
                }

                kinds.name = true;
                continue;
            }

            // Address set reference; must exist.
            if let Some(set_name) = subject.strip_prefix('$') {
                if !state.db.address_set_exists(&self.project, set_name).await? {
                    return Err(CaskError::BadRequest(format!(
                        "Failed getting network address set {:?} for subject validation",
                        set_name
                    )));
                }

                kinds.name = true;
                continue;
            }

            return Err(CaskError::BadRequest(format!("Invalid subject {:?}", subject)));
        }

        Ok(kinds)
    }

    /// API endpoints referencing this ACL. Stops at the first hit when
    /// `first_only` is set.
    pub async fn used_by(
        &self,
        state: &crate::context::State,
        first_only: bool,
    ) -> Result<Vec<String>> {
        let mut used_by = Vec::new();
        let suffix = if self.project == "default" {
            String::new()
        } else {
            format!("?project={}", self.project)
        };

        let result = self
            .walk_usage(state, |kind, name| {
                used_by.push(format!("/1.0/{}/{}{}", kind, name, suffix));
                if first_only {
                    return Err(CaskError::InstanceListStop);
                }
                Ok(())
            })
            .await;

        match result {
            Ok(()) | Err(CaskError::InstanceListStop) => Ok(used_by),
            Err(e) => Err(CaskError::Internal(format!("Failed getting ACL usage: {}", e))),
        }
    }

    /// Walk every entity referencing this ACL, invoking `visit(kind, name)`.
    async fn walk_usage(
        &self,
        state: &crate::context::State,
        mut visit: impl FnMut(&str, &str) -> Result<()>,
    ) -> Result<()> {
        for network in state.db.list_networks(&self.project).await? {
            if network.acls().iter().any(|a| a == &self.info.name) {
                visit("networks", &network.name)?;
            }
        }

        for instance in state.db.list_instances(Some(&self.project)).await? {
            let uses = instance.devices.iter().any(|(_, config)| {
                config.get("type").map(String::as_str) == Some("nic")
                    && config
                        .get("security.acls")
                        .map(|v| split_trimmed(v).iter().any(|a| a == &self.info.name))
                        .unwrap_or(false)
            });

            if uses {
                visit("instances", &instance.name)?;
            }
        }

        // Other ACLs referencing this one by name in their rule subjects.
        let acl_ids = state.db.get_acl_ids_by_names(&self.project).await?;
        for (name, _) in acl_ids {
            if name == self.info.name {
                continue;
            }

            let other = state.db.get_acl(&self.project, &name).await?;
            let referenced = other.ingress.iter().map(|r| &r.source).chain(
                other.egress.iter().map(|r| &r.destination),
            );

            if referenced
                .flat_map(|subjects| split_trimmed(subjects))
                .any(|subject| subject == self.info.name)
            {
                visit("network-acls", &name)?;
            }
        }

        Ok(())
    }

    /// Whether any entity references the ACL.
    pub async fn is_used(&self, state: &crate::context::State) -> Result<bool> {
        Ok(!self.used_by(state, true).await?.is_empty())
    }

    /// Networks affected by this ACL: directly assigned, or indirectly via
    /// an instance NIC carrying the ACL.
    async fn network_usage(&self, state: &crate::context::State) -> Result<Vec<AclUsage>> {
        let networks = state.db.list_networks(&self.project).await?;
        let mut usages = Vec::new();

        for network in &networks {
            if network.acls().iter().any(|a| a == &self.info.name) {
                usages.push(AclUsage { network: network.clone(), device_name: None });
            }
        }

        for instance in state.db.list_instances(Some(&self.project)).await? {
            for (dev_name, config) in instance.devices.iter() {
                if config.get("type").map(String::as_str) != Some("nic") {
                    continue;
                }

                let carries_acl = config
                    .get("security.acls")
                    .map(|v| split_trimmed(v).iter().any(|a| a == &self.info.name))
                    .unwrap_or(false);
                if !carries_acl {
                    continue;
                }

                let Some(net_name) = config.get("network") else {
                    continue;
                };

                let Some(network) = networks.iter().find(|n| &n.name == net_name) else {
                    continue;
                };

                let already = usages.iter().any(|u| {
                    u.network.name == network.name && u.device_name.as_deref() == Some(dev_name)
                });
                if !already {
                    usages.push(AclUsage {
                        network: network.clone(),
                        device_name: Some(dev_name.clone()),
                    });
                }
            }
        }

        Ok(usages)
    }

    /// Apply a config update: validate, persist, apply to local networks,
    /// ensure cluster-wide OVN state, then notify the other members.
    #[instrument(skip(self, state, put), fields(project = %self.project, acl = %self.info.name))]
    pub async fn update(
        &mut self,
        state: &crate::context::State,
        put: &AclPut,
        client_type: ClientType,
    ) -> Result<()> {
        let mut put = put.clone();
        self.validate_config(state, &mut put).await?;

        let mut reverter = Reverter::new();
        let result = self.update_inner(state, &put, client_type, &mut reverter).await;

        match result {
            Ok(()) => {
                reverter.success();
                Ok(())
            }
            Err(e) => {
                reverter.fail().await;
                Err(e)
            }
        }
    }

    async fn update_inner(
        &mut self,
        state: &crate::context::State,
        put: &AclPut,
        client_type: ClientType,
        reverter: &mut Reverter,
    ) -> Result<()> {
        if client_type == ClientType::Normal {
            let old = self.info.clone();

            // The database row must change before networks are re-applied,
            // as usage functions inspect the database.
            state
                .db
                .update_acl(self.id, &put.description, &put.config, &put.ingress, &put.egress)
                .await?;

            self.info.description = put.description.clone();
            self.info.config = put.config.clone();
            self.info.ingress = put.ingress.clone();
            self.info.egress = put.egress.clone();

            let db = state.db.clone();
            let id = self.id;
            reverter.add(move || {
                let db = db.clone();
                let old = old.clone();
                async move {
                    let _ = db
                        .update_acl(id, &old.description, &old.config, &old.ingress, &old.egress)
                        .await;
                }
            });
        }

        let usages = self.network_usage(state).await?;

        // OVN networks share cluster-wide ACL state; bridge networks used
        // via a NIC need the filter applied on the bridge interface.
        let mut bridge_nets = Vec::new();
        let mut ovn_nets = Vec::new();
        let mut bridge_nics = Vec::new();

        for usage in usages {
            match usage.network.net_type.as_str() {
                "ovn" => ovn_nets.push(usage),
                "bridge" if usage.device_name.is_some() => bridge_nics.push(usage),
                "bridge" => bridge_nets.push(usage),
                other => {
                    return Err(CaskError::BadRequest(format!(
                        "Unsupported network ACL type {:?}",
                        other
                    )))
                }
            }
        }

        let acl_names = vec![self.info.name.clone()];

        for usage in &bridge_nets {
            state.firewall.apply_address_sets("inet", &self.project, &acl_names).await?;
            state.firewall.apply_acl_rules(&self.project, usage).await?;
        }

        if !bridge_nics.is_empty() {
            state.firewall.apply_address_sets("bridge", &self.project, &acl_names).await?;
            state
                .firewall
                .update_bridge_acls(&self.project, &bridge_nics)
                .await
                .map_err(|e| {
                    CaskError::Internal(format!("Failed updating bridge NIC ACL: {}", e))
                })?;
        }

        // OVN state is shared, so only the member handling the user request
        // applies it.
        if !ovn_nets.is_empty() && client_type == ClientType::Normal {
            let ovn = state.ovn.as_ref().ok_or_else(|| {
                CaskError::Unavailable("OVN is not available".to_string())
            })?;

            let acl_name_ids = state.db.get_acl_ids_by_names(&self.project).await?;

            let cleanup = ovn
                .ensure_acls(&self.project, &acl_name_ids, &ovn_nets, &acl_names)
                .await
                .map_err(|e| {
                    CaskError::Internal(format!("Failed ensuring ACL is configured in OVN: {}", e))
                })?;
            reverter.add_hook(cleanup);

            let cleanup = ovn.ensure_address_sets(&self.project, &acl_names).await?;
            reverter.add_hook(cleanup);

            ovn.delete_unused_port_groups(&self.project, &self.info.name).await.map_err(|e| {
                CaskError::Internal(format!("Failed removing unused OVN port groups: {}", e))
            })?;
        }

        // Each member applies its own firewall/bridge state.
        if client_type == ClientType::Normal && state.clustered {
            let notifier = Notifier::new(
                state.db.list_members().await?,
                &state.server_name,
                state.connector.clone(),
                NotifyMode::All,
                state.global.offline_threshold,
            )?;

            let project = self.project.clone();
            let name = self.info.name.clone();
            let put = put.clone();

            notifier
                .notify(move |client, _member| {
                    let project = project.clone();
                    let name = name.clone();
                    let put = put.clone();
                    Box::pin(
                        async move { client.update_network_acl(&project, &name, &put).await },
                    )
                })
                .await?;
        }

        debug!("Network ACL updated");
        Ok(())
    }

    /// Rename the ACL. Forbidden while in use.
    #[instrument(skip(self, state), fields(project = %self.project, acl = %self.info.name))]
    pub async fn rename(&mut self, state: &crate::context::State, new_name: &str) -> Result<()> {
        if state.db.get_acl(&self.project, new_name).await.is_ok() {
            return Err(CaskError::Conflict("An ACL by that name exists already".to_string()));
        }

        if self.is_used(state).await? {
            return Err(CaskError::Conflict(
                "Cannot rename an ACL that is in use".to_string(),
            ));
        }

        state.db.rename_acl(self.id, new_name).await?;
        self.info.name = new_name.to_string();

        Ok(())
    }

    /// Delete the ACL. Forbidden while in use.
    #[instrument(skip(self, state), fields(project = %self.project, acl = %self.info.name))]
    pub async fn delete(&self, state: &crate::context::State) -> Result<()> {
        if self.is_used(state).await? {
            return Err(CaskError::Conflict(
                "Cannot delete an ACL that is in use".to_string(),
            ));
        }

        state.db.delete_acl(self.id).await
    }

    /// Read this member's OVN controller log lines for the ACL and, for a
    /// user request, aggregate the other members' lines. Output is sorted;
    /// timestamp-prefixed lines therefore sort by time.
    pub async fn get_log(
        &self,
        state: &crate::context::State,
        client_type: ClientType,
    ) -> Result<String> {
        let log_path = &state.ovn_log_path;
        if !log_path.exists() {
            return Err(CaskError::BadRequest(
                "Only OVN log entries may be retrieved at this time".to_string(),
            ));
        }

        let contents = tokio::fs::read_to_string(log_path)
            .await
            .map_err(|e| crate::error::io_error(log_path, e))?;

        let needle = format!("cask_acl{}-", self.id);
        let entries = Arc::new(Mutex::new(Vec::new()));

        {
            let mut entries = entries.lock().unwrap();
            for line in contents.lines() {
                if line.contains(&needle) {
                    entries.push(line.to_string());
                }
            }
        }

        if client_type == ClientType::Normal && state.clustered {
            let notifier = Notifier::new(
                state.db.list_members().await?,
                &state.server_name,
                state.connector.clone(),
                NotifyMode::All,
                state.global.offline_threshold,
            )?;

            let project = self.project.clone();
            let name = self.info.name.clone();
            let shared = entries.clone();

            notifier
                .notify(move |client, _member| {
                    let project = project.clone();
                    let name = name.clone();
                    let shared = shared.clone();
                    Box::pin(async move {
                        let log = client.get_acl_log(&project, &name).await?;

                        // Writers from every peer land in one slice.
                        let mut entries = shared.lock().unwrap();
                        for line in log.lines() {
                            if !line.is_empty() {
                                entries.push(line.to_string());
                            }
                        }

                        Ok(())
                    })
                })
                .await?;
        }

        let mut entries = Arc::try_unwrap(entries)
            .map_err(|_| CaskError::Internal("Log aggregation still shared".to_string()))?
            .into_inner()
            .unwrap();

        if entries.is_empty() {
            return Ok(String::new());
        }

        entries.sort();
        Ok(entries.join("\n") + "\n")
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct SubjectKinds {
    name: bool,
    ipv4: bool,
    ipv6: bool,
}

#[cfg(test)]
mod tests;
