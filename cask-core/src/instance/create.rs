//! Instance create dispatcher.
//!
//! Normalises a create request into one of {image, none, copy, migration,
//! backup} and runs the matching creator, after resolving profiles, source
//! defaults and placement. When placement chooses a remote member the
//! request is forwarded over the cluster RPC seam instead.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::cluster::ForwardedOperation;
use crate::context::State;
use crate::error::{CaskError, Result};
use crate::instance::{create_internal, Instance};
use crate::migration::SinkArgs;
use crate::operations::{Operation, OperationType};
use crate::oplock::{self, Action};
use crate::placement;
use crate::revert::Reverter;
use crate::storage::Pool;
use crate::types::{ContentType, DeviceConfig, Devices, InstanceArgs, InstanceType};

/// Where a new instance comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceType {
    Image,
    #[default]
    None,
    Copy,
    Migration,
    Backup,
}

/// Source description in a create request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceSource {
    #[serde(rename = "type")]
    pub source_type: SourceType,

    /// Image alias or fingerprint.
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub fingerprint: String,

    /// Copy: source instance name and project.
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub project: String,

    /// Migration: pull or push mode, source operation URL and secrets.
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub operation: String,
    #[serde(default)]
    pub secrets: HashMap<String, String>,

    #[serde(default)]
    pub base_image: String,
    #[serde(default)]
    pub live: bool,
    #[serde(default)]
    pub refresh: bool,
    #[serde(default)]
    pub refresh_exclude_older: bool,
    #[serde(default)]
    pub instance_only: bool,
    #[serde(default)]
    pub allow_inconsistent: bool,

    /// Backup restore: path to the uploaded tarball.
    #[serde(default)]
    pub backup_file: Option<std::path::PathBuf>,
}

/// An instance create request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateInstanceRequest {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub instance_type: InstanceType,
    #[serde(default)]
    pub architecture: String,
    /// `None` means "use the default profile"; an empty list means no
    /// profiles at all.
    #[serde(default)]
    pub profiles: Option<Vec<String>>,
    #[serde(default)]
    pub config: HashMap<String, String>,
    #[serde(default)]
    pub devices: Devices,
    #[serde(default)]
    pub ephemeral: bool,
    #[serde(default)]
    pub stateful: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub start: bool,
    #[serde(default)]
    pub source: InstanceSource,
}

/// Result of a dispatched create.
#[derive(Debug)]
pub enum CreateOutcome {
    /// Running locally; the operation handle completes when done.
    Local(Arc<Operation>),
    /// Forwarded to the cluster member that placement chose.
    Forwarded(ForwardedOperation),
}

const NAME_ADJECTIVES: &[&str] = &[
    "able", "brave", "calm", "daring", "eager", "fond", "gentle", "happy", "keen", "lively",
    "merry", "noble", "polite", "quick", "rapid", "smart", "tidy", "vivid", "warm", "witty",
];

const NAME_NOUNS: &[&str] = &[
    "badger", "crane", "dolphin", "falcon", "gecko", "heron", "ibis", "jackal", "koala",
    "lemur", "marten", "newt", "otter", "panda", "quail", "raven", "seal", "tapir", "vole",
    "wren",
];

/// Pick a random two-word name, ensuring uniqueness within the project in
/// at most 100 attempts.
async fn random_name(state: &State, project: &str) -> Result<String> {
    use rand::seq::SliceRandom;

    let existing = state.db.list_instance_names(project).await?;

    for _ in 0..100 {
        let name = {
            let mut rng = rand::thread_rng();
            format!(
                "{}-{}",
                NAME_ADJECTIVES.choose(&mut rng).unwrap(),
                NAME_NOUNS.choose(&mut rng).unwrap()
            )
        };

        if !existing.contains(&name) {
            return Ok(name);
        }
    }

    Err(CaskError::Internal(
        "Couldn't generate a new unique name after 100 tries".to_string(),
    ))
}

/// Resolve the storage pool for a new instance: the request's root disk
/// first, then the profile chain (last profile wins), then the only pool if
/// exactly one exists.
pub async fn find_storage_pool(
    state: &State,
    project: &str,
    devices: &Devices,
    profiles: &[String],
) -> Result<String> {
    if let Some((_, root)) = devices.root_disk() {
        if let Some(pool) = root.get("pool").filter(|p| !p.is_empty()) {
            if state.db.get_pool(pool).await.is_ok() {
                return Ok(pool.clone());
            }
        }
    }

    let mut pool = String::new();
    for profile_name in profiles {
        let profile = state.db.get_profile(project, profile_name).await?;
        if let Some((_, root)) = profile.devices.root_disk() {
            if let Some(p) = root.get("pool").filter(|p| !p.is_empty()) {
                pool = p.clone();
            }
        }
    }

    if !pool.is_empty() {
        return Ok(pool);
    }

    let pools = state.db.list_pool_names().await?;
    if pools.len() == 1 {
        return Ok(pools[0].clone());
    }

    Err(CaskError::BadRequest(
        "Can't find a storage pool for the instance to use".to_string(),
    ))
}

/// Give the instance its own root disk device when neither its devices nor
/// its profiles provide one, probing `root`, `root0`..`root99` for a free
/// name.
fn ensure_root_disk(devices: &mut Devices, expanded: &Devices, pool: &str) {
    if expanded.root_disk().is_some() || devices.root_disk().is_some() {
        return;
    }

    let mut root: DeviceConfig = DeviceConfig::new();
    root.insert("type".to_string(), "disk".to_string());
    root.insert("path".to_string(), "/".to_string());
    root.insert("pool".to_string(), pool.to_string());

    let mut name = "root".to_string();
    for i in 0..100 {
        if !devices.contains(&name) {
            break;
        }

        name = format!("root{}", i);
    }

    devices.insert(name, root);
}

/// Dispatch an instance create request.
///
/// `target` optionally names a member (`node1`) or a cluster group
/// (`@amd64`). `cluster_notification` marks replayed internal requests,
/// which skip placement and the evacuated check.
#[instrument(skip(state, req), fields(project = %project, name = %req.name, source = ?req.source.source_type))]
pub async fn create_instance(
    state: &Arc<State>,
    project: &str,
    target: Option<&str>,
    mut req: CreateInstanceRequest,
    cluster_notification: bool,
) -> Result<CreateOutcome> {
    if !cluster_notification && state.local_member_evacuated().await {
        return Err(CaskError::Forbidden("Cluster member is evacuated".to_string()));
    }

    if !state.clustered && target.is_some() {
        return Err(CaskError::BadRequest("Target only allowed when clustered".to_string()));
    }

    let project_config = state.db.get_project_config(project).await.unwrap_or_default();

    // Collect request defaults from the source.
    let mut source_architectures: Vec<String> = Vec::new();

    match req.source.source_type {
        SourceType::Copy => {
            if req.source.source.is_empty() {
                return Err(CaskError::BadRequest("Must specify a source instance".to_string()));
            }

            if req.source.project.is_empty() {
                req.source.project = project.to_string();
            }

            let source_record =
                state.db.get_instance(&req.source.project, &req.source.source).await?;

            req.instance_type = source_record.instance_type;
            source_architectures.push(source_record.architecture.clone());

            if req.profiles.is_none() {
                req.profiles = Some(source_record.profiles.clone());
            }

            // Inherit source config (filtered) and devices unless the
            // request overrides them.
            for (key, value) in &source_record.config {
                if !crate::types::instance::include_when_copying(key) {
                    debug!(key = %key, "Skipping key from copy source");
                    continue;
                }

                req.config.entry(key.clone()).or_insert_with(|| value.clone());
            }

            for (name, config) in source_record.devices.iter() {
                if !req.devices.contains(name) {
                    req.devices.insert(name.clone(), config.clone());
                }
            }

            if req.stateful && req.name != req.source.source {
                return Err(CaskError::BadRequest(format!(
                    "Instance name cannot be changed during stateful copy ({:?} to {:?})",
                    req.source.source, req.name
                )));
            }
        }
        SourceType::Image => {
            if !req.architecture.is_empty() {
                source_architectures.push(req.architecture.clone());
            }
        }
        _ => {
            if !req.architecture.is_empty() {
                source_architectures.push(req.architecture.clone());
            }
        }
    }

    // Use the default profile unless a list (even an empty one) was given.
    let profiles = req.profiles.clone().unwrap_or_else(|| vec!["default".to_string()]);
    req.profiles = Some(profiles.clone());

    // Generate an automatic name if none was given.
    if req.name.is_empty() {
        req.name = random_name(state, project).await?;
        debug!(instance = %req.name, "No name provided for new instance, using auto-generated name");
    }

    super::valid_name(&req.name, false)?;

    // Fall back to the project (then global) default architecture.
    if source_architectures.is_empty() {
        let default_arch = project_config
            .get("images.default_architecture")
            .cloned()
            .unwrap_or_else(|| state.global.images_default_architecture.clone());

        if !default_arch.is_empty() {
            source_architectures.push(default_arch);
        }
    }

    // Placement.
    let mut target_group: Option<String> = None;

    if state.clustered && !cluster_notification {
        let (target_member, group) = match target {
            Some(t) => match t.strip_prefix('@') {
                Some(group) => (None, Some(group.to_string())),
                None => (Some(t.to_string()), None),
            },
            None => (None, None),
        };
        target_group = group;

        let allowed_groups: Vec<String> = project_config
            .get("restricted.cluster.groups")
            .map(|v| crate::types::acl::split_trimmed(v))
            .unwrap_or_default();

        let members = state.db.list_members().await?;
        let candidates = placement::candidate_members(
            &members,
            &source_architectures,
            target_group.as_deref(),
            &allowed_groups,
            state.global.offline_threshold,
            crate::types::unix_now(),
        );

        let placement_request = placement::PlacementRequest {
            project: project.to_string(),
            name: req.name.clone(),
            config: crate::types::profile::expand_config(
                &req.config,
                &state.db.get_profiles(project, &profiles).await?,
            ),
            reason: "new".to_string(),
        };

        let member = placement::place(
            &placement_request,
            candidates,
            target_member.as_deref(),
            state.placement_policy.clone(),
            "",
        )
        .await?;

        // Record the chosen group before any forward so it survives.
        if let Some(group) = &target_group {
            req.config.insert("volatile.cluster.group".to_string(), group.clone());
        }

        if member.name != state.server_name {
            let client = state.connector.connect(&member)?;
            debug!(target = %member.name, "Forwarding instance create request");

            let forwarded = client.create_instance(project, &member.name, &req).await?;
            return Ok(CreateOutcome::Forwarded(forwarded));
        }
    }

    // Local dispatch.
    let op = Operation::new(project, OperationType::InstanceCreate);
    let state = state.clone();
    let project = project.to_string();

    let body_op = op.clone();
    crate::operations::spawn(op.clone(), async move {
        let created = match req.source.source_type {
            SourceType::Image => create_from_image(&state, &project, &req, &body_op).await,
            SourceType::None => create_from_none(&state, &project, &req, &body_op).await,
            SourceType::Copy => create_from_copy(&state, &project, &req, &body_op).await,
            SourceType::Migration => {
                create_from_migration(&state, &project, &req, &body_op).await
            }
            SourceType::Backup => {
                let tarball = req.source.backup_file.clone().ok_or_else(|| {
                    CaskError::BadRequest("Backup source requires a file".to_string())
                })?;

                crate::backup::restore_from_backup(
                    &state,
                    &project,
                    &tarball,
                    None,
                    Some(req.name.clone()),
                )
                .await
                .map(|_| ())
            }
        };
        created?;

        // Start the new instance under the same operation if asked to.
        if req.start {
            let inst = Instance::load(state.clone(), &project, &req.name).await?;
            inst.start().await?;
        }

        Ok(())
    });

    Ok(CreateOutcome::Local(op))
}

/// Common tail of the simple creators: record + volume + device add hooks.
async fn create_common(
    state: &Arc<State>,
    project: &str,
    req: &CreateInstanceRequest,
    fingerprint: Option<&str>,
) -> Result<()> {
    let args = InstanceArgs {
        project: project.to_string(),
        name: req.name.clone(),
        node: state.server_name.clone(),
        instance_type: req.instance_type,
        architecture: req.architecture.clone(),
        ephemeral: req.ephemeral,
        snapshot: false,
        stateful: req.stateful,
        description: req.description.clone(),
        expiry_date: None,
        config: req.config.clone(),
        devices: req.devices.clone(),
        profiles: req.profiles.clone().unwrap_or_default(),
    };

    let mut reverter = Reverter::new();

    let (record, inst_op, cleanup) = create_internal(state, args).await?;
    reverter.add_hook(cleanup);

    let result: Result<()> = async {
        let pool_name =
            find_storage_pool(state, project, &record.devices, &record.profiles).await?;
        let pool = Pool::load(state.db.clone(), &state.drivers, &pool_name).await?;

        match fingerprint {
            None => pool.create_instance(&record).await?,
            Some(fingerprint) => pool.create_instance_from_image(&record, fingerprint).await?,
        }

        let inst = Instance::load(state.clone(), project, &record.name).await?;

        if let Some(fingerprint) = fingerprint {
            let mut volatile = HashMap::new();
            volatile.insert("volatile.base_image".to_string(), fingerprint.to_string());
            inst.volatile_set(volatile).await?;
            inst.defer_template_apply("create").await?;
        }

        let _devices_cleanup = inst.devices_add().await?;

        inst.update_backup_file().await?;

        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            inst_op.done(None);
            reverter.success();
            info!(project, instance = %record.name, "Created instance");
            Ok(())
        }
        Err(e) => {
            // Remove any partially-created volume before the record goes.
            if let Ok(pool_name) =
                find_storage_pool(state, project, &record.devices, &record.profiles).await
            {
                if let Ok(pool) = Pool::load(state.db.clone(), &state.drivers, &pool_name).await
                {
                    let _ = pool.delete_instance(&record).await;
                }
            }

            inst_op.done(Some(&e));
            reverter.fail().await;
            Err(e)
        }
    }
}

async fn create_from_none(
    state: &Arc<State>,
    project: &str,
    req: &CreateInstanceRequest,
    _op: &Arc<Operation>,
) -> Result<()> {
    create_common(state, project, req, None).await
}

async fn create_from_image(
    state: &Arc<State>,
    project: &str,
    req: &CreateInstanceRequest,
    _op: &Arc<Operation>,
) -> Result<()> {
    let fingerprint = if !req.source.fingerprint.is_empty() {
        req.source.fingerprint.clone()
    } else if !req.source.alias.is_empty() {
        // The image cache collaborator resolves aliases; the alias doubles
        // as the reference here.
        req.source.alias.clone()
    } else {
        return Err(CaskError::BadRequest(
            "Image not provided for instance creation".to_string(),
        ));
    };

    create_common(state, project, req, Some(&fingerprint)).await
}

async fn create_from_copy(
    state: &Arc<State>,
    project: &str,
    req: &CreateInstanceRequest,
    op: &Arc<Operation>,
) -> Result<()> {
    let source_record =
        state.db.get_instance(&req.source.project, &req.source.source).await?;

    // Cross-member copies stay local only when both sit on the same remote
    // pool; otherwise the copy becomes a migration.
    if state.clustered && source_record.node != state.server_name {
        let source_pool_name = state
            .db
            .get_instance_pool_name(&source_record.project, &source_record.name)
            .await?;
        let dest_pool_name = find_storage_pool(
            state,
            project,
            &req.devices,
            &req.profiles.clone().unwrap_or_default(),
        )
        .await?;

        let source_pool = state.db.get_pool(&source_pool_name).await?;
        let remote_drivers = state.drivers.remote_driver_names();

        if source_pool_name != dest_pool_name || !remote_drivers.contains(&source_pool.driver)
        {
            // Redirect to a pull migration from the source member.
            let mut migration_req = req.clone();
            migration_req.source.source_type = SourceType::Migration;
            migration_req.source.mode = "pull".to_string();

            return create_from_migration(state, project, &migration_req, op).await;
        }
    }

    let mut reverter = Reverter::new();

    let args = InstanceArgs {
        project: project.to_string(),
        name: req.name.clone(),
        node: state.server_name.clone(),
        instance_type: source_record.instance_type,
        architecture: source_record.architecture.clone(),
        ephemeral: req.ephemeral,
        snapshot: false,
        stateful: req.stateful,
        description: req.description.clone(),
        expiry_date: None,
        config: req.config.clone(),
        devices: req.devices.clone(),
        profiles: req.profiles.clone().unwrap_or_default(),
    };

    let (record, inst_op, cleanup) = create_internal(state, args).await?;
    reverter.add_hook(cleanup);

    let result: Result<()> = async {
        let pool_name =
            find_storage_pool(state, project, &record.devices, &record.profiles).await?;
        let pool = Pool::load(state.db.clone(), &state.drivers, &pool_name).await?;

        pool.create_instance(&record).await?;

        let source_vol = crate::storage::InstanceVolume::for_record(&source_record);
        let target_vol = crate::storage::InstanceVolume::for_record(&record);
        pool.driver().refresh_instance(pool.record(), &target_vol, &source_vol).await?;

        // Copy snapshots unless asked not to.
        if !req.source.instance_only {
            let snapshots = state
                .db
                .get_instance_snapshots(&source_record.project, &source_record.name)
                .await?;

            for snapshot in snapshots {
                let (_, snap_name) = crate::types::parent_and_snapshot_name(&snapshot.name);
                let Some(snap_name) = snap_name else { continue };

                let snap_args = InstanceArgs {
                    project: record.project.clone(),
                    name: format!(
                        "{}{}{}",
                        record.name,
                        crate::types::SNAPSHOT_DELIMITER,
                        snap_name
                    ),
                    node: record.node.clone(),
                    instance_type: record.instance_type,
                    architecture: snapshot.architecture.clone(),
                    ephemeral: false,
                    snapshot: true,
                    stateful: snapshot.stateful,
                    description: snapshot.description.clone(),
                    expiry_date: snapshot.expiry_date,
                    config: snapshot.config.clone(),
                    devices: snapshot.devices.clone(),
                    profiles: snapshot.profiles.clone(),
                };

                let snap_record = state.db.insert_instance(&snap_args).await?;
                pool.create_instance_snapshot(&snap_record, &record).await?;

                // Bring over the source snapshot's actual contents.
                let target_snap = crate::storage::InstanceVolume::for_record(&snap_record);
                let source_snap = crate::storage::InstanceVolume {
                    project: source_record.project.clone(),
                    name: snapshot.name.clone(),
                    volume_type: crate::types::VolumeType::for_instance(
                        source_record.instance_type,
                    ),
                };
                pool.driver()
                    .refresh_instance(pool.record(), &target_snap, &source_snap)
                    .await?;
            }
        }

        let inst = Instance::load(state.clone(), project, &record.name).await?;
        inst.defer_template_apply("copy").await?;
        inst.update_backup_file().await?;

        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            inst_op.done(None);
            reverter.success();
            info!(project, instance = %record.name, source = %source_record.name, "Copied instance");
            Ok(())
        }
        Err(e) => {
            let pool_name =
                find_storage_pool(state, project, &record.devices, &record.profiles).await;
            if let Ok(pool_name) = pool_name {
                if let Ok(pool) = Pool::load(state.db.clone(), &state.drivers, &pool_name).await
                {
                    let _ = pool.delete_instance(&record).await;
                }
            }

            inst_op.done(Some(&e));
            reverter.fail().await;
            Err(e)
        }
    }
}

async fn create_from_migration(
    state: &Arc<State>,
    project: &str,
    req: &CreateInstanceRequest,
    _op: &Arc<Operation>,
) -> Result<()> {
    if req.source.mode != "pull" && req.source.mode != "push" {
        return Err(CaskError::BadRequest(format!(
            "Mode {:?} not implemented",
            req.source.mode
        )));
    }

    let mut devices = req.devices.clone();
    let profiles = req.profiles.clone().unwrap_or_default();

    let pool_name = find_storage_pool(state, project, &devices, &profiles).await?;

    let profile_records = state.db.get_profiles(project, &profiles).await?;
    let expanded = crate::types::profile::expand_devices(&devices, &profile_records);
    ensure_root_disk(&mut devices, &expanded, &pool_name);

    // Refresh (or same-name cluster move) transfers onto an existing
    // instance when present; a missing instance downgrades the refresh to
    // a fresh create.
    let mut refresh = req.source.refresh;
    let cluster_move = !req.source.source.is_empty() && req.source.source == req.name;

    let mut existing = None;
    if refresh || cluster_move {
        match state.db.get_instance(project, &req.name).await {
            Ok(record) => existing = Some(record),
            Err(e) if e.is_not_found() => {
                if cluster_move {
                    return Err(CaskError::BadRequest(
                        "Cluster move doesn't allow renaming".to_string(),
                    ));
                }

                refresh = false;
            }
            Err(e) => return Err(e),
        }
    }

    let mut reverter = Reverter::new();

    let (record, inst_op) = match existing {
        Some(record) => {
            let op = oplock::create(&record.project, &record.name, Action::Migrate, false, false)
                .map_err(|e| {
                    CaskError::Internal(format!(
                        "Failed getting exclusive access to instance: {}",
                        e
                    ))
                })?;
            (record, op)
        }
        None => {
            let args = InstanceArgs {
                project: project.to_string(),
                name: req.name.clone(),
                node: state.server_name.clone(),
                instance_type: req.instance_type,
                architecture: req.architecture.clone(),
                ephemeral: req.ephemeral,
                snapshot: false,
                stateful: req.stateful,
                description: req.description.clone(),
                expiry_date: None,
                config: req.config.clone(),
                devices,
                profiles,
            };

            let (record, op, cleanup) = create_internal(state, args).await.map_err(|e| {
                CaskError::Internal(format!("Failed creating instance record: {}", e))
            })?;
            reverter.add_hook(cleanup);
            (record, op)
        }
    };

    let result: Result<()> = async {
        let pool = Pool::load(state.db.clone(), &state.drivers, &pool_name).await?;

        if !refresh {
            pool.create_instance(&record).await?;
        }

        let offers = pool.migration_types(
            ContentType::Fs,
            refresh,
            !req.source.instance_only,
            cluster_move,
            false,
        );

        let args = SinkArgs {
            url: req.source.operation.clone(),
            push: req.source.mode == "push",
            live: req.source.live,
            instance_only: req.source.instance_only,
            refresh,
            refresh_exclude_older: req.source.refresh_exclude_older,
            cluster_move_source_name: if cluster_move {
                req.source.source.clone()
            } else {
                String::new()
            },
            storage_pool: pool_name.clone(),
            secrets: req.source.secrets.clone(),
        };

        state
            .migration
            .receive(&record, &args, &offers)
            .await
            .map_err(|e| CaskError::Internal(format!("Error transferring instance data: {}", e)))
    }
    .await;

    match result {
        Ok(()) => {
            inst_op.done(None);
            reverter.success();
            info!(project, instance = %record.name, refresh, "Migration sink finished");
            Ok(())
        }
        Err(e) => {
            inst_op.done(Some(&e));
            reverter.fail().await;
            Err(e)
        }
    }
}
