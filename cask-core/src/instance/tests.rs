use super::create::{
    create_instance, CreateInstanceRequest, CreateOutcome, InstanceSource, SourceType,
};
use super::*;
use crate::context::test_support::{standalone_harness, standalone_state};
use crate::instance::runtime::InstanceRuntime;
use crate::types::{InstanceType, VolumeType};

fn image_request(name: &str) -> CreateInstanceRequest {
    CreateInstanceRequest {
        name: name.to_string(),
        instance_type: InstanceType::Container,
        architecture: "x86_64".to_string(),
        source: InstanceSource {
            source_type: SourceType::Image,
            alias: "ubuntu".to_string(),
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn created_instance(state: &Arc<State>, name: &str) -> Instance {
    let outcome =
        create_instance(state, "default", None, image_request(name), false).await.unwrap();

    match outcome {
        CreateOutcome::Local(op) => op.wait().await.unwrap(),
        CreateOutcome::Forwarded(_) => panic!("unexpected forward"),
    }

    Instance::load(state.clone(), "default", name).await.unwrap()
}

fn clustered(state: &Arc<State>) -> Arc<State> {
    Arc::new(State {
        db: state.db.clone(),
        data_dir: state.data_dir.clone(),
        server_name: state.server_name.clone(),
        clustered: true,
        global: state.global.clone(),
        architectures: state.architectures.clone(),
        drivers: state.drivers.clone(),
        runtime: state.runtime.clone(),
        firewall: state.firewall.clone(),
        ovn: state.ovn.clone(),
        connector: state.connector.clone(),
        placement_policy: None,
        migration: state.migration.clone(),
        ovn_log_path: state.ovn_log_path.clone(),
    })
}

#[tokio::test]
async fn test_create_from_image_single_member() {
    let tmp = tempfile::tempdir().unwrap();
    let state = standalone_state(tmp.path()).await;

    let inst = created_instance(&state, "c1").await;

    // The record exists with the profile's root disk in the expanded set.
    assert_eq!(inst.name(), "c1");
    let (root_name, root_config) = inst.expanded_devices().root_disk().map(|(n, c)| (n.to_string(), c.clone())).unwrap();
    assert_eq!(root_name, "root");
    assert_eq!(root_config.get("pool").unwrap(), "default");

    // A volume row was created alongside.
    let pool = state.db.get_pool("default").await.unwrap();
    state.db.get_volume(pool.id, "default", "c1", VolumeType::Container).await.unwrap();

    // The image origin is recorded, the instance is stopped, no snapshots.
    assert_eq!(inst.local_config().get("volatile.base_image").unwrap(), "ubuntu");
    assert_eq!(inst.status(), crate::types::StatusCode::Stopped);
    assert!(inst.snapshots().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_create_then_delete_leaves_no_rows() {
    let tmp = tempfile::tempdir().unwrap();
    let state = standalone_state(tmp.path()).await;

    let before_names = state.db.list_instance_names("default").await.unwrap();

    let inst = created_instance(&state, "c1").await;
    inst.snapshot("snap0", None, false).await.unwrap();
    inst.delete().await.unwrap();

    // Instance, snapshot and volume rows are all gone.
    assert_eq!(state.db.list_instance_names("default").await.unwrap(), before_names);
    assert!(state.db.get_instance("default", "c1").await.is_err());
    assert!(state.db.get_instance("default", "c1/snap0").await.is_err());

    let pool = state.db.get_pool("default").await.unwrap();
    assert!(state
        .db
        .get_volume(pool.id, "default", "c1", VolumeType::Container)
        .await
        .is_err());
}

#[tokio::test]
async fn test_create_generates_unique_two_word_name() {
    let tmp = tempfile::tempdir().unwrap();
    let state = standalone_state(tmp.path()).await;

    let outcome =
        create_instance(&state, "default", None, image_request(""), false).await.unwrap();

    let CreateOutcome::Local(op) = outcome else { panic!("unexpected forward") };
    op.wait().await.unwrap();

    let names = state.db.list_instance_names("default").await.unwrap();
    assert_eq!(names.len(), 1);
    assert!(names[0].contains('-'), "expected two-word name, got {:?}", names[0]);
}

#[tokio::test]
async fn test_create_rejected_on_evacuated_member() {
    let tmp = tempfile::tempdir().unwrap();
    let state = standalone_state(tmp.path()).await;
    let state = clustered(&state);

    let member = crate::types::Member {
        id: 0,
        name: "node1".to_string(),
        address: "10.0.0.1:8443".to_string(),
        architectures: vec!["x86_64".to_string()],
        groups: vec![],
        heartbeat: crate::types::unix_now(),
        evacuated: true,
        instance_count: 0,
    };
    state.db.insert_member(&member).await.unwrap();

    let err = create_instance(&state, "default", None, image_request("c1"), false)
        .await
        .unwrap_err();
    assert!(matches!(err, CaskError::Forbidden(_)));

    // Cluster-internal notifications bypass the check.
    let outcome = create_instance(&state, "default", None, image_request("c1"), true)
        .await
        .unwrap();
    let CreateOutcome::Local(op) = outcome else { panic!("unexpected forward") };
    op.wait().await.unwrap();
}

#[tokio::test]
async fn test_start_stop_records_power_state() {
    let tmp = tempfile::tempdir().unwrap();
    let harness = standalone_harness(tmp.path()).await;
    let state = harness.state.clone();

    let inst = created_instance(&state, "c1").await;

    inst.start().await.unwrap();
    assert!(harness.runtime.is_running("default", "c1"));
    assert_eq!(
        inst.local_config().get("volatile.last_state.power").unwrap(),
        crate::types::instance::POWER_STATE_RUNNING
    );

    // Starting again is rejected.
    let err = inst.start().await.unwrap_err();
    assert!(matches!(err, CaskError::InstanceAlreadyRunning));

    inst.stop(false).await.unwrap();
    assert!(!harness.runtime.is_running("default", "c1"));
    assert_eq!(
        inst.local_config().get("volatile.last_state.power").unwrap(),
        crate::types::instance::POWER_STATE_STOPPED
    );

    // Stopping a stopped instance is rejected.
    let err = inst.stop(false).await.unwrap_err();
    assert!(matches!(err, CaskError::InstanceIsStopped));
}

#[tokio::test]
async fn test_shutdown_refuses_frozen_instance() {
    let tmp = tempfile::tempdir().unwrap();
    let harness = standalone_harness(tmp.path()).await;
    let state = harness.state.clone();

    let inst = created_instance(&state, "c1").await;
    inst.start().await.unwrap();

    harness.runtime.set_frozen("default", "c1", true);

    let err = inst.shutdown(Duration::from_secs(5)).await.unwrap_err();
    assert!(err.to_string().contains("not running"));
}

#[tokio::test]
async fn test_ephemeral_instance_deleted_on_stop_but_not_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let state = standalone_state(tmp.path()).await;

    let mut req = image_request("eph");
    req.ephemeral = true;

    let CreateOutcome::Local(op) =
        create_instance(&state, "default", None, req, false).await.unwrap()
    else {
        panic!("unexpected forward")
    };
    op.wait().await.unwrap();

    let inst = Instance::load(state.clone(), "default", "eph").await.unwrap();
    inst.start().await.unwrap();

    // A restart keeps the instance around.
    inst.restart(Duration::ZERO).await.unwrap();
    assert!(state.db.get_instance("default", "eph").await.is_ok());
    assert!(inst.is_ephemeral());

    // A plain stop deletes it.
    inst.stop(false).await.unwrap();
    assert!(state.db.get_instance("default", "eph").await.is_err());
}

#[tokio::test]
async fn test_concurrent_restarts_both_succeed() {
    let tmp = tempfile::tempdir().unwrap();
    let state = standalone_state(tmp.path()).await;

    let inst = created_instance(&state, "c1").await;
    inst.start().await.unwrap();

    let a = {
        let inst = inst.clone();
        tokio::spawn(async move { inst.restart(Duration::ZERO).await })
    };
    let b = {
        let inst = inst.clone();
        tokio::spawn(async move { inst.restart(Duration::ZERO).await })
    };

    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    assert!(inst.is_running());
}

#[tokio::test]
async fn test_update_device_failure_reverts() {
    let tmp = tempfile::tempdir().unwrap();
    let state = standalone_state(tmp.path()).await;

    let inst = created_instance(&state, "c1").await;
    let before = inst.record();

    // A NIC without network or parent fails validation.
    let mut args = UpdateArgs::from_record(&before);
    let mut bad_nic = DeviceConfig::new();
    bad_nic.insert("type".to_string(), "nic".to_string());
    args.devices.insert("eth0", bad_nic);

    let err = inst.update(args, true).await.unwrap_err();
    assert!(err.to_string().contains("eth0"));

    // The stored definition is unchanged.
    let after = state.db.get_instance("default", "c1").await.unwrap();
    assert_eq!(after.devices, before.devices);
    assert_eq!(after.config, before.config);
}

#[tokio::test]
async fn test_update_regenerates_cloud_init_id_on_nic_change() {
    let tmp = tempfile::tempdir().unwrap();
    let state = standalone_state(tmp.path()).await;

    let inst = created_instance(&state, "c1").await;

    // Seed an id so the change is observable.
    let mut seed = HashMap::new();
    seed.insert("volatile.cloud-init.instance-id".to_string(), "before".to_string());
    inst.volatile_set(seed).await.unwrap();

    // Adding a NIC changes the NIC name set.
    let mut args = UpdateArgs::from_record(&inst.record());
    let mut nic = DeviceConfig::new();
    nic.insert("type".to_string(), "nic".to_string());
    nic.insert("network".to_string(), "br0".to_string());
    args.devices.insert("eth0", nic);

    inst.update(args, true).await.unwrap();
    let id = inst.local_config().get("volatile.cloud-init.instance-id").cloned().unwrap();
    assert_ne!(id, "before");

    // An unrelated config change keeps the id.
    let mut args = UpdateArgs::from_record(&inst.record());
    args.config.insert("limits.memory".to_string(), "2GiB".to_string());
    inst.update(args, true).await.unwrap();

    let same = inst.local_config().get("volatile.cloud-init.instance-id").cloned().unwrap();
    assert_eq!(id, same);
}

#[tokio::test]
async fn test_device_volatile_cleared_on_removal() {
    let tmp = tempfile::tempdir().unwrap();
    let state = standalone_state(tmp.path()).await;

    let inst = created_instance(&state, "c1").await;

    // Attach a NIC and start it once so it generates volatile keys.
    let mut args = UpdateArgs::from_record(&inst.record());
    let mut nic = DeviceConfig::new();
    nic.insert("type".to_string(), "nic".to_string());
    nic.insert("network".to_string(), "br0".to_string());
    args.devices.insert("eth0", nic);
    inst.update(args, true).await.unwrap();

    inst.start().await.unwrap();
    assert!(inst.local_config().contains_key("volatile.eth0.hwaddr"));
    inst.stop(false).await.unwrap();

    // Removing the device clears all of its volatile keys.
    let mut args = UpdateArgs::from_record(&inst.record());
    args.devices.remove("eth0");
    inst.update(args, true).await.unwrap();

    assert!(!inst.local_config().contains_key("volatile.eth0.hwaddr"));
    assert!(!inst.local_config().contains_key("volatile.eth0.host_name"));
}

#[tokio::test]
async fn test_snapshot_and_restore() {
    let tmp = tempfile::tempdir().unwrap();
    let state = standalone_state(tmp.path()).await;

    let inst = created_instance(&state, "c1").await;

    let rootfs = state.data_dir.join("storage-pools/default/containers/c1/rootfs");
    std::fs::write(rootfs.join("marker"), "v1").unwrap();

    inst.snapshot("snap0", None, false).await.unwrap();

    let snapshots = inst.snapshots().await.unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].name, "c1/snap0");

    // Mutate, then restore.
    std::fs::write(rootfs.join("marker"), "v2").unwrap();
    inst.restore("snap0").await.unwrap();

    let contents = std::fs::read_to_string(rootfs.join("marker")).unwrap();
    assert_eq!(contents, "v1");
}

#[tokio::test]
async fn test_copy_carries_devices_and_snapshots_but_not_volatile() {
    let tmp = tempfile::tempdir().unwrap();
    let state = standalone_state(tmp.path()).await;

    let inst = created_instance(&state, "c1").await;

    let mut volatile = HashMap::new();
    volatile.insert("volatile.uuid".to_string(), "source-uuid".to_string());
    inst.volatile_set(volatile).await.unwrap();

    let rootfs = state.data_dir.join("storage-pools/default/containers/c1/rootfs");
    std::fs::write(rootfs.join("data"), "original").unwrap();
    inst.snapshot("snap0", None, false).await.unwrap();

    let req = CreateInstanceRequest {
        name: "c2".to_string(),
        source: InstanceSource {
            source_type: SourceType::Copy,
            source: "c1".to_string(),
            ..Default::default()
        },
        ..Default::default()
    };

    let CreateOutcome::Local(op) =
        create_instance(&state, "default", None, req, false).await.unwrap()
    else {
        panic!("unexpected forward")
    };
    op.wait().await.unwrap();

    let copy = state.db.get_instance("default", "c2").await.unwrap();
    assert_eq!(copy.instance_type, InstanceType::Container);
    // volatile.base_image is allowed through, instance-private keys not.
    assert_eq!(copy.config.get("volatile.base_image").map(String::as_str), Some("ubuntu"));
    assert!(!copy.config.contains_key("volatile.uuid"));

    let copied = std::fs::read_to_string(
        state.data_dir.join("storage-pools/default/containers/c2/rootfs/data"),
    )
    .unwrap();
    assert_eq!(copied, "original");

    let snapshots = state.db.get_instance_snapshots("default", "c2").await.unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].name, "c2/snap0");
}

#[tokio::test]
async fn test_migration_refresh_flags_reach_transport() {
    let tmp = tempfile::tempdir().unwrap();
    let harness = standalone_harness(tmp.path()).await;
    let state = harness.state.clone();

    // Refresh onto an existing instance.
    created_instance(&state, "c2").await;

    let req = CreateInstanceRequest {
        name: "c2".to_string(),
        instance_type: InstanceType::Container,
        architecture: "x86_64".to_string(),
        source: InstanceSource {
            source_type: SourceType::Migration,
            mode: "push".to_string(),
            refresh: true,
            ..Default::default()
        },
        ..Default::default()
    };

    let CreateOutcome::Local(op) =
        create_instance(&state, "default", None, req, false).await.unwrap()
    else {
        panic!("unexpected forward")
    };
    op.wait().await.unwrap();

    let received = harness.transport.received.lock().unwrap().clone();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0, "c2");
    assert!(received[0].1.refresh);
    assert!(received[0].1.push);

    // Refresh of a missing instance downgrades to a fresh create.
    let req = CreateInstanceRequest {
        name: "c3".to_string(),
        instance_type: InstanceType::Container,
        architecture: "x86_64".to_string(),
        source: InstanceSource {
            source_type: SourceType::Migration,
            mode: "pull".to_string(),
            refresh: true,
            ..Default::default()
        },
        ..Default::default()
    };

    let CreateOutcome::Local(op) =
        create_instance(&state, "default", None, req, false).await.unwrap()
    else {
        panic!("unexpected forward")
    };
    op.wait().await.unwrap();

    let received = harness.transport.received.lock().unwrap().clone();
    assert_eq!(received.len(), 2);
    assert!(!received[1].1.refresh);
}

#[tokio::test]
async fn test_migration_rejects_unknown_mode() {
    let tmp = tempfile::tempdir().unwrap();
    let state = standalone_state(tmp.path()).await;

    let req = CreateInstanceRequest {
        name: "c1".to_string(),
        architecture: "x86_64".to_string(),
        source: InstanceSource {
            source_type: SourceType::Migration,
            mode: "teleport".to_string(),
            ..Default::default()
        },
        ..Default::default()
    };

    let CreateOutcome::Local(op) =
        create_instance(&state, "default", None, req, false).await.unwrap()
    else {
        panic!("unexpected forward")
    };

    let err = op.wait().await.unwrap_err();
    assert!(err.to_string().contains("not implemented"));
}

#[tokio::test]
async fn test_rename_moves_rows_and_storage() {
    let tmp = tempfile::tempdir().unwrap();
    let state = standalone_state(tmp.path()).await;

    let inst = created_instance(&state, "c1").await;
    inst.snapshot("snap0", None, false).await.unwrap();

    inst.rename("c9").await.unwrap();

    assert!(state.db.get_instance("default", "c9").await.is_ok());
    assert!(state.db.get_instance("default", "c9/snap0").await.is_ok());
    assert!(state.data_dir.join("storage-pools/default/containers/c9").exists());
}

#[tokio::test]
async fn test_delete_requires_stopped() {
    let tmp = tempfile::tempdir().unwrap();
    let state = standalone_state(tmp.path()).await;

    let inst = created_instance(&state, "c1").await;
    inst.start().await.unwrap();

    let err = inst.delete().await.unwrap_err();
    assert!(err.to_string().contains("stopped"));

    inst.stop(false).await.unwrap();
    inst.delete().await.unwrap();
}

#[tokio::test]
async fn test_rebuild_resets_image_keys() {
    let tmp = tempfile::tempdir().unwrap();
    let state = standalone_state(tmp.path()).await;

    let inst = created_instance(&state, "c1").await;

    let mut args = UpdateArgs::from_record(&inst.record());
    args.config.insert("image.os".to_string(), "Ubuntu".to_string());
    inst.update(args, true).await.unwrap();

    let mut props = HashMap::new();
    props.insert("os".to_string(), "Debian".to_string());
    inst.rebuild(Some(("new-fingerprint".to_string(), props))).await.unwrap();

    let config = inst.local_config();
    assert_eq!(config.get("image.os").map(String::as_str), Some("Debian"));
    assert_eq!(config.get("volatile.base_image").map(String::as_str), Some("new-fingerprint"));
}

#[tokio::test]
async fn test_on_stop_operation_setup() {
    let tmp = tempfile::tempdir().unwrap();
    let state = standalone_state(tmp.path()).await;

    let inst = created_instance(&state, "c1").await;

    // With no live operation, a fresh instance-initiated lock is created.
    let op = inst.on_stop_operation_setup("stop").await.unwrap();
    assert_eq!(op.action(), crate::oplock::Action::Stop);
    assert!(op.instance_initiated());
    op.done(None);

    // A reboot target creates a restart lock instead.
    let op = inst.on_stop_operation_setup("reboot").await.unwrap();
    assert_eq!(op.action(), crate::oplock::Action::Restart);
    op.done(None);

    // A live lifecycle lock is picked up rather than replaced.
    let held =
        crate::oplock::create("default", "c1", crate::oplock::Action::Restart, true, false)
            .unwrap();
    let op = inst.on_stop_operation_setup("stop").await.unwrap();
    assert!(Arc::ptr_eq(&held, &op));
    assert!(!op.instance_initiated());
    held.done(None);
}

#[tokio::test]
async fn test_can_migrate_policy() {
    let tmp = tempfile::tempdir().unwrap();
    let state = standalone_state(tmp.path()).await;

    let inst = created_instance(&state, "c1").await;

    // Pool-backed root disk only: migratable.
    assert_eq!(inst.can_migrate(), "migrate");

    // A host-path disk pins the instance.
    let mut args = UpdateArgs::from_record(&inst.record());
    let mut host_disk = DeviceConfig::new();
    host_disk.insert("type".to_string(), "disk".to_string());
    host_disk.insert("path".to_string(), "/mnt".to_string());
    host_disk.insert("source".to_string(), "/srv/data".to_string());
    args.devices.insert("data", host_disk);
    inst.update(args, true).await.unwrap();

    assert_eq!(inst.can_migrate(), "stop");

    // An explicit policy overrides everything.
    let mut args = UpdateArgs::from_record(&inst.record());
    args.config.insert("cluster.evacuate".to_string(), "live-migrate".to_string());
    inst.update(args, true).await.unwrap();

    assert_eq!(inst.can_migrate(), "live-migrate");
}
