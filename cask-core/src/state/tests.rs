use crate::error::CaskError;
use crate::state::StateManager;
use crate::types::acl::{AclRule, NetworkAcl};
use crate::types::{
    BackupParent, BackupRecord, ContentType, Devices, InstanceArgs, InstanceType, Member,
    PoolState, Profile, VolumeType, VOLUME_NODE_REMOTE,
};
use std::collections::HashMap;

fn args(project: &str, name: &str) -> InstanceArgs {
    InstanceArgs {
        project: project.to_string(),
        name: name.to_string(),
        node: "node1".to_string(),
        instance_type: InstanceType::Container,
        architecture: "x86_64".to_string(),
        profiles: vec!["default".to_string()],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_state_manager_init() {
    let manager = StateManager::new_in_memory().await.unwrap();
    drop(manager);
}

#[tokio::test]
async fn test_insert_and_get_instance() {
    let manager = StateManager::new_in_memory().await.unwrap();

    let mut create = args("default", "c1");
    create.config.insert("limits.cpu".to_string(), "2".to_string());

    let record = manager.insert_instance(&create).await.unwrap();
    assert!(record.id > 0);

    let fetched = manager.get_instance("default", "c1").await.unwrap();
    assert_eq!(fetched.name, "c1");
    assert_eq!(fetched.instance_type, InstanceType::Container);
    assert_eq!(fetched.config.get("limits.cpu").unwrap(), "2");
    assert_eq!(fetched.profiles, vec!["default"]);
}

#[tokio::test]
async fn test_duplicate_instance_conflicts() {
    let manager = StateManager::new_in_memory().await.unwrap();

    manager.insert_instance(&args("default", "c1")).await.unwrap();
    let err = manager.insert_instance(&args("default", "c1")).await.unwrap_err();
    assert!(matches!(err, CaskError::InstanceAlreadyExists { .. }));

    // Same name in a different project is fine.
    manager.insert_project("other", &HashMap::new()).await.unwrap();
    manager.insert_instance(&args("other", "c1")).await.unwrap();
}

#[tokio::test]
async fn test_update_instance_config_deletes_empty_values() {
    let manager = StateManager::new_in_memory().await.unwrap();
    let record = manager.insert_instance(&args("default", "c1")).await.unwrap();

    let mut changes = HashMap::new();
    changes.insert("volatile.eth0.hwaddr".to_string(), "00:16:3e:aa:bb:cc".to_string());
    manager.update_instance_config(record.id, &changes).await.unwrap();

    let fetched = manager.get_instance("default", "c1").await.unwrap();
    assert_eq!(fetched.config.get("volatile.eth0.hwaddr").unwrap(), "00:16:3e:aa:bb:cc");

    let mut clear = HashMap::new();
    clear.insert("volatile.eth0.hwaddr".to_string(), String::new());
    manager.update_instance_config(record.id, &clear).await.unwrap();

    let fetched = manager.get_instance("default", "c1").await.unwrap();
    assert!(!fetched.config.contains_key("volatile.eth0.hwaddr"));
}

#[tokio::test]
async fn test_try_insert_instance_config_key_keeps_existing() {
    let manager = StateManager::new_in_memory().await.unwrap();
    let record = manager.insert_instance(&args("default", "c1")).await.unwrap();

    let first =
        manager.try_insert_instance_config_key(record.id, "volatile.uuid", "aaa").await.unwrap();
    assert_eq!(first, "aaa");

    let second =
        manager.try_insert_instance_config_key(record.id, "volatile.uuid", "bbb").await.unwrap();
    assert_eq!(second, "aaa");
}

#[tokio::test]
async fn test_snapshots_ordered_and_deleted_with_parent() {
    let manager = StateManager::new_in_memory().await.unwrap();
    let parent = manager.insert_instance(&args("default", "c1")).await.unwrap();

    for snap in ["snap0", "snap1"] {
        let mut snap_args = args("default", &format!("c1/{}", snap));
        snap_args.snapshot = true;
        manager.insert_instance(&snap_args).await.unwrap();
    }

    let snapshots = manager.get_instance_snapshots("default", "c1").await.unwrap();
    assert_eq!(snapshots.len(), 2);
    assert_eq!(snapshots[0].name, "c1/snap0");
    assert_eq!(snapshots[1].name, "c1/snap1");

    manager.insert_warning("instance", parent.id, "low disk").await.unwrap();

    manager.delete_instance("default", "c1").await.unwrap();
    assert!(manager.get_instance("default", "c1").await.is_err());
    assert!(manager.get_instance("default", "c1/snap0").await.is_err());
    assert!(manager.list_warnings("instance", parent.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rename_instance_renames_snapshots() {
    let manager = StateManager::new_in_memory().await.unwrap();
    manager.insert_instance(&args("default", "c1")).await.unwrap();

    let mut snap_args = args("default", "c1/snap0");
    snap_args.snapshot = true;
    manager.insert_instance(&snap_args).await.unwrap();

    manager.rename_instance("default", "c1", "c2").await.unwrap();
    assert!(manager.get_instance("default", "c2").await.is_ok());
    assert!(manager.get_instance("default", "c2/snap0").await.is_ok());
}

#[tokio::test]
async fn test_profiles_roundtrip_and_missing() {
    let manager = StateManager::new_in_memory().await.unwrap();

    let mut profile = Profile {
        project: "default".to_string(),
        name: "default".to_string(),
        ..Default::default()
    };
    profile.config.insert("limits.memory".to_string(), "1GiB".to_string());
    manager.insert_profile(&profile).await.unwrap();

    let profiles =
        manager.get_profiles("default", &["default".to_string()]).await.unwrap();
    assert_eq!(profiles[0].config.get("limits.memory").unwrap(), "1GiB");

    let err = manager
        .get_profiles("default", &["missing".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, CaskError::BadRequest(_)));
}

#[tokio::test]
async fn test_pool_and_volume_rows() {
    let manager = StateManager::new_in_memory().await.unwrap();

    let pool_id = manager
        .insert_pool("default", "dir", PoolState::Created, &HashMap::new())
        .await
        .unwrap();

    manager.insert_instance(&args("default", "c1")).await.unwrap();
    manager
        .insert_volume(
            pool_id,
            "default",
            "c1",
            VolumeType::Container,
            ContentType::Fs,
            VOLUME_NODE_REMOTE,
            &HashMap::new(),
        )
        .await
        .unwrap();

    let pool_name = manager.get_instance_pool_name("default", "c1").await.unwrap();
    assert_eq!(pool_name, "default");

    // Duplicate volume row is a conflict.
    let err = manager
        .insert_volume(
            pool_id,
            "default",
            "c1",
            VolumeType::Container,
            ContentType::Fs,
            VOLUME_NODE_REMOTE,
            &HashMap::new(),
        )
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    // Deleting the instance removes the volume row too.
    manager.delete_instance("default", "c1").await.unwrap();
    assert!(manager
        .get_volume(pool_id, "default", "c1", VolumeType::Container)
        .await
        .is_err());
}

#[tokio::test]
async fn test_backup_rows_and_expiry() {
    let manager = StateManager::new_in_memory().await.unwrap();
    let record = manager.insert_instance(&args("default", "c1")).await.unwrap();

    let backup = BackupRecord {
        id: 0,
        parent: BackupParent::Instance(record.id),
        name: "b1".to_string(),
        creation_date: 1_000,
        expiry_date: Some(2_000),
        instance_only: false,
        optimized_storage: false,
        compression_algorithm: "gzip".to_string(),
    };

    manager.insert_backup(&backup).await.unwrap();

    let err = manager.insert_backup(&backup).await.unwrap_err();
    assert!(err.is_conflict());

    let expired = manager.list_expired_backups("instance", 2_500).await.unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].name, "b1");

    let not_yet = manager.list_expired_backups("instance", 1_500).await.unwrap();
    assert!(not_yet.is_empty());
}

#[tokio::test]
async fn test_acl_rows() {
    let manager = StateManager::new_in_memory().await.unwrap();

    let acl = NetworkAcl {
        project: "default".to_string(),
        name: "web".to_string(),
        ingress: vec![AclRule {
            action: "allow".to_string(),
            state: "enabled".to_string(),
            protocol: "tcp".to_string(),
            destination_port: "80,443".to_string(),
            ..Default::default()
        }],
        ..Default::default()
    };

    let id = manager.insert_acl(&acl).await.unwrap();

    let fetched = manager.get_acl("default", "web").await.unwrap();
    assert_eq!(fetched.ingress.len(), 1);
    assert_eq!(fetched.ingress[0].destination_port, "80,443");

    let ids = manager.get_acl_ids_by_names("default").await.unwrap();
    assert_eq!(ids.get("web"), Some(&id));

    manager.rename_acl(id, "frontend").await.unwrap();
    assert!(manager.get_acl("default", "web").await.is_err());
    assert!(manager.get_acl("default", "frontend").await.is_ok());
}

#[tokio::test]
async fn test_members_and_counts() {
    let manager = StateManager::new_in_memory().await.unwrap();

    for name in ["node1", "node2"] {
        let member = Member {
            id: 0,
            name: name.to_string(),
            address: format!("10.0.0.{}:8443", name.len()),
            architectures: vec!["x86_64".to_string()],
            groups: vec![],
            heartbeat: 0,
            evacuated: false,
            instance_count: 0,
        };
        manager.insert_member(&member).await.unwrap();
    }

    manager.insert_instance(&args("default", "c1")).await.unwrap();

    let members = manager.list_members().await.unwrap();
    let node1 = members.iter().find(|m| m.name == "node1").unwrap();
    let node2 = members.iter().find(|m| m.name == "node2").unwrap();
    assert_eq!(node1.instance_count, 1);
    assert_eq!(node2.instance_count, 0);
}
