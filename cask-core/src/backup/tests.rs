use super::*;
use crate::context::test_support::standalone_state;
use crate::operations::OperationType;
use crate::types::InstanceType;

async fn make_instance(state: &Arc<State>, name: &str) -> Instance {
    let args = InstanceArgs {
        project: "default".to_string(),
        name: name.to_string(),
        node: "node1".to_string(),
        instance_type: InstanceType::Container,
        architecture: "x86_64".to_string(),
        profiles: vec!["default".to_string()],
        config: [("limits.cpu".to_string(), "2".to_string())].into_iter().collect(),
        ..Default::default()
    };

    let record = state.db.insert_instance(&args).await.unwrap();

    let pool = Pool::load(state.db.clone(), &state.drivers, "default").await.unwrap();
    pool.create_instance(&record).await.unwrap();

    Instance::load(state.clone(), "default", name).await.unwrap()
}

fn rootfs_file(state: &State, name: &str, file: &str) -> PathBuf {
    state
        .data_dir
        .join("storage-pools/default/containers")
        .join(name)
        .join("rootfs")
        .join(file)
}

#[test]
fn test_compression_detection() {
    assert_eq!(CompressionAlgo::detect(&[0x1f, 0x8b, 0x08, 0x00]), CompressionAlgo::Gzip);
    assert_eq!(
        CompressionAlgo::detect(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]),
        CompressionAlgo::Xz
    );
    assert_eq!(CompressionAlgo::detect(&[0x28, 0xb5, 0x2f, 0xfd]), CompressionAlgo::Zstd);
    assert_eq!(CompressionAlgo::detect(b"BZh91AY"), CompressionAlgo::Bzip2);
    assert_eq!(CompressionAlgo::detect(&[0x5d, 0x00, 0x00, 0x80]), CompressionAlgo::Lzma);
    assert_eq!(CompressionAlgo::detect(b"hsqs\x00\x00"), CompressionAlgo::Squashfs);
    assert_eq!(CompressionAlgo::detect(b"ustar"), CompressionAlgo::None);
}

#[test]
fn test_human_bytes() {
    assert_eq!(human_bytes(512), "512B");
    assert_eq!(human_bytes(2048), "2.00kB");
    assert_eq!(human_bytes(3 * 1024 * 1024), "3.00MB");
}

#[tokio::test]
async fn test_backup_roundtrip_compressed() {
    let tmp = tempfile::tempdir().unwrap();
    let state = standalone_state(tmp.path()).await;

    let inst = make_instance(&state, "c1").await;
    std::fs::write(rootfs_file(&state, "c1", "hello"), "payload").unwrap();

    inst.snapshot("snap0", None, false).await.unwrap();

    let op = Operation::new("default", OperationType::BackupCreate);
    let args = BackupCreateArgs {
        name: "b1".to_string(),
        compression_algorithm: "gzip".to_string(),
        ..Default::default()
    };
    backup_create(&state, args, &inst, &op).await.unwrap();

    let tarball =
        crate::paths::instance_backups_dir(&state.data_dir, "default", "c1").join("b1");
    assert!(tarball.exists());

    // The archive is gzip-compressed and carries the index.
    let (index, _, _scratch) = get_info(&state, &tarball).await.unwrap();
    assert_eq!(index.name, "c1");
    assert_eq!(index.pool, "default");
    assert_eq!(index.backend, "dir");
    assert_eq!(index.backup_type, BackupType::Container);
    assert_eq!(index.snapshots, vec!["snap0"]);

    // Restore under a new name and compare definitions.
    let restored =
        restore_from_backup(&state, "default", &tarball, None, Some("c1-r".to_string()))
            .await
            .unwrap();

    assert_eq!(restored.name, "c1-r");
    assert_eq!(restored.architecture, "x86_64");
    assert_eq!(restored.instance_type, InstanceType::Container);
    assert_eq!(restored.profiles, vec!["default"]);
    assert_eq!(restored.config.get("limits.cpu").unwrap(), "2");

    let snapshots = state.db.get_instance_snapshots("default", "c1-r").await.unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].name, "c1-r/snap0");

    let contents = std::fs::read_to_string(rootfs_file(&state, "c1-r", "hello")).unwrap();
    assert_eq!(contents, "payload");
}

#[tokio::test]
async fn test_backup_duplicate_name_conflicts() {
    let tmp = tempfile::tempdir().unwrap();
    let state = standalone_state(tmp.path()).await;

    let inst = make_instance(&state, "c1").await;
    let op = Operation::new("default", OperationType::BackupCreate);

    let args = BackupCreateArgs { name: "b1".to_string(), ..Default::default() };
    backup_create(&state, args.clone(), &inst, &op).await.unwrap();

    let err = backup_create(&state, args, &inst, &op).await.unwrap_err();
    assert!(err.to_string().contains("already exists"));
}

#[tokio::test]
async fn test_optimized_storage_demoted() {
    let tmp = tempfile::tempdir().unwrap();
    let state = standalone_state(tmp.path()).await;

    let inst = make_instance(&state, "c1").await;
    let op = Operation::new("default", OperationType::BackupCreate);

    // The dir driver has no optimized backups, so the request is silently
    // demoted to a generic archive.
    let args = BackupCreateArgs {
        name: "b1".to_string(),
        optimized_storage: true,
        ..Default::default()
    };
    backup_create(&state, args, &inst, &op).await.unwrap();

    let row = state.db.get_instance_backup(inst.id(), "b1").await.unwrap();
    assert!(!row.optimized_storage);
}

#[tokio::test]
async fn test_restore_requires_index_config() {
    let tmp = tempfile::tempdir().unwrap();
    let state = standalone_state(tmp.path()).await;

    // A tar with an index that has no container section is rejected.
    let bogus = BackupIndex {
        name: "c1".to_string(),
        pool: "default".to_string(),
        backend: "dir".to_string(),
        backup_type: BackupType::Container,
        optimized_storage: false,
        optimized_header: false,
        snapshots: vec![],
        config: BackupConfig::default(),
    };

    let tarball = tmp.path().join("bogus.tar");
    storage_backup_write(bogus, tarball.clone(), "none".to_string(), |_| Ok(()))
        .await
        .unwrap();

    let err = restore_from_backup(&state, "default", &tarball, None, None).await.unwrap_err();
    assert!(err.to_string().contains("missing required information"));
}

#[tokio::test]
async fn test_prune_expired_backups() {
    let tmp = tempfile::tempdir().unwrap();
    let state = standalone_state(tmp.path()).await;

    let inst = make_instance(&state, "c1").await;
    let op = Operation::new("default", OperationType::BackupCreate);

    // Already expired at creation time.
    let args = BackupCreateArgs {
        name: "b1".to_string(),
        expiry_date: Some(crate::types::unix_now() - 10),
        ..Default::default()
    };
    backup_create(&state, args, &inst, &op).await.unwrap();

    let tarball =
        crate::paths::instance_backups_dir(&state.data_dir, "default", "c1").join("b1");
    assert!(tarball.exists());

    prune_expired_backups(&state).await.unwrap();

    assert!(!tarball.exists());
    assert!(state.db.get_instance_backup(inst.id(), "b1").await.is_err());
}
