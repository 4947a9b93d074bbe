//! Plain directory storage driver.
//!
//! The generic reference driver: every volume is a directory under the pool
//! mountpoint. No optimized images or backups, not remote, no direct I/O.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::error::{CaskError, Result};
use crate::migration::{MigrationFsType, MigrationType};
use crate::revert::Hook;
use crate::storage::{DriverInfo, InstanceVolume, PoolDriver, PostHook, TarBuilder};
use crate::types::{BackupIndex, ContentType, PoolRecord, VolumeType};

/// Directory-backed storage driver.
#[derive(Default)]
pub struct DirDriver;

impl DirDriver {
    pub fn new() -> Self {
        Self
    }

    fn pool_dir(pool: &PoolRecord) -> PathBuf {
        match pool.config.get("source") {
            Some(source) if !source.is_empty() => PathBuf::from(source),
            _ => crate::paths::pool_mount_dir(&crate::paths::data_dir(), &pool.name),
        }
    }

    fn type_dir(volume_type: VolumeType) -> &'static str {
        match volume_type {
            VolumeType::Container => "containers",
            VolumeType::Vm => "virtual-machines",
            VolumeType::Custom => "custom",
            VolumeType::Image => "images",
            VolumeType::Bucket => "buckets",
        }
    }

    /// Directory backing a volume. Snapshot volumes (`parent/snap` names)
    /// live under a `-snapshots` sibling tree.
    fn volume_dir(pool: &PoolRecord, vol: &InstanceVolume) -> PathBuf {
        let (parent, snapshot) = crate::types::parent_and_snapshot_name(&vol.name);
        let encoded = crate::paths::project_instance(&vol.project, parent);

        match snapshot {
            None => Self::pool_dir(pool).join(Self::type_dir(vol.volume_type)).join(encoded),
            Some(snap) => Self::pool_dir(pool)
                .join(format!("{}-snapshots", Self::type_dir(vol.volume_type)))
                .join(encoded)
                .join(snap),
        }
    }

    /// Root of a volume's snapshot tree.
    fn snapshots_dir(pool: &PoolRecord, vol: &InstanceVolume) -> PathBuf {
        let (parent, _) = crate::types::parent_and_snapshot_name(&vol.name);
        let encoded = crate::paths::project_instance(&vol.project, parent);

        Self::pool_dir(pool)
            .join(format!("{}-snapshots", Self::type_dir(vol.volume_type)))
            .join(encoded)
    }
}

/// Copy a directory tree. Runs on the blocking pool.
fn copy_dir_all(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;

    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());

        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }

    Ok(())
}

async fn blocking_io<T, F>(path: PathBuf, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CaskError::Internal(e.to_string()))?
        .map_err(|e| crate::error::io_error(path, e))
}

#[async_trait]
impl PoolDriver for DirDriver {
    fn info(&self) -> DriverInfo {
        DriverInfo {
            name: "dir",
            version: "1",
            optimized_images: false,
            optimized_backups: false,
            optimized_backup_header: false,
            direct_io: true,
            remote: false,
            volume_types: vec![
                VolumeType::Container,
                VolumeType::Vm,
                VolumeType::Custom,
                VolumeType::Image,
                VolumeType::Bucket,
            ],
        }
    }

    fn validate(&self, config: &HashMap<String, String>) -> Result<()> {
        for key in config.keys() {
            if key != "source" && !crate::types::is_user_config(key) {
                return Err(CaskError::BadRequest(format!("Invalid pool option {:?}", key)));
            }
        }

        Ok(())
    }

    #[instrument(skip(self, pool), fields(pool = %pool.name))]
    async fn create(&self, pool: &PoolRecord) -> Result<()> {
        let dir = Self::pool_dir(pool);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| crate::error::io_error(&dir, e))?;
        Ok(())
    }

    #[instrument(skip(self, pool), fields(pool = %pool.name))]
    async fn delete(&self, pool: &PoolRecord) -> Result<()> {
        let dir = Self::pool_dir(pool);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await.map_err(|e| crate::error::io_error(&dir, e))?;
        }
        Ok(())
    }

    async fn mount(&self, pool: &PoolRecord) -> Result<bool> {
        let dir = Self::pool_dir(pool);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| crate::error::io_error(&dir, e))?;
        Ok(false)
    }

    async fn unmount(&self, _pool: &PoolRecord) -> Result<bool> {
        Ok(false)
    }

    async fn update(&self, _pool: &PoolRecord, changes: &HashMap<String, String>) -> Result<()> {
        if changes.contains_key("source") {
            return Err(CaskError::BadRequest("Pool source cannot be changed".to_string()));
        }

        Ok(())
    }

    async fn create_instance(&self, pool: &PoolRecord, vol: &InstanceVolume) -> Result<()> {
        let dir = Self::volume_dir(pool, vol).join("rootfs");
        tokio::fs::create_dir_all(&dir).await.map_err(|e| crate::error::io_error(&dir, e))?;
        Ok(())
    }

    async fn create_instance_from_image(
        &self,
        pool: &PoolRecord,
        vol: &InstanceVolume,
        fingerprint: &str,
    ) -> Result<()> {
        let dir = Self::volume_dir(pool, vol);
        let rootfs = dir.join("rootfs");
        tokio::fs::create_dir_all(&rootfs)
            .await
            .map_err(|e| crate::error::io_error(&rootfs, e))?;

        // The image cache collaborator populates the rootfs; record the
        // origin fingerprint alongside it.
        let marker = dir.join("image.fingerprint");
        tokio::fs::write(&marker, fingerprint)
            .await
            .map_err(|e| crate::error::io_error(&marker, e))?;

        Ok(())
    }

    async fn create_instance_from_backup(
        &self,
        pool: &PoolRecord,
        index: &BackupIndex,
        tarball: &Path,
    ) -> Result<(PostHook, Hook)> {
        let container = index.config.container.as_ref().ok_or_else(|| {
            CaskError::BadRequest("Backup file is missing required information".to_string())
        })?;

        let vol = InstanceVolume {
            project: container.project.clone(),
            name: index.name.clone(),
            volume_type: VolumeType::for_instance(container.instance_type),
        };

        let vol_dir = Self::volume_dir(pool, &vol);
        let snaps_dir = Self::snapshots_dir(pool, &vol);
        let tarball = tarball.to_path_buf();

        let unpack_vol = vol_dir.clone();
        let unpack_snaps = snaps_dir.clone();
        blocking_io(tarball.clone(), move || {
            let file = std::fs::File::open(&tarball)?;
            let mut archive = tar::Archive::new(file);

            for entry in archive.entries()? {
                let mut entry = entry?;
                let path = entry.path()?.into_owned();

                // Only well-known prefixes; anything else (index.yaml) is
                // metadata handled by the backup layer.
                let target = if let Ok(rest) = path.strip_prefix("backup/container") {
                    unpack_vol.join(rest)
                } else if let Ok(rest) = path.strip_prefix("backup/snapshots") {
                    unpack_snaps.join(rest)
                } else {
                    continue;
                };

                if target
                    .components()
                    .any(|c| matches!(c, std::path::Component::ParentDir))
                {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "Backup entry escapes the volume directory",
                    ));
                }

                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }

                if entry.header().entry_type().is_dir() {
                    std::fs::create_dir_all(&target)?;
                } else {
                    entry.unpack(&target)?;
                }
            }

            Ok(())
        })
        .await?;

        debug!(pool = %pool.name, instance = %vol.name, "Unpacked backup onto dir pool");

        let post: PostHook = Arc::new(|| Box::pin(async {}));

        let revert_vol = vol_dir;
        let revert_snaps = snaps_dir;
        let revert: Hook = Arc::new(move || {
            let vol = revert_vol.clone();
            let snaps = revert_snaps.clone();
            Box::pin(async move {
                let _ = tokio::fs::remove_dir_all(vol).await;
                let _ = tokio::fs::remove_dir_all(snaps).await;
            })
        });

        Ok((post, revert))
    }

    async fn delete_instance(&self, pool: &PoolRecord, vol: &InstanceVolume) -> Result<()> {
        for dir in [Self::volume_dir(pool, vol), Self::snapshots_dir(pool, vol)] {
            if dir.exists() {
                tokio::fs::remove_dir_all(&dir)
                    .await
                    .map_err(|e| crate::error::io_error(&dir, e))?;
            }
        }

        Ok(())
    }

    async fn mount_instance(&self, pool: &PoolRecord, vol: &InstanceVolume) -> Result<PathBuf> {
        let dir = Self::volume_dir(pool, vol);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| crate::error::io_error(&dir, e))?;
        Ok(dir)
    }

    async fn unmount_instance(&self, _pool: &PoolRecord, _vol: &InstanceVolume) -> Result<()> {
        Ok(())
    }

    async fn create_instance_snapshot(
        &self,
        pool: &PoolRecord,
        snapshot: &InstanceVolume,
        parent: &InstanceVolume,
    ) -> Result<()> {
        let src = Self::volume_dir(pool, parent);
        let dst = Self::volume_dir(pool, snapshot);

        blocking_io(dst.clone(), move || copy_dir_all(&src, &dst)).await
    }

    async fn delete_instance_snapshot(
        &self,
        pool: &PoolRecord,
        snapshot: &InstanceVolume,
    ) -> Result<()> {
        let dir = Self::volume_dir(pool, snapshot);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await.map_err(|e| crate::error::io_error(&dir, e))?;
        }

        Ok(())
    }

    async fn rename_instance(
        &self,
        pool: &PoolRecord,
        vol: &InstanceVolume,
        new_name: &str,
    ) -> Result<()> {
        let new_vol = InstanceVolume {
            project: vol.project.clone(),
            name: new_name.to_string(),
            volume_type: vol.volume_type,
        };

        let src = Self::volume_dir(pool, vol);
        let dst = Self::volume_dir(pool, &new_vol);
        if src.exists() {
            tokio::fs::rename(&src, &dst).await.map_err(|e| crate::error::io_error(&dst, e))?;
        }

        let src_snaps = Self::snapshots_dir(pool, vol);
        let dst_snaps = Self::snapshots_dir(pool, &new_vol);
        if src_snaps.exists() {
            tokio::fs::rename(&src_snaps, &dst_snaps)
                .await
                .map_err(|e| crate::error::io_error(&dst_snaps, e))?;
        }

        Ok(())
    }

    async fn refresh_instance(
        &self,
        pool: &PoolRecord,
        vol: &InstanceVolume,
        source: &InstanceVolume,
    ) -> Result<()> {
        let dst = Self::volume_dir(pool, vol);
        let src = Self::volume_dir(pool, source);

        blocking_io(dst.clone(), move || {
            if dst.exists() {
                std::fs::remove_dir_all(&dst)?;
            }
            copy_dir_all(&src, &dst)
        })
        .await
    }

    async fn restore_instance(
        &self,
        pool: &PoolRecord,
        vol: &InstanceVolume,
        snapshot_name: &str,
    ) -> Result<()> {
        let snap_vol = InstanceVolume {
            project: vol.project.clone(),
            name: format!("{}{}{}", vol.name, crate::types::SNAPSHOT_DELIMITER, snapshot_name),
            volume_type: vol.volume_type,
        };

        let src = Self::volume_dir(pool, &snap_vol);
        if !src.exists() {
            return Err(CaskError::NotFound(format!("Snapshot {:?}", snapshot_name)));
        }

        let dst = Self::volume_dir(pool, vol);
        blocking_io(dst.clone(), move || {
            if dst.exists() {
                std::fs::remove_dir_all(&dst)?;
            }
            copy_dir_all(&src, &dst)
        })
        .await
    }

    fn backup_instance(
        &self,
        pool: &PoolRecord,
        vol: &InstanceVolume,
        tar: &mut TarBuilder,
        _optimized: bool,
        snapshots: &[String],
    ) -> Result<()> {
        let vol_dir = Self::volume_dir(pool, vol);
        tar.append_dir_all("backup/container", &vol_dir)
            .map_err(|e| crate::error::io_error(&vol_dir, e))?;

        for snapshot in snapshots {
            let snap_vol = InstanceVolume {
                project: vol.project.clone(),
                name: format!("{}{}{}", vol.name, crate::types::SNAPSHOT_DELIMITER, snapshot),
                volume_type: vol.volume_type,
            };

            let snap_dir = Self::volume_dir(pool, &snap_vol);
            tar.append_dir_all(format!("backup/snapshots/{}", snapshot), &snap_dir)
                .map_err(|e| crate::error::io_error(&snap_dir, e))?;
        }

        Ok(())
    }

    async fn create_custom_volume(
        &self,
        pool: &PoolRecord,
        project: &str,
        name: &str,
        _content_type: ContentType,
    ) -> Result<()> {
        let vol = InstanceVolume {
            project: project.to_string(),
            name: name.to_string(),
            volume_type: VolumeType::Custom,
        };

        let dir = Self::volume_dir(pool, &vol);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| crate::error::io_error(&dir, e))?;
        Ok(())
    }

    async fn delete_custom_volume(
        &self,
        pool: &PoolRecord,
        project: &str,
        name: &str,
    ) -> Result<()> {
        let vol = InstanceVolume {
            project: project.to_string(),
            name: name.to_string(),
            volume_type: VolumeType::Custom,
        };

        let dir = Self::volume_dir(pool, &vol);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await.map_err(|e| crate::error::io_error(&dir, e))?;
        }

        Ok(())
    }

    fn backup_custom_volume(
        &self,
        pool: &PoolRecord,
        project: &str,
        name: &str,
        tar: &mut TarBuilder,
        snapshots: &[String],
    ) -> Result<()> {
        let vol = InstanceVolume {
            project: project.to_string(),
            name: name.to_string(),
            volume_type: VolumeType::Custom,
        };

        let dir = Self::volume_dir(pool, &vol);
        tar.append_dir_all("backup/volume", &dir).map_err(|e| crate::error::io_error(&dir, e))?;

        for snapshot in snapshots {
            let snap_vol = InstanceVolume {
                project: project.to_string(),
                name: format!("{}{}{}", name, crate::types::SNAPSHOT_DELIMITER, snapshot),
                volume_type: VolumeType::Custom,
            };

            let snap_dir = Self::volume_dir(pool, &snap_vol);
            tar.append_dir_all(format!("backup/volume-snapshots/{}", snapshot), &snap_dir)
                .map_err(|e| crate::error::io_error(&snap_dir, e))?;
        }

        Ok(())
    }

    async fn create_bucket(&self, pool: &PoolRecord, project: &str, name: &str) -> Result<()> {
        let vol = InstanceVolume {
            project: project.to_string(),
            name: name.to_string(),
            volume_type: VolumeType::Bucket,
        };

        let dir = Self::volume_dir(pool, &vol);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| crate::error::io_error(&dir, e))?;
        Ok(())
    }

    async fn delete_bucket(&self, pool: &PoolRecord, project: &str, name: &str) -> Result<()> {
        let vol = InstanceVolume {
            project: project.to_string(),
            name: name.to_string(),
            volume_type: VolumeType::Bucket,
        };

        let dir = Self::volume_dir(pool, &vol);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await.map_err(|e| crate::error::io_error(&dir, e))?;
        }

        Ok(())
    }

    fn backup_bucket(
        &self,
        pool: &PoolRecord,
        project: &str,
        name: &str,
        tar: &mut TarBuilder,
    ) -> Result<()> {
        let vol = InstanceVolume {
            project: project.to_string(),
            name: name.to_string(),
            volume_type: VolumeType::Bucket,
        };

        let dir = Self::volume_dir(pool, &vol);
        tar.append_dir_all("backup/bucket", &dir).map_err(|e| crate::error::io_error(&dir, e))?;

        Ok(())
    }

    fn migration_types(
        &self,
        content_type: ContentType,
        _refresh: bool,
        _copy_snapshots: bool,
        _cluster_move: bool,
        _storage_move: bool,
    ) -> Vec<MigrationType> {
        let rsync_features =
            vec!["xattrs".to_string(), "delete".to_string(), "bidirectional".to_string()];

        match content_type {
            ContentType::Fs => vec![MigrationType {
                fs_type: MigrationFsType::Rsync,
                features: rsync_features,
            }],
            ContentType::Block => vec![
                MigrationType { fs_type: MigrationFsType::BlockAndRsync, features: Vec::new() },
                MigrationType { fs_type: MigrationFsType::Rsync, features: rsync_features },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(dir: &Path) -> PoolRecord {
        let mut config = HashMap::new();
        config.insert("source".to_string(), dir.to_string_lossy().to_string());

        PoolRecord {
            id: 1,
            name: "default".to_string(),
            driver: "dir".to_string(),
            description: String::new(),
            state: crate::types::PoolState::Created,
            config,
        }
    }

    fn vol(name: &str) -> InstanceVolume {
        InstanceVolume {
            project: "default".to_string(),
            name: name.to_string(),
            volume_type: VolumeType::Container,
        }
    }

    #[tokio::test]
    async fn test_instance_volume_lifecycle() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = pool(tmp.path());
        let driver = DirDriver::new();

        driver.create(&pool).await.unwrap();
        driver.create_instance(&pool, &vol("c1")).await.unwrap();
        assert!(tmp.path().join("containers/c1/rootfs").exists());

        driver.create_instance_snapshot(&pool, &vol("c1/snap0"), &vol("c1")).await.unwrap();
        assert!(tmp.path().join("containers-snapshots/c1/snap0/rootfs").exists());

        driver.rename_instance(&pool, &vol("c1"), "c2").await.unwrap();
        assert!(tmp.path().join("containers/c2").exists());
        assert!(tmp.path().join("containers-snapshots/c2/snap0").exists());

        driver.delete_instance(&pool, &vol("c2")).await.unwrap();
        assert!(!tmp.path().join("containers/c2").exists());
        assert!(!tmp.path().join("containers-snapshots/c2").exists());
    }

    #[tokio::test]
    async fn test_restore_from_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = pool(tmp.path());
        let driver = DirDriver::new();

        driver.create(&pool).await.unwrap();
        driver.create_instance(&pool, &vol("c1")).await.unwrap();

        let marker = tmp.path().join("containers/c1/rootfs/before");
        std::fs::write(&marker, "v1").unwrap();

        driver.create_instance_snapshot(&pool, &vol("c1/snap0"), &vol("c1")).await.unwrap();

        std::fs::write(tmp.path().join("containers/c1/rootfs/after"), "v2").unwrap();
        std::fs::remove_file(&marker).unwrap();

        driver.restore_instance(&pool, &vol("c1"), "snap0").await.unwrap();
        assert!(tmp.path().join("containers/c1/rootfs/before").exists());
        assert!(!tmp.path().join("containers/c1/rootfs/after").exists());
    }

    #[test]
    fn test_migration_types_fallback() {
        let driver = DirDriver::new();

        let fs = driver.migration_types(ContentType::Fs, false, true, false, false);
        assert_eq!(fs[0].fs_type, MigrationFsType::Rsync);

        let block = driver.migration_types(ContentType::Block, false, true, false, false);
        assert_eq!(block[0].fs_type, MigrationFsType::BlockAndRsync);
        assert!(block.iter().any(|t| t.fs_type == MigrationFsType::Rsync));
    }
}
