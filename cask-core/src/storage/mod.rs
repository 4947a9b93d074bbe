//! Storage pool contract and pool wrapper.
//!
//! A [`PoolDriver`] implements the per-driver operations the lifecycle
//! invokes; a [`Pool`] couples a driver with the pool's database row and
//! keeps volume rows consistent with on-disk state. The `dir` driver in this
//! crate is the generic reference implementation; production drivers live
//! behind the same trait.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{info, instrument};

use crate::error::{CaskError, Result};
use crate::migration::MigrationType;
use crate::revert::Hook;
use crate::state::StateManager;
use crate::types::{
    BackupIndex, ContentType, InstanceRecord, PoolRecord, VolumeType, VOLUME_NODE_REMOTE,
};

pub mod dir;

/// Writer type handed to drivers appending backup data to a tarball.
pub type TarBuilder = tar::Builder<Box<dyn Write + Send>>;

/// Hook run after a backup restore once the instance exists in the database
/// (typically unmounts scratch state).
pub type PostHook = Hook;

/// Static facts about a driver.
#[derive(Debug, Clone)]
pub struct DriverInfo {
    pub name: &'static str,
    pub version: &'static str,
    /// Driver keeps unpacked images in its own format.
    pub optimized_images: bool,
    /// Driver contributes its own on-disk format to backups.
    pub optimized_backups: bool,
    /// Optimized backups carry a driver-specific header.
    pub optimized_backup_header: bool,
    /// Volumes support direct I/O.
    pub direct_io: bool,
    /// Pool contents are visible from every cluster member.
    pub remote: bool,
    pub volume_types: Vec<VolumeType>,
}

/// Identity of an instance volume as the driver sees it.
#[derive(Debug, Clone)]
pub struct InstanceVolume {
    pub project: String,
    pub name: String,
    pub volume_type: VolumeType,
}

impl InstanceVolume {
    pub fn for_record(record: &InstanceRecord) -> Self {
        Self {
            project: record.project.clone(),
            name: record.name.clone(),
            volume_type: VolumeType::for_instance(record.instance_type),
        }
    }
}

/// The per-pool operations the lifecycle invokes.
#[async_trait]
pub trait PoolDriver: Send + Sync {
    /// Static facts about the driver.
    fn info(&self) -> DriverInfo;

    /// Validate pool config before creation or update.
    fn validate(&self, config: &HashMap<String, String>) -> Result<()>;

    // Pool lifecycle.
    async fn create(&self, pool: &PoolRecord) -> Result<()>;
    async fn delete(&self, pool: &PoolRecord) -> Result<()>;
    async fn mount(&self, pool: &PoolRecord) -> Result<bool>;
    async fn unmount(&self, pool: &PoolRecord) -> Result<bool>;
    async fn update(&self, pool: &PoolRecord, changes: &HashMap<String, String>) -> Result<()>;

    // Instance volumes.
    async fn create_instance(&self, pool: &PoolRecord, vol: &InstanceVolume) -> Result<()>;
    async fn create_instance_from_image(
        &self,
        pool: &PoolRecord,
        vol: &InstanceVolume,
        fingerprint: &str,
    ) -> Result<()>;
    async fn create_instance_from_backup(
        &self,
        pool: &PoolRecord,
        index: &BackupIndex,
        tarball: &std::path::Path,
    ) -> Result<(PostHook, Hook)>;
    async fn delete_instance(&self, pool: &PoolRecord, vol: &InstanceVolume) -> Result<()>;
    async fn mount_instance(&self, pool: &PoolRecord, vol: &InstanceVolume) -> Result<PathBuf>;
    async fn unmount_instance(&self, pool: &PoolRecord, vol: &InstanceVolume) -> Result<()>;
    async fn create_instance_snapshot(
        &self,
        pool: &PoolRecord,
        snapshot: &InstanceVolume,
        parent: &InstanceVolume,
    ) -> Result<()>;
    async fn delete_instance_snapshot(
        &self,
        pool: &PoolRecord,
        snapshot: &InstanceVolume,
    ) -> Result<()>;
    async fn rename_instance(
        &self,
        pool: &PoolRecord,
        vol: &InstanceVolume,
        new_name: &str,
    ) -> Result<()>;
    async fn refresh_instance(
        &self,
        pool: &PoolRecord,
        vol: &InstanceVolume,
        source: &InstanceVolume,
    ) -> Result<()>;
    async fn restore_instance(
        &self,
        pool: &PoolRecord,
        vol: &InstanceVolume,
        snapshot_name: &str,
    ) -> Result<()>;

    /// Append the instance's data (and optionally its snapshots) to an open
    /// backup tarball.
    fn backup_instance(
        &self,
        pool: &PoolRecord,
        vol: &InstanceVolume,
        tar: &mut TarBuilder,
        optimized: bool,
        snapshots: &[String],
    ) -> Result<()>;

    // Custom volumes and buckets.
    async fn create_custom_volume(
        &self,
        pool: &PoolRecord,
        project: &str,
        name: &str,
        content_type: ContentType,
    ) -> Result<()>;
    async fn delete_custom_volume(&self, pool: &PoolRecord, project: &str, name: &str)
        -> Result<()>;
    fn backup_custom_volume(
        &self,
        pool: &PoolRecord,
        project: &str,
        name: &str,
        tar: &mut TarBuilder,
        snapshots: &[String],
    ) -> Result<()>;
    async fn create_bucket(&self, pool: &PoolRecord, project: &str, name: &str) -> Result<()>;
    async fn delete_bucket(&self, pool: &PoolRecord, project: &str, name: &str) -> Result<()>;
    fn backup_bucket(
        &self,
        pool: &PoolRecord,
        project: &str,
        name: &str,
        tar: &mut TarBuilder,
    ) -> Result<()>;

    /// Ordered transport offers; the first entry is preferred and an
    /// rsync-style entry must always be present as the fallback.
    fn migration_types(
        &self,
        content_type: ContentType,
        refresh: bool,
        copy_snapshots: bool,
        cluster_move: bool,
        storage_move: bool,
    ) -> Vec<MigrationType>;
}

/// Registry of loaded storage drivers.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn PoolDriver>>,
}

impl DriverRegistry {
    /// Registry preloaded with the built-in drivers.
    pub fn with_builtin() -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(dir::DirDriver::new()));
        registry
    }

    pub fn register(&mut self, driver: Arc<dyn PoolDriver>) {
        self.drivers.insert(driver.info().name.to_string(), driver);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn PoolDriver>> {
        self.drivers
            .get(name)
            .cloned()
            .ok_or_else(|| CaskError::BadRequest(format!("Unknown storage driver {:?}", name)))
    }

    /// Names of registered drivers whose pools are remote (shared).
    pub fn remote_driver_names(&self) -> Vec<String> {
        self.drivers
            .values()
            .filter(|d| d.info().remote)
            .map(|d| d.info().name.to_string())
            .collect()
    }
}

/// Pools currently unavailable on this member (driver failed to mount).
static UNAVAILABLE_POOLS: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Whether a pool is currently usable on this member.
pub fn is_available(pool_name: &str) -> bool {
    !UNAVAILABLE_POOLS.lock().unwrap().contains(pool_name)
}

/// Mark a pool unavailable or restore it.
pub fn set_available(pool_name: &str, available: bool) {
    let mut pools = UNAVAILABLE_POOLS.lock().unwrap();
    if available {
        pools.remove(pool_name);
    } else {
        pools.insert(pool_name.to_string());
    }
}

/// A storage pool: database row plus driver, keeping volume rows and
/// on-disk state consistent.
#[derive(Clone)]
pub struct Pool {
    record: PoolRecord,
    driver: Arc<dyn PoolDriver>,
    state: Arc<StateManager>,
}

impl Pool {
    /// Load a pool by name.
    pub async fn load(
        state: Arc<StateManager>,
        registry: &DriverRegistry,
        name: &str,
    ) -> Result<Self> {
        let record = state.get_pool(name).await?;
        let driver = registry.get(&record.driver)?;

        Ok(Self { record, driver, state })
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn record(&self) -> &PoolRecord {
        &self.record
    }

    pub fn driver(&self) -> &Arc<dyn PoolDriver> {
        &self.driver
    }

    /// Whether volumes on this pool are reachable from every member.
    pub fn is_remote(&self) -> bool {
        self.driver.info().remote
    }

    /// Node id to record on new volume rows for this pool.
    fn volume_node_id(&self) -> i64 {
        // Remote pools share one volume row across the cluster.
        VOLUME_NODE_REMOTE
    }

    /// Create the instance's volume row and on-disk volume.
    #[instrument(skip(self, record), fields(pool = %self.record.name, instance = %record.name))]
    pub async fn create_instance(&self, record: &InstanceRecord) -> Result<()> {
        let vol = InstanceVolume::for_record(record);

        self.state
            .insert_volume(
                self.record.id,
                &vol.project,
                &vol.name,
                vol.volume_type,
                ContentType::Fs,
                self.volume_node_id(),
                &HashMap::new(),
            )
            .await?;

        let result = self.driver.create_instance(&self.record, &vol).await;
        if let Err(e) = result {
            // Roll the row back so no orphan volume row survives.
            if let Ok(row) = self
                .state
                .get_volume(self.record.id, &vol.project, &vol.name, vol.volume_type)
                .await
            {
                let _ = self.state.delete_volume(row.id).await;
            }

            return Err(e);
        }

        info!(pool = %self.record.name, instance = %record.name, "Created instance volume");
        Ok(())
    }

    /// Create the instance volume from an image.
    #[instrument(skip(self, record), fields(pool = %self.record.name, instance = %record.name))]
    pub async fn create_instance_from_image(
        &self,
        record: &InstanceRecord,
        fingerprint: &str,
    ) -> Result<()> {
        let vol = InstanceVolume::for_record(record);

        self.state
            .insert_volume(
                self.record.id,
                &vol.project,
                &vol.name,
                vol.volume_type,
                ContentType::Fs,
                self.volume_node_id(),
                &HashMap::new(),
            )
            .await?;

        let result =
            self.driver.create_instance_from_image(&self.record, &vol, fingerprint).await;
        if let Err(e) = result {
            if let Ok(row) = self
                .state
                .get_volume(self.record.id, &vol.project, &vol.name, vol.volume_type)
                .await
            {
                let _ = self.state.delete_volume(row.id).await;
            }

            return Err(e);
        }

        Ok(())
    }

    /// Unpack a backup tarball onto the pool before the instance exists in
    /// the database. Returns (post hook, revert hook).
    pub async fn create_instance_from_backup(
        &self,
        index: &BackupIndex,
        tarball: &std::path::Path,
    ) -> Result<(PostHook, Hook)> {
        self.driver.create_instance_from_backup(&self.record, index, tarball).await
    }

    /// Delete the instance's on-disk volume and its row.
    #[instrument(skip(self, record), fields(pool = %self.record.name, instance = %record.name))]
    pub async fn delete_instance(&self, record: &InstanceRecord) -> Result<()> {
        let vol = InstanceVolume::for_record(record);

        self.driver.delete_instance(&self.record, &vol).await?;

        if let Ok(row) = self
            .state
            .get_volume(self.record.id, &vol.project, &vol.name, vol.volume_type)
            .await
        {
            self.state.delete_volume(row.id).await?;
        }

        Ok(())
    }

    /// Mount the instance volume, returning the mountpoint.
    pub async fn mount_instance(&self, record: &InstanceRecord) -> Result<PathBuf> {
        self.driver.mount_instance(&self.record, &InstanceVolume::for_record(record)).await
    }

    /// Unmount the instance volume.
    pub async fn unmount_instance(&self, record: &InstanceRecord) -> Result<()> {
        self.driver.unmount_instance(&self.record, &InstanceVolume::for_record(record)).await
    }

    /// Snapshot an instance volume (snapshot row already exists).
    #[instrument(skip(self, snapshot, parent), fields(pool = %self.record.name, snapshot = %snapshot.name))]
    pub async fn create_instance_snapshot(
        &self,
        snapshot: &InstanceRecord,
        parent: &InstanceRecord,
    ) -> Result<()> {
        let snap_vol = InstanceVolume::for_record(snapshot);
        let parent_vol = InstanceVolume::for_record(parent);

        self.state
            .insert_volume(
                self.record.id,
                &snap_vol.project,
                &snap_vol.name,
                snap_vol.volume_type,
                ContentType::Fs,
                self.volume_node_id(),
                &HashMap::new(),
            )
            .await?;

        let result =
            self.driver.create_instance_snapshot(&self.record, &snap_vol, &parent_vol).await;
        if let Err(e) = result {
            if let Ok(row) = self
                .state
                .get_volume(self.record.id, &snap_vol.project, &snap_vol.name, snap_vol.volume_type)
                .await
            {
                let _ = self.state.delete_volume(row.id).await;
            }

            return Err(e);
        }

        Ok(())
    }

    /// Delete a snapshot volume and its row.
    pub async fn delete_instance_snapshot(&self, snapshot: &InstanceRecord) -> Result<()> {
        let vol = InstanceVolume::for_record(snapshot);
        self.driver.delete_instance_snapshot(&self.record, &vol).await?;

        if let Ok(row) = self
            .state
            .get_volume(self.record.id, &vol.project, &vol.name, vol.volume_type)
            .await
        {
            self.state.delete_volume(row.id).await?;
        }

        Ok(())
    }

    /// Rename the instance volume and its row.
    pub async fn rename_instance(&self, record: &InstanceRecord, new_name: &str) -> Result<()> {
        let vol = InstanceVolume::for_record(record);
        self.driver.rename_instance(&self.record, &vol, new_name).await?;

        if let Ok(row) = self
            .state
            .get_volume(self.record.id, &vol.project, &vol.name, vol.volume_type)
            .await
        {
            self.state.rename_volume(row.id, new_name).await?;
        }

        Ok(())
    }

    /// Restore the instance volume from one of its snapshots.
    pub async fn restore_instance(
        &self,
        record: &InstanceRecord,
        snapshot_name: &str,
    ) -> Result<()> {
        self.driver
            .restore_instance(&self.record, &InstanceVolume::for_record(record), snapshot_name)
            .await
    }

    /// Append instance data to a backup tarball.
    pub fn backup_instance(
        &self,
        record: &InstanceRecord,
        tar: &mut TarBuilder,
        optimized: bool,
        snapshots: &[String],
    ) -> Result<()> {
        self.driver.backup_instance(
            &self.record,
            &InstanceVolume::for_record(record),
            tar,
            optimized,
            snapshots,
        )
    }

    /// Generate the structured data serialised into `backup/index.yaml`.
    pub async fn generate_instance_backup_config(
        &self,
        record: &InstanceRecord,
        snapshots: bool,
    ) -> Result<crate::types::BackupConfig> {
        let snapshot_records = if snapshots {
            self.state.get_instance_snapshots(&record.project, &record.name).await?
        } else {
            Vec::new()
        };

        Ok(crate::types::BackupConfig {
            container: Some(record.clone()),
            snapshots: snapshot_records,
            volume: None,
            bucket: None,
        })
    }

    /// Transport offers for migrating volumes off this pool.
    pub fn migration_types(
        &self,
        content_type: ContentType,
        refresh: bool,
        copy_snapshots: bool,
        cluster_move: bool,
        storage_move: bool,
    ) -> Vec<MigrationType> {
        self.driver.migration_types(content_type, refresh, copy_snapshots, cluster_move, storage_move)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_availability_flag() {
        assert!(is_available("pool-a"));
        set_available("pool-a", false);
        assert!(!is_available("pool-a"));
        set_available("pool-a", true);
        assert!(is_available("pool-a"));
    }

    #[test]
    fn test_registry_remote_names() {
        let registry = DriverRegistry::with_builtin();
        assert!(registry.get("dir").is_ok());
        assert!(registry.get("zfs").is_err());
        assert!(registry.remote_driver_names().is_empty());
    }
}
