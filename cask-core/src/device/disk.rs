//! Disk devices.

use async_trait::async_trait;
use std::path::PathBuf;

use crate::device::{CommonDevice, Device, MountEntry, RunConfig};
use crate::error::{CaskError, Result};
use crate::types::{DeviceConfig, Devices};

/// A disk mount: either a pool-backed volume (`pool`) or a host path
/// (`source`). The root disk is `path=/` with a pool.
pub struct Disk {
    common: CommonDevice,
}

impl Disk {
    pub(crate) fn new(common: CommonDevice) -> Result<Self> {
        common.check_known_keys(&[
            "path",
            "pool",
            "source",
            "size",
            "readonly",
            "boot.priority",
        ])?;

        let path = common.value("path");
        let pool = common.value("pool");
        let source = common.value("source");

        if path.is_empty() {
            return Err(CaskError::BadRequest("Disk requires a \"path\" option".to_string()));
        }

        if path == "/" {
            if pool.is_empty() {
                return Err(CaskError::BadRequest(
                    "Root disk requires a \"pool\" option".to_string(),
                ));
            }

            if !source.is_empty() {
                return Err(CaskError::BadRequest(
                    "Root disk cannot have a \"source\" option".to_string(),
                ));
            }
        } else if pool.is_empty() && source.is_empty() {
            return Err(CaskError::BadRequest(
                "Disk requires a \"pool\" or \"source\" option".to_string(),
            ));
        }

        if !pool.is_empty() && !source.is_empty() && path != "/" {
            // A pool-backed custom volume is referenced by name via source,
            // which is fine; a host path with a pool is not.
            if source.starts_with('/') {
                return Err(CaskError::BadRequest(
                    "Disk \"source\" must be a volume name when \"pool\" is set".to_string(),
                ));
            }
        }

        Ok(Self { common })
    }

    fn is_root(&self) -> bool {
        self.common.value("path") == "/"
    }
}

#[async_trait]
impl Device for Disk {
    fn name(&self) -> &str {
        &self.common.name
    }

    fn config(&self) -> &DeviceConfig {
        &self.common.config
    }

    fn can_hot_plug(&self) -> bool {
        // The root filesystem cannot come or go while running.
        !self.is_root()
    }

    fn can_migrate(&self) -> bool {
        // Pool-backed disks move with the instance; host paths do not.
        !self.common.value("pool").is_empty()
    }

    async fn pre_start_check(&self) -> Result<()> {
        let source = self.common.value("source");
        if source.starts_with('/') && !std::path::Path::new(source).exists() {
            return Err(CaskError::BadRequest(format!(
                "Missing source path {:?} for disk {:?}",
                source, self.common.name
            )));
        }

        Ok(())
    }

    async fn start(&self) -> Result<RunConfig> {
        let source = if self.common.value("pool").is_empty() {
            PathBuf::from(self.common.value("source"))
        } else if self.is_root() {
            crate::paths::pool_mount_dir(&self.common.ctx.data_dir, self.common.value("pool"))
                .join("containers")
                .join(crate::paths::project_instance(
                    &self.common.ctx.project,
                    &self.common.ctx.instance,
                ))
        } else {
            crate::paths::pool_mount_dir(&self.common.ctx.data_dir, self.common.value("pool"))
                .join("custom")
                .join(crate::paths::project_instance(
                    &self.common.ctx.project,
                    self.common.value("source"),
                ))
        };

        Ok(RunConfig {
            mounts: vec![MountEntry {
                dev_name: self.common.name.clone(),
                source,
                target_path: self.common.value("path").to_string(),
                read_only: crate::types::is_true(self.common.value("readonly")),
            }],
            ..Default::default()
        })
    }

    async fn update(&self, old_devices: &Devices, running: bool) -> Result<()> {
        if let Some(old) = old_devices.get(&self.common.name) {
            let old_pool = old.get("pool").map(String::as_str).unwrap_or("");
            if running && old_pool != self.common.value("pool") {
                return Err(CaskError::BadRequest(
                    "Disk pool cannot be changed while the instance is running".to_string(),
                ));
            }
        }

        Ok(())
    }
}
