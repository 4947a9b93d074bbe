//! TPM devices.

use async_trait::async_trait;
use tracing::debug;

use crate::device::{CommonDevice, Device, RunConfig, UnixDeviceEntry};
use crate::error::{CaskError, Result};
use crate::types::{DeviceConfig, InstanceType};

/// An emulated TPM. Containers get `/dev` proxy nodes and require `path` and
/// `pathrm`; virtual machines get an emulator socket and need no paths.
pub struct Tpm {
    common: CommonDevice,
}

impl Tpm {
    pub(crate) fn new(common: CommonDevice) -> Result<Self> {
        crate::device::instance_supported(
            common.ctx.instance_type,
            &[InstanceType::Container, InstanceType::VirtualMachine],
        )?;

        common.check_known_keys(&["path", "pathrm"])?;

        if common.ctx.instance_type == InstanceType::Container {
            for key in ["path", "pathrm"] {
                if common.value(key).is_empty() {
                    return Err(CaskError::BadRequest(format!(
                        "TPM requires a {:?} option for containers",
                        key
                    )));
                }
            }
        }

        Ok(Self { common })
    }

    fn state_dir(&self) -> std::path::PathBuf {
        self.common.ctx.devices_dir.join(format!("tpm.{}", self.common.name))
    }
}

#[async_trait]
impl Device for Tpm {
    fn name(&self) -> &str {
        &self.common.name
    }

    fn config(&self) -> &DeviceConfig {
        &self.common.config
    }

    fn can_migrate(&self) -> bool {
        true
    }

    async fn start(&self) -> Result<RunConfig> {
        let state_dir = self.state_dir();
        tokio::fs::create_dir_all(&state_dir)
            .await
            .map_err(|e| crate::error::io_error(&state_dir, e))?;

        debug!(device = %self.common.name, state_dir = ?state_dir, "Prepared TPM state directory");

        if self.common.ctx.instance_type == InstanceType::VirtualMachine {
            // VM firmware talks to the emulator socket; no guest dev nodes.
            return Ok(RunConfig::default());
        }

        Ok(RunConfig {
            unix_devices: vec![
                UnixDeviceEntry {
                    dev_name: self.common.name.clone(),
                    path: self.common.value("path").to_string(),
                    block: false,
                },
                UnixDeviceEntry {
                    dev_name: self.common.name.clone(),
                    path: self.common.value("pathrm").to_string(),
                    block: false,
                },
            ],
            ..Default::default()
        })
    }

    async fn stop(&self) -> Result<()> {
        let state_dir = self.state_dir();
        if state_dir.exists() {
            tokio::fs::remove_dir_all(&state_dir)
                .await
                .map_err(|e| crate::error::io_error(&state_dir, e))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::device::new_device;
    use crate::device::test_support::*;
    use crate::error::CaskError;
    use crate::types::InstanceType;

    #[test]
    fn test_container_requires_paths() {
        let (_, get, set) = volatile_pair();
        let err = new_device(
            ctx(InstanceType::Container),
            "tpm0",
            config(&[("type", "tpm")]),
            get,
            set,
        )
        .unwrap_err();
        assert!(matches!(err, CaskError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_vm_needs_no_paths() {
        let (_, get, set) = volatile_pair();
        let dev = new_device(
            ctx(InstanceType::VirtualMachine),
            "tpm0",
            config(&[("type", "tpm")]),
            get,
            set,
        )
        .unwrap();

        assert!(dev.can_migrate());
        let run = dev.start().await.unwrap();
        assert!(run.unix_devices.is_empty());
    }
}
