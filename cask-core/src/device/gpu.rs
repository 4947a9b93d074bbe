//! GPU devices.

use async_trait::async_trait;

use crate::device::{CommonDevice, Device, RunConfig, UnixDeviceEntry};
use crate::error::Result;
use crate::types::{DeviceConfig, InstanceType};

/// A GPU passed to the instance: full PCI passthrough for virtual machines,
/// `/dev/dri` nodes for containers.
pub struct Gpu {
    common: CommonDevice,
}

impl Gpu {
    pub(crate) fn new(common: CommonDevice) -> Result<Self> {
        common.check_known_keys(&["vendorid", "productid", "pci", "id"])?;

        if !common.value("pci").is_empty() {
            crate::validate::is_pci_address(common.value("pci"))?;
        }

        for key in ["vendorid", "productid"] {
            if !common.value(key).is_empty() {
                crate::validate::is_hex_id(common.value(key))?;
            }
        }

        Ok(Self { common })
    }
}

#[async_trait]
impl Device for Gpu {
    fn name(&self) -> &str {
        &self.common.name
    }

    fn config(&self) -> &DeviceConfig {
        &self.common.config
    }

    async fn start(&self) -> Result<RunConfig> {
        if self.common.ctx.instance_type == InstanceType::VirtualMachine {
            let mut run = RunConfig::default();
            if !self.common.value("pci").is_empty() {
                run.pci_devices.push(self.common.value("pci").to_string());
            }

            return Ok(run);
        }

        Ok(RunConfig {
            unix_devices: vec![UnixDeviceEntry {
                dev_name: self.common.name.clone(),
                path: "/dev/dri".to_string(),
                block: false,
            }],
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::device::new_device;
    use crate::device::test_support::*;
    use crate::error::CaskError;
    use crate::types::InstanceType;

    #[tokio::test]
    async fn test_vm_pci_passthrough() {
        let (_, get, set) = volatile_pair();
        let dev = new_device(
            ctx(InstanceType::VirtualMachine),
            "gpu0",
            config(&[("type", "gpu"), ("pci", "0000:01:00.0")]),
            get,
            set,
        )
        .unwrap();

        let run = dev.start().await.unwrap();
        assert_eq!(run.pci_devices, vec!["0000:01:00.0"]);
        assert!(!dev.can_hot_plug());
    }

    #[test]
    fn test_invalid_vendor_id() {
        let (_, get, set) = volatile_pair();
        let err = new_device(
            ctx(InstanceType::Container),
            "gpu0",
            config(&[("type", "gpu"), ("vendorid", "zzzz")]),
            get,
            set,
        )
        .unwrap_err();
        assert!(matches!(err, CaskError::BadRequest(_)));
    }
}
