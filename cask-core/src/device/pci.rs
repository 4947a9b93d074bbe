//! Raw PCI passthrough devices (virtual machines only).

use async_trait::async_trait;

use crate::device::{CommonDevice, Device, RunConfig};
use crate::error::{CaskError, Result};
use crate::types::{DeviceConfig, InstanceType};

/// A PCI device passed through to a virtual machine.
pub struct Pci {
    common: CommonDevice,
}

impl Pci {
    pub(crate) fn new(common: CommonDevice) -> Result<Self> {
        crate::device::instance_supported(
            common.ctx.instance_type,
            &[InstanceType::VirtualMachine],
        )?;

        common.check_known_keys(&["address"])?;

        if common.value("address").is_empty() {
            return Err(CaskError::BadRequest(
                "PCI device requires an \"address\" option".to_string(),
            ));
        }

        crate::validate::is_pci_address(common.value("address"))?;

        Ok(Self { common })
    }
}

#[async_trait]
impl Device for Pci {
    fn name(&self) -> &str {
        &self.common.name
    }

    fn config(&self) -> &DeviceConfig {
        &self.common.config
    }

    async fn start(&self) -> Result<RunConfig> {
        Ok(RunConfig {
            pci_devices: vec![self.common.value("address").to_string()],
            ..Default::default()
        })
    }
}
