//! USB devices.

use async_trait::async_trait;

use crate::device::{CommonDevice, Device, RunConfig, UnixDeviceEntry};
use crate::error::Result;
use crate::types::{DeviceConfig, InstanceType};

/// A USB device matched by vendor/product id.
pub struct Usb {
    common: CommonDevice,
}

impl Usb {
    pub(crate) fn new(common: CommonDevice) -> Result<Self> {
        common.check_known_keys(&["vendorid", "productid", "busnum", "devnum"])?;

        for key in ["vendorid", "productid"] {
            if !common.value(key).is_empty() {
                crate::validate::is_hex_id(common.value(key))?;
            }
        }

        Ok(Self { common })
    }
}

#[async_trait]
impl Device for Usb {
    fn name(&self) -> &str {
        &self.common.name
    }

    fn config(&self) -> &DeviceConfig {
        &self.common.config
    }

    fn can_hot_plug(&self) -> bool {
        true
    }

    async fn start(&self) -> Result<RunConfig> {
        if self.common.ctx.instance_type == InstanceType::VirtualMachine {
            return Ok(RunConfig::default());
        }

        Ok(RunConfig {
            unix_devices: vec![UnixDeviceEntry {
                dev_name: self.common.name.clone(),
                path: "/dev/bus/usb".to_string(),
                block: false,
            }],
            ..Default::default()
        })
    }
}
