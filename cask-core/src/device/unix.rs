//! Unix character and block devices (containers only).

use async_trait::async_trait;

use crate::device::{CommonDevice, Device, RunConfig, UnixDeviceEntry};
use crate::error::{CaskError, Result};
use crate::types::{DeviceConfig, InstanceType};

/// A `/dev` node exposed inside a container.
pub struct UnixDevice {
    common: CommonDevice,
    block: bool,
}

impl UnixDevice {
    pub(crate) fn new(common: CommonDevice, block: bool) -> Result<Self> {
        crate::device::instance_supported(
            common.ctx.instance_type,
            &[InstanceType::Container],
        )?;

        common.check_known_keys(&["path", "source", "major", "minor", "mode", "uid", "gid"])?;

        if common.value("path").is_empty() && common.value("source").is_empty() {
            return Err(CaskError::BadRequest(
                "Unix device requires a \"path\" or \"source\" option".to_string(),
            ));
        }

        for key in ["major", "minor"] {
            let value = common.value(key);
            if !value.is_empty() && value.parse::<u32>().is_err() {
                return Err(CaskError::BadRequest(format!(
                    "Invalid device {} number {:?}",
                    key, value
                )));
            }
        }

        Ok(Self { common, block })
    }
}

#[async_trait]
impl Device for UnixDevice {
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
        let path = if self.common.value("path").is_empty() {
            self.common.value("source")
        } else {
            self.common.value("path")
        };

        Ok(RunConfig {
            unix_devices: vec![UnixDeviceEntry {
                dev_name: self.common.name.clone(),
                path: path.to_string(),
                block: self.block,
            }],
            ..Default::default()
        })
    }
}
