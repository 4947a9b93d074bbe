//! InfiniBand devices (containers only).

use async_trait::async_trait;

use crate::device::{CommonDevice, Device, RunConfig};
use crate::error::{CaskError, Result};
use crate::types::{DeviceConfig, InstanceType};

/// An InfiniBand interface backed by a host parent interface.
pub struct Infiniband {
    common: CommonDevice,
}

impl Infiniband {
    pub(crate) fn new(common: CommonDevice) -> Result<Self> {
        crate::device::instance_supported(
            common.ctx.instance_type,
            &[InstanceType::Container],
        )?;

        common.check_known_keys(&["parent", "hwaddr", "mtu"])?;

        if common.value("parent").is_empty() {
            return Err(CaskError::BadRequest(
                "InfiniBand device requires a \"parent\" option".to_string(),
            ));
        }

        Ok(Self { common })
    }
}

#[async_trait]
impl Device for Infiniband {
    fn name(&self) -> &str {
        &self.common.name
    }

    fn config(&self) -> &DeviceConfig {
        &self.common.config
    }

    async fn start(&self) -> Result<RunConfig> {
        Ok(RunConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use crate::device::new_device;
    use crate::device::test_support::*;
    use crate::error::CaskError;
    use crate::types::InstanceType;

    #[test]
    fn test_parent_required() {
        let (_, get, set) = volatile_pair();
        let err = new_device(
            ctx(InstanceType::Container),
            "ib0",
            config(&[("type", "infiniband")]),
            get,
            set,
        )
        .unwrap_err();
        assert!(matches!(err, CaskError::BadRequest(_)));
    }
}
