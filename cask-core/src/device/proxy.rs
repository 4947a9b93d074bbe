//! Proxy devices forwarding traffic between host and container.

use async_trait::async_trait;

use crate::device::{CommonDevice, Device, RunConfig};
use crate::error::{CaskError, Result};
use crate::types::{DeviceConfig, InstanceType};

/// A userspace forwarder between a host listen address and an instance
/// connect address, both in `<proto>:<addr>:<port>` form.
pub struct Proxy {
    common: CommonDevice,
}

impl Proxy {
    pub(crate) fn new(common: CommonDevice) -> Result<Self> {
        crate::device::instance_supported(
            common.ctx.instance_type,
            &[InstanceType::Container],
        )?;

        common.check_known_keys(&["listen", "connect", "bind", "nat"])?;

        for key in ["listen", "connect"] {
            parse_proxy_addr(common.value(key)).map_err(|e| {
                CaskError::BadRequest(format!("Invalid proxy {:?} option: {}", key, e))
            })?;
        }

        Ok(Self { common })
    }
}

#[async_trait]
impl Device for Proxy {
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
        // The forwarder process is owned by the runtime collaborator; the
        // device only validates and records the addresses.
        Ok(RunConfig::default())
    }
}

/// Parse `<tcp|udp|unix>:<addr>:<port[-port]>` proxy address syntax.
fn parse_proxy_addr(value: &str) -> std::result::Result<(), String> {
    if value.is_empty() {
        return Err("address is required".to_string());
    }

    let mut parts = value.splitn(3, ':');
    let proto = parts.next().unwrap_or("");
    let addr = parts.next().unwrap_or("");
    let port = parts.next().unwrap_or("");

    if !matches!(proto, "tcp" | "udp" | "unix") {
        return Err(format!("unknown protocol {:?}", proto));
    }

    if proto == "unix" {
        if addr.is_empty() {
            return Err("unix socket path is required".to_string());
        }

        return Ok(());
    }

    if addr.is_empty() {
        return Err("address is required".to_string());
    }

    crate::validate::is_network_port_range(port).map_err(|e| e.to_string())?;

    Ok(())
}
