//! Network interface devices.

use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use tracing::debug;

use crate::device::{CommonDevice, Device, NetworkInterfaceEntry, RunConfig};
use crate::error::{CaskError, Result};
use crate::types::{DeviceConfig, Devices};

/// A NIC attached to a managed network (`network`) or a host interface
/// (`parent`).
pub struct Nic {
    common: CommonDevice,
}

impl Nic {
    pub(crate) fn new(common: CommonDevice) -> Result<Self> {
        common.check_known_keys(&[
            "network",
            "parent",
            "name",
            "hwaddr",
            "mtu",
            "ipv4.address",
            "ipv6.address",
            "security.acls",
        ])?;

        if common.value("network").is_empty() && common.value("parent").is_empty() {
            return Err(CaskError::BadRequest(
                "NIC requires a \"network\" or \"parent\" option".to_string(),
            ));
        }

        if !common.value("network").is_empty() && !common.value("parent").is_empty() {
            return Err(CaskError::BadRequest(
                "NIC \"network\" and \"parent\" options are mutually exclusive".to_string(),
            ));
        }

        if !common.value("mtu").is_empty() && common.value("mtu").parse::<u32>().is_err() {
            return Err(CaskError::BadRequest(format!(
                "Invalid MTU {:?}",
                common.value("mtu")
            )));
        }

        if !common.value("hwaddr").is_empty() && parse_hwaddr(common.value("hwaddr")).is_none() {
            return Err(CaskError::BadRequest(format!(
                "Invalid MAC address {:?}",
                common.value("hwaddr")
            )));
        }

        Ok(Self { common })
    }

    /// Resolve the MAC address: config first, then volatile, else generate
    /// one and persist it so the instance keeps it across restarts.
    async fn resolve_hwaddr(&self) -> Result<String> {
        let configured = self.common.value("hwaddr");
        if !configured.is_empty() {
            return Ok(configured.to_string());
        }

        let volatile = (self.common.volatile_get)();
        if let Some(existing) = volatile.get("hwaddr") {
            return Ok(existing.clone());
        }

        let generated = random_hwaddr();
        debug!(device = %self.common.name, hwaddr = %generated, "Generated NIC hardware address");

        let mut save = HashMap::new();
        save.insert("hwaddr".to_string(), generated.clone());
        (self.common.volatile_set)(save).await?;

        Ok(generated)
    }
}

#[async_trait]
impl Device for Nic {
    fn name(&self) -> &str {
        &self.common.name
    }

    fn config(&self) -> &DeviceConfig {
        &self.common.config
    }

    fn can_hot_plug(&self) -> bool {
        true
    }

    fn can_migrate(&self) -> bool {
        // Only NICs on managed networks are guaranteed to exist on other
        // members; parent interfaces are host-specific.
        !self.common.value("network").is_empty()
    }

    async fn start(&self) -> Result<RunConfig> {
        let hwaddr = self.resolve_hwaddr().await?;

        let host_name = {
            let volatile = (self.common.volatile_get)();
            match volatile.get("host_name") {
                Some(existing) => existing.clone(),
                None => {
                    let generated = format!("cask{:08x}", rand::thread_rng().gen::<u32>());
                    let mut save = HashMap::new();
                    save.insert("host_name".to_string(), generated.clone());
                    (self.common.volatile_set)(save).await?;
                    generated
                }
            }
        };

        Ok(RunConfig {
            network_interfaces: vec![NetworkInterfaceEntry {
                dev_name: self.common.name.clone(),
                host_name,
                hwaddr,
            }],
            ..Default::default()
        })
    }

    async fn update(&self, old_devices: &Devices, _running: bool) -> Result<()> {
        // Switching the backing network of a live NIC is a remove+add, not
        // an update.
        if let Some(old) = old_devices.get(&self.common.name) {
            let old_network = old.get("network").map(String::as_str).unwrap_or("");
            if old_network != self.common.value("network") {
                return Err(CaskError::BadRequest(
                    "NIC network cannot be changed in place".to_string(),
                ));
            }
        }

        Ok(())
    }
}

fn parse_hwaddr(value: &str) -> Option<[u8; 6]> {
    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() != 6 {
        return None;
    }

    let mut out = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        out[i] = u8::from_str_radix(part, 16).ok()?;
    }

    Some(out)
}

/// Generate a locally-administered MAC in the 00:16:3e prefix.
fn random_hwaddr() -> String {
    let mut rng = rand::thread_rng();
    format!("00:16:3e:{:02x}:{:02x}:{:02x}", rng.gen::<u8>(), rng.gen::<u8>(), rng.gen::<u8>())
}
