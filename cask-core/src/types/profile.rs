//! Profiles: named reusable bundles of config and devices.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::device::Devices;

/// A profile attached (in order) to instances.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Profile {
    /// Numeric row id.
    pub id: i64,

    /// Owning project.
    pub project: String,

    /// Profile name.
    pub name: String,

    /// Free-form description.
    pub description: String,

    /// Config applied to member instances.
    pub config: HashMap<String, String>,

    /// Devices applied to member instances.
    pub devices: Devices,
}

/// Merge profile config in order, followed by the local config. Later
/// profiles override earlier ones; local config overrides everything.
pub fn expand_config(
    local: &HashMap<String, String>,
    profiles: &[Profile],
) -> HashMap<String, String> {
    let mut expanded = HashMap::new();

    for profile in profiles {
        for (k, v) in &profile.config {
            expanded.insert(k.clone(), v.clone());
        }
    }

    for (k, v) in local {
        expanded.insert(k.clone(), v.clone());
    }

    expanded
}

/// Merge profile devices in order, followed by the local devices. A device
/// name defined locally fully replaces any profile device of the same name.
pub fn expand_devices(local: &Devices, profiles: &[Profile]) -> Devices {
    let mut expanded = Devices::new();

    for profile in profiles {
        for (name, config) in profile.devices.iter() {
            expanded.insert(name.clone(), config.clone());
        }
    }

    for (name, config) in local.iter() {
        expanded.insert(name.clone(), config.clone());
    }

    expanded
}
