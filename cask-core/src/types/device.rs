//! Device configuration maps.
//!
//! A device is described entirely by a flat string map (its `type` key picks
//! the variant). Collections keep insertion-independent, name-sorted order so
//! that disk mounts nest correctly and removals can run in reverse.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Configuration of a single device.
pub type DeviceConfig = BTreeMap<String, String>;

/// A named set of devices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Devices(pub BTreeMap<String, DeviceConfig>);

impl Devices {
    /// Create an empty device set.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Build from a plain nested map.
    pub fn from_map(map: BTreeMap<String, DeviceConfig>) -> Self {
        Self(map)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, name: &str) -> Option<&DeviceConfig> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, config: DeviceConfig) {
        self.0.insert(name.into(), config);
    }

    pub fn remove(&mut self, name: &str) -> Option<DeviceConfig> {
        self.0.remove(name)
    }

    /// Devices in name-sorted order. Disk devices sort by `path` first so
    /// mounts are applied parent-before-child.
    pub fn sorted(&self) -> Vec<(String, DeviceConfig)> {
        let mut entries: Vec<(String, DeviceConfig)> =
            self.0.iter().map(|(k, v)| (k.clone(), v.clone())).collect();

        entries.sort_by(|a, b| {
            let a_key = (a.1.get("path").cloned().unwrap_or_default(), a.0.clone());
            let b_key = (b.1.get("path").cloned().unwrap_or_default(), b.0.clone());
            a_key.cmp(&b_key)
        });

        entries
    }

    /// Devices in reverse of `sorted()` order, used for removal.
    pub fn reversed(&self) -> Vec<(String, DeviceConfig)> {
        let mut entries = self.sorted();
        entries.reverse();
        entries
    }

    /// Find the root disk device (`type=disk`, `path=/`).
    pub fn root_disk(&self) -> Option<(&str, &DeviceConfig)> {
        self.0.iter().find_map(|(name, config)| {
            let is_root = config.get("type").map(String::as_str) == Some("disk")
                && config.get("path").map(String::as_str) == Some("/");
            is_root.then_some((name.as_str(), config))
        })
    }

    /// Names of all NIC devices, preferring the configured interface name,
    /// then the volatile one, then the device name.
    pub fn nic_names(&self, local_config: &std::collections::HashMap<String, String>) -> Vec<String> {
        let mut names = Vec::new();
        for (dev_name, config) in &self.0 {
            if config.get("type").map(String::as_str) != Some("nic") {
                continue;
            }

            if let Some(name) = config.get("name").filter(|n| !n.is_empty()) {
                names.push(name.clone());
                continue;
            }

            let volatile_key = format!("volatile.{}.name", dev_name);
            if let Some(name) = local_config.get(&volatile_key).filter(|n| !n.is_empty()) {
                names.push(name.clone());
                continue;
            }

            names.push(dev_name.clone());
        }

        names
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &DeviceConfig)> {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(pairs: &[(&str, &str)]) -> DeviceConfig {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_sorted_by_path() {
        let mut devices = Devices::new();
        devices.insert("data", dev(&[("type", "disk"), ("path", "/var/data")]));
        devices.insert("root", dev(&[("type", "disk"), ("path", "/")]));
        devices.insert("eth0", dev(&[("type", "nic")]));

        let order: Vec<String> = devices.sorted().into_iter().map(|(n, _)| n).collect();
        assert_eq!(order, vec!["eth0", "root", "data"]);

        let reversed: Vec<String> = devices.reversed().into_iter().map(|(n, _)| n).collect();
        assert_eq!(reversed, vec!["data", "root", "eth0"]);
    }

    #[test]
    fn test_root_disk() {
        let mut devices = Devices::new();
        devices.insert("root", dev(&[("type", "disk"), ("path", "/"), ("pool", "default")]));
        devices.insert("extra", dev(&[("type", "disk"), ("path", "/mnt")]));

        let (name, config) = devices.root_disk().unwrap();
        assert_eq!(name, "root");
        assert_eq!(config.get("pool").unwrap(), "default");
    }

    #[test]
    fn test_nic_names() {
        let mut devices = Devices::new();
        devices.insert("eth0", dev(&[("type", "nic"), ("name", "eno1")]));
        devices.insert("eth1", dev(&[("type", "nic")]));

        let mut local = std::collections::HashMap::new();
        local.insert("volatile.eth1.name".to_string(), "net4".to_string());

        let names = devices.nic_names(&local);
        assert_eq!(names, vec!["eno1", "net4"]);
    }
}
