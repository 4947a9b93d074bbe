//! Device subsystem.
//!
//! Devices are polymorphic over the capability set {add, remove, start,
//! stop, update, register, hot-plug, migrate, pre-start-check}. Construction
//! goes through a factory keyed by the `type` config key; the factory is
//! handed volatile get/set closures so devices never touch instance
//! internals directly.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{CaskError, Result};
use crate::types::{DeviceConfig, Devices, InstanceType};

pub mod disk;
pub mod gpu;
pub mod infiniband;
pub mod nic;
pub mod pci;
pub mod proxy;
pub mod tpm;
pub mod unix;
pub mod usb;

/// Closure returning the device's volatile keys (with the
/// `volatile.<name>.` prefix stripped).
pub type VolatileGetter = Arc<dyn Fn() -> HashMap<String, String> + Send + Sync>;

/// Closure persisting volatile keys for the device (keys given without the
/// `volatile.<name>.` prefix).
pub type VolatileSetter =
    Arc<dyn Fn(HashMap<String, String>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Instance-side facts a device needs at construction time.
#[derive(Debug, Clone)]
pub struct DeviceContext {
    pub project: String,
    pub instance: String,
    pub instance_type: InstanceType,
    /// Daemon data root (pool mountpoints live under it).
    pub data_dir: PathBuf,
    /// Per-instance device runtime state directory.
    pub devices_dir: PathBuf,
}

/// A mount produced by a disk device start.
#[derive(Debug, Clone, Default)]
pub struct MountEntry {
    pub dev_name: String,
    pub source: PathBuf,
    pub target_path: String,
    pub read_only: bool,
}

/// A network interface produced by a NIC device start.
#[derive(Debug, Clone, Default)]
pub struct NetworkInterfaceEntry {
    pub dev_name: String,
    pub host_name: String,
    pub hwaddr: String,
}

/// A character or block node produced by a device start.
#[derive(Debug, Clone, Default)]
pub struct UnixDeviceEntry {
    pub dev_name: String,
    pub path: String,
    pub block: bool,
}

/// What the runtime must attach after a device starts.
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    pub mounts: Vec<MountEntry>,
    pub network_interfaces: Vec<NetworkInterfaceEntry>,
    pub unix_devices: Vec<UnixDeviceEntry>,
    /// PCI addresses to pass through.
    pub pci_devices: Vec<String>,
}

/// Device contract implemented by every variant.
#[async_trait]
pub trait Device: Send + Sync {
    /// Device name within the instance.
    fn name(&self) -> &str;

    /// The device's config map.
    fn config(&self) -> &DeviceConfig;

    /// Whether the device can be added/removed while the instance runs.
    fn can_hot_plug(&self) -> bool {
        false
    }

    /// Whether an instance carrying this device can be migrated.
    fn can_migrate(&self) -> bool {
        false
    }

    /// Check start preconditions without side effects.
    async fn pre_start_check(&self) -> Result<()> {
        Ok(())
    }

    /// One-time setup when the device is added to the instance.
    async fn add(&self) -> Result<()> {
        Ok(())
    }

    /// Teardown when the device is removed from the instance.
    async fn remove(&self) -> Result<()> {
        Ok(())
    }

    /// Prepare the device for an instance start, returning what the runtime
    /// must attach.
    async fn start(&self) -> Result<RunConfig>;

    /// Release runtime resources on instance stop.
    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    /// Apply a config change. `old_devices` is the previous expanded device
    /// set, for diffing.
    async fn update(&self, _old_devices: &Devices, _running: bool) -> Result<()> {
        Ok(())
    }

    /// Register static handlers on daemon startup (no side effects on the
    /// instance itself).
    fn register(&self) -> Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for dyn Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device").field("name", &self.name()).finish()
    }
}

/// Config shared by all device variants.
pub(crate) struct CommonDevice {
    pub ctx: DeviceContext,
    pub name: String,
    pub config: DeviceConfig,
    pub volatile_get: VolatileGetter,
    pub volatile_set: VolatileSetter,
}

impl CommonDevice {
    /// Reject config keys outside the allowed set (`type` and `user.*` keys
    /// always pass).
    pub fn check_known_keys(&self, known: &[&str]) -> Result<()> {
        for key in self.config.keys() {
            if key == "type" || crate::types::is_user_config(key) {
                continue;
            }

            if !known.contains(&key.as_str()) {
                return Err(CaskError::BadRequest(format!(
                    "Invalid device option {:?}",
                    key
                )));
            }
        }

        Ok(())
    }

    /// Config value or empty string.
    pub fn value(&self, key: &str) -> &str {
        self.config.get(key).map(String::as_str).unwrap_or("")
    }
}

/// Return an error if the instance type is not in the supported list.
pub(crate) fn instance_supported(
    instance_type: InstanceType,
    supported: &[InstanceType],
) -> Result<()> {
    if !supported.contains(&instance_type) {
        return Err(CaskError::UnsupportedDevType);
    }

    Ok(())
}

/// Construct and validate a device from its config. The `type` key picks the
/// variant; unknown types are a bad request, types incompatible with the
/// instance kind surface as [`CaskError::UnsupportedDevType`].
pub fn new_device(
    ctx: DeviceContext,
    name: &str,
    config: DeviceConfig,
    volatile_get: VolatileGetter,
    volatile_set: VolatileSetter,
) -> Result<Box<dyn Device>> {
    let dev_type = config.get("type").cloned().unwrap_or_default();

    let common = CommonDevice {
        ctx,
        name: name.to_string(),
        config,
        volatile_get,
        volatile_set,
    };

    match dev_type.as_str() {
        "nic" => Ok(Box::new(nic::Nic::new(common)?)),
        "disk" => Ok(Box::new(disk::Disk::new(common)?)),
        "unix-char" => Ok(Box::new(unix::UnixDevice::new(common, false)?)),
        "unix-block" => Ok(Box::new(unix::UnixDevice::new(common, true)?)),
        "tpm" => Ok(Box::new(tpm::Tpm::new(common)?)),
        "infiniband" => Ok(Box::new(infiniband::Infiniband::new(common)?)),
        "gpu" => Ok(Box::new(gpu::Gpu::new(common)?)),
        "proxy" => Ok(Box::new(proxy::Proxy::new(common)?)),
        "pci" => Ok(Box::new(pci::Pci::new(common)?)),
        "usb" => Ok(Box::new(usb::Usb::new(common)?)),
        "" => Err(CaskError::BadRequest(format!("Device {:?} is missing a type", name))),
        other => Err(CaskError::BadRequest(format!("Unknown device type {:?}", other))),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// In-memory volatile store for device tests.
    pub fn volatile_pair() -> (Arc<Mutex<HashMap<String, String>>>, VolatileGetter, VolatileSetter)
    {
        let store = Arc::new(Mutex::new(HashMap::new()));

        let get_store = store.clone();
        let getter: VolatileGetter = Arc::new(move || get_store.lock().unwrap().clone());

        let set_store = store.clone();
        let setter: VolatileSetter = Arc::new(move |changes| {
            let set_store = set_store.clone();
            Box::pin(async move {
                let mut store = set_store.lock().unwrap();
                for (k, v) in changes {
                    if v.is_empty() {
                        store.remove(&k);
                    } else {
                        store.insert(k, v);
                    }
                }
                Ok(())
            })
        });

        (store, getter, setter)
    }

    pub fn ctx(instance_type: InstanceType) -> DeviceContext {
        DeviceContext {
            project: "default".to_string(),
            instance: "c1".to_string(),
            instance_type,
            data_dir: std::env::temp_dir().join("cask-test"),
            devices_dir: std::env::temp_dir().join("cask-test/devices"),
        }
    }

    pub fn config(pairs: &[(&str, &str)]) -> DeviceConfig {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_factory_unknown_type() {
        let (_, get, set) = volatile_pair();
        let err = new_device(
            ctx(InstanceType::Container),
            "bad",
            config(&[("type", "floppy")]),
            get,
            set,
        )
        .unwrap_err();

        assert!(matches!(err, CaskError::BadRequest(_)));
    }

    #[test]
    fn test_factory_missing_type() {
        let (_, get, set) = volatile_pair();
        let err =
            new_device(ctx(InstanceType::Container), "bad", config(&[]), get, set).unwrap_err();
        assert!(matches!(err, CaskError::BadRequest(_)));
    }

    #[test]
    fn test_factory_unsupported_for_instance_type() {
        let (_, get, set) = volatile_pair();
        let err = new_device(
            ctx(InstanceType::VirtualMachine),
            "tty0",
            config(&[("type", "unix-char"), ("path", "/dev/ttyS0")]),
            get,
            set,
        )
        .unwrap_err();

        assert!(matches!(err, CaskError::UnsupportedDevType));
    }

    #[test]
    fn test_factory_builds_each_variant() {
        let cases: Vec<(InstanceType, Vec<(&str, &str)>)> = vec![
            (InstanceType::Container, vec![("type", "nic"), ("network", "br0")]),
            (
                InstanceType::Container,
                vec![("type", "disk"), ("path", "/"), ("pool", "default")],
            ),
            (InstanceType::Container, vec![("type", "unix-char"), ("path", "/dev/ttyS0")]),
            (InstanceType::Container, vec![("type", "tpm"), ("path", "/dev/tpm0"), ("pathrm", "/dev/tpmrm0")]),
            (InstanceType::Container, vec![("type", "infiniband"), ("parent", "ib0")]),
            (InstanceType::Container, vec![("type", "gpu")]),
            (
                InstanceType::Container,
                vec![
                    ("type", "proxy"),
                    ("listen", "tcp:0.0.0.0:80"),
                    ("connect", "tcp:127.0.0.1:8080"),
                ],
            ),
            (InstanceType::VirtualMachine, vec![("type", "pci"), ("address", "0000:01:00.0")]),
            (InstanceType::Container, vec![("type", "usb"), ("vendorid", "10de")]),
        ];

        for (itype, pairs) in cases {
            let (_, get, set) = volatile_pair();
            let dev = new_device(ctx(itype), "dev0", config(&pairs), get, set).unwrap();
            assert_eq!(dev.name(), "dev0");
        }
    }
}
