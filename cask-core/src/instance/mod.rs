//! Instance core.
//!
//! Holds identity, config (local and expanded), devices and profiles, and
//! implements the lifecycle operations: start, stop, shutdown, restart,
//! rebuild, snapshot, restore, update, rename and delete. Every multi-step
//! operation acquires an operation lock, opens a reverter, performs its
//! database mutations and external effects, and only then succeeds.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::context::State;
use crate::device::{Device, DeviceContext, RunConfig, VolatileGetter, VolatileSetter};
use crate::error::{CaskError, Result};
use crate::oplock::{self, Action};
use crate::revert::{Hook, Reverter};
use crate::storage::Pool;
use crate::types::profile::{expand_config, expand_devices};
use crate::types::{
    DeviceConfig, Devices, InstanceArgs, InstanceRecord, Profile, StatusCode, VOLATILE_PREFIX,
};

pub mod create;
pub mod numa;
pub mod runtime;

#[cfg(test)]
mod tests;

/// Actions whose live locks the start/stop halves of a lifecycle operation
/// run under.
const START_ALT_ACTIONS: &[Action] = &[Action::Restart, Action::Restore];
const STOP_ALT_ACTIONS: &[Action] = &[Action::Restart, Action::Restore, Action::Migrate];

/// Ring of recent auto-restart timestamps (unix millis) per instance id.
static INSTANCES_LAST_RESTART: Lazy<StdMutex<HashMap<i64, [i64; 10]>>> =
    Lazy::new(|| StdMutex::new(HashMap::new()));

/// Whether an auto-restart is permitted for the instance at `now_ms`.
///
/// Up to 10 restarts are allowed within any rolling minute: a free slot is
/// consumed, or the oldest slot is recycled once it is over a minute old.
fn auto_restart_allowed(id: i64, now_ms: i64) -> bool {
    let mut map = INSTANCES_LAST_RESTART.lock().unwrap();
    let slots = map.entry(id).or_insert([0; 10]);

    let mut oldest = 0usize;
    for i in 0..slots.len() {
        if slots[i] == 0 {
            slots[i] = now_ms;
            return true;
        }

        if slots[i] < slots[oldest] {
            oldest = i;
        }
    }

    if slots[oldest] < now_ms - 60_000 {
        slots[oldest] = now_ms;
        return true;
    }

    false
}

/// Validate an instance name.
pub fn valid_name(name: &str, is_snapshot: bool) -> Result<()> {
    let (parent, snap) = crate::types::parent_and_snapshot_name(name);

    if snap.is_some() && !is_snapshot {
        return Err(CaskError::BadRequest(format!(
            "Instance name {:?} may not contain a snapshot delimiter",
            name
        )));
    }

    for part in [Some(parent), snap].into_iter().flatten() {
        if part.is_empty() || part.len() > 63 {
            return Err(CaskError::BadRequest(format!("Invalid instance name {:?}", name)));
        }

        if part.starts_with('-')
            || !part.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        {
            return Err(CaskError::BadRequest(format!("Invalid instance name {:?}", name)));
        }
    }

    Ok(())
}

/// Create the instance database record under a `Create` operation lock.
///
/// Returns the record, the held lock and a cleanup hook deleting the record
/// for the caller's reverter.
pub async fn create_internal(
    state: &Arc<State>,
    args: InstanceArgs,
) -> Result<(InstanceRecord, Arc<oplock::InstanceOperation>, Hook)> {
    valid_name(&args.name, args.snapshot)?;

    let record = state.db.insert_instance(&args).await?;

    let op = match oplock::create(&record.project, &record.name, Action::Create, false, false) {
        Ok(op) => op,
        Err(e) => {
            let _ = state.db.delete_instance(&record.project, &record.name).await;
            return Err(e);
        }
    };

    let db = state.db.clone();
    let project = record.project.clone();
    let name = record.name.clone();
    let cleanup: Hook = Arc::new(move || {
        let db = db.clone();
        let project = project.clone();
        let name = name.clone();
        Box::pin(async move {
            let _ = db.delete_instance(&project, &name).await;
        })
    });

    Ok((record, op, cleanup))
}

struct Inner {
    record: InstanceRecord,
    profiles: Vec<Profile>,
    expanded_config: HashMap<String, String>,
    expanded_devices: Devices,
}

impl Inner {
    fn expand(&mut self) {
        self.expanded_config = expand_config(&self.record.config, &self.profiles);
        self.expanded_devices = expand_devices(&self.record.devices, &self.profiles);
    }
}

/// A loaded instance.
#[derive(Clone)]
pub struct Instance {
    state: Arc<State>,
    inner: Arc<StdMutex<Inner>>,
    pool: Arc<tokio::sync::OnceCell<Pool>>,
}

impl Instance {
    /// Load an instance (or snapshot) by project and name.
    pub async fn load(state: Arc<State>, project: &str, name: &str) -> Result<Self> {
        let record = state.db.get_instance(project, name).await?;
        Self::from_record(state, record).await
    }

    /// Wrap an already-fetched record, resolving profiles and expanding.
    pub async fn from_record(state: Arc<State>, record: InstanceRecord) -> Result<Self> {
        let profiles = state.db.get_profiles(&record.project, &record.profiles).await?;

        let mut inner = Inner {
            record,
            profiles,
            expanded_config: HashMap::new(),
            expanded_devices: Devices::new(),
        };
        inner.expand();

        Ok(Self {
            state,
            inner: Arc::new(StdMutex::new(inner)),
            pool: Arc::new(tokio::sync::OnceCell::new()),
        })
    }

    //
    // SECTION: property getters
    //

    pub fn id(&self) -> i64 {
        self.inner.lock().unwrap().record.id
    }

    pub fn name(&self) -> String {
        self.inner.lock().unwrap().record.name.clone()
    }

    pub fn project(&self) -> String {
        self.inner.lock().unwrap().record.project.clone()
    }

    pub fn location(&self) -> String {
        self.inner.lock().unwrap().record.node.clone()
    }

    pub fn instance_type(&self) -> crate::types::InstanceType {
        self.inner.lock().unwrap().record.instance_type
    }

    pub fn architecture(&self) -> String {
        self.inner.lock().unwrap().record.architecture.clone()
    }

    pub fn is_snapshot(&self) -> bool {
        self.inner.lock().unwrap().record.snapshot
    }

    pub fn is_ephemeral(&self) -> bool {
        self.inner.lock().unwrap().record.ephemeral
    }

    pub fn is_stateful(&self) -> bool {
        self.inner.lock().unwrap().record.stateful
    }

    pub fn record(&self) -> InstanceRecord {
        self.inner.lock().unwrap().record.clone()
    }

    pub fn profiles(&self) -> Vec<Profile> {
        self.inner.lock().unwrap().profiles.clone()
    }

    pub fn local_config(&self) -> HashMap<String, String> {
        self.inner.lock().unwrap().record.config.clone()
    }

    pub fn local_devices(&self) -> Devices {
        self.inner.lock().unwrap().record.devices.clone()
    }

    pub fn expanded_config(&self) -> HashMap<String, String> {
        self.inner.lock().unwrap().expanded_config.clone()
    }

    pub fn expanded_devices(&self) -> Devices {
        self.inner.lock().unwrap().expanded_devices.clone()
    }

    /// The cloud-init instance id, defaulting to the instance name.
    pub fn cloud_init_id(&self) -> String {
        self.local_config()
            .get("volatile.cloud-init.instance-id")
            .cloned()
            .unwrap_or_else(|| self.name())
    }

    /// Coarse status from the runtime.
    pub fn status(&self) -> StatusCode {
        let (project, name) = (self.project(), self.name());

        if self.state.runtime.is_frozen(&project, &name) {
            return StatusCode::Frozen;
        }

        if self.state.runtime.is_running(&project, &name) {
            return StatusCode::Running;
        }

        if self.local_config().get("volatile.last_state.power").map(String::as_str)
            == Some("ERROR")
        {
            return StatusCode::Error;
        }

        StatusCode::Stopped
    }

    pub fn is_running(&self) -> bool {
        self.status().is_running()
    }

    //
    // SECTION: path getters
    //

    /// The instance's data directory.
    pub fn path(&self) -> PathBuf {
        let record = self.record();
        let base = match record.instance_type {
            crate::types::InstanceType::Container => {
                crate::paths::containers_dir(&self.state.data_dir)
            }
            crate::types::InstanceType::VirtualMachine => {
                crate::paths::virtual_machines_dir(&self.state.data_dir)
            }
        };

        base.join(crate::paths::project_instance(&record.project, &record.name))
    }

    /// Device runtime state directory.
    pub fn devices_path(&self) -> PathBuf {
        crate::paths::instance_devices_dir(&self.state.data_dir, &self.project(), &self.name())
    }

    /// Log directory.
    pub fn log_path(&self) -> PathBuf {
        crate::paths::instance_logs_dir(&self.state.data_dir, &self.project(), &self.name())
    }

    //
    // SECTION: storage
    //

    /// The instance's storage pool handle, resolved once via its volume row.
    pub async fn pool(&self) -> Result<Pool> {
        let pool = self
            .pool
            .get_or_try_init(|| async {
                let (project, name) = (self.project(), self.name());
                let (parent, _) = crate::types::parent_and_snapshot_name(&name);

                let pool_name =
                    self.state.db.get_instance_pool_name(&project, parent).await.map_err(|e| {
                        CaskError::Internal(format!("Failed getting instance pool: {}", e))
                    })?;

                Pool::load(self.state.db.clone(), &self.state.drivers, &pool_name).await
            })
            .await?;

        Ok(pool.clone())
    }

    /// Name and config of the root disk device. Snapshots resolve through
    /// their parent's expanded devices.
    pub async fn root_disk_device(&self) -> Result<(String, DeviceConfig)> {
        let devices = if self.is_snapshot() {
            let name = self.name();
            let (parent, _) = crate::types::parent_and_snapshot_name(&name);
            let parent_inst =
                Instance::load(self.state.clone(), &self.project(), parent).await?;
            parent_inst.expanded_devices()
        } else {
            self.expanded_devices()
        };

        devices
            .root_disk()
            .map(|(name, config)| (name.to_string(), config.clone()))
            .ok_or_else(|| {
                CaskError::BadRequest("Instance has no root disk device".to_string())
            })
    }

    //
    // SECTION: volatile config
    //

    /// Set (or with an empty value delete) volatile config keys, persisting
    /// to the database and applying locally.
    pub async fn volatile_set(&self, changes: HashMap<String, String>) -> Result<()> {
        for key in changes.keys() {
            if !key.starts_with(VOLATILE_PREFIX) {
                return Err(CaskError::BadRequest(
                    "Only volatile keys can be modified with volatile_set".to_string(),
                ));
            }
        }

        self.state
            .db
            .update_instance_config(self.id(), &changes)
            .await
            .map_err(|e| CaskError::Internal(format!("Failed to set volatile config: {}", e)))?;

        let mut inner = self.inner.lock().unwrap();
        for (key, value) in changes {
            if value.is_empty() {
                inner.record.config.remove(&key);
                inner.expanded_config.remove(&key);
            } else {
                inner.record.config.insert(key.clone(), value.clone());
                inner.expanded_config.insert(key, value);
            }
        }

        Ok(())
    }

    /// Closure returning a device's volatile keys with the prefix stripped.
    fn device_volatile_get_func(&self, dev_name: &str) -> VolatileGetter {
        let inner = self.inner.clone();
        let prefix = format!("volatile.{}.", dev_name);

        Arc::new(move || {
            let inner = inner.lock().unwrap();
            inner
                .record
                .config
                .iter()
                .filter_map(|(k, v)| {
                    k.strip_prefix(&prefix).map(|rest| (rest.to_string(), v.clone()))
                })
                .collect()
        })
    }

    /// Closure persisting a device's volatile keys (prefix added back).
    fn device_volatile_set_func(&self, dev_name: &str) -> VolatileSetter {
        let instance = self.clone();
        let prefix = format!("volatile.{}.", dev_name);

        Arc::new(move |save| {
            let instance = instance.clone();
            let prefix = prefix.clone();
            Box::pin(async move {
                let changes = save
                    .into_iter()
                    .map(|(k, v)| (format!("{}{}", prefix, k), v))
                    .collect::<HashMap<_, _>>();

                instance.volatile_set(changes).await
            })
        })
    }

    /// Reset a device's volatile keys on removal or re-add.
    ///
    /// A type change (or plain removal) clears every key for the device;
    /// a same-type re-add only clears keys that the new config provides
    /// itself.
    async fn device_volatile_reset(
        &self,
        dev_name: &str,
        old_config: &DeviceConfig,
        new_config: Option<&DeviceConfig>,
    ) -> Result<()> {
        let prefix = format!("volatile.{}.", dev_name);
        let local = self.local_config();
        let mut clear = HashMap::new();

        let type_changed = match new_config {
            None => true,
            Some(new) => new.get("type") != old_config.get("type"),
        };

        for key in local.keys() {
            let Some(dev_key) = key.strip_prefix(&prefix) else {
                continue;
            };

            if type_changed || new_config.map(|c| c.contains_key(dev_key)).unwrap_or(false) {
                clear.insert(key.clone(), String::new());
            }
        }

        if clear.is_empty() {
            return Ok(());
        }

        self.volatile_set(clear).await
    }

    /// Generate a fresh cloud-init instance id.
    async fn reset_instance_id(&self) -> Result<()> {
        let mut changes = HashMap::new();
        changes.insert(
            "volatile.cloud-init.instance-id".to_string(),
            uuid::Uuid::new_v4().to_string(),
        );

        self.volatile_set(changes)
            .await
            .map_err(|e| CaskError::Internal(format!("Failed to set instance-id: {}", e)))
    }

    /// Whether a config/device change invalidates the cloud-init id.
    fn needs_new_instance_id(
        &self,
        changed_config: &[String],
        old_expanded_devices: &Devices,
    ) -> bool {
        const CLOUD_INIT_KEYS: &[&str] = &[
            "cloud-init.vendor-data",
            "cloud-init.user-data",
            "cloud-init.network-config",
            "user.vendor-data",
            "user.user-data",
            "user.network-config",
        ];

        if changed_config.iter().any(|k| CLOUD_INIT_KEYS.contains(&k.as_str())) {
            return true;
        }

        let local = self.local_config();
        let old_names = old_expanded_devices.nic_names(&local);
        let new_names = self.expanded_devices().nic_names(&local);

        old_names.iter().any(|n| !new_names.contains(n))
            || new_names.iter().any(|n| !old_names.contains(n))
    }

    /// Record a template trigger to apply on next start, never overwriting
    /// an existing one.
    pub async fn defer_template_apply(&self, trigger: &str) -> Result<()> {
        if self
            .local_config()
            .get("volatile.apply_template")
            .map(|v| !v.is_empty())
            .unwrap_or(false)
        {
            return Ok(());
        }

        let mut changes = HashMap::new();
        changes.insert("volatile.apply_template".to_string(), trigger.to_string());
        self.volatile_set(changes).await
    }

    //
    // SECTION: devices
    //

    fn device_context(&self) -> DeviceContext {
        DeviceContext {
            project: self.project(),
            instance: self.name(),
            instance_type: self.instance_type(),
            data_dir: self.state.data_dir.clone(),
            devices_dir: self.devices_path(),
        }
    }

    /// Instantiate and validate a device.
    fn device_load(&self, dev_name: &str, config: &DeviceConfig) -> Result<Box<dyn Device>> {
        crate::device::new_device(
            self.device_context(),
            dev_name,
            config.clone(),
            self.device_volatile_get_func(dev_name),
            self.device_volatile_set_func(dev_name),
        )
    }

    /// Run the Add hook of every expanded device, in sorted order. Returns
    /// a cleanup hook undoing the adds.
    pub async fn devices_add(&self) -> Result<Hook> {
        let mut reverter = Reverter::new();

        for (dev_name, config) in self.expanded_devices().sorted() {
            let dev = match self.device_load(&dev_name, &config) {
                Ok(dev) => dev,
                Err(CaskError::UnsupportedDevType) => continue,
                Err(e) => {
                    // Clear any volatile key set during failed validation.
                    let _ = self.device_volatile_reset(&dev_name, &config, None).await;
                    reverter.fail().await;
                    return Err(CaskError::BadRequest(format!(
                        "Failed add validation for device {:?}: {}",
                        dev_name, e
                    )));
                }
            };

            if let Err(e) = dev.add().await {
                reverter.fail().await;
                return Err(CaskError::Internal(format!(
                    "Failed to add device {:?}: {}",
                    dev_name, e
                )));
            }

            let instance = self.clone();
            let name = dev_name.clone();
            let dev_config = config.clone();
            reverter.add(move || {
                let instance = instance.clone();
                let name = name.clone();
                let dev_config = dev_config.clone();
                async move {
                    if let Ok(dev) = instance.device_load(&name, &dev_config) {
                        let _ = dev.remove().await;
                    }
                }
            });
        }

        Ok(reverter.into_hook())
    }

    /// Register every device's static handlers (daemon startup).
    pub fn devices_register(&self) {
        for (dev_name, config) in self.expanded_devices().sorted() {
            match self.device_load(&dev_name, &config) {
                Ok(dev) => {
                    if let Err(e) = dev.register() {
                        error!(device = %dev_name, error = %e, "Failed to register device");
                    }
                }
                Err(CaskError::UnsupportedDevType) => continue,
                Err(e) => error!(device = %dev_name, error = %e, "Failed to register device"),
            }
        }
    }

    /// Start every device in sorted order, merging their run configs.
    /// Returns the merged config and a cleanup hook stopping the started
    /// devices.
    async fn devices_start(&self) -> Result<(RunConfig, Hook)> {
        let mut reverter = Reverter::new();
        let mut merged = RunConfig::default();

        for (dev_name, config) in self.expanded_devices().sorted() {
            let dev = match self.device_load(&dev_name, &config) {
                Ok(dev) => dev,
                Err(CaskError::UnsupportedDevType) => continue,
                Err(e) => {
                    let _ = self.device_volatile_reset(&dev_name, &config, None).await;
                    reverter.fail().await;
                    return Err(CaskError::BadRequest(format!(
                        "Failed start validation for device {:?}: {}",
                        dev_name, e
                    )));
                }
            };

            if let Err(e) = dev.pre_start_check().await {
                reverter.fail().await;
                return Err(CaskError::BadRequest(format!(
                    "Failed pre-start check for device {:?}: {}",
                    dev_name, e
                )));
            }

            let run = match dev.start().await {
                Ok(run) => run,
                Err(e) => {
                    reverter.fail().await;
                    return Err(CaskError::Internal(format!(
                        "Failed to start device {:?}: {}",
                        dev_name, e
                    )));
                }
            };

            merged.mounts.extend(run.mounts);
            merged.network_interfaces.extend(run.network_interfaces);
            merged.unix_devices.extend(run.unix_devices);
            merged.pci_devices.extend(run.pci_devices);

            let instance = self.clone();
            let name = dev_name.clone();
            let dev_config = config.clone();
            reverter.add(move || {
                let instance = instance.clone();
                let name = name.clone();
                let dev_config = dev_config.clone();
                async move {
                    if let Ok(dev) = instance.device_load(&name, &dev_config) {
                        let _ = dev.stop().await;
                    }
                }
            });
        }

        Ok((merged, reverter.into_hook()))
    }

    /// Stop every device in reverse order. Failures are logged, not fatal.
    async fn devices_stop(&self) {
        for (dev_name, config) in self.expanded_devices().reversed() {
            match self.device_load(&dev_name, &config) {
                Ok(dev) => {
                    if let Err(e) = dev.stop().await {
                        error!(device = %dev_name, error = %e, "Failed to stop device");
                    }
                }
                Err(CaskError::UnsupportedDevType) => continue,
                Err(e) => error!(device = %dev_name, error = %e, "Failed stop validation for device"),
            }
        }
    }

    /// Run every device's Remove hook in reverse order, logging failures.
    pub async fn devices_remove(&self) {
        for (dev_name, config) in self.expanded_devices().reversed() {
            match self.device_load(&dev_name, &config) {
                Ok(dev) => {
                    if let Err(e) = dev.remove().await {
                        error!(device = %dev_name, error = %e, "Failed to remove device");
                    }
                }
                Err(CaskError::UnsupportedDevType) => continue,
                Err(e) => {
                    error!(device = %dev_name, error = %e, "Failed remove validation for device")
                }
            }
        }
    }

    //
    // SECTION: lifecycle
    //

    /// Constraints that would prevent a start from succeeding.
    pub async fn validate_startup(&self) -> Result<()> {
        // The root disk mounts before devices are set up, so its pool is
        // checked first to avoid masking an unavailable-pool error with a
        // generic status error.
        let (_, root_config) = self.root_disk_device().await?;
        let pool_name = root_config.get("pool").cloned().unwrap_or_default();

        if !crate::storage::is_available(&pool_name) {
            return Err(CaskError::Unavailable(format!(
                "Storage pool {:?} unavailable on this server",
                pool_name
            )));
        }

        if !self.state.architectures.contains(&self.architecture()) {
            return Err(CaskError::BadRequest(
                "Requested architecture isn't supported by this host".to_string(),
            ));
        }

        match self.status() {
            StatusCode::Error => Err(CaskError::BadRequest(
                "The instance cannot be started as in error status".to_string(),
            )),
            status if status.is_running() => Err(CaskError::InstanceAlreadyRunning),
            _ => Ok(()),
        }
    }

    /// Whether an automatic restart after a crash is permitted.
    pub fn should_auto_restart(&self) -> bool {
        if !crate::types::is_true(
            self.expanded_config().get("boot.autorestart").map(String::as_str).unwrap_or(""),
        ) {
            return false;
        }

        auto_restart_allowed(self.id(), crate::types::unix_now() * 1000)
    }

    /// Start the instance.
    #[instrument(skip(self), fields(project = %self.project(), instance = %self.name()))]
    pub async fn start(&self) -> Result<()> {
        self.validate_startup().await?;

        let op = match oplock::create_wait_get(
            &self.project(),
            &self.name(),
            Action::Start,
            START_ALT_ACTIONS,
            false,
            false,
        )
        .await
        {
            Ok(op) => op,
            Err(CaskError::NonReusableSucceeded) => return Ok(()),
            Err(e) => return Err(e),
        };

        info!("Starting instance");

        let result = self.start_inner().await;
        match result {
            Ok(()) => {
                op.done(None);
                info!("Started instance");
                Ok(())
            }
            Err(e) => {
                op.done(Some(&e));
                Err(e)
            }
        }
    }

    async fn start_inner(&self) -> Result<()> {
        let mut reverter = Reverter::new();

        let pool = self.pool().await?;
        let record = self.record();
        pool.mount_instance(&record).await?;

        {
            let pool = pool.clone();
            let record = record.clone();
            reverter.add(move || {
                let pool = pool.clone();
                let record = record.clone();
                async move {
                    let _ = pool.unmount_instance(&record).await;
                }
            });
        }

        // Balanced NUMA pinning is resolved before devices start.
        if self.expanded_config().get("limits.cpu.nodes").map(String::as_str) == Some("balanced")
        {
            if let Err(e) = self.balance_numa().await {
                reverter.fail().await;
                return Err(e);
            }
        }

        let (run, devices_cleanup) = match self.devices_start().await {
            Ok(out) => out,
            Err(e) => {
                reverter.fail().await;
                return Err(e);
            }
        };
        reverter.add_hook(devices_cleanup);

        if let Err(e) = self.state.runtime.start(&self.project(), &self.name(), &run).await {
            reverter.fail().await;
            return Err(e);
        }

        if let Err(e) = self.record_last_state().await {
            reverter.fail().await;
            return Err(e);
        }

        reverter.success();
        Ok(())
    }

    /// Record power state and last-used time after a successful start.
    async fn record_last_state(&self) -> Result<()> {
        let mut changes = HashMap::new();
        changes.insert(
            "volatile.last_state.power".to_string(),
            crate::types::instance::POWER_STATE_RUNNING.to_string(),
        );
        self.volatile_set(changes).await?;

        self.state
            .db
            .update_instance_last_used(self.id(), crate::types::unix_now())
            .await
            .map_err(|e| CaskError::Internal(format!("Error updating instance last used: {}", e)))?;

        {
            let mut inner = self.inner.lock().unwrap();
            inner.record.last_used_date = crate::types::unix_now();
        }

        Ok(())
    }

    /// Pick and record the NUMA node set under the process-wide mutex.
    async fn balance_numa(&self) -> Result<()> {
        let _guard = numa::NUMA_MUTEX.lock().await;

        let topology = numa::CpuTopology::detect();

        // Count the node usage of every other local instance that pins
        // NUMA, directly or via a balanced assignment.
        let mut usage: HashMap<u64, usize> = HashMap::new();
        for record in self.state.db.list_node_instances(&self.state.server_name).await? {
            if record.id == self.id() {
                continue;
            }

            let other = Instance::from_record(self.state.clone(), record).await?;
            let conf = other.expanded_config();

            let Some(mut nodes) = conf.get("limits.cpu.nodes").cloned() else {
                continue;
            };

            if nodes == "balanced" {
                nodes = conf.get("volatile.cpu.nodes").cloned().unwrap_or_default();
            }

            let Ok(node_set) = numa::parse_node_set(&nodes) else {
                continue;
            };

            for node in node_set {
                *usage.entry(node).or_default() += 1;
            }
        }

        let limits_cpu =
            self.expanded_config().get("limits.cpu").and_then(|v| v.parse::<u32>().ok());

        let picked = numa::pick_nodes(&topology, &usage, limits_cpu);

        let mut changes = HashMap::new();
        changes.insert("volatile.cpu.nodes".to_string(), numa::format_nodes(&picked));
        self.volatile_set(changes).await
    }

    /// Stop the instance. `force` skips the graceful path.
    #[instrument(skip(self), fields(project = %self.project(), instance = %self.name(), force))]
    pub async fn stop(&self, force: bool) -> Result<()> {
        if !self.is_running() {
            return Err(CaskError::InstanceIsStopped);
        }

        let op = match oplock::create_wait_get(
            &self.project(),
            &self.name(),
            Action::Stop,
            STOP_ALT_ACTIONS,
            false,
            false,
        )
        .await
        {
            Ok(op) => op,
            Err(CaskError::NonReusableSucceeded) => return Ok(()),
            Err(e) => return Err(e),
        };

        info!("Stopping instance");

        let result = self.stop_inner(force).await;
        let restarting = op.action() == Action::Restart;

        match result {
            Ok(()) => {
                op.done(None);
                info!("Stopped instance");
            }
            Err(e) => {
                op.done(Some(&e));
                return Err(e);
            }
        }

        // Ephemeral instances vanish on a plain stop.
        if self.is_ephemeral() && !restarting {
            self.delete().await?;
        }

        Ok(())
    }

    async fn stop_inner(&self, force: bool) -> Result<()> {
        self.state.runtime.stop(&self.project(), &self.name(), force).await?;
        self.finalize_stop().await
    }

    /// Send the graceful shutdown signal and wait up to `timeout`.
    #[instrument(skip(self), fields(project = %self.project(), instance = %self.name()))]
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        let status = self.status();
        if status == StatusCode::Frozen {
            return Err(CaskError::BadRequest("The instance is not running".to_string()));
        }

        if !status.is_running() {
            return Err(CaskError::InstanceIsStopped);
        }

        let op = match oplock::create_wait_get(
            &self.project(),
            &self.name(),
            Action::Stop,
            STOP_ALT_ACTIONS,
            false,
            false,
        )
        .await
        {
            Ok(op) => op,
            Err(CaskError::NonReusableSucceeded) => return Ok(()),
            Err(e) => return Err(e),
        };

        info!("Shutting down instance");

        let result = async {
            self.state.runtime.shutdown(&self.project(), &self.name(), timeout).await?;
            self.finalize_stop().await
        }
        .await;

        let restarting = op.action() == Action::Restart;

        match result {
            Ok(()) => op.done(None),
            Err(e) => {
                op.done(Some(&e));
                return Err(e);
            }
        }

        if self.is_ephemeral() && !restarting {
            self.delete().await?;
        }

        Ok(())
    }

    /// Pick up the lock held by an in-flight lifecycle operation before the
    /// instance process goes away, or create an instance-initiated one for
    /// guest-triggered stops (`target` is `stop` or `reboot`). Any live
    /// operation outside the lifecycle set is waited out first.
    pub async fn on_stop_operation_setup(
        &self,
        target: &str,
    ) -> Result<Arc<oplock::InstanceOperation>> {
        let mut existing = oplock::get(&self.project(), &self.name());

        if let Some(op) = &existing {
            if !op.action_match(&[
                Action::Start,
                Action::Restart,
                Action::Stop,
                Action::Restore,
                Action::Migrate,
            ]) {
                debug!(action = %op.action(), "Waiting for existing operation lock to finish before running hook");
                let _ = op.wait().await;
                existing = None;
            }
        }

        match existing {
            Some(op) => {
                debug!(action = %op.action(), "Instance operation lock inherited for stop");
                Ok(op)
            }
            None => {
                debug!(target, "Instance initiated stop");

                let action =
                    if target == "reboot" { Action::Restart } else { Action::Stop };

                let op = oplock::create(&self.project(), &self.name(), action, false, false)
                    .map_err(|e| {
                        CaskError::Internal(format!(
                            "Failed creating {:?} operation: {}",
                            action.as_str(),
                            e
                        ))
                    })?;
                op.set_instance_initiated(true);

                Ok(op)
            }
        }
    }

    /// Shared tail of stop/shutdown: device teardown and state recording.
    async fn finalize_stop(&self) -> Result<()> {
        self.devices_stop().await;

        let mut changes = HashMap::new();
        changes.insert(
            "volatile.last_state.power".to_string(),
            crate::types::instance::POWER_STATE_STOPPED.to_string(),
        );
        self.volatile_set(changes).await?;

        if let Ok(pool) = self.pool().await {
            let _ = pool.unmount_instance(&self.record()).await;
        }

        Ok(())
    }

    /// Restart: stop (or shutdown with `timeout`) then start, under a
    /// reusable restart lock. The ephemeral flag is cleared for the
    /// duration so the stop half doesn't delete the instance.
    #[instrument(skip(self), fields(project = %self.project(), instance = %self.name()))]
    pub async fn restart(&self, timeout: Duration) -> Result<()> {
        let op = match oplock::create_wait_get(
            &self.project(),
            &self.name(),
            Action::Restart,
            &[],
            true,
            true,
        )
        .await
        {
            Ok(op) => op,
            Err(CaskError::NonReusableSucceeded) => return Ok(()),
            Err(e) => {
                return Err(CaskError::Internal(format!("Create restart operation: {}", e)))
            }
        };

        info!("Restarting instance");

        let ephemeral = self.is_ephemeral();
        if ephemeral {
            self.set_ephemeral(false).await?;
        }

        let result = self.restart_inner(timeout).await;

        if ephemeral {
            let _ = self.set_ephemeral(true).await;
        }

        match result {
            Ok(()) => {
                op.done(None);
                info!("Restarted instance");
                Ok(())
            }
            Err(e) => {
                op.done(Some(&e));
                Err(e)
            }
        }
    }

    async fn restart_inner(&self, timeout: Duration) -> Result<()> {
        let stop_result = if timeout.is_zero() {
            self.stop(false).await
        } else {
            if self.status() == StatusCode::Frozen {
                return Err(CaskError::BadRequest("Instance is not running".to_string()));
            }

            self.shutdown(timeout).await
        };

        match stop_result {
            Ok(()) => {}
            // A concurrent restart's stop half may have got there first.
            Err(CaskError::InstanceIsStopped) => {}
            Err(e) => return Err(e),
        }

        // The stop half completed the restart lock; take a fresh one for
        // the start half.
        match oplock::create_wait_get(
            &self.project(),
            &self.name(),
            Action::Restart,
            &[],
            true,
            false,
        )
        .await
        {
            Ok(_op) => {}
            // An existing matching operation has now succeeded.
            Err(CaskError::NonReusableSucceeded) => return Ok(()),
            Err(e) => {
                return Err(CaskError::Internal(format!(
                    "Create restart (for start) operation: {}",
                    e
                )))
            }
        }

        self.start().await
    }

    async fn set_ephemeral(&self, ephemeral: bool) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.record.ephemeral = ephemeral;
        }

        self.state.db.update_instance(&self.record()).await
    }

    /// Rebuild the instance from scratch, optionally from an image.
    ///
    /// `image` is (fingerprint, properties); `None` rebuilds empty.
    #[instrument(skip(self, image), fields(project = %self.project(), instance = %self.name()))]
    pub async fn rebuild(
        &self,
        image: Option<(String, HashMap<String, String>)>,
    ) -> Result<()> {
        if self.is_running() {
            return Err(CaskError::BadRequest(
                "Instance must be stopped to be rebuilt".to_string(),
            ));
        }

        let mut local = self.local_config();

        // Reset the image origin keys.
        local.retain(|k, _| !k.starts_with("image."));
        local.remove("volatile.base_image");

        if let Some((fingerprint, properties)) = &image {
            for (k, v) in properties {
                local.insert(format!("image.{}", k), v.clone());
            }

            local.insert("volatile.base_image".to_string(), fingerprint.clone());
            if let Some(uuid) = local.get("volatile.uuid").cloned() {
                local.insert("volatile.uuid.generation".to_string(), uuid);
            }
        }

        local.remove("volatile.idmap.next");
        local.remove("volatile.last_state.idmap");

        let pool = self.pool().await?;
        let record = self.record();

        pool.delete_instance(&record).await?;

        match &image {
            None => pool.create_instance(&record).await?,
            Some((fingerprint, _)) => {
                pool.create_instance_from_image(&record, fingerprint).await?
            }
        }

        // Commit the reset config atomically.
        {
            let mut inner = self.inner.lock().unwrap();
            inner.record.config = local;
            inner.expand();
        }
        self.state.db.update_instance(&self.record()).await?;

        info!("Rebuilt instance");
        Ok(())
    }

    //
    // SECTION: snapshots
    //

    /// Snapshots of this instance, ordered by (creation date, id).
    pub async fn snapshots(&self) -> Result<Vec<InstanceRecord>> {
        if self.is_snapshot() {
            return Ok(Vec::new());
        }

        self.state.db.get_instance_snapshots(&self.project(), &self.name()).await
    }

    /// Create a snapshot.
    #[instrument(skip(self), fields(project = %self.project(), instance = %self.name(), snapshot = %name))]
    pub async fn snapshot(
        &self,
        name: &str,
        expiry: Option<i64>,
        stateful: bool,
    ) -> Result<()> {
        let mut reverter = Reverter::new();

        let result = self.snapshot_inner(name, expiry, stateful, &mut reverter).await;
        match result {
            Ok(()) => {
                reverter.success();
                Ok(())
            }
            Err(e) => {
                reverter.fail().await;
                Err(e)
            }
        }
    }

    async fn snapshot_inner(
        &self,
        name: &str,
        expiry: Option<i64>,
        stateful: bool,
        reverter: &mut Reverter,
    ) -> Result<()> {
        let record = self.record();

        let args = InstanceArgs {
            project: record.project.clone(),
            name: format!("{}{}{}", record.name, crate::types::SNAPSHOT_DELIMITER, name),
            node: record.node.clone(),
            instance_type: record.instance_type,
            architecture: record.architecture.clone(),
            ephemeral: record.ephemeral,
            snapshot: true,
            stateful,
            description: String::new(),
            expiry_date: expiry,
            config: record.config.clone(),
            devices: record.devices.clone(),
            profiles: record.profiles.clone(),
        };

        let (snap_record, snap_op, cleanup) =
            create_internal(&self.state, args).await.map_err(|e| {
                CaskError::Internal(format!(
                    "Failed creating instance snapshot record {:?}: {}",
                    name, e
                ))
            })?;
        reverter.add_hook(cleanup);

        let pool = self.pool().await?;

        let result: Result<()> = async {
            pool.create_instance_snapshot(&snap_record, &record)
                .await
                .map_err(|e| CaskError::Internal(format!("Create instance snapshot: {}", e)))?;

            {
                let pool = pool.clone();
                let snap_record = snap_record.clone();
                reverter.add(move || {
                    let pool = pool.clone();
                    let snap_record = snap_record.clone();
                    async move {
                        let _ = pool.delete_instance_snapshot(&snap_record).await;
                    }
                });
            }

            // Mount so backup.yaml can be refreshed alongside the volume.
            pool.mount_instance(&record).await.map_err(|e| {
                CaskError::Internal(format!("Create instance snapshot (mount source): {}", e))
            })?;

            let result = self.update_backup_file().await;
            let _ = pool.unmount_instance(&record).await;
            result
        }
        .await;

        match result {
            Ok(()) => {
                snap_op.done(None);
                Ok(())
            }
            Err(e) => {
                snap_op.done(Some(&e));
                Err(e)
            }
        }
    }

    /// Restore the instance from one of its snapshots.
    #[instrument(skip(self), fields(project = %self.project(), instance = %self.name(), snapshot = %snapshot_name))]
    pub async fn restore(&self, snapshot_name: &str) -> Result<()> {
        if self.is_running() {
            return Err(CaskError::BadRequest(
                "Instance must be stopped to be restored".to_string(),
            ));
        }

        let op = match oplock::create_wait_get(
            &self.project(),
            &self.name(),
            Action::Restore,
            &[],
            false,
            false,
        )
        .await
        {
            Ok(op) => op,
            Err(CaskError::NonReusableSucceeded) => return Ok(()),
            Err(e) => return Err(e),
        };

        info!("Restoring instance");

        let result = self.restore_inner(snapshot_name).await;
        match result {
            Ok(()) => {
                op.done(None);
                info!("Restored instance");
                Ok(())
            }
            Err(e) => {
                op.done(Some(&e));
                Err(e)
            }
        }
    }

    async fn restore_inner(&self, snapshot_name: &str) -> Result<()> {
        let full_name =
            format!("{}{}{}", self.name(), crate::types::SNAPSHOT_DELIMITER, snapshot_name);
        let snap_record = self.state.db.get_instance(&self.project(), &full_name).await?;

        let pool = self.pool().await?;
        pool.restore_instance(&self.record(), snapshot_name).await?;

        // Bring the instance row back to the snapshot's contents. Device
        // validation problems are downgraded to warnings so the restore
        // still completes.
        let args = UpdateArgs {
            architecture: snap_record.architecture,
            description: snap_record.description,
            ephemeral: snap_record.ephemeral,
            config: snap_record.config,
            devices: snap_record.devices,
            profiles: snap_record.profiles,
        };

        self.update(args, false).await
    }

    /// Delete all of the instance's snapshots, newest first.
    pub async fn delete_snapshots(&self) -> Result<()> {
        let pool = self.pool().await?;

        for snapshot in self.snapshots().await?.into_iter().rev() {
            pool.delete_instance_snapshot(&snapshot).await.map_err(|e| {
                CaskError::Internal(format!(
                    "Failed deleting snapshot {:?}: {}",
                    snapshot.name, e
                ))
            })?;

            self.state.db.delete_instance(&snapshot.project, &snapshot.name).await?;
        }

        Ok(())
    }

    //
    // SECTION: update
    //

    /// Apply a config/device/profile update.
    ///
    /// Device changes are applied as: removes in reverse order, adds in
    /// sorted order, then in-place updates. Validation failures fail the
    /// whole update when user-requested and are downgraded to warnings
    /// otherwise (e.g. during a snapshot restore).
    #[instrument(skip(self, args), fields(project = %self.project(), instance = %self.name(), user_requested))]
    pub async fn update(&self, args: UpdateArgs, user_requested: bool) -> Result<()> {
        let running = self.is_running();

        let old_expanded_config = self.expanded_config();
        let old_expanded_devices = self.expanded_devices();
        let old_record = self.record();
        let old_profiles = self.profiles();

        let new_profiles =
            self.state.db.get_profiles(&self.project(), &args.profiles).await?;
        let new_expanded_devices = expand_devices(&args.devices, &new_profiles);

        // Compute the device diff on expanded sets.
        let mut remove = Vec::new();
        let mut add = Vec::new();
        let mut update = Vec::new();

        for (name, old_config) in old_expanded_devices.iter() {
            match new_expanded_devices.get(name) {
                None => remove.push((name.clone(), old_config.clone())),
                Some(new_config) if new_config != old_config => {
                    if new_config.get("type") != old_config.get("type") {
                        remove.push((name.clone(), old_config.clone()));
                        add.push((name.clone(), new_config.clone()));
                    } else {
                        update.push((name.clone(), new_config.clone()));
                    }
                }
                Some(_) => {}
            }
        }

        for (name, new_config) in new_expanded_devices.iter() {
            if !old_expanded_devices.contains(name) {
                add.push((name.clone(), new_config.clone()));
            }
        }

        let mut reverter = Reverter::new();
        let result = self
            .devices_update(
                &remove,
                &add,
                &update,
                &old_expanded_devices,
                &new_expanded_devices,
                running,
                user_requested,
                &mut reverter,
            )
            .await;

        if let Err(e) = result {
            reverter.fail().await;
            return Err(e);
        }

        // Commit the new definition.
        {
            let mut inner = self.inner.lock().unwrap();
            inner.record.architecture = args.architecture.clone();
            inner.record.description = args.description.clone();
            inner.record.ephemeral = args.ephemeral;
            inner.record.config = args.config.clone();
            inner.record.devices = args.devices.clone();
            inner.record.profiles = args.profiles.clone();
            inner.profiles = new_profiles;
            inner.expand();
        }

        if let Err(e) = self.state.db.update_instance(&self.record()).await {
            // Roll devices and the in-memory state back.
            reverter.fail().await;
            let mut inner = self.inner.lock().unwrap();
            inner.record = old_record;
            inner.profiles = old_profiles;
            inner.expand();
            return Err(e);
        }

        reverter.success();

        // A changed cloud-init config or NIC name set invalidates the
        // cloud-init instance id.
        let new_expanded_config = self.expanded_config();
        let mut changed: Vec<String> = Vec::new();
        for (key, value) in &new_expanded_config {
            if old_expanded_config.get(key) != Some(value) {
                changed.push(key.clone());
            }
        }
        for key in old_expanded_config.keys() {
            if !new_expanded_config.contains_key(key) {
                changed.push(key.clone());
            }
        }

        if self.needs_new_instance_id(&changed, &old_expanded_devices) {
            self.reset_instance_id().await?;
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn devices_update(
        &self,
        remove: &[(String, DeviceConfig)],
        add: &[(String, DeviceConfig)],
        update: &[(String, DeviceConfig)],
        old_expanded_devices: &Devices,
        new_expanded_devices: &Devices,
        running: bool,
        user_requested: bool,
        reverter: &mut Reverter,
    ) -> Result<()> {
        // Removes run in reverse declaration order.
        let mut remove_sorted: Vec<&(String, DeviceConfig)> = remove.iter().collect();
        remove_sorted.sort_by(|a, b| b.0.cmp(&a.0));

        for (name, old_config) in remove_sorted {
            let dev = match self.device_load(name, old_config) {
                Ok(dev) => dev,
                Err(CaskError::UnsupportedDevType) => continue,
                Err(e) => {
                    // Still reset volatile state for unloadable devices.
                    warn!(device = %name, error = %e, "Failed remove validation for device");
                    let _ = self
                        .device_volatile_reset(name, old_config, new_expanded_devices.get(name))
                        .await;
                    continue;
                }
            };

            if running && !dev.can_hot_plug() {
                return Err(CaskError::BadRequest(
                    "Device cannot be removed when instance is running".to_string(),
                ));
            }

            if running {
                dev.stop().await.map_err(|e| {
                    CaskError::Internal(format!("Failed to stop device {:?}: {}", name, e))
                })?;
            }

            dev.remove().await.map_err(|e| {
                CaskError::Internal(format!("Failed to remove device {:?}: {}", name, e))
            })?;

            self.device_volatile_reset(name, old_config, new_expanded_devices.get(name))
                .await
                .map_err(|e| {
                    CaskError::Internal(format!(
                        "Failed to reset volatile data for device {:?}: {}",
                        name, e
                    ))
                })?;
        }

        // Adds run in sorted order so disk mounts nest correctly.
        let mut add_sorted: Vec<&(String, DeviceConfig)> = add.iter().collect();
        add_sorted.sort_by(|a, b| {
            let a_key = (a.1.get("path").cloned().unwrap_or_default(), a.0.clone());
            let b_key = (b.1.get("path").cloned().unwrap_or_default(), b.0.clone());
            a_key.cmp(&b_key)
        });

        for (name, new_config) in add_sorted {
            let dev = match self.device_load(name, new_config) {
                Ok(dev) => dev,
                Err(CaskError::UnsupportedDevType) => continue,
                Err(e) => {
                    if user_requested {
                        let _ = self.device_volatile_reset(name, new_config, None).await;
                        return Err(CaskError::BadRequest(format!(
                            "Failed add validation for device {:?}: {}",
                            name, e
                        )));
                    }

                    // Non-user requested (e.g. snapshot restore): log and
                    // keep going rather than blocking the restore.
                    error!(device = %name, error = %e, "Failed add validation for device, skipping as non-user requested");
                    continue;
                }
            };

            if running && !dev.can_hot_plug() {
                return Err(CaskError::BadRequest(
                    "Device cannot be added when instance is running".to_string(),
                ));
            }

            if let Err(e) = dev.add().await {
                if user_requested {
                    return Err(CaskError::Internal(format!(
                        "Failed to add device {:?}: {}",
                        name, e
                    )));
                }

                error!(device = %name, error = %e, "Failed to add device, skipping as non-user requested");
                continue;
            }

            {
                let instance = self.clone();
                let dev_name = name.clone();
                let dev_config = new_config.clone();
                reverter.add(move || {
                    let instance = instance.clone();
                    let dev_name = dev_name.clone();
                    let dev_config = dev_config.clone();
                    async move {
                        if let Ok(dev) = instance.device_load(&dev_name, &dev_config) {
                            let _ = dev.remove().await;
                        }
                    }
                });
            }

            if running {
                dev.pre_start_check().await.map_err(|e| {
                    CaskError::BadRequest(format!(
                        "Failed pre-start check for device {:?}: {}",
                        name, e
                    ))
                })?;

                dev.start().await.map_err(|e| {
                    CaskError::Internal(format!("Failed to start device {:?}: {}", name, e))
                })?;

                let instance = self.clone();
                let dev_name = name.clone();
                let dev_config = new_config.clone();
                reverter.add(move || {
                    let instance = instance.clone();
                    let dev_name = dev_name.clone();
                    let dev_config = dev_config.clone();
                    async move {
                        if let Ok(dev) = instance.device_load(&dev_name, &dev_config) {
                            let _ = dev.stop().await;
                        }
                    }
                });
            }
        }

        // In-place updates run last, also in sorted order.
        let mut update_sorted: Vec<&(String, DeviceConfig)> = update.iter().collect();
        update_sorted.sort_by(|a, b| a.0.cmp(&b.0));

        for (name, new_config) in update_sorted {
            let dev = match self.device_load(name, new_config) {
                Ok(dev) => dev,
                Err(CaskError::UnsupportedDevType) => continue,
                Err(e) => {
                    if user_requested {
                        return Err(CaskError::BadRequest(format!(
                            "Failed update validation for device {:?}: {}",
                            name, e
                        )));
                    }

                    error!(device = %name, error = %e, "Failed update validation for device, skipping as non-user requested");
                    continue;
                }
            };

            dev.update(old_expanded_devices, running).await.map_err(|e| {
                CaskError::Internal(format!("Failed to update device {:?}: {}", name, e))
            })?;
        }

        Ok(())
    }

    //
    // SECTION: rename / delete
    //

    /// Rename the instance (must be stopped).
    #[instrument(skip(self), fields(project = %self.project(), instance = %self.name(), new_name))]
    pub async fn rename(&self, new_name: &str) -> Result<()> {
        valid_name(new_name, false)?;

        if self.is_running() {
            return Err(CaskError::BadRequest(
                "Instance must be stopped to be renamed".to_string(),
            ));
        }

        let pool = self.pool().await?;
        let record = self.record();

        pool.rename_instance(&record, new_name).await?;
        self.state.db.rename_instance(&record.project, &record.name, new_name).await?;

        {
            let mut inner = self.inner.lock().unwrap();
            inner.record.name = new_name.to_string();
        }

        info!("Renamed instance");
        Ok(())
    }

    /// Delete the instance, its snapshots, volumes and backup artifacts.
    #[instrument(skip(self), fields(project = %self.project(), instance = %self.name()))]
    pub async fn delete(&self) -> Result<()> {
        if self.is_running() {
            return Err(CaskError::BadRequest(
                "Instance must be stopped to be deleted".to_string(),
            ));
        }

        let op = oplock::create(&self.project(), &self.name(), Action::Delete, false, false)?;

        info!("Deleting instance");

        let result = self.delete_inner().await;
        match result {
            Ok(()) => {
                op.done(None);
                info!("Deleted instance");
                Ok(())
            }
            Err(e) => {
                op.done(Some(&e));
                Err(e)
            }
        }
    }

    async fn delete_inner(&self) -> Result<()> {
        self.delete_snapshots().await?;

        let pool = self.pool().await?;
        pool.delete_instance(&self.record()).await?;

        self.devices_remove().await;

        // Backup tarballs on disk go with the instance.
        let backups_dir = crate::paths::instance_backups_dir(
            &self.state.data_dir,
            &self.project(),
            &self.name(),
        );
        if backups_dir.exists() {
            let _ = tokio::fs::remove_dir_all(&backups_dir).await;
        }

        self.state.db.delete_instance(&self.project(), &self.name()).await
    }

    //
    // SECTION: migration / backup support
    //

    /// Migration policy for this instance: `stop`, `migrate` or
    /// `live-migrate`, honoring the `cluster.evacuate` override and device
    /// portability.
    pub fn can_migrate(&self) -> String {
        let config = self.expanded_config();
        let policy = config.get("cluster.evacuate").map(String::as_str).unwrap_or("auto");

        if policy != "auto" {
            return policy.to_string();
        }

        for (dev_name, dev_config) in self.expanded_devices().sorted() {
            let dev = match self.device_load(&dev_name, &dev_config) {
                Ok(dev) => dev,
                Err(CaskError::UnsupportedDevType) => continue,
                Err(e) => {
                    warn!(device = %dev_name, error = %e, "Instance will not be migrated due to a device error");
                    return "stop".to_string();
                }
            };

            if !dev.can_migrate() {
                warn!(device = %dev_name, "Instance will not be migrated because its device cannot be migrated");
                return "stop".to_string();
            }
        }

        if self.instance_type() == crate::types::InstanceType::VirtualMachine
            && crate::types::is_true(
                config.get("migration.stateful").map(String::as_str).unwrap_or(""),
            )
        {
            return "live-migrate".to_string();
        }

        "migrate".to_string()
    }

    /// Rewrite the on-volume `backup.yaml` with the current definition and
    /// snapshot list, so the volume alone is restorable.
    pub async fn update_backup_file(&self) -> Result<()> {
        let pool = self.pool().await?;
        let record = self.record();

        let config = pool.generate_instance_backup_config(&record, true).await?;
        let data = serde_yaml::to_string(&config)
            .map_err(|e| CaskError::Internal(format!("Failed serialising backup config: {}", e)))?;

        let mountpoint = pool.mount_instance(&record).await?;
        let path = mountpoint.join("backup.yaml");
        tokio::fs::write(&path, data).await.map_err(|e| crate::error::io_error(&path, e))?;

        debug!(path = ?path, "Updated instance backup file");
        Ok(())
    }

    /// Race-safe insert of a single config key; the value that ends up in
    /// the database wins and is applied locally.
    pub async fn insert_config_key(&self, key: &str, value: &str) -> Result<String> {
        let stored =
            self.state.db.try_insert_instance_config_key(self.id(), key, value).await?;

        let mut inner = self.inner.lock().unwrap();
        inner.record.config.insert(key.to_string(), stored.clone());
        inner.expand();

        Ok(stored)
    }
}

/// Arguments for [`Instance::update`].
#[derive(Debug, Clone, Default)]
pub struct UpdateArgs {
    pub architecture: String,
    pub description: String,
    pub ephemeral: bool,
    pub config: HashMap<String, String>,
    pub devices: Devices,
    pub profiles: Vec<String>,
}

impl UpdateArgs {
    /// Update args matching an instance's current definition.
    pub fn from_record(record: &InstanceRecord) -> Self {
        Self {
            architecture: record.architecture.clone(),
            description: record.description.clone(),
            ephemeral: record.ephemeral,
            config: record.config.clone(),
            devices: record.devices.clone(),
            profiles: record.profiles.clone(),
        }
    }
}
