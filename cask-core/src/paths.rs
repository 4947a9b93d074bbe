//! Centralized path configuration for CASK.
//!
//! `data_dir()` resolves the daemon's root; every other helper takes the
//! root explicitly so alternative roots (tests, nested daemons) work
//! without process-global state.

use std::path::{Path, PathBuf};

/// Get the CASK data directory.
///
/// Resolution order:
/// 1. `CASK_DATA_DIR` environment variable
/// 2. `/var/lib/cask` if it exists (system install)
/// 3. `~/.cask` for user-only installs
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CASK_DATA_DIR") {
        return PathBuf::from(dir);
    }

    let system_dir = PathBuf::from("/var/lib/cask");
    if system_dir.exists() {
        return system_dir;
    }

    dirs::home_dir().map(|h| h.join(".cask")).unwrap_or(system_dir)
}

/// Get the database path.
pub fn db_path(root: &Path) -> PathBuf {
    root.join("cask.db")
}

/// Project-prefixed storage name, e.g. `proj_c1` (plain name in the default
/// project). Used for all per-instance directory names.
pub fn project_instance(project: &str, name: &str) -> String {
    if project == "default" {
        return name.to_string();
    }

    format!("{}_{}", project, name)
}

/// Directory holding container instance data.
pub fn containers_dir(root: &Path) -> PathBuf {
    root.join("containers")
}

/// Directory holding virtual machine instance data.
pub fn virtual_machines_dir(root: &Path) -> PathBuf {
    root.join("virtual-machines")
}

/// Per-instance device runtime state directory.
pub fn instance_devices_dir(root: &Path, project: &str, name: &str) -> PathBuf {
    root.join("devices").join(project_instance(project, name))
}

/// Per-instance log directory.
pub fn instance_logs_dir(root: &Path, project: &str, name: &str) -> PathBuf {
    root.join("logs").join(project_instance(project, name))
}

/// Root of the backups tree.
pub fn backups_dir(root: &Path) -> PathBuf {
    root.join("backups")
}

/// Directory holding the backups of one instance.
pub fn instance_backups_dir(root: &Path, project: &str, name: &str) -> PathBuf {
    backups_dir(root).join("instances").join(project_instance(project, name))
}

/// Directory holding the backups of one custom volume.
pub fn volume_backups_dir(root: &Path, pool: &str, project: &str, volume: &str) -> PathBuf {
    backups_dir(root).join("custom").join(pool).join(project_instance(project, volume))
}

/// Directory holding the backups of one bucket.
pub fn bucket_backups_dir(root: &Path, pool: &str, project: &str, bucket: &str) -> PathBuf {
    backups_dir(root).join("buckets").join(pool).join(project_instance(project, bucket))
}

/// Mountpoint root of a storage pool.
pub fn pool_mount_dir(root: &Path, pool: &str) -> PathBuf {
    root.join("storage-pools").join(pool)
}
