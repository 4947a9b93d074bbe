//! Shared domain types.

pub mod acl;
pub mod backup;
pub mod device;
pub mod instance;
pub mod member;
pub mod network;
pub mod profile;
pub mod storage;

pub use acl::{AclRule, NetworkAcl, RuleAction, RuleState};
pub use backup::{BackupConfig, BackupIndex, BackupParent, BackupRecord, BackupType};
pub use device::{DeviceConfig, Devices};
pub use instance::{InstanceArgs, InstanceRecord, InstanceType, StatusCode};
pub use member::Member;
pub use network::NetworkRecord;
pub use profile::Profile;
pub use storage::{ContentType, PoolRecord, PoolState, VolumeRecord, VolumeType, VOLUME_NODE_REMOTE};

/// Prefix of config keys that the system may write at any time and that are
/// never part of user-authored state.
pub const VOLATILE_PREFIX: &str = "volatile.";

/// Separator between an instance name and a snapshot name.
pub const SNAPSHOT_DELIMITER: &str = "/";

/// Split a possibly snapshot-qualified name into (parent, snapshot).
pub fn parent_and_snapshot_name(name: &str) -> (&str, Option<&str>) {
    match name.split_once(SNAPSHOT_DELIMITER) {
        Some((parent, snap)) => (parent, Some(snap)),
        None => (name, None),
    }
}

/// Whether a config key is user-defined (never validated).
pub fn is_user_config(key: &str) -> bool {
    key.starts_with("user.")
}

/// Whether a boolean-ish config value is set to true.
pub fn is_true(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

/// Current time as a unix timestamp in seconds.
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_and_snapshot_name() {
        assert_eq!(parent_and_snapshot_name("c1"), ("c1", None));
        assert_eq!(parent_and_snapshot_name("c1/snap0"), ("c1", Some("snap0")));
    }

    #[test]
    fn test_is_true() {
        assert!(is_true("true"));
        assert!(is_true("1"));
        assert!(!is_true("false"));
        assert!(!is_true(""));
    }
}
