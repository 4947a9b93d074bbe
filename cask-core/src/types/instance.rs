//! Instance domain types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::device::Devices;

/// Kind of instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceType {
    /// System container.
    #[default]
    Container,
    /// Virtual machine.
    VirtualMachine,
}

impl InstanceType {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::VirtualMachine => "virtual-machine",
        }
    }

    /// Parse from string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "container" => Some(Self::Container),
            "virtual-machine" => Some(Self::VirtualMachine),
            _ => None,
        }
    }
}

impl std::fmt::Display for InstanceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Coarse instance status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusCode {
    Running,
    Stopped,
    Starting,
    Stopping,
    Frozen,
    Error,
}

impl StatusCode {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Stopping => "stopping",
            Self::Frozen => "frozen",
            Self::Error => "error",
        }
    }

    /// Parse from string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "running" => Some(Self::Running),
            "stopped" => Some(Self::Stopped),
            "starting" => Some(Self::Starting),
            "stopping" => Some(Self::Stopping),
            "frozen" => Some(Self::Frozen),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Whether the status counts as running for lifecycle checks.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !matches!(self, Self::Error | Self::Stopped)
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Power state recorded in `volatile.last_state.power`.
pub const POWER_STATE_RUNNING: &str = "RUNNING";
/// Power state recorded in `volatile.last_state.power` after a clean stop.
pub const POWER_STATE_STOPPED: &str = "STOPPED";

/// An instance row as stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Numeric row id.
    pub id: i64,

    /// Owning project.
    pub project: String,

    /// Instance name. Snapshots use `parent/snap` form.
    pub name: String,

    /// Cluster member the instance lives on.
    pub node: String,

    /// Instance kind.
    pub instance_type: InstanceType,

    /// Architecture name (e.g. `x86_64`).
    pub architecture: String,

    /// Whether the instance is deleted when stopped.
    pub ephemeral: bool,

    /// Whether this row is a snapshot of another instance.
    pub snapshot: bool,

    /// Whether runtime state is captured on stop/migration.
    pub stateful: bool,

    /// Free-form description.
    pub description: String,

    /// Unix timestamp of creation.
    pub creation_date: i64,

    /// Unix timestamp of last start.
    pub last_used_date: i64,

    /// Unix timestamp at which a snapshot expires, if any.
    pub expiry_date: Option<i64>,

    /// Authored (local) config.
    pub config: HashMap<String, String>,

    /// Authored (local) devices.
    pub devices: Devices,

    /// Ordered profile names.
    pub profiles: Vec<String>,
}

/// Arguments for creating an instance row.
#[derive(Debug, Clone, Default)]
pub struct InstanceArgs {
    pub project: String,
    pub name: String,
    pub node: String,
    pub instance_type: InstanceType,
    pub architecture: String,
    pub ephemeral: bool,
    pub snapshot: bool,
    pub stateful: bool,
    pub description: String,
    pub expiry_date: Option<i64>,
    pub config: HashMap<String, String>,
    pub devices: Devices,
    pub profiles: Vec<String>,
}

/// Config keys (and prefixes) that are carried over when copying an
/// instance. All other `volatile.*` keys are private to the source.
const COPY_VOLATILE_ALLOWLIST: &[&str] = &["volatile.base_image"];

/// Whether a local config key should be inherited by a copy of the instance.
pub fn include_when_copying(key: &str) -> bool {
    if !key.starts_with(crate::types::VOLATILE_PREFIX) {
        return true;
    }

    COPY_VOLATILE_ALLOWLIST.contains(&key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_type() {
        assert_eq!(InstanceType::Container.as_str(), "container");
        assert_eq!(InstanceType::parse("virtual-machine"), Some(InstanceType::VirtualMachine));
        assert_eq!(InstanceType::parse("vm"), None);
    }

    #[test]
    fn test_status_is_running() {
        assert!(StatusCode::Running.is_running());
        assert!(StatusCode::Frozen.is_running());
        assert!(!StatusCode::Stopped.is_running());
        assert!(!StatusCode::Error.is_running());
    }

    #[test]
    fn test_include_when_copying() {
        assert!(include_when_copying("limits.cpu"));
        assert!(include_when_copying("volatile.base_image"));
        assert!(!include_when_copying("volatile.eth0.hwaddr"));
        assert!(!include_when_copying("volatile.uuid"));
    }
}
