//! Cluster member records.

use serde::{Deserialize, Serialize};

/// A cluster member row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub id: i64,
    pub name: String,
    /// Network address peers use to reach this member.
    pub address: String,
    /// Architecture names the member can run.
    pub architectures: Vec<String>,
    /// Cluster groups the member belongs to.
    pub groups: Vec<String>,
    /// Unix timestamp of the last heartbeat.
    pub heartbeat: i64,
    /// Whether the member has been evacuated.
    pub evacuated: bool,
    /// Number of instances currently placed on the member.
    pub instance_count: i64,
}

impl Member {
    /// Whether the member is considered offline given the cluster offline
    /// threshold (seconds).
    pub fn is_offline(&self, offline_threshold: i64, now: i64) -> bool {
        now - self.heartbeat > offline_threshold
    }

    /// Whether the member can run at least one of the given architectures.
    /// An empty requirement set matches every member.
    pub fn supports_architectures(&self, architectures: &[String]) -> bool {
        if architectures.is_empty() {
            return true;
        }

        architectures.iter().any(|a| self.architectures.contains(a))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str, heartbeat: i64) -> Member {
        Member {
            id: 1,
            name: name.to_string(),
            address: "10.0.0.1:8443".to_string(),
            architectures: vec!["x86_64".to_string()],
            groups: vec![],
            heartbeat,
            evacuated: false,
            instance_count: 0,
        }
    }

    #[test]
    fn test_is_offline() {
        let m = member("node1", 1_000);
        assert!(!m.is_offline(20, 1_010));
        assert!(m.is_offline(20, 1_030));
    }

    #[test]
    fn test_supports_architectures() {
        let m = member("node1", 0);
        assert!(m.supports_architectures(&[]));
        assert!(m.supports_architectures(&["x86_64".to_string(), "aarch64".to_string()]));
        assert!(!m.supports_architectures(&["riscv64".to_string()]));
    }
}
