//! Network rows, as seen by the ACL core.
//!
//! Networks themselves are managed elsewhere; the ACL engine only needs the
//! type (bridge or OVN) and the `security.acls` assignment in the config.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A network row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkRecord {
    pub id: i64,
    pub project: String,
    pub name: String,
    /// Network type name (`bridge`, `ovn`, ...).
    pub net_type: String,
    pub config: HashMap<String, String>,
}

impl NetworkRecord {
    /// ACL names assigned directly to the network.
    pub fn acls(&self) -> Vec<String> {
        self.config
            .get("security.acls")
            .map(|v| crate::types::acl::split_trimmed(v))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acls() {
        let mut config = HashMap::new();
        config.insert("security.acls".to_string(), "web, db".to_string());

        let net = NetworkRecord {
            id: 1,
            project: "default".to_string(),
            name: "br0".to_string(),
            net_type: "bridge".to_string(),
            config,
        };

        assert_eq!(net.acls(), vec!["web", "db"]);
    }
}
