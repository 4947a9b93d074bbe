//! Network ACL domain types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Action taken by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleAction {
    Allow,
    AllowStateless,
    Drop,
    Reject,
}

impl RuleAction {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::AllowStateless => "allow-stateless",
            Self::Drop => "drop",
            Self::Reject => "reject",
        }
    }

    /// Parse from string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allow" => Some(Self::Allow),
            "allow-stateless" => Some(Self::AllowStateless),
            "drop" => Some(Self::Drop),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }
}

impl std::fmt::Display for RuleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether a rule is active and whether matches are logged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleState {
    #[default]
    Enabled,
    Disabled,
    Logged,
}

impl RuleState {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
            Self::Logged => "logged",
        }
    }

    /// Parse from string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "enabled" => Some(Self::Enabled),
            "disabled" => Some(Self::Disabled),
            "logged" => Some(Self::Logged),
            _ => None,
        }
    }
}

impl std::fmt::Display for RuleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single ACL rule. String fields hold comma-separated lists where noted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclRule {
    /// Action to take on match. Stored as its kebab-case name so rules
    /// compare and serialise stably.
    pub action: String,

    /// Rule state (enabled/disabled/logged).
    pub state: String,

    /// Comma-separated source subjects.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,

    /// Comma-separated destination subjects.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub destination: String,

    /// Protocol: empty, `icmp4`, `icmp6`, `tcp` or `udp`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,

    /// Comma-separated source ports or port ranges (tcp/udp only).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_port: String,

    /// Comma-separated destination ports or port ranges (tcp/udp only).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub destination_port: String,

    /// ICMP message type (icmp4/icmp6 only).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub icmp_type: String,

    /// ICMP message code (icmp4/icmp6 only).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub icmp_code: String,

    /// Free-form description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl AclRule {
    /// Normalise list fields: trim whitespace around each comma-separated
    /// element and drop empties. Normalisation is idempotent.
    pub fn normalise(&mut self) {
        self.action = self.action.trim().to_string();
        self.state = self.state.trim().to_string();
        self.protocol = self.protocol.trim().to_string();
        self.icmp_type = self.icmp_type.trim().to_string();
        self.icmp_code = self.icmp_code.trim().to_string();
        self.description = self.description.trim().to_string();

        for field in [
            &mut self.source,
            &mut self.destination,
            &mut self.source_port,
            &mut self.destination_port,
        ] {
            *field = split_trimmed(field).join(",");
        }
    }
}

/// Split a comma-separated list, trimming whitespace and dropping empties.
pub fn split_trimmed(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// A network ACL row: named, per-project rule sets for both directions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkAcl {
    pub id: i64,
    pub project: String,
    pub name: String,
    pub description: String,
    pub config: HashMap<String, String>,
    pub ingress: Vec<AclRule>,
    pub egress: Vec<AclRule>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalise_idempotent() {
        let mut rule = AclRule {
            action: "allow".to_string(),
            state: "enabled".to_string(),
            source: " 10.0.0.1 ,  10.0.0.0/24,".to_string(),
            ..Default::default()
        };

        rule.normalise();
        assert_eq!(rule.source, "10.0.0.1,10.0.0.0/24");

        let once = rule.clone();
        rule.normalise();
        assert_eq!(rule, once);
    }

    #[test]
    fn test_split_trimmed() {
        assert_eq!(split_trimmed("a, b ,c"), vec!["a", "b", "c"]);
        assert_eq!(split_trimmed(""), Vec::<String>::new());
    }
}
