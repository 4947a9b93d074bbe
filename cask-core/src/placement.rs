//! Instance placement.
//!
//! Selects a cluster member for a new instance from the candidate set,
//! optionally consulting a policy hook, and otherwise picking the
//! least-loaded member with a stable name tie-break.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::{CaskError, Result};
use crate::types::Member;

/// How long a placement policy may run before it is abandoned.
pub const POLICY_TIMEOUT: Duration = Duration::from_secs(5);

/// The request facts handed to a placement policy.
#[derive(Debug, Clone, Default)]
pub struct PlacementRequest {
    pub project: String,
    pub name: String,
    /// Expanded (profiles applied) config of the instance being placed.
    pub config: std::collections::HashMap<String, String>,
    /// Why placement is running (new instance, evacuation, relocation).
    pub reason: String,
}

/// Policy hook choosing a member from the candidate set. Must be
/// deterministic for reproducibility; returning `None` defers to the
/// built-in least-loaded rule.
#[async_trait]
pub trait PlacementPolicy: Send + Sync {
    async fn place(
        &self,
        request: &PlacementRequest,
        candidates: &[Member],
        leader_address: &str,
    ) -> Result<Option<String>>;
}

/// Filter the full member list down to placement candidates.
///
/// Order of filters: liveness (offline threshold), evacuation, architecture
/// intersection, allowed cluster groups, then the explicit target group.
pub fn candidate_members(
    members: &[Member],
    architectures: &[String],
    target_group: Option<&str>,
    allowed_groups: &[String],
    offline_threshold: i64,
    now: i64,
) -> Vec<Member> {
    members
        .iter()
        .filter(|m| !m.is_offline(offline_threshold, now))
        .filter(|m| !m.evacuated)
        .filter(|m| m.supports_architectures(architectures))
        .filter(|m| {
            allowed_groups.is_empty() || m.groups.iter().any(|g| allowed_groups.contains(g))
        })
        .filter(|m| match target_group {
            Some(group) => m.groups.iter().any(|g| g == group),
            None => true,
        })
        .cloned()
        .collect()
}

/// Pick the candidate with the fewest instances; ties break on member name
/// so placement is deterministic.
pub fn least_loaded(candidates: &[Member]) -> Option<&Member> {
    candidates.iter().min_by(|a, b| {
        a.instance_count.cmp(&b.instance_count).then_with(|| a.name.cmp(&b.name))
    })
}

/// Choose exactly one member for the instance.
///
/// A named target restricts the candidate set to that member. The policy
/// hook (if any) runs next and may pick any candidate or defer. The
/// fallback is least-loaded with name tie-break.
pub async fn place(
    request: &PlacementRequest,
    mut candidates: Vec<Member>,
    target_member: Option<&str>,
    policy: Option<Arc<dyn PlacementPolicy>>,
    leader_address: &str,
) -> Result<Member> {
    if let Some(target) = target_member {
        candidates.retain(|m| m.name == target);
    }

    if candidates.is_empty() {
        return Err(CaskError::Internal(
            "Couldn't find a cluster member for the instance".to_string(),
        ));
    }

    if let Some(policy) = policy {
        let chosen = tokio::time::timeout(
            POLICY_TIMEOUT,
            policy.place(request, &candidates, leader_address),
        )
        .await
        .map_err(|_| CaskError::Internal("Placement policy timed out".to_string()))?
        .map_err(|e| CaskError::Internal(format!("Failed instance placement policy: {}", e)))?;

        if let Some(name) = chosen {
            let member = candidates.iter().find(|m| m.name == name).ok_or_else(|| {
                CaskError::Internal(format!(
                    "Placement policy chose {:?} which is not a candidate",
                    name
                ))
            })?;

            debug!(member = %member.name, "Placement policy selected member");
            return Ok(member.clone());
        }
    }

    let member = least_loaded(&candidates)
        .ok_or_else(|| {
            CaskError::Internal("Couldn't find a cluster member for the instance".to_string())
        })?
        .clone();

    debug!(member = %member.name, instances = member.instance_count, "Placed on least-loaded member");
    Ok(member)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str, count: i64) -> Member {
        Member {
            id: 0,
            name: name.to_string(),
            address: format!("{}:8443", name),
            architectures: vec!["x86_64".to_string()],
            groups: vec!["default".to_string()],
            heartbeat: crate::types::unix_now(),
            evacuated: false,
            instance_count: count,
        }
    }

    #[test]
    fn test_candidates_filter_offline_and_evacuated() {
        let mut offline = member("node2", 0);
        offline.heartbeat = 0;

        let mut evacuated = member("node3", 0);
        evacuated.evacuated = true;

        let members = vec![member("node1", 0), offline, evacuated];
        let now = crate::types::unix_now();

        let candidates = candidate_members(&members, &[], None, &[], 20, now);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].name, "node1");
    }

    #[test]
    fn test_candidates_filter_architecture_and_groups() {
        let mut arm = member("node2", 0);
        arm.architectures = vec!["aarch64".to_string()];

        let mut grouped = member("node3", 0);
        grouped.groups = vec!["gpu".to_string()];

        let members = vec![member("node1", 0), arm, grouped];
        let now = crate::types::unix_now();

        let candidates =
            candidate_members(&members, &["x86_64".to_string()], None, &[], 20, now);
        assert_eq!(candidates.len(), 2);

        let candidates = candidate_members(&members, &[], Some("gpu"), &[], 20, now);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].name, "node3");

        let candidates =
            candidate_members(&members, &[], None, &["gpu".to_string()], 20, now);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].name, "node3");
    }

    #[tokio::test]
    async fn test_least_loaded_with_name_tiebreak() {
        let candidates = vec![member("node-b", 2), member("node-a", 2), member("node-c", 5)];

        let chosen = place(&PlacementRequest::default(), candidates.clone(), None, None, "")
            .await
            .unwrap();
        assert_eq!(chosen.name, "node-a");

        // Deterministic across repeated runs.
        for _ in 0..10 {
            let again =
                place(&PlacementRequest::default(), candidates.clone(), None, None, "")
                    .await
                    .unwrap();
            assert_eq!(again.name, chosen.name);
        }
    }

    #[tokio::test]
    async fn test_target_restricts_candidates() {
        let candidates = vec![member("node1", 0), member("node2", 9)];

        let chosen =
            place(&PlacementRequest::default(), candidates, Some("node2"), None, "")
                .await
                .unwrap();
        assert_eq!(chosen.name, "node2");
    }

    #[tokio::test]
    async fn test_no_candidate_is_an_error() {
        let err = place(&PlacementRequest::default(), Vec::new(), None, None, "")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Couldn't find a cluster member"));
    }

    struct PickNamed(Option<String>);

    #[async_trait]
    impl PlacementPolicy for PickNamed {
        async fn place(
            &self,
            _request: &PlacementRequest,
            _candidates: &[Member],
            _leader_address: &str,
        ) -> Result<Option<String>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_policy_picks_and_defers() {
        let candidates = vec![member("node1", 0), member("node2", 9)];

        let chosen = place(
            &PlacementRequest::default(),
            candidates.clone(),
            None,
            Some(Arc::new(PickNamed(Some("node2".to_string())))),
            "",
        )
        .await
        .unwrap();
        assert_eq!(chosen.name, "node2");

        let chosen = place(
            &PlacementRequest::default(),
            candidates.clone(),
            None,
            Some(Arc::new(PickNamed(None))),
            "",
        )
        .await
        .unwrap();
        assert_eq!(chosen.name, "node1");

        let err = place(
            &PlacementRequest::default(),
            candidates,
            None,
            Some(Arc::new(PickNamed(Some("ghost".to_string())))),
            "",
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("not a candidate"));
    }
}
