//! Cluster fan-out.
//!
//! The [`Notifier`] broadcasts a caller-provided closure to cluster peers
//! concurrently and aggregates the failures. Actual wire clients are behind
//! the [`MemberClient`] seam; the HTTP/TLS transport lives outside this
//! crate.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::{CaskError, Result};
use crate::types::Member;

/// A handle to an operation running on another member.
#[derive(Debug, Clone)]
pub struct ForwardedOperation {
    pub id: String,
    pub member: String,
}

/// RPC surface this crate needs from a cluster peer.
#[async_trait]
pub trait MemberClient: Send + Sync {
    /// Forward an instance create request, returning the remote operation.
    async fn create_instance(
        &self,
        project: &str,
        target: &str,
        req: &crate::instance::create::CreateInstanceRequest,
    ) -> Result<ForwardedOperation>;

    /// Replay an ACL update so the peer applies local firewall state.
    async fn update_network_acl(
        &self,
        project: &str,
        name: &str,
        put: &crate::acl::AclPut,
    ) -> Result<()>;

    /// Fetch the peer's ACL log entries.
    async fn get_acl_log(&self, project: &str, name: &str) -> Result<String>;
}

/// Builds wire clients for members.
pub trait ClientConnector: Send + Sync {
    fn connect(&self, member: &Member) -> Result<Arc<dyn MemberClient>>;
}

/// Which members a notification reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyMode {
    /// Every other member; an offline member fails the broadcast.
    All,
    /// Every other member that is alive.
    Alive,
    /// Alias of [`NotifyMode::Alive`] for call sites that handle local
    /// state themselves before broadcasting.
    AliveExceptSelf,
}

/// Concurrent broadcast to cluster peers.
pub struct Notifier {
    peers: Vec<Member>,
    connector: Arc<dyn ClientConnector>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier").field("peers", &self.peers).finish()
    }
}

impl Notifier {
    /// Select the peer set per `mode`. `members` is the full member list;
    /// the local member (by name) is always excluded.
    pub fn new(
        members: Vec<Member>,
        server_name: &str,
        connector: Arc<dyn ClientConnector>,
        mode: NotifyMode,
        offline_threshold: i64,
    ) -> Result<Self> {
        let now = crate::types::unix_now();
        let mut peers = Vec::new();

        for member in members {
            if member.name == server_name {
                continue;
            }

            let offline = member.is_offline(offline_threshold, now);
            match mode {
                NotifyMode::All => {
                    if offline {
                        return Err(CaskError::Unavailable(format!(
                            "Cluster member {:?} is offline",
                            member.name
                        )));
                    }

                    peers.push(member);
                }
                NotifyMode::Alive | NotifyMode::AliveExceptSelf => {
                    if offline {
                        debug!(member = %member.name, "Skipping offline member for notification");
                        continue;
                    }

                    peers.push(member);
                }
            }
        }

        Ok(Self { peers, connector })
    }

    /// Number of peers the broadcast will reach.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Run `f` once per peer concurrently, waiting for all of them.
    /// Individual failures are aggregated into one error.
    pub async fn notify<F>(&self, f: F) -> Result<()>
    where
        F: Fn(Arc<dyn MemberClient>, Member) -> BoxFuture<'static, Result<()>>,
    {
        let mut tasks = JoinSet::new();

        for member in &self.peers {
            let client = self.connector.connect(member)?;
            let fut = f(client, member.clone());
            let name = member.name.clone();

            tasks.spawn(async move { (name, fut.await) });
        }

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((name, Err(e))) => {
                    warn!(member = %name, error = %e, "Cluster notification failed");
                    failures.push(format!("{}: {}", name, e));
                }
                Err(e) => failures.push(format!("join: {}", e)),
            }
        }

        if !failures.is_empty() {
            return Err(CaskError::Internal(format!(
                "Cluster notification failed on {} member(s): {}",
                failures.len(),
                failures.join("; ")
            )));
        }

        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn test_notify_reaches_all_peers() {
        let now = crate::types::unix_now();
        let members =
            vec![member("node1", now), member("node2", now), member("node3", now)];

        let connector = Arc::new(RecordingConnector::default());
        let calls = connector.calls.clone();

        let notifier =
            Notifier::new(members, "node1", connector, NotifyMode::Alive, 20).unwrap();
        assert_eq!(notifier.peer_count(), 2);

        notifier
            .notify(|client, _member| {
                Box::pin(async move { client.get_acl_log("default", "web").await.map(|_| ()) })
            })
            .await
            .unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().any(|c| c.starts_with("node2:")));
        assert!(calls.iter().any(|c| c.starts_with("node3:")));
    }

    #[tokio::test]
    async fn test_all_mode_rejects_offline_member() {
        let now = crate::types::unix_now();
        let members = vec![member("node1", now), member("node2", 0)];

        let err = Notifier::new(
            members,
            "node1",
            Arc::new(RecordingConnector::default()),
            NotifyMode::All,
            20,
        )
        .unwrap_err();
        assert!(matches!(err, CaskError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_alive_mode_skips_offline_member() {
        let now = crate::types::unix_now();
        let members = vec![member("node1", now), member("node2", 0), member("node3", now)];

        let notifier = Notifier::new(
            members,
            "node1",
            Arc::new(RecordingConnector::default()),
            NotifyMode::Alive,
            20,
        )
        .unwrap();
        assert_eq!(notifier.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_failures_aggregate() {
        let now = crate::types::unix_now();
        let members = vec![member("node1", now), member("node2", now), member("node3", now)];

        let connector = Arc::new(RecordingConnector {
            fail_members: vec!["node2".to_string(), "node3".to_string()],
            ..Default::default()
        });

        let notifier =
            Notifier::new(members, "node1", connector, NotifyMode::Alive, 20).unwrap();

        let err = notifier
            .notify(|client, _member| {
                Box::pin(async move { client.get_acl_log("default", "web").await.map(|_| ()) })
            })
            .await
            .unwrap_err();

        assert!(err.to_string().contains("2 member(s)"));
    }
}
