//! Per-instance operation locks.
//!
//! A lock is keyed by (project, instance) and tagged with the action it
//! covers. At most one non-reusable lock exists per key at any time. A
//! reusable lock of the same action is handed out again to concurrent
//! callers; waiting callers adopt the completion result of the lock they
//! waited on.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::debug;

use crate::error::{CaskError, Result};

/// Action covered by an operation lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Create,
    Start,
    Stop,
    Restart,
    Restore,
    Migrate,
    Update,
    Delete,
}

impl Action {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Restore => "restore",
            Self::Migrate => "migrate",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Actions that may inherit each other's live locks during lifecycle
/// transitions (restart contains start and stop; restore behaves like
/// start for lock purposes).
pub const LIFECYCLE_ACTIONS: &[Action] =
    &[Action::Start, Action::Stop, Action::Restart, Action::Restore, Action::Migrate];

/// Completion value broadcast to waiters: `None` while pending, then the
/// error message of the finished operation (or `None` on success).
type Completion = Option<Option<String>>;

/// A live operation lock for one instance.
pub struct InstanceOperation {
    project: String,
    instance: String,
    action: Action,
    reusable: bool,
    instance_initiated: AtomicBool,
    tx: watch::Sender<Completion>,
}

static LOCKS: Lazy<Mutex<HashMap<(String, String), Arc<InstanceOperation>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

impl InstanceOperation {
    /// The action this lock covers.
    pub fn action(&self) -> Action {
        self.action
    }

    /// Whether concurrent same-action callers share this lock.
    pub fn is_reusable(&self) -> bool {
        self.reusable
    }

    /// Whether any of the given actions matches this lock's action.
    pub fn action_match(&self, actions: &[Action]) -> bool {
        actions.contains(&self.action)
    }

    /// Mark the lock as created from inside the instance (e.g. a guest
    /// initiated shutdown).
    pub fn set_instance_initiated(&self, value: bool) {
        self.instance_initiated.store(value, Ordering::SeqCst);
    }

    /// Whether the lock was created from inside the instance.
    pub fn instance_initiated(&self) -> bool {
        self.instance_initiated.load(Ordering::SeqCst)
    }

    /// Whether the operation already completed.
    pub fn is_done(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Complete the operation, releasing the lock and waking all waiters.
    /// Subsequent calls are no-ops.
    pub fn done(&self, err: Option<&CaskError>) {
        {
            let mut locks = LOCKS.lock().unwrap();
            let key = (self.project.clone(), self.instance.clone());

            // Only remove the registry entry if it is still ours.
            if let Some(current) = locks.get(&key) {
                if std::ptr::eq(current.as_ref(), self) {
                    locks.remove(&key);
                }
            }
        }

        self.tx.send_if_modified(|value| {
            if value.is_some() {
                return false;
            }

            *value = Some(err.map(|e| e.to_string()));
            true
        });
    }

    /// Wait for the operation to complete.
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.tx.subscribe();

        loop {
            if let Some(result) = rx.borrow().clone() {
                return match result {
                    None => Ok(()),
                    Some(msg) => Err(CaskError::Internal(msg)),
                };
            }

            if rx.changed().await.is_err() {
                return Err(CaskError::Internal("Operation lock dropped".to_string()));
            }
        }
    }
}

impl std::fmt::Debug for InstanceOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceOperation")
            .field("project", &self.project)
            .field("instance", &self.instance)
            .field("action", &self.action)
            .field("reusable", &self.reusable)
            .finish()
    }
}

/// Get the live lock for an instance, if any.
pub fn get(project: &str, instance: &str) -> Option<Arc<InstanceOperation>> {
    LOCKS.lock().unwrap().get(&(project.to_string(), instance.to_string())).cloned()
}

/// Create a lock for an instance.
///
/// If a live reusable lock with the same action exists, that lock is
/// returned to the caller instead of a fresh one. Any other live lock makes
/// the instance busy.
pub fn create(
    project: &str,
    instance: &str,
    action: Action,
    reusable: bool,
    instance_initiated: bool,
) -> Result<Arc<InstanceOperation>> {
    if project.is_empty() || instance.is_empty() {
        return Err(CaskError::BadRequest("Invalid project or instance name".to_string()));
    }

    let mut locks = LOCKS.lock().unwrap();
    let key = (project.to_string(), instance.to_string());

    if let Some(existing) = locks.get(&key) {
        if existing.reusable && existing.action == action && !existing.is_done() {
            debug!(project, instance, action = %action, "Reusing operation lock");
            return Ok(existing.clone());
        }

        return Err(CaskError::OperationInProgress { action: existing.action.to_string() });
    }

    let (tx, _rx) = watch::channel(None);
    let op = Arc::new(InstanceOperation {
        project: project.to_string(),
        instance: instance.to_string(),
        action,
        reusable,
        instance_initiated: AtomicBool::new(instance_initiated),
        tx,
    });

    locks.insert(key, op.clone());
    debug!(project, instance, action = %action, reusable, "Created operation lock");

    Ok(op)
}

/// Create a lock, cooperating with any live lock on the instance.
///
/// A live lock with the *same* action is waited for: if it succeeds this
/// returns [`CaskError::NonReusableSucceeded`] (the caller's work has
/// effectively been done), otherwise a fresh lock is created. A live lock
/// whose action is in `alt_actions` is inherited and returned as-is, so
/// e.g. the stop half of a restart runs under the restart lock. Any other
/// live lock is waited out before creating.
pub async fn create_wait_get(
    project: &str,
    instance: &str,
    action: Action,
    alt_actions: &[Action],
    reusable: bool,
    instance_initiated: bool,
) -> Result<Arc<InstanceOperation>> {
    loop {
        let existing = get(project, instance);

        let Some(op) = existing else {
            match create(project, instance, action, reusable, instance_initiated) {
                Ok(op) => return Ok(op),
                // Lost the race with another creator; wait on theirs.
                Err(CaskError::OperationInProgress { .. }) => continue,
                Err(e) => return Err(e),
            }
        };

        if op.action() == action {
            debug!(project, instance, action = %action, "Waiting for matching operation lock");

            if op.wait().await.is_ok() {
                return Err(CaskError::NonReusableSucceeded);
            }

            // The prior operation failed; retry with a fresh lock.
            continue;
        }

        if op.action_match(alt_actions) {
            debug!(project, instance, inherited = %op.action(), "Inherited operation lock");
            return Ok(op);
        }

        debug!(project, instance, waiting_on = %op.action(), "Waiting for unrelated operation lock");
        let _ = op.wait().await;
    }
}
