//! Long-running operations.
//!
//! An operation is a first-class, observable, cancellable task: it carries
//! metadata (progress strings, websocket secrets), a cooperative
//! cancellation signal and a completion result that any number of waiters
//! can adopt.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::{CaskError, Result};

/// What kind of work an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    InstanceCreate,
    InstanceStart,
    InstanceStop,
    InstanceRestart,
    InstanceRestore,
    InstanceDelete,
    InstanceMigrate,
    SnapshotCreate,
    BackupCreate,
    BackupRestore,
    BackupsExpire,
}

impl OperationType {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InstanceCreate => "instance_create",
            Self::InstanceStart => "instance_start",
            Self::InstanceStop => "instance_stop",
            Self::InstanceRestart => "instance_restart",
            Self::InstanceRestore => "instance_restore",
            Self::InstanceDelete => "instance_delete",
            Self::InstanceMigrate => "instance_migrate",
            Self::SnapshotCreate => "snapshot_create",
            Self::BackupCreate => "backup_create",
            Self::BackupRestore => "backup_restore",
            Self::BackupsExpire => "backups_expire",
        }
    }
}

/// Completion state of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    Running,
    Success,
    Failure(String),
    Cancelled,
}

/// A long-running operation handle.
pub struct Operation {
    id: Uuid,
    op_type: OperationType,
    project: String,
    metadata: Mutex<HashMap<String, serde_json::Value>>,
    status_tx: watch::Sender<OperationStatus>,
    cancel_tx: watch::Sender<bool>,
}

impl Operation {
    /// Create a new running operation.
    pub fn new(project: impl Into<String>, op_type: OperationType) -> Arc<Self> {
        let (status_tx, _) = watch::channel(OperationStatus::Running);
        let (cancel_tx, _) = watch::channel(false);

        Arc::new(Self {
            id: Uuid::new_v4(),
            op_type,
            project: project.into(),
            metadata: Mutex::new(HashMap::new()),
            status_tx,
            cancel_tx,
        })
    }

    /// Operation id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Operation type.
    pub fn op_type(&self) -> OperationType {
        self.op_type
    }

    /// Owning project.
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Snapshot of the current metadata map.
    pub fn metadata(&self) -> HashMap<String, serde_json::Value> {
        self.metadata.lock().unwrap().clone()
    }

    /// Merge a key/value into the metadata map.
    pub fn update_metadata(&self, key: impl Into<String>, value: serde_json::Value) {
        self.metadata.lock().unwrap().insert(key.into(), value);
    }

    /// Request cooperative cancellation. Workers poll
    /// [`Operation::is_cancelled`] between major steps.
    pub fn cancel(&self) {
        debug!(operation = %self.id, "Operation cancellation requested");
        let _ = self.cancel_tx.send(true);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Return an error if cancellation was requested; used as a poll point
    /// between major steps of a worker.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(CaskError::Internal("Operation cancelled".to_string()));
        }

        Ok(())
    }

    /// Record the final result. Later calls are ignored.
    pub fn complete(&self, result: &Result<()>) {
        let status = match result {
            Ok(()) if self.is_cancelled() => OperationStatus::Cancelled,
            Ok(()) => OperationStatus::Success,
            Err(e) => OperationStatus::Failure(e.to_string()),
        };

        self.status_tx.send_if_modified(|current| {
            if *current != OperationStatus::Running {
                return false;
            }

            if let OperationStatus::Failure(msg) = &status {
                error!(operation = %self.id, op_type = self.op_type.as_str(), error = %msg, "Operation failed");
            }

            *current = status.clone();
            true
        });
    }

    /// Current status.
    pub fn status(&self) -> OperationStatus {
        self.status_tx.borrow().clone()
    }

    /// Wait for the operation to finish; adopts its result.
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.status_tx.subscribe();

        loop {
            let status = rx.borrow().clone();
            match status {
                OperationStatus::Running => {}
                OperationStatus::Success => return Ok(()),
                OperationStatus::Cancelled => {
                    return Err(CaskError::Internal("Operation cancelled".to_string()))
                }
                OperationStatus::Failure(msg) => return Err(CaskError::Internal(msg)),
            }

            if rx.changed().await.is_err() {
                return Err(CaskError::Internal("Operation handle dropped".to_string()));
            }
        }
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("op_type", &self.op_type.as_str())
            .field("project", &self.project)
            .field("status", &self.status())
            .finish()
    }
}

/// Spawn the operation body as a background task. The operation records the
/// body's result; the returned handle can be awaited or dropped.
pub fn spawn<F>(op: Arc<Operation>, body: F) -> tokio::task::JoinHandle<()>
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let result = body.await;
        op.complete(&result);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_operation_success() {
        let op = Operation::new("default", OperationType::InstanceCreate);
        let handle = spawn(op.clone(), async { Ok(()) });

        op.wait().await.unwrap();
        assert_eq!(op.status(), OperationStatus::Success);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_operation_failure_message() {
        let op = Operation::new("default", OperationType::BackupCreate);
        op.complete(&Err(CaskError::Internal("disk full".to_string())));

        let err = op.wait().await.unwrap_err();
        assert!(err.to_string().contains("disk full"));

        // First result wins.
        op.complete(&Ok(()));
        assert!(matches!(op.status(), OperationStatus::Failure(_)));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let op = Operation::new("default", OperationType::InstanceMigrate);
        assert!(op.check_cancelled().is_ok());

        op.cancel();
        assert!(op.is_cancelled());
        assert!(op.check_cancelled().is_err());

        op.complete(&Ok(()));
        assert_eq!(op.status(), OperationStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_metadata_updates() {
        let op = Operation::new("default", OperationType::BackupCreate);
        op.update_metadata("create_backup_progress", serde_json::json!("1.2MB (600kB/s)"));

        let meta = op.metadata();
        assert_eq!(meta.get("create_backup_progress").unwrap(), "1.2MB (600kB/s)");
    }
}
