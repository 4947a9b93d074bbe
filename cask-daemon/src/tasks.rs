//! Periodic background tasks.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use cask_core::operations::{Operation, OperationType};
use cask_core::State;

const BACKUP_PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

/// Spawn the expired-backup pruner: one run at startup, then hourly with
/// the first scheduled tick skipped.
pub fn spawn_backup_pruner(state: Arc<State>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        prune_once(&state).await;

        // First scheduled tick is skipped.
        tokio::time::sleep(BACKUP_PRUNE_INTERVAL).await;

        loop {
            tokio::time::sleep(BACKUP_PRUNE_INTERVAL).await;
            prune_once(&state).await;
        }
    })
}

async fn prune_once(state: &Arc<State>) {
    info!("Pruning expired backups");

    let op = Operation::new("", OperationType::BackupsExpire);

    let result = cask_core::backup::prune_expired_backups(state).await;
    op.complete(&result);

    match result {
        Ok(()) => info!("Done pruning expired backups"),
        Err(e) => error!(error = %e, "Failed pruning expired backups"),
    }
}
