//! Graceful shutdown handling for caskd.
//!
//! Stops every running instance with a grace timeout before the daemon
//! exits, falling back to a forced stop when the graceful path fails.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use cask_core::{Instance, State};

/// Manages graceful shutdown of the daemon.
pub struct ShutdownManager {
    state: Arc<State>,
    graceful_timeout: Duration,
}

impl ShutdownManager {
    /// Create a new shutdown manager.
    pub fn new(state: Arc<State>) -> Self {
        Self { state, graceful_timeout: Duration::from_secs(30) }
    }

    /// Stop all running instances and flush state.
    pub async fn shutdown(&self) {
        info!("Starting graceful shutdown...");

        let records = match self.state.db.list_node_instances(&self.state.server_name).await {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "Failed to list instances for shutdown");
                return;
            }
        };

        let mut stopped = 0usize;
        for record in records {
            let inst = match Instance::from_record(self.state.clone(), record).await {
                Ok(inst) => inst,
                Err(e) => {
                    error!(error = %e, "Failed to load instance for shutdown");
                    continue;
                }
            };

            if !inst.is_running() {
                continue;
            }

            info!(instance = %inst.name(), "Stopping instance...");

            let result = tokio::time::timeout(
                self.graceful_timeout,
                inst.shutdown(self.graceful_timeout),
            )
            .await;

            match result {
                Ok(Ok(())) => stopped += 1,
                Ok(Err(e)) => {
                    warn!(instance = %inst.name(), error = %e, "Graceful stop failed, forcing");
                    if let Err(e) = inst.stop(true).await {
                        error!(instance = %inst.name(), error = %e, "Forced stop failed");
                    } else {
                        stopped += 1;
                    }
                }
                Err(_) => {
                    warn!(instance = %inst.name(), "Graceful stop timed out, forcing");
                    if let Err(e) = inst.stop(true).await {
                        error!(instance = %inst.name(), error = %e, "Forced stop failed");
                    } else {
                        stopped += 1;
                    }
                }
            }
        }

        info!(stopped, "Graceful shutdown complete");
    }
}
