//! Runtime seam.
//!
//! The hypervisor / container runtime is an external collaborator; the
//! lifecycle only needs this surface.

use async_trait::async_trait;
use std::time::Duration;

use crate::device::RunConfig;
use crate::error::Result;

/// Process-level operations on an instance.
#[async_trait]
pub trait InstanceRuntime: Send + Sync {
    /// Boot the instance with the devices assembled by the lifecycle.
    async fn start(&self, project: &str, name: &str, run: &RunConfig) -> Result<()>;

    /// Halt the instance. `force` skips the graceful path.
    async fn stop(&self, project: &str, name: &str, force: bool) -> Result<()>;

    /// Send the graceful shutdown signal and wait up to `timeout`.
    async fn shutdown(&self, project: &str, name: &str, timeout: Duration) -> Result<()>;

    /// Whether the instance process is running.
    fn is_running(&self, project: &str, name: &str) -> bool;

    /// Whether the instance process is frozen.
    fn is_frozen(&self, project: &str, name: &str) -> bool;
}
