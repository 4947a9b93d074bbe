use std::sync::Arc;
use tracing::info;

use cask_core::storage::DriverRegistry;
use cask_core::{GlobalConfig, State, StateManager};

mod collaborators;
mod shutdown;
mod tasks;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_target(true)
        .init();

    info!("CASK daemon starting");

    let data_dir = cask_core::paths::data_dir();
    tokio::fs::create_dir_all(&data_dir).await?;

    let db_path = cask_core::paths::db_path(&data_dir);
    info!("Initializing state manager at {:?}", db_path);
    let db = Arc::new(StateManager::new(&db_path).await?);

    let server_name = hostname();

    let state = Arc::new(State {
        db,
        data_dir: data_dir.clone(),
        server_name,
        clustered: false,
        global: GlobalConfig::default(),
        architectures: vec![std::env::consts::ARCH.to_string()],
        drivers: DriverRegistry::with_builtin(),
        runtime: Arc::new(collaborators::NoRuntime),
        firewall: Arc::new(collaborators::LogOnlyFirewall),
        ovn: None,
        connector: Arc::new(collaborators::NoCluster),
        placement_policy: None,
        migration: Arc::new(collaborators::NoTransport),
        ovn_log_path: std::path::PathBuf::from("/var/log/ovn/ovn-controller.log"),
    });

    let pruner = tasks::spawn_backup_pruner(state.clone());

    info!("CASK daemon ready");

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    pruner.abort();

    let shutdown = shutdown::ShutdownManager::new(state);
    shutdown.shutdown().await;

    info!("CASK daemon shutting down");
    Ok(())
}

fn hostname() -> String {
    std::env::var("CASK_SERVER_NAME")
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname").ok().map(|h| h.trim().to_string())
        })
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "cask".to_string())
}
