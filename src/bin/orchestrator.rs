//! # Script Orchestrator Server
//!
//! Boots the orchestrator from `config/` (see [`ConfigManager`]) and runs the
//! dispatch workers and completion listener until Ctrl-C.

use anyhow::Context;
use script_orchestrator::config::ConfigManager;
use script_orchestrator::logging::init_structured_logging;
use script_orchestrator::orchestration::OrchestratorSystem;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_structured_logging();

    let manager = ConfigManager::load().context("failed to load orchestrator configuration")?;
    let system = OrchestratorSystem::bootstrap(manager)
        .await
        .context("failed to bootstrap orchestrator")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("🛑 Received Ctrl-C, shutting down");

    system.shutdown().await;
    Ok(())
}
