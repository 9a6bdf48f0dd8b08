//! YoctoClaw daemon entry point.
//!
//! Loads the config, wires bus + contacts + provider + agent manager, and
//! runs until ctrl-c. Channel adapters are external: they clone the bus,
//! publish inbound envelopes, and drain the outbound queue.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use yoctoclaw::agent::AgentManager;
use yoctoclaw::bus::MessageBus;
use yoctoclaw::config::Config;
use yoctoclaw::contacts::ContactStore;
use yoctoclaw::logging::init_logging;
use yoctoclaw::providers::OpenAiProvider;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)?;
    init_logging(&config.logging)?;
    info!(config = %config_path.display(), "Starting YoctoClaw");

    let cancel = CancellationToken::new();
    let bus = Arc::new(MessageBus::new());
    let contacts = Arc::new(ContactStore::with_dir(Config::dir().join("contacts")).await?);
    let provider = Arc::new(OpenAiProvider::new(&config.provider));

    let manager = Arc::new(
        AgentManager::new(
            &config,
            Arc::clone(&bus),
            provider,
            Arc::clone(&contacts),
            &cancel,
        )
        .await?,
    );

    let runner = Arc::clone(&manager);
    let run_cancel = cancel.clone();
    let handle = tokio::spawn(async move { runner.run(run_cancel).await });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    cancel.cancel();
    bus.close();
    manager.shutdown().await;
    let _ = handle.await;

    info!("YoctoClaw stopped");
    Ok(())
}
