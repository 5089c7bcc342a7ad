//! Minimal service harness: loads configuration, wires the relay core,
//! starts its loops and waits for Ctrl-C to drain and exit. The REST and
//! CLI surfaces that submit/manage messages live outside this crate; this
//! binary only runs the engine.

use relaycore::config::RelayConfig;
use std::env;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_file = env::var("RELAYCORE_CONFIG_FILE").ok();
    let config = RelayConfig::load(config_file.as_deref())?;

    let coordinator = relaycore::build(config).await?;
    coordinator.start().await;

    tracing::info!("relaycored running, awaiting ctrl-c");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, draining");

    coordinator.shutdown().await;
    Ok(())
}
