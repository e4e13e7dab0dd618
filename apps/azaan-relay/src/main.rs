use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;

use azaan_relay::{
    config::{Cli, RelayConfig},
    serve,
    telemetry::Telemetry,
    RelayState,
};

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = RelayConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        max_message_bytes = config.max_message_bytes,
        outbound_buffer = config.outbound_buffer,
        "starting azaan relay"
    );

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!("azaan relay listening on {}", config.listen_addr);

    let shutdown_grace = config.shutdown_grace;
    let state = RelayState::new(config).with_metrics(telemetry.metrics_handle());
    serve(listener, state, shutdown_signal()).await?;

    info!(
        grace_seconds = shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
