use std::sync::Arc;

use anyhow::{Context, Result};
use beach_rendezvous::{
    cli::{self, Cli, Commands},
    config::ServerConfig,
    routes::{self, AppState},
    telemetry::{self, Telemetry},
    SignalingCoordinator,
};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Watch { url, name, count }) = cli.command {
        telemetry::init_tracing()?;
        return cli::run_watch_client(url, name, count).await;
    }

    let telemetry = Telemetry::init()?;
    let config = ServerConfig::try_from(cli.serve)?;
    info!(
        listen_addr = %config.listen_addr,
        static_dir = %config.http.static_dir.display(),
        strict_negotiation = config.coordinator.strict_negotiation,
        "starting beach-rendezvous"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;

    let (coordinator, coordinator_task) = SignalingCoordinator::new(config.coordinator).spawn();
    let state = Arc::new(AppState {
        coordinator,
        channel_depth: config.channel_depth,
        metrics: Some(metrics),
    });

    info!("beach-rendezvous listening on {}", config.listen_addr);
    routes::serve(listener, state, &config.http, shutdown_signal()).await?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    coordinator_task.abort();
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
