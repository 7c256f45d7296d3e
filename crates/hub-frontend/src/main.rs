//! Front-end server for the engine hub.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use hub_frontend::{ws, Cli, EngineManagerClient};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Cli::parse().into_config()?;
    info!(
        addr = %config.listen_addr,
        shards = config.shards.len(),
        reconnect_secs = config.reconnect_secs,
        "starting hub-frontend"
    );

    let manager = Arc::new(EngineManagerClient::new(&config)?);
    manager.start();

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;

    let served = axum::serve(listener, ws::router(manager.clone()))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await;

    manager.stop();
    info!("hub-frontend stopped");
    served.map_err(Into::into)
}
