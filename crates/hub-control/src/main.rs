//! Control server for the engine hub.

use hub_control::config::Config;
use hub_control::server;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::from_env()?;

    tracing::info!(
        addr = %config.socket_addr_string(),
        shards = config.shard_count,
        reconnect_secs = config.reconnect_delay.as_secs(),
        "starting hub-control"
    );

    server::run(config).await
}
