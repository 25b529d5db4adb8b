use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use shardgate::telemetry::init_tracing;
use shardgate::{Cli, GatewayServer, ShardRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format).context("failed to install tracing subscriber")?;
    let config = cli.into_config().context("invalid gateway configuration")?;

    let server = GatewayServer::bind(config, Arc::new(ShardRegistry::new())).await?;
    let handle = server.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
            handle.shutdown();
        }
    });

    server.run().await;
    Ok(())
}
