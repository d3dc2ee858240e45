//! Ingestion daemon: runs the plan→fetch→commit loop until a fatal error.

use ethexplorer::fetcher::BlockFetcher;
use ethexplorer::logging::init_tracing;
use ethexplorer::rpc::HttpRpc;
use ethexplorer::store::Store;
use ethexplorer::Config;
use eyre::Result;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();
    init_tracing(config.verbosity);
    config.validate()?;

    info!(
        rpc_node = %config.rpc_node,
        header_batch = config.header_batch_size,
        tx_batch = config.tx_batch_size,
        log_batch = config.log_batch_size,
        "starting block fetcher"
    );

    let store = Store::connect(&config.database_url()).await?;
    let client = Arc::new(HttpRpc::connect(&config.rpc_node, config.rpc_timeout())?);
    let fetcher = BlockFetcher::new(client, store, &config)?;

    tokio::select! {
        result = fetcher.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}
