//! Query surface daemon: serves the read-only HTTP API over the store.

use ethexplorer::api;
use ethexplorer::logging::init_tracing;
use ethexplorer::store::Store;
use ethexplorer::Config;
use eyre::Result;
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();
    init_tracing(config.verbosity);

    let store = Store::connect(&config.database_url()).await?;
    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.api_listen_port)).await?;
    info!(addr = %listener.local_addr()?, "query surface listening");

    tokio::select! {
        result = api::serve(listener, store) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}
