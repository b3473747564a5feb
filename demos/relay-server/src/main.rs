//! Runs a Tether relay.
//!
//! - `TETHER_BIND`: listen address (default `0.0.0.0:3000`)
//! - `RUST_LOG`: log filter (default `info`)

use std::future::Future;

use tether::prelude::*;
use tracing_subscriber::EnvFilter;

const DEFAULT_BIND: &str = "0.0.0.0:3000";

/// Binds `addr` and serves until `shutdown` completes.
async fn serve(addr: &str, shutdown: impl Future<Output = ()>) -> Result<(), TetherError> {
    let server = TetherServer::builder().bind(addr).build().await?;
    let local = server.local_addr().map_err(TransportError::AcceptFailed)?;
    tracing::info!(addr = %local, "listening");
    server.run_until(shutdown).await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let bind = std::env::var("TETHER_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string());

    serve(&bind, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    })
    .await?;
    Ok(())
}
