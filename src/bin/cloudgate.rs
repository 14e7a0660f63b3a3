//! Single-process gateway with in-process stores.

use cloudgate::{http, Gateway, GatewayConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = GatewayConfig::from_env()?;
    if config.redis_url.is_some() {
        tracing::warn!("redis_url is ignored here; run cloudgate-redis for a shared counter store");
    }
    let listen_addr = config.server.listen_addr.clone();
    let gateway = Gateway::in_memory(config)?;
    http::serve(gateway, &listen_addr).await?;
    Ok(())
}
