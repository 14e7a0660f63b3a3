//! Gateway whose counters and job queue live in Redis, so several instances share both.

use cloudgate::queue::QueueOptions;
use cloudgate::{http, Gateway, GatewayConfig};
use cloudgate_redis::{RedisCounterStore, RedisJobQueue};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = GatewayConfig::from_env()?;
    let url = config.redis_url.clone().unwrap_or_else(|| "redis://127.0.0.1:6379".to_string());
    let counters = RedisCounterStore::connect(&url).await?;
    let queue = RedisJobQueue::connect(
        &url,
        config.queue.redelivery_policy()?,
        QueueOptions::from_config(&config.queue),
    )
    .await?;
    tracing::info!("redis counter store and job queue connected");

    let listen_addr = config.server.listen_addr.clone();
    let gateway = Gateway::builder(config)
        .counter_store(Arc::new(counters))
        .job_queue(Arc::new(queue))
        .build()?;
    http::serve(gateway, &listen_addr).await?;
    Ok(())
}
