//! Redis backends for `cloudgate` (companion crate).
//!
//! - [`RedisCounterStore`] lets several gateway processes share one set of fixed-window counters.
//! - [`RedisJobQueue`] is a durable job queue that any number of gateway or worker processes can
//!   drain together.
//!
//! The counter store runs on any Redis with Lua scripting (2.6 and later). The queue sets several
//! hash fields per `HSET`, which needs Redis 4.0.
//!
//! ```rust,no_run
//! use cloudgate::queue::QueueOptions;
//! use cloudgate::{Gateway, GatewayConfig};
//! use cloudgate_redis::{RedisCounterStore, RedisJobQueue};
//! use std::sync::Arc;
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = GatewayConfig::default();
//! let url = "redis://127.0.0.1:6379";
//! let counters = RedisCounterStore::connect(url).await?;
//! let queue = RedisJobQueue::connect(
//!     url,
//!     config.queue.redelivery_policy()?,
//!     QueueOptions::from_config(&config.queue),
//! )
//! .await?;
//! let gateway = Gateway::builder(config)
//!     .counter_store(Arc::new(counters))
//!     .job_queue(Arc::new(queue))
//!     .build()?;
//! # gateway.shutdown().await;
//! # Ok(()) }
//! ```

mod counter;
mod queue;

pub use counter::{ttl_secs, RedisCounterStore};
pub use queue::{delay_table, RedisJobQueue, DEFAULT_PREFIX};
