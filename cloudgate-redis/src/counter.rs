use async_trait::async_trait;
use cloudgate::error::StoreError;
use cloudgate::rate_limit::CounterStore;
use redis::aio::ConnectionManager;
use redis::{RedisError, Script};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Increments and, when the key is new or has lost its expiry, sets the expiry, all in one step.
const INCREMENT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 or redis.call('TTL', KEYS[1]) == -1 then
  redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

/// Fixed-window counters shared through Redis.
///
/// The expiry is set only when a key is created, so concurrent processes never extend a window
/// and never lose counts.
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
    increment: Arc<Script>,
}

impl fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounterStore").finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`). The manager reconnects on its own after
    /// transient failures.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(to_store_error)?;
        let conn = ConnectionManager::new(client).await.map_err(to_store_error)?;
        Ok(Self { conn, increment: Arc::new(Script::new(INCREMENT)) })
    }
}

/// Redis `EXPIRE` takes whole seconds; round up so a key never outlives less than `ttl`.
pub fn ttl_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}

fn to_store_error(err: RedisError) -> StoreError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout()
    {
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::Backend(err.to_string())
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let count: u64 = self
            .increment
            .key(key)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(to_store_error)?;
        Ok(count)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let reply: String = redis::cmd("PING").query_async(&mut conn).await.map_err(to_store_error)?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Backend(format!("unexpected PING reply: {}", reply)))
        }
    }
}
