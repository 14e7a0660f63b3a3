use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Abstract storage interface for window counters.
///
/// Designed for both in-memory and shared backends. Several gateway processes may increment the
/// same key concurrently, so `increment` must be atomic in the backend itself.
#[async_trait]
pub trait CounterStore: Send + Sync + std::fmt::Debug {
    /// Atomically add one to `key` and return the new value.
    ///
    /// When the increment creates the key, the key expires after `ttl`. Later increments do not
    /// extend the expiry.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;

    /// Reachability check.
    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Debug)]
struct Counter {
    value: u64,
    expires_at_millis: u64,
}

/// Simple in-memory counter store with lazy expiry.
#[derive(Clone, Debug)]
pub struct InMemoryCounterStore {
    // Map key -> counter
    data: Arc<Mutex<HashMap<String, Counter>>>,
    clock: Arc<dyn Clock>,
    reachable: Arc<AtomicBool>,
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            data: Arc::new(Mutex::new(HashMap::new())),
            clock,
            reachable: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate an outage.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Number of live keys; expired keys are dropped first.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        match self.data.lock() {
            Ok(mut guard) => {
                guard.retain(|_, c| c.expires_at_millis > now);
                guard.len()
            }
            Err(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("counter store offline".into()))
        }
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        self.check()?;
        let now = self.clock.now_millis();
        let ttl_millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let mut guard =
            self.data.lock().map_err(|_| StoreError::Backend("counter map poisoned".into()))?;
        let counter = guard
            .entry(key.to_string())
            .and_modify(|c| {
                if c.expires_at_millis <= now {
                    *c = Counter { value: 0, expires_at_millis: now.saturating_add(ttl_millis) };
                }
            })
            .or_insert(Counter { value: 0, expires_at_millis: now.saturating_add(ttl_millis) });
        counter.value += 1;
        Ok(counter.value)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }
}
