use crate::clock::{Clock, SystemClock};
use crate::config::RateLimitConfig;
use crate::dynamic::DynamicConfig;
use crate::rate_limit::store::CounterStore;
use crate::rate_limit::{Decision, RateLimiter};
use crate::telemetry::{GatewayEvent, RateLimitEvent, Telemetry};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// A fixed-window rate limiter.
///
/// Each principal gets `limit` requests per window of `window_secs`, where windows are aligned to
/// the unix epoch. There is no carry-over between windows, so up to twice the limit can pass
/// around a boundary.
///
/// If the counter store fails the request is allowed ([`Decision::Unmetered`]) and a degraded
/// event is emitted.
#[derive(Debug, Clone)]
pub struct FixedWindow {
    store: Arc<dyn CounterStore>,
    config: DynamicConfig<RateLimitConfig>,
    clock: Arc<dyn Clock>,
    telemetry: Telemetry,
}

impl FixedWindow {
    pub fn new(store: Arc<dyn CounterStore>, config: DynamicConfig<RateLimitConfig>) -> Self {
        Self { store, config, clock: Arc::new(SystemClock), telemetry: Telemetry::default() }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Live configuration handle; updates apply to the next request.
    pub fn config(&self) -> &DynamicConfig<RateLimitConfig> {
        &self.config
    }

    /// Storage key of the window `now_secs` falls in.
    pub fn window_key(principal_id: &str, now_secs: u64, window_secs: u64) -> String {
        format!("rate:{}:{}", principal_id, now_secs / window_secs.max(1))
    }
}

#[async_trait]
impl RateLimiter for FixedWindow {
    async fn admit(&self, principal_id: &str) -> Decision {
        let config = *self.config.get();
        let window_secs = config.window_secs.max(1);
        let key = Self::window_key(principal_id, self.clock.now_secs(), window_secs);
        let ttl = Duration::from_secs(window_secs.saturating_mul(2));

        let count = match self.store.increment(&key, ttl).await {
            Ok(count) => count,
            Err(err) => {
                tracing::warn!(principal = %principal_id, error = %err, "rate limit store unavailable; allowing request");
                self.telemetry
                    .emit(GatewayEvent::RateLimit(RateLimitEvent::Degraded {
                        principal: principal_id.to_string(),
                    }))
                    .await;
                return Decision::Unmetered { limit: config.limit };
            }
        };

        let decision = if count > u64::from(config.limit) {
            Decision::Rejected { limit: config.limit, retry_after: Duration::from_secs(window_secs) }
        } else {
            let remaining = u64::from(config.limit).saturating_sub(count);
            Decision::Allowed { limit: config.limit, remaining: remaining as u32 }
        };

        let event = match decision {
            Decision::Rejected { retry_after, .. } => {
                RateLimitEvent::Rejected { principal: principal_id.to_string(), retry_after }
            }
            Decision::Allowed { remaining, .. } => {
                RateLimitEvent::Allowed { principal: principal_id.to_string(), remaining }
            }
            Decision::Unmetered { .. } => {
                RateLimitEvent::Degraded { principal: principal_id.to_string() }
            }
        };
        self.telemetry.emit(GatewayEvent::RateLimit(event)).await;
        decision
    }
}
