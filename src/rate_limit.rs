//! Rate limiting primitives.
//!
//! This module provides the building blocks for per-principal throttling:
//! - [`RateLimiter`]: The core trait for rate limiting logic.
//! - [`RateLimitLayer`]: Tower middleware that enforces the limit on admitted envelopes.
//! - [`Decision`]: The result of a rate limit check.
//!
//! # Architecture
//!
//! - **Middleware**: `RateLimitLayer` wraps the dispatcher. It doesn't know *how* limiting works,
//!   only that it should ask a `RateLimiter` about the envelope's principal.
//! - **Logic**: [`FixedWindow`] (in the `strategies` module) does the window math.
//! - **Storage**: [`CounterStore`] (in the `store` module) holds the counters, enabling
//!   in-memory or shared backends (e.g., Redis) so several processes count against one window.

use std::time::Duration;

pub mod middleware;
pub mod store;
pub mod strategies;
pub use middleware::{RateLimitLayer, RateLimitService};
pub use store::{CounterStore, InMemoryCounterStore};
pub use strategies::FixedWindow;

/// The decision returned by a rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request is within the window's budget.
    Allowed {
        limit: u32,
        /// Requests left in this window. Useful for `X-RateLimit-Remaining` headers.
        remaining: u32,
    },
    /// The window is used up.
    Rejected {
        limit: u32,
        /// How long the caller should wait before retrying. Useful for `Retry-After` headers.
        retry_after: Duration,
    },
    /// The counter store was unreachable; the request is let through without being counted.
    Unmetered { limit: u32 },
}

impl Decision {
    /// Helper to check if the request may proceed.
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Decision::Rejected { .. })
    }

    pub fn limit(&self) -> u32 {
        match self {
            Decision::Allowed { limit, .. }
            | Decision::Rejected { limit, .. }
            | Decision::Unmetered { limit } => *limit,
        }
    }
}

/// Core interface for rate limiting logic.
///
/// Decouples the middleware from the algorithm and from the storage. Implementations decide
/// their own failure policy; a limiter returns a [`Decision`] even when its store is down.
#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync + std::fmt::Debug {
    /// Count one request for `principal_id` and decide whether it may proceed.
    async fn admit(&self, principal_id: &str) -> Decision;
}
