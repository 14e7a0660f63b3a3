//! Redelivery policy for failed job attempts.
//!
//! Semantics:
//! - `max_attempts` counts total attempts (initial delivery + redeliveries).
//! - After a failed attempt the queue asks [`RedeliveryPolicy::decide`] with the number of
//!   attempts made so far; the answer is either a delayed redelivery or dead-lettering.
//!
//! Invariants:
//! - A job is never delivered more than `max_attempts` times.
//! - Exhausted jobs are dead-lettered, never dropped and never retried again.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use cloudgate::{Backoff, RedeliveryPolicy};
//! use cloudgate::retry::RetryDecision;
//!
//! let policy = RedeliveryPolicy::builder()
//!     .max_attempts(3)
//!     .backoff(Backoff::exponential(Duration::from_secs(1)))
//!     .build()
//!     .unwrap();
//! assert_eq!(policy.decide(1), RetryDecision::Redeliver { delay: Duration::from_secs(1) });
//! assert_eq!(policy.decide(2), RetryDecision::Redeliver { delay: Duration::from_secs(2) });
//! assert_eq!(policy.decide(3), RetryDecision::DeadLetter);
//! ```

use crate::Backoff;
use std::time::Duration;

/// What the queue should do with a job whose attempt just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Make the job available again after `delay`.
    Redeliver { delay: Duration },
    /// Retry budget exhausted.
    DeadLetter,
}

/// Bounded retry with backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedeliveryPolicy {
    max_attempts: u32,
    backoff: Backoff,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, backoff: Backoff::exponential(Duration::from_secs(1)) }
    }
}

impl RedeliveryPolicy {
    /// Construct a new builder with defaults (3 attempts, exponential from 1s).
    pub fn builder() -> RedeliveryPolicyBuilder {
        RedeliveryPolicyBuilder::new()
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decide after `attempts_made` failed or stalled attempts.
    pub fn decide(&self, attempts_made: u32) -> RetryDecision {
        if attempts_made >= self.max_attempts {
            RetryDecision::DeadLetter
        } else {
            RetryDecision::Redeliver { delay: self.backoff.delay(attempts_made) }
        }
    }
}

/// Builder for `RedeliveryPolicy`.
#[derive(Debug, Clone)]
pub struct RedeliveryPolicyBuilder {
    max_attempts: u32,
    backoff: Backoff,
}

/// Errors produced while building a redelivery policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    /// `max_attempts` must be > 0.
    #[error("max_attempts must be > 0 (got {0})")]
    InvalidMaxAttempts(u32),
}

impl RedeliveryPolicyBuilder {
    pub fn new() -> Self {
        let RedeliveryPolicy { max_attempts, backoff } = RedeliveryPolicy::default();
        Self { max_attempts, backoff }
    }

    /// Set total attempts (initial + redeliveries). Must be > 0.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn build(self) -> Result<RedeliveryPolicy, BuildError> {
        if self.max_attempts == 0 {
            return Err(BuildError::InvalidMaxAttempts(0));
        }
        Ok(RedeliveryPolicy { max_attempts: self.max_attempts, backoff: self.backoff })
    }
}

impl Default for RedeliveryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}
