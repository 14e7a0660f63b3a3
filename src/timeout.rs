//! Timeout policy implementation
//!
//! Bounds both the compute step inside a worker and the blocking wait inside the dispatcher.
//! Expiry drops the wrapped future; it never reaches into the job queue.

use std::future::Future;
use std::time::{Duration, Instant};

/// The wrapped future did not finish within the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation timed out after {elapsed:?} (limit: {limit:?})")]
pub struct Elapsed {
    pub elapsed: Duration,
    pub limit: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    duration: Duration,
}

/// Longest accepted timeout (1 day); larger values are clamped.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

impl TimeoutPolicy {
    /// Create a timeout policy. Zero is raised to 1ms and values above `MAX_TIMEOUT` are clamped.
    pub fn new(duration: Duration) -> Self {
        Self { duration: duration.clamp(Duration::from_millis(1), MAX_TIMEOUT) }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }

    /// Inspect the configured timeout duration.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub async fn execute<F>(&self, future: F) -> Result<F::Output, Elapsed>
    where
        F: Future,
    {
        let start = Instant::now();
        tokio::time::timeout(self.duration, future)
            .await
            .map_err(|_| Elapsed { elapsed: start.elapsed(), limit: self.duration })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn completes_before_timeout() {
        let timeout = TimeoutPolicy::from_millis(100);
        let result = timeout
            .execute(async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                42
            })
            .await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_long_operation() {
        let timeout = TimeoutPolicy::from_millis(50);
        let result = timeout.execute(tokio::time::sleep(Duration::from_millis(200))).await;
        let err = result.unwrap_err();
        assert_eq!(err.limit, Duration::from_millis(50));
    }

    #[test]
    fn zero_and_huge_durations_are_clamped() {
        assert_eq!(TimeoutPolicy::new(Duration::ZERO).duration(), Duration::from_millis(1));
        assert_eq!(TimeoutPolicy::new(Duration::MAX).duration(), MAX_TIMEOUT);
    }
}
