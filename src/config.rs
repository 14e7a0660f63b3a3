//! Process configuration.
//!
//! Every field has a default, so an empty environment yields a working single-process setup.
//! Overrides come from `CLOUDGATE__<SECTION>__<FIELD>` environment variables, e.g.
//! `CLOUDGATE__RATE_LIMIT__LIMIT=500` or `CLOUDGATE__WORKERS__CONCURRENCY=8`.

use crate::backoff::{Backoff, BackoffError};
use crate::retry::{BuildError, RedeliveryPolicy};
use crate::timeout::TimeoutPolicy;
use serde::Deserialize;
use std::time::Duration;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error(transparent)]
    Backoff(#[from] BackoffError),
    #[error(transparent)]
    Redelivery(#[from] BuildError),
}

/// How much failure detail reaches callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorDetail {
    /// Generic messages for internal and dependency failures.
    #[default]
    Hardened,
    /// Underlying error text included, for debugging.
    Verbose,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub error_detail: ErrorDetail,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { listen_addr: "0.0.0.0:4000".into(), error_detail: ErrorDetail::Hardened }
    }
}

/// Fixed-window rate limit parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_secs: u64,
    pub limit: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { window_secs: 60, limit: 100 }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub completed_retention: usize,
    pub dead_letter_retention: usize,
    pub lease_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffKind::Exponential,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            completed_retention: 1_000,
            dead_letter_retention: 5_000,
            lease_ms: 30_000,
        }
    }
}

impl QueueConfig {
    pub fn redelivery_policy(&self) -> Result<RedeliveryPolicy, ConfigError> {
        let base = Duration::from_millis(self.base_delay_ms);
        let backoff = match self.backoff {
            BackoffKind::Fixed => Backoff::fixed(base),
            BackoffKind::Exponential => {
                Backoff::exponential(base).with_max(Duration::from_millis(self.max_delay_ms))?
            }
        };
        Ok(RedeliveryPolicy::builder().max_attempts(self.max_attempts).backoff(backoff).build()?)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    /// Workers renew a running attempt's lease three times per lease period.
    pub fn lease_renewal(&self) -> Duration {
        Duration::from_millis(self.lease_ms / 3)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub compute_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { concurrency: 4, compute_timeout_ms: 30_000 }
    }
}

impl WorkerConfig {
    pub fn compute_timeout(&self) -> TimeoutPolicy {
        TimeoutPolicy::from_millis(self.compute_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub blocking_deadline_ms: u64,
    pub chunk_pacing_ms: u64,
    /// How often a waiting dispatcher asks the queue for an outcome it has not been sent.
    pub outcome_poll_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { blocking_deadline_ms: 30_000, chunk_pacing_ms: 20, outcome_poll_ms: 500 }
    }
}

impl DispatchConfig {
    pub fn deadline(&self) -> TimeoutPolicy {
        TimeoutPolicy::from_millis(self.blocking_deadline_ms)
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.chunk_pacing_ms)
    }

    pub fn outcome_poll(&self) -> Duration {
        Duration::from_millis(self.outcome_poll_ms)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub rate_limit: RateLimitConfig,
    pub queue: QueueConfig,
    pub workers: WorkerConfig,
    pub dispatch: DispatchConfig,
    pub redis_url: Option<String>,
}

impl GatewayConfig {
    /// Load from `CLOUDGATE__*` environment variables on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(
            config::Environment::with_prefix("CLOUDGATE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
    }

    /// Load from any `config` source; used by tests to avoid touching the process environment.
    pub fn from_source<S>(source: S) -> Result<Self, ConfigError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let loaded: GatewayConfig =
            config::Config::builder().add_source(source).build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_limit.window_secs == 0 {
            return Err(ConfigError::Invalid("rate_limit.window_secs must be > 0".into()));
        }
        if self.rate_limit.limit == 0 {
            return Err(ConfigError::Invalid("rate_limit.limit must be > 0".into()));
        }
        if self.workers.concurrency == 0 {
            return Err(ConfigError::Invalid("workers.concurrency must be > 0".into()));
        }
        if self.queue.lease_ms < 3 {
            return Err(ConfigError::Invalid("queue.lease_ms must be at least 3".into()));
        }
        if self.dispatch.outcome_poll_ms == 0 {
            return Err(ConfigError::Invalid("dispatch.outcome_poll_ms must be > 0".into()));
        }
        self.queue.redelivery_policy().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{File, FileFormat};

    fn from_toml(text: &str) -> Result<GatewayConfig, ConfigError> {
        GatewayConfig::from_source(File::from_str(text, FileFormat::Toml))
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.rate_limit, RateLimitConfig { window_secs: 60, limit: 100 });
        assert_eq!(cfg.queue.max_attempts, 3);
        assert_eq!(cfg.workers.concurrency, 4);
        assert_eq!(cfg.server.error_detail, ErrorDetail::Hardened);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_source_keeps_other_defaults() {
        let cfg = from_toml(
            "[rate_limit]\nlimit = 5\n[server]\nerror_detail = \"verbose\"\n[queue]\nbackoff = \"fixed\"\n",
        )
        .unwrap();
        assert_eq!(cfg.rate_limit.limit, 5);
        assert_eq!(cfg.rate_limit.window_secs, 60);
        assert_eq!(cfg.server.error_detail, ErrorDetail::Verbose);
        assert_eq!(cfg.queue.backoff, BackoffKind::Fixed);
        assert_eq!(cfg.workers, WorkerConfig::default());
    }

    #[test]
    fn leases_are_renewed_well_before_expiry() {
        let cfg = from_toml("[queue]\nlease_ms = 9000\n").unwrap();
        assert_eq!(cfg.queue.lease_renewal(), Duration::from_secs(3));
        assert!(matches!(from_toml("[queue]\nlease_ms = 2\n"), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_limits_are_rejected() {
        assert!(matches!(from_toml("[rate_limit]\nlimit = 0\n"), Err(ConfigError::Invalid(_))));
        assert!(matches!(
            from_toml("[queue]\nmax_attempts = 0\n"),
            Err(ConfigError::Redelivery(BuildError::InvalidMaxAttempts(0)))
        ));
    }
}
