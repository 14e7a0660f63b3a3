//! Request and response types shared by the tower layers on the submission path.

use crate::auth::Principal;
use crate::dispatch::Dispatch;
use crate::error::GatewayError;
use serde_json::Value;
use std::time::Duration;

/// A submission as it travels through admission, rate limiting, and dispatch.
///
/// Transport adapters fill in `authorization`, `idempotency_key`, and `body`; the layers fill in
/// `principal` and `quota` as they pass it along.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    /// Raw `Authorization` header value, if one was sent.
    pub authorization: Option<String>,
    /// Caller-chosen job id for idempotent resubmission.
    pub idempotency_key: Option<String>,
    pub principal: Option<Principal>,
    pub quota: Option<Quota>,
    /// Unvalidated request payload.
    pub body: Value,
}

impl Envelope {
    pub fn new(body: Value) -> Self {
        Self { body, ..Self::default() }
    }

    pub fn with_authorization(mut self, header: impl Into<String>) -> Self {
        self.authorization = Some(header.into());
        self
    }

    /// Shorthand for `Authorization: Bearer <secret>`.
    pub fn with_bearer(self, secret: &str) -> Self {
        self.with_authorization(format!("Bearer {}", secret))
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Rate-limit state reported back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub limit: u32,
    /// `None` when the counter store was unreachable and the request went through uncounted.
    pub remaining: Option<u32>,
    /// Set only on rejection.
    pub retry_after: Option<Duration>,
}

/// Successful outcome of the submission path.
pub struct Reply {
    pub quota: Option<Quota>,
    pub body: Dispatch,
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reply").field("quota", &self.quota).field("body", &self.body).finish()
    }
}

/// Failed outcome of the submission path, with whatever quota was known at the time.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{error}")]
pub struct Rejection {
    pub error: GatewayError,
    pub quota: Option<Quota>,
}

impl From<GatewayError> for Rejection {
    fn from(error: GatewayError) -> Self {
        Self { error, quota: None }
    }
}

impl Rejection {
    pub fn with_quota(mut self, quota: Option<Quota>) -> Self {
        if self.quota.is_none() {
            self.quota = quota;
        }
        self
    }
}
