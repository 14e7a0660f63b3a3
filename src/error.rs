//! Error taxonomy surfaced to callers.
//!
//! Every variant maps to a stable machine-readable `code`, an error `kind`, and a caller-facing
//! message. Dependency and execution detail is only shown in [`ErrorDetail::Verbose`] mode.
use crate::config::ErrorDetail;
use crate::model::PayloadError;
use std::fmt;
use std::time::Duration;

/// External resource the core depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dependency {
    CredentialStore,
    CounterStore,
    JobQueue,
    UsageStore,
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Dependency::CredentialStore => "credential store",
            Dependency::CounterStore => "counter store",
            Dependency::JobQueue => "job queue",
            Dependency::UsageStore => "usage store",
        };
        f.write_str(name)
    }
}

/// Failure reported by a credential, counter, or usage store backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The backend could not be reached at all.
    #[error("unreachable: {0}")]
    Unavailable(String),
    /// The backend answered with an error.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Coarse error family, rendered as the `type` field of error bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRequest,
    RateLimit,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request_error",
            ErrorKind::RateLimit => "rate_limit_error",
            ErrorKind::Internal => "internal_error",
        }
    }
}

/// Unified error type for the request path.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    /// No credential was presented.
    #[error("missing credential")]
    MissingCredential,
    /// A credential was presented in the wrong transport encoding.
    #[error("malformed credential: {0}")]
    MalformedCredential(String),
    /// No stored credential matches the presented secret.
    #[error("invalid credential")]
    InvalidCredential,
    /// The principal used up its window.
    #[error("rate limit exceeded: {limit} requests per {window:?}")]
    RateLimitExceeded { limit: u32, window: Duration },
    /// The payload failed validation; the caller must fix it.
    #[error("invalid payload: {}", .0.message)]
    InvalidPayload(PayloadError),
    /// The compute step kept failing until the job was dead-lettered.
    #[error("execution failed after {attempts} attempts: {reason}")]
    ExecutionFailure { attempts: u32, reason: String },
    /// The blocking wait passed its deadline; the job may still complete.
    #[error("no result within {waited:?}")]
    Timeout { waited: Duration },
    /// A shared dependency could not be reached.
    #[error("{dependency} unavailable: {detail}")]
    DependencyUnavailable { dependency: Dependency, detail: String },
}

impl GatewayError {
    pub fn dependency(dependency: Dependency, detail: impl fmt::Display) -> Self {
        GatewayError::DependencyUnavailable { dependency, detail: detail.to_string() }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::MissingCredential => "missing_authorization",
            GatewayError::MalformedCredential(_) => "invalid_authorization",
            GatewayError::InvalidCredential => "invalid_api_key",
            GatewayError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            GatewayError::InvalidPayload(p) => p.code,
            GatewayError::ExecutionFailure { .. } => "inference_error",
            GatewayError::Timeout { .. } => "timeout",
            GatewayError::DependencyUnavailable { .. } => "service_unavailable",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::MissingCredential
            | GatewayError::MalformedCredential(_)
            | GatewayError::InvalidCredential
            | GatewayError::InvalidPayload(_) => ErrorKind::InvalidRequest,
            GatewayError::RateLimitExceeded { .. } => ErrorKind::RateLimit,
            GatewayError::ExecutionFailure { .. }
            | GatewayError::Timeout { .. }
            | GatewayError::DependencyUnavailable { .. } => ErrorKind::Internal,
        }
    }

    /// Whether the same request may succeed later without changes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::RateLimitExceeded { .. }
                | GatewayError::Timeout { .. }
                | GatewayError::DependencyUnavailable { .. }
        )
    }

    /// Message shown to the caller.
    pub fn public_message(&self, detail: ErrorDetail) -> String {
        match self {
            GatewayError::MissingCredential => {
                "Missing Authorization header. Use: Authorization: Bearer <api_key>".into()
            }
            GatewayError::MalformedCredential(why) => {
                format!("Invalid Authorization format ({}). Use: Bearer <api_key>", why)
            }
            GatewayError::InvalidCredential => "Invalid API key".into(),
            GatewayError::RateLimitExceeded { limit, window } => format!(
                "Rate limit exceeded. Maximum {} requests per {} seconds.",
                limit,
                window.as_secs()
            ),
            GatewayError::InvalidPayload(p) => p.message.clone(),
            GatewayError::ExecutionFailure { .. } | GatewayError::DependencyUnavailable { .. } => {
                match detail {
                    ErrorDetail::Verbose => self.to_string(),
                    ErrorDetail::Hardened => "Inference failed".into(),
                }
            }
            GatewayError::Timeout { waited } => format!(
                "Inference did not complete within {} ms; the job may still finish",
                waited.as_millis()
            ),
        }
    }
}

impl From<PayloadError> for GatewayError {
    fn from(err: PayloadError) -> Self {
        GatewayError::InvalidPayload(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardened_mode_hides_dependency_text() {
        let err = GatewayError::dependency(Dependency::JobQueue, "ECONNREFUSED 10.0.0.7:6379");
        let hardened = err.public_message(ErrorDetail::Hardened);
        assert!(!hardened.contains("10.0.0.7"));
        let verbose = err.public_message(ErrorDetail::Verbose);
        assert!(verbose.contains("job queue"));
        assert!(verbose.contains("10.0.0.7"));
    }

    #[test]
    fn auth_errors_are_terminal() {
        for err in [
            GatewayError::MissingCredential,
            GatewayError::MalformedCredential("scheme".into()),
            GatewayError::InvalidCredential,
        ] {
            assert_eq!(err.kind(), ErrorKind::InvalidRequest);
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn rate_limit_message_names_window() {
        let err = GatewayError::RateLimitExceeded { limit: 100, window: Duration::from_secs(60) };
        assert_eq!(err.code(), "rate_limit_exceeded");
        assert_eq!(err.kind().as_str(), "rate_limit_error");
        assert!(err.public_message(ErrorDetail::Hardened).contains("100 requests per 60 seconds"));
        assert!(err.is_retryable());
    }

    #[test]
    fn payload_code_passes_through() {
        let err: GatewayError =
            PayloadError { code: "invalid_role", message: "bad role".into() }.into();
        assert_eq!(err.code(), "invalid_role");
        assert_eq!(err.public_message(ErrorDetail::Hardened), "bad role");
    }
}
