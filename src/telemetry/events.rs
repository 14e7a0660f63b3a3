use std::fmt;
use std::time::Duration;

/// Events emitted along the request and job paths.
///
/// Events describe decisions (admitted, throttled, redelivered) rather than raw log lines, so
/// sinks can count them, forward them, or assert on them in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    /// Credential checks
    Admission(AdmissionEvent),
    /// Fixed-window decisions
    RateLimit(RateLimitEvent),
    /// Queue and worker lifecycle
    Job(JobEvent),
    /// Delivery to the caller
    Dispatch(DispatchEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionEvent {
    /// A credential resolved to a principal.
    Admitted { principal: String },
    /// The request was refused before reaching the limiter.
    Denied {
        /// Machine-readable reason (`missing_authorization`, `invalid_api_key`, ...).
        code: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitEvent {
    Allowed { principal: String, remaining: u32 },
    Rejected { principal: String, retry_after: Duration },
    /// The counter store failed and the request was let through uncounted.
    Degraded { principal: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Submitted { job_id: String },
    /// Resubmission of a job id that is already known; nothing was enqueued.
    Deduplicated { job_id: String },
    Completed { job_id: String, attempt: u32, latency: Duration },
    /// An attempt failed and the job will be delivered again after `delay`.
    AttemptFailed { job_id: String, attempt: u32, delay: Duration },
    /// A reserved attempt was neither acked nor failed before its lease ran out.
    LeaseExpired { job_id: String, attempt: u32 },
    DeadLettered { job_id: String, attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEvent {
    /// A blocking caller gave up waiting; the job keeps running.
    TimedOut { job_id: String, waited: Duration },
    /// A stream ended with an in-band error event.
    StreamAborted { job_id: String, code: &'static str },
}

impl fmt::Display for GatewayEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayEvent::Admission(event) => write!(f, "Admission::{}", event),
            GatewayEvent::RateLimit(event) => write!(f, "RateLimit::{}", event),
            GatewayEvent::Job(event) => write!(f, "Job::{}", event),
            GatewayEvent::Dispatch(event) => write!(f, "Dispatch::{}", event),
        }
    }
}

impl fmt::Display for AdmissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionEvent::Admitted { principal } => write!(f, "Admitted({})", principal),
            AdmissionEvent::Denied { code } => write!(f, "Denied({})", code),
        }
    }
}

impl fmt::Display for RateLimitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitEvent::Allowed { principal, remaining } => {
                write!(f, "Allowed({}, remaining={})", principal, remaining)
            }
            RateLimitEvent::Rejected { principal, retry_after } => {
                write!(f, "Rejected({}, retry_after={:?})", principal, retry_after)
            }
            RateLimitEvent::Degraded { principal } => write!(f, "Degraded({})", principal),
        }
    }
}

impl fmt::Display for JobEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobEvent::Submitted { job_id } => write!(f, "Submitted({})", job_id),
            JobEvent::Deduplicated { job_id } => write!(f, "Deduplicated({})", job_id),
            JobEvent::Completed { job_id, attempt, latency } => {
                write!(f, "Completed({}, attempt={}, latency={:?})", job_id, attempt, latency)
            }
            JobEvent::AttemptFailed { job_id, attempt, delay } => {
                write!(f, "AttemptFailed({}, attempt={}, delay={:?})", job_id, attempt, delay)
            }
            JobEvent::LeaseExpired { job_id, attempt } => {
                write!(f, "LeaseExpired({}, attempt={})", job_id, attempt)
            }
            JobEvent::DeadLettered { job_id, attempts } => {
                write!(f, "DeadLettered({}, attempts={})", job_id, attempts)
            }
        }
    }
}

impl fmt::Display for DispatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchEvent::TimedOut { job_id, waited } => {
                write!(f, "TimedOut({}, waited={:?})", job_id, waited)
            }
            DispatchEvent::StreamAborted { job_id, code } => {
                write!(f, "StreamAborted({}, {})", job_id, code)
            }
        }
    }
}
