//! Telemetry and observability for the gateway.
//!
//! Components emit structured [`GatewayEvent`]s through a [`Telemetry`] handle. Events flow into
//! `TelemetrySink` implementations, which are plain `tower::Service<GatewayEvent>`s, so they can
//! log, aggregate, or forward events to external systems.
//!
//! # Event Types
//!
//! - **Admission**: `Admitted`, `Denied`
//! - **RateLimit**: `Allowed`, `Rejected`, `Degraded`
//! - **Job**: `Submitted`, `Deduplicated`, `Completed`, `AttemptFailed`, `LeaseExpired`,
//!   `DeadLettered`
//! - **Dispatch**: `TimedOut`, `StreamAborted`

pub mod events;
pub mod sinks;

pub use events::{AdmissionEvent, DispatchEvent, GatewayEvent, JobEvent, RateLimitEvent};
pub use sinks::{emit_best_effort, LogSink, MemorySink, NullSink, Telemetry, TelemetrySink};
