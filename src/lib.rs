#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Cloudgate
//!
//! Admission, throttling, queueing, and execution of short-lived inference-style compute jobs.
//!
//! ## Pipeline
//!
//! - **Admission** validates a bearer credential against hashed records and attaches a principal
//! - **Rate limiting** counts requests per principal in fixed windows held in a shared store
//! - **Job queue** delivers jobs at least once, redelivering with backoff and dead-lettering
//! - **Worker pool** executes jobs concurrently under a time budget and records usage
//! - **Dispatch** answers either with one blocking result or a stream of word-sized deltas
//!
//! The first three stages are tower layers, so the whole request path composes with
//! `tower::ServiceBuilder`:
//!
//! ```rust,no_run
//! use cloudgate::{Gateway, GatewayConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let gateway = Gateway::in_memory(GatewayConfig::default())?;
//! let issued = gateway.credentials().issue("docs").await?;
//! println!("secret shown once: {}", issued.secret);
//! gateway.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod backoff;
pub mod clock;
pub mod completion;
pub mod compute;
pub mod config;
pub mod credential;
pub mod dispatch;
pub mod dynamic;
pub mod envelope;
pub mod error;
pub mod gateway;
pub mod health;
pub mod http;
pub mod model;
pub mod queue;
pub mod rate_limit;
pub mod retry;
pub mod sleeper;
pub mod telemetry;
pub mod timeout;
pub mod usage;
pub mod worker;

// Re-exports
pub use auth::{AdmissionGate, AdmissionLayer, AdmissionService, AuthError, Principal};
pub use backoff::Backoff;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, ErrorDetail, GatewayConfig};
pub use credential::{CredentialStore, InMemoryCredentialStore, IssuedCredential, Keyring};
pub use dispatch::{Dispatch, Dispatcher, StreamEvent};
pub use dynamic::DynamicConfig;
pub use envelope::{Envelope, Quota, Rejection, Reply};
pub use error::GatewayError;
pub use gateway::{Gateway, GatewayBuilder, GatewayService};
pub use health::HealthReport;
pub use queue::{InMemoryJobQueue, Job, JobId, JobQueue};
pub use rate_limit::{Decision, FixedWindow, RateLimitLayer, RateLimiter};
pub use retry::RedeliveryPolicy;
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use timeout::TimeoutPolicy;
pub use worker::WorkerPool;
