//! Job queue with at-least-once delivery.
//!
//! A job is *delivered* when a worker reserves it and *complete* only once the worker acks the
//! reservation. Every reservation carries a lease; an attempt that is neither acked nor failed
//! before its lease runs out counts as failed. Failed attempts are redelivered with backoff up to
//! the policy's attempt budget and dead-lettered afterwards.
//!
//! Completed and dead-lettered jobs are retained for a bounded count, together with their
//! outcome, so resubmissions of the same job id can be answered and failures inspected. A waiter
//! that never heard from a worker (the job finished in another process, or its last lease ran
//! out) reads the outcome from here.

use crate::completion::{JobOutcome, JobResult};
use crate::model::{ChatCompletionRequest, ResponseMode};
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub mod memory;
pub use memory::{InMemoryJobQueue, QueueOptions};

/// Unique job identifier; caller-supplied (idempotency key) or generated.
pub type JobId = String;

/// One submitted compute request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub principal_id: String,
    pub request: ChatCompletionRequest,
    /// Unix milliseconds.
    pub submitted_at: u64,
}

impl Job {
    pub fn mode(&self) -> ResponseMode {
        self.request.mode()
    }
}

/// Opaque proof of a reservation. Only the holder of the current lease may ack or fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseToken(pub(crate) u64);

impl LeaseToken {
    /// Token minted by a queue implementation.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// A job handed to a worker for one attempt.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job: Job,
    /// 1-based attempt number.
    pub attempt: u32,
    pub lease: LeaseToken,
}

/// Result of [`JobQueue::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Enqueued,
    /// The id is already active or retained; nothing was enqueued.
    Duplicate,
}

/// Result of [`JobQueue::fail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The job will be delivered again as attempt `next_attempt` after `delay`.
    Redeliver { next_attempt: u32, delay: Duration },
    DeadLettered { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    /// Waiting for a backoff delay to pass.
    Delayed,
    Active,
    Completed,
    DeadLettered,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::DeadLettered)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub state: JobState,
    pub attempts_made: u32,
    pub last_error: Option<String>,
}

/// A job that exhausted its attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub job: Job,
    pub attempts: u32,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue closed")]
    Closed,
    /// The lease was superseded, expired, or the job is unknown.
    #[error("stale lease for job {0}")]
    StaleLease(JobId),
    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

/// Ordered, at-least-once delivery channel shared by submitters and workers.
#[async_trait]
pub trait JobQueue: Send + Sync + std::fmt::Debug {
    /// Enqueue `job` unless its id is already known.
    async fn submit(&self, job: Job) -> Result<Submission, QueueError>;

    /// Wait for the next available job and lease it. Cancel-safe.
    async fn reserve(&self) -> Result<Delivery, QueueError>;

    /// Push the lease of a running attempt out by another lease period.
    ///
    /// Fails with [`QueueError::StaleLease`] once the attempt no longer owns the job.
    async fn extend(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Mark the delivered attempt successful and keep `result` as the job's outcome.
    async fn ack(&self, delivery: &Delivery, result: &JobResult) -> Result<(), QueueError>;

    /// Mark the delivered attempt failed and let the policy choose redelivery or dead-letter.
    async fn fail(&self, delivery: &Delivery, reason: &str) -> Result<FailureOutcome, QueueError>;

    async fn status(&self, id: &str) -> Result<Option<JobStatus>, QueueError>;

    /// Terminal outcome of a retained job; `None` while it is still pending or once evicted.
    async fn outcome(&self, id: &str) -> Result<Option<JobOutcome>, QueueError>;

    /// Retained dead letters, oldest first.
    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError>;

    /// Reachability check.
    async fn ping(&self) -> Result<(), QueueError>;

    /// Stop handing out jobs; pending `reserve` calls return [`QueueError::Closed`].
    async fn close(&self);
}

/// Endless stream of deliveries for one consumer. Ends only when the queue closes.
///
/// Transient errors are yielded so the consumer can decide how to back off.
pub fn consume(queue: Arc<dyn JobQueue>) -> BoxStream<'static, Result<Delivery, QueueError>> {
    Box::pin(stream::unfold(queue, |queue| async move {
        match queue.reserve().await {
            Err(QueueError::Closed) => None,
            other => Some((other, queue)),
        }
    }))
}
