//! Fixed-size pool of executors pulling from a [`JobQueue`].
//!
//! Each executor takes one delivery at a time and runs the compute step under a time budget,
//! renewing its lease while the step runs. Then it either:
//! - confirms the lease, records usage, acks, and publishes the result, or
//! - fails the attempt and lets the queue decide between redelivery and dead-lettering.
//!
//! An attempt that loses its lease stops there: nothing is billed, acked, or published for it.
//! Usage is recorded before the ack, so only the attempt that completes the job is billed. If
//! recording fails the attempt is failed too, and the job is redelivered.

use crate::clock::{Clock, SystemClock};
use crate::completion::{Completions, JobOutcome, JobResult};
use crate::compute::{count_tokens, ComputeError, InferenceEngine};
use crate::model::TokenUsage;
use crate::queue::{consume, Delivery, FailureOutcome, JobQueue, QueueError};
use crate::telemetry::{GatewayEvent, JobEvent, Telemetry};
use crate::timeout::TimeoutPolicy;
use crate::usage::{UsageRecord, UsageRecorder};
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

/// Pause after a queue error before asking again.
const QUEUE_ERROR_PAUSE: Duration = Duration::from_millis(250);

/// Everything an executor needs. Cheap to clone.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub queue: Arc<dyn JobQueue>,
    pub engine: Arc<dyn InferenceEngine>,
    pub usage: Arc<dyn UsageRecorder>,
    pub completions: Completions,
    pub compute_timeout: TimeoutPolicy,
    /// How often a running attempt renews its lease.
    pub lease_renewal: Duration,
    pub clock: Arc<dyn Clock>,
    pub telemetry: Telemetry,
}

impl WorkerContext {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        engine: Arc<dyn InferenceEngine>,
        usage: Arc<dyn UsageRecorder>,
        completions: Completions,
    ) -> Self {
        Self {
            queue,
            engine,
            usage,
            completions,
            compute_timeout: TimeoutPolicy::from_millis(30_000),
            lease_renewal: Duration::from_secs(10),
            clock: Arc::new(SystemClock),
            telemetry: Telemetry::default(),
        }
    }

    pub fn with_compute_timeout(mut self, timeout: TimeoutPolicy) -> Self {
        self.compute_timeout = timeout;
        self
    }

    /// Renew leases every `interval`; keep it well below the queue's lease.
    pub fn with_lease_renewal(mut self, interval: Duration) -> Self {
        self.lease_renewal = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Run one attempt to its end. Never panics on job errors.
    pub async fn execute(&self, delivery: Delivery) {
        let started = Instant::now();
        let compute = self.compute_timeout.execute(self.engine.complete(&delivery.job.request));
        let outcome = match self.hold_lease(&delivery, compute).await {
            Some(Ok(result)) => result,
            Some(Err(elapsed)) => Err(ComputeError::TimedOut(elapsed.limit)),
            None => return,
        };

        match outcome {
            Ok(content) => self.complete(delivery, content, started.elapsed()).await,
            Err(err) => self.fail(&delivery, &err.to_string()).await,
        }
    }

    /// Drive `work` while renewing the lease of `delivery`. `None` if the lease was lost first.
    async fn hold_lease<F: Future>(&self, delivery: &Delivery, work: F) -> Option<F::Output> {
        tokio::pin!(work);
        let mut renew =
            tokio::time::interval_at(Instant::now() + self.lease_renewal, self.lease_renewal);
        loop {
            tokio::select! {
                output = &mut work => return Some(output),
                _ = renew.tick() => {
                    if let Err(err) = self.queue.extend(delivery).await {
                        self.lease_lost(delivery, &err).await;
                        return None;
                    }
                }
            }
        }
    }

    /// The attempt no longer owns its job. If losing the lease ended the job, answer its
    /// waiters from the queue's record.
    async fn lease_lost(&self, delivery: &Delivery, err: &QueueError) {
        tracing::warn!(error = %err, "lease lost; abandoning attempt");
        match self.queue.outcome(&delivery.job.id).await {
            Ok(Some(outcome)) => self.completions.publish(&delivery.job.id, outcome),
            Ok(None) => {}
            Err(err) => tracing::debug!(error = %err, "outcome lookup failed"),
        }
    }

    async fn complete(&self, delivery: Delivery, content: String, latency: Duration) {
        let job = &delivery.job;
        // Renewing here proves the lease is still held and leaves a full period for the steps
        // below.
        if let Err(err) = self.queue.extend(&delivery).await {
            self.lease_lost(&delivery, &err).await;
            return;
        }

        let usage = TokenUsage::new(
            count_tokens(&job.request.prompt_text()),
            count_tokens(&content),
        );
        let result = JobResult { content, usage, latency, attempt: delivery.attempt };

        let record = UsageRecord {
            principal_id: job.principal_id.clone(),
            job_id: job.id.clone(),
            submitted_at: job.submitted_at,
            timestamp: self.clock.now_millis(),
            request_count: 1,
            token_count: usage.total_tokens,
            latency,
            model: job.request.model.clone(),
        };
        match self.usage.record(record).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!("usage already recorded for this job"),
            Err(err) => {
                self.fail(&delivery, &format!("usage record failed: {}", err)).await;
                return;
            }
        }

        match self.queue.ack(&delivery, &result).await {
            Ok(()) => {
                tracing::info!(latency_ms = latency.as_millis() as u64, "job completed");
                self.completions.publish(&job.id, JobOutcome::Completed(result));
                self.telemetry
                    .emit(GatewayEvent::Job(JobEvent::Completed {
                        job_id: job.id.clone(),
                        attempt: delivery.attempt,
                        latency,
                    }))
                    .await;
            }
            Err(err) => self.lease_lost(&delivery, &err).await,
        }
    }

    async fn fail(&self, delivery: &Delivery, reason: &str) {
        tracing::warn!(reason, "attempt failed");
        match self.queue.fail(delivery, reason).await {
            Ok(FailureOutcome::DeadLettered { attempts }) => {
                self.completions.publish(
                    &delivery.job.id,
                    JobOutcome::Failed { attempts, reason: reason.to_string() },
                );
            }
            Ok(FailureOutcome::Redeliver { .. }) => {}
            Err(err @ QueueError::StaleLease(_)) => self.lease_lost(delivery, &err).await,
            Err(err) => tracing::warn!(error = %err, "could not report failed attempt"),
        }
    }
}

/// Handle to a running pool.
#[derive(Debug)]
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `concurrency` executors. Must be called inside a tokio runtime.
    pub fn spawn(concurrency: usize, context: WorkerContext) -> Self {
        let (shutdown, _) = watch::channel(false);
        let handles = (0..concurrency.max(1))
            .map(|index| {
                let rx = shutdown.subscribe();
                let ctx = context.clone();
                tokio::spawn(
                    run_worker(ctx, rx).instrument(tracing::info_span!("worker", index)),
                )
            })
            .collect();
        Self { shutdown, handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Stop taking new jobs and wait for in-flight attempts to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "worker task ended abnormally");
            }
        }
    }
}

async fn run_worker(ctx: WorkerContext, mut shutdown: watch::Receiver<bool>) {
    let mut deliveries = consume(ctx.queue.clone());
    loop {
        if *shutdown.borrow() {
            break;
        }
        let next = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            next = deliveries.next() => next,
        };
        match next {
            Some(Ok(delivery)) => {
                let span = tracing::info_span!(
                    "job",
                    job_id = %delivery.job.id,
                    attempt = delivery.attempt,
                    principal = %delivery.job.principal_id,
                );
                ctx.execute(delivery).instrument(span).await;
            }
            Some(Err(err)) => {
                tracing::warn!(error = %err, "queue reserve failed");
                tokio::time::sleep(QUEUE_ERROR_PAUSE).await;
            }
            None => break,
        }
    }
    tracing::debug!("worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::MockEngine;
    use crate::model::{ChatCompletionRequest, ChatMessage};
    use crate::queue::memory::QueueOptions;
    use crate::queue::{InMemoryJobQueue, Job, JobState};
    use crate::retry::RedeliveryPolicy;
    use crate::usage::InMemoryUsageRecorder;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `n` calls.
    #[derive(Debug)]
    struct Flaky {
        remaining_failures: AtomicU32,
    }

    #[async_trait]
    impl InferenceEngine for Flaky {
        async fn complete(&self, request: &ChatCompletionRequest) -> Result<String, ComputeError> {
            let left = self.remaining_failures.load(Ordering::SeqCst);
            if left > 0 {
                self.remaining_failures.store(left - 1, Ordering::SeqCst);
                return Err(ComputeError::Backend("gpu fell over".into()));
            }
            Ok(MockEngine::reply_for(request))
        }
    }

    fn job(id: &str) -> Job {
        Job {
            id: id.into(),
            principal_id: "p".into(),
            request: ChatCompletionRequest::new("gpt-4", vec![ChatMessage::user("Hello world")]),
            submitted_at: 0,
        }
    }

    fn context(engine: Arc<dyn InferenceEngine>) -> (WorkerContext, Arc<InMemoryJobQueue>, InMemoryUsageRecorder) {
        let queue = Arc::new(InMemoryJobQueue::default().with_telemetry(Telemetry::null()));
        let usage = InMemoryUsageRecorder::new();
        let ctx = WorkerContext::new(queue.clone(), engine, Arc::new(usage.clone()), Completions::default())
            .with_telemetry(Telemetry::null());
        (ctx, queue, usage)
    }

    #[tokio::test(start_paused = true)]
    async fn redelivered_job_is_billed_once() {
        let (ctx, queue, usage) =
            context(Arc::new(Flaky { remaining_failures: AtomicU32::new(1) }));
        let rx = ctx.completions.subscribe("j1");
        queue.submit(job("j1")).await.unwrap();
        let pool = WorkerPool::spawn(2, ctx);

        let JobOutcome::Completed(result) = rx.await.unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(result.attempt, 2);
        assert_eq!(result.usage, TokenUsage::new(3, 21));
        pool.shutdown().await;

        let records = usage.for_job("j1");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].token_count, 24);
        assert_eq!(queue.status("j1").await.unwrap().unwrap().state, JobState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_job_publishes_failure() {
        let (ctx, queue, usage) =
            context(Arc::new(Flaky { remaining_failures: AtomicU32::new(u32::MAX) }));
        let rx = ctx.completions.subscribe("j1");
        queue.submit(job("j1")).await.unwrap();
        let pool = WorkerPool::spawn(1, ctx);

        assert_eq!(
            rx.await.unwrap(),
            JobOutcome::Failed { attempts: 3, reason: "inference backend failed: gpu fell over".into() }
        );
        pool.shutdown().await;
        assert!(usage.records().is_empty());
        assert_eq!(queue.dead_letters().await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_compute_times_out() {
        let (ctx, queue, _) = context(Arc::new(MockEngine::new(
            Duration::from_secs(5),
            Duration::from_secs(5),
        )));
        let ctx = ctx.with_compute_timeout(TimeoutPolicy::from_millis(100));
        queue.submit(job("j1")).await.unwrap();
        let delivery = queue.reserve().await.unwrap();
        ctx.execute(delivery).await;
        let status = queue.status("j1").await.unwrap().unwrap();
        assert_eq!(status.state, JobState::Delayed);
        assert!(status.last_error.unwrap().contains("exceeded"));
    }

    /// Single-attempt queue with a 100 ms lease and an engine that takes 500 ms.
    fn short_lease() -> (WorkerContext, Arc<InMemoryJobQueue>, InMemoryUsageRecorder) {
        let policy = RedeliveryPolicy::builder().max_attempts(1).build().unwrap();
        let options = QueueOptions { lease: Duration::from_millis(100), ..QueueOptions::default() };
        let queue =
            Arc::new(InMemoryJobQueue::new(policy, options).with_telemetry(Telemetry::null()));
        let usage = InMemoryUsageRecorder::new();
        let engine = MockEngine::new(Duration::from_millis(500), Duration::from_millis(500));
        let ctx = WorkerContext::new(
            queue.clone(),
            Arc::new(engine),
            Arc::new(usage.clone()),
            Completions::default(),
        )
        .with_compute_timeout(TimeoutPolicy::from_millis(10_000))
        .with_telemetry(Telemetry::null());
        (ctx, queue, usage)
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_keeps_slow_attempt_alive() {
        let (ctx, queue, usage) = short_lease();
        let ctx = ctx.with_lease_renewal(Duration::from_millis(30));
        let rx = ctx.completions.subscribe("j1");
        queue.submit(job("j1")).await.unwrap();
        let pool = WorkerPool::spawn(1, ctx);

        let JobOutcome::Completed(result) = rx.await.unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(result.attempt, 1);
        pool.shutdown().await;
        assert_eq!(usage.for_job("j1").len(), 1);
        assert!(queue.dead_letters().await.unwrap().is_empty());
        assert_eq!(queue.status("j1").await.unwrap().unwrap().state, JobState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_lease_is_neither_billed_nor_reported_as_success() {
        let (ctx, queue, usage) = short_lease();
        let ctx = ctx.with_lease_renewal(Duration::from_secs(1));
        let rx = ctx.completions.subscribe("j1");
        queue.submit(job("j1")).await.unwrap();
        let pool = WorkerPool::spawn(1, ctx);

        assert_eq!(
            rx.await.unwrap(),
            JobOutcome::Failed { attempts: 1, reason: "lease expired".into() }
        );
        pool.shutdown().await;
        assert!(usage.records().is_empty());
        assert_eq!(queue.dead_letters().await.unwrap().len(), 1);
        assert_eq!(queue.status("j1").await.unwrap().unwrap().state, JobState::DeadLettered);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_idle_workers() {
        let (ctx, _, _) = context(Arc::new(MockEngine::instant()));
        let pool = WorkerPool::spawn(4, ctx);
        assert_eq!(pool.size(), 4);
        pool.shutdown().await;
    }
}
