//! Response dispatch: submit a validated job and deliver its result.
//!
//! Per request the dispatcher moves through `Submitted → Executing → Completed | Failed`;
//! streaming inserts `Emitting` before `Completed`.
//!
//! - **Blocking**: wait for the outcome or the deadline. On deadline the caller gets
//!   [`GatewayError::Timeout`] and the job keeps running in the queue.
//! - **Streaming**: the compute step returns its text in one piece, so the dispatcher splits it
//!   into word deltas and emits them paced by a [`Sleeper`], followed by a finish chunk and a
//!   [`StreamEvent::Done`] sentinel. Each delta keeps the whitespace that follows its word, so
//!   the deltas concatenate to exactly the blocking content. Failures after the stream has
//!   started become an in-band [`StreamEvent::Error`].
//!
//! Outcomes normally arrive through [`Completions`]. While waiting, the dispatcher also asks the
//! queue at a fixed interval, which covers jobs finished by another process and jobs whose last
//! lease ran out with no worker left to report it.

use crate::auth::Principal;
use crate::clock::{Clock, SystemClock};
use crate::completion::{Completions, JobOutcome};
use crate::config::DispatchConfig;
use crate::envelope::{Envelope, Rejection, Reply};
use crate::error::{Dependency, GatewayError};
use crate::model::{validate_request, ChatCompletion, ChatCompletionChunk, PayloadError};
use crate::queue::{Job, JobQueue, Submission};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{DispatchEvent, GatewayEvent, Telemetry};
use crate::timeout::TimeoutPolicy;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tower_service::Service;

/// Longest accepted `Idempotency-Key`.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

/// One event of a streamed response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Chunk(ChatCompletionChunk),
    /// Terminal failure after the stream started.
    Error(GatewayError),
    /// End-of-stream sentinel.
    Done,
}

/// What the dispatcher hands back for a submission.
pub enum Dispatch {
    Blocking(ChatCompletion),
    Streaming(BoxStream<'static, StreamEvent>),
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dispatch::Blocking(completion) => f.debug_tuple("Blocking").field(completion).finish(),
            Dispatch::Streaming(_) => f.write_str("Streaming(..)"),
        }
    }
}

/// Job id for a submission: derived from the principal and the idempotency key when given, so
/// two principals cannot collide on the same key.
pub fn job_id_for(principal_id: &str, idempotency_key: Option<&str>) -> String {
    match idempotency_key {
        Some(key) => {
            let mut hasher = Sha256::new();
            hasher.update(principal_id.as_bytes());
            hasher.update([0u8]);
            hasher.update(key.as_bytes());
            hex::encode(&hasher.finalize()[..16])
        }
        None => uuid::Uuid::new_v4().simple().to_string(),
    }
}

fn check_idempotency_key(key: &str) -> Result<(), PayloadError> {
    if key.trim().is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(PayloadError {
            code: "invalid_idempotency_key",
            message: format!(
                "Idempotency-Key must be 1 to {} characters",
                MAX_IDEMPOTENCY_KEY_LEN
            ),
        });
    }
    Ok(())
}

/// Innermost service of the submission path.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    queue: Arc<dyn JobQueue>,
    completions: Completions,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    deadline: TimeoutPolicy,
    pacing: Duration,
    poll: Duration,
    telemetry: Telemetry,
}

impl Dispatcher {
    pub fn new(queue: Arc<dyn JobQueue>, completions: Completions, config: &DispatchConfig) -> Self {
        Self {
            queue,
            completions,
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
            deadline: config.deadline(),
            pacing: config.pacing(),
            poll: config.outcome_poll().max(Duration::from_millis(1)),
            telemetry: Telemetry::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Validate, enqueue, and deliver one submission for an admitted principal.
    pub async fn dispatch(
        &self,
        principal: &Principal,
        body: &serde_json::Value,
        idempotency_key: Option<&str>,
    ) -> Result<Dispatch, GatewayError> {
        let request = validate_request(body)?;
        if let Some(key) = idempotency_key {
            check_idempotency_key(key)?;
        }

        let job = Job {
            id: job_id_for(&principal.id, idempotency_key),
            principal_id: principal.id.clone(),
            request,
            submitted_at: self.clock.now_millis(),
        };
        let response_id = format!("chatcmpl-{}", job.id);
        let created = (job.submitted_at / 1_000) as i64;
        let model = job.request.model.clone();
        let streaming = job.request.stream;
        let job_id = job.id.clone();

        // Subscribe first so a fast worker cannot finish before anyone listens.
        let outcome = self.completions.subscribe(&job.id);
        match self.queue.submit(job).await {
            Ok(Submission::Enqueued) => {}
            Ok(Submission::Duplicate) => {
                tracing::debug!(job_id = %job_id, "resubmission of known job; waiting on its outcome");
                // A finished job may have outlived its cached outcome.
                if let Ok(Some(finished)) = self.queue.outcome(&job_id).await {
                    self.completions.publish(&job_id, finished);
                }
            }
            Err(err) => {
                self.completions.forget(&job_id);
                tracing::error!(job_id = %job_id, error = %err, "job submission failed");
                return Err(GatewayError::dependency(Dependency::JobQueue, err));
            }
        }

        if !streaming {
            let completion = self.wait(&job_id, outcome).await?;
            return Ok(Dispatch::Blocking(ChatCompletion::new(
                response_id,
                model,
                created,
                completion.content,
                completion.usage,
            )));
        }

        let state = StreamState {
            phase: Phase::Executing(outcome),
            job_id,
            response_id,
            model,
            created,
            dispatcher: self.clone(),
        };
        Ok(Dispatch::Streaming(Box::pin(stream::unfold(state, StreamState::next))))
    }

    /// Outcome of `job_id`, from the hub or, failing that, from the queue's record.
    async fn outcome(
        &self,
        job_id: &str,
        mut published: oneshot::Receiver<JobOutcome>,
    ) -> Result<JobOutcome, GatewayError> {
        let mut poll = tokio::time::interval_at(Instant::now() + self.poll, self.poll);
        loop {
            tokio::select! {
                received = &mut published => {
                    return received.map_err(|_| {
                        GatewayError::dependency(
                            Dependency::JobQueue,
                            "completion channel closed before an outcome was published",
                        )
                    });
                }
                _ = poll.tick() => match self.queue.outcome(job_id).await {
                    Ok(Some(outcome)) => {
                        self.completions.publish(job_id, outcome.clone());
                        return Ok(outcome);
                    }
                    Ok(None) => {}
                    Err(err) => tracing::debug!(job_id, error = %err, "outcome lookup failed"),
                },
            }
        }
    }

    async fn wait(
        &self,
        job_id: &str,
        published: oneshot::Receiver<JobOutcome>,
    ) -> Result<crate::completion::JobResult, GatewayError> {
        let waited = self.deadline.execute(self.outcome(job_id, published)).await;
        match waited {
            Ok(Ok(JobOutcome::Completed(result))) => Ok(result),
            Ok(Ok(JobOutcome::Failed { attempts, reason })) => {
                Err(GatewayError::ExecutionFailure { attempts, reason })
            }
            Ok(Err(err)) => Err(err),
            Err(elapsed) => {
                self.completions.abandon(job_id);
                self.telemetry
                    .emit(GatewayEvent::Dispatch(DispatchEvent::TimedOut {
                        job_id: job_id.to_string(),
                        waited: elapsed.limit,
                    }))
                    .await;
                Err(GatewayError::Timeout { waited: elapsed.limit })
            }
        }
    }
}

/// Split `content` into word deltas that keep every separator: leading whitespace stays on the
/// first delta and each word carries the whitespace run after it.
fn split_deltas(content: &str) -> VecDeque<String> {
    let mut deltas = VecDeque::new();
    let mut start = 0;
    let mut seen_word = false;
    let mut after_space = true;
    for (i, c) in content.char_indices() {
        let space = c.is_whitespace();
        if !space && after_space {
            if seen_word {
                deltas.push_back(content[start..i].to_string());
                start = i;
            }
            seen_word = true;
        }
        after_space = space;
    }
    if start < content.len() {
        deltas.push_back(content[start..].to_string());
    }
    deltas
}

enum Phase {
    Executing(oneshot::Receiver<JobOutcome>),
    Emitting { words: VecDeque<String>, first: bool },
    Finishing,
    Closing,
    Closed,
}

struct StreamState {
    phase: Phase,
    job_id: String,
    response_id: String,
    model: String,
    created: i64,
    dispatcher: Dispatcher,
}

impl StreamState {
    async fn next(mut self) -> Option<(StreamEvent, Self)> {
        loop {
            match std::mem::replace(&mut self.phase, Phase::Closed) {
                Phase::Executing(outcome) => {
                    match self.dispatcher.wait(&self.job_id, outcome).await {
                        Ok(result) => {
                            let words = split_deltas(&result.content);
                            self.phase = Phase::Emitting { words, first: true };
                        }
                        Err(err) => {
                            self.dispatcher
                                .telemetry
                                .emit(GatewayEvent::Dispatch(DispatchEvent::StreamAborted {
                                    job_id: self.job_id.clone(),
                                    code: err.code(),
                                }))
                                .await;
                            return Some((StreamEvent::Error(err), self));
                        }
                    }
                }
                Phase::Emitting { mut words, first } => {
                    let Some(word) = words.pop_front() else {
                        self.phase = Phase::Finishing;
                        continue;
                    };
                    if !first {
                        self.dispatcher.sleeper.sleep(self.dispatcher.pacing).await;
                    }
                    self.phase = Phase::Emitting { words, first: false };
                    let chunk =
                        ChatCompletionChunk::delta(&self.response_id, &self.model, self.created, word);
                    return Some((StreamEvent::Chunk(chunk), self));
                }
                Phase::Finishing => {
                    self.phase = Phase::Closing;
                    let chunk = ChatCompletionChunk::finish(&self.response_id, &self.model, self.created);
                    return Some((StreamEvent::Chunk(chunk), self));
                }
                Phase::Closing => return Some((StreamEvent::Done, self)),
                Phase::Closed => return None,
            }
        }
    }
}

impl Service<Envelope> for Dispatcher {
    type Response = Reply;
    type Error = Rejection;
    type Future = BoxFuture<'static, Result<Reply, Rejection>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Envelope) -> Self::Future {
        let this = self.clone();
        Box::pin(async move {
            let principal = req
                .principal
                .as_ref()
                .ok_or_else(|| Rejection::from(GatewayError::MissingCredential))?;
            let body = this
                .dispatch(principal, &req.body, req.idempotency_key.as_deref())
                .await
                .map_err(|e| Rejection { error: e, quota: req.quota })?;
            Ok(Reply { quota: req.quota, body })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::JobResult;
    use crate::model::TokenUsage;
    use crate::queue::InMemoryJobQueue;
    use crate::sleeper::TrackingSleeper;
    use futures::StreamExt;
    use serde_json::json;

    fn principal() -> Principal {
        Principal { id: "p1".into(), name: "test".into() }
    }

    fn dispatcher(deadline_ms: u64) -> (Dispatcher, Arc<InMemoryJobQueue>, Completions) {
        let queue = Arc::new(InMemoryJobQueue::default().with_telemetry(Telemetry::null()));
        let completions = Completions::default();
        let config = DispatchConfig {
            blocking_deadline_ms: deadline_ms,
            chunk_pacing_ms: 20,
            outcome_poll_ms: 100,
        };
        let dispatcher = Dispatcher::new(queue.clone(), completions.clone(), &config)
            .with_telemetry(Telemetry::null());
        (dispatcher, queue, completions)
    }

    fn body(stream: bool) -> serde_json::Value {
        json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "Hello world"}], "stream": stream})
    }

    /// Plays the worker role: take the next job and publish a fixed answer.
    async fn answer_next(queue: &InMemoryJobQueue, completions: &Completions, content: &str) {
        let delivery = queue.reserve().await.unwrap();
        let result = JobResult {
            content: content.into(),
            usage: TokenUsage::new(3, 4),
            latency: Duration::from_millis(1),
            attempt: delivery.attempt,
        };
        queue.ack(&delivery, &result).await.unwrap();
        completions.publish(&delivery.job.id, JobOutcome::Completed(result));
    }

    #[test]
    fn deltas_keep_every_separator() {
        for text in ["one two  three", "Line one.\nLine  two.", "  lead\tand trail \n", "solo", ""] {
            let deltas = split_deltas(text);
            assert_eq!(deltas.iter().map(String::as_str).collect::<String>(), text);
        }
        assert_eq!(split_deltas("Line one.\nLine  two."), ["Line ", "one.\n", "Line  ", "two."]);
        assert_eq!(split_deltas("  lead"), ["  lead"]);
        assert!(split_deltas("").is_empty());
    }

    #[test]
    fn scoped_job_ids() {
        let a = job_id_for("alice", Some("k"));
        assert_eq!(a, job_id_for("alice", Some("k")));
        assert_ne!(a, job_id_for("bob", Some("k")));
        assert_eq!(a.len(), 32);
        assert_ne!(job_id_for("alice", None), job_id_for("alice", None));
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_returns_completion() {
        let (dispatcher, queue, completions) = dispatcher(1_000);
        let worker = tokio::spawn(async move { answer_next(&queue, &completions, "two words").await });
        let Dispatch::Blocking(completion) =
            dispatcher.dispatch(&principal(), &body(false), None).await.unwrap()
        else {
            panic!("expected blocking");
        };
        worker.await.unwrap();
        assert!(completion.id.starts_with("chatcmpl-"));
        assert_eq!(completion.model, "gpt-4o");
        assert_eq!(completion.content(), "two words");
        assert_eq!(completion.usage.total_tokens, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_deadline_does_not_cancel_job() {
        let (dispatcher, queue, _) = dispatcher(50);
        let err = dispatcher.dispatch(&principal(), &body(false), Some("k1")).await.unwrap_err();
        assert_eq!(err, GatewayError::Timeout { waited: Duration::from_millis(50) });
        let id = job_id_for("p1", Some("k1"));
        assert!(queue.status(&id).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stream_emits_words_then_finish_then_done() {
        let (dispatcher, queue, completions) = dispatcher(1_000);
        let sleeper = TrackingSleeper::new();
        let dispatcher = dispatcher.with_sleeper(Arc::new(sleeper.clone()));
        let worker = tokio::spawn(async move {
            answer_next(&queue, &completions, "one two\n\nthree").await
        });

        let Dispatch::Streaming(stream) =
            dispatcher.dispatch(&principal(), &body(true), None).await.unwrap()
        else {
            panic!("expected streaming");
        };
        let events: Vec<StreamEvent> = stream.collect().await;
        worker.await.unwrap();

        assert_eq!(events.len(), 5);
        let chunks: Vec<&ChatCompletionChunk> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Chunk(c) => Some(c),
                _ => None,
            })
            .collect();
        let text: String = chunks.iter().filter_map(|c| c.content()).collect();
        assert_eq!(text, "one two\n\nthree");
        assert_eq!(chunks[1].content(), Some("two\n\n"));
        assert!(chunks[..3].iter().all(|c| c.finish_reason().is_none()));
        assert_eq!(chunks[3].finish_reason(), Some("stop"));
        assert_eq!(events[4], StreamEvent::Done);
        assert_eq!(sleeper.calls(), vec![Duration::from_millis(20); 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_failure_is_in_band() {
        let (dispatcher, queue, completions) = dispatcher(1_000);
        let worker = tokio::spawn(async move {
            let delivery = queue.reserve().await.unwrap();
            completions.publish(
                &delivery.job.id,
                JobOutcome::Failed { attempts: 3, reason: "boom".into() },
            );
        });
        let Dispatch::Streaming(stream) =
            dispatcher.dispatch(&principal(), &body(true), None).await.unwrap()
        else {
            panic!("expected streaming");
        };
        let events: Vec<StreamEvent> = stream.collect().await;
        worker.await.unwrap();
        assert_eq!(
            events,
            vec![StreamEvent::Error(GatewayError::ExecutionFailure {
                attempts: 3,
                reason: "boom".into()
            })]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unreported_outcome_is_read_from_queue() {
        let (dispatcher, queue, completions) = dispatcher(60_000);
        // Takes the job and finishes it without telling the hub, like a worker in another
        // process.
        let worker = tokio::spawn({
            let queue = queue.clone();
            async move {
                let delivery = queue.reserve().await.unwrap();
                queue.fail(&delivery, "first").await.unwrap();
                let retry = queue.reserve().await.unwrap();
                queue.fail(&retry, "second").await.unwrap();
                let last = queue.reserve().await.unwrap();
                queue.fail(&last, "device lost").await.unwrap();
            }
        });
        let err = dispatcher.dispatch(&principal(), &body(false), None).await.unwrap_err();
        worker.await.unwrap();
        assert_eq!(
            err,
            GatewayError::ExecutionFailure { attempts: 3, reason: "device lost".into() }
        );
        assert_eq!(completions.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn resubmission_after_cache_eviction_gets_stored_result() {
        let (dispatcher, queue, completions) = dispatcher(1_000);
        let worker = tokio::spawn({
            let (queue, completions) = (queue.clone(), completions.clone());
            async move { answer_next(&queue, &completions, "kept").await }
        });
        dispatcher.dispatch(&principal(), &body(false), Some("same")).await.unwrap();
        worker.await.unwrap();

        // Push the answer out of the hub's cache; the queue still knows the job.
        let filler = JobOutcome::Failed { attempts: 1, reason: "x".into() };
        for i in 0..1_000 {
            completions.publish(&format!("filler-{}", i), filler.clone());
        }
        let id = job_id_for("p1", Some("same"));
        assert!(completions.outcome(&id).is_none());

        let Dispatch::Blocking(again) =
            dispatcher.dispatch(&principal(), &body(false), Some("same")).await.unwrap()
        else {
            panic!("expected blocking");
        };
        assert_eq!(again.content(), "kept");
        assert_eq!(completions.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_waiter_is_released() {
        let (dispatcher, _queue, completions) = dispatcher(50);
        let err = dispatcher.dispatch(&principal(), &body(false), None).await.unwrap_err();
        assert!(matches!(err, GatewayError::Timeout { .. }));
        assert_eq!(completions.pending(), 0);
    }

    #[tokio::test]
    async fn invalid_payload_never_reaches_queue() {
        let (dispatcher, queue, _) = dispatcher(1_000);
        let err = dispatcher
            .dispatch(&principal(), &json!({"model": "gpt-4o", "messages": []}), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "missing_messages");
        let err = dispatcher.dispatch(&principal(), &body(false), Some("  ")).await.unwrap_err();
        assert_eq!(err.code(), "invalid_idempotency_key");
        assert!(queue.dead_letters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn queue_outage_is_surfaced() {
        let (dispatcher, queue, completions) = dispatcher(1_000);
        queue.set_reachable(false);
        let err = dispatcher.dispatch(&principal(), &body(false), None).await.unwrap_err();
        assert_eq!(err.code(), "service_unavailable");
        assert_eq!(completions.pending(), 0);
    }
}
