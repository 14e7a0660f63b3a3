mod common;

use cloudgate::compute::MockEngine;
use cloudgate::dispatch::{job_id_for, StreamEvent};
use cloudgate::model::Role;
use cloudgate::queue::JobState;
use cloudgate::telemetry::{DispatchEvent, GatewayEvent, JobEvent};
use cloudgate::{Dispatch, Envelope, GatewayConfig, GatewayError, JobQueue};
use common::test_helpers::{chat_body, FixedEngine, FlakyEngine, Harness};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

async fn blocking_content(h: &Harness, secret: &str, text: &str) -> String {
    let reply = h.submit(Envelope::new(chat_body(text, false)).with_bearer(secret)).await.unwrap();
    match reply.body {
        Dispatch::Blocking(completion) => completion.content().to_string(),
        Dispatch::Streaming(_) => panic!("expected a blocking reply"),
    }
}

async fn stream_events(h: &Harness, envelope: Envelope) -> Vec<StreamEvent> {
    match h.submit(envelope).await.unwrap().body {
        Dispatch::Streaming(stream) => stream.collect().await,
        Dispatch::Blocking(_) => panic!("expected a stream"),
    }
}

#[tokio::test(start_paused = true)]
async fn blocking_reply_has_one_assistant_choice() {
    let h = Harness::new(GatewayConfig::default());
    let secret = h.issue("scenario").await;

    let reply = h
        .submit(Envelope::new(chat_body("Hello world", false)).with_bearer(&secret))
        .await
        .unwrap();
    let Dispatch::Blocking(completion) = reply.body else {
        panic!("expected a blocking reply");
    };
    assert_eq!(completion.object, "chat.completion");
    assert!(completion.id.starts_with("chatcmpl-"));
    assert_eq!(completion.choices.len(), 1);
    assert_eq!(completion.choices[0].message.role, Role::Assistant);
    assert!(!completion.content().is_empty());
    assert_eq!(
        completion.usage.total_tokens,
        completion.usage.prompt_tokens + completion.usage.completion_tokens
    );
    assert_eq!(completion.usage.prompt_tokens, 3);

    let records = h.usage.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].token_count, completion.usage.total_tokens);
    assert_eq!(records[0].model, "gpt-4");
}

#[tokio::test(start_paused = true)]
async fn stream_concatenates_to_blocking_content() {
    let h = Harness::new(GatewayConfig::default());
    let secret = h.issue("scenario").await;
    let blocking = blocking_content(&h, &secret, "Hello world").await;

    let events =
        stream_events(&h, Envelope::new(chat_body("Hello world", true)).with_bearer(&secret)).await;
    assert_eq!(events.last(), Some(&StreamEvent::Done));

    let chunks: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Chunk(chunk) => Some(chunk),
            _ => None,
        })
        .collect();
    assert_eq!(chunks.len() + 1, events.len());
    let streamed: String = chunks.iter().filter_map(|c| c.content()).collect();
    assert_eq!(streamed, blocking);

    let (last, earlier) = chunks.split_last().unwrap();
    assert_eq!(last.finish_reason(), Some("stop"));
    assert!(earlier.iter().all(|c| c.finish_reason().is_none()));
    assert!(chunks.iter().all(|c| c.object == "chat.completion.chunk" && c.id == last.id));
}

#[tokio::test(start_paused = true)]
async fn stream_keeps_line_breaks_and_spacing() {
    let text = "Line one.\nLine  two.\n\n\tIndented  end ";
    let h = Harness::with_engine(GatewayConfig::default(), Arc::new(FixedEngine(text)));
    let secret = h.issue("layout").await;
    assert_eq!(blocking_content(&h, &secret, "Hello world").await, text);

    let events =
        stream_events(&h, Envelope::new(chat_body("Hello world", true)).with_bearer(&secret)).await;
    let streamed: String = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Chunk(chunk) => chunk.content(),
            _ => None,
        })
        .collect();
    assert_eq!(streamed, text);
}

#[tokio::test(start_paused = true)]
async fn compute_timeouts_end_in_execution_failure() {
    let mut config = GatewayConfig::default();
    config.queue.max_attempts = 2;
    config.queue.lease_ms = 1_000;
    config.workers.compute_timeout_ms = 1_000;
    config.dispatch.blocking_deadline_ms = 60_000;
    let stuck = MockEngine::new(Duration::from_secs(100), Duration::from_secs(100));
    let h = Harness::with_engine(config, Arc::new(stuck));
    let secret = h.issue("stuck").await;

    let err = h
        .submit(Envelope::new(chat_body("Hello world", false)).with_bearer(&secret))
        .await
        .unwrap_err();
    assert_eq!(err.error.code(), "inference_error");
    assert!(matches!(err.error, GatewayError::ExecutionFailure { attempts: 2, .. }));
    assert_eq!(h.queue.dead_letters().await.unwrap().len(), 1);
    assert!(h.usage.records().is_empty());
}

#[tokio::test(start_paused = true)]
async fn attempt_longer_than_its_lease_completes_once() {
    let mut config = GatewayConfig::default();
    config.queue.max_attempts = 1;
    config.queue.lease_ms = 100;
    config.workers.compute_timeout_ms = 10_000;
    let slow = MockEngine::new(Duration::from_millis(500), Duration::from_millis(500));
    let h = Harness::with_engine(config, Arc::new(slow));
    let secret = h.issue("slow").await;

    let content = blocking_content(&h, &secret, "Hello world").await;
    assert!(!content.is_empty());
    assert!(h.queue.dead_letters().await.unwrap().is_empty());
    let records = h.usage.records();
    assert_eq!(records.len(), 1);
    let status = h.queue.status(&records[0].job_id).await.unwrap().unwrap();
    assert_eq!((status.state, status.attempts_made), (JobState::Completed, 1));
}

#[tokio::test(start_paused = true)]
async fn redelivered_job_records_usage_once() {
    let engine = Arc::new(FlakyEngine::new(1));
    let h = Harness::with_engine(GatewayConfig::default(), engine.clone());
    let secret = h.issue("flaky").await;

    let content = blocking_content(&h, &secret, "Hello world").await;
    assert!(content.contains("(2 words)"));
    assert_eq!(engine.calls(), 2);

    let records = h.usage.records();
    assert_eq!(records.len(), 1);
    let status = h.queue.status(&records[0].job_id).await.unwrap().unwrap();
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.attempts_made, 2);

    let retried = h
        .events
        .events()
        .into_iter()
        .filter(|e| matches!(e, GatewayEvent::Job(JobEvent::AttemptFailed { attempt: 1, .. })))
        .count();
    assert_eq!(retried, 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_surface_as_execution_failure() {
    let engine = Arc::new(FlakyEngine::new(u32::MAX));
    let h = Harness::with_engine(GatewayConfig::default(), engine.clone());
    let secret = h.issue("doomed").await;

    let err = h
        .submit(Envelope::new(chat_body("Hello world", false)).with_bearer(&secret))
        .await
        .unwrap_err();
    assert_eq!(
        err.error,
        GatewayError::ExecutionFailure {
            attempts: 3,
            reason: "inference backend failed: device lost".into()
        }
    );
    assert_eq!(engine.calls(), 3);
    assert!(h.usage.records().is_empty());

    let dead = h.queue.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 3);
}

#[tokio::test(start_paused = true)]
async fn stream_failure_is_reported_in_band() {
    let h = Harness::with_engine(GatewayConfig::default(), Arc::new(FlakyEngine::new(u32::MAX)));
    let secret = h.issue("doomed").await;

    let events =
        stream_events(&h, Envelope::new(chat_body("Hello world", true)).with_bearer(&secret)).await;
    assert_eq!(events.len(), 1);
    let StreamEvent::Error(err) = &events[0] else {
        panic!("expected an in-band error, got {:?}", events);
    };
    assert_eq!(err.code(), "inference_error");
    assert!(h.events.events().iter().any(|e| matches!(
        e,
        GatewayEvent::Dispatch(DispatchEvent::StreamAborted { code: "inference_error", .. })
    )));
}

#[tokio::test(start_paused = true)]
async fn blocking_deadline_leaves_the_job_running() {
    let mut config = GatewayConfig::default();
    config.dispatch.blocking_deadline_ms = 100;
    let slow = MockEngine::new(Duration::from_millis(500), Duration::from_millis(500));
    let h = Harness::with_engine(config, Arc::new(slow));
    let issued = h.gateway.credentials().issue("patient").await.unwrap();

    let err = h
        .submit(
            Envelope::new(chat_body("Hello world", false))
                .with_bearer(&issued.secret)
                .with_idempotency_key("req-1"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.error, GatewayError::Timeout { waited: Duration::from_millis(100) });

    tokio::time::sleep(Duration::from_secs(1)).await;
    let job_id = job_id_for(&issued.credential.id, Some("req-1"));
    let status = h.queue.status(&job_id).await.unwrap().unwrap();
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(h.usage.for_job(&job_id).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn idempotent_resubmission_reuses_the_result() {
    let engine = Arc::new(FlakyEngine::new(0));
    let h = Harness::with_engine(GatewayConfig::default(), engine.clone());
    let secret = h.issue("careful").await;
    let envelope = || {
        Envelope::new(chat_body("Hello world", false))
            .with_bearer(&secret)
            .with_idempotency_key("order-42")
    };

    let first = h.submit(envelope()).await.unwrap();
    let second = h.submit(envelope()).await.unwrap();
    let (Dispatch::Blocking(a), Dispatch::Blocking(b)) = (first.body, second.body) else {
        panic!("expected blocking replies");
    };
    assert_eq!(a.id, b.id);
    assert_eq!(a.content(), b.content());
    assert_eq!(engine.calls(), 1);
    assert_eq!(h.usage.records().len(), 1);
    assert!(h
        .events
        .events()
        .iter()
        .any(|e| matches!(e, GatewayEvent::Job(JobEvent::Deduplicated { .. }))));
}

#[tokio::test]
async fn queue_outage_rejects_submission() {
    let h = Harness::new(GatewayConfig::default());
    let secret = h.issue("unlucky").await;
    h.queue.set_reachable(false);

    let err = h
        .submit(Envelope::new(chat_body("Hello world", false)).with_bearer(&secret))
        .await
        .unwrap_err();
    assert_eq!(err.error.code(), "service_unavailable");
    assert!(err.quota.is_some());
    assert!(!h.gateway.is_queue_reachable().await);
}

#[tokio::test(start_paused = true)]
async fn shutdown_drains_workers() {
    let h = Harness::new(GatewayConfig::default());
    let secret = h.issue("last").await;
    assert!(!blocking_content(&h, &secret, "bye").await.is_empty());
    assert_eq!(h.gateway.worker_count(), 4);
    h.gateway.shutdown().await;
    assert!(h.queue.reserve().await.is_err());
}
