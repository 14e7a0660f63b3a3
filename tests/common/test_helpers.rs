#![allow(dead_code)]

use async_trait::async_trait;
use cloudgate::compute::{ComputeError, InferenceEngine, MockEngine};
use cloudgate::model::ChatCompletionRequest;
use cloudgate::rate_limit::InMemoryCounterStore;
use cloudgate::telemetry::{MemorySink, Telemetry};
use cloudgate::usage::InMemoryUsageRecorder;
use cloudgate::{
    Envelope, Gateway, GatewayConfig, InMemoryCredentialStore, InMemoryJobQueue, InstantSleeper,
    ManualClock, Rejection, Reply,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tower::ServiceExt;

/// 2024-01-01T00:00:00Z, aligned to a 60 s window boundary.
pub const START_MILLIS: u64 = 1_704_067_200_000;

/// A gateway plus handles on every in-memory store behind it.
pub struct Harness {
    pub gateway: Gateway,
    pub clock: Arc<ManualClock>,
    pub credentials: Arc<InMemoryCredentialStore>,
    pub counters: Arc<InMemoryCounterStore>,
    pub queue: Arc<InMemoryJobQueue>,
    pub usage: InMemoryUsageRecorder,
    pub events: MemorySink,
}

impl Harness {
    pub fn new(config: GatewayConfig) -> Self {
        Self::with_engine(config, Arc::new(MockEngine::default()))
    }

    pub fn with_engine(config: GatewayConfig, engine: Arc<dyn InferenceEngine>) -> Self {
        let clock = Arc::new(ManualClock::new(START_MILLIS));
        let credentials = Arc::new(InMemoryCredentialStore::new());
        let counters = Arc::new(InMemoryCounterStore::with_clock(clock.clone()));
        let events = MemorySink::new();
        let telemetry = Telemetry::new(events.clone());
        let queue = Arc::new(
            InMemoryJobQueue::from_config(&config.queue)
                .expect("queue config")
                .with_telemetry(telemetry.clone()),
        );
        let usage = InMemoryUsageRecorder::new();

        let gateway = Gateway::builder(config)
            .credential_store(credentials.clone())
            .counter_store(counters.clone())
            .job_queue(queue.clone())
            .usage_recorder(Arc::new(usage.clone()))
            .engine(engine)
            .clock(clock.clone())
            .sleeper(Arc::new(InstantSleeper))
            .telemetry(telemetry)
            .build()
            .expect("gateway builds");

        Self { gateway, clock, credentials, counters, queue, usage, events }
    }

    /// Issue a credential and return its raw secret.
    pub async fn issue(&self, name: &str) -> String {
        self.gateway.credentials().issue(name).await.expect("issue credential").secret
    }

    pub async fn submit(&self, envelope: Envelope) -> Result<Reply, Rejection> {
        self.gateway.service().oneshot(envelope).await
    }
}

pub fn chat_body(content: &str, stream: bool) -> Value {
    json!({
        "model": "gpt-4",
        "messages": [{"role": "user", "content": content}],
        "stream": stream,
    })
}

pub fn config_with_limit(limit: u32) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.rate_limit.limit = limit;
    config
}

/// Fails the first `failures` calls, then answers like [`MockEngine`].
#[derive(Debug)]
pub struct FlakyEngine {
    failures: AtomicU32,
    calls: AtomicU32,
}

impl FlakyEngine {
    pub fn new(failures: u32) -> Self {
        Self { failures: AtomicU32::new(failures), calls: AtomicU32::new(0) }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceEngine for FlakyEngine {
    async fn complete(&self, request: &ChatCompletionRequest) -> Result<String, ComputeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(ComputeError::Backend("device lost".into()));
        }
        Ok(MockEngine::reply_for(request))
    }
}

/// Answers every request with the same text.
#[derive(Debug, Clone)]
pub struct FixedEngine(pub &'static str);

#[async_trait]
impl InferenceEngine for FixedEngine {
    async fn complete(&self, _request: &ChatCompletionRequest) -> Result<String, ComputeError> {
        Ok(self.0.to_string())
    }
}
