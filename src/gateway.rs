//! Wiring of the submission path and the worker pool.
//!
//! ```text
//! Envelope → AdmissionService → RateLimitService → Dispatcher → JobQueue ⇢ WorkerPool
//! ```
//!
//! Every store is pluggable through [`GatewayBuilder`]; [`Gateway::in_memory`] uses the
//! in-process implementations for each one.

use crate::auth::{AdmissionGate, AdmissionLayer, AdmissionService};
use crate::clock::{Clock, SystemClock};
use crate::completion::Completions;
use crate::compute::{InferenceEngine, MockEngine};
use crate::config::{ConfigError, ErrorDetail, GatewayConfig, RateLimitConfig};
use crate::credential::{CredentialStore, InMemoryCredentialStore, Keyring};
use crate::dispatch::Dispatcher;
use crate::dynamic::DynamicConfig;
use crate::health::HealthReport;
use crate::queue::{InMemoryJobQueue, JobQueue};
use crate::rate_limit::{
    CounterStore, FixedWindow, InMemoryCounterStore, RateLimitLayer, RateLimitService,
};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::Telemetry;
use crate::usage::{InMemoryUsageRecorder, UsageRecorder};
use crate::worker::{WorkerContext, WorkerPool};
use std::sync::Arc;
use tower::ServiceBuilder;

/// The composed submission service.
pub type GatewayService = AdmissionService<RateLimitService<Dispatcher>>;

/// Running gateway: the submission service plus the workers draining its queue.
#[derive(Debug)]
pub struct Gateway {
    service: GatewayService,
    keyring: Keyring,
    credentials: Arc<dyn CredentialStore>,
    counters: Arc<dyn CounterStore>,
    queue: Arc<dyn JobQueue>,
    usage: Arc<dyn UsageRecorder>,
    rate_limit: DynamicConfig<RateLimitConfig>,
    error_detail: ErrorDetail,
    workers: WorkerPool,
}

impl Gateway {
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    /// Gateway backed entirely by in-process stores and the simulated engine.
    pub fn in_memory(config: GatewayConfig) -> Result<Self, ConfigError> {
        GatewayBuilder::new(config).build()
    }

    /// Service to drive with [`Envelope`](crate::Envelope)s. Cheap to clone.
    pub fn service(&self) -> GatewayService {
        self.service.clone()
    }

    pub fn credentials(&self) -> &Keyring {
        &self.keyring
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub fn usage(&self) -> &Arc<dyn UsageRecorder> {
        &self.usage
    }

    /// Live rate-limit settings; updates apply to the next admitted request.
    pub fn rate_limit(&self) -> &DynamicConfig<RateLimitConfig> {
        &self.rate_limit
    }

    pub fn error_detail(&self) -> ErrorDetail {
        self.error_detail
    }

    pub fn worker_count(&self) -> usize {
        self.workers.size()
    }

    pub async fn is_queue_reachable(&self) -> bool {
        self.queue.ping().await.is_ok()
    }

    pub async fn is_credential_store_reachable(&self) -> bool {
        self.credentials.ping().await.is_ok()
    }

    /// Check every dependency once.
    pub async fn health(&self) -> HealthReport {
        let (queue, credentials, counters) = futures::join!(
            self.queue.ping(),
            self.credentials.ping(),
            self.counters.ping(),
        );
        HealthReport::from_probes([
            ("job_queue", queue.is_ok()),
            ("credential_store", credentials.is_ok()),
            ("counter_store", counters.is_ok()),
        ])
    }

    /// Stop accepting jobs, close the queue, and wait for in-flight attempts.
    pub async fn shutdown(self) {
        tracing::info!("gateway shutting down");
        self.queue.close().await;
        self.workers.shutdown().await;
    }
}

/// Builder for [`Gateway`]. Anything not set falls back to its in-memory default.
pub struct GatewayBuilder {
    config: GatewayConfig,
    credentials: Option<Arc<dyn CredentialStore>>,
    counters: Option<Arc<dyn CounterStore>>,
    queue: Option<Arc<dyn JobQueue>>,
    usage: Option<Arc<dyn UsageRecorder>>,
    engine: Option<Arc<dyn InferenceEngine>>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    telemetry: Telemetry,
}

impl GatewayBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            credentials: None,
            counters: None,
            queue: None,
            usage: None,
            engine: None,
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
            telemetry: Telemetry::default(),
        }
    }

    pub fn credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(store);
        self
    }

    pub fn counter_store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.counters = Some(store);
        self
    }

    pub fn job_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn usage_recorder(mut self, usage: Arc<dyn UsageRecorder>) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn engine(mut self, engine: Arc<dyn InferenceEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Validate the configuration, wire the service, and start the workers.
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Result<Gateway, ConfigError> {
        let config = self.config;
        config.validate()?;

        let credentials: Arc<dyn CredentialStore> = match self.credentials {
            Some(store) => store,
            None => Arc::new(InMemoryCredentialStore::new()),
        };
        let counters: Arc<dyn CounterStore> = match self.counters {
            Some(store) => store,
            None => Arc::new(InMemoryCounterStore::with_clock(self.clock.clone())),
        };
        let queue: Arc<dyn JobQueue> = match self.queue {
            Some(queue) => queue,
            None => Arc::new(
                InMemoryJobQueue::from_config(&config.queue)?
                    .with_telemetry(self.telemetry.clone()),
            ),
        };
        let usage: Arc<dyn UsageRecorder> = match self.usage {
            Some(usage) => usage,
            None => Arc::new(InMemoryUsageRecorder::new()),
        };
        let engine: Arc<dyn InferenceEngine> = match self.engine {
            Some(engine) => engine,
            None => Arc::new(MockEngine::default()),
        };
        let completions = Completions::new(config.queue.completed_retention);

        let keyring = Keyring::with_clock(credentials.clone(), self.clock.clone());
        let gate = AdmissionGate::new(keyring.clone()).with_telemetry(self.telemetry.clone());
        let rate_limit = DynamicConfig::new(config.rate_limit);
        let limiter = FixedWindow::new(counters.clone(), rate_limit.clone())
            .with_clock(self.clock.clone())
            .with_telemetry(self.telemetry.clone());
        let dispatcher = Dispatcher::new(queue.clone(), completions.clone(), &config.dispatch)
            .with_clock(self.clock.clone())
            .with_sleeper(self.sleeper)
            .with_telemetry(self.telemetry.clone());

        let service = ServiceBuilder::new()
            .layer(AdmissionLayer::new(gate))
            .layer(RateLimitLayer::new(limiter))
            .service(dispatcher);

        let context = WorkerContext::new(queue.clone(), engine, usage.clone(), completions)
            .with_compute_timeout(config.workers.compute_timeout())
            .with_lease_renewal(config.queue.lease_renewal())
            .with_clock(self.clock)
            .with_telemetry(self.telemetry);
        let workers = WorkerPool::spawn(config.workers.concurrency, context);
        tracing::info!(
            workers = workers.size(),
            limit = config.rate_limit.limit,
            window_secs = config.rate_limit.window_secs,
            "gateway started"
        );

        Ok(Gateway {
            service,
            keyring,
            credentials,
            counters,
            queue,
            usage,
            rate_limit,
            error_detail: config.server.error_detail,
            workers,
        })
    }
}
