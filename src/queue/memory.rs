use super::{
    DeadLetter, Delivery, FailureOutcome, Job, JobId, JobQueue, JobState, JobStatus, LeaseToken,
    QueueError, Submission,
};
use crate::completion::{JobOutcome, JobResult};
use crate::config::{ConfigError, QueueConfig};
use crate::retry::{RedeliveryPolicy, RetryDecision};
use crate::telemetry::{GatewayEvent, JobEvent, Telemetry};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Tuning for [`InMemoryJobQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    /// How long a reservation stays valid without an ack or fail.
    pub lease: Duration,
    /// Completed jobs kept for duplicate detection.
    pub completed_retention: usize,
    /// Dead letters kept for inspection.
    pub dead_letter_retention: usize,
}

impl QueueOptions {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            lease: config.lease(),
            completed_retention: config.completed_retention,
            dead_letter_retention: config.dead_letter_retention,
        }
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(30),
            completed_retention: 1_000,
            dead_letter_retention: 5_000,
        }
    }
}

#[derive(Debug)]
struct Entry {
    job: Job,
    state: JobState,
    attempts_made: u32,
    last_error: Option<String>,
    result: Option<JobResult>,
}

impl Entry {
    fn outcome(&self) -> Option<JobOutcome> {
        match self.state {
            JobState::Completed => self.result.clone().map(JobOutcome::Completed),
            JobState::DeadLettered => Some(JobOutcome::Failed {
                attempts: self.attempts_made,
                reason: self.last_error.clone().unwrap_or_default(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    token: u64,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    waiting: VecDeque<JobId>,
    delayed: BTreeMap<(Instant, u64), JobId>,
    active: HashMap<JobId, Lease>,
    jobs: HashMap<JobId, Entry>,
    completed: VecDeque<JobId>,
    dead: VecDeque<JobId>,
    next_seq: u64,
    closed: bool,
}

impl State {
    fn seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Apply the policy to a job whose current attempt just ended badly.
    fn fail_attempt(
        &mut self,
        id: &str,
        reason: String,
        now: Instant,
        policy: &RedeliveryPolicy,
        options: &QueueOptions,
        events: &mut Vec<GatewayEvent>,
    ) -> Option<FailureOutcome> {
        let seq = self.seq();
        let entry = self.jobs.get_mut(id)?;
        entry.last_error = Some(reason);
        let attempts = entry.attempts_made;

        let outcome = match policy.decide(attempts) {
            RetryDecision::Redeliver { delay } => {
                if delay.is_zero() {
                    entry.state = JobState::Waiting;
                    self.waiting.push_back(id.to_string());
                } else {
                    entry.state = JobState::Delayed;
                    self.delayed.insert((now + delay, seq), id.to_string());
                }
                events.push(GatewayEvent::Job(JobEvent::AttemptFailed {
                    job_id: id.to_string(),
                    attempt: attempts,
                    delay,
                }));
                FailureOutcome::Redeliver { next_attempt: attempts + 1, delay }
            }
            RetryDecision::DeadLetter => {
                entry.state = JobState::DeadLettered;
                self.dead.push_back(id.to_string());
                while self.dead.len() > options.dead_letter_retention {
                    if let Some(old) = self.dead.pop_front() {
                        self.jobs.remove(&old);
                    }
                }
                events.push(GatewayEvent::Job(JobEvent::DeadLettered {
                    job_id: id.to_string(),
                    attempts,
                }));
                FailureOutcome::DeadLettered { attempts }
            }
        };
        Some(outcome)
    }

    fn reclaim_expired(
        &mut self,
        now: Instant,
        policy: &RedeliveryPolicy,
        options: &QueueOptions,
        events: &mut Vec<GatewayEvent>,
    ) {
        let expired: Vec<JobId> = self
            .active
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            self.active.remove(&id);
            let attempt = self.jobs.get(&id).map(|e| e.attempts_made).unwrap_or_default();
            tracing::warn!(job_id = %id, attempt, "lease expired");
            events.push(GatewayEvent::Job(JobEvent::LeaseExpired { job_id: id.clone(), attempt }));
            self.fail_attempt(&id, "lease expired".into(), now, policy, options, events);
        }
    }

    fn promote_delayed(&mut self, now: Instant) {
        while let Some(entry) = self.delayed.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let id = entry.remove();
            if let Some(job) = self.jobs.get_mut(&id) {
                job.state = JobState::Waiting;
                self.waiting.push_back(id);
            }
        }
    }

    fn lease_next(&mut self, now: Instant, lease: Duration) -> Option<Delivery> {
        while let Some(id) = self.waiting.pop_front() {
            let token = self.seq();
            let Some(entry) = self.jobs.get_mut(&id) else {
                continue;
            };
            entry.state = JobState::Active;
            entry.attempts_made += 1;
            let delivery = Delivery {
                job: entry.job.clone(),
                attempt: entry.attempts_made,
                lease: LeaseToken(token),
            };
            self.active.insert(id, Lease { token, expires_at: now + lease });
            return Some(delivery);
        }
        None
    }

    fn next_wake(&self) -> Option<Instant> {
        let delayed = self.delayed.keys().next().map(|(at, _)| *at);
        let lease = self.active.values().map(|l| l.expires_at).min();
        match (delayed, lease) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Check that `delivery` still holds an unexpired lease. An expired one is reclaimed here.
    fn check_lease(
        &mut self,
        delivery: &Delivery,
        now: Instant,
        policy: &RedeliveryPolicy,
        options: &QueueOptions,
        events: &mut Vec<GatewayEvent>,
    ) -> Result<(), QueueError> {
        let id = &delivery.job.id;
        let stale = || QueueError::StaleLease(id.clone());
        let lease = *self.active.get(id).ok_or_else(stale)?;
        if lease.token != delivery.lease.0 {
            return Err(stale());
        }
        if lease.expires_at <= now {
            self.active.remove(id);
            events.push(GatewayEvent::Job(JobEvent::LeaseExpired {
                job_id: id.clone(),
                attempt: delivery.attempt,
            }));
            self.fail_attempt(id, "lease expired".into(), now, policy, options, events);
            return Err(stale());
        }
        Ok(())
    }

    /// Remove the lease if `delivery` still holds it and it has not expired.
    fn release(
        &mut self,
        delivery: &Delivery,
        now: Instant,
        policy: &RedeliveryPolicy,
        options: &QueueOptions,
        events: &mut Vec<GatewayEvent>,
    ) -> Result<(), QueueError> {
        self.check_lease(delivery, now, policy, options, events)?;
        self.active.remove(&delivery.job.id);
        Ok(())
    }
}

/// Process-local [`JobQueue`].
///
/// Timing uses tokio's clock, so tests running with paused time see backoff delays and lease
/// expiry advance automatically.
#[derive(Debug, Clone)]
pub struct InMemoryJobQueue {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
    policy: RedeliveryPolicy,
    options: QueueOptions,
    telemetry: Telemetry,
    reachable: Arc<AtomicBool>,
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new(RedeliveryPolicy::default(), QueueOptions::default())
    }
}

impl InMemoryJobQueue {
    pub fn new(policy: RedeliveryPolicy, options: QueueOptions) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            notify: Arc::new(Notify::new()),
            policy,
            options,
            telemetry: Telemetry::default(),
            reachable: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn from_config(config: &QueueConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(config.redelivery_policy()?, QueueOptions::from_config(config)))
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn policy(&self) -> &RedeliveryPolicy {
        &self.policy
    }

    /// Simulate a broker outage for submitters and probes.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), QueueError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueueError::Unavailable("job queue offline".into()))
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, QueueError> {
        self.state.lock().map_err(|_| QueueError::Unavailable("queue state poisoned".into()))
    }

    async fn emit_all(&self, events: Vec<GatewayEvent>) {
        for event in events {
            self.telemetry.emit(event).await;
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn submit(&self, job: Job) -> Result<Submission, QueueError> {
        self.check()?;
        let job_id = job.id.clone();
        let submission = {
            let mut guard = self.lock()?;
            let st = &mut *guard;
            if st.closed {
                return Err(QueueError::Closed);
            }
            if st.jobs.contains_key(&job.id) {
                Submission::Duplicate
            } else {
                st.waiting.push_back(job.id.clone());
                st.jobs.insert(
                    job.id.clone(),
                    Entry {
                        job,
                        state: JobState::Waiting,
                        attempts_made: 0,
                        last_error: None,
                        result: None,
                    },
                );
                Submission::Enqueued
            }
        };
        let event = match submission {
            Submission::Enqueued => {
                self.notify.notify_waiters();
                JobEvent::Submitted { job_id }
            }
            Submission::Duplicate => JobEvent::Deduplicated { job_id },
        };
        self.telemetry.emit(GatewayEvent::Job(event)).await;
        Ok(submission)
    }

    async fn reserve(&self) -> Result<Delivery, QueueError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut events = Vec::new();
            let step = {
                let mut guard = self.lock()?;
                let st = &mut *guard;
                if st.closed {
                    return Err(QueueError::Closed);
                }
                let now = Instant::now();
                st.reclaim_expired(now, &self.policy, &self.options, &mut events);
                st.promote_delayed(now);
                if events.is_empty() {
                    // Nothing to report, so the lease can be handed out without another await.
                    match st.lease_next(now, self.options.lease) {
                        Some(delivery) => return Ok(delivery),
                        None => Some(st.next_wake()),
                    }
                } else {
                    None
                }
            };

            match step {
                None => self.emit_all(events).await,
                Some(Some(at)) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                Some(None) => notified.await,
            }
        }
    }

    async fn extend(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut events = Vec::new();
        let result = {
            let mut guard = self.lock()?;
            let st = &mut *guard;
            let now = Instant::now();
            st.check_lease(delivery, now, &self.policy, &self.options, &mut events).map(|()| {
                if let Some(lease) = st.active.get_mut(&delivery.job.id) {
                    lease.expires_at = now + self.options.lease;
                }
            })
        };
        if !events.is_empty() {
            self.notify.notify_waiters();
        }
        self.emit_all(events).await;
        result
    }

    async fn ack(&self, delivery: &Delivery, result: &JobResult) -> Result<(), QueueError> {
        let mut events = Vec::new();
        let acked = {
            let mut guard = self.lock()?;
            let st = &mut *guard;
            let now = Instant::now();
            let released = st.release(delivery, now, &self.policy, &self.options, &mut events);
            if released.is_ok() {
                let id = delivery.job.id.clone();
                if let Some(entry) = st.jobs.get_mut(&id) {
                    entry.state = JobState::Completed;
                    entry.result = Some(result.clone());
                }
                st.completed.push_back(id);
                while st.completed.len() > self.options.completed_retention {
                    if let Some(old) = st.completed.pop_front() {
                        st.jobs.remove(&old);
                    }
                }
            }
            released
        };
        if !events.is_empty() {
            self.notify.notify_waiters();
        }
        self.emit_all(events).await;
        acked
    }

    async fn fail(&self, delivery: &Delivery, reason: &str) -> Result<FailureOutcome, QueueError> {
        let mut events = Vec::new();
        let result = {
            let mut guard = self.lock()?;
            let st = &mut *guard;
            let now = Instant::now();
            st.release(delivery, now, &self.policy, &self.options, &mut events).and_then(|()| {
                st.fail_attempt(
                    &delivery.job.id,
                    reason.to_string(),
                    now,
                    &self.policy,
                    &self.options,
                    &mut events,
                )
                .ok_or_else(|| QueueError::StaleLease(delivery.job.id.clone()))
            })
        };
        match &result {
            Ok(FailureOutcome::DeadLettered { attempts }) => {
                tracing::warn!(job_id = %delivery.job.id, attempts, reason, "job dead-lettered");
            }
            Ok(FailureOutcome::Redeliver { next_attempt, delay }) => {
                tracing::debug!(job_id = %delivery.job.id, next_attempt, ?delay, reason, "job scheduled for redelivery");
            }
            Err(_) => {}
        }
        self.notify.notify_waiters();
        self.emit_all(events).await;
        result
    }

    async fn status(&self, id: &str) -> Result<Option<JobStatus>, QueueError> {
        self.check()?;
        let guard = self.lock()?;
        Ok(guard.jobs.get(id).map(|e| JobStatus {
            state: e.state,
            attempts_made: e.attempts_made,
            last_error: e.last_error.clone(),
        }))
    }

    async fn outcome(&self, id: &str) -> Result<Option<JobOutcome>, QueueError> {
        self.check()?;
        let guard = self.lock()?;
        Ok(guard.jobs.get(id).and_then(Entry::outcome))
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        self.check()?;
        let guard = self.lock()?;
        Ok(guard
            .dead
            .iter()
            .filter_map(|id| guard.jobs.get(id))
            .map(|e| DeadLetter {
                job: e.job.clone(),
                attempts: e.attempts_made,
                reason: e.last_error.clone().unwrap_or_default(),
            })
            .collect())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        self.check()?;
        self.lock().map(|_| ())
    }

    async fn close(&self) {
        if let Ok(mut guard) = self.state.lock() {
            guard.closed = true;
        }
        self.notify.notify_waiters();
    }
}
