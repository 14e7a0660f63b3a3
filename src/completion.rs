//! Per-job result channels between workers and waiting dispatchers.
//!
//! A dispatcher subscribes to a job id *before* submitting, then awaits a oneshot receiver.
//! Workers publish the final outcome once. Outcomes are cached for a bounded number of jobs so a
//! late or duplicate subscriber is answered immediately. The cache is only a shortcut: the queue
//! keeps the outcome of every retained job, and a dispatcher that hears nothing here asks it.

use crate::model::TokenUsage;
use crate::queue::JobId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

/// Output of a successful attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub content: String,
    pub usage: TokenUsage,
    pub latency: Duration,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed(JobResult),
    /// Every attempt failed; the job is dead-lettered.
    Failed { attempts: u32, reason: String },
}

#[derive(Debug, Default)]
struct Inner {
    waiters: HashMap<JobId, Vec<oneshot::Sender<JobOutcome>>>,
    finished: HashMap<JobId, JobOutcome>,
    order: VecDeque<JobId>,
}

#[derive(Debug, Clone)]
pub struct Completions {
    inner: Arc<Mutex<Inner>>,
    retention: usize,
}

impl Default for Completions {
    fn default() -> Self {
        Self::new(1_000)
    }
}

impl Completions {
    /// `retention` bounds how many finished outcomes are cached.
    pub fn new(retention: usize) -> Self {
        Self { inner: Arc::new(Mutex::new(Inner::default())), retention: retention.max(1) }
    }

    /// Register interest in `job_id`. Resolves immediately if the outcome is already cached.
    pub fn subscribe(&self, job_id: &str) -> oneshot::Receiver<JobOutcome> {
        let (tx, rx) = oneshot::channel();
        let Ok(mut inner) = self.inner.lock() else {
            return rx;
        };
        if let Some(outcome) = inner.finished.get(job_id) {
            let _ = tx.send(outcome.clone());
            return rx;
        }
        let waiters = inner.waiters.entry(job_id.to_string()).or_default();
        waiters.retain(|w| !w.is_closed());
        waiters.push(tx);
        rx
    }

    /// Deliver the outcome of `job_id` to every subscriber.
    ///
    /// The first outcome wins; a later publish for the same job is ignored, so a redelivered
    /// attempt cannot contradict a result callers may already have seen.
    pub fn publish(&self, job_id: &str, outcome: JobOutcome) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.finished.contains_key(job_id) {
            return;
        }
        for waiter in inner.waiters.remove(job_id).unwrap_or_default() {
            let _ = waiter.send(outcome.clone());
        }
        inner.finished.insert(job_id.to_string(), outcome);
        inner.order.push_back(job_id.to_string());
        while inner.order.len() > self.retention {
            if let Some(old) = inner.order.pop_front() {
                inner.finished.remove(&old);
            }
        }
    }

    /// Drop subscribers for a job that will never run (e.g. its submission failed).
    pub fn forget(&self, job_id: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.waiters.remove(job_id);
        }
    }

    /// Drop closed subscriptions for `job_id`, e.g. after a waiter gave up on its deadline.
    pub fn abandon(&self, job_id: &str) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if let Some(waiters) = inner.waiters.get_mut(job_id) {
            waiters.retain(|w| !w.is_closed());
            if waiters.is_empty() {
                inner.waiters.remove(job_id);
            }
        }
    }

    pub fn outcome(&self, job_id: &str) -> Option<JobOutcome> {
        self.inner.lock().ok().and_then(|inner| inner.finished.get(job_id).cloned())
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().map(|inner| inner.waiters.len()).unwrap_or(0)
    }
}
