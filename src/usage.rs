//! Append-only usage observations.
//!
//! Records are written once per job, by the attempt that completes it. Aggregation over time
//! buckets belongs to whoever reads the store.
//!
//! A redelivered attempt can reach the recording step after an earlier attempt of the same
//! submission already did, so recorders drop a second record for a submission they have seen. A
//! submission is the job id plus its submission time: once the queue forgets a job, the same
//! idempotency key runs again and is billed again.

use crate::error::StoreError;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageRecord {
    pub principal_id: String,
    /// Job the observation belongs to.
    pub job_id: String,
    /// Unix milliseconds at which the job was submitted.
    pub submitted_at: u64,
    /// Unix milliseconds.
    pub timestamp: u64,
    pub request_count: u32,
    pub token_count: u32,
    #[serde(rename = "latency_ms", serialize_with = "as_millis")]
    pub latency: Duration,
    pub model: String,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

#[async_trait]
pub trait UsageRecorder: Send + Sync + std::fmt::Debug {
    /// Append `record`. Returns `Ok(false)` if the same submission was already recorded.
    async fn record(&self, record: UsageRecord) -> Result<bool, StoreError>;
}

#[derive(Debug, Default)]
struct Log {
    records: Vec<UsageRecord>,
    submissions: HashSet<(String, u64)>,
}

/// Keeps every record in memory, in arrival order.
#[derive(Debug, Clone, Default)]
pub struct InMemoryUsageRecorder {
    log: Arc<Mutex<Log>>,
}

impl InMemoryUsageRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.log.lock().map(|log| log.records.clone()).unwrap_or_default()
    }

    pub fn for_job(&self, job_id: &str) -> Vec<UsageRecord> {
        self.records().into_iter().filter(|r| r.job_id == job_id).collect()
    }

    pub fn for_principal(&self, principal_id: &str) -> Vec<UsageRecord> {
        self.records().into_iter().filter(|r| r.principal_id == principal_id).collect()
    }
}

#[async_trait]
impl UsageRecorder for InMemoryUsageRecorder {
    async fn record(&self, record: UsageRecord) -> Result<bool, StoreError> {
        let mut log =
            self.log.lock().map_err(|_| StoreError::Backend("usage log poisoned".into()))?;
        if !log.submissions.insert((record.job_id.clone(), record.submitted_at)) {
            return Ok(false);
        }
        log.records.push(record);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(principal: &str, job: &str) -> UsageRecord {
        UsageRecord {
            principal_id: principal.into(),
            job_id: job.into(),
            submitted_at: 1,
            timestamp: 1,
            request_count: 1,
            token_count: 10,
            latency: Duration::from_millis(75),
            model: "gpt-4".into(),
        }
    }

    #[tokio::test]
    async fn appends_in_order() {
        let recorder = InMemoryUsageRecorder::new();
        assert!(recorder.record(record("a", "j1")).await.unwrap());
        assert!(recorder.record(record("b", "j2")).await.unwrap());
        assert!(recorder.record(record("a", "j3")).await.unwrap());
        assert!(!recorder.record(record("a", "j3")).await.unwrap());
        assert_eq!(recorder.records().len(), 3);
        assert_eq!(recorder.for_principal("a").len(), 2);
        assert_eq!(recorder.for_job("j2")[0].principal_id, "b");
    }

    #[tokio::test]
    async fn resubmitted_job_is_billed_again() {
        let recorder = InMemoryUsageRecorder::new();
        assert!(recorder.record(record("a", "j1")).await.unwrap());
        let again = UsageRecord { submitted_at: 2, ..record("a", "j1") };
        assert!(recorder.record(again.clone()).await.unwrap());
        assert!(!recorder.record(again).await.unwrap());
        assert_eq!(recorder.for_job("j1").len(), 2);
    }

    #[test]
    fn latency_serializes_as_millis() {
        let json = serde_json::to_value(record("a", "j")).unwrap();
        assert_eq!(json["latency_ms"], 75);
    }
}
