//! Durable job queue shared by every process pointed at the same Redis and key prefix.
//!
//! | Key | Type | Holds |
//! |-----|------|-------|
//! | `{prefix}:job:{id}` | hash | `job` JSON, `state`, `attempts`, `token`, `last_error`, `result` JSON |
//! | `{prefix}:waiting` | list | ids ready to run, oldest first |
//! | `{prefix}:delayed` | zset | ids waiting out a backoff, scored by due time in ms |
//! | `{prefix}:active` | zset | leased ids, scored by lease expiry in ms |
//! | `{prefix}:completed`, `{prefix}:dead` | list | retained terminal ids, oldest first |
//! | `{prefix}:seq` | string | lease token counter |
//!
//! Every transition is one Lua script, so two processes never hold a lease on the same job.
//! Redelivery delays come from the local [`RedeliveryPolicy`] and travel to the scripts as a
//! table of per-attempt delays; processes sharing a prefix must share the policy.

use async_trait::async_trait;
use cloudgate::clock::{Clock, SystemClock};
use cloudgate::completion::{JobOutcome, JobResult};
use cloudgate::queue::{
    DeadLetter, Delivery, FailureOutcome, Job, JobQueue, JobState, JobStatus, LeaseToken,
    QueueError, QueueOptions, Submission,
};
use cloudgate::retry::{RedeliveryPolicy, RetryDecision};
use cloudgate::telemetry::{GatewayEvent, JobEvent, Telemetry};
use redis::aio::ConnectionManager;
use redis::{RedisError, Script, ScriptInvocation};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_PREFIX: &str = "cloudgate:queue";

/// Idle wait between empty reservations.
const RESERVE_POLL: Duration = Duration::from_millis(100);

// Shared by every script.
//   KEYS: job prefix, waiting, delayed, active, completed, dead, seq
//   ARGV: now ms, completed retention, dead-letter retention, max attempts, delay table,
//         then script arguments from ARGV[6]
const PRELUDE: &str = r#"
local function delay_for(attempt)
  local i = 0
  for d in string.gmatch(ARGV[5], '%d+') do
    i = i + 1
    if i == attempt then return tonumber(d) end
  end
  return 0
end

local function trim(list, keep)
  while redis.call('LLEN', list) > tonumber(keep) do
    redis.call('DEL', KEYS[1] .. redis.call('LPOP', list))
  end
end

local function fail_attempt(id, reason)
  local key = KEYS[1] .. id
  local attempts = tonumber(redis.call('HGET', key, 'attempts') or '0')
  redis.call('HSET', key, 'last_error', reason)
  if attempts < tonumber(ARGV[4]) then
    local delay = delay_for(attempts)
    if delay > 0 then
      redis.call('HSET', key, 'state', 'delayed')
      redis.call('ZADD', KEYS[3], tonumber(ARGV[1]) + delay, id)
    else
      redis.call('HSET', key, 'state', 'waiting')
      redis.call('RPUSH', KEYS[2], id)
    end
    return {'redeliver', attempts, delay}
  end
  redis.call('HSET', key, 'state', 'dead_lettered')
  redis.call('RPUSH', KEYS[6], id)
  trim(KEYS[6], ARGV[3])
  return {'dead_lettered', attempts, 0}
end

local function check_lease(id, token)
  if redis.call('HGET', KEYS[1] .. id, 'token') ~= token then return false end
  local expires = redis.call('ZSCORE', KEYS[4], id)
  if not expires then return false end
  if tonumber(expires) <= tonumber(ARGV[1]) then
    redis.call('ZREM', KEYS[4], id)
    fail_attempt(id, 'lease expired')
    return false
  end
  return true
end
"#;

// ARGV[6] id, ARGV[7] job JSON
const SUBMIT: &str = r#"
local key = KEYS[1] .. ARGV[6]
if redis.call('EXISTS', key) == 1 then return 0 end
redis.call('HSET', key, 'job', ARGV[7], 'state', 'waiting', 'attempts', 0)
redis.call('RPUSH', KEYS[2], ARGV[6])
return 1
"#;

// Returns flat (id, attempts) pairs for jobs dead-lettered by expiry.
const RECLAIM: &str = r#"
local dead = {}
for _, id in ipairs(redis.call('ZRANGEBYSCORE', KEYS[4], '-inf', ARGV[1])) do
  redis.call('ZREM', KEYS[4], id)
  local outcome = fail_attempt(id, 'lease expired')
  if outcome[1] == 'dead_lettered' then
    table.insert(dead, id)
    table.insert(dead, outcome[2])
  end
end
for _, id in ipairs(redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', ARGV[1])) do
  redis.call('ZREM', KEYS[3], id)
  if redis.call('EXISTS', KEYS[1] .. id) == 1 then
    redis.call('HSET', KEYS[1] .. id, 'state', 'waiting')
    redis.call('RPUSH', KEYS[2], id)
  end
end
return dead
"#;

// ARGV[6] lease ms
const TAKE: &str = r#"
while true do
  local id = redis.call('LPOP', KEYS[2])
  if not id then return false end
  local key = KEYS[1] .. id
  if redis.call('EXISTS', key) == 1 then
    local attempts = redis.call('HINCRBY', key, 'attempts', 1)
    local token = redis.call('INCR', KEYS[7])
    redis.call('HSET', key, 'state', 'active', 'token', token)
    redis.call('ZADD', KEYS[4], tonumber(ARGV[1]) + tonumber(ARGV[6]), id)
    return {id, redis.call('HGET', key, 'job'), attempts, token}
  end
end
"#;

// ARGV[6] id, ARGV[7] token, ARGV[8] lease ms
const EXTEND: &str = r#"
if not check_lease(ARGV[6], ARGV[7]) then return 0 end
redis.call('ZADD', KEYS[4], tonumber(ARGV[1]) + tonumber(ARGV[8]), ARGV[6])
return 1
"#;

// ARGV[6] id, ARGV[7] token, ARGV[8] result JSON
const ACK: &str = r#"
if not check_lease(ARGV[6], ARGV[7]) then return 0 end
redis.call('ZREM', KEYS[4], ARGV[6])
redis.call('HSET', KEYS[1] .. ARGV[6], 'state', 'completed', 'result', ARGV[8])
redis.call('RPUSH', KEYS[5], ARGV[6])
trim(KEYS[5], ARGV[2])
return 1
"#;

// ARGV[6] id, ARGV[7] token, ARGV[8] reason
const FAIL: &str = r#"
if not check_lease(ARGV[6], ARGV[7]) then return false end
redis.call('ZREM', KEYS[4], ARGV[6])
return fail_attempt(ARGV[6], ARGV[8])
"#;

/// Per-attempt redelivery delays in ms, comma separated, for attempts `1..max_attempts`.
pub fn delay_table(policy: &RedeliveryPolicy) -> String {
    (1..policy.max_attempts())
        .map(|attempt| match policy.decide(attempt) {
            RetryDecision::Redeliver { delay } => delay.as_millis().to_string(),
            RetryDecision::DeadLetter => "0".to_string(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

struct Scripts {
    submit: Script,
    reclaim: Script,
    take: Script,
    extend: Script,
    ack: Script,
    fail: Script,
}

impl Scripts {
    fn new() -> Self {
        let with_prelude = |body: &str| Script::new(&format!("{}{}", PRELUDE, body));
        Self {
            submit: with_prelude(SUBMIT),
            reclaim: with_prelude(RECLAIM),
            take: with_prelude(TAKE),
            extend: with_prelude(EXTEND),
            ack: with_prelude(ACK),
            fail: with_prelude(FAIL),
        }
    }
}

#[derive(Debug, Clone)]
struct Keys {
    job: String,
    waiting: String,
    delayed: String,
    active: String,
    completed: String,
    dead: String,
    seq: String,
}

impl Keys {
    fn new(prefix: &str) -> Self {
        Self {
            job: format!("{}:job:", prefix),
            waiting: format!("{}:waiting", prefix),
            delayed: format!("{}:delayed", prefix),
            active: format!("{}:active", prefix),
            completed: format!("{}:completed", prefix),
            dead: format!("{}:dead", prefix),
            seq: format!("{}:seq", prefix),
        }
    }

    fn all(&self) -> [&str; 7] {
        [
            self.job.as_str(),
            self.waiting.as_str(),
            self.delayed.as_str(),
            self.active.as_str(),
            self.completed.as_str(),
            self.dead.as_str(),
            self.seq.as_str(),
        ]
    }
}

/// [`JobQueue`] kept in Redis.
///
/// Idle reservations poll every 100 ms. [`JobQueue::close`] only stops this handle; other
/// processes keep draining the queue.
#[derive(Clone)]
pub struct RedisJobQueue {
    conn: ConnectionManager,
    scripts: Arc<Scripts>,
    keys: Keys,
    max_attempts: u32,
    delays: String,
    options: QueueOptions,
    clock: Arc<dyn Clock>,
    telemetry: Telemetry,
    closed: Arc<AtomicBool>,
}

impl fmt::Debug for RedisJobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisJobQueue")
            .field("keys", &self.keys)
            .field("max_attempts", &self.max_attempts)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl RedisJobQueue {
    pub async fn connect(
        url: &str,
        policy: RedeliveryPolicy,
        options: QueueOptions,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(url).map_err(to_queue_error)?;
        let conn = ConnectionManager::new(client).await.map_err(to_queue_error)?;
        Ok(Self {
            conn,
            scripts: Arc::new(Scripts::new()),
            keys: Keys::new(DEFAULT_PREFIX),
            max_attempts: policy.max_attempts(),
            delays: delay_table(&policy),
            options,
            clock: Arc::new(SystemClock),
            telemetry: Telemetry::default(),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Keep this queue's keys under `prefix` instead of [`DEFAULT_PREFIX`].
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.keys = Keys::new(prefix);
        self
    }

    /// Source of lease and delay timestamps. Processes sharing a queue need roughly agreeing
    /// clocks.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    fn invocation<'a>(&'a self, script: &'a Script) -> ScriptInvocation<'a> {
        let mut invocation = script.prepare_invoke();
        for key in self.keys.all() {
            invocation.key(key);
        }
        invocation
            .arg(self.clock.now_millis())
            .arg(self.options.completed_retention)
            .arg(self.options.dead_letter_retention)
            .arg(self.max_attempts)
            .arg(&self.delays);
        invocation
    }

    fn lease_ms(&self) -> u64 {
        u64::try_from(self.options.lease.as_millis()).unwrap_or(u64::MAX)
    }

    fn job_key(&self, id: &str) -> String {
        format!("{}{}", self.keys.job, id)
    }

    async fn reclaim(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let dead: Vec<(String, u32)> = self
            .invocation(&self.scripts.reclaim)
            .invoke_async(&mut conn)
            .await
            .map_err(to_queue_error)?;
        for (job_id, attempts) in dead {
            tracing::warn!(job_id = %job_id, attempts, "lease expired; job dead-lettered");
            self.telemetry.emit(GatewayEvent::Job(JobEvent::DeadLettered { job_id, attempts })).await;
        }
        Ok(())
    }

    async fn take(&self) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.invocation(&self.scripts.take);
        invocation.arg(self.lease_ms());
        let taken: Option<(String, String, u32, u64)> =
            invocation.invoke_async(&mut conn).await.map_err(to_queue_error)?;
        let Some((id, raw, attempt, token)) = taken else {
            return Ok(None);
        };
        let job: Job = serde_json::from_str(&raw)
            .map_err(|err| QueueError::Unavailable(format!("corrupt job {}: {}", id, err)))?;
        Ok(Some(Delivery { job, attempt, lease: LeaseToken::new(token) }))
    }
}

fn to_queue_error(err: RedisError) -> QueueError {
    QueueError::Unavailable(err.to_string())
}

fn parse_state(raw: &str) -> Result<JobState, QueueError> {
    match raw {
        "waiting" => Ok(JobState::Waiting),
        "delayed" => Ok(JobState::Delayed),
        "active" => Ok(JobState::Active),
        "completed" => Ok(JobState::Completed),
        "dead_lettered" => Ok(JobState::DeadLettered),
        other => Err(QueueError::Unavailable(format!("unknown job state {:?}", other))),
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn submit(&self, job: Job) -> Result<Submission, QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        let raw = serde_json::to_string(&job)
            .map_err(|err| QueueError::Unavailable(format!("job encoding failed: {}", err)))?;
        let mut conn = self.conn.clone();
        let mut invocation = self.invocation(&self.scripts.submit);
        invocation.arg(&job.id).arg(raw);
        let created: u32 = invocation.invoke_async(&mut conn).await.map_err(to_queue_error)?;

        let job_id = job.id;
        let (submission, event) = if created == 1 {
            (Submission::Enqueued, JobEvent::Submitted { job_id })
        } else {
            (Submission::Duplicate, JobEvent::Deduplicated { job_id })
        };
        self.telemetry.emit(GatewayEvent::Job(event)).await;
        Ok(submission)
    }

    async fn reserve(&self) -> Result<Delivery, QueueError> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(QueueError::Closed);
            }
            self.reclaim().await?;
            if let Some(delivery) = self.take().await? {
                return Ok(delivery);
            }
            tokio::time::sleep(RESERVE_POLL).await;
        }
    }

    async fn extend(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.invocation(&self.scripts.extend);
        invocation.arg(&delivery.job.id).arg(delivery.lease.raw()).arg(self.lease_ms());
        let extended: u32 = invocation.invoke_async(&mut conn).await.map_err(to_queue_error)?;
        if extended == 1 {
            Ok(())
        } else {
            Err(QueueError::StaleLease(delivery.job.id.clone()))
        }
    }

    async fn ack(&self, delivery: &Delivery, result: &JobResult) -> Result<(), QueueError> {
        let raw = serde_json::to_string(result)
            .map_err(|err| QueueError::Unavailable(format!("result encoding failed: {}", err)))?;
        let mut conn = self.conn.clone();
        let mut invocation = self.invocation(&self.scripts.ack);
        invocation.arg(&delivery.job.id).arg(delivery.lease.raw()).arg(raw);
        let acked: u32 = invocation.invoke_async(&mut conn).await.map_err(to_queue_error)?;
        if acked == 1 {
            Ok(())
        } else {
            Err(QueueError::StaleLease(delivery.job.id.clone()))
        }
    }

    async fn fail(&self, delivery: &Delivery, reason: &str) -> Result<FailureOutcome, QueueError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.invocation(&self.scripts.fail);
        invocation.arg(&delivery.job.id).arg(delivery.lease.raw()).arg(reason);
        let failed: Option<(String, u32, u64)> =
            invocation.invoke_async(&mut conn).await.map_err(to_queue_error)?;
        let Some((kind, attempts, delay_ms)) = failed else {
            return Err(QueueError::StaleLease(delivery.job.id.clone()));
        };

        let job_id = delivery.job.id.clone();
        let (outcome, event) = if kind == "dead_lettered" {
            tracing::warn!(job_id = %job_id, attempts, reason, "job dead-lettered");
            (FailureOutcome::DeadLettered { attempts }, JobEvent::DeadLettered { job_id, attempts })
        } else {
            let delay = Duration::from_millis(delay_ms);
            (
                FailureOutcome::Redeliver { next_attempt: attempts + 1, delay },
                JobEvent::AttemptFailed { job_id, attempt: attempts, delay },
            )
        };
        self.telemetry.emit(GatewayEvent::Job(event)).await;
        Ok(outcome)
    }

    async fn status(&self, id: &str) -> Result<Option<JobStatus>, QueueError> {
        let mut conn = self.conn.clone();
        let (state, attempts, last_error): (Option<String>, Option<u32>, Option<String>) =
            redis::cmd("HMGET")
                .arg(self.job_key(id))
                .arg("state")
                .arg("attempts")
                .arg("last_error")
                .query_async(&mut conn)
                .await
                .map_err(to_queue_error)?;
        let Some(state) = state else {
            return Ok(None);
        };
        Ok(Some(JobStatus {
            state: parse_state(&state)?,
            attempts_made: attempts.unwrap_or_default(),
            last_error,
        }))
    }

    async fn outcome(&self, id: &str) -> Result<Option<JobOutcome>, QueueError> {
        let mut conn = self.conn.clone();
        let (state, attempts, last_error, result): (
            Option<String>,
            Option<u32>,
            Option<String>,
            Option<String>,
        ) = redis::cmd("HMGET")
            .arg(self.job_key(id))
            .arg("state")
            .arg("attempts")
            .arg("last_error")
            .arg("result")
            .query_async(&mut conn)
            .await
            .map_err(to_queue_error)?;
        match (state.as_deref(), result) {
            (Some("completed"), Some(raw)) => serde_json::from_str(&raw)
                .map(|result| Some(JobOutcome::Completed(result)))
                .map_err(|err| QueueError::Unavailable(format!("corrupt result for {}: {}", id, err))),
            (Some("dead_lettered"), _) => Ok(Some(JobOutcome::Failed {
                attempts: attempts.unwrap_or_default(),
                reason: last_error.unwrap_or_default(),
            })),
            _ => Ok(None),
        }
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("LRANGE")
            .arg(&self.keys.dead)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(to_queue_error)?;
        let mut dead = Vec::with_capacity(ids.len());
        for id in ids {
            let (raw, attempts, reason): (Option<String>, Option<u32>, Option<String>) =
                redis::cmd("HMGET")
                    .arg(self.job_key(&id))
                    .arg("job")
                    .arg("attempts")
                    .arg("last_error")
                    .query_async(&mut conn)
                    .await
                    .map_err(to_queue_error)?;
            // Trimmed by another process between the two reads.
            let Some(raw) = raw else {
                continue;
            };
            let job = serde_json::from_str(&raw)
                .map_err(|err| QueueError::Unavailable(format!("corrupt job {}: {}", id, err)))?;
            dead.push(DeadLetter {
                job,
                attempts: attempts.unwrap_or_default(),
                reason: reason.unwrap_or_default(),
            });
        }
        Ok(dead)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let reply: String = redis::cmd("PING").query_async(&mut conn).await.map_err(to_queue_error)?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(QueueError::Unavailable(format!("unexpected PING reply: {}", reply)))
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudgate::Backoff;

    #[test]
    fn delays_follow_the_policy() {
        assert_eq!(delay_table(&RedeliveryPolicy::default()), "1000,2000");
        let single = RedeliveryPolicy::builder().max_attempts(1).build().unwrap();
        assert_eq!(delay_table(&single), "");
        let fixed = RedeliveryPolicy::builder()
            .max_attempts(4)
            .backoff(Backoff::fixed(Duration::from_millis(250)))
            .build()
            .unwrap();
        assert_eq!(delay_table(&fixed), "250,250,250");
    }

    #[test]
    fn keys_share_the_prefix() {
        let keys = Keys::new("q");
        assert_eq!(keys.all(), ["q:job:", "q:waiting", "q:delayed", "q:active", "q:completed", "q:dead", "q:seq"]);
    }

    #[test]
    fn states_parse_like_they_serialize() {
        for state in [
            JobState::Waiting,
            JobState::Delayed,
            JobState::Active,
            JobState::Completed,
            JobState::DeadLettered,
        ] {
            let raw = serde_json::to_value(state).unwrap();
            assert_eq!(parse_state(raw.as_str().unwrap()).unwrap(), state);
        }
        assert!(parse_state("lost").is_err());
    }
}
