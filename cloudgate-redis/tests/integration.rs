use cloudgate::completion::{JobOutcome, JobResult};
use cloudgate::model::{ChatCompletionRequest, ChatMessage, TokenUsage};
use cloudgate::queue::{FailureOutcome, Job, JobQueue, JobState, QueueError, QueueOptions, Submission};
use cloudgate::rate_limit::CounterStore;
use cloudgate::RedeliveryPolicy;
use cloudgate_redis::{RedisCounterStore, RedisJobQueue};
use std::time::Duration;

// These need a live Redis and env CLOUDGATE_TEST_REDIS_URL, e.g. redis://127.0.0.1:6379

fn redis_url() -> String {
    std::env::var("CLOUDGATE_TEST_REDIS_URL").expect("set CLOUDGATE_TEST_REDIS_URL")
}

fn job(id: &str) -> Job {
    Job {
        id: id.into(),
        principal_id: "p".into(),
        request: ChatCompletionRequest::new("gpt-4", vec![ChatMessage::user("hi")]),
        submitted_at: 1,
    }
}

async fn queue(max_attempts: u32, lease: Duration, tag: &str) -> RedisJobQueue {
    let policy = RedeliveryPolicy::builder().max_attempts(max_attempts).build().unwrap();
    let options = QueueOptions { lease, ..QueueOptions::default() };
    RedisJobQueue::connect(&redis_url(), policy, options)
        .await
        .expect("connect redis")
        .with_prefix(&format!("cloudgate-test:{}:{}", tag, std::process::id()))
}

#[tokio::test]
#[ignore]
async fn increments_share_one_expiry() {
    let url = redis_url();
    let store = RedisCounterStore::connect(&url).await.expect("connect redis");
    store.ping().await.expect("ping");

    let key = format!("rate:test:{}", std::process::id());
    assert_eq!(store.increment(&key, Duration::from_secs(5)).await.unwrap(), 1);
    assert_eq!(store.increment(&key, Duration::from_secs(60)).await.unwrap(), 2);

    let client = redis::Client::open(url).unwrap();
    let mut conn = client.get_async_connection().await.unwrap();
    let ttl: i64 = redis::cmd("TTL").arg(&key).query_async(&mut conn).await.unwrap();
    assert!(ttl > 0 && ttl <= 5, "second increment must not extend the expiry, got {}", ttl);
}

#[tokio::test]
#[ignore]
async fn queue_round_trip_keeps_the_result() {
    let q = queue(3, Duration::from_secs(30), "ack").await;
    q.ping().await.expect("ping");
    assert_eq!(q.submit(job("a")).await.unwrap(), Submission::Enqueued);
    assert_eq!(q.submit(job("a")).await.unwrap(), Submission::Duplicate);

    let delivery = q.reserve().await.unwrap();
    assert_eq!((delivery.job.id.as_str(), delivery.attempt), ("a", 1));
    q.extend(&delivery).await.unwrap();
    let result = JobResult {
        content: "done".into(),
        usage: TokenUsage::new(1, 1),
        latency: Duration::from_millis(3),
        attempt: 1,
    };
    q.ack(&delivery, &result).await.unwrap();

    assert_eq!(q.status("a").await.unwrap().unwrap().state, JobState::Completed);
    assert_eq!(q.outcome("a").await.unwrap(), Some(JobOutcome::Completed(result.clone())));
    assert_eq!(q.ack(&delivery, &result).await, Err(QueueError::StaleLease("a".into())));
}

#[tokio::test]
#[ignore]
async fn queue_dead_letters_failed_and_expired_attempts() {
    let q = queue(1, Duration::from_millis(200), "dead").await;
    q.submit(job("failed")).await.unwrap();
    q.submit(job("stalled")).await.unwrap();

    let failed = q.reserve().await.unwrap();
    assert_eq!(q.fail(&failed, "boom").await.unwrap(), FailureOutcome::DeadLettered { attempts: 1 });
    let stalled = q.reserve().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(q.extend(&stalled).await, Err(QueueError::StaleLease("stalled".into())));

    assert_eq!(
        q.outcome("stalled").await.unwrap(),
        Some(JobOutcome::Failed { attempts: 1, reason: "lease expired".into() })
    );
    let reasons: Vec<String> = q.dead_letters().await.unwrap().into_iter().map(|d| d.reason).collect();
    assert_eq!(reasons, ["boom", "lease expired"]);
}
