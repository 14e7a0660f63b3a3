//! The opaque compute step run by workers.
//!
//! The gateway does not care how text is produced; it needs a future that eventually yields the
//! full completion text or an error. [`MockEngine`] stands in for a real model server.

use crate::model::{ChatCompletionRequest, Role};
use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ComputeError {
    #[error("inference backend failed: {0}")]
    Backend(String),
    #[error("compute step exceeded {0:?}")]
    TimedOut(Duration),
}

/// Produces completion text for a request.
#[async_trait]
pub trait InferenceEngine: Send + Sync + std::fmt::Debug {
    async fn complete(&self, request: &ChatCompletionRequest) -> Result<String, ComputeError>;
}

/// Approximate token count: `ceil(words × 1.3)`; zero for blank text.
pub fn count_tokens(text: &str) -> u32 {
    let words = text.split_whitespace().count();
    if words == 0 {
        return 0;
    }
    (words as f64 * 1.3).ceil() as u32
}

/// Simulated model server: sleeps for a random 50–150 ms and answers with a fixed sentence
/// mentioning the word count of the last user message.
#[derive(Debug, Clone)]
pub struct MockEngine {
    min_delay: Duration,
    max_delay: Duration,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new(Duration::from_millis(50), Duration::from_millis(150))
    }
}

impl MockEngine {
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        Self { min_delay, max_delay: max_delay.max(min_delay) }
    }

    /// No simulated latency.
    pub fn instant() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    pub fn reply_for(request: &ChatCompletionRequest) -> String {
        let prompt = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("Hello");
        let words = prompt.split_whitespace().count().max(1);
        format!(
            "This is a simulated response to your message ({} words). The GPU worker processed your request.",
            words
        )
    }

    fn delay(&self) -> Duration {
        if self.max_delay <= self.min_delay {
            return self.min_delay;
        }
        let min = self.min_delay.as_millis() as u64;
        let max = self.max_delay.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(min..=max))
    }
}

#[async_trait]
impl InferenceEngine for MockEngine {
    async fn complete(&self, request: &ChatCompletionRequest) -> Result<String, ComputeError> {
        let delay = self.delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(Self::reply_for(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChatMessage;

    #[test]
    fn token_estimate() {
        assert_eq!(count_tokens(""), 0);
        assert_eq!(count_tokens("   "), 0);
        assert_eq!(count_tokens("Hello world"), 3);
        assert_eq!(count_tokens("one two three four five six seven eight nine ten"), 13);
    }

    #[test]
    fn reply_counts_last_user_message() {
        let request = ChatCompletionRequest::new(
            "gpt-4",
            vec![
                ChatMessage::user("first question here"),
                ChatMessage { role: Role::Assistant, content: "answer".into() },
                ChatMessage::user("Hello world"),
            ],
        );
        assert_eq!(
            MockEngine::reply_for(&request),
            "This is a simulated response to your message (2 words). The GPU worker processed your request."
        );

        let system_only = ChatCompletionRequest::new(
            "gpt-4",
            vec![ChatMessage { role: Role::System, content: "be terse".into() }],
        );
        assert!(MockEngine::reply_for(&system_only).contains("(1 words)"));
    }

    #[tokio::test(start_paused = true)]
    async fn delay_stays_in_range() {
        let engine = MockEngine::default();
        for _ in 0..20 {
            let d = engine.delay();
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(150));
        }
        let request = ChatCompletionRequest::new("gpt-4", vec![ChatMessage::user("hi")]);
        assert!(engine.complete(&request).await.is_ok());
    }
}
