//! Wire types for chat-completion submissions and their results.
//!
//! Requests arrive as untyped JSON and go through [`validate_request`] so every rejection carries a
//! precise machine-readable code instead of a generic deserialization error.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Model identifiers accepted for submission. All of them run the same compute step.
pub const SUPPORTED_MODELS: &[&str] = &[
    "gpt-3.5-turbo",
    "gpt-4",
    "gpt-4-turbo",
    "gpt-4o",
    "gpt-4o-mini",
    "llama-2-7b",
    "llama-2-13b",
    "llama-2-70b",
    "mistral-7b",
    "mixtral-8x7b",
    "falcon-40b",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }
}

/// Optional generation knobs. Forwarded to the compute step untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// How the caller wants the result delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    Blocking,
    Streaming,
}

/// A validated submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(flatten)]
    pub params: GenerationParams,
}

impl ChatCompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self { model: model.into(), messages, stream: false, params: GenerationParams::default() }
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    pub fn mode(&self) -> ResponseMode {
        if self.stream {
            ResponseMode::Streaming
        } else {
            ResponseMode::Blocking
        }
    }

    /// All message contents joined by a space; the basis of the prompt token estimate.
    pub fn prompt_text(&self) -> String {
        self.messages.iter().map(|m| m.content.as_str()).collect::<Vec<_>>().join(" ")
    }
}

/// Why a payload was refused. `code` is stable and safe to show to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadError {
    pub code: &'static str,
    pub message: String,
}

impl PayloadError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

impl fmt::Display for PayloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// Check an untyped body and turn it into a [`ChatCompletionRequest`].
pub fn validate_request(body: &Value) -> Result<ChatCompletionRequest, PayloadError> {
    let obj = body
        .as_object()
        .ok_or_else(|| PayloadError::new("invalid_body", "Request body must be a JSON object"))?;

    let model = match obj.get("model").and_then(Value::as_str) {
        Some(m) if !m.is_empty() => m,
        _ => return Err(PayloadError::new("missing_model", "Missing or invalid \"model\" field")),
    };
    if !SUPPORTED_MODELS.contains(&model) {
        return Err(PayloadError::new(
            "model_not_found",
            format!(
                "Model \"{}\" is not supported. Use one of: {}.",
                model,
                SUPPORTED_MODELS.join(", ")
            ),
        ));
    }

    let raw_messages = match obj.get("messages").and_then(Value::as_array) {
        Some(list) if !list.is_empty() => list,
        _ => {
            return Err(PayloadError::new(
                "missing_messages",
                "Missing or invalid \"messages\" array",
            ))
        }
    };
    let mut messages = Vec::with_capacity(raw_messages.len());
    for (i, raw) in raw_messages.iter().enumerate() {
        let role = raw.get("role").and_then(Value::as_str);
        let content = raw.get("content").and_then(Value::as_str);
        let (role, content) = match (role, content) {
            (Some(r), Some(c)) => (r, c),
            _ => {
                return Err(PayloadError::new(
                    "invalid_message",
                    format!("Invalid message at index {}: must have \"role\" and \"content\" strings", i),
                ))
            }
        };
        let role = Role::parse(role).ok_or_else(|| {
            PayloadError::new("invalid_role", format!("Invalid role \"{}\" at index {}", role, i))
        })?;
        messages.push(ChatMessage { role, content: content.to_string() });
    }

    let temperature = match obj.get("temperature") {
        None | Some(Value::Null) => None,
        Some(v) => match v.as_f64() {
            Some(t) if (0.0..=2.0).contains(&t) => Some(t),
            _ => {
                return Err(PayloadError::new(
                    "invalid_parameter",
                    "\"temperature\" must be a number between 0 and 2",
                ))
            }
        },
    };
    let max_tokens = match obj.get("max_tokens") {
        None | Some(Value::Null) => None,
        Some(v) => match v.as_u64().and_then(|n| u32::try_from(n).ok()) {
            Some(n) if n > 0 => Some(n),
            _ => {
                return Err(PayloadError::new(
                    "invalid_parameter",
                    "\"max_tokens\" must be a positive integer",
                ))
            }
        },
    };

    Ok(ChatCompletionRequest {
        model: model.to_string(),
        messages,
        stream: obj.get("stream").and_then(Value::as_bool).unwrap_or(false),
        params: GenerationParams { temperature, max_tokens },
    })
}

/// Token accounting attached to a completed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: String,
}

/// Single structured result returned in blocking mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: TokenUsage,
}

impl ChatCompletion {
    pub fn new(id: String, model: String, created: i64, content: String, usage: TokenUsage) -> Self {
        Self {
            id,
            object: "chat.completion".into(),
            created,
            model,
            choices: vec![Choice {
                index: 0,
                message: ChatMessage { role: Role::Assistant, content },
                finish_reason: FINISH_STOP.into(),
            }],
            usage,
        }
    }

    /// Content of the first (only) choice.
    pub fn content(&self) -> &str {
        self.choices.first().map(|c| c.message.content.as_str()).unwrap_or_default()
    }
}

pub const FINISH_STOP: &str = "stop";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

/// One streamed event carrying a content delta or the finish marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

impl ChatCompletionChunk {
    pub fn delta(id: &str, model: &str, created: i64, content: String) -> Self {
        Self::build(id, model, created, Delta { content: Some(content) }, None)
    }

    pub fn finish(id: &str, model: &str, created: i64) -> Self {
        Self::build(id, model, created, Delta::default(), Some(FINISH_STOP.into()))
    }

    fn build(
        id: &str,
        model: &str,
        created: i64,
        delta: Delta,
        finish_reason: Option<String>,
    ) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk".into(),
            created,
            model: model.to_string(),
            choices: vec![ChunkChoice { index: 0, delta, finish_reason }],
        }
    }

    pub fn content(&self) -> Option<&str> {
        self.choices.first().and_then(|c| c.delta.content.as_deref())
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.choices.first().and_then(|c| c.finish_reason.as_deref())
    }
}
