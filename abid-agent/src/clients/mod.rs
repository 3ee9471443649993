pub mod accumulator;
pub mod adapter;
pub mod gemini;
pub mod ollama;
pub mod openai;
pub mod sse;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{Backend, Config};
use crate::tools::ToolResult;

pub use accumulator::{ToolCallAccumulator, ToolCallFragment, parse_tool_arguments};
pub use adapter::{ProviderAdapter, RetryPolicy};
pub use gemini::GeminiClient;
pub use ollama::OllamaClient;
pub use openai::OpenAIClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// One part of a multimodal message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

/// Message body: plain text, or a list of text and image parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Content {
    /// Concatenated text of the body, ignoring images.
    pub fn text(&self) -> String {
        match self {
            Content::Text(text) => text.clone(),
            Content::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn has_image(&self) -> bool {
        match self {
            Content::Text(_) => false,
            Content::Parts(parts) => parts
                .iter()
                .any(|part| matches!(part, ContentPart::ImageUrl { .. })),
        }
    }

    pub fn char_len(&self) -> usize {
        match self {
            Content::Text(text) => text.chars().count(),
            Content::Parts(parts) => parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => text.chars().count(),
                    ContentPart::ImageUrl { image_url } => image_url.url.len(),
                })
                .sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Content::Text(text) => text.is_empty(),
            Content::Parts(parts) => parts.is_empty(),
        }
    }
}

impl From<String> for Content {
    fn from(text: String) -> Self {
        Content::Text(text)
    }
}

impl From<&str> for Content {
    fn from(text: &str) -> Self {
        Content::Text(text.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl ToolCall {
    pub fn arguments_json(&self) -> String {
        Value::Object(self.arguments.clone()).to_string()
    }
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: Content,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
    /// Structured outcome kept alongside a tool message; the model only sees `content`.
    #[serde(default)]
    pub tool_result: Option<ToolResult>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self::plain(MessageRole::System, Content::Text(text.into()))
    }

    pub fn user(content: impl Into<Content>) -> Self {
        Self::plain(MessageRole::User, content.into())
    }

    pub fn assistant(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: Content::Text(text.into()),
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
            tool_call_id: None,
            tool_result: None,
        }
    }

    pub fn tool(call_id: impl Into<String>, result: ToolResult) -> Self {
        Self {
            role: MessageRole::Tool,
            content: Content::Text(result.to_model_content()),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
            tool_result: Some(result),
        }
    }

    fn plain(role: MessageRole, content: Content) -> Self {
        Self {
            role,
            content,
            tool_calls: None,
            tool_call_id: None,
            tool_result: None,
        }
    }

    pub fn tool_calls(&self) -> &[ToolCall] {
        self.tool_calls.as_deref().unwrap_or(&[])
    }
}

/// Wire-facing tool schema sent to a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    /// `None` when the backend never reported cached tokens, as opposed to reporting zero.
    #[serde(default)]
    pub cached_tokens: Option<u64>,
}

impl TokenUsage {
    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
        self.cached_tokens = match (self.cached_tokens, other.cached_tokens) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
        };
    }
}

/// Canonical event produced by every backend.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta {
        text: String,
    },
    ToolCallStart {
        index: u32,
        call_id: String,
        name: String,
    },
    ToolCallDelta {
        index: u32,
        call_id: String,
        arguments_delta: String,
    },
    ToolCallComplete {
        call: ToolCall,
    },
    MessageComplete {
        finish_reason: Option<String>,
        usage: Option<TokenUsage>,
    },
    Error {
        error: LLMError,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LLMError {
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Authentication failed: {0}")]
    Authentication(String),
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Malformed arguments for tool call {call_id} ({name}): {reason}")]
    MalformedToolArguments {
        call_id: String,
        name: String,
        reason: String,
    },
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl LLMError {
    /// Rate-limit and connection failures are worth retrying; everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(self, LLMError::RateLimited(_) | LLMError::Connection(_))
    }

    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            429 => LLMError::RateLimited(body),
            401 | 403 => LLMError::Authentication(body),
            _ => LLMError::Api {
                status,
                message: body,
            },
        }
    }

    pub(crate) async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Self::from_status(status, body)
    }
}

impl From<reqwest::Error> for LLMError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            LLMError::ParseError(error.to_string())
        } else {
            LLMError::Connection(error.to_string())
        }
    }
}

/// A single model request, already resolved to a concrete model.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub stream: bool,
    pub temperature: Option<f32>,
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, LLMError>> + Send>>;

/// One backend wire protocol.
///
/// `send` fails before any event for errors detected up front (status codes,
/// connection refusals). Failures discovered while reading the body come through
/// the stream as `Err` items.
#[async_trait]
pub trait LLMClient: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, request: &ChatRequest) -> Result<EventStream, LLMError>;
}

pub fn create_llm_client(config: &Config) -> Result<Arc<dyn LLMClient>, LLMError> {
    let provider = config.model.provider;
    let api_key = config.api_key().ok_or_else(|| {
        LLMError::ConfigError(format!(
            "no API key for provider {} (set {})",
            provider,
            provider.info().env_key
        ))
    })?;
    let base_url = config.base_url();

    let client: Arc<dyn LLMClient> = match provider.backend() {
        Backend::OpenAICompatible => Arc::new(OpenAIClient::new(
            provider.to_string(),
            api_key,
            base_url,
        )?),
        Backend::Ollama => Arc::new(OllamaClient::new(base_url)?),
        Backend::Gemini => Arc::new(GeminiClient::new(api_key, base_url)?),
    };
    Ok(client)
}
