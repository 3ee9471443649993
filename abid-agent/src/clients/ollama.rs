//! Native Ollama chat protocol (`/api/chat`).

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

use super::accumulator::{ToolCallAccumulator, ToolCallFragment, synthesize_events};
use super::sse::LineBuffer;
use super::{
    ChatRequest, ContentPart, EventStream, LLMClient, LLMError, Message, StreamEvent, TokenUsage,
};

pub struct OllamaClient {
    client: reqwest::Client,
    timeout: Duration,
    base_url: String,
}

impl OllamaClient {
    /// Accepts either the server root or the OpenAI-compatible `/v1` prefix.
    pub fn new(base_url: impl Into<String>) -> Result<Self, LLMError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| LLMError::ConfigError(e.to_string()))?;

        let base_url = base_url.into();
        let base_url = base_url.trim_end_matches('/');
        let base_url = base_url.strip_suffix("/v1").unwrap_or(base_url).to_string();

        Ok(Self {
            client,
            timeout: Duration::from_secs(600),
            base_url,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }

    pub fn build_request(request: &ChatRequest) -> Value {
        let messages: Vec<Value> = request.messages.iter().map(message_to_json).collect();
        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "stream": request.stream,
        });
        if let Some(temperature) = request.temperature {
            body["options"] = json!({ "temperature": temperature });
        }
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
        }
        body
    }
}

fn message_to_json(message: &Message) -> Value {
    let mut body = json!({
        "role": message.role.as_str(),
        "content": message.content.text(),
    });

    if let super::Content::Parts(parts) = &message.content {
        let images: Vec<Value> = parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::ImageUrl { image_url } => Some(json!(strip_data_url(&image_url.url))),
                ContentPart::Text { .. } => None,
            })
            .collect();
        if !images.is_empty() {
            body["images"] = Value::Array(images);
        }
    }

    let tool_calls = message.tool_calls();
    if !tool_calls.is_empty() {
        let calls: Vec<Value> = tool_calls
            .iter()
            .map(|tc| {
                json!({
                    "function": {
                        "name": tc.name,
                        "arguments": Value::Object(tc.arguments.clone()),
                    }
                })
            })
            .collect();
        body["tool_calls"] = Value::Array(calls);
    }
    body
}

/// Ollama wants raw base64 without the `data:<mime>;base64,` prefix.
fn strip_data_url(url: &str) -> &str {
    match url.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => url,
    }
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    done_reason: Option<String>,
    prompt_eval_count: Option<u64>,
    eval_count: Option<u64>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<ChunkToolCall>,
}

#[derive(Debug, Deserialize)]
struct ChunkToolCall {
    function: ChunkFunction,
}

#[derive(Debug, Deserialize)]
struct ChunkFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

impl ChunkFunction {
    fn arguments_text(&self) -> String {
        match &self.arguments {
            Value::Null => String::new(),
            Value::String(raw) => raw.clone(),
            other => other.to_string(),
        }
    }
}

impl ChatChunk {
    fn usage(&self) -> Option<TokenUsage> {
        if self.prompt_eval_count.is_none() && self.eval_count.is_none() {
            return None;
        }
        let prompt_tokens = self.prompt_eval_count.unwrap_or(0);
        let completion_tokens = self.eval_count.unwrap_or(0);
        Some(TokenUsage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            cached_tokens: None,
        })
    }
}

/// Round state for an NDJSON response. Tool calls arrive whole, so each one
/// takes the next index.
#[derive(Debug, Default)]
pub struct OllamaStreamState {
    accumulator: ToolCallAccumulator,
    next_index: u32,
    finish_reason: Option<String>,
    usage: Option<TokenUsage>,
    done: bool,
}

impl OllamaStreamState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn handle_line(&mut self, line: &str) -> Result<Vec<StreamEvent>, LLMError> {
        let chunk: ChatChunk = serde_json::from_str(line)
            .map_err(|e| LLMError::ParseError(format!("bad ollama chunk: {e}")))?;
        if let Some(message) = chunk.error {
            return Err(LLMError::Api {
                status: 200,
                message,
            });
        }

        let mut events = Vec::new();
        if let Some(message) = &chunk.message {
            if !message.content.is_empty() {
                events.push(StreamEvent::TextDelta {
                    text: message.content.clone(),
                });
            }
            for tool_call in &message.tool_calls {
                let index = self.next_index;
                self.next_index += 1;
                events.extend(self.accumulator.apply(ToolCallFragment {
                    index,
                    call_id: None,
                    name: Some(tool_call.function.name.clone()),
                    arguments: Some(tool_call.function.arguments_text()),
                }));
            }
        }

        if chunk.done {
            self.done = true;
            self.usage = chunk.usage();
            self.finish_reason = chunk.done_reason;
        }
        Ok(events)
    }

    /// Closes the round. A body that ended before a `done: true` line is a
    /// connection error.
    pub fn finish(mut self) -> Result<Vec<StreamEvent>, LLMError> {
        if !self.done {
            return Err(LLMError::Connection(
                "stream ended before completion".to_string(),
            ));
        }
        let mut events = self.accumulator.finish();
        events.push(StreamEvent::MessageComplete {
            finish_reason: self.finish_reason,
            usage: self.usage,
        });
        Ok(events)
    }
}

pub fn parse_document(body: &str) -> Result<Vec<StreamEvent>, LLMError> {
    let chunk: ChatChunk = serde_json::from_str(body)
        .map_err(|e| LLMError::ParseError(format!("bad ollama response: {e}")))?;
    if let Some(message) = chunk.error {
        return Err(LLMError::Api {
            status: 200,
            message,
        });
    }
    let usage = chunk.usage();
    let (text, fragments) = match chunk.message {
        Some(message) => {
            let fragments = message
                .tool_calls
                .iter()
                .enumerate()
                .map(|(index, tc)| ToolCallFragment {
                    index: index as u32,
                    call_id: None,
                    name: Some(tc.function.name.clone()),
                    arguments: Some(tc.function.arguments_text()),
                })
                .collect();
            (Some(message.content), fragments)
        }
        None => (None, Vec::new()),
    };
    Ok(synthesize_events(text, fragments, chunk.done_reason, usage))
}

fn parse_stream(response: reqwest::Response) -> EventStream {
    Box::pin(async_stream::stream! {
        let mut bytes = response.bytes_stream();
        let mut lines = LineBuffer::new();
        let mut state = OllamaStreamState::new();

        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(LLMError::from(e));
                    return;
                }
            };
            for line in lines.push(&chunk) {
                if line.trim().is_empty() {
                    continue;
                }
                match state.handle_line(&line) {
                    Ok(events) => {
                        for event in events {
                            yield Ok(event);
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
            if state.is_done() {
                break;
            }
        }

        if let Some(tail) = lines.finish().filter(|tail| !tail.trim().is_empty()) {
            match state.handle_line(&tail) {
                Ok(events) => {
                    for event in events {
                        yield Ok(event);
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }

        match state.finish() {
            Ok(events) => {
                for event in events {
                    yield Ok(event);
                }
            }
            Err(e) => yield Err(e),
        }
    })
}

#[async_trait]
impl LLMClient for OllamaClient {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn send(&self, request: &ChatRequest) -> Result<EventStream, LLMError> {
        let body = Self::build_request(request);
        debug!(model = %request.model, stream = request.stream, "sending ollama chat");

        let response = self
            .client
            .post(self.endpoint())
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(LLMError::from_response(response).await);
        }

        if request.stream {
            Ok(parse_stream(response))
        } else {
            let text = response.text().await?;
            let events = parse_document(&text)?;
            Ok(Box::pin(futures::stream::iter(events.into_iter().map(Ok))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{Content, ImageUrl, ToolCall, ToolDefinition};

    #[test]
    fn test_base_url_accepts_v1_prefix() {
        let client = OllamaClient::new("http://localhost:11434/v1/").unwrap();
        assert_eq!(client.endpoint(), "http://localhost:11434/api/chat");
        let client = OllamaClient::new("http://localhost:11434").unwrap();
        assert_eq!(client.endpoint(), "http://localhost:11434/api/chat");
    }

    #[test]
    fn test_build_request_maps_images_and_tool_calls() {
        let mut args = serde_json::Map::new();
        args.insert("path".into(), json!("."));
        let request = ChatRequest {
            model: "llava:7b".into(),
            messages: vec![
                Message::user(Content::Parts(vec![
                    ContentPart::Text {
                        text: "describe".into(),
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: "data:image/png;base64,QUJD".into(),
                        },
                    },
                ])),
                Message::assistant(
                    "",
                    vec![ToolCall {
                        call_id: "call_0".into(),
                        name: "list_dir".into(),
                        arguments: args,
                    }],
                ),
            ],
            tools: vec![ToolDefinition {
                name: "list_dir".into(),
                description: "List".into(),
                parameters: json!({"type": "object"}),
            }],
            stream: false,
            temperature: Some(0.7),
        };
        let body = OllamaClient::build_request(&request);

        assert_eq!(body["messages"][0]["content"], "describe");
        assert_eq!(body["messages"][0]["images"][0], "QUJD");
        assert_eq!(
            body["messages"][1]["tool_calls"][0]["function"]["arguments"]["path"],
            "."
        );
        assert_eq!(body["tools"][0]["function"]["name"], "list_dir");
        assert!(body["options"]["temperature"].is_number());
    }

    #[test]
    fn test_stream_state_handles_whole_tool_calls() {
        let mut state = OllamaStreamState::new();
        let mut events = Vec::new();
        events.extend(
            state
                .handle_line(r#"{"message":{"role":"assistant","content":"Checking"},"done":false}"#)
                .unwrap(),
        );
        events.extend(state.handle_line(
            r#"{"message":{"role":"assistant","content":"","tool_calls":[{"function":{"name":"list_dir","arguments":{"path":"."}}},{"function":{"name":"grep","arguments":{"pattern":"fn"}}}]},"done":false}"#,
        ).unwrap());
        events.extend(
            state
                .handle_line(r#"{"message":{"role":"assistant","content":""},"done":true,"done_reason":"stop","prompt_eval_count":30,"eval_count":5}"#)
                .unwrap(),
        );
        assert!(state.is_done());
        events.extend(state.finish().unwrap());

        let calls: Vec<ToolCall> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ToolCallComplete { call } => Some(call.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].call_id, "call_0");
        assert_eq!(calls[1].call_id, "call_1");
        assert_eq!(calls[1].arguments["pattern"], "fn");

        match events.last().unwrap() {
            StreamEvent::MessageComplete { usage, .. } => {
                let usage = usage.unwrap();
                assert_eq!(usage.total_tokens, 35);
                assert_eq!(usage.cached_tokens, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_stream_without_done_line_is_an_error() {
        let mut state = OllamaStreamState::new();
        state
            .handle_line(r#"{"message":{"role":"assistant","content":"The answer is"},"done":false}"#)
            .unwrap();
        assert!(!state.is_done());
        assert!(matches!(state.finish(), Err(LLMError::Connection(_))));
    }

    #[test]
    fn test_inline_error_is_reported() {
        let mut state = OllamaStreamState::new();
        assert!(state.handle_line(r#"{"error":"model not found"}"#).is_err());
    }

    #[test]
    fn test_parse_document_without_usage() {
        let events =
            parse_document(r#"{"message":{"role":"assistant","content":"Hi"},"done":true}"#)
                .unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1],
            StreamEvent::MessageComplete { usage: None, .. }
        ));
    }
}
