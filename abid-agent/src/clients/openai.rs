//! OpenAI-compatible chat completions (OpenAI, Groq, Mistral and friends).

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

use super::accumulator::{ToolCallAccumulator, ToolCallFragment, synthesize_events};
use super::sse::{LineBuffer, sse_data};
use super::{
    ChatRequest, EventStream, LLMClient, LLMError, Message, MessageRole, StreamEvent, TokenUsage,
    ToolDefinition,
};

pub struct OpenAIClient {
    name: String,
    api_key: String,
    client: reqwest::Client,
    timeout: Duration,
    base_url: String,
}

impl OpenAIClient {
    pub fn new(
        name: impl Into<String>,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, LLMError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| LLMError::ConfigError(e.to_string()))?;

        Ok(Self {
            name: name.into(),
            api_key: api_key.into(),
            client,
            timeout: Duration::from_secs(600),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    pub fn build_request(request: &ChatRequest) -> Value {
        let messages: Vec<Value> = request.messages.iter().map(message_to_json).collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "stream": request.stream,
        });

        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if request.stream {
            body["stream_options"] = json!({ "include_usage": true });
        }
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(request.tools.iter().map(tool_to_json).collect());
            body["tool_choice"] = json!("auto");
        }

        body
    }
}

fn message_to_json(message: &Message) -> Value {
    let mut map = serde_json::Map::new();
    map.insert("role".to_string(), json!(message.role.as_str()));

    let tool_calls = message.tool_calls();
    if message.role == MessageRole::Assistant
        && !tool_calls.is_empty()
        && message.content.is_empty()
    {
        map.insert("content".to_string(), Value::Null);
    } else {
        map.insert(
            "content".to_string(),
            serde_json::to_value(&message.content).unwrap_or(Value::Null),
        );
    }

    if !tool_calls.is_empty() {
        let calls: Vec<Value> = tool_calls
            .iter()
            .map(|tc| {
                json!({
                    "id": tc.call_id,
                    "type": "function",
                    "function": {
                        "name": tc.name,
                        "arguments": tc.arguments_json(),
                    }
                })
            })
            .collect();
        map.insert("tool_calls".to_string(), Value::Array(calls));
    }

    if let Some(call_id) = &message.tool_call_id {
        map.insert("tool_call_id".to_string(), json!(call_id));
    }

    Value::Object(map)
}

fn tool_to_json(tool: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct PromptTokensDetails {
    cached_tokens: Option<u64>,
}

impl From<ApiUsage> for TokenUsage {
    fn from(usage: ApiUsage) -> Self {
        TokenUsage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            cached_tokens: usage.prompt_tokens_details.and_then(|d| d.cached_tokens),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ChunkResponse {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    usage: Option<ApiUsage>,
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
    tool_calls: Option<Vec<ChunkToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ChunkToolCall {
    #[serde(default)]
    index: u32,
    id: Option<String>,
    function: Option<ChunkFunction>,
}

#[derive(Debug, Deserialize)]
struct ChunkFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<CompletionToolCall>,
}

#[derive(Debug, Deserialize)]
struct CompletionToolCall {
    id: Option<String>,
    function: ChunkFunction,
}

/// Round state for one SSE response.
#[derive(Debug, Default)]
pub struct OpenAIStreamState {
    accumulator: ToolCallAccumulator,
    finish_reason: Option<String>,
    usage: Option<TokenUsage>,
    done: bool,
}

impl OpenAIStreamState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles one `data:` payload.
    pub fn handle_data(&mut self, data: &str) -> Result<Vec<StreamEvent>, LLMError> {
        let chunk: ChunkResponse = serde_json::from_str(data)
            .map_err(|e| LLMError::ParseError(format!("bad stream chunk: {e}")))?;

        if let Some(error) = chunk.error {
            return Err(LLMError::Api {
                status: 200,
                message: error.message,
            });
        }
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage.into());
        }

        let mut events = Vec::new();
        let Some(choice) = chunk.choices.into_iter().next() else {
            return Ok(events);
        };
        if let Some(reason) = choice.finish_reason {
            self.finish_reason = Some(reason);
        }
        if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
            events.push(StreamEvent::TextDelta { text });
        }
        for tool_call in choice.delta.tool_calls.unwrap_or_default() {
            let (name, arguments) = match tool_call.function {
                Some(function) => (function.name, function.arguments),
                None => (None, None),
            };
            events.extend(self.accumulator.apply(ToolCallFragment {
                index: tool_call.index,
                call_id: tool_call.id,
                name,
                arguments,
            }));
        }
        Ok(events)
    }

    /// Records the `[DONE]` sentinel.
    pub fn handle_done(&mut self) {
        self.done = true;
    }

    /// Completes the accumulated tool calls and closes the round.
    ///
    /// A body that ended without `[DONE]` or a finish reason was cut off and
    /// is reported as a connection error.
    pub fn finish(mut self) -> Result<Vec<StreamEvent>, LLMError> {
        if !self.done && self.finish_reason.is_none() {
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

pub fn parse_completion(body: &str) -> Result<Vec<StreamEvent>, LLMError> {
    let response: CompletionResponse = serde_json::from_str(body)
        .map_err(|e| LLMError::ParseError(format!("bad completion response: {e}")))?;
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LLMError::ParseError("no choices in response".to_string()))?;

    let fragments = choice
        .message
        .tool_calls
        .into_iter()
        .enumerate()
        .map(|(index, tc)| ToolCallFragment {
            index: index as u32,
            call_id: tc.id,
            name: tc.function.name,
            arguments: tc.function.arguments,
        })
        .collect();

    Ok(synthesize_events(
        choice.message.content,
        fragments,
        choice.finish_reason,
        response.usage.map(Into::into),
    ))
}

fn parse_stream(response: reqwest::Response) -> EventStream {
    Box::pin(async_stream::stream! {
        let mut bytes = response.bytes_stream();
        let mut lines = LineBuffer::new();
        let mut state = OpenAIStreamState::new();

        'read: while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(LLMError::from(e));
                    return;
                }
            };
            for line in lines.push(&chunk) {
                let Some(data) = sse_data(&line) else {
                    continue;
                };
                if data.is_empty() {
                    continue;
                }
                if data == "[DONE]" {
                    state.handle_done();
                    break 'read;
                }
                match state.handle_data(data) {
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
impl LLMClient for OpenAIClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, request: &ChatRequest) -> Result<EventStream, LLMError> {
        let body = Self::build_request(request);
        debug!(provider = %self.name, model = %request.model, stream = request.stream, "sending chat completion");

        let mut builder = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&body);
        if request.stream {
            builder = builder.header("Accept", "text/event-stream");
        }

        let response = builder.send().await?;
        if !response.status().is_success() {
            return Err(LLMError::from_response(response).await);
        }

        if request.stream {
            Ok(parse_stream(response))
        } else {
            let text = response.text().await?;
            let events = parse_completion(&text)?;
            Ok(Box::pin(futures::stream::iter(events.into_iter().map(Ok))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{Content, ToolCall};
    use crate::tools::ToolResult;

    fn request(stream: bool) -> ChatRequest {
        let mut args = serde_json::Map::new();
        args.insert("path".to_string(), json!("."));
        ChatRequest {
            model: "gpt-4o-mini".to_string(),
            messages: vec![
                Message::system("be brief"),
                Message::user("list files"),
                Message::assistant(
                    "",
                    vec![ToolCall {
                        call_id: "call_1".to_string(),
                        name: "list_dir".to_string(),
                        arguments: args,
                    }],
                ),
                Message::tool("call_1", ToolResult::success("a.txt\nb.txt")),
            ],
            tools: vec![ToolDefinition {
                name: "list_dir".to_string(),
                description: "List a directory".to_string(),
                parameters: json!({"type": "object"}),
            }],
            stream,
            temperature: Some(0.2),
        }
    }

    #[test]
    fn test_build_request_shape() {
        let body = OpenAIClient::build_request(&request(true));

        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["tools"][0]["function"]["name"], "list_dir");

        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["content"], Value::Null);
        assert_eq!(messages[2]["tool_calls"][0]["id"], "call_1");
        assert_eq!(
            messages[2]["tool_calls"][0]["function"]["arguments"],
            r#"{"path":"."}"#
        );
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "call_1");
        assert_eq!(messages[3]["content"], "a.txt\nb.txt");
        assert!(messages[3].get("tool_result").is_none());
    }

    #[test]
    fn test_build_request_without_tools_or_streaming() {
        let mut req = request(false);
        req.tools.clear();
        req.messages = vec![Message::user(Content::Text("hi".to_string()))];
        let body = OpenAIClient::build_request(&req);

        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());
        assert!(body.get("stream_options").is_none());
    }

    #[test]
    fn test_stream_state_accumulates_tool_calls() {
        let mut state = OpenAIStreamState::new();
        let chunks = [
            r#"{"choices":[{"delta":{"content":"Let me look."}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_9","function":{"name":"list_dir","arguments":""}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"pa"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"th\":\".\"}"}}]}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":8,"total_tokens":20,"prompt_tokens_details":{"cached_tokens":4}}}"#,
        ];

        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(state.handle_data(chunk).unwrap());
        }
        events.extend(state.finish().unwrap());

        assert_eq!(
            events[0],
            StreamEvent::TextDelta {
                text: "Let me look.".to_string()
            }
        );
        assert!(matches!(&events[1], StreamEvent::ToolCallStart { name, .. } if name == "list_dir"));
        let complete = events
            .iter()
            .find_map(|e| match e {
                StreamEvent::ToolCallComplete { call } => Some(call.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(complete.call_id, "call_9");
        assert_eq!(complete.arguments["path"], ".");

        match events.last().unwrap() {
            StreamEvent::MessageComplete {
                finish_reason,
                usage,
            } => {
                assert_eq!(finish_reason.as_deref(), Some("tool_calls"));
                let usage = usage.unwrap();
                assert_eq!(usage.total_tokens, 20);
                assert_eq!(usage.cached_tokens, Some(4));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_stream_state_rejects_truncated_body() {
        let mut state = OpenAIStreamState::new();
        let events = state
            .handle_data(r#"{"choices":[{"delta":{"content":"The answer is"}}]}"#)
            .unwrap();
        assert_eq!(events.len(), 1);

        let err = state.finish().unwrap_err();
        assert!(matches!(err, LLMError::Connection(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_stream_state_done_sentinel_closes_round() {
        let mut state = OpenAIStreamState::new();
        state
            .handle_data(r#"{"choices":[{"delta":{"content":"Hi"}}]}"#)
            .unwrap();
        state.handle_done();

        let events = state.finish().unwrap();
        assert!(matches!(
            events.last(),
            Some(StreamEvent::MessageComplete { finish_reason: None, .. })
        ));
    }

    #[test]
    fn test_stream_state_surfaces_inline_error() {
        let mut state = OpenAIStreamState::new();
        let err = state
            .handle_data(r#"{"error":{"message":"model overloaded"}}"#)
            .unwrap_err();
        assert!(matches!(err, LLMError::Api { .. }));
    }

    #[test]
    fn test_parse_completion_document() {
        let body = r#"{
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{"id": "c1", "type": "function", "function": {"name": "list_dir", "arguments": "{\"path\":\".\"}"}}]
                },
                "finish_reason": "tool_calls"
            }]
        }"#;
        let events = parse_completion(body).unwrap();

        assert!(matches!(&events[0], StreamEvent::ToolCallStart { call_id, .. } if call_id == "c1"));
        assert!(matches!(
            events.last().unwrap(),
            StreamEvent::MessageComplete { usage: None, .. }
        ));
    }
}
