//! Native Gemini `generateContent` protocol.
//!
//! Gemini has no `tool` or `system` role: system text is hoisted into
//! `systemInstruction`, assistant turns use the `model` role with
//! `functionCall` parts, and tool results travel back as `functionResponse`
//! parts on a user turn.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use super::accumulator::{ToolCallFragment, synthesize_events};
use super::{
    ChatRequest, Content, ContentPart, EventStream, LLMClient, LLMError, Message, MessageRole,
    StreamEvent, TokenUsage, ToolDefinition,
};

pub struct GeminiClient {
    api_key: String,
    client: reqwest::Client,
    timeout: Duration,
    base_url: String,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Result<Self, LLMError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| LLMError::ConfigError(e.to_string()))?;

        let base_url = base_url.into();
        let base_url = base_url.trim_end_matches('/');
        // The provider table points at the OpenAI-compatible shim; the native API sits above it.
        let base_url = base_url.strip_suffix("/openai").unwrap_or(base_url).to_string();

        Ok(Self {
            api_key: api_key.into(),
            client,
            timeout: Duration::from_secs(600),
            base_url,
        })
    }

    fn endpoint(&self, model: &str) -> String {
        format!("{}/models/{}:generateContent", self.base_url, model)
    }

    pub fn build_request(request: &ChatRequest) -> Value {
        let mut system_parts: Vec<String> = Vec::new();
        let mut contents: Vec<Value> = Vec::new();
        let mut call_names: HashMap<&str, &str> = HashMap::new();

        for message in &request.messages {
            let (role, parts) = match message.role {
                MessageRole::System => {
                    system_parts.push(message.content.text());
                    continue;
                }
                MessageRole::User => ("user", content_parts(&message.content)),
                MessageRole::Assistant => {
                    let mut parts = content_parts(&message.content);
                    for call in message.tool_calls() {
                        call_names.insert(call.call_id.as_str(), call.name.as_str());
                        parts.push(json!({
                            "functionCall": {
                                "name": call.name,
                                "args": Value::Object(call.arguments.clone()),
                            }
                        }));
                    }
                    ("model", parts)
                }
                MessageRole::Tool => {
                    let call_id = message.tool_call_id.as_deref().unwrap_or_default();
                    let name = call_names.get(call_id).copied().unwrap_or(call_id);
                    let part = json!({
                        "functionResponse": {
                            "name": name,
                            "response": { "content": message.content.text() },
                        }
                    });
                    ("user", vec![part])
                }
            };
            if parts.is_empty() {
                continue;
            }
            push_merged(&mut contents, role, parts);
        }

        let mut body = json!({ "contents": contents });
        if !system_parts.is_empty() {
            body["systemInstruction"] = json!({
                "parts": [{ "text": system_parts.join("\n\n") }]
            });
        }
        if let Some(temperature) = request.temperature {
            body["generationConfig"] = json!({ "temperature": temperature });
        }
        if !request.tools.is_empty() {
            let declarations: Vec<Value> = request.tools.iter().map(declaration).collect();
            body["tools"] = json!([{ "functionDeclarations": declarations }]);
        }
        body
    }
}

fn content_parts(content: &Content) -> Vec<Value> {
    match content {
        Content::Text(text) if text.is_empty() => Vec::new(),
        Content::Text(text) => vec![json!({ "text": text })],
        Content::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => json!({ "text": text }),
                ContentPart::ImageUrl { image_url } => inline_data(&image_url.url),
            })
            .collect(),
    }
}

fn inline_data(url: &str) -> Value {
    match url
        .strip_prefix("data:")
        .and_then(|rest| rest.split_once(";base64,"))
    {
        Some((mime_type, data)) => json!({
            "inlineData": { "mimeType": mime_type, "data": data }
        }),
        None => json!({ "fileData": { "fileUri": url } }),
    }
}

/// Gemini rejects two consecutive turns with the same role.
fn push_merged(contents: &mut Vec<Value>, role: &str, parts: Vec<Value>) {
    if let Some(last) = contents.last_mut() {
        if last["role"] == role {
            if let Some(existing) = last["parts"].as_array_mut() {
                existing.extend(parts);
                return;
            }
        }
    }
    contents.push(json!({ "role": role, "parts": parts }));
}

fn declaration(tool: &ToolDefinition) -> Value {
    json!({
        "name": tool.name,
        "description": tool.description,
        "parameters": clean_schema(&tool.parameters),
    })
}

/// Drops JSON-schema keywords the Gemini function schema does not accept.
fn clean_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !matches!(key.as_str(), "$schema" | "additionalProperties"))
                .map(|(key, value)| (key.clone(), clean_schema(value)))
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(clean_schema).collect()),
        other => other.clone(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePart {
    text: Option<String>,
    function_call: Option<FunctionCall>,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    id: Option<String>,
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(default)]
    total_token_count: u64,
    cached_content_token_count: Option<u64>,
}

pub fn parse_response(body: &str) -> Result<Vec<StreamEvent>, LLMError> {
    let response: GenerateResponse = serde_json::from_str(body)
        .map_err(|e| LLMError::ParseError(format!("bad gemini response: {e}")))?;

    let usage = response.usage_metadata.map(|u| TokenUsage {
        prompt_tokens: u.prompt_token_count,
        completion_tokens: u.candidates_token_count,
        total_tokens: u.total_token_count,
        cached_tokens: u.cached_content_token_count,
    });

    let Some(candidate) = response.candidates.into_iter().next() else {
        return Ok(synthesize_events(None, Vec::new(), None, usage));
    };

    let mut text = String::new();
    let mut fragments = Vec::new();
    for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
        if let Some(chunk) = part.text {
            text.push_str(&chunk);
        }
        if let Some(call) = part.function_call {
            let arguments = match call.args {
                Value::Null => String::new(),
                args => args.to_string(),
            };
            fragments.push(ToolCallFragment {
                index: fragments.len() as u32,
                call_id: call.id,
                name: Some(call.name),
                arguments: Some(arguments),
            });
        }
    }

    Ok(synthesize_events(
        Some(text),
        fragments,
        candidate.finish_reason,
        usage,
    ))
}

#[async_trait]
impl LLMClient for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    /// Gemini is always asked for one document; the adapter sees the same
    /// event sequence either way.
    async fn send(&self, request: &ChatRequest) -> Result<EventStream, LLMError> {
        let body = Self::build_request(request);
        debug!(model = %request.model, "sending gemini generateContent");

        let response = self
            .client
            .post(self.endpoint(&request.model))
            .header("x-goog-api-key", &self.api_key)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(LLMError::from_response(response).await);
        }

        let text = response.text().await?;
        let events = parse_response(&text)?;
        Ok(Box::pin(futures::stream::iter(events.into_iter().map(Ok))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{ImageUrl, ToolCall};
    use crate::tools::ToolResult;

    fn tool_round() -> Vec<Message> {
        let mut args = Map::new();
        args.insert("path".into(), json!("."));
        vec![
            Message::system("You are helpful."),
            Message::user("list files"),
            Message::assistant(
                "",
                vec![ToolCall {
                    call_id: "call_0".into(),
                    name: "list_dir".into(),
                    arguments: args,
                }],
            ),
            Message::tool("call_0", ToolResult::success("a.txt\nb.txt")),
            Message::user("thanks"),
        ]
    }

    #[test]
    fn test_endpoint_strips_openai_shim() {
        let client = GeminiClient::new(
            "key",
            "https://generativelanguage.googleapis.com/v1beta/openai/",
        )
        .unwrap();
        assert_eq!(
            client.endpoint("gemini-2.0-flash"),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent"
        );
    }

    #[test]
    fn test_build_request_maps_roles() {
        let request = ChatRequest {
            model: "gemini-2.0-flash".into(),
            messages: tool_round(),
            tools: vec![ToolDefinition {
                name: "list_dir".into(),
                description: "List".into(),
                parameters: json!({
                    "$schema": "http://json-schema.org/draft-07/schema#",
                    "type": "object",
                    "additionalProperties": false,
                    "properties": {"path": {"type": "string"}}
                }),
            }],
            stream: true,
            temperature: None,
        };
        let body = GeminiClient::build_request(&request);

        assert_eq!(
            body["systemInstruction"]["parts"][0]["text"],
            "You are helpful."
        );
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][0]["functionCall"]["name"], "list_dir");
        assert_eq!(contents[1]["parts"][0]["functionCall"]["args"]["path"], ".");
        // tool result and the following user text merge into one user turn
        assert_eq!(contents[2]["role"], "user");
        assert_eq!(
            contents[2]["parts"][0]["functionResponse"]["name"],
            "list_dir"
        );
        assert_eq!(
            contents[2]["parts"][0]["functionResponse"]["response"]["content"],
            "a.txt\nb.txt"
        );
        assert_eq!(contents[2]["parts"][1]["text"], "thanks");

        let parameters = &body["tools"][0]["functionDeclarations"][0]["parameters"];
        assert!(parameters.get("$schema").is_none());
        assert!(parameters.get("additionalProperties").is_none());
        assert_eq!(parameters["properties"]["path"]["type"], "string");
    }

    #[test]
    fn test_image_becomes_inline_data() {
        let content = Content::Parts(vec![ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: "data:image/webp;base64,UklG".into(),
            },
        }]);
        let parts = content_parts(&content);
        assert_eq!(parts[0]["inlineData"]["mimeType"], "image/webp");
        assert_eq!(parts[0]["inlineData"]["data"], "UklG");
    }

    #[test]
    fn test_parse_response_synthesizes_call_ids() {
        let body = r#"{
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"text": "Listing."},
                    {"functionCall": {"name": "list_dir", "args": {"path": "."}}}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 9, "candidatesTokenCount": 3, "totalTokenCount": 12}
        }"#;
        let events = parse_response(body).unwrap();

        assert!(matches!(&events[0], StreamEvent::TextDelta { text } if text == "Listing."));
        let call = events
            .iter()
            .find_map(|e| match e {
                StreamEvent::ToolCallComplete { call } => Some(call.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(call.call_id, "call_0");
        assert_eq!(call.arguments["path"], ".");
        match events.last().unwrap() {
            StreamEvent::MessageComplete {
                finish_reason,
                usage,
            } => {
                assert_eq!(finish_reason.as_deref(), Some("STOP"));
                assert_eq!(usage.unwrap().total_tokens, 12);
                assert_eq!(usage.unwrap().cached_tokens, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_response_without_candidates() {
        let events = parse_response(r#"{"candidates": []}"#).unwrap();
        assert_eq!(events.len(), 1);
    }
}
