//! Model selection, image injection and retry on top of one [`LLMClient`].

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::{Stream, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    ChatRequest, Content, ContentPart, ImageUrl, LLMClient, LLMError, Message, MessageRole,
    StreamEvent, ToolDefinition, create_llm_client,
};
use crate::config::Config;
use crate::memory::{ContextError, Summarizer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt + 1`: `base_delay * 2^attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

#[derive(Clone)]
pub struct ProviderAdapter {
    client: Arc<dyn LLMClient>,
    model: String,
    vision_model: String,
    temperature: Option<f32>,
    retry: RetryPolicy,
}

impl ProviderAdapter {
    pub fn new(
        client: Arc<dyn LLMClient>,
        model: impl Into<String>,
        vision_model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            model: model.into(),
            vision_model: vision_model.into(),
            temperature: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, LLMError> {
        let client = create_llm_client(config)?;
        Ok(Self::new(client, config.model_name(), config.vision_model_name())
            .with_temperature(config.model.temperature)
            .with_retry(RetryPolicy {
                max_retries: config.max_retries,
                ..RetryPolicy::default()
            }))
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn provider_name(&self) -> &str {
        self.client.name()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn vision_model(&self) -> &str {
        &self.vision_model
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.model = model.into();
    }

    /// Submits `history` and yields canonical events for one round.
    ///
    /// Transient failures are retried with exponential backoff as long as no
    /// event of the failing attempt reached the caller. Every other failure,
    /// and a transient one past the retry ceiling, ends the stream with exactly
    /// one [`StreamEvent::Error`].
    pub fn stream(
        &self,
        history: Vec<Message>,
        tools: Vec<ToolDefinition>,
        streaming: bool,
        image: Option<PathBuf>,
    ) -> impl Stream<Item = StreamEvent> + Send + '_ {
        async_stream::stream! {
            let mut messages = history;
            if let Some(path) = image {
                match encode_image(&path).await {
                    Ok(url) => attach_image(&mut messages, url),
                    Err(error) => {
                        yield StreamEvent::Error { error };
                        return;
                    }
                }
            }

            let vision = messages.iter().any(|m| m.content.has_image());
            let request = ChatRequest {
                model: if vision {
                    self.vision_model.clone()
                } else {
                    self.model.clone()
                },
                messages,
                tools: if vision { Vec::new() } else { tools },
                stream: streaming,
                temperature: self.temperature,
            };

            let mut attempt = 0u32;
            loop {
                debug!(
                    provider = %self.client.name(),
                    model = %request.model,
                    attempt,
                    messages = request.messages.len(),
                    tools = request.tools.len(),
                    "submitting request"
                );

                let mut forwarded = false;
                let failure = match self.client.send(&request).await {
                    Ok(mut events) => {
                        let mut failure = None;
                        while let Some(item) = events.next().await {
                            match item {
                                Ok(event) => {
                                    forwarded = true;
                                    yield event;
                                }
                                Err(error) => {
                                    failure = Some(error);
                                    break;
                                }
                            }
                        }
                        failure
                    }
                    Err(error) => Some(error),
                };

                let Some(error) = failure else {
                    return;
                };

                if error.is_transient() && !forwarded && attempt < self.retry.max_retries {
                    let delay = self.retry.delay_for(attempt);
                    warn!(%error, attempt, ?delay, "transient provider error, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }

                warn!(%error, attempt, "provider request failed");
                yield StreamEvent::Error { error };
                return;
            }
        }
    }

    /// Non-streaming, tool-free request that returns the assembled text.
    pub async fn complete_text(&self, messages: Vec<Message>) -> Result<String, LLMError> {
        let events = self.stream(messages, Vec::new(), false, None);
        futures::pin_mut!(events);

        let mut text = String::new();
        while let Some(event) = events.next().await {
            match event {
                StreamEvent::TextDelta { text: delta } => text.push_str(&delta),
                StreamEvent::Error { error } => return Err(error),
                _ => {}
            }
        }
        Ok(text)
    }
}

#[async_trait]
impl Summarizer for ProviderAdapter {
    async fn summarize(&self, messages: Vec<Message>) -> Result<String, ContextError> {
        self.complete_text(messages)
            .await
            .map_err(|e| ContextError::Summarization(e.to_string()))
    }
}

pub fn mime_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}

async fn encode_image(path: &Path) -> Result<String, LLMError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| {
        LLMError::InvalidRequest(format!("cannot read image {}: {e}", path.display()))
    })?;
    Ok(format!(
        "data:{};base64,{}",
        mime_type_for(path),
        STANDARD.encode(bytes)
    ))
}

/// Appends the image as a part of the latest user message, or as a new user
/// message when there is none.
fn attach_image(messages: &mut Vec<Message>, url: String) {
    let image = ContentPart::ImageUrl {
        image_url: ImageUrl { url },
    };
    let Some(message) = messages
        .iter_mut()
        .rev()
        .find(|m| m.role == MessageRole::User)
    else {
        messages.push(Message::user(Content::Parts(vec![image])));
        return;
    };

    let mut parts = match std::mem::replace(&mut message.content, Content::Parts(Vec::new())) {
        Content::Text(text) if text.is_empty() => Vec::new(),
        Content::Text(text) => vec![ContentPart::Text { text }],
        Content::Parts(parts) => parts,
    };
    parts.push(image);
    message.content = Content::Parts(parts);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::EventStream;
    use std::collections::VecDeque;
    use std::io::Write;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Scripted {
        Fail(LLMError),
        Events(Vec<Result<StreamEvent, LLMError>>),
    }

    struct FakeClient {
        script: Mutex<VecDeque<Scripted>>,
        fallback: Option<LLMError>,
        attempts: AtomicUsize,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl FakeClient {
        fn new(script: Vec<Scripted>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback: None,
                attempts: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn always_failing(error: LLMError) -> Self {
            Self {
                fallback: Some(error),
                ..Self::new(Vec::new())
            }
        }
    }

    #[async_trait]
    impl LLMClient for FakeClient {
        fn name(&self) -> &str {
            "fake"
        }

        async fn send(&self, request: &ChatRequest) -> Result<EventStream, LLMError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request.clone());
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Scripted::Fail(error)) => Err(error),
                Some(Scripted::Events(events)) => Ok(Box::pin(futures::stream::iter(events))),
                None => Err(self
                    .fallback
                    .clone()
                    .unwrap_or_else(|| LLMError::InvalidRequest("script exhausted".into()))),
            }
        }
    }

    fn adapter(client: &Arc<FakeClient>) -> ProviderAdapter {
        let client: Arc<dyn LLMClient> = Arc::<FakeClient>::clone(client);
        ProviderAdapter::new(client, "text-model", "vision-model").with_retry(RetryPolicy {
            max_retries: 3,
            base_delay: Duration::ZERO,
        })
    }

    async fn collect(
        adapter: &ProviderAdapter,
        history: Vec<Message>,
        image: Option<PathBuf>,
    ) -> Vec<StreamEvent> {
        adapter
            .stream(history, Vec::new(), true, image)
            .collect()
            .await
    }

    fn done() -> Result<StreamEvent, LLMError> {
        Ok(StreamEvent::MessageComplete {
            finish_reason: Some("stop".to_string()),
            usage: None,
        })
    }

    #[test]
    fn test_retry_delay_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_persistent_rate_limit_yields_one_error_after_four_attempts() {
        let client = Arc::new(FakeClient::always_failing(LLMError::RateLimited(
            "slow down".into(),
        )));
        let events = collect(&adapter(&client), vec![Message::user("hi")], None).await;

        assert_eq!(client.attempts.load(Ordering::SeqCst), 4);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            StreamEvent::Error {
                error: LLMError::RateLimited(_)
            }
        ));
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let client = Arc::new(FakeClient::always_failing(LLMError::Authentication(
            "bad key".into(),
        )));
        let events = collect(&adapter(&client), vec![Message::user("hi")], None).await;

        assert_eq!(client.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Error { .. }));
    }

    #[tokio::test]
    async fn test_transient_error_recovers() {
        let client = Arc::new(FakeClient::new(vec![
            Scripted::Fail(LLMError::Connection("reset".into())),
            Scripted::Events(vec![
                Ok(StreamEvent::TextDelta {
                    text: "hello".into(),
                }),
                done(),
            ]),
        ]));
        let events = collect(&adapter(&client), vec![Message::user("hi")], None).await;

        assert_eq!(client.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], StreamEvent::TextDelta { text } if text == "hello"));
    }

    #[tokio::test]
    async fn test_failure_after_forwarded_events_is_terminal() {
        let client = Arc::new(FakeClient::new(vec![Scripted::Events(vec![
            Ok(StreamEvent::TextDelta {
                text: "partial".into(),
            }),
            Err(LLMError::Connection("dropped".into())),
        ])]));
        let events = collect(&adapter(&client), vec![Message::user("hi")], None).await;

        assert_eq!(client.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], StreamEvent::Error { .. }));
    }

    #[tokio::test]
    async fn test_image_selects_vision_model_and_drops_tools() {
        let mut file = tempfile::Builder::new().suffix(".png").tempfile().unwrap();
        file.write_all(&[0x89, b'P', b'N', b'G']).unwrap();

        let client = Arc::new(FakeClient::new(vec![Scripted::Events(vec![done()])]));
        let adapter = adapter(&client);
        let tools = vec![ToolDefinition {
            name: "list_dir".into(),
            description: "List".into(),
            parameters: serde_json::json!({"type": "object"}),
        }];
        let events: Vec<_> = adapter
            .stream(
                vec![Message::system("sys"), Message::user("what is this?")],
                tools,
                true,
                Some(file.path().to_path_buf()),
            )
            .collect()
            .await;
        assert_eq!(events.len(), 1);

        let requests = client.requests.lock().unwrap();
        let request = &requests[0];
        assert_eq!(request.model, "vision-model");
        assert!(request.tools.is_empty());
        match &request.messages[1].content {
            Content::Parts(parts) => {
                assert_eq!(
                    parts[0],
                    ContentPart::Text {
                        text: "what is this?".into()
                    }
                );
                match &parts[1] {
                    ContentPart::ImageUrl { image_url } => {
                        assert!(image_url.url.starts_with("data:image/png;base64,"))
                    }
                    other => panic!("unexpected part {other:?}"),
                }
            }
            other => panic!("unexpected content {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_text_request_uses_text_model() {
        let client = Arc::new(FakeClient::new(vec![Scripted::Events(vec![done()])]));
        collect(&adapter(&client), vec![Message::user("hi")], None).await;
        assert_eq!(client.requests.lock().unwrap()[0].model, "text-model");
    }

    #[tokio::test]
    async fn test_unreadable_image_is_terminal_error() {
        let client = Arc::new(FakeClient::new(Vec::new()));
        let events = collect(
            &adapter(&client),
            vec![Message::user("hi")],
            Some(PathBuf::from("/nonexistent/picture.jpg")),
        )
        .await;

        assert_eq!(client.attempts.load(Ordering::SeqCst), 0);
        assert!(matches!(
            events[..],
            [StreamEvent::Error {
                error: LLMError::InvalidRequest(_)
            }]
        ));
    }

    #[tokio::test]
    async fn test_complete_text_joins_deltas() {
        let client = Arc::new(FakeClient::new(vec![Scripted::Events(vec![
            Ok(StreamEvent::TextDelta { text: "GOAL: ".into() }),
            Ok(StreamEvent::TextDelta { text: "ship".into() }),
            done(),
        ])]));
        let text = adapter(&client)
            .complete_text(vec![Message::user("summarize")])
            .await
            .unwrap();
        assert_eq!(text, "GOAL: ship");
        assert!(!client.requests.lock().unwrap()[0].stream);
    }

    #[test]
    fn test_mime_type_for() {
        assert_eq!(mime_type_for(Path::new("a.PNG")), "image/png");
        assert_eq!(mime_type_for(Path::new("a.jpeg")), "image/jpeg");
        assert_eq!(mime_type_for(Path::new("a.webp")), "image/webp");
        assert_eq!(mime_type_for(Path::new("a.gif")), "image/gif");
        assert_eq!(mime_type_for(Path::new("noext")), "image/jpeg");
    }

    #[test]
    fn test_attach_image_without_user_message() {
        let mut messages = vec![Message::system("sys")];
        attach_image(&mut messages, "data:image/jpeg;base64,AA".into());
        assert_eq!(messages.len(), 2);
        assert!(messages[1].content.has_image());
    }
}
