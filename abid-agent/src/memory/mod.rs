//! Conversation history, usage accounting and compaction.

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clients::{Content, Message, MessageRole, TokenUsage, ToolCall};
use crate::prompts::{build_summary_message, compression_prompt};
use crate::tools::ToolResult;

const DEFAULT_CONTEXT_WINDOW: usize = 32_000;
const DEFAULT_THRESHOLD: f64 = 0.8;
const DEFAULT_PRESERVE_RECENT_TURNS: usize = 2;
const DEFAULT_CHARS_PER_TOKEN: usize = 4;
const TOOL_CALL_TOKEN_OVERHEAD: usize = 20;
const TRANSCRIPT_RESULT_LIMIT: usize = 2_000;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ContextError {
    #[error("Tool calls still awaiting results: {0:?}")]
    PendingToolCalls(Vec<String>),
    #[error("No pending tool call with id {0}")]
    UnknownToolCall(String),
    #[error("Tool call {0} already has a result")]
    DuplicateToolResult(String),
    #[error("Summarization failed: {0}")]
    Summarization(String),
}

/// Produces the text that replaces compacted history.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, messages: Vec<Message>) -> Result<String, ContextError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompactionConfig {
    pub context_window: usize,
    /// Fraction of the window at which compaction kicks in.
    pub threshold: f64,
    /// Model rounds kept verbatim by compaction.
    pub preserve_recent_turns: usize,
    pub chars_per_token: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            context_window: DEFAULT_CONTEXT_WINDOW,
            threshold: DEFAULT_THRESHOLD,
            preserve_recent_turns: DEFAULT_PRESERVE_RECENT_TURNS,
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
        }
    }
}

impl CompactionConfig {
    pub fn with_context_window(context_window: usize) -> Self {
        Self {
            context_window,
            ..Self::default()
        }
    }

    fn limit(&self) -> usize {
        (self.context_window as f64 * self.threshold) as usize
    }
}

/// Ordered history for one session.
///
/// Every assistant message that carries tool calls must be answered by one
/// tool message per call id before any other message is appended.
#[derive(Debug, Clone)]
pub struct ContextManager {
    system_prompt: Option<String>,
    messages: Vec<Message>,
    pending: Vec<String>,
    total_usage: TokenUsage,
    config: CompactionConfig,
    compaction_count: usize,
}

impl ContextManager {
    pub fn new(system_prompt: Option<String>, config: CompactionConfig) -> Self {
        Self {
            system_prompt,
            messages: Vec::new(),
            pending: Vec::new(),
            total_usage: TokenUsage::default(),
            config,
            compaction_count: 0,
        }
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    pub fn set_system_prompt(&mut self, system_prompt: Option<String>) {
        self.system_prompt = system_prompt;
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn pending_tool_calls(&self) -> &[String] {
        &self.pending
    }

    pub fn compaction_count(&self) -> usize {
        self.compaction_count
    }

    /// Full request history: the system prompt first, then the conversation.
    pub fn request_messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.messages.len() + 1);
        if let Some(prompt) = &self.system_prompt {
            messages.push(Message::system(prompt.clone()));
        }
        messages.extend(self.messages.iter().cloned());
        messages
    }

    pub fn add_user_message(&mut self, content: impl Into<Content>) -> Result<(), ContextError> {
        self.ensure_resolved()?;
        self.messages.push(Message::user(content));
        Ok(())
    }

    pub fn add_assistant_message(
        &mut self,
        text: impl Into<String>,
        tool_calls: Vec<ToolCall>,
    ) -> Result<(), ContextError> {
        self.ensure_resolved()?;
        self.pending = tool_calls.iter().map(|c| c.call_id.clone()).collect();
        self.messages.push(Message::assistant(text, tool_calls));
        Ok(())
    }

    pub fn add_tool_result(
        &mut self,
        call_id: &str,
        result: ToolResult,
    ) -> Result<(), ContextError> {
        let Some(position) = self.pending.iter().position(|id| id == call_id) else {
            let answered = self
                .messages
                .iter()
                .any(|m| m.role == MessageRole::Tool && m.tool_call_id.as_deref() == Some(call_id));
            return Err(if answered {
                ContextError::DuplicateToolResult(call_id.to_string())
            } else {
                ContextError::UnknownToolCall(call_id.to_string())
            });
        };
        self.pending.remove(position);
        self.messages.push(Message::tool(call_id, result));
        Ok(())
    }

    fn ensure_resolved(&self) -> Result<(), ContextError> {
        if self.pending.is_empty() {
            Ok(())
        } else {
            Err(ContextError::PendingToolCalls(self.pending.clone()))
        }
    }

    pub fn add_usage(&mut self, usage: &TokenUsage) {
        self.total_usage.accumulate(usage);
    }

    pub fn total_usage(&self) -> TokenUsage {
        self.total_usage
    }

    pub fn set_total_usage(&mut self, usage: TokenUsage) {
        self.total_usage = usage;
    }

    /// Cheap size proxy: characters over chars-per-token plus a flat cost per tool call.
    pub fn estimate_tokens(&self) -> usize {
        let system_chars = self
            .system_prompt
            .as_ref()
            .map_or(0, |p| p.chars().count());
        let mut chars = system_chars;
        let mut calls = 0;
        for message in &self.messages {
            chars += message.content.char_len();
            for call in message.tool_calls() {
                chars += call.name.len() + call.arguments_json().len();
                calls += 1;
            }
        }
        chars / self.config.chars_per_token.max(1) + calls * TOOL_CALL_TOKEN_OVERHEAD
    }

    pub fn needs_compaction(&self) -> bool {
        self.estimate_tokens() >= self.config.limit()
    }

    /// Replaces everything before the most recent turns with one summary message.
    ///
    /// Returns `Ok(false)` when there is nothing old enough to compact. On error
    /// the history is left untouched.
    pub async fn compact<S: Summarizer + ?Sized>(
        &mut self,
        summarizer: &S,
    ) -> Result<bool, ContextError> {
        let Some(split) = self.split_point() else {
            debug!("nothing to compact");
            return Ok(false);
        };

        let before = self.estimate_tokens();
        let mut request = render_transcript(&self.messages[..split]);
        request.push_str("\n\n");
        request.push_str(compression_prompt());

        let summary = summarizer.summarize(vec![Message::user(request)]).await?;
        if summary.trim().is_empty() {
            return Err(ContextError::Summarization(
                "summarizer returned empty text".to_string(),
            ));
        }

        let recent = self.messages.split_off(split);
        self.messages = Vec::with_capacity(recent.len() + 1);
        self.messages.push(Message::user(build_summary_message(&summary)));
        self.messages.extend(recent);
        self.compaction_count += 1;

        info!(
            before_tokens = before,
            after_tokens = self.estimate_tokens(),
            compacted_messages = split,
            "compacted conversation"
        );
        Ok(true)
    }

    /// Index of the first message that must survive compaction: the start of
    /// the K-th most recent model round, never past an unresolved tool call.
    ///
    /// A round begins at an assistant message; the user message that prompted
    /// it stays with it.
    fn split_point(&self) -> Option<usize> {
        let round_starts: Vec<usize> = self
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role == MessageRole::Assistant)
            .map(|(i, _)| i)
            .collect();

        let keep = self.config.preserve_recent_turns;
        let mut split = if keep == 0 {
            self.messages.len()
        } else if round_starts.len() > keep {
            let start = round_starts[round_starts.len() - keep];
            if self.messages[start - 1].role == MessageRole::User {
                start - 1
            } else {
                start
            }
        } else {
            return None;
        };

        if !self.pending.is_empty() {
            if let Some(holder) = self
                .messages
                .iter()
                .rposition(|m| m.tool_calls().iter().any(|c| self.pending.contains(&c.call_id)))
            {
                split = split.min(holder);
            }
        }

        (split > 0).then_some(split)
    }

    /// Drops the in-memory history. Usage totals are kept.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.pending.clear();
    }

    /// Rebuilds history from stored messages. System messages are skipped;
    /// the current system prompt is used instead.
    pub fn replay(&mut self, messages: Vec<Message>) {
        self.clear();
        self.messages = messages
            .into_iter()
            .filter(|m| m.role != MessageRole::System)
            .collect();
        self.pending = self.unresolved_calls();
        if !self.pending.is_empty() {
            warn!(pending = ?self.pending, "replayed history ends with unresolved tool calls");
        }
    }

    fn unresolved_calls(&self) -> Vec<String> {
        let Some(holder) = self
            .messages
            .iter()
            .rposition(|m| m.role == MessageRole::Assistant && !m.tool_calls().is_empty())
        else {
            return Vec::new();
        };
        self.messages[holder]
            .tool_calls()
            .iter()
            .map(|c| c.call_id.clone())
            .filter(|id| {
                !self.messages[holder + 1..]
                    .iter()
                    .any(|m| m.tool_call_id.as_deref() == Some(id.as_str()))
            })
            .collect()
    }
}

fn render_transcript(messages: &[Message]) -> String {
    let mut out = String::new();
    for message in messages {
        match message.role {
            MessageRole::System => continue,
            MessageRole::User => {
                out.push_str("USER: ");
                out.push_str(&message.content.text());
            }
            MessageRole::Assistant => {
                out.push_str("ASSISTANT: ");
                out.push_str(&message.content.text());
                for call in message.tool_calls() {
                    out.push_str(&format!("\n  -> {}({})", call.name, call.arguments_json()));
                }
            }
            MessageRole::Tool => {
                let text = message.content.text();
                let clipped: String = text.chars().take(TRANSCRIPT_RESULT_LIMIT).collect();
                out.push_str("TOOL RESULT: ");
                out.push_str(&clipped);
                if clipped.len() < text.len() {
                    out.push_str(" ...");
                }
            }
        }
        out.push_str("\n\n");
    }
    out.trim_end().to_string()
}
