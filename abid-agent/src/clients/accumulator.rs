//! Per-index assembly of tool calls that arrive in fragments.
//!
//! Incremental backends split a tool call across many chunks, tagged by an
//! integer index. Each index owns a [`PartialToolCall`] that accumulates the id,
//! name and argument text until the round ends, then completes exactly once.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::warn;

use super::{LLMError, StreamEvent, TokenUsage, ToolCall};

/// One piece of a tool call as reported by a backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallFragment {
    pub index: u32,
    pub call_id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Accumulating,
    Complete,
}

#[derive(Debug, Clone)]
pub struct PartialToolCall {
    index: u32,
    call_id: String,
    name: String,
    arguments: String,
    announced: bool,
    phase: CallPhase,
}

impl PartialToolCall {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            call_id: String::new(),
            name: String::new(),
            arguments: String::new(),
            announced: false,
            phase: CallPhase::Accumulating,
        }
    }

    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    pub fn arguments(&self) -> &str {
        &self.arguments
    }

    pub fn apply(&mut self, fragment: ToolCallFragment) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.phase == CallPhase::Complete {
            warn!(index = self.index, "ignoring fragment for completed tool call");
            return events;
        }

        if let Some(id) = fragment.call_id.filter(|id| !id.is_empty()) {
            if self.call_id.is_empty() {
                self.call_id = id;
            }
        }
        if let Some(name) = fragment.name.filter(|name| !name.is_empty()) {
            if self.name.is_empty() {
                self.name = name;
            }
        }

        if !self.announced && !self.name.is_empty() {
            self.announced = true;
            events.push(StreamEvent::ToolCallStart {
                index: self.index,
                call_id: self.effective_id(),
                name: self.name.clone(),
            });
        }

        if let Some(delta) = fragment.arguments.filter(|delta| !delta.is_empty()) {
            self.arguments.push_str(&delta);
            events.push(StreamEvent::ToolCallDelta {
                index: self.index,
                call_id: self.effective_id(),
                arguments_delta: delta,
            });
        }

        events
    }

    /// Moves the call to `Complete`, parsing the accumulated argument text once.
    pub fn complete(&mut self) -> Result<ToolCall, LLMError> {
        self.phase = CallPhase::Complete;
        let call_id = self.effective_id();

        if self.name.is_empty() {
            return Err(LLMError::MalformedToolArguments {
                call_id,
                name: String::new(),
                reason: "tool call has no name".to_string(),
            });
        }

        match parse_tool_arguments(&self.arguments) {
            Ok(arguments) => Ok(ToolCall {
                call_id,
                name: self.name.clone(),
                arguments,
            }),
            Err(reason) => Err(LLMError::MalformedToolArguments {
                call_id,
                name: self.name.clone(),
                reason,
            }),
        }
    }

    fn effective_id(&self) -> String {
        if self.call_id.is_empty() {
            format!("call_{}", self.index)
        } else {
            self.call_id.clone()
        }
    }
}

#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<u32, PartialToolCall>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, fragment: ToolCallFragment) -> Vec<StreamEvent> {
        self.calls
            .entry(fragment.index)
            .or_insert_with(|| PartialToolCall::new(fragment.index))
            .apply(fragment)
    }

    /// Completes every call in index order. A call whose arguments do not parse
    /// yields an error event in its place instead of being dropped.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        self.calls
            .values_mut()
            .filter(|call| call.phase() == CallPhase::Accumulating)
            .map(|call| match call.complete() {
                Ok(call) => StreamEvent::ToolCallComplete { call },
                Err(error) => StreamEvent::Error { error },
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }
}

/// Parses accumulated argument text into a JSON object. Blank text means no arguments.
pub fn parse_tool_arguments(raw: &str) -> Result<Map<String, Value>, String> {
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("expected a JSON object, got {other}")),
        Err(e) => Err(format!("invalid JSON: {e}")),
    }
}

/// Builds the canonical event sequence for a backend that answers with one document.
pub fn synthesize_events(
    text: Option<String>,
    tool_calls: Vec<ToolCallFragment>,
    finish_reason: Option<String>,
    usage: Option<TokenUsage>,
) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    if let Some(text) = text.filter(|text| !text.is_empty()) {
        events.push(StreamEvent::TextDelta { text });
    }

    let mut accumulator = ToolCallAccumulator::new();
    for fragment in tool_calls {
        events.extend(accumulator.apply(fragment));
    }
    events.extend(accumulator.finish());
    events.push(StreamEvent::MessageComplete {
        finish_reason,
        usage,
    });
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn fragment(
        index: u32,
        id: Option<&str>,
        name: Option<&str>,
        args: Option<&str>,
    ) -> ToolCallFragment {
        ToolCallFragment {
            index,
            call_id: id.map(String::from),
            name: name.map(String::from),
            arguments: args.map(String::from),
        }
    }

    fn completed(events: &[StreamEvent]) -> Vec<ToolCall> {
        events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::ToolCallComplete { call } => Some(call.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_fragments_parse_like_single_payload() {
        let payload = r#"{"path": "src/main.rs", "lines": [1, 2, 3], "opts": {"deep": true}}"#;
        let mut accumulator = ToolCallAccumulator::new();
        accumulator.apply(fragment(0, Some("call_a"), Some("read_file"), None));
        for piece in payload.as_bytes().chunks(7) {
            let piece = std::str::from_utf8(piece).unwrap();
            accumulator.apply(fragment(0, None, None, Some(piece)));
        }
        let calls = completed(&accumulator.finish());

        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].call_id, "call_a");
        assert_eq!(calls[0].arguments, parse_tool_arguments(payload).unwrap());
    }

    #[test]
    fn test_interleaved_indices_stay_separate() {
        let mut accumulator = ToolCallAccumulator::new();
        accumulator.apply(fragment(1, Some("b"), Some("grep"), Some(r#"{"pattern":"#)));
        accumulator.apply(fragment(0, Some("a"), Some("list_dir"), Some(r#"{"path""#)));
        accumulator.apply(fragment(1, None, None, Some(r#""fn"}"#)));
        accumulator.apply(fragment(0, None, None, Some(r#":"."}"#)));

        let calls = completed(&accumulator.finish());
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "list_dir");
        assert_eq!(calls[0].arguments["path"], ".");
        assert_eq!(calls[1].name, "grep");
        assert_eq!(calls[1].arguments["pattern"], "fn");
    }

    #[test]
    fn test_start_is_announced_once() {
        let mut call = PartialToolCall::new(0);
        let first = call.apply(fragment(0, Some("x"), Some("glob"), Some("{")));
        let second = call.apply(fragment(0, None, Some("glob"), Some("}")));

        assert!(matches!(first[0], StreamEvent::ToolCallStart { .. }));
        assert!(matches!(first[1], StreamEvent::ToolCallDelta { .. }));
        assert_eq!(second.len(), 1);
        assert_eq!(call.arguments(), "{}");
    }

    #[test]
    fn test_malformed_arguments_yield_error_event() {
        let mut accumulator = ToolCallAccumulator::new();
        accumulator.apply(fragment(0, Some("c1"), Some("write_file"), Some(r#"{"path": "a"#)));
        let events = accumulator.finish();

        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Error {
                error: LLMError::MalformedToolArguments { call_id, name, .. },
            } => {
                assert_eq!(call_id, "c1");
                assert_eq!(name, "write_file");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_missing_id_is_synthesized_from_index() {
        let mut accumulator = ToolCallAccumulator::new();
        accumulator.apply(fragment(3, None, Some("list_dir"), None));
        let calls = completed(&accumulator.finish());
        assert_eq!(calls[0].call_id, "call_3");
        assert!(calls[0].arguments.is_empty());
    }

    #[test]
    fn test_finish_completes_only_once() {
        let mut accumulator = ToolCallAccumulator::new();
        accumulator.apply(fragment(0, Some("a"), Some("list_dir"), Some("{}")));
        assert_eq!(accumulator.finish().len(), 1);
        assert!(accumulator.finish().is_empty());
        assert!(accumulator.apply(fragment(0, None, None, Some("x"))).is_empty());
    }

    #[rstest]
    #[case("", true)]
    #[case("   ", true)]
    #[case(r#"{"a": 1}"#, true)]
    #[case("[1, 2]", false)]
    #[case("\"text\"", false)]
    #[case("{not json}", false)]
    fn test_parse_tool_arguments(#[case] raw: &str, #[case] ok: bool) {
        assert_eq!(parse_tool_arguments(raw).is_ok(), ok);
    }

    #[test]
    fn test_synthesize_events_order() {
        let events = synthesize_events(
            Some("Looking.".to_string()),
            vec![fragment(0, Some("id1"), Some("list_dir"), Some(r#"{"path":"."}"#))],
            Some("tool_calls".to_string()),
            None,
        );

        assert!(matches!(events[0], StreamEvent::TextDelta { .. }));
        assert!(matches!(events[1], StreamEvent::ToolCallStart { .. }));
        assert!(matches!(events[2], StreamEvent::ToolCallDelta { .. }));
        assert!(matches!(events[3], StreamEvent::ToolCallComplete { .. }));
        assert!(matches!(
            events[4],
            StreamEvent::MessageComplete { usage: None, .. }
        ));
    }
}
