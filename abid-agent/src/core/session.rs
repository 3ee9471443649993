use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clients::TokenUsage;
use crate::loop_detector::LoopDetector;
use crate::mcp::McpServerSummary;
use crate::memory::ContextManager;
use crate::persistence::SessionSnapshot;

/// Conversation state driven by one agent at a time.
#[derive(Debug, Clone)]
pub struct Session {
    session_id: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    turn_count: u64,
    context: ContextManager,
    loop_detector: LoopDetector,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStats {
    pub session_id: String,
    pub turn_count: u64,
    pub message_count: usize,
    pub estimated_tokens: usize,
    pub compactions: usize,
    pub total_usage: TokenUsage,
    pub tool_count: usize,
    pub mcp_servers: Vec<McpServerSummary>,
}

impl Session {
    pub fn new(context: ContextManager, loop_detector: LoopDetector) -> Self {
        let now = Utc::now();
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            turn_count: 0,
            context,
            loop_detector,
        }
    }

    /// Rebuilds a session from a snapshot. Stored system messages are dropped
    /// in favour of the system prompt already set on `context`.
    pub fn from_snapshot(
        snapshot: SessionSnapshot,
        mut context: ContextManager,
        loop_detector: LoopDetector,
    ) -> Self {
        context.replay(snapshot.messages);
        context.set_total_usage(snapshot.total_usage);
        Self {
            session_id: snapshot.session_id,
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
            turn_count: snapshot.turn_count,
            context,
            loop_detector,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            turn_count: self.turn_count,
            messages: self.context.request_messages(),
            total_usage: self.context.total_usage(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn turn_count(&self) -> u64 {
        self.turn_count
    }

    pub fn context(&self) -> &ContextManager {
        &self.context
    }

    pub(crate) fn context_mut(&mut self) -> &mut ContextManager {
        &mut self.context
    }

    pub(crate) fn loop_detector_mut(&mut self) -> &mut LoopDetector {
        &mut self.loop_detector
    }

    /// Accounts one completed round-trip with the model.
    pub(crate) fn complete_round(&mut self, usage: Option<&TokenUsage>) {
        if let Some(usage) = usage {
            self.context.add_usage(usage);
        }
        self.turn_count += 1;
        self.touch();
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Drops history and loop state; the session id and counters remain.
    pub fn clear(&mut self) {
        self.context.clear();
        self.loop_detector.clear();
        self.touch();
    }

    pub fn stats(&self, tool_count: usize, mcp_servers: Vec<McpServerSummary>) -> SessionStats {
        SessionStats {
            session_id: self.session_id.clone(),
            turn_count: self.turn_count,
            message_count: self.context.len(),
            estimated_tokens: self.context.estimate_tokens(),
            compactions: self.context.compaction_count(),
            total_usage: self.context.total_usage(),
            tool_count,
            mcp_servers,
        }
    }
}
