pub mod session;

use futures::{Stream, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clients::{LLMError, ProviderAdapter, StreamEvent, TokenUsage, ToolCall};
use crate::config::{ApprovalPolicy, Config, ConfigError};
use crate::loop_detector::{LoopDetector, LoopDetectorConfig};
use crate::mcp::{MCPManager, McpServerSummary};
use crate::memory::{CompactionConfig, ContextError, ContextManager};
use crate::persistence::SessionSnapshot;
use crate::prompts::{build_system_prompt, loop_breaker_prompt};
use crate::tools::{ConfirmationHandler, ToolDescriptor, ToolExecutor, ToolResult, default_tools};

pub use session::{Session, SessionStats};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AgentError {
    #[error(transparent)]
    Provider(#[from] LLMError),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Turn budget of {max_turns} model calls exhausted without a final answer")]
    BudgetExceeded { max_turns: usize },
    #[error("Turn cancelled")]
    Cancelled,
    #[error("Model stream ended before the response was complete")]
    Incomplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    AwaitingModel,
    AwaitingTools,
    Complete,
    Cancelled,
    BudgetExceeded,
    Errored,
}

/// What a caller of [`Agent::run`] observes.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    AgentStart {
        session_id: String,
    },
    TextDelta {
        text: String,
    },
    ToolCallStart {
        call_id: String,
        name: String,
    },
    ToolCallComplete {
        call: ToolCall,
        result: ToolResult,
    },
    LoopDetected {
        description: String,
    },
    ContextCompacted {
        before_tokens: usize,
        after_tokens: usize,
    },
    TextComplete {
        text: String,
    },
    AgentEnd {
        rounds: usize,
        usage: TokenUsage,
    },
    Error {
        error: AgentError,
    },
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Image attached to the first request of the run.
    pub image: Option<PathBuf>,
    pub streaming: bool,
    pub cancel: CancellationToken,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            image: None,
            streaming: true,
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Most model submissions a single run may make.
    pub max_turns: usize,
    pub system_prompt: Option<String>,
    pub compaction: CompactionConfig,
    pub loop_detector: LoopDetectorConfig,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_turns: 200,
            system_prompt: None,
            compaction: CompactionConfig::default(),
            loop_detector: LoopDetectorConfig::default(),
        }
    }
}

/// Everything the model produced in one round, gathered before commit.
#[derive(Default)]
struct RoundOutput {
    text: String,
    /// Calls in arrival order; the second field holds the parse failure of a
    /// call whose arguments were malformed.
    calls: Vec<(ToolCall, Option<String>)>,
    usage: Option<TokenUsage>,
    completed: bool,
}

pub struct Agent {
    adapter: ProviderAdapter,
    executor: ToolExecutor,
    mcp: MCPManager,
    settings: AgentSettings,
    session: Session,
    state: AgentState,
}

impl Agent {
    pub fn new(
        adapter: ProviderAdapter,
        executor: ToolExecutor,
        mcp: MCPManager,
        settings: AgentSettings,
    ) -> Self {
        let session = fresh_session(&settings);
        Self {
            adapter,
            executor,
            mcp,
            settings,
            session,
            state: AgentState::Idle,
        }
    }

    /// Validates the config, connects MCP servers and assembles the agent.
    pub async fn from_config(
        config: &Config,
        confirmation: Arc<dyn ConfirmationHandler>,
    ) -> Result<Self, AgentError> {
        config.validate()?;
        let adapter = ProviderAdapter::from_config(config)?;

        let mut registry = default_tools(config.cwd.clone());
        registry.restrict_to(config.allowed_tools.clone());
        let registry = registry.into_shared();

        let mut mcp = MCPManager::new(config.mcp_servers.clone(), config.tool_timeout);
        mcp.initialize(&registry).await;

        let definitions = registry.read().await.definitions();
        let system_prompt = build_system_prompt(
            &definitions,
            &config.cwd.display().to_string(),
            config.developer_instructions.as_deref(),
            config.user_instructions.as_deref(),
        );

        let executor = ToolExecutor::new(
            registry,
            config.approval,
            confirmation,
            config.tool_timeout,
        );
        let settings = AgentSettings {
            max_turns: config.max_turns,
            system_prompt: Some(system_prompt),
            compaction: CompactionConfig::with_context_window(config.model.context_window),
            loop_detector: LoopDetectorConfig::default(),
        };

        info!(
            provider = %adapter.provider_name(),
            model = %adapter.model(),
            tools = definitions.len(),
            "agent ready"
        );
        Ok(Self::new(adapter, executor, mcp, settings))
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn adapter(&self) -> &ProviderAdapter {
        &self.adapter
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.adapter.set_model(model);
    }

    pub fn approval_policy(&self) -> ApprovalPolicy {
        self.executor.policy()
    }

    pub fn set_approval_policy(&mut self, policy: ApprovalPolicy) {
        self.executor.set_policy(policy);
    }

    pub async fn tools(&self) -> Vec<ToolDescriptor> {
        self.executor.registry().read().await.list()
    }

    pub fn mcp_servers(&self) -> Vec<McpServerSummary> {
        self.mcp.get_all_servers()
    }

    pub async fn stats(&self) -> SessionStats {
        let tool_count = self.executor.registry().read().await.len();
        self.session.stats(tool_count, self.mcp.get_all_servers())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.snapshot()
    }

    /// Replaces the current session with one rebuilt from `snapshot`.
    pub fn restore(&mut self, snapshot: SessionSnapshot) {
        info!(session_id = %snapshot.session_id, "restoring session");
        self.session = Session::from_snapshot(
            snapshot,
            ContextManager::new(self.settings.system_prompt.clone(), self.settings.compaction),
            LoopDetector::new(self.settings.loop_detector),
        );
        self.state = AgentState::Idle;
    }

    pub fn clear_history(&mut self) {
        self.session.clear();
        self.state = AgentState::Idle;
    }

    pub fn new_session(&mut self) {
        self.session = fresh_session(&self.settings);
        self.state = AgentState::Idle;
    }

    pub async fn shutdown(&mut self) {
        self.mcp.shutdown().await;
    }

    /// Runs one user message to completion.
    ///
    /// Each round submits the history, forwards text as it streams, then runs
    /// the requested tools in order and appends their results. The run ends
    /// with [`AgentEvent::TextComplete`] and [`AgentEvent::AgentEnd`] when the
    /// model answers without tool calls, or with a single
    /// [`AgentEvent::Error`]. A cancelled or failed round leaves no partial
    /// assistant message in history.
    pub fn run(
        &mut self,
        message: String,
        options: RunOptions,
    ) -> impl Stream<Item = AgentEvent> + Send + '_ {
        async_stream::stream! {
            let max_turns = self.settings.max_turns;
            info!(session_id = %self.session.session_id(), max_turns, "run started");
            yield AgentEvent::AgentStart {
                session_id: self.session.session_id().to_string(),
            };

            if let Err(error) = self.session.context_mut().add_user_message(message) {
                self.state = AgentState::Errored;
                yield AgentEvent::Error { error: error.into() };
                return;
            }
            self.session.touch();

            let mut rounds = 0usize;
            let mut usage = TokenUsage::default();
            loop {
                if options.cancel.is_cancelled() {
                    self.state = AgentState::Cancelled;
                    yield AgentEvent::Error { error: AgentError::Cancelled };
                    return;
                }
                if rounds >= max_turns {
                    warn!(max_turns, "turn budget exhausted");
                    self.state = AgentState::BudgetExceeded;
                    yield AgentEvent::Error {
                        error: AgentError::BudgetExceeded { max_turns },
                    };
                    return;
                }

                if let Some(description) = self.session.loop_detector_mut().check() {
                    warn!(%description, "loop detected, injecting corrective instruction");
                    let injected = self
                        .session
                        .context_mut()
                        .add_user_message(loop_breaker_prompt(&description));
                    if let Err(error) = injected {
                        self.state = AgentState::Errored;
                        yield AgentEvent::Error { error: error.into() };
                        return;
                    }
                    self.session.loop_detector_mut().clear();
                    yield AgentEvent::LoopDetected { description };
                }

                if self.session.context().needs_compaction() {
                    let before_tokens = self.session.context().estimate_tokens();
                    match self.session.context_mut().compact(&self.adapter).await {
                        Ok(true) => {
                            let after_tokens = self.session.context().estimate_tokens();
                            yield AgentEvent::ContextCompacted { before_tokens, after_tokens };
                        }
                        Ok(false) => {}
                        Err(error) => warn!(%error, "compaction failed, sending full history"),
                    }
                }

                rounds += 1;
                self.state = AgentState::AwaitingModel;
                let history = self.session.context().request_messages();
                let tools = self.executor.registry().read().await.definitions();
                let image = if rounds == 1 { options.image.clone() } else { None };
                debug!(round = rounds, messages = history.len(), tools = tools.len(), "model round");

                let mut round = RoundOutput::default();
                let mut failure: Option<AgentError> = None;
                let mut cancelled = false;
                {
                    let events = self.adapter.stream(history, tools, options.streaming, image);
                    futures::pin_mut!(events);
                    loop {
                        let next = tokio::select! {
                            biased;
                            _ = options.cancel.cancelled() => None,
                            event = events.next() => Some(event),
                        };
                        let Some(next) = next else {
                            cancelled = true;
                            break;
                        };
                        let Some(event) = next else {
                            break;
                        };
                        match event {
                            StreamEvent::TextDelta { text } => {
                                round.text.push_str(&text);
                                yield AgentEvent::TextDelta { text };
                            }
                            StreamEvent::ToolCallStart { call_id, name, .. } => {
                                yield AgentEvent::ToolCallStart { call_id, name };
                            }
                            StreamEvent::ToolCallDelta { .. } => {}
                            StreamEvent::ToolCallComplete { call } => round.calls.push((call, None)),
                            StreamEvent::MessageComplete { usage, .. } => {
                                round.usage = usage;
                                round.completed = true;
                            }
                            StreamEvent::Error {
                                error: LLMError::MalformedToolArguments { call_id, name, reason },
                            } => {
                                warn!(%call_id, tool = %name, %reason, "malformed tool arguments");
                                let call = ToolCall {
                                    call_id,
                                    name,
                                    arguments: serde_json::Map::new(),
                                };
                                round.calls.push((call, Some(reason)));
                            }
                            StreamEvent::Error { error } => {
                                failure = Some(error.into());
                                break;
                            }
                        }
                    }
                }

                if cancelled {
                    info!(round = rounds, "run cancelled while awaiting the model");
                    self.state = AgentState::Cancelled;
                    yield AgentEvent::Error { error: AgentError::Cancelled };
                    return;
                }
                if failure.is_none() && !round.completed {
                    failure = Some(AgentError::Incomplete);
                }
                if let Some(error) = failure {
                    self.state = AgentState::Errored;
                    yield AgentEvent::Error { error };
                    return;
                }

                let calls: Vec<ToolCall> = round.calls.iter().map(|(call, _)| call.clone()).collect();
                if let Err(error) = self
                    .session
                    .context_mut()
                    .add_assistant_message(round.text.clone(), calls)
                {
                    self.state = AgentState::Errored;
                    yield AgentEvent::Error { error: error.into() };
                    return;
                }
                self.session.loop_detector_mut().record_text(&round.text);
                if let Some(delta) = &round.usage {
                    usage.accumulate(delta);
                }
                self.session.complete_round(round.usage.as_ref());

                if round.calls.is_empty() {
                    self.state = AgentState::Complete;
                    info!(rounds, total_tokens = usage.total_tokens, "run complete");
                    yield AgentEvent::TextComplete { text: round.text };
                    yield AgentEvent::AgentEnd { rounds, usage };
                    return;
                }

                self.state = AgentState::AwaitingTools;
                let mut interrupted = false;
                for (call, malformed) in round.calls {
                    let result = if interrupted || options.cancel.is_cancelled() {
                        interrupted = true;
                        ToolResult::failure("Cancelled before execution")
                    } else if let Some(reason) = malformed {
                        ToolResult::failure(format!("Invalid arguments: {reason}"))
                    } else {
                        self.session
                            .loop_detector_mut()
                            .record_tool_call(&call.name, &call.arguments);
                        tokio::select! {
                            biased;
                            _ = options.cancel.cancelled() => {
                                interrupted = true;
                                ToolResult::failure("Cancelled during execution")
                            }
                            result = self.executor.execute(&call) => result,
                        }
                    };

                    if let Err(error) = self
                        .session
                        .context_mut()
                        .add_tool_result(&call.call_id, result.clone())
                    {
                        self.state = AgentState::Errored;
                        yield AgentEvent::Error { error: error.into() };
                        return;
                    }
                    yield AgentEvent::ToolCallComplete { call, result };
                }

                if interrupted {
                    info!(round = rounds, "run cancelled during tool execution");
                    self.state = AgentState::Cancelled;
                    yield AgentEvent::Error { error: AgentError::Cancelled };
                    return;
                }
            }
        }
    }

    /// Drains [`Agent::run`] and returns the final text.
    pub async fn run_to_completion(
        &mut self,
        message: String,
        options: RunOptions,
    ) -> Result<String, AgentError> {
        let events = self.run(message, options);
        futures::pin_mut!(events);

        let mut final_text = None;
        while let Some(event) = events.next().await {
            match event {
                AgentEvent::TextComplete { text } => final_text = Some(text),
                AgentEvent::Error { error } => return Err(error),
                _ => {}
            }
        }
        final_text.ok_or(AgentError::Incomplete)
    }
}

fn fresh_session(settings: &AgentSettings) -> Session {
    Session::new(
        ContextManager::new(settings.system_prompt.clone(), settings.compaction),
        LoopDetector::new(settings.loop_detector),
    )
}
