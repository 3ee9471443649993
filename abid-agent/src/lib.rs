pub mod clients;
pub mod config;
pub mod core;
pub mod loop_detector;
pub mod mcp;
pub mod memory;
pub mod persistence;
pub mod prompts;
pub mod tools;

pub use clients::{
    LLMClient, LLMError, Message, MessageRole, ProviderAdapter, StreamEvent, TokenUsage, ToolCall,
    ToolDefinition, create_llm_client,
};
pub use config::{ApprovalPolicy, Config, ConfigError, Provider};
pub use core::{Agent, AgentError, AgentEvent, AgentSettings, RunOptions, Session};
pub use loop_detector::LoopDetector;
pub use mcp::{MCPError, MCPManager, MCPServerConfig};
pub use memory::{ContextError, ContextManager};
pub use persistence::{PersistenceError, PersistenceManager, SessionSnapshot};
pub use tools::{ToolExecutor, ToolRegistry, ToolResult, ToolTrait, default_tools};
