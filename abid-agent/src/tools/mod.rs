pub mod builtin;
pub mod executor;

use futures::Future;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::clients::ToolDefinition;

pub use builtin::{FileReadTool, FileWriteTool, GrepTool, ListDirTool, RunCommandTool};
pub use executor::{
    AutoApprove, ConfirmationHandler, ConfirmationReason, ConfirmationRequest, ToolExecutor,
};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ToolError {
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Unknown tool: {0}")]
    NotFound(String),
    #[error("Tool is disabled: {0}")]
    Disabled(String),
    #[error("Tool {name} timed out after {seconds}s")]
    Timeout { name: String, seconds: u64 },
    #[error("MCP server {server} is {status}")]
    ServerUnavailable { server: String, status: String },
    #[error("Rejected: {0}")]
    Rejected(String),
}

impl From<std::io::Error> for ToolError {
    fn from(error: std::io::Error) -> Self {
        ToolError::IoError(error.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Local,
    Mcp,
}

/// What a tool can do to the workspace; drives approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolEffect {
    ReadOnly,
    Edit,
    Execute,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub kind: ToolKind,
    pub effect: ToolEffect,
    pub enabled: bool,
}

impl ToolDescriptor {
    pub fn local(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        effect: ToolEffect,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            kind: ToolKind::Local,
            effect,
            enabled: true,
        }
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

/// Outcome of one tool call, kept in history next to the text the model sees.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default)]
    pub output: String,
    pub error: Option<String>,
    pub metadata: Option<Value>,
    pub diff: Option<String>,
    pub exit_code: Option<i32>,
}

impl ToolResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_diff(mut self, diff: impl Into<String>) -> Self {
        self.diff = Some(diff.into());
        self
    }

    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }

    /// Text sent back to the model for this result.
    pub fn to_model_content(&self) -> String {
        if self.success {
            return if self.output.is_empty() {
                "(no output)".to_string()
            } else {
                self.output.clone()
            };
        }

        let mut content = format!(
            "Error: {}",
            self.error.as_deref().unwrap_or("tool execution failed")
        );
        if !self.output.is_empty() {
            content.push('\n');
            content.push_str(&self.output);
        }
        if let Some(code) = self.exit_code {
            content.push_str(&format!("\nExit code: {code}"));
        }
        content
    }
}

impl From<ToolError> for ToolResult {
    fn from(error: ToolError) -> Self {
        ToolResult::failure(error.to_string())
    }
}

pub type ToolFuture = Pin<Box<dyn Future<Output = Result<ToolResult, ToolError>> + Send>>;

pub trait ToolTrait: Send + Sync {
    fn info(&self) -> ToolDescriptor;
    fn execute(&self, arguments: Map<String, Value>) -> ToolFuture;
}

struct RegisteredTool {
    descriptor: ToolDescriptor,
    handler: Arc<dyn ToolTrait>,
}

/// Name-keyed set of local and MCP-routed tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
    allowed: Option<BTreeSet<String>>,
}

pub type SharedToolRegistry = Arc<RwLock<ToolRegistry>>;

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_shared(self) -> SharedToolRegistry {
        Arc::new(RwLock::new(self))
    }

    /// Registers a handler under its descriptor name, replacing any previous one.
    pub fn register(&mut self, handler: Arc<dyn ToolTrait>) -> Option<ToolDescriptor> {
        let descriptor = handler.info();
        self.tools
            .insert(
                descriptor.name.clone(),
                RegisteredTool {
                    descriptor,
                    handler,
                },
            )
            .map(|previous| previous.descriptor)
    }

    /// Whether a tool is registered under `name`, allowed or not.
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    /// Drops every tool whose descriptor fails `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(&ToolDescriptor) -> bool) {
        self.tools.retain(|_, tool| keep(&tool.descriptor));
    }

    /// Limits the visible tools to `names`; `None` lifts the restriction.
    pub fn restrict_to(&mut self, names: Option<Vec<String>>) {
        self.allowed = names.map(|names| names.into_iter().collect());
    }

    fn is_allowed(&self, name: &str) -> bool {
        self.allowed
            .as_ref()
            .is_none_or(|allowed| allowed.contains(name))
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        if !self.is_allowed(name) {
            return None;
        }
        self.tools.get(name).map(|tool| &tool.descriptor)
    }

    pub fn handler(&self, name: &str) -> Option<(ToolDescriptor, Arc<dyn ToolTrait>)> {
        if !self.is_allowed(name) {
            return None;
        }
        self.tools
            .get(name)
            .map(|tool| (tool.descriptor.clone(), Arc::clone(&tool.handler)))
    }

    pub fn list(&self) -> Vec<ToolDescriptor> {
        self.tools
            .values()
            .filter(|tool| self.is_allowed(&tool.descriptor.name))
            .map(|tool| tool.descriptor.clone())
            .collect()
    }

    /// Schemas of every enabled, allowed tool, as sent to the model.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .filter(|tool| tool.descriptor.enabled && self.is_allowed(&tool.descriptor.name))
            .map(|tool| tool.descriptor.definition())
            .collect()
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.tools.get_mut(name) {
            Some(tool) => {
                tool.descriptor.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.list().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn default_tools(base_path: PathBuf) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    registry.register(Arc::new(FileReadTool::new(base_path.clone())));
    registry.register(Arc::new(FileWriteTool::new(base_path.clone())));
    registry.register(Arc::new(ListDirTool::new(base_path.clone())));
    registry.register(Arc::new(GrepTool::new(base_path.clone())));
    registry.register(Arc::new(RunCommandTool::new(base_path)));

    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_content_for_success_and_failure() {
        assert_eq!(ToolResult::success("a.txt").to_model_content(), "a.txt");
        assert_eq!(ToolResult::success("").to_model_content(), "(no output)");

        let failed = ToolResult::failure("Command exited with code 2")
            .with_output("ls: cannot access 'x'")
            .with_exit_code(Some(2));
        assert_eq!(
            failed.to_model_content(),
            "Error: Command exited with code 2\nls: cannot access 'x'\nExit code: 2"
        );
    }

    #[test]
    fn test_tool_result_serialization_skips_absent_fields() {
        let json = serde_json::to_value(ToolResult::success("ok")).unwrap();
        assert_eq!(json, serde_json::json!({"success": true, "output": "ok"}));
    }

    #[test]
    fn test_default_tools_registered() {
        let registry = default_tools(PathBuf::from("."));
        let names: Vec<String> = registry.list().into_iter().map(|d| d.name).collect();
        assert_eq!(
            names,
            vec!["grep", "list_dir", "read_file", "run_command", "write_file"]
        );
        assert_eq!(registry.get("write_file").unwrap().effect, ToolEffect::Edit);
        assert_eq!(registry.get("run_command").unwrap().effect, ToolEffect::Execute);
        assert_eq!(registry.get("read_file").unwrap().kind, ToolKind::Local);
    }

    #[test]
    fn test_restrict_and_disable() {
        let mut registry = default_tools(PathBuf::from("."));
        registry.restrict_to(Some(vec!["read_file".into(), "grep".into()]));
        assert!(registry.get("write_file").is_none());
        assert!(registry.handler("write_file").is_none());
        assert_eq!(registry.len(), 2);

        assert!(registry.set_enabled("grep", false));
        let definitions: Vec<String> = registry.definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(definitions, vec!["read_file"]);
        assert!(!registry.get("grep").unwrap().enabled);

        registry.restrict_to(None);
        assert_eq!(registry.len(), 5);
        assert!(!registry.set_enabled("missing", true));
    }

    #[test]
    fn test_retain_and_unregister() {
        let mut registry = default_tools(PathBuf::from("."));
        registry.retain(|d| d.effect == ToolEffect::ReadOnly);
        assert_eq!(registry.len(), 3);
        assert!(registry.unregister("grep"));
        assert!(!registry.unregister("grep"));
    }
}
