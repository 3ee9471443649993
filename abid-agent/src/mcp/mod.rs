pub mod protocol;
pub mod transport;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use serde_with::{DurationSecondsWithFrac, serde_as};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::tools::{
    SharedToolRegistry, ToolDescriptor, ToolEffect, ToolError, ToolFuture, ToolKind, ToolTrait,
};
pub use protocol::{CallToolResult, McpToolInfo};
pub use transport::{HttpTransport, McpTransport, StdioTransport};

const CLIENT_NAME: &str = "abid";
const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MCPError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),
    #[error("Server not found: {0}")]
    ServerNotFound(String),
    #[error("Tool call failed: {0}")]
    ToolCallFailed(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Protocol error: {0}")]
    ProtocolError(String),
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("Invalid server config: {0}")]
    InvalidConfig(String),
}

impl From<std::io::Error> for MCPError {
    fn from(error: std::io::Error) -> Self {
        MCPError::ConnectionFailed(error.to_string())
    }
}

impl From<serde_json::Error> for MCPError {
    fn from(error: serde_json::Error) -> Self {
        MCPError::ProtocolError(error.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum McpTransportConfig {
    Stdio {
        command: String,
        args: Vec<String>,
        env: BTreeMap<String, String>,
        cwd: Option<PathBuf>,
    },
    Http {
        url: String,
    },
}

/// One configured server. Exactly one of `command` or `url` must be given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMcpServerConfig", into = "RawMcpServerConfig")]
pub struct MCPServerConfig {
    pub enabled: bool,
    pub startup_timeout: Duration,
    pub transport: McpTransportConfig,
}

impl MCPServerConfig {
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            enabled: true,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            transport: McpTransportConfig::Stdio {
                command: command.into(),
                args,
                env: BTreeMap::new(),
                cwd: None,
            },
        }
    }

    pub fn http(url: impl Into<String>) -> Self {
        Self {
            enabled: true,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            transport: McpTransportConfig::Http { url: url.into() },
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_startup_timeout() -> Duration {
    DEFAULT_STARTUP_TIMEOUT
}

/// On-disk shape of a server entry, flat like the JSON users write.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawMcpServerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "default_startup_timeout", alias = "startup_timeout_sec")]
    startup_timeout: Duration,
}

impl TryFrom<RawMcpServerConfig> for MCPServerConfig {
    type Error = MCPError;

    fn try_from(raw: RawMcpServerConfig) -> Result<Self, Self::Error> {
        let transport = match (raw.command, raw.url) {
            (Some(command), None) => McpTransportConfig::Stdio {
                command,
                args: raw.args,
                env: raw.env,
                cwd: raw.cwd,
            },
            (None, Some(url)) => McpTransportConfig::Http { url },
            (Some(_), Some(_)) => {
                return Err(MCPError::InvalidConfig(
                    "set either `command` or `url`, not both".into(),
                ));
            }
            (None, None) => {
                return Err(MCPError::InvalidConfig(
                    "one of `command` or `url` is required".into(),
                ));
            }
        };
        Ok(Self {
            enabled: raw.enabled,
            startup_timeout: raw.startup_timeout,
            transport,
        })
    }
}

impl From<MCPServerConfig> for RawMcpServerConfig {
    fn from(config: MCPServerConfig) -> Self {
        let mut raw = RawMcpServerConfig {
            command: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            url: None,
            enabled: config.enabled,
            startup_timeout: config.startup_timeout,
        };
        match config.transport {
            McpTransportConfig::Stdio {
                command,
                args,
                env,
                cwd,
            } => {
                raw.command = Some(command);
                raw.args = args;
                raw.env = env;
                raw.cwd = cwd;
            }
            McpTransportConfig::Http { url } => raw.url = Some(url),
        }
        raw
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpServerStatus {
    Connecting,
    Connected,
    Error,
    Disconnected,
}

impl McpServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            McpServerStatus::Connecting => "connecting",
            McpServerStatus::Connected => "connected",
            McpServerStatus::Error => "error",
            McpServerStatus::Disconnected => "disconnected",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => McpServerStatus::Connecting,
            1 => McpServerStatus::Connected,
            2 => McpServerStatus::Error,
            _ => McpServerStatus::Disconnected,
        }
    }
}

impl fmt::Display for McpServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock-free status shared between a transport, its tools and the manager.
#[derive(Debug, Clone)]
pub struct StatusCell(Arc<AtomicU8>);

impl StatusCell {
    pub fn new(status: McpServerStatus) -> Self {
        Self(Arc::new(AtomicU8::new(status as u8)))
    }

    pub fn get(&self) -> McpServerStatus {
        McpServerStatus::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, status: McpServerStatus) {
        self.0.store(status as u8, Ordering::SeqCst);
    }
}

/// A handshaken connection to one server.
pub struct McpClient {
    name: String,
    transport: Arc<dyn McpTransport>,
    status: StatusCell,
    request_timeout: Duration,
}

impl McpClient {
    /// Opens the configured transport and performs the `initialize` handshake.
    pub async fn connect(
        name: &str,
        config: &MCPServerConfig,
        request_timeout: Duration,
    ) -> Result<Self, MCPError> {
        let status = StatusCell::new(McpServerStatus::Connecting);
        let transport: Arc<dyn McpTransport> = match &config.transport {
            McpTransportConfig::Stdio {
                command,
                args,
                env,
                cwd,
            } => Arc::new(StdioTransport::spawn(
                name,
                command,
                args,
                env,
                cwd.as_ref(),
                status.clone(),
            )?),
            McpTransportConfig::Http { url } => {
                Arc::new(HttpTransport::new(name, url, status.clone())?)
            }
        };
        Self::with_transport(name, transport, status, request_timeout).await
    }

    pub async fn with_transport(
        name: &str,
        transport: Arc<dyn McpTransport>,
        status: StatusCell,
        request_timeout: Duration,
    ) -> Result<Self, MCPError> {
        let client = Self {
            name: name.to_string(),
            transport,
            status,
            request_timeout,
        };
        client.initialize().await?;
        Ok(client)
    }

    async fn initialize(&self) -> Result<(), MCPError> {
        let params = protocol::initialize_params(CLIENT_NAME, env!("CARGO_PKG_VERSION"));
        let result = self
            .transport
            .request("initialize", Some(params), self.request_timeout)
            .await?;
        debug!(
            server = %self.name,
            protocol = ?result.get("protocolVersion"),
            "MCP initialize completed"
        );
        self.transport
            .notify("notifications/initialized", None)
            .await?;
        self.status.set(McpServerStatus::Connected);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> McpServerStatus {
        self.status.get()
    }

    /// Every tool the server offers, following pagination cursors.
    pub async fn list_tools(&self) -> Result<Vec<McpToolInfo>, MCPError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.take().map(|cursor| json!({ "cursor": cursor }));
            let result = self
                .transport
                .request("tools/list", params, self.request_timeout)
                .await?;
            let page: protocol::ToolsListResult = serde_json::from_value(result)?;
            tools.extend(page.tools);
            match page.next_cursor.filter(|next| !next.is_empty()) {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(tools)
    }

    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Map<String, Value>,
    ) -> Result<CallToolResult, MCPError> {
        let params = json!({ "name": tool, "arguments": arguments });
        let result = self
            .transport
            .request("tools/call", Some(params), self.request_timeout)
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn close(&self) -> Result<(), MCPError> {
        let result = self.transport.close().await;
        self.status.set(McpServerStatus::Disconnected);
        result
    }
}

/// Registry name of a server tool: `<server>__<tool>`, restricted to
/// characters every backend accepts in function names.
pub fn qualified_tool_name(server: &str, tool: &str) -> String {
    format!("{server}__{tool}")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Routes one registry tool to its server.
pub struct McpToolHandler {
    client: Arc<McpClient>,
    tool: McpToolInfo,
    qualified_name: String,
}

impl McpToolHandler {
    pub fn new(client: Arc<McpClient>, tool: McpToolInfo) -> Self {
        let qualified_name = qualified_tool_name(client.name(), &tool.name);
        Self {
            client,
            tool,
            qualified_name,
        }
    }
}

impl ToolTrait for McpToolHandler {
    fn info(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.qualified_name.clone(),
            description: self.tool.description.clone().unwrap_or_else(|| {
                format!("{} from MCP server {}", self.tool.name, self.client.name())
            }),
            parameters: self.tool.input_schema.clone(),
            kind: ToolKind::Mcp,
            effect: ToolEffect::Execute,
            enabled: true,
        }
    }

    fn execute(&self, arguments: Map<String, Value>) -> ToolFuture {
        let client = Arc::clone(&self.client);
        let tool = self.tool.name.clone();
        let qualified_name = self.qualified_name.clone();
        Box::pin(async move {
            let status = client.status();
            if status != McpServerStatus::Connected {
                return Err(ToolError::ServerUnavailable {
                    server: client.name().to_string(),
                    status: status.to_string(),
                });
            }
            match client.call_tool(&tool, arguments).await {
                Ok(result) => Ok(result.into_tool_result()),
                Err(MCPError::Timeout(_)) => Err(ToolError::Timeout {
                    name: qualified_name,
                    seconds: client.request_timeout.as_secs(),
                }),
                Err(e) => Err(ToolError::ExecutionFailed(e.to_string())),
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct McpServerSummary {
    pub name: String,
    pub status: McpServerStatus,
    pub tool_count: usize,
}

struct ServerEntry {
    status: StatusCell,
    client: Option<Arc<McpClient>>,
    tool_count: usize,
}

/// Owns every configured server connection for one session.
pub struct MCPManager {
    configs: BTreeMap<String, MCPServerConfig>,
    request_timeout: Duration,
    servers: BTreeMap<String, ServerEntry>,
}

impl MCPManager {
    pub fn new(configs: BTreeMap<String, MCPServerConfig>, request_timeout: Duration) -> Self {
        Self {
            configs,
            request_timeout,
            servers: BTreeMap::new(),
        }
    }

    /// Connects every enabled server concurrently and publishes its tools.
    /// A server that fails or exceeds its startup timeout is marked `error`
    /// without holding up the others.
    pub async fn initialize(&mut self, registry: &SharedToolRegistry) {
        let mut pending = Vec::new();
        for (name, config) in &self.configs {
            if !config.enabled {
                debug!(server = %name, "MCP server disabled");
                self.servers.insert(
                    name.clone(),
                    ServerEntry {
                        status: StatusCell::new(McpServerStatus::Disconnected),
                        client: None,
                        tool_count: 0,
                    },
                );
                continue;
            }
            let name = name.clone();
            let config = config.clone();
            let request_timeout = self.request_timeout;
            pending.push(async move {
                let started = tokio::time::timeout(
                    config.startup_timeout,
                    start_server(&name, &config, request_timeout),
                )
                .await;
                let outcome = match started {
                    Ok(result) => result,
                    Err(_) => Err(MCPError::Timeout(format!(
                        "{name} did not start within {:?}",
                        config.startup_timeout
                    ))),
                };
                (name, outcome)
            });
        }

        for (name, outcome) in join_all(pending).await {
            match outcome {
                Ok((client, tools)) => self.publish(Arc::new(client), tools, registry).await,
                Err(e) => {
                    warn!(server = %name, error = %e, "MCP server failed to start");
                    self.servers.insert(
                        name,
                        ServerEntry {
                            status: StatusCell::new(McpServerStatus::Error),
                            client: None,
                            tool_count: 0,
                        },
                    );
                }
            }
        }
    }

    async fn publish(
        &mut self,
        client: Arc<McpClient>,
        tools: Vec<McpToolInfo>,
        registry: &SharedToolRegistry,
    ) {
        let mut tool_count = 0;
        {
            let mut registry = registry.write().await;
            for tool in tools {
                let handler = McpToolHandler::new(Arc::clone(&client), tool);
                let name = handler.info().name;
                if registry.contains(&name) {
                    warn!(
                        server = %client.name(),
                        tool = %name,
                        "tool name already registered, skipping"
                    );
                    continue;
                }
                registry.register(Arc::new(handler));
                tool_count += 1;
            }
        }
        info!(server = %client.name(), tools = tool_count, "MCP server connected");
        self.servers.insert(
            client.name().to_string(),
            ServerEntry {
                status: client.status.clone(),
                client: Some(client),
                tool_count,
            },
        );
    }

    pub fn get_all_servers(&self) -> Vec<McpServerSummary> {
        self.servers
            .iter()
            .map(|(name, entry)| McpServerSummary {
                name: name.clone(),
                status: entry.status.get(),
                tool_count: entry.tool_count,
            })
            .collect()
    }

    pub fn status(&self, name: &str) -> Option<McpServerStatus> {
        self.servers.get(name).map(|entry| entry.status.get())
    }

    pub fn client(&self, name: &str) -> Result<Arc<McpClient>, MCPError> {
        self.servers
            .get(name)
            .and_then(|entry| entry.client.as_ref())
            .map(Arc::clone)
            .ok_or_else(|| MCPError::ServerNotFound(name.to_string()))
    }

    /// Closes every connection. A failure on one server is logged and the
    /// rest are still shut down.
    pub async fn shutdown(&mut self) {
        for (name, entry) in &mut self.servers {
            if let Some(client) = entry.client.take() {
                match client.close().await {
                    Ok(()) => debug!(server = %name, "MCP server shut down"),
                    Err(e) => warn!(server = %name, error = %e, "MCP server shutdown failed"),
                }
            }
            entry.status.set(McpServerStatus::Disconnected);
        }
    }
}

async fn start_server(
    name: &str,
    config: &MCPServerConfig,
    request_timeout: Duration,
) -> Result<(McpClient, Vec<McpToolInfo>), MCPError> {
    let client = McpClient::connect(name, config, request_timeout).await?;
    let tools = client.list_tools().await?;
    Ok((client, tools))
}
