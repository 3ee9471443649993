//! Stdio and Streamable HTTP transports for MCP servers.

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;
use tracing::{debug, warn};

use super::protocol::{
    IncomingMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, parse_incoming,
};
use super::{MCPError, McpServerStatus, StatusCell};
use crate::clients::sse::sse_events;

const SESSION_HEADER: &str = "Mcp-Session-Id";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Request/response channel to one MCP server.
#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, MCPError>;

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), MCPError>;

    async fn close(&self) -> Result<(), MCPError>;
}

type PendingRequests = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// Newline-delimited JSON-RPC over a child process's stdin/stdout.
pub struct StdioTransport {
    name: String,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    pending: PendingRequests,
    next_id: AtomicU64,
    status: StatusCell,
    reader: JoinHandle<()>,
}

impl StdioTransport {
    pub fn spawn(
        name: &str,
        command: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
        cwd: Option<&PathBuf>,
        status: StatusCell,
    ) -> Result<Self, MCPError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            MCPError::ConnectionFailed(format!("failed to start {command} for {name}: {e}"))
        })?;
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MCPError::ConnectionFailed(format!("{name}: stdout not captured")))?;
        if let Some(stderr) = child.stderr.take() {
            let server = name.to_string();
            tokio::spawn(async move {
                let mut lines = LinesStream::new(BufReader::new(stderr).lines());
                while let Some(Ok(line)) = lines.next().await {
                    debug!(server = %server, "stderr: {line}");
                }
            });
        }

        let pending: PendingRequests = Arc::new(Mutex::new(HashMap::new()));
        let reader = tokio::spawn(read_responses(
            name.to_string(),
            stdout,
            Arc::clone(&pending),
            status.clone(),
        ));

        Ok(Self {
            name: name.to_string(),
            child: Mutex::new(Some(child)),
            stdin: Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(1),
            status,
            reader,
        })
    }

    async fn write_line(&self, mut line: String) -> Result<(), MCPError> {
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        let stdin = stdin
            .as_mut()
            .ok_or_else(|| MCPError::ConnectionClosed(self.name.clone()))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }
}

/// Routes responses to their waiters until the server closes stdout.
async fn read_responses(
    name: String,
    stdout: ChildStdout,
    pending: PendingRequests,
    status: StatusCell,
) {
    let mut lines = LinesStream::new(BufReader::new(stdout).lines());
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(server = %name, error = %e, "failed reading from MCP server");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match parse_incoming(&line) {
            Ok(IncomingMessage::Response(response)) => {
                let Some(id) = response.id.as_u64() else {
                    warn!(server = %name, "response without numeric id");
                    continue;
                };
                match pending.lock().await.remove(&id) {
                    Some(waiter) => {
                        let _ = waiter.send(response);
                    }
                    None => warn!(server = %name, id, "response for unknown request"),
                }
            }
            Ok(IncomingMessage::Notification { method }) => {
                debug!(server = %name, %method, "notification");
            }
            Ok(IncomingMessage::Request { method, .. }) => {
                debug!(server = %name, %method, "ignoring server request");
            }
            Err(e) => debug!(server = %name, error = %e, "ignoring non-JSON-RPC line"),
        }
    }

    debug!(server = %name, "MCP server closed stdout");
    status.set(McpServerStatus::Disconnected);
    // dropping the senders wakes every waiter with an error
    pending.lock().await.clear();
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, MCPError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.status.get() == McpServerStatus::Disconnected {
            self.pending.lock().await.remove(&id);
            return Err(MCPError::ConnectionClosed(self.name.clone()));
        }

        let line = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;
        if let Err(e) = self.write_line(line).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response.into_result(),
            Ok(Err(_)) => Err(MCPError::ConnectionClosed(self.name.clone())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(MCPError::Timeout(format!("{} {method}", self.name)))
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), MCPError> {
        let line = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        self.write_line(line).await
    }

    /// Closes stdin, gives the server a moment to exit, then kills it.
    async fn close(&self) -> Result<(), MCPError> {
        self.stdin.lock().await.take();
        let child = self.child.lock().await.take();
        let result = match child {
            Some(mut child) => match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(status) => status.map(|_| ()).map_err(MCPError::from),
                Err(_) => child.kill().await.map_err(MCPError::from),
            },
            None => Ok(()),
        };
        self.reader.abort();
        self.status.set(McpServerStatus::Disconnected);
        result
    }
}

/// Streamable HTTP: one POST per message, JSON or SSE response bodies.
pub struct HttpTransport {
    name: String,
    url: String,
    client: reqwest::Client,
    session_id: Mutex<Option<String>>,
    next_id: AtomicU64,
    status: StatusCell,
}

impl HttpTransport {
    pub fn new(name: &str, url: &str, status: StatusCell) -> Result<Self, MCPError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| MCPError::ConnectionFailed(e.to_string()))?;
        Ok(Self {
            name: name.to_string(),
            url: url.to_string(),
            client,
            session_id: Mutex::new(None),
            next_id: AtomicU64::new(1),
            status,
        })
    }

    async fn post(&self, body: Value, timeout: Duration) -> Result<Option<String>, MCPError> {
        let mut request = self
            .client
            .post(&self.url)
            .header(ACCEPT, "application/json, text/event-stream")
            .header(CONTENT_TYPE, "application/json")
            .timeout(timeout)
            .json(&body);
        if let Some(session) = self.session_id.lock().await.as_ref() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                MCPError::Timeout(format!("{}: {e}", self.name))
            } else {
                self.status.set(McpServerStatus::Error);
                MCPError::ConnectionFailed(format!("{}: {e}", self.name))
            }
        })?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock().await = Some(session.to_string());
        }

        let status = response.status();
        if status == reqwest::StatusCode::ACCEPTED {
            return Ok(None);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(MCPError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let is_sse = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));
        let text = response
            .text()
            .await
            .map_err(|e| MCPError::ProtocolError(e.to_string()))?;
        Ok(Some(if is_sse { sse_response(&text, &body)? } else { text }))
    }
}

/// Picks the JSON-RPC response matching the request id out of an SSE body.
fn sse_response(body: &str, request: &Value) -> Result<String, MCPError> {
    let id = request.get("id");
    sse_events(body)
        .into_iter()
        .find(|data| match parse_incoming(data) {
            Ok(IncomingMessage::Response(response)) => Some(&response.id) == id,
            _ => false,
        })
        .ok_or_else(|| MCPError::ProtocolError("no response in event stream".to_string()))
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, MCPError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let body = serde_json::to_value(JsonRpcRequest::new(id, method, params))?;
        let text = self
            .post(body, timeout)
            .await?
            .ok_or_else(|| MCPError::ProtocolError(format!("{method}: empty response")))?;
        let response: JsonRpcResponse = serde_json::from_str(&text)?;
        response.into_result()
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), MCPError> {
        let body = serde_json::to_value(JsonRpcNotification::new(method, params))?;
        self.post(body, Duration::from_secs(30)).await.map(|_| ())
    }

    /// Ends the server-side session when one was issued.
    async fn close(&self) -> Result<(), MCPError> {
        let session = self.session_id.lock().await.take();
        self.status.set(McpServerStatus::Disconnected);
        let Some(session) = session else {
            return Ok(());
        };
        self.client
            .delete(&self.url)
            .header(SESSION_HEADER, session)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|_| ())
            .map_err(|e| MCPError::ConnectionFailed(format!("{}: {e}", self.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sse_response_matches_request_id() {
        let body = concat!(
            "event: message\n",
            "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\n",
            "event: message\n",
            "data: {\"jsonrpc\":\"2.0\",\"id\":4,\"result\":{\"tools\":[]}}\n\n",
        );
        let request = json!({"jsonrpc": "2.0", "id": 4, "method": "tools/list"});
        let text = sse_response(body, &request).unwrap();
        let response: JsonRpcResponse = serde_json::from_str(&text).unwrap();
        assert_eq!(response.into_result().unwrap(), json!({"tools": []}));

        let other = json!({"jsonrpc": "2.0", "id": 5, "method": "tools/list"});
        assert!(sse_response(body, &other).is_err());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_connection_error() {
        let status = StatusCell::new(McpServerStatus::Connecting);
        let result = StdioTransport::spawn(
            "ghost",
            "/nonexistent/mcp-server-binary",
            &[],
            &BTreeMap::new(),
            None,
            status,
        );
        assert!(matches!(result, Err(MCPError::ConnectionFailed(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdio_marks_disconnected_when_server_exits() {
        let status = StatusCell::new(McpServerStatus::Connecting);
        let transport = StdioTransport::spawn(
            "short-lived",
            "sh",
            &["-c".to_string(), "exit 0".to_string()],
            &BTreeMap::new(),
            None,
            status.clone(),
        )
        .unwrap();

        for _ in 0..100 {
            if status.get() == McpServerStatus::Disconnected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status.get(), McpServerStatus::Disconnected);

        let err = transport
            .request("tools/list", None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MCPError::ConnectionClosed(_)));
        transport.close().await.unwrap();
    }
}
