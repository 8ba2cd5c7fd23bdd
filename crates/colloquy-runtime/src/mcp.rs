//! Capability server client
//!
//! Spawns a server process and speaks line-delimited JSON-RPC 2.0 over its
//! stdio. One request is in flight at a time; responses carrying other ids
//! and server notifications are skipped.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use colloquy_core::{
    error::{AgentError, Result},
    registry::{CapabilityServer, ReplySegment, ServerReply},
    tool::{ToolArguments, ToolSchema},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;

const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC transport failures
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("server closed its output")]
    Closed,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("server error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("response carried no result")]
    MissingResult,
}

/// How to launch a capability server
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

const fn default_request_timeout() -> u64 {
    60
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            request_timeout_secs: default_request_timeout(),
        }
    }

    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

struct Channel {
    stdin: ChildStdin,
    lines: LinesStream<BufReader<ChildStdout>>,
}

impl Channel {
    async fn write(&mut self, message: &Value) -> std::result::Result<(), RpcError> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        self.stdin.write_all(&line).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn read_response(&mut self, id: u64) -> std::result::Result<Value, RpcError> {
        while let Some(line) = self.lines.next().await {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let message: Value = serde_json::from_str(&line)?;
            if message["id"].as_u64() == Some(id) {
                return response_result(message);
            }
            tracing::trace!(line = %line, "Skipping unrelated server message");
        }
        Err(RpcError::Closed)
    }
}

/// Extract `result` from a JSON-RPC response
fn response_result(mut message: Value) -> std::result::Result<Value, RpcError> {
    if let Some(error) = message.get("error").filter(|e| !e.is_null()) {
        return Err(RpcError::Remote {
            code: error["code"].as_i64().unwrap_or_default(),
            message: error["message"].as_str().unwrap_or("unknown error").to_string(),
        });
    }
    match message.get_mut("result").map(Value::take) {
        Some(result) if !result.is_null() => Ok(result),
        _ => Err(RpcError::MissingResult),
    }
}

/// Tool schemas from a `tools/list` result
fn parse_tools(result: &Value) -> Vec<ToolSchema> {
    result["tools"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|tool| {
            let name = tool["name"].as_str()?;
            let parameters = match tool.get("inputSchema") {
                Some(schema) if schema.is_object() => schema.clone(),
                _ => json!({ "type": "object", "properties": {} }),
            };
            Some(ToolSchema {
                name: name.to_string(),
                description: tool["description"].as_str().unwrap_or_default().to_string(),
                parameters,
            })
        })
        .collect()
}

/// Map a `tools/call` result onto the core reply type
fn parse_reply(result: &Value) -> ServerReply {
    let segments = result["content"]
        .as_array()
        .into_iter()
        .flatten()
        .map(|segment| match segment["type"].as_str().unwrap_or("unknown") {
            "text" => ReplySegment::Text(segment["text"].as_str().unwrap_or_default().to_string()),
            "image" => ReplySegment::Image {
                mime_type: segment["mimeType"].as_str().unwrap_or_default().to_string(),
            },
            "resource" => ReplySegment::Resource {
                uri: segment["resource"]["uri"].as_str().unwrap_or_default().to_string(),
            },
            other => ReplySegment::Other(other.to_string()),
        })
        .collect();
    ServerReply {
        segments,
        is_error: result["isError"].as_bool().unwrap_or(false),
    }
}

/// A capability server running as a child process
pub struct StdioServer {
    config: ServerConfig,
    channel: Mutex<Channel>,
    next_id: AtomicU64,
    // kept for kill_on_drop
    _child: Child,
}

impl StdioServer {
    /// Spawn the process and complete the initialize handshake
    pub async fn spawn(config: ServerConfig) -> Result<Self> {
        tracing::info!(server = %config.name, program = %config.program, "Spawning capability server");

        let mut child = Command::new(&config.program)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let transport = |message: &str| AgentError::ExternalToolTransport {
            server: config.name.clone(),
            message: message.to_string(),
        };
        let stdin = child.stdin.take().ok_or_else(|| transport("failed to capture stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| transport("failed to capture stdout"))?;

        let server = Self {
            channel: Mutex::new(Channel {
                stdin,
                lines: LinesStream::new(BufReader::new(stdout).lines()),
            }),
            next_id: AtomicU64::new(1),
            _child: child,
            config,
        };
        server.initialize().await?;
        Ok(server)
    }

    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn transport_error(&self, error: &RpcError) -> AgentError {
        AgentError::ExternalToolTransport {
            server: self.config.name.clone(),
            message: error.to_string(),
        }
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let message = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        let limit = Duration::from_secs(self.config.request_timeout_secs);

        tracing::debug!(server = %self.config.name, method, id, "Sending request");
        let mut channel = self.channel.lock().await;
        let exchange = async {
            channel.write(&message).await?;
            channel.read_response(id).await
        };
        let outcome = tokio::time::timeout(limit, exchange)
            .await
            .unwrap_or(Err(RpcError::Timeout(limit)));
        outcome.map_err(|e| self.transport_error(&e))
    }

    async fn notify(&self, method: &str) -> Result<()> {
        let message = json!({ "jsonrpc": "2.0", "method": method });
        self.channel
            .lock()
            .await
            .write(&message)
            .await
            .map_err(|e| self.transport_error(&e))
    }

    async fn initialize(&self) -> Result<()> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": { "name": "colloquy", "version": env!("CARGO_PKG_VERSION") },
        });
        let result = self.request("initialize", params).await?;
        self.notify("notifications/initialized").await?;
        tracing::info!(
            server = %self.config.name,
            remote = result["serverInfo"]["name"].as_str().unwrap_or("unknown"),
            "Capability server initialized"
        );
        Ok(())
    }
}

#[async_trait]
impl CapabilityServer for StdioServer {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn list_tools(&self) -> Result<Vec<ToolSchema>> {
        let result = self.request("tools/list", json!({})).await?;
        let tools = parse_tools(&result);
        tracing::info!(server = %self.config.name, count = tools.len(), "Tool discovery complete");
        Ok(tools)
    }

    async fn call_tool(&self, name: &str, arguments: &ToolArguments) -> Result<ServerReply> {
        let result = self
            .request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await?;
        Ok(parse_reply(&result))
    }
}

/// Spawn every configured server, skipping the ones that fail to start
pub async fn spawn_all(configs: Vec<ServerConfig>) -> Vec<Arc<dyn CapabilityServer>> {
    let mut servers: Vec<Arc<dyn CapabilityServer>> = Vec::new();
    for config in configs {
        let name = config.name.clone();
        match StdioServer::spawn(config).await {
            Ok(server) => servers.push(Arc::new(server)),
            Err(e) => tracing::warn!(server = %name, error = %e, "Capability server failed to start"),
        }
    }
    servers
}
