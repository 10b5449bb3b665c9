use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use super::{tool_name, ToolDescriptor, ToolKind};

const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Clone, PartialEq)]
pub enum McpConfig {
    Local {
        command: Vec<String>,
        environment: HashMap<String, String>,
        enabled: bool,
        timeout_ms: Option<u64>,
    },
    Remote {
        url: String,
        headers: HashMap<String, String>,
        enabled: bool,
        timeout_ms: Option<u64>,
    },
}

impl McpConfig {
    /// Accepts `{type: "local", command: [..]}` or `{type: "remote", url}`.
    /// A bare `command` string plus `args` is treated as local.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let config_type = match value.get("type").and_then(|v| v.as_str()) {
            Some(config_type) => config_type,
            None if value.get("command").is_some() => "local",
            None if value.get("url").is_some() => "remote",
            None => return Err("config.type is required".to_string()),
        };
        let enabled = value
            .get("enabled")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        let timeout_ms = value.get("timeout").and_then(|v| v.as_u64());
        match config_type {
            "local" | "stdio" => {
                let command = parse_command(value)?;
                let environment = parse_string_map(value.get("environment").or_else(|| value.get("env")))?;
                Ok(McpConfig::Local {
                    command,
                    environment,
                    enabled,
                    timeout_ms,
                })
            }
            "remote" | "http" => {
                let url = value
                    .get("url")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| "config.url is required".to_string())?
                    .to_string();
                let headers = parse_string_map(value.get("headers"))?;
                Ok(McpConfig::Remote {
                    url,
                    headers,
                    enabled,
                    timeout_ms,
                })
            }
            other => Err(format!("unsupported config.type: {other}")),
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            McpConfig::Local { enabled, .. } => *enabled,
            McpConfig::Remote { enabled, .. } => *enabled,
        }
    }

    fn timeout_ms(&self) -> Option<u64> {
        match self {
            McpConfig::Local { timeout_ms, .. } => *timeout_ms,
            McpConfig::Remote { timeout_ms, .. } => *timeout_ms,
        }
    }

    /// Per-server round-trip limit, if configured.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms().map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct McpTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Error)]
pub enum McpError {
    #[error("mcp server is disabled")]
    Disabled,
    #[error("{0}")]
    Failed(String),
    #[error("mcp tool error: {0}")]
    Tool(String),
}

#[derive(Debug)]
struct McpStdioConnection {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    next_id: u64,
}

impl McpStdioConnection {
    async fn spawn(command: &[String], environment: &HashMap<String, String>) -> Result<Self, McpError> {
        let Some((program, args)) = command.split_first() else {
            return Err(McpError::Failed("config.command cannot be empty".to_string()));
        };
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        for (key, value) in environment {
            cmd.env(key, value);
        }
        let mut child = cmd
            .spawn()
            .map_err(|err| McpError::Failed(format!("failed to spawn MCP server: {err}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Failed("failed to capture MCP stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Failed("failed to capture MCP stdout".to_string()))?;
        Ok(Self {
            child,
            stdin: BufWriter::new(stdin),
            stdout: BufReader::new(stdout),
            next_id: 0,
        })
    }

    async fn write_line(&mut self, payload: &Value) -> Result<(), McpError> {
        let mut line = serde_json::to_string(payload)
            .map_err(|err| McpError::Failed(format!("failed to encode MCP request: {err}")))?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|err| McpError::Failed(format!("failed to write MCP request: {err}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|err| McpError::Failed(format!("failed to flush MCP request: {err}")))
    }

    async fn notify(&mut self, method: &str) -> Result<(), McpError> {
        self.write_line(&json!({"jsonrpc": "2.0", "method": method}))
            .await
    }

    async fn request(&mut self, method: &str, params: Value) -> Result<Value, McpError> {
        self.next_id += 1;
        let id = self.next_id;
        self.write_line(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        }))
        .await?;

        // Responses to requests abandoned by a timeout may still arrive; they
        // carry older ids and are skipped.
        loop {
            let mut buffer = String::new();
            let read = self
                .stdout
                .read_line(&mut buffer)
                .await
                .map_err(|err| McpError::Failed(format!("failed to read MCP response: {err}")))?;
            if read == 0 {
                return Err(McpError::Failed(
                    "MCP server closed stdout before responding".to_string(),
                ));
            }
            let Ok(value) = serde_json::from_str::<Value>(buffer.trim()) else {
                tracing::debug!(line = %buffer.trim(), "mcp: skipping non-json stdout line");
                continue;
            };
            if value.get("id").and_then(|v| v.as_u64()) != Some(id) {
                continue;
            }
            return rpc_result(value);
        }
    }
}

#[derive(Debug)]
enum McpConnection {
    Stdio(Mutex<McpStdioConnection>),
    Remote {
        client: reqwest::Client,
        url: String,
        headers: HashMap<String, String>,
        next_id: AtomicU64,
    },
}

impl McpConnection {
    async fn request(&self, method: &str, params: Value) -> Result<Value, McpError> {
        match self {
            McpConnection::Stdio(conn) => conn.lock().await.request(method, params).await,
            McpConnection::Remote {
                client,
                url,
                headers,
                next_id,
            } => {
                let id = next_id.fetch_add(1, Ordering::Relaxed) + 1;
                remote_request(client, url, headers, id, method, params).await
            }
        }
    }
}

/// A connected MCP server. Calls to a stdio server are serialized.
#[derive(Debug)]
pub struct McpServer {
    name: String,
    timeout: Option<Duration>,
    connection: McpConnection,
}

impl McpServer {
    /// Connects, runs the `initialize` handshake and lists the server's tools.
    pub async fn connect(name: String, config: McpConfig) -> Result<(Self, Vec<McpTool>), McpError> {
        if !config.enabled() {
            return Err(McpError::Disabled);
        }
        let timeout = config.timeout();
        let init_params = json!({
            "clientInfo": {"name": "agentbox", "version": env!("CARGO_PKG_VERSION")},
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
        });
        let connection = match config {
            McpConfig::Local {
                command,
                environment,
                ..
            } => {
                let mut conn = McpStdioConnection::spawn(&command, &environment).await?;
                conn.request("initialize", init_params).await?;
                conn.notify("notifications/initialized").await?;
                McpConnection::Stdio(Mutex::new(conn))
            }
            McpConfig::Remote { url, headers, .. } => {
                let connection = McpConnection::Remote {
                    client: reqwest::Client::new(),
                    url,
                    headers,
                    next_id: AtomicU64::new(0),
                };
                connection.request("initialize", init_params).await?;
                connection
            }
        };
        let server = Self {
            name,
            timeout,
            connection,
        };
        let result = server.connection.request("tools/list", json!({})).await?;
        let tools = parse_tools(&result)?;
        tracing::info!(server = %server.name, tools = tools.len(), "mcp: connected");
        Ok((server, tools))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn descriptor(&self, tool: &McpTool) -> ToolDescriptor {
        ToolDescriptor {
            name: tool_name("mcp", &[&self.name, &tool.name]),
            description: tool.description.clone(),
            parameters: normalize_schema(&tool.input_schema),
            kind: ToolKind::Mcp,
            source_id: self.name.clone(),
            enabled: true,
        }
    }

    pub async fn call_tool(&self, tool: &str, arguments: Value) -> Result<String, McpError> {
        let arguments = if arguments.is_null() { json!({}) } else { arguments };
        let result = self
            .connection
            .request("tools/call", json!({"name": tool, "arguments": arguments}))
            .await?;
        let text = content_text(&result);
        if result.get("isError").and_then(|v| v.as_bool()).unwrap_or(false) {
            return Err(McpError::Tool(text));
        }
        Ok(text)
    }

    pub async fn disconnect(&self) {
        if let McpConnection::Stdio(conn) = &self.connection {
            let mut conn = conn.lock().await;
            let _ = conn.child.kill().await;
            tracing::debug!(server = %self.name, "mcp: disconnected");
        }
    }
}

fn parse_command(value: &Value) -> Result<Vec<String>, String> {
    let mut command = match value.get("command") {
        Some(Value::String(program)) => vec![program.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(|s| s.to_string())
                    .ok_or_else(|| "config.command must be an array of strings".to_string())
            })
            .collect::<Result<Vec<String>, String>>()?,
        _ => return Err("config.command is required".to_string()),
    };
    if let Some(args) = value.get("args").and_then(|v| v.as_array()) {
        for arg in args {
            let arg = arg
                .as_str()
                .ok_or_else(|| "config.args must be an array of strings".to_string())?;
            command.push(arg.to_string());
        }
    }
    if command.is_empty() {
        return Err("config.command cannot be empty".to_string());
    }
    Ok(command)
}

fn parse_string_map(value: Option<&Value>) -> Result<HashMap<String, String>, String> {
    let mut map = HashMap::new();
    let Some(value) = value else {
        return Ok(map);
    };
    let obj = value
        .as_object()
        .ok_or_else(|| "expected object".to_string())?;
    for (key, value) in obj {
        let str_value = value
            .as_str()
            .ok_or_else(|| "expected string value".to_string())?;
        map.insert(key.clone(), str_value.to_string());
    }
    Ok(map)
}

fn parse_tools(value: &Value) -> Result<Vec<McpTool>, McpError> {
    let tools_value = value
        .get("tools")
        .and_then(|v| v.as_array())
        .ok_or_else(|| McpError::Failed("MCP tools/list response missing tools".to_string()))?;
    let mut tools = Vec::new();
    for tool in tools_value {
        let name = tool
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| McpError::Failed("tool name missing".to_string()))?
            .to_string();
        let description = tool
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let input_schema = tool
            .get("inputSchema")
            .cloned()
            .unwrap_or_else(|| json!({}));
        tools.push(McpTool {
            name,
            description,
            input_schema,
        });
    }
    Ok(tools)
}

/// Ensures the schema has the `{type, properties, required}` shape.
fn normalize_schema(schema: &Value) -> Value {
    let mut schema = match schema {
        Value::Object(_) => schema.clone(),
        _ => json!({}),
    };
    if schema.get("type").is_none() {
        schema["type"] = json!("object");
    }
    if schema.get("properties").is_none() {
        schema["properties"] = json!({});
    }
    if schema.get("required").is_none() {
        schema["required"] = json!([]);
    }
    schema
}

/// Joins `content[]` text items; other items are rendered as JSON.
fn content_text(result: &Value) -> String {
    let Some(items) = result.get("content").and_then(|v| v.as_array()) else {
        return result.to_string();
    };
    items
        .iter()
        .map(|item| match item.get("text").and_then(|v| v.as_str()) {
            Some(text) if item.get("type").and_then(|v| v.as_str()) == Some("text") => text.to_string(),
            _ => item.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn rpc_result(value: Value) -> Result<Value, McpError> {
    if let Some(error) = value.get("error") {
        return Err(McpError::Failed(format!("MCP request failed: {error}")));
    }
    value
        .get("result")
        .cloned()
        .ok_or_else(|| McpError::Failed("MCP response missing result".to_string()))
}

async fn remote_request(
    client: &reqwest::Client,
    url: &str,
    headers: &HashMap<String, String>,
    id: u64,
    method: &str,
    params: Value,
) -> Result<Value, McpError> {
    let payload = json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    });
    let mut request = client
        .post(url)
        .header("Accept", "application/json, text/event-stream")
        .json(&payload);
    for (key, value) in headers {
        request = request.header(key, value);
    }
    let response = request
        .send()
        .await
        .map_err(|err| McpError::Failed(format!("MCP request failed: {err}")))?;
    let text = response
        .text()
        .await
        .map_err(|err| McpError::Failed(format!("MCP response read failed: {err}")))?;
    rpc_result(parse_remote_body(&text)?)
}

/// Streamable HTTP servers may answer with a single SSE `data:` frame.
fn parse_remote_body(text: &str) -> Result<Value, McpError> {
    let trimmed = text.trim();
    let body = if trimmed.starts_with('{') {
        trimmed.to_string()
    } else {
        trimmed
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(str::trim)
            .collect::<Vec<_>>()
            .join("")
    };
    serde_json::from_str(&body).map_err(|err| McpError::Failed(format!("MCP response invalid: {err}")))
}
