//! Tool registry and dispatcher.
//!
//! Every invocable tool is a [`ToolDescriptor`] paired with a backend variant
//! (built-in, MCP, A2A or Skill). The registry is built once and then shared
//! read-only between tasks; per-user enablement lives in a separate
//! [`ToolPreferences`] overlay and never touches the descriptors.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use utoipa::ToSchema;

pub mod a2a;
pub mod builtin;
pub mod mcp;
pub mod preferences;
pub mod skills;

use crate::config::ToolsConfig;
use a2a::A2aAgent;
use builtin::BuiltinTool;
use mcp::McpServer;
pub use preferences::{PreferenceKey, ToolPreferences};
use skills::Skill;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Native,
    Mcp,
    A2a,
    Skill,
}

impl ToolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Mcp => "mcp",
            Self::A2a => "a2a",
            Self::Skill => "skill",
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "native" => Ok(Self::Native),
            "mcp" => Ok(Self::Mcp),
            "a2a" => Ok(Self::A2a),
            "skill" => Ok(Self::Skill),
            other => Err(format!("unknown tool type: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON schema object: `{type, properties, required}`.
    pub parameters: Value,
    pub kind: ToolKind,
    /// Identifier used by preference overlays: MCP server name, A2A agent id,
    /// skill name, or the tool name for built-ins.
    pub source_id: String,
    pub enabled: bool,
}

impl ToolDescriptor {
    /// Schema shape exposed to models: `{name, description, parameters}`.
    pub fn schema(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "parameters": self.parameters,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub content: String,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("tool not found: {name}")]
    NotFound { name: String },
    #[error("tool `{tool}` failed: {cause}")]
    Execution { tool: String, cause: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ToolRegistryError {
    #[error("duplicate tool name: {0}")]
    Duplicate(String),
}

#[derive(Debug)]
enum ToolBackend {
    Native(BuiltinTool),
    Mcp { server: Arc<McpServer>, tool: String },
    A2a(Arc<A2aAgent>),
    Skill(Arc<Skill>),
}

impl ToolBackend {
    fn timeout(&self, default: Duration) -> Duration {
        match self {
            Self::Mcp { server, .. } => server.timeout().unwrap_or(default),
            _ => default,
        }
    }

    async fn execute(&self, arguments: Value) -> Result<ToolOutput, String> {
        match self {
            Self::Native(tool) => tool.execute(&arguments),
            Self::Mcp { server, tool } => server
                .call_tool(tool, arguments)
                .await
                .map(ToolOutput::text)
                .map_err(|err| err.to_string()),
            Self::A2a(agent) => {
                let message = a2a::message_argument(&arguments)?;
                agent
                    .send_message(&message)
                    .await
                    .map(ToolOutput::text)
                    .map_err(|err| err.to_string())
            }
            Self::Skill(skill) => skill.load_instructions().await.map_err(|err| err.to_string()),
        }
    }
}

#[derive(Debug)]
struct RegisteredTool {
    descriptor: ToolDescriptor,
    backend: ToolBackend,
}

#[derive(Debug)]
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
    index: HashMap<String, usize>,
    mcp_servers: Vec<Arc<McpServer>>,
    preferences: ToolPreferences,
    default_timeout: Duration,
}

impl ToolRegistry {
    /// Registry holding only the built-in tools.
    pub fn new(default_timeout: Duration) -> Self {
        let mut registry = Self {
            tools: Vec::new(),
            index: HashMap::new(),
            mcp_servers: Vec::new(),
            preferences: ToolPreferences::default(),
            default_timeout,
        };
        for tool in BuiltinTool::ALL {
            // Built-in names are distinct constants.
            let _ = registry.insert(tool.descriptor(), ToolBackend::Native(tool));
        }
        registry
    }

    /// Builds the registry from built-ins plus every configured source.
    ///
    /// Sources that fail discovery are logged and skipped.
    pub async fn build(config: &ToolsConfig, default_timeout: Duration) -> Self {
        let mut registry = Self::new(default_timeout);

        for (name, server_config) in &config.mcp_servers {
            // Dropping a stalled connect kills a spawned stdio child.
            let limit = server_config.timeout().unwrap_or(default_timeout);
            let connect = McpServer::connect(name.clone(), server_config.clone());
            let Ok(connected) = tokio::time::timeout(limit, connect).await else {
                tracing::warn!(
                    server = %name,
                    timeout_ms = limit.as_millis() as u64,
                    "mcp server did not answer in time, skipping"
                );
                continue;
            };
            match connected {
                Ok((server, tools)) => {
                    let server = Arc::new(server);
                    for tool in tools {
                        let descriptor = server.descriptor(&tool);
                        registry.insert_logged(
                            descriptor,
                            ToolBackend::Mcp {
                                server: server.clone(),
                                tool: tool.name,
                            },
                        );
                    }
                    registry.mcp_servers.push(server);
                }
                Err(err) => {
                    tracing::warn!(server = %name, error = %err, "mcp server unavailable, skipping");
                }
            }
        }

        let http = reqwest::Client::new();
        for agent_config in &config.a2a_agents {
            let discover = A2aAgent::discover(agent_config.clone(), http.clone());
            let Ok(discovered) = tokio::time::timeout(default_timeout, discover).await else {
                tracing::warn!(
                    agent = %agent_config.id,
                    timeout_ms = default_timeout.as_millis() as u64,
                    "a2a agent did not answer in time, skipping"
                );
                continue;
            };
            match discovered {
                Ok(agent) => {
                    let agent = Arc::new(agent);
                    registry.insert_logged(agent.descriptor(), ToolBackend::A2a(agent));
                }
                Err(err) => {
                    tracing::warn!(agent = %agent_config.id, error = %err, "a2a agent unavailable, skipping");
                }
            }
        }

        if let Some(dir) = &config.skills_dir {
            for skill in skills::load_skills(dir) {
                let skill = Arc::new(skill);
                registry.insert_logged(skill.descriptor(), ToolBackend::Skill(skill));
            }
        }

        tracing::info!(tools = registry.tools.len(), "tool registry built");
        registry
    }

    fn insert(&mut self, descriptor: ToolDescriptor, backend: ToolBackend) -> Result<(), ToolRegistryError> {
        if self.index.contains_key(&descriptor.name) {
            return Err(ToolRegistryError::Duplicate(descriptor.name));
        }
        self.index.insert(descriptor.name.clone(), self.tools.len());
        self.tools.push(RegisteredTool {
            descriptor,
            backend,
        });
        Ok(())
    }

    fn insert_logged(&mut self, descriptor: ToolDescriptor, backend: ToolBackend) {
        let kind = descriptor.kind;
        if let Err(err) = self.insert(descriptor, backend) {
            tracing::warn!(kind = %kind, error = %err, "tool skipped");
        }
    }

    pub fn preferences(&self) -> &ToolPreferences {
        &self.preferences
    }

    /// Base catalog, independent of any user.
    pub fn get_tools(&self) -> Vec<ToolDescriptor> {
        self.tools.iter().map(|tool| tool.descriptor.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.index.get(name).map(|idx| &self.tools[*idx].descriptor)
    }

    /// Catalog with `enabled` replaced by the user's effective state.
    pub async fn get_tools_for_user(&self, user_id: &str) -> Vec<ToolDescriptor> {
        let overrides = self.preferences.snapshot_for_user(user_id).await;
        self.tools
            .iter()
            .map(|tool| {
                let mut descriptor = tool.descriptor.clone();
                descriptor.enabled = preferences::effective_enabled(&tool.descriptor, &overrides);
                descriptor
            })
            .collect()
    }

    /// Tools the model may call on behalf of `user_id`.
    pub async fn enabled_tools_for_user(&self, user_id: &str) -> Vec<ToolDescriptor> {
        self.get_tools_for_user(user_id)
            .await
            .into_iter()
            .filter(|tool| tool.enabled)
            .collect()
    }

    pub async fn invoke(&self, name: &str, arguments: Value) -> Result<ToolOutput, ToolError> {
        let idx = *self.index.get(name).ok_or_else(|| ToolError::NotFound {
            name: name.to_string(),
        })?;
        self.dispatch(&self.tools[idx], arguments).await
    }

    /// Like [`invoke`](Self::invoke), but tools disabled for the user are not found.
    pub async fn invoke_for_user(
        &self,
        user_id: &str,
        name: &str,
        arguments: Value,
    ) -> Result<ToolOutput, ToolError> {
        let not_found = || ToolError::NotFound {
            name: name.to_string(),
        };
        let idx = *self.index.get(name).ok_or_else(not_found)?;
        let tool = &self.tools[idx];
        if !self.preferences.is_enabled(user_id, &tool.descriptor).await {
            tracing::debug!(user_id = %user_id, tool = %name, "tool disabled for user");
            return Err(not_found());
        }
        self.dispatch(tool, arguments).await
    }

    async fn dispatch(&self, tool: &RegisteredTool, arguments: Value) -> Result<ToolOutput, ToolError> {
        let name = &tool.descriptor.name;
        let limit = tool.backend.timeout(self.default_timeout);
        tracing::debug!(tool = %name, kind = %tool.descriptor.kind, "tool: dispatch");
        match tokio::time::timeout(limit, tool.backend.execute(arguments)).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(cause)) => {
                tracing::warn!(tool = %name, error = %cause, "tool: execution failed");
                Err(ToolError::Execution {
                    tool: name.clone(),
                    cause,
                })
            }
            Err(_) => {
                tracing::warn!(tool = %name, timeout_ms = limit.as_millis() as u64, "tool: timed out");
                Err(ToolError::Execution {
                    tool: name.clone(),
                    cause: format!("timed out after {}ms", limit.as_millis()),
                })
            }
        }
    }

    /// True when at least one tool comes from the given overlay source.
    pub fn has_source(&self, kind: ToolKind, source_id: &str) -> bool {
        self.tools
            .iter()
            .any(|tool| tool.descriptor.kind == kind && tool.descriptor.source_id == source_id)
    }

    pub async fn shutdown(&self) {
        for server in &self.mcp_servers {
            server.disconnect().await;
        }
    }
}

/// Restricts a generated tool name to `[a-zA-Z0-9_-]`, at most 64 characters.
pub(crate) fn tool_name(prefix: &str, parts: &[&str]) -> String {
    let mut name = prefix.to_string();
    for part in parts {
        name.push('_');
        name.extend(part.chars().map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        }));
    }
    name.truncate(64);
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ToolRegistry {
        ToolRegistry::new(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let err = registry()
            .invoke("does_not_exist", json!({}))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ToolError::NotFound {
                name: "does_not_exist".to_string()
            }
        );
    }

    #[tokio::test]
    async fn builtin_failure_is_normalized() {
        let err = registry()
            .invoke("message_ask_user", json!({"suggest_user_takeover": "shell"}))
            .await
            .unwrap_err();
        let ToolError::Execution { tool, cause } = err else {
            panic!("expected execution error");
        };
        assert_eq!(tool, "message_ask_user");
        assert!(cause.contains("text"));
    }

    #[tokio::test]
    async fn user_overlay_hides_tool_only_for_that_user() {
        let registry = registry();
        registry
            .preferences()
            .set("alice", ToolKind::Native, "message_notify_user", false)
            .await;

        let err = registry
            .invoke_for_user("alice", "message_notify_user", json!({"text": "hi"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotFound { .. }));

        registry
            .invoke_for_user("bob", "message_notify_user", json!({"text": "hi"}))
            .await
            .expect("bob keeps the tool");

        let base = registry.get("message_notify_user").expect("descriptor");
        assert!(base.enabled);
        let alice_tools = registry.enabled_tools_for_user("alice").await;
        assert!(alice_tools.iter().all(|tool| tool.name != "message_notify_user"));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = registry();
        let descriptor = BuiltinTool::Idle.descriptor();
        let err = registry
            .insert(descriptor, ToolBackend::Native(BuiltinTool::Idle))
            .unwrap_err();
        assert_eq!(err, ToolRegistryError::Duplicate("idle".to_string()));
    }

    #[test]
    fn generated_names_are_sanitized() {
        assert_eq!(tool_name("mcp", &["git hub", "search.code"]), "mcp_git_hub_search_code");
        assert_eq!(tool_name("skill", &[&"x".repeat(100)]).len(), 64);
    }
}
