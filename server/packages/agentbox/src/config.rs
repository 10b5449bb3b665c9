use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::context_window::ContextOverflowConfig;
use crate::tools::a2a::A2aAgentConfig;
use crate::tools::mcp::McpConfig;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are agentbox, an autonomous agent working inside an isolated sandbox. \
Use the available tools to complete the user's task. Report progress and results with message_notify_user, \
ask with message_ask_user when you are blocked on the user, and call idle once every task is complete.";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid json in tools config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid tools config: {0}")]
    Invalid(String),
}

/// Settings for every task runner, built once and shared.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub system_prompt: String,
    pub context_overflow: ContextOverflowConfig,
    /// Tokens held back from the context window for the model's reply.
    pub reserved_output_tokens: u32,
    pub tool_timeout: Duration,
    /// Model calls allowed per user message before the turn is cut off.
    pub max_steps: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            context_overflow: ContextOverflowConfig::default(),
            reserved_output_tokens: 4_096,
            tool_timeout: Duration::from_secs(60),
            max_steps: 32,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub default_timeout_minutes: u64,
    pub expand_enabled: bool,
    pub auto_extend_minutes: u64,
    pub tick_interval: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            default_timeout_minutes: 30,
            expand_enabled: true,
            auto_extend_minutes: 3,
            tick_interval: Duration::from_secs(1),
        }
    }
}

/// Tool sources discovered when the registry is built.
#[derive(Debug, Clone, Default)]
pub struct ToolsConfig {
    pub mcp_servers: Vec<(String, McpConfig)>,
    pub a2a_agents: Vec<A2aAgentConfig>,
    pub skills_dir: Option<PathBuf>,
}

impl ToolsConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let value: Value = serde_json::from_str(&text)?;
        let mut config = Self::from_value(&value)?;
        // Relative skill directories are resolved against the config file.
        if let (Some(dir), Some(parent)) = (config.skills_dir.as_ref(), path.parent()) {
            if dir.is_relative() {
                config.skills_dir = Some(parent.join(dir));
            }
        }
        Ok(config)
    }

    pub fn from_value(value: &Value) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(servers) = value.get("mcpServers") {
            let servers = servers
                .as_object()
                .ok_or_else(|| ConfigError::Invalid("mcpServers must be an object".to_string()))?;
            for (name, server) in servers {
                let server = McpConfig::from_value(server)
                    .map_err(|err| ConfigError::Invalid(format!("mcpServers.{name}: {err}")))?;
                config.mcp_servers.push((name.clone(), server));
            }
            config.mcp_servers.sort_by(|a, b| a.0.cmp(&b.0));
        }

        if let Some(agents) = value.get("a2aAgents") {
            config.a2a_agents = serde_json::from_value(agents.clone())
                .map_err(|err| ConfigError::Invalid(format!("a2aAgents: {err}")))?;
        }

        if let Some(dir) = value.get("skillsDir") {
            let dir = dir
                .as_str()
                .ok_or_else(|| ConfigError::Invalid("skillsDir must be a string".to_string()))?;
            config.skills_dir = Some(expand_home(dir));
        }

        Ok(config)
    }
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

/// Default location for skills when no tools config names one.
pub fn default_skills_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("agentbox").join("skills"))
}
