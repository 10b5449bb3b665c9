//! Remote agents reached over the A2A JSON-RPC protocol, exposed as one tool each.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use url::Url;

use super::{tool_name, ToolDescriptor, ToolKind};
use crate::events::now_unix;

const AGENT_CARD_PATH: &str = ".well-known/agent.json";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct A2aAgentConfig {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCard {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub skills: Vec<AgentSkill>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentSkill {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Error)]
pub enum A2aError {
    #[error("invalid agent url: {0}")]
    Url(#[from] url::ParseError),
    #[error("a2a request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("a2a agent returned {status}")]
    Status { status: u16 },
    #[error("a2a agent error: {0}")]
    Rpc(String),
    #[error("invalid a2a response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug)]
pub struct A2aAgent {
    config: A2aAgentConfig,
    card: AgentCard,
    endpoint: Url,
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl A2aAgent {
    /// Fetches the agent card from `{url}/.well-known/agent.json`.
    pub async fn discover(config: A2aAgentConfig, client: reqwest::Client) -> Result<Self, A2aError> {
        let base = base_url(&config.url)?;
        let card_url = base.join(AGENT_CARD_PATH)?;
        let mut request = client.get(card_url);
        for (key, value) in &config.headers {
            request = request.header(key, value);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(A2aError::Status {
                status: response.status().as_u16(),
            });
        }
        let card: AgentCard = response.json().await?;
        let endpoint = match &card.url {
            Some(url) => Url::parse(url)?,
            None => base,
        };
        tracing::info!(agent = %config.id, name = %card.name, "a2a: agent discovered");
        Ok(Self {
            config,
            card,
            endpoint,
            client,
            next_id: AtomicU64::new(0),
        })
    }

    pub fn descriptor(&self) -> ToolDescriptor {
        let mut description = format!("Delegate a request to the remote agent `{}`.", self.card.name);
        if !self.card.description.is_empty() {
            description.push(' ');
            description.push_str(&self.card.description);
        }
        let skills: Vec<&str> = self
            .card
            .skills
            .iter()
            .map(|skill| skill.name.as_str())
            .filter(|name| !name.is_empty())
            .collect();
        if !skills.is_empty() {
            description.push_str(&format!(" Skills: {}.", skills.join(", ")));
        }
        ToolDescriptor {
            name: tool_name("a2a", &[&self.config.id]),
            description,
            parameters: json!({
                "type": "object",
                "properties": {
                    "message": {"type": "string", "description": "Request to send to the agent"},
                },
                "required": ["message"],
            }),
            kind: ToolKind::A2a,
            source_id: self.config.id.clone(),
            enabled: true,
        }
    }

    /// Sends a `message/send` request and returns the text of the reply.
    pub async fn send_message(&self, text: &str) -> Result<String, A2aError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "message/send",
            "params": {
                "message": {
                    "role": "user",
                    "kind": "message",
                    "messageId": format!("agentbox-{}-{id}", now_unix()),
                    "parts": [{"kind": "text", "text": text}],
                }
            }
        });
        let mut request = self.client.post(self.endpoint.clone()).json(&payload);
        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(A2aError::Status {
                status: response.status().as_u16(),
            });
        }
        let value: Value = response.json().await?;
        if let Some(error) = value.get("error") {
            return Err(A2aError::Rpc(error.to_string()));
        }
        let result = value
            .get("result")
            .ok_or_else(|| A2aError::InvalidResponse("missing result".to_string()))?;
        Ok(result_text(result))
    }
}

fn base_url(raw: &str) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(raw)?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Extracts the `message` argument from a tool call.
pub fn message_argument(arguments: &Value) -> Result<String, String> {
    match arguments {
        Value::String(text) => Ok(text.clone()),
        _ => arguments
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| "invalid arguments: `message` is required".to_string()),
    }
}

/// Collects text parts from a Message or Task result.
fn result_text(result: &Value) -> String {
    let mut texts = Vec::new();
    collect_parts(result.get("parts"), &mut texts);
    collect_parts(result.pointer("/status/message/parts"), &mut texts);
    if let Some(artifacts) = result.get("artifacts").and_then(Value::as_array) {
        for artifact in artifacts {
            collect_parts(artifact.get("parts"), &mut texts);
        }
    }
    if texts.is_empty() {
        return result.to_string();
    }
    texts.join("\n")
}

fn collect_parts(parts: Option<&Value>, texts: &mut Vec<String>) {
    let Some(parts) = parts.and_then(Value::as_array) else {
        return;
    };
    for part in parts {
        let kind = part
            .get("kind")
            .or_else(|| part.get("type"))
            .and_then(Value::as_str);
        if kind == Some("text") {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                texts.push(text.to_string());
            }
        }
    }
}
