//! Typed events carried on task streams.
//!
//! The raw payload read from a stream is the source of truth; [`AgentEvent`]
//! is a view decoded from it. Decoding always stamps the stream-assigned id
//! onto the event so redelivered entries keep their identity.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use utoipa::ToSchema;

use crate::stream::StreamId;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid utf-8")]
    Utf8,
    #[error("invalid event payload: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Weak reference to a file owned by the file storage service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileRef {
    pub file_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct MessageEvent {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub timestamp: i64,
    pub role: Role,
    pub message: String,
    #[serde(default)]
    pub attachments: Vec<FileRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Calling,
    Called,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ToolEvent {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub timestamp: i64,
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What the agent asks the human to take over before it continues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Takeover {
    #[default]
    None,
    Shell,
    Browser,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct WaitEvent {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub timestamp: i64,
    pub message: String,
    #[serde(default)]
    pub suggest_user_takeover: Takeover,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ErrorEvent {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub timestamp: i64,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct DoneEvent {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Message(MessageEvent),
    Tool(ToolEvent),
    Wait(WaitEvent),
    Error(ErrorEvent),
    Done(DoneEvent),
}

impl AgentEvent {
    pub fn user_message(message: impl Into<String>, attachments: Vec<FileRef>) -> Self {
        Self::Message(MessageEvent {
            id: String::new(),
            timestamp: now_unix(),
            role: Role::User,
            message: message.into(),
            attachments,
        })
    }

    pub fn assistant_message(message: impl Into<String>, attachments: Vec<FileRef>) -> Self {
        Self::Message(MessageEvent {
            id: String::new(),
            timestamp: now_unix(),
            role: Role::Assistant,
            message: message.into(),
            attachments,
        })
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::Error(ErrorEvent {
            id: String::new(),
            timestamp: now_unix(),
            error: error.into(),
        })
    }

    pub fn done() -> Self {
        Self::Done(DoneEvent {
            id: String::new(),
            timestamp: now_unix(),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::Tool(_) => "tool",
            Self::Wait(_) => "wait",
            Self::Error(_) => "error",
            Self::Done(_) => "done",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Message(event) => &event.id,
            Self::Tool(event) => &event.id,
            Self::Wait(event) => &event.id,
            Self::Error(event) => &event.id,
            Self::Done(event) => &event.id,
        }
    }

    fn set_id(&mut self, id: String) {
        match self {
            Self::Message(event) => event.id = id,
            Self::Tool(event) => event.id = id,
            Self::Wait(event) => event.id = id,
            Self::Error(event) => event.id = id,
            Self::Done(event) => event.id = id,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Decodes a raw stream payload, overwriting the embedded id with `stream_id`.
pub fn decode_event(stream_id: &StreamId, raw: &[u8]) -> Result<AgentEvent, DecodeError> {
    let text = std::str::from_utf8(raw).map_err(|_| DecodeError::Utf8)?;
    let mut event: AgentEvent = serde_json::from_str(text)?;
    event.set_id(stream_id.to_string());
    Ok(event)
}

pub(crate) fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
