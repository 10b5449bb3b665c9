use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    Conflict,
    TokenInvalid,
    TaskNotFound,
    TaskEnded,
    TimeoutNotActive,
    StreamError,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:agentbox:error:invalid_request",
            Self::Conflict => "urn:agentbox:error:conflict",
            Self::TokenInvalid => "urn:agentbox:error:token_invalid",
            Self::TaskNotFound => "urn:agentbox:error:task_not_found",
            Self::TaskEnded => "urn:agentbox:error:task_ended",
            Self::TimeoutNotActive => "urn:agentbox:error:timeout_not_active",
            Self::StreamError => "urn:agentbox:error:stream_error",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::Conflict => "Conflict",
            Self::TokenInvalid => "Token Invalid",
            Self::TaskNotFound => "Task Not Found",
            Self::TaskEnded => "Task Ended",
            Self::TimeoutNotActive => "Timeout Not Active",
            Self::StreamError => "Stream Error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::Conflict => 409,
            Self::TokenInvalid => 401,
            Self::TaskNotFound => 404,
            Self::TaskEnded => 409,
            Self::TimeoutNotActive => 409,
            Self::StreamError => 502,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AgentboxError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("conflict: {message}")]
    Conflict { message: String },
    #[error("token invalid")]
    TokenInvalid { message: Option<String> },
    #[error("task not found: {task_id}")]
    TaskNotFound { task_id: String },
    #[error("task already ended: {task_id}")]
    TaskEnded { task_id: String, phase: String },
    #[error("timeout is not active")]
    TimeoutNotActive,
    #[error("stream error: {message}")]
    StreamError { message: String },
}

impl AgentboxError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::Conflict { .. } => ErrorType::Conflict,
            Self::TokenInvalid { .. } => ErrorType::TokenInvalid,
            Self::TaskNotFound { .. } => ErrorType::TaskNotFound,
            Self::TaskEnded { .. } => ErrorType::TaskEnded,
            Self::TimeoutNotActive => ErrorType::TimeoutNotActive,
            Self::StreamError { .. } => ErrorType::StreamError,
        }
    }

    fn extensions(&self) -> Map<String, Value> {
        let mut map = Map::new();
        match self {
            Self::InvalidRequest { .. } | Self::TimeoutNotActive => {}
            Self::Conflict { message } | Self::StreamError { message } => {
                map.insert(
                    "details".to_string(),
                    message_details(message.clone()),
                );
            }
            Self::TokenInvalid { message } => {
                if let Some(message) = message {
                    map.insert(
                        "details".to_string(),
                        message_details(message.clone()),
                    );
                }
            }
            Self::TaskNotFound { task_id } => {
                map.insert("taskId".to_string(), Value::String(task_id.clone()));
            }
            Self::TaskEnded { task_id, phase } => {
                map.insert("taskId".to_string(), Value::String(task_id.clone()));
                map.insert("phase".to_string(), Value::String(phase.clone()));
            }
        }
        map
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        problem.extensions = self.extensions();
        problem
    }
}

fn message_details(message: String) -> Value {
    let mut map = Map::new();
    map.insert("message".to_string(), Value::String(message));
    Value::Object(map)
}

impl From<AgentboxError> for ProblemDetails {
    fn from(value: AgentboxError) -> Self {
        value.to_problem_details()
    }
}

impl From<&AgentboxError> for ProblemDetails {
    fn from(value: &AgentboxError) -> Self {
        value.to_problem_details()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_not_found_carries_task_id_extension() {
        let problem = AgentboxError::TaskNotFound {
            task_id: "task-1".to_string(),
        }
        .to_problem_details();
        assert_eq!(problem.status, 404);
        assert_eq!(problem.type_, "urn:agentbox:error:task_not_found");
        assert_eq!(problem.extensions["taskId"], "task-1");
    }

    #[test]
    fn timeout_not_active_is_a_conflict_without_extensions() {
        let problem = ProblemDetails::from(AgentboxError::TimeoutNotActive);
        assert_eq!(problem.status, 409);
        assert!(problem.extensions.is_empty());
        let body = serde_json::to_value(&problem).expect("serialize");
        assert_eq!(body["title"], "Timeout Not Active");
        assert!(body.get("instance").is_none());
    }
}
