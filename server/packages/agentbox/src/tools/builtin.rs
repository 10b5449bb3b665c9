use serde::Deserialize;
use serde_json::{json, Value};

use super::{ToolDescriptor, ToolKind, ToolOutput};
use crate::events::{FileRef, Takeover};

/// Tools implemented in-process. The runner inspects these by name to emit
/// conversation-level events in addition to the tool result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinTool {
    NotifyUser,
    AskUser,
    Idle,
}

impl BuiltinTool {
    pub const ALL: [BuiltinTool; 3] = [Self::NotifyUser, Self::AskUser, Self::Idle];

    pub fn name(&self) -> &'static str {
        match self {
            Self::NotifyUser => "message_notify_user",
            Self::AskUser => "message_ask_user",
            Self::Idle => "idle",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tool| tool.name() == name)
    }

    pub fn descriptor(&self) -> ToolDescriptor {
        let (description, parameters) = match self {
            Self::NotifyUser => (
                "Send a message to the user without requiring a response. Use for progress updates and final results.",
                json!({
                    "type": "object",
                    "properties": {
                        "text": {"type": "string", "description": "Message text to display to the user"},
                        "attachments": attachments_schema(),
                    },
                    "required": ["text"],
                }),
            ),
            Self::AskUser => (
                "Ask the user a question and wait for their reply before continuing.",
                json!({
                    "type": "object",
                    "properties": {
                        "text": {"type": "string", "description": "Question text to present to the user"},
                        "attachments": attachments_schema(),
                        "suggest_user_takeover": {
                            "type": "string",
                            "enum": ["none", "shell", "browser"],
                            "description": "Suggest that the user take over the shell or browser before answering",
                        },
                    },
                    "required": ["text"],
                }),
            ),
            Self::Idle => (
                "Call when every task is complete and there is nothing left to do.",
                json!({"type": "object", "properties": {}, "required": []}),
            ),
        };
        ToolDescriptor {
            name: self.name().to_string(),
            description: description.to_string(),
            parameters,
            kind: ToolKind::Native,
            source_id: self.name().to_string(),
            enabled: true,
        }
    }

    pub fn execute(&self, arguments: &Value) -> Result<ToolOutput, String> {
        match self {
            Self::NotifyUser => {
                parse_user_message(arguments)?;
                Ok(ToolOutput::text("message delivered"))
            }
            Self::AskUser => {
                parse_user_message(arguments)?;
                Ok(ToolOutput::text("waiting for user reply"))
            }
            Self::Idle => Ok(ToolOutput::text("idle")),
        }
    }
}

fn attachments_schema() -> Value {
    json!({
        "type": "array",
        "items": {"type": "string"},
        "description": "File ids to attach",
    })
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserMessageArgs {
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub suggest_user_takeover: Takeover,
}

impl UserMessageArgs {
    pub fn file_refs(&self) -> Vec<FileRef> {
        self.attachments
            .iter()
            .map(|file_id| FileRef {
                file_id: file_id.clone(),
                filename: None,
                content_type: None,
                size: None,
            })
            .collect()
    }
}

/// Arguments shared by `message_notify_user` and `message_ask_user`.
pub fn parse_user_message(arguments: &Value) -> Result<UserMessageArgs, String> {
    UserMessageArgs::deserialize(arguments).map_err(|err| format!("invalid arguments: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for tool in BuiltinTool::ALL {
            assert_eq!(BuiltinTool::from_name(tool.name()), Some(tool));
        }
        assert_eq!(BuiltinTool::from_name("shell_exec"), None);
    }

    #[test]
    fn ask_user_takeover_enum_is_fixed() {
        let descriptor = BuiltinTool::AskUser.descriptor();
        assert_eq!(
            descriptor.parameters["properties"]["suggest_user_takeover"]["enum"],
            json!(["none", "shell", "browser"])
        );
    }

    #[test]
    fn parses_user_message_arguments() {
        let args = parse_user_message(&json!({
            "text": "log in please",
            "attachments": ["f-1"],
            "suggest_user_takeover": "browser"
        }))
        .expect("args");
        assert_eq!(args.suggest_user_takeover, Takeover::Browser);
        assert_eq!(args.file_refs()[0].file_id, "f-1");

        let defaults = parse_user_message(&json!({"text": "hi"})).expect("args");
        assert_eq!(defaults.suggest_user_takeover, Takeover::None);
        assert!(parse_user_message(&json!({"text": "x", "suggest_user_takeover": "desktop"})).is_err());
    }
}
