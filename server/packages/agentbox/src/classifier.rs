//! Decides whether a new user message continues the current task.

use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use crate::model::{ChatMessage, ChatModel, ModelError};

const CLASSIFIER_PROMPT: &str = r#"You decide whether a user's new message continues the task they already gave, or starts a new one.

Answer true only when the new message just asks to continue, confirm, retry, or move on (for example "continue", "go on", "yes", "ok, next") and introduces nothing new: no new task object, goal, scope, file, or tool preference.
Answer false whenever the new message adds any new intent, however short.

Respond with exactly one JSON object and nothing else:
{"is_continuation": true} or {"is_continuation": false}"#;

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("classifier response violated the output contract: {0}")]
    Contract(String),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Verdict {
    is_continuation: bool,
}

/// Parses a classifier reply. Anything but a lone `{"is_continuation": bool}`
/// object is a contract violation.
pub fn parse_verdict(reply: &str) -> Result<bool, ClassifierError> {
    let verdict: Verdict = serde_json::from_str(reply.trim())
        .map_err(|err| ClassifierError::Contract(err.to_string()))?;
    Ok(verdict.is_continuation)
}

#[derive(Clone)]
pub struct ContinuationClassifier {
    model: Arc<dyn ChatModel>,
}

impl ContinuationClassifier {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    async fn try_classify(&self, previous: &str, current: &str) -> Result<bool, ClassifierError> {
        let messages = [
            ChatMessage::system(CLASSIFIER_PROMPT),
            ChatMessage::user(format!(
                "Previous message:\n{previous}\n\nNew message:\n{current}"
            )),
        ];
        let reply = self.model.complete(&messages, &[]).await?;
        if !reply.tool_calls.is_empty() {
            return Err(ClassifierError::Contract(
                "classifier replied with tool calls".to_string(),
            ));
        }
        parse_verdict(&reply.content)
    }

    /// Returns `false` (new task) whenever the classifier fails.
    pub async fn is_continuation(&self, previous: &str, current: &str) -> bool {
        match self.try_classify(previous, current).await {
            Ok(verdict) => verdict,
            Err(err) => {
                tracing::warn!(error = %err, "continuation classifier failed, treating as new task");
                false
            }
        }
    }
}

impl std::fmt::Debug for ContinuationClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContinuationClassifier")
            .field("model", &self.model.name())
            .finish()
    }
}
