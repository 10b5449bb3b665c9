//! Working context sent to the model, grouped into turns so trimming never
//! separates a tool call from its result.

use crate::model::{ChatMessage, ChatRole, ToolCall};

#[derive(Debug, Clone)]
struct Turn {
    messages: Vec<ChatMessage>,
    pinned: bool,
}

impl Turn {
    fn estimated_tokens(&self) -> usize {
        self.messages.iter().map(ChatMessage::estimated_tokens).sum()
    }
}

#[derive(Debug, Clone)]
pub struct Conversation {
    system: ChatMessage,
    turns: Vec<Turn>,
}

impl Conversation {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system: ChatMessage::system(system_prompt),
            turns: Vec::new(),
        }
    }

    /// Drops every turn; only the system prompt survives.
    pub fn reset(&mut self) {
        self.turns.clear();
    }

    /// Adds a user turn. The message that defines the current task is pinned.
    pub fn push_user(&mut self, content: impl Into<String>, pinned: bool) {
        self.turns.push(Turn {
            messages: vec![ChatMessage::user(content)],
            pinned,
        });
    }

    /// Adds an out-of-band system instruction; these are never trimmed.
    pub fn push_system(&mut self, content: impl Into<String>) {
        self.turns.push(Turn {
            messages: vec![ChatMessage::system(content)],
            pinned: true,
        });
    }

    pub fn push_assistant(&mut self, content: impl Into<String>, tool_calls: Vec<ToolCall>) {
        self.turns.push(Turn {
            messages: vec![ChatMessage::assistant(content, tool_calls)],
            pinned: false,
        });
    }

    /// Attaches a tool result to the assistant turn that issued the call.
    pub fn push_tool_result(&mut self, tool_call_id: impl Into<String>, content: impl Into<String>) {
        let message = ChatMessage::tool(tool_call_id, content);
        match self.turns.last_mut() {
            Some(turn) if turn.messages.first().map(|m| m.role) == Some(ChatRole::Assistant) => {
                turn.messages.push(message);
            }
            _ => self.turns.push(Turn {
                messages: vec![message],
                pinned: false,
            }),
        }
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        std::iter::once(self.system.clone())
            .chain(self.turns.iter().flat_map(|turn| turn.messages.iter().cloned()))
            .collect()
    }

    pub fn estimated_tokens(&self) -> usize {
        self.system.estimated_tokens() + self.turns.iter().map(Turn::estimated_tokens).sum::<usize>()
    }

    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }

    /// Removes the oldest unpinned turns until the estimate fits `budget`.
    /// Returns the number of turns dropped.
    pub fn fit(&mut self, budget: usize) -> usize {
        let mut total = self.estimated_tokens();
        let mut dropped = 0;
        while total > budget {
            let Some(idx) = self.turns.iter().position(|turn| !turn.pinned) else {
                tracing::warn!(
                    estimated_tokens = total,
                    budget,
                    "conversation: only pinned turns left, cannot trim further"
                );
                break;
            };
            let turn = self.turns.remove(idx);
            total -= turn.estimated_tokens();
            dropped += 1;
        }
        if dropped > 0 {
            tracing::debug!(dropped, estimated_tokens = total, budget, "conversation: trimmed");
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(id: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: "search".to_string(),
            arguments: json!({}),
        }
    }

    #[test]
    fn trims_oldest_unpinned_turns_and_keeps_pinned() {
        let mut conversation = Conversation::new("system");
        conversation.push_user("define the task", true);
        conversation.push_assistant("x".repeat(400), vec![call("c1")]);
        conversation.push_tool_result("c1", "y".repeat(400));
        conversation.push_user("more", false);

        let before = conversation.estimated_tokens();
        let dropped = conversation.fit(before - 1);
        assert_eq!(dropped, 1);

        let messages = conversation.messages();
        assert_eq!(messages[0].role, ChatRole::System);
        assert_eq!(messages[1].content, "define the task");
        // The assistant call and its result leave together.
        assert!(messages.iter().all(|m| m.role != ChatRole::Tool));
        assert_eq!(messages.last().map(|m| m.content.as_str()), Some("more"));
    }

    #[test]
    fn stops_when_only_pinned_turns_remain() {
        let mut conversation = Conversation::new("system");
        conversation.push_user("z".repeat(4000), true);
        conversation.push_system("stay concise");
        assert_eq!(conversation.fit(10), 0);
        assert_eq!(conversation.turn_count(), 2);
    }

    #[test]
    fn reset_keeps_only_the_system_prompt() {
        let mut conversation = Conversation::new("system");
        conversation.push_user("old task", true);
        conversation.reset();
        assert_eq!(conversation.messages().len(), 1);
    }
}
