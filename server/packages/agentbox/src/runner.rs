//! Per-task orchestration loop.
//!
//! A runner pops one input event at a time, keeps the working conversation
//! inside the model's context budget, dispatches tool calls and appends every
//! visible effect to the task's output stream. Tool failures are reported to
//! the model and never end the task; only stream failures do.

use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use utoipa::ToSchema;

use crate::classifier::ContinuationClassifier;
use crate::config::AgentConfig;
use crate::context_window::resolve_context_window;
use crate::conversation::Conversation;
use crate::events::{decode_event, now_unix, AgentEvent, MessageEvent, Role, ToolEvent, ToolStatus, WaitEvent};
use crate::model::{ChatModel, ToolCall};
use crate::stream::{EventStream, StreamEntry, StreamError, StreamId};
use crate::tools::builtin::{parse_user_message, BuiltinTool};
use crate::tools::ToolRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Idle,
    Running,
    SuspendedOnToolCall,
    Completed,
    Failed,
}

impl TaskPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

pub fn input_stream(task_id: &str) -> String {
    format!("task:{task_id}:input")
}

pub fn output_stream(task_id: &str) -> String {
    format!("task:{task_id}:output")
}

/// Read position on a task's input stream. Only the owning runner advances it.
#[derive(Debug)]
pub struct TaskInput {
    stream: String,
    cursor: Option<StreamId>,
}

impl TaskInput {
    pub fn new(task_id: &str) -> Self {
        Self {
            stream: input_stream(task_id),
            cursor: None,
        }
    }

    pub fn cursor(&self) -> Option<StreamId> {
        self.cursor
    }

    async fn next(&mut self, streams: &dyn EventStream) -> Result<StreamEntry, StreamError> {
        let entry = streams.pop(&self.stream, self.cursor).await?;
        self.cursor = Some(entry.id);
        Ok(entry)
    }
}

/// Shared collaborators every runner is built from.
#[derive(Clone)]
pub struct RunnerContext {
    pub streams: Arc<dyn EventStream>,
    pub model: Arc<dyn ChatModel>,
    pub classifier: ContinuationClassifier,
    pub tools: Arc<ToolRegistry>,
    pub config: Arc<AgentConfig>,
}

enum Flow {
    Continue,
    Complete,
}

enum ToolFlow {
    Continue,
    EndTurn,
    Complete,
}

pub struct TaskRunner {
    task_id: String,
    user_id: String,
    input: TaskInput,
    output: String,
    ctx: RunnerContext,
    conversation: Conversation,
    last_substantive: Option<String>,
    phase: watch::Sender<TaskPhase>,
}

impl TaskRunner {
    pub fn new(
        task_id: impl Into<String>,
        user_id: impl Into<String>,
        ctx: RunnerContext,
    ) -> (Self, watch::Receiver<TaskPhase>) {
        let task_id = task_id.into();
        let (phase, phase_rx) = watch::channel(TaskPhase::Idle);
        let runner = Self {
            input: TaskInput::new(&task_id),
            output: output_stream(&task_id),
            conversation: Conversation::new(ctx.config.system_prompt.clone()),
            task_id,
            user_id: user_id.into(),
            ctx,
            last_substantive: None,
            phase,
        };
        (runner, phase_rx)
    }

    fn set_phase(&self, phase: TaskPhase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            tracing::debug!(task_id = %self.task_id, from = ?previous, to = ?phase, "task phase");
        }
    }

    /// Runs until the task completes or fails and returns the terminal phase.
    pub async fn run(mut self) -> TaskPhase {
        tracing::info!(task_id = %self.task_id, user_id = %self.user_id, "task started");
        loop {
            let entry = match self.input.next(self.ctx.streams.as_ref()).await {
                Ok(entry) => entry,
                Err(StreamError::Closed(_)) => {
                    tracing::info!(task_id = %self.task_id, "input stream closed");
                    return self.finish(TaskPhase::Completed);
                }
                Err(err) => return self.fail(err.into()).await,
            };
            self.set_phase(TaskPhase::Running);

            let event = match decode_event(&entry.id, &entry.payload) {
                Ok(event) => event,
                Err(err) => {
                    tracing::warn!(task_id = %self.task_id, event_id = %entry.id, error = %err, "skipping undecodable event");
                    self.set_phase(TaskPhase::Idle);
                    continue;
                }
            };

            match self.handle_event(event).await {
                Ok(Flow::Continue) => self.set_phase(TaskPhase::Idle),
                Ok(Flow::Complete) => return self.finish(TaskPhase::Completed),
                Err(err) => return self.fail(err).await,
            }
        }
    }

    fn finish(&self, phase: TaskPhase) -> TaskPhase {
        self.set_phase(phase);
        tracing::info!(task_id = %self.task_id, phase = ?phase, "task finished");
        phase
    }

    async fn fail(&self, err: RunnerError) -> TaskPhase {
        tracing::error!(task_id = %self.task_id, error = %err, "task failed");
        // Best effort: the output stream may be the thing that failed.
        let _ = self.emit(AgentEvent::error(format!("task failed: {err}"))).await;
        self.finish(TaskPhase::Failed)
    }

    async fn emit(&self, event: AgentEvent) -> Result<StreamId, RunnerError> {
        let payload = event.encode()?;
        let id = self.ctx.streams.put(&self.output, payload.into_bytes()).await?;
        tracing::debug!(task_id = %self.task_id, event_id = %id, kind = event.kind(), "event emitted");
        Ok(id)
    }

    async fn handle_event(&mut self, event: AgentEvent) -> Result<Flow, RunnerError> {
        match event {
            AgentEvent::Message(message) => match message.role {
                Role::User => self.handle_user_message(message).await,
                Role::System => {
                    self.conversation.push_system(message.message);
                    Ok(Flow::Continue)
                }
                Role::Assistant => {
                    tracing::debug!(task_id = %self.task_id, event_id = %message.id, "ignoring assistant message on input");
                    Ok(Flow::Continue)
                }
            },
            AgentEvent::Done(_) => {
                self.emit(AgentEvent::done()).await?;
                Ok(Flow::Complete)
            }
            other => {
                tracing::debug!(task_id = %self.task_id, kind = other.kind(), event_id = %other.id(), "ignoring input event");
                Ok(Flow::Continue)
            }
        }
    }

    async fn handle_user_message(&mut self, message: MessageEvent) -> Result<Flow, RunnerError> {
        let text = message.message.clone();
        let is_continuation = match &self.last_substantive {
            Some(previous) => self.ctx.classifier.is_continuation(previous, &text).await,
            None => false,
        };
        if !is_continuation {
            if self.last_substantive.is_some() {
                tracing::info!(task_id = %self.task_id, event_id = %message.id, "new task detected, resetting context");
            }
            self.conversation.reset();
            self.last_substantive = Some(text.clone());
        }

        self.emit(AgentEvent::Message(MessageEvent {
            id: String::new(),
            timestamp: now_unix(),
            ..message.clone()
        }))
        .await?;
        self.conversation
            .push_user(user_content(&message), !is_continuation);
        self.run_turn().await
    }

    fn context_budget(&self) -> usize {
        let window = resolve_context_window(self.ctx.model.name(), &self.ctx.config.context_overflow);
        window.saturating_sub(self.ctx.config.reserved_output_tokens) as usize
    }

    async fn run_turn(&mut self) -> Result<Flow, RunnerError> {
        let budget = self.context_budget();
        for step in 0..self.ctx.config.max_steps {
            self.conversation.fit(budget);
            let tools = self.ctx.tools.enabled_tools_for_user(&self.user_id).await;
            let reply = match self.ctx.model.complete(&self.conversation.messages(), &tools).await {
                Ok(reply) => reply,
                Err(err) => {
                    tracing::warn!(task_id = %self.task_id, step, error = %err, "model call failed");
                    self.emit(AgentEvent::error(format!("model request failed: {err}"))).await?;
                    return Ok(Flow::Continue);
                }
            };

            self.conversation
                .push_assistant(reply.content.clone(), reply.tool_calls.clone());
            if !reply.content.trim().is_empty() {
                self.emit(AgentEvent::assistant_message(reply.content, Vec::new()))
                    .await?;
            }
            if reply.tool_calls.is_empty() {
                return Ok(Flow::Continue);
            }

            // Every call gets a result so the next request stays well formed.
            let mut end_turn = false;
            let mut complete = false;
            for call in reply.tool_calls {
                match self.handle_tool_call(call).await? {
                    ToolFlow::Continue => {}
                    ToolFlow::EndTurn => end_turn = true,
                    ToolFlow::Complete => complete = true,
                }
            }
            if complete {
                self.emit(AgentEvent::done()).await?;
                return Ok(Flow::Complete);
            }
            if end_turn {
                return Ok(Flow::Continue);
            }
        }

        tracing::warn!(task_id = %self.task_id, max_steps = self.ctx.config.max_steps, "step limit reached");
        self.emit(AgentEvent::error(format!(
            "stopped after {} model steps without finishing",
            self.ctx.config.max_steps
        )))
        .await?;
        Ok(Flow::Continue)
    }

    async fn handle_tool_call(&mut self, call: ToolCall) -> Result<ToolFlow, RunnerError> {
        self.set_phase(TaskPhase::SuspendedOnToolCall);
        let mut event = ToolEvent {
            id: String::new(),
            timestamp: now_unix(),
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
            status: ToolStatus::Calling,
            result: None,
            error: None,
        };
        self.emit(AgentEvent::Tool(event.clone())).await?;

        let result = self
            .ctx
            .tools
            .invoke_for_user(&self.user_id, &call.name, call.arguments.clone())
            .await;
        event.timestamp = now_unix();
        let succeeded = match result {
            Ok(output) => {
                self.conversation.push_tool_result(&call.id, &output.content);
                event.status = ToolStatus::Called;
                event.result = Some(output.content);
                true
            }
            Err(err) => {
                tracing::info!(task_id = %self.task_id, tool = %call.name, error = %err, "tool call failed");
                self.conversation
                    .push_tool_result(&call.id, format!("error: {err}"));
                event.status = ToolStatus::Failed;
                event.error = Some(err.to_string());
                false
            }
        };
        self.emit(AgentEvent::Tool(event)).await?;
        self.set_phase(TaskPhase::Running);

        if !succeeded {
            return Ok(ToolFlow::Continue);
        }
        let flow = match BuiltinTool::from_name(&call.name) {
            Some(BuiltinTool::NotifyUser) => {
                if let Ok(args) = parse_user_message(&call.arguments) {
                    self.emit(AgentEvent::assistant_message(args.text.clone(), args.file_refs()))
                        .await?;
                }
                ToolFlow::Continue
            }
            Some(BuiltinTool::AskUser) => {
                if let Ok(args) = parse_user_message(&call.arguments) {
                    self.emit(AgentEvent::Wait(WaitEvent {
                        id: String::new(),
                        timestamp: now_unix(),
                        message: args.text,
                        suggest_user_takeover: args.suggest_user_takeover,
                    }))
                    .await?;
                }
                ToolFlow::EndTurn
            }
            Some(BuiltinTool::Idle) => ToolFlow::Complete,
            None => ToolFlow::Continue,
        };
        Ok(flow)
    }
}

fn user_content(message: &MessageEvent) -> String {
    if message.attachments.is_empty() {
        return message.message.clone();
    }
    let files: Vec<String> = message
        .attachments
        .iter()
        .map(|file| match &file.filename {
            Some(name) => format!("{name} (id: {})", file.file_id),
            None => format!("id: {}", file.file_id),
        })
        .collect();
    format!("{}\n\nAttached files: {}", message.message, files.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::FileRef;

    #[test]
    fn stream_names_are_scoped_by_task() {
        assert_eq!(input_stream("t1"), "task:t1:input");
        assert_eq!(output_stream("t1"), "task:t1:output");
    }

    #[test]
    fn attachments_are_listed_for_the_model() {
        let message = MessageEvent {
            id: String::new(),
            timestamp: 0,
            role: Role::User,
            message: "summarize".to_string(),
            attachments: vec![FileRef {
                file_id: "f-1".to_string(),
                filename: Some("report.pdf".to_string()),
                content_type: None,
                size: None,
            }],
        };
        assert_eq!(
            user_content(&message),
            "summarize\n\nAttached files: report.pdf (id: f-1)"
        );
    }

    #[test]
    fn only_completed_and_failed_are_terminal() {
        assert!(TaskPhase::Completed.is_terminal());
        assert!(TaskPhase::Failed.is_terminal());
        assert!(!TaskPhase::SuspendedOnToolCall.is_terminal());
    }
}
