use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use agentbox_error::AgentboxError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use utoipa::ToSchema;

use crate::classifier::ContinuationClassifier;
use crate::config::AgentConfig;
use crate::events::{decode_event, AgentEvent, FileRef};
use crate::model::ChatModel;
use crate::runner::{input_stream, output_stream, RunnerContext, TaskPhase, TaskRunner};
use crate::stream::{EventStream, StreamError, StreamId};
use crate::tools::ToolRegistry;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub id: String,
    pub user_id: String,
    pub phase: TaskPhase,
    pub created_at: i64,
}

#[derive(Debug)]
struct TaskEntry {
    user_id: String,
    created_at: i64,
    phase: watch::Receiver<TaskPhase>,
}

impl TaskEntry {
    fn info(&self, id: &str) -> TaskInfo {
        TaskInfo {
            id: id.to_string(),
            user_id: self.user_id.clone(),
            phase: *self.phase.borrow(),
            created_at: self.created_at,
        }
    }
}

/// Owns every task: spawns its runner and is the only writer of its input stream.
pub struct TaskManager {
    ctx: RunnerContext,
    tasks: RwLock<HashMap<String, TaskEntry>>,
    next_id: AtomicU64,
}

impl TaskManager {
    pub fn new(
        streams: Arc<dyn EventStream>,
        model: Arc<dyn ChatModel>,
        tools: Arc<ToolRegistry>,
        config: AgentConfig,
    ) -> Self {
        let classifier = ContinuationClassifier::new(model.clone());
        Self::with_classifier(streams, model, classifier, tools, config)
    }

    pub fn with_classifier(
        streams: Arc<dyn EventStream>,
        model: Arc<dyn ChatModel>,
        classifier: ContinuationClassifier,
        tools: Arc<ToolRegistry>,
        config: AgentConfig,
    ) -> Self {
        Self {
            ctx: RunnerContext {
                streams,
                model,
                classifier,
                tools,
                config: Arc::new(config),
            },
            tasks: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.ctx.tools
    }

    pub async fn create_task(&self, user_id: &str) -> TaskInfo {
        let id = format!("task-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let (runner, phase) = TaskRunner::new(id.clone(), user_id, self.ctx.clone());
        let entry = TaskEntry {
            user_id: user_id.to_string(),
            created_at: crate::events::now_unix(),
            phase,
        };
        let info = entry.info(&id);
        self.tasks.write().await.insert(id.clone(), entry);

        let task_id = id.clone();
        tokio::spawn(async move {
            let phase = runner.run().await;
            tracing::debug!(task_id = %task_id, phase = ?phase, "runner exited");
        });
        tracing::info!(task_id = %id, user_id = %user_id, "task created");
        info
    }

    pub async fn list_tasks(&self) -> Vec<TaskInfo> {
        let tasks = self.tasks.read().await;
        let mut list: Vec<TaskInfo> = tasks.iter().map(|(id, entry)| entry.info(id)).collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub async fn get_task(&self, task_id: &str) -> Result<TaskInfo, AgentboxError> {
        let tasks = self.tasks.read().await;
        tasks
            .get(task_id)
            .map(|entry| entry.info(task_id))
            .ok_or_else(|| not_found(task_id))
    }

    pub async fn subscribe(&self, task_id: &str) -> Result<watch::Receiver<TaskPhase>, AgentboxError> {
        let tasks = self.tasks.read().await;
        tasks
            .get(task_id)
            .map(|entry| entry.phase.clone())
            .ok_or_else(|| not_found(task_id))
    }

    /// Waits until the task reaches a terminal phase.
    pub async fn wait(&self, task_id: &str) -> Result<TaskPhase, AgentboxError> {
        let mut phase = self.subscribe(task_id).await?;
        let result = phase.wait_for(|phase| phase.is_terminal()).await.map(|phase| *phase);
        // The runner dropped its sender; whatever it last published is final.
        Ok(result.unwrap_or_else(|_| *phase.borrow()))
    }

    async fn ensure_live(&self, task_id: &str) -> Result<(), AgentboxError> {
        let info = self.get_task(task_id).await?;
        if info.phase.is_terminal() {
            return Err(AgentboxError::TaskEnded {
                task_id: task_id.to_string(),
                phase: format!("{:?}", info.phase).to_lowercase(),
            });
        }
        Ok(())
    }

    async fn post(&self, task_id: &str, event: AgentEvent) -> Result<StreamId, AgentboxError> {
        self.ensure_live(task_id).await?;
        let payload = event
            .encode()
            .map_err(|err| AgentboxError::InvalidRequest {
                message: err.to_string(),
            })?;
        self.ctx
            .streams
            .put(&input_stream(task_id), payload.into_bytes())
            .await
            .map_err(stream_error)
    }

    pub async fn post_message(
        &self,
        task_id: &str,
        message: &str,
        attachments: Vec<FileRef>,
    ) -> Result<StreamId, AgentboxError> {
        let id = self
            .post(task_id, AgentEvent::user_message(message, attachments))
            .await?;
        tracing::debug!(task_id = %task_id, event_id = %id, "user message posted");
        Ok(id)
    }

    /// Appends `done` to the input; the runner completes after finishing
    /// whatever it is processing.
    pub async fn stop_task(&self, task_id: &str) -> Result<StreamId, AgentboxError> {
        let id = self.post(task_id, AgentEvent::done()).await?;
        tracing::info!(task_id = %task_id, "task stop requested");
        Ok(id)
    }

    /// Forgets a finished task and releases both of its streams.
    pub async fn remove_task(&self, task_id: &str) -> Result<TaskInfo, AgentboxError> {
        let info = {
            let mut tasks = self.tasks.write().await;
            let info = tasks
                .get(task_id)
                .map(|entry| entry.info(task_id))
                .ok_or_else(|| not_found(task_id))?;
            if !info.phase.is_terminal() {
                return Err(AgentboxError::Conflict {
                    message: format!("task {task_id} is still running; stop it first"),
                });
            }
            tasks.remove(task_id);
            info
        };
        for stream in [input_stream(task_id), output_stream(task_id)] {
            if let Err(err) = self.ctx.streams.purge(&stream).await {
                tracing::warn!(task_id = %task_id, stream = %stream, error = %err, "failed to purge task stream");
            }
        }
        tracing::info!(task_id = %task_id, "task removed");
        Ok(info)
    }

    pub async fn events(
        &self,
        task_id: &str,
        after: Option<StreamId>,
        limit: usize,
    ) -> Result<Vec<AgentEvent>, AgentboxError> {
        self.get_task(task_id).await?;
        let entries = self
            .ctx
            .streams
            .read(&output_stream(task_id), after, limit)
            .await
            .map_err(stream_error)?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| match decode_event(&entry.id, &entry.payload) {
                Ok(event) => Some(event),
                Err(err) => {
                    tracing::warn!(task_id = %task_id, event_id = %entry.id, error = %err, "skipping undecodable output event");
                    None
                }
            })
            .collect())
    }

    /// Waits for the next output event after `after`. Undecodable entries are skipped.
    pub async fn next_event(
        &self,
        task_id: &str,
        after: Option<StreamId>,
    ) -> Result<(StreamId, AgentEvent), AgentboxError> {
        let stream = output_stream(task_id);
        let mut cursor = after;
        loop {
            let entry = self
                .ctx
                .streams
                .pop(&stream, cursor)
                .await
                .map_err(stream_error)?;
            cursor = Some(entry.id);
            match decode_event(&entry.id, &entry.payload) {
                Ok(event) => return Ok((entry.id, event)),
                Err(err) => {
                    tracing::warn!(task_id = %task_id, event_id = %entry.id, error = %err, "skipping undecodable output event");
                }
            }
        }
    }
}

fn not_found(task_id: &str) -> AgentboxError {
    AgentboxError::TaskNotFound {
        task_id: task_id.to_string(),
    }
}

fn stream_error(err: StreamError) -> AgentboxError {
    AgentboxError::StreamError {
        message: err.to_string(),
    }
}
