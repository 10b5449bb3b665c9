#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agentbox::classifier::ContinuationClassifier;
use agentbox::config::AgentConfig;
use agentbox::model::{ChatMessage, ChatModel, ModelError, ModelReply, ToolCall};
use agentbox::runner::TaskPhase;
use agentbox::stream::{EventStream, MemoryEventStream};
use agentbox::supervisor::{Teardown, TeardownError};
use agentbox::tasks::TaskManager;
use agentbox::tools::{ToolDescriptor, ToolRegistry};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::util::ServiceExt;

/// Replays canned replies in order and records every request it receives.
/// Once the script runs out it answers with an empty reply, which ends a turn.
#[derive(Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<ModelReply, String>>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
    offered_tools: Mutex<Vec<Vec<String>>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<ModelReply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into_iter().map(Ok).collect()),
            ..Self::default()
        })
    }

    pub fn push_failure(&self, message: &str) {
        self.replies
            .lock()
            .expect("replies lock")
            .push_back(Err(message.to_string()));
    }

    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn offered_tools(&self) -> Vec<Vec<String>> {
        self.offered_tools.lock().expect("tools lock").clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted-model"
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDescriptor],
    ) -> Result<ModelReply, ModelError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(messages.to_vec());
        self.offered_tools
            .lock()
            .expect("tools lock")
            .push(tools.iter().map(|tool| tool.name.clone()).collect());
        let next = self.replies.lock().expect("replies lock").pop_front();
        match next {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(message)) => Err(ModelError::InvalidResponse(message)),
            None => Ok(ModelReply::default()),
        }
    }
}

pub fn text(content: &str) -> ModelReply {
    ModelReply {
        content: content.to_string(),
        tool_calls: Vec::new(),
    }
}

pub fn call(id: &str, name: &str, arguments: Value) -> ModelReply {
    ModelReply {
        content: String::new(),
        tool_calls: vec![ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        }],
    }
}

pub fn verdict(is_continuation: bool) -> ModelReply {
    text(&format!("{{\"is_continuation\": {is_continuation}}}"))
}

/// Task manager wired to scripted models and an in-memory stream.
pub struct Harness {
    pub streams: Arc<MemoryEventStream>,
    pub model: Arc<ScriptedModel>,
    pub classifier: Arc<ScriptedModel>,
    pub tasks: Arc<TaskManager>,
}

impl Harness {
    pub fn new(replies: Vec<ModelReply>, verdicts: Vec<ModelReply>) -> Self {
        Self::with_config(replies, verdicts, AgentConfig::default())
    }

    pub fn with_config(replies: Vec<ModelReply>, verdicts: Vec<ModelReply>, config: AgentConfig) -> Self {
        let tools = Arc::new(ToolRegistry::new(config.tool_timeout));
        Self::with_tools(replies, verdicts, config, tools)
    }

    pub fn with_tools(
        replies: Vec<ModelReply>,
        verdicts: Vec<ModelReply>,
        config: AgentConfig,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        let streams = Arc::new(MemoryEventStream::new());
        let model = ScriptedModel::new(replies);
        let classifier = ScriptedModel::new(verdicts);
        let tasks = Arc::new(TaskManager::with_classifier(
            streams.clone() as Arc<dyn EventStream>,
            model.clone(),
            ContinuationClassifier::new(classifier.clone()),
            tools,
            config,
        ));
        Self {
            streams,
            model,
            classifier,
            tasks,
        }
    }

    pub async fn wait(&self, task_id: &str) -> TaskPhase {
        tokio::time::timeout(Duration::from_secs(5), self.tasks.wait(task_id))
            .await
            .expect("task did not finish in time")
            .expect("task exists")
    }
}

/// Counts teardown invocations instead of destroying anything.
#[derive(Debug, Default)]
pub struct CountingTeardown {
    calls: AtomicUsize,
}

impl CountingTeardown {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Teardown for CountingTeardown {
    async fn teardown(&self) -> Result<(), TeardownError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub async fn send_request(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
    headers: &[(&str, &str)],
) -> (StatusCode, HeaderMap, Vec<u8>) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }

    let request_body = if let Some(body) = body {
        builder = builder.header(header::CONTENT_TYPE, "application/json");
        Body::from(body.to_string())
    } else {
        Body::empty()
    };

    let request = builder.body(request_body).expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes();
    (status, headers, bytes.to_vec())
}

pub fn parse_json(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(bytes).expect("valid json")
    }
}
