mod common;

use std::sync::Arc;

use agentbox::classifier::ContinuationClassifier;
use agentbox::config::AgentConfig;
use agentbox::context_window::ContextOverflowConfig;
use agentbox::events::{AgentEvent, Role, Takeover, ToolStatus};
use agentbox::model::ChatRole;
use agentbox::runner::{input_stream, output_stream, TaskPhase};
use agentbox::stream::{EventStream, MemoryEventStream, StreamEntry, StreamError, StreamId};
use agentbox::tasks::TaskManager;
use agentbox::tools::{ToolKind, ToolRegistry};
use agentbox_error::AgentboxError;
use async_trait::async_trait;
use common::{call, text, verdict, Harness, ScriptedModel};
use serde_json::json;

async fn all_events(harness: &Harness, task_id: &str) -> Vec<AgentEvent> {
    harness
        .tasks
        .events(task_id, None, 1_000)
        .await
        .expect("events")
}

fn kinds(events: &[AgentEvent]) -> Vec<&'static str> {
    events.iter().map(AgentEvent::kind).collect()
}

#[tokio::test]
async fn unknown_tool_is_reported_and_the_task_keeps_going() {
    let harness = Harness::new(
        vec![
            call("c1", "browse_web", json!({"url": "https://example.com"})),
            call("c2", "idle", json!({})),
        ],
        Vec::new(),
    );
    let task = harness.tasks.create_task("alice").await;
    harness
        .tasks
        .post_message(&task.id, "find cheap flights", Vec::new())
        .await
        .expect("post");

    assert_eq!(harness.wait(&task.id).await, TaskPhase::Completed);

    let events = all_events(&harness, &task.id).await;
    assert_eq!(
        kinds(&events),
        vec!["message", "tool", "tool", "tool", "tool", "done"]
    );
    let AgentEvent::Tool(failed) = &events[2] else {
        panic!("expected tool event, got {:?}", events[2]);
    };
    assert_eq!(failed.status, ToolStatus::Failed);
    assert_eq!(failed.tool_name, "browse_web");
    assert_eq!(failed.error.as_deref(), Some("tool not found: browse_web"));

    let requests = harness.model.requests();
    assert_eq!(requests.len(), 2);
    let last = requests[1].last().expect("tool result");
    assert_eq!(last.role, ChatRole::Tool);
    assert_eq!(last.tool_call_id.as_deref(), Some("c1"));
    assert_eq!(last.content, "error: tool not found: browse_web");
}

#[tokio::test]
async fn undecodable_input_is_skipped() {
    let harness = Harness::new(vec![text("hi there")], Vec::new());
    let task = harness.tasks.create_task("alice").await;
    harness
        .streams
        .put(&input_stream(&task.id), b"{not json".to_vec())
        .await
        .expect("put garbage");
    harness
        .tasks
        .post_message(&task.id, "hello", Vec::new())
        .await
        .expect("post");
    harness.tasks.stop_task(&task.id).await.expect("stop");

    assert_eq!(harness.wait(&task.id).await, TaskPhase::Completed);
    let events = all_events(&harness, &task.id).await;
    assert_eq!(kinds(&events), vec!["message", "message", "done"]);
    let AgentEvent::Message(reply) = &events[1] else {
        panic!("expected assistant message");
    };
    assert_eq!(reply.role, Role::Assistant);
    assert_eq!(reply.message, "hi there");
}

#[tokio::test]
async fn event_ids_are_the_stream_ids() {
    let harness = Harness::new(vec![text("sure")], Vec::new());
    let task = harness.tasks.create_task("alice").await;
    // A producer-supplied id must never leak through.
    let forged = json!({
        "type": "message",
        "id": "forged-id",
        "role": "user",
        "message": "hello"
    })
    .to_string();
    harness
        .streams
        .put(&input_stream(&task.id), forged.into_bytes())
        .await
        .expect("put");
    harness.tasks.stop_task(&task.id).await.expect("stop");
    assert_eq!(harness.wait(&task.id).await, TaskPhase::Completed);

    let raw = harness
        .streams
        .read(&output_stream(&task.id), None, 100)
        .await
        .expect("read");
    let events = all_events(&harness, &task.id).await;
    assert_eq!(raw.len(), events.len());
    for (entry, event) in raw.iter().zip(&events) {
        assert_eq!(event.id(), entry.id.to_string());
    }
    assert!(events.iter().all(|event| event.id() != "forged-id"));
}

#[tokio::test]
async fn ask_user_emits_wait_and_ends_the_turn() {
    let harness = Harness::new(
        vec![call(
            "c1",
            "message_ask_user",
            json!({"text": "Please log in", "suggest_user_takeover": "browser"}),
        )],
        Vec::new(),
    );
    let task = harness.tasks.create_task("alice").await;
    harness
        .tasks
        .post_message(&task.id, "check my inbox", Vec::new())
        .await
        .expect("post");
    harness.tasks.stop_task(&task.id).await.expect("stop");
    assert_eq!(harness.wait(&task.id).await, TaskPhase::Completed);

    let events = all_events(&harness, &task.id).await;
    assert_eq!(
        kinds(&events),
        vec!["message", "tool", "tool", "wait", "done"]
    );
    let AgentEvent::Wait(wait) = &events[3] else {
        panic!("expected wait event");
    };
    assert_eq!(wait.message, "Please log in");
    assert_eq!(wait.suggest_user_takeover, Takeover::Browser);
    assert_eq!(harness.model.requests().len(), 1);
}

#[tokio::test]
async fn notify_user_surfaces_an_assistant_message_with_attachments() {
    let harness = Harness::new(
        vec![
            call(
                "c1",
                "message_notify_user",
                json!({"text": "Report ready", "attachments": ["file-9"]}),
            ),
            call("c2", "idle", json!({})),
        ],
        Vec::new(),
    );
    let task = harness.tasks.create_task("alice").await;
    harness
        .tasks
        .post_message(&task.id, "write the report", Vec::new())
        .await
        .expect("post");
    assert_eq!(harness.wait(&task.id).await, TaskPhase::Completed);

    let events = all_events(&harness, &task.id).await;
    let notice = events
        .iter()
        .find_map(|event| match event {
            AgentEvent::Message(message) if message.role == Role::Assistant => Some(message),
            _ => None,
        })
        .expect("assistant message");
    assert_eq!(notice.message, "Report ready");
    assert_eq!(notice.attachments[0].file_id, "file-9");
    assert_eq!(kinds(&events).last(), Some(&"done"));
}

#[tokio::test]
async fn new_task_message_resets_the_context() {
    let harness = Harness::new(
        vec![text("Flight booked."), text("Ordering now.")],
        vec![verdict(false)],
    );
    let task = harness.tasks.create_task("alice").await;
    harness
        .tasks
        .post_message(&task.id, "book a flight to Oslo", Vec::new())
        .await
        .expect("post");
    harness
        .tasks
        .post_message(&task.id, "order a pizza", Vec::new())
        .await
        .expect("post");
    harness.tasks.stop_task(&task.id).await.expect("stop");
    assert_eq!(harness.wait(&task.id).await, TaskPhase::Completed);

    let requests = harness.model.requests();
    assert_eq!(requests.len(), 2);
    let second = &requests[1];
    assert_eq!(second.len(), 2);
    assert_eq!(second[0].role, ChatRole::System);
    assert_eq!(second[1].content, "order a pizza");

    let classified = harness.classifier.requests();
    assert_eq!(classified.len(), 1);
    let prompt = &classified[0][1].content;
    assert!(prompt.contains("book a flight to Oslo"));
    assert!(prompt.contains("order a pizza"));
}

#[tokio::test]
async fn continuation_keeps_the_history() {
    let harness = Harness::new(
        vec![text("Step one done."), text("Step two done.")],
        vec![verdict(true)],
    );
    let task = harness.tasks.create_task("alice").await;
    for message in ["migrate the database", "continue"] {
        harness
            .tasks
            .post_message(&task.id, message, Vec::new())
            .await
            .expect("post");
    }
    harness.tasks.stop_task(&task.id).await.expect("stop");
    assert_eq!(harness.wait(&task.id).await, TaskPhase::Completed);

    let requests = harness.model.requests();
    let contents: Vec<&str> = requests[1].iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents.len(), 4);
    assert_eq!(
        &contents[1..],
        &["migrate the database", "Step one done.", "continue"]
    );
}

#[tokio::test]
async fn classifier_garbage_is_treated_as_a_new_task() {
    let harness = Harness::new(
        vec![text("first"), text("second")],
        vec![text("Sure, that looks like a continuation to me!")],
    );
    let task = harness.tasks.create_task("alice").await;
    for message in ["draft the email", "ok go"] {
        harness
            .tasks
            .post_message(&task.id, message, Vec::new())
            .await
            .expect("post");
    }
    harness.tasks.stop_task(&task.id).await.expect("stop");
    assert_eq!(harness.wait(&task.id).await, TaskPhase::Completed);

    let requests = harness.model.requests();
    assert_eq!(requests[1].len(), 2);
    assert_eq!(requests[1][1].content, "ok go");
}

#[tokio::test]
async fn trimming_keeps_the_task_defining_message() {
    let config = AgentConfig {
        system_prompt: "sys".to_string(),
        context_overflow: ContextOverflowConfig {
            context_window: Some(25),
            ..ContextOverflowConfig::default()
        },
        reserved_output_tokens: 0,
        ..AgentConfig::default()
    };
    let harness = Harness::with_config(
        vec![text(&"x".repeat(40)), text("done")],
        vec![verdict(true)],
        config,
    );
    let task = harness.tasks.create_task("alice").await;
    for message in ["task one", "go on"] {
        harness
            .tasks
            .post_message(&task.id, message, Vec::new())
            .await
            .expect("post");
    }
    harness.tasks.stop_task(&task.id).await.expect("stop");
    assert_eq!(harness.wait(&task.id).await, TaskPhase::Completed);

    let requests = harness.model.requests();
    let contents: Vec<&str> = requests[1].iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["sys", "task one", "go on"]);
}

#[tokio::test]
async fn tools_disabled_for_the_user_are_hidden_and_not_callable() {
    let harness = Harness::new(
        vec![
            call("c1", "message_notify_user", json!({"text": "hi"})),
            call("c2", "idle", json!({})),
        ],
        Vec::new(),
    );
    harness
        .tasks
        .tools()
        .preferences()
        .set("alice", ToolKind::Native, "message_notify_user", false)
        .await;
    let task = harness.tasks.create_task("alice").await;
    harness
        .tasks
        .post_message(&task.id, "say hi", Vec::new())
        .await
        .expect("post");
    assert_eq!(harness.wait(&task.id).await, TaskPhase::Completed);

    let offered = harness.model.offered_tools();
    assert!(!offered[0].iter().any(|name| name == "message_notify_user"));
    assert!(offered[0].iter().any(|name| name == "idle"));

    let events = all_events(&harness, &task.id).await;
    let failed = events
        .iter()
        .find_map(|event| match event {
            AgentEvent::Tool(tool) if tool.status == ToolStatus::Failed => Some(tool),
            _ => None,
        })
        .expect("failed tool event");
    assert_eq!(failed.error.as_deref(), Some("tool not found: message_notify_user"));
}

#[tokio::test]
async fn model_failure_is_reported_without_ending_the_task() {
    let harness = Harness::new(Vec::new(), Vec::new());
    harness.model.push_failure("upstream overloaded");
    let task = harness.tasks.create_task("alice").await;
    harness
        .tasks
        .post_message(&task.id, "summarize the logs", Vec::new())
        .await
        .expect("post");
    harness.tasks.stop_task(&task.id).await.expect("stop");
    assert_eq!(harness.wait(&task.id).await, TaskPhase::Completed);

    let events = all_events(&harness, &task.id).await;
    assert_eq!(kinds(&events), vec!["message", "error", "done"]);
    let AgentEvent::Error(error) = &events[1] else {
        panic!("expected error event");
    };
    assert!(error.error.contains("upstream overloaded"));
}

#[tokio::test]
async fn step_limit_cuts_off_a_runaway_turn() {
    let config = AgentConfig {
        max_steps: 2,
        ..AgentConfig::default()
    };
    let harness = Harness::with_config(
        vec![
            call("c1", "message_notify_user", json!({"text": "working"})),
            call("c2", "message_notify_user", json!({"text": "still working"})),
            call("c3", "message_notify_user", json!({"text": "never sent"})),
        ],
        Vec::new(),
        config,
    );
    let task = harness.tasks.create_task("alice").await;
    harness
        .tasks
        .post_message(&task.id, "loop forever", Vec::new())
        .await
        .expect("post");
    harness.tasks.stop_task(&task.id).await.expect("stop");
    assert_eq!(harness.wait(&task.id).await, TaskPhase::Completed);

    assert_eq!(harness.model.requests().len(), 2);
    let events = all_events(&harness, &task.id).await;
    let error = events
        .iter()
        .find_map(|event| match event {
            AgentEvent::Error(error) => Some(error.error.clone()),
            _ => None,
        })
        .expect("error event");
    assert_eq!(error, "stopped after 2 model steps without finishing");
}

#[tokio::test]
async fn deleting_the_input_stream_completes_the_task() {
    let harness = Harness::new(Vec::new(), Vec::new());
    let task = harness.tasks.create_task("alice").await;
    harness
        .streams
        .delete(&input_stream(&task.id))
        .await
        .expect("delete");
    assert_eq!(harness.wait(&task.id).await, TaskPhase::Completed);
}

#[tokio::test]
async fn messages_after_completion_are_rejected() {
    let harness = Harness::new(Vec::new(), Vec::new());
    let task = harness.tasks.create_task("alice").await;
    harness.tasks.stop_task(&task.id).await.expect("stop");
    assert_eq!(harness.wait(&task.id).await, TaskPhase::Completed);

    let err = harness
        .tasks
        .post_message(&task.id, "one more thing", Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AgentboxError::TaskEnded { .. }));
    let err = harness.tasks.get_task("task-404").await.unwrap_err();
    assert!(matches!(err, AgentboxError::TaskNotFound { .. }));
}

/// Input works normally; every write to an output stream fails.
struct BrokenOutput {
    inner: MemoryEventStream,
}

#[async_trait]
impl EventStream for BrokenOutput {
    async fn put(&self, stream: &str, payload: Vec<u8>) -> Result<StreamId, StreamError> {
        if stream.ends_with(":output") {
            return Err(StreamError::Unavailable("connection reset".to_string()));
        }
        self.inner.put(stream, payload).await
    }

    async fn pop(&self, stream: &str, after: Option<StreamId>) -> Result<StreamEntry, StreamError> {
        self.inner.pop(stream, after).await
    }

    async fn read(
        &self,
        stream: &str,
        after: Option<StreamId>,
        limit: usize,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        self.inner.read(stream, after, limit).await
    }

    async fn delete(&self, stream: &str) -> Result<(), StreamError> {
        self.inner.delete(stream).await
    }
}

#[tokio::test]
async fn output_stream_failure_fails_the_task() {
    let config = AgentConfig::default();
    let model = ScriptedModel::new(vec![text("never delivered")]);
    let tasks = TaskManager::with_classifier(
        Arc::new(BrokenOutput {
            inner: MemoryEventStream::new(),
        }),
        model.clone(),
        ContinuationClassifier::new(model.clone()),
        Arc::new(ToolRegistry::new(config.tool_timeout)),
        config,
    );
    let task = tasks.create_task("alice").await;
    tasks
        .post_message(&task.id, "hello", Vec::new())
        .await
        .expect("post");

    let phase = tokio::time::timeout(std::time::Duration::from_secs(5), tasks.wait(&task.id))
        .await
        .expect("finished")
        .expect("task exists");
    assert_eq!(phase, TaskPhase::Failed);
    assert_eq!(
        tasks.get_task(&task.id).await.expect("task").phase,
        TaskPhase::Failed
    );
}

#[tokio::test]
async fn removing_a_finished_task_releases_its_streams() {
    let harness = Harness::new(vec![text("Done.")], Vec::new());
    let task = harness.tasks.create_task("alice").await;
    harness
        .tasks
        .post_message(&task.id, "archive the logs", Vec::new())
        .await
        .expect("post");

    let err = harness.tasks.remove_task(&task.id).await.unwrap_err();
    assert!(matches!(err, AgentboxError::Conflict { .. }), "{err:?}");

    harness.tasks.stop_task(&task.id).await.expect("stop");
    assert_eq!(harness.wait(&task.id).await, TaskPhase::Completed);
    assert_eq!(harness.streams.stream_count().await, 2);

    let removed = harness.tasks.remove_task(&task.id).await.expect("remove");
    assert_eq!(removed.phase, TaskPhase::Completed);
    assert_eq!(harness.streams.stream_count().await, 0);
    assert!(harness.tasks.list_tasks().await.is_empty());
    assert!(matches!(
        harness.tasks.get_task(&task.id).await,
        Err(AgentboxError::TaskNotFound { .. })
    ));
    assert!(matches!(
        harness.tasks.remove_task(&task.id).await,
        Err(AgentboxError::TaskNotFound { .. })
    ));
}
