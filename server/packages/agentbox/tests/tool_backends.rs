mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use agentbox::config::{AgentConfig, ToolsConfig};
use agentbox::events::{AgentEvent, ToolStatus};
use agentbox::runner::TaskPhase;
use agentbox::tools::a2a::A2aAgentConfig;
use agentbox::tools::mcp::McpConfig;
use agentbox::tools::{ToolError, ToolKind, ToolRegistry};
use axum::routing::{get, post};
use axum::{Json, Router};
use common::{call, Harness};
use serde_json::{json, Value};
use tokio::net::TcpListener;

const TOOL_TIMEOUT: Duration = Duration::from_millis(300);
const STALL: Duration = Duration::from_secs(30);

async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

/// Accepts connections and never writes a byte back.
async fn silent_listener() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    format!("http://{addr}")
}

/// A2A agent whose card answers at once and whose replies take `delay`.
async fn a2a_agent(name: &'static str, delay: Duration) -> String {
    let app = Router::new()
        .route(
            "/.well-known/agent.json",
            get(move || async move {
                Json(json!({
                    "name": name,
                    "description": "Books meeting rooms.",
                    "skills": [{"name": "booking"}],
                }))
            }),
        )
        .route(
            "/",
            post(move |Json(request): Json<Value>| async move {
                tokio::time::sleep(delay).await;
                let text = request
                    .pointer("/params/message/parts/0/text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Json(json!({
                    "jsonrpc": "2.0",
                    "id": request["id"],
                    "result": {
                        "kind": "message",
                        "role": "agent",
                        "parts": [{"kind": "text", "text": format!("booked: {text}")}],
                    },
                }))
            }),
        );
    serve(app).await
}

/// Streamable-HTTP MCP server with a fast `echo` tool and a `stall` tool.
async fn mcp_server() -> String {
    let app = Router::new().route(
        "/mcp",
        post(|Json(request): Json<Value>| async move {
            let result = match request["method"].as_str() {
                Some("initialize") => json!({"protocolVersion": "2024-11-05", "capabilities": {}}),
                Some("tools/list") => json!({
                    "tools": [
                        {"name": "echo", "description": "Echo text", "inputSchema": {"type": "object"}},
                        {"name": "stall", "description": "Never finishes"},
                    ]
                }),
                Some("tools/call") if request["params"]["name"] == "stall" => {
                    tokio::time::sleep(STALL).await;
                    json!({"content": []})
                }
                Some("tools/call") => json!({
                    "content": [{"type": "text", "text": request["params"]["arguments"]["text"]}]
                }),
                _ => json!({}),
            };
            Json(json!({"jsonrpc": "2.0", "id": request["id"], "result": result}))
        }),
    );
    format!("{}/mcp", serve(app).await)
}

fn a2a_config(id: &str, url: String) -> A2aAgentConfig {
    A2aAgentConfig {
        id: id.to_string(),
        url,
        headers: HashMap::new(),
    }
}

fn assert_timed_out(err: ToolError, expected_tool: &str) {
    match err {
        ToolError::Execution { tool, cause } => {
            assert_eq!(tool, expected_tool);
            assert!(cause.contains("timed out"), "{cause}");
        }
        other => panic!("expected execution error, got {other:?}"),
    }
}

#[tokio::test]
async fn unresponsive_sources_are_skipped_during_build() {
    let silent = silent_listener().await;
    let config = ToolsConfig {
        mcp_servers: vec![
            (
                "hung-remote".to_string(),
                McpConfig::from_value(&json!({"type": "remote", "url": format!("{silent}/mcp")}))
                    .expect("remote config"),
            ),
            (
                "hung-stdio".to_string(),
                McpConfig::from_value(&json!({"command": ["sleep", "30"], "timeout": 200}))
                    .expect("local config"),
            ),
        ],
        a2a_agents: vec![a2a_config("hung", silent)],
        skills_dir: None,
    };

    let registry = tokio::time::timeout(Duration::from_secs(5), ToolRegistry::build(&config, TOOL_TIMEOUT))
        .await
        .expect("build returns despite stalled backends");

    let names: Vec<String> = registry.get_tools().into_iter().map(|tool| tool.name).collect();
    assert_eq!(names, vec!["message_notify_user", "message_ask_user", "idle"]);
    assert!(!registry.has_source(ToolKind::A2a, "hung"));
    assert!(!registry.has_source(ToolKind::Mcp, "hung-remote"));
}

#[tokio::test]
async fn a2a_round_trip_and_timeout() {
    let config = ToolsConfig {
        a2a_agents: vec![
            a2a_config("rooms", a2a_agent("Rooms", Duration::ZERO).await),
            a2a_config("slow", a2a_agent("Slowpoke", STALL).await),
        ],
        ..ToolsConfig::default()
    };
    let registry = ToolRegistry::build(&config, TOOL_TIMEOUT).await;

    let rooms = registry.get("a2a_rooms").expect("rooms tool");
    assert_eq!(rooms.kind, ToolKind::A2a);
    assert!(rooms.description.contains("Skills: booking."));

    let output = registry
        .invoke("a2a_rooms", json!({"message": "room 4 at noon"}))
        .await
        .expect("a2a reply");
    assert_eq!(output.content, "booked: room 4 at noon");

    let err = registry
        .invoke("a2a_slow", json!({"message": "anything"}))
        .await
        .unwrap_err();
    assert_timed_out(err, "a2a_slow");
}

#[tokio::test]
async fn mcp_round_trip_and_timeout() {
    let url = mcp_server().await;
    let config = ToolsConfig {
        mcp_servers: vec![(
            "stub".to_string(),
            McpConfig::from_value(&json!({"type": "remote", "url": url})).expect("config"),
        )],
        ..ToolsConfig::default()
    };
    let registry = ToolRegistry::build(&config, TOOL_TIMEOUT).await;
    assert!(registry.has_source(ToolKind::Mcp, "stub"));

    let output = registry
        .invoke("mcp_stub_echo", json!({"text": "hello"}))
        .await
        .expect("echo");
    assert_eq!(output.content, "hello");

    let err = registry.invoke("mcp_stub_stall", json!({})).await.unwrap_err();
    assert_timed_out(err, "mcp_stub_stall");
}

#[tokio::test]
async fn timed_out_tool_fails_the_call_not_the_task() {
    let config = ToolsConfig {
        a2a_agents: vec![a2a_config("slow", a2a_agent("Slowpoke", STALL).await)],
        ..ToolsConfig::default()
    };
    let agent_config = AgentConfig {
        tool_timeout: TOOL_TIMEOUT,
        ..AgentConfig::default()
    };
    let tools = Arc::new(ToolRegistry::build(&config, agent_config.tool_timeout).await);
    let harness = Harness::with_tools(
        vec![
            call("c1", "a2a_slow", json!({"message": "book a room"})),
            call("c2", "idle", json!({})),
        ],
        Vec::new(),
        agent_config,
        tools,
    );

    let task = harness.tasks.create_task("alice").await;
    harness
        .tasks
        .post_message(&task.id, "reserve something for noon", Vec::new())
        .await
        .expect("post");
    assert_eq!(harness.wait(&task.id).await, TaskPhase::Completed);

    let events = harness.tasks.events(&task.id, None, 1_000).await.expect("events");
    let tool_events: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            AgentEvent::Tool(tool) => Some(tool),
            _ => None,
        })
        .collect();
    let failed = tool_events
        .iter()
        .find(|tool| tool.tool_call_id == "c1" && tool.status == ToolStatus::Failed)
        .expect("failed tool event");
    assert!(failed.error.as_deref().is_some_and(|error| error.contains("timed out")));
    assert!(tool_events
        .iter()
        .any(|tool| tool.tool_name == "idle" && tool.status != ToolStatus::Failed));

    let requests = harness.model.requests();
    assert_eq!(requests.len(), 2);
    let last = requests[1].last().expect("tool result");
    assert!(last.content.starts_with("error: "), "{}", last.content);
    assert!(last.content.contains("timed out"));
}
