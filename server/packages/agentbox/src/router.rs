use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use agentbox_error::{AgentboxError, ErrorType, ProblemDetails};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post, put};
use axum::Json;
use axum::Router;
use base64::Engine;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{Modify, OpenApi, ToSchema};

use crate::events::{
    AgentEvent, DoneEvent, ErrorEvent, FileRef, MessageEvent, Role, Takeover, ToolEvent,
    ToolStatus, WaitEvent,
};
use crate::runner::TaskPhase;
use crate::stream::StreamId;
use crate::tasks::{TaskInfo, TaskManager};
use crate::tools::{ToolDescriptor, ToolKind};

pub mod sandbox;
mod types;

pub use types::*;

const DEFAULT_EVENTS_LIMIT: usize = 100;
const MAX_EVENTS_LIMIT: usize = 1_000;

pub struct AppState {
    auth: AuthConfig,
    tasks: Arc<TaskManager>,
}

impl AppState {
    pub fn new(auth: AuthConfig, tasks: Arc<TaskManager>) -> Self {
        Self { auth, tasks }
    }

    pub fn tasks(&self) -> &Arc<TaskManager> {
        &self.tasks
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub token: Option<String>,
}

impl AuthConfig {
    pub fn disabled() -> Self {
        Self { token: None }
    }

    pub fn with_token(token: String) -> Self {
        Self { token: Some(token) }
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let mut v1_router = Router::new()
        .route("/health", get(get_health))
        .route("/tools", get(list_tools))
        .route(
            "/users/:user_id/tools/:tool_type/:tool_id",
            put(set_tool_preference),
        )
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/:task_id", get(get_task).delete(delete_task))
        .route("/tasks/:task_id/messages", post(post_message))
        .route("/tasks/:task_id/stop", post(stop_task))
        .route("/tasks/:task_id/events", get(get_events))
        .route("/tasks/:task_id/events/sse", get(get_events_sse))
        .with_state(shared.clone());

    if shared.auth.token.is_some() {
        v1_router = v1_router.layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_token,
        ));
    }

    let router = Router::new()
        .nest("/api/v1", v1_router)
        .fallback(not_found);

    (with_http_logging(router), shared)
}

/// Adds the `http.request` trace layer unless `AGENTBOX_LOG_HTTP` is `0` or `false`.
pub(crate) fn with_http_logging(router: Router) -> Router {
    let http_logging = match std::env::var("AGENTBOX_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if !http_logging {
        return router;
    }
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|req: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %req.method(),
                uri = %req.uri()
            )
        })
        .on_request(|_req: &Request<_>, span: &Span| {
            tracing::debug!(parent: span, "request");
        })
        .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
            tracing::info!(
                parent: span,
                status = %res.status(),
                latency_ms = latency.as_millis()
            );
        });
    router.layer(trace_layer)
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        list_tools,
        set_tool_preference,
        create_task,
        list_tasks,
        get_task,
        delete_task,
        post_message,
        stop_task,
        get_events,
        get_events_sse
    ),
    components(
        schemas(
            HealthResponse,
            ToolDescriptor,
            ToolKind,
            ToolListResponse,
            ToolPreferenceRequest,
            ToolPreferenceResponse,
            CreateTaskRequest,
            TaskInfo,
            TaskPhase,
            TaskListResponse,
            MessageRequest,
            MessageAcceptedResponse,
            EventsResponse,
            AgentEvent,
            MessageEvent,
            ToolEvent,
            ToolStatus,
            WaitEvent,
            Takeover,
            ErrorEvent,
            DoneEvent,
            Role,
            FileRef,
            ProblemDetails,
            ErrorType
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "tools", description = "Tool catalog and per-user preferences"),
        (name = "tasks", description = "Agent task lifecycle")
    ),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new("http://localhost:2480")]);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Agentbox(#[from] AgentboxError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Agentbox(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "404 Not Found")
}

async fn require_token(
    State(state): State<Arc<AppState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let path = req.uri().path();
    if path == "/api/v1/health" || path == "/health" {
        return Ok(next.run(req).await);
    }

    let expected = match &state.auth.token {
        Some(token) => token.as_str(),
        None => return Ok(next.run(req).await),
    };

    let provided = extract_token(req.headers());
    if provided.as_deref() == Some(expected) {
        Ok(next.run(req).await)
    } else {
        Err(AgentboxError::TokenInvalid {
            message: Some("missing or invalid token".to_string()),
        }
        .into())
    }
}

/// Accepts `Bearer`, `Token` or HTTP Basic (the password part) credentials.
fn extract_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, rest) = value.trim().split_once(' ')?;
    let rest = rest.trim();
    match scheme.to_ascii_lowercase().as_str() {
        "bearer" | "token" => Some(rest.to_string()),
        "basic" => {
            let engines = [
                base64::engine::general_purpose::STANDARD,
                base64::engine::general_purpose::STANDARD_NO_PAD,
                base64::engine::general_purpose::URL_SAFE,
                base64::engine::general_purpose::URL_SAFE_NO_PAD,
            ];
            engines.iter().find_map(|engine| {
                let decoded = String::from_utf8(engine.decode(rest).ok()?).ok()?;
                match decoded.split_once(':') {
                    Some((_, password)) => Some(password.to_string()),
                    None if !decoded.is_empty() => Some(decoded),
                    None => None,
                }
            })
        }
        _ => None,
    }
}

#[utoipa::path(
    get,
    path = "/api/v1/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

#[utoipa::path(
    get,
    path = "/api/v1/tools",
    params(("user_id" = Option<String>, Query, description = "Apply this user's preferences")),
    responses((status = 200, body = ToolListResponse)),
    tag = "tools"
)]
async fn list_tools(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ToolsQuery>,
) -> Json<ToolListResponse> {
    let registry = state.tasks.tools();
    let tools = match query.user_id.as_deref() {
        Some(user_id) => registry.get_tools_for_user(user_id).await,
        None => registry.get_tools(),
    };
    Json(ToolListResponse { tools })
}

#[utoipa::path(
    put,
    path = "/api/v1/users/{user_id}/tools/{tool_type}/{tool_id}",
    request_body = ToolPreferenceRequest,
    params(
        ("user_id" = String, Path, description = "User id"),
        ("tool_type" = String, Path, description = "native, mcp, a2a or skill"),
        ("tool_id" = String, Path, description = "Tool name, MCP server, A2A agent id or skill name")
    ),
    responses(
        (status = 200, body = ToolPreferenceResponse),
        (status = 400, body = ProblemDetails)
    ),
    tag = "tools"
)]
async fn set_tool_preference(
    State(state): State<Arc<AppState>>,
    Path((user_id, tool_type, tool_id)): Path<(String, String, String)>,
    Json(request): Json<ToolPreferenceRequest>,
) -> Result<Json<ToolPreferenceResponse>, ApiError> {
    let kind: ToolKind = tool_type
        .parse()
        .map_err(|message| AgentboxError::InvalidRequest { message })?;
    let registry = state.tasks.tools();
    if !registry.has_source(kind, &tool_id) {
        return Err(AgentboxError::InvalidRequest {
            message: format!("unknown {kind} tool: {tool_id}"),
        }
        .into());
    }
    registry
        .preferences()
        .set(&user_id, kind, &tool_id, request.enabled)
        .await;
    Ok(Json(ToolPreferenceResponse {
        user_id,
        tool_type: kind,
        tool_id,
        enabled: request.enabled,
    }))
}

#[utoipa::path(
    post,
    path = "/api/v1/tasks",
    request_body = CreateTaskRequest,
    responses(
        (status = 200, body = TaskInfo),
        (status = 400, body = ProblemDetails)
    ),
    tag = "tasks"
)]
async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateTaskRequest>,
) -> Result<Json<TaskInfo>, ApiError> {
    if request.user_id.trim().is_empty() {
        return Err(AgentboxError::InvalidRequest {
            message: "userId is required".to_string(),
        }
        .into());
    }
    let task = state.tasks.create_task(&request.user_id).await;
    Ok(Json(task))
}

#[utoipa::path(
    get,
    path = "/api/v1/tasks",
    responses((status = 200, body = TaskListResponse)),
    tag = "tasks"
)]
async fn list_tasks(State(state): State<Arc<AppState>>) -> Json<TaskListResponse> {
    Json(TaskListResponse {
        tasks: state.tasks.list_tasks().await,
    })
}

#[utoipa::path(
    get,
    path = "/api/v1/tasks/{task_id}",
    params(("task_id" = String, Path, description = "Task id")),
    responses(
        (status = 200, body = TaskInfo),
        (status = 404, body = ProblemDetails)
    ),
    tag = "tasks"
)]
async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskInfo>, ApiError> {
    Ok(Json(state.tasks.get_task(&task_id).await?))
}

#[utoipa::path(
    post,
    path = "/api/v1/tasks/{task_id}/messages",
    request_body = MessageRequest,
    params(("task_id" = String, Path, description = "Task id")),
    responses(
        (status = 200, body = MessageAcceptedResponse),
        (status = 404, body = ProblemDetails),
        (status = 409, body = ProblemDetails)
    ),
    tag = "tasks"
)]
async fn post_message(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    Json(request): Json<MessageRequest>,
) -> Result<Json<MessageAcceptedResponse>, ApiError> {
    let id = state
        .tasks
        .post_message(&task_id, &request.message, request.attachments)
        .await?;
    Ok(Json(MessageAcceptedResponse {
        event_id: id.to_string(),
    }))
}

#[utoipa::path(
    post,
    path = "/api/v1/tasks/{task_id}/stop",
    params(("task_id" = String, Path, description = "Task id")),
    responses(
        (status = 204, description = "Stop requested"),
        (status = 404, body = ProblemDetails),
        (status = 409, body = ProblemDetails)
    ),
    tag = "tasks"
)]
async fn stop_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.tasks.stop_task(&task_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    delete,
    path = "/api/v1/tasks/{task_id}",
    params(("task_id" = String, Path, description = "Task id")),
    responses(
        (status = 204, description = "Task and its events removed"),
        (status = 404, body = ProblemDetails),
        (status = 409, body = ProblemDetails)
    ),
    tag = "tasks"
)]
async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.tasks.remove_task(&task_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn parse_after(after: Option<&str>) -> Result<Option<StreamId>, AgentboxError> {
    after
        .filter(|value| !value.is_empty())
        .map(|value| {
            value.parse::<StreamId>().map_err(|err| AgentboxError::InvalidRequest {
                message: err.to_string(),
            })
        })
        .transpose()
}

#[utoipa::path(
    get,
    path = "/api/v1/tasks/{task_id}/events",
    params(
        ("task_id" = String, Path, description = "Task id"),
        ("after" = Option<String>, Query, description = "Last seen event id (exclusive)"),
        ("limit" = Option<usize>, Query, description = "Maximum number of events")
    ),
    responses(
        (status = 200, body = EventsResponse),
        (status = 400, body = ProblemDetails),
        (status = 404, body = ProblemDetails)
    ),
    tag = "tasks"
)]
async fn get_events(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<EventsResponse>, ApiError> {
    let after = parse_after(query.after.as_deref())?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_EVENTS_LIMIT)
        .clamp(1, MAX_EVENTS_LIMIT);
    let events = state.tasks.events(&task_id, after, limit).await?;
    let has_more = events.len() == limit;
    Ok(Json(EventsResponse { events, has_more }))
}

#[utoipa::path(
    get,
    path = "/api/v1/tasks/{task_id}/events/sse",
    params(
        ("task_id" = String, Path, description = "Task id"),
        ("after" = Option<String>, Query, description = "Last seen event id (exclusive)")
    ),
    responses((status = 200, description = "SSE event stream")),
    tag = "tasks"
)]
async fn get_events_sse(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let after = parse_after(query.after.as_deref())?;
    state.tasks.get_task(&task_id).await?;
    let tasks = state.tasks.clone();

    // Ends after a `done` event or once the output stream is gone.
    let stream = futures::stream::unfold(Some(after), move |cursor| {
        let tasks = tasks.clone();
        let task_id = task_id.clone();
        async move {
            let after = cursor?;
            match tasks.next_event(&task_id, after).await {
                Ok((id, event)) => {
                    let next = if matches!(event, AgentEvent::Done(_)) {
                        None
                    } else {
                        Some(Some(id))
                    };
                    Some((Ok::<Event, Infallible>(to_sse_event(&id, &event)), next))
                }
                Err(err) => {
                    tracing::debug!(task_id = %task_id, error = %err, "sse stream ended");
                    None
                }
            }
        }
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn to_sse_event(id: &StreamId, event: &AgentEvent) -> Event {
    Event::default()
        .id(id.to_string())
        .event(event.kind())
        .json_data(event)
        .unwrap_or_else(|_| Event::default().data("{}"))
}
