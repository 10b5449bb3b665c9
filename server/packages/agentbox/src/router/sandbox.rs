//! HTTP surface served inside the sandbox: liveness plus the timeout
//! supervisor's management endpoints. Every request passes through
//! [`auto_extend`] first.

use std::sync::Arc;

use agentbox_error::{AgentboxError, ErrorType, ProblemDetails};
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utoipa::{Modify, OpenApi, ToSchema};

use super::{with_http_logging, ApiError, HealthResponse};
use crate::supervisor::{TimeoutStatus, TimeoutSupervisor, TimerPhase, MAX_TIMEOUT_MINUTES};

pub const API_PREFIX: &str = "/api/v1";

/// Management endpoints that must never extend the timer themselves.
pub const SUPERVISOR_PATHS: [&str; 4] = [
    "/api/v1/supervisor/activate-timeout",
    "/api/v1/supervisor/extend-timeout",
    "/api/v1/supervisor/cancel-timeout",
    "/api/v1/supervisor/timeout-status",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minutes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PingResponse {
    pub message: String,
}

pub fn build_sandbox_router(supervisor: Arc<TimeoutSupervisor>) -> Router {
    let api = Router::new()
        .route("/ping", get(ping))
        .route("/supervisor/activate-timeout", post(activate_timeout))
        .route("/supervisor/extend-timeout", post(extend_timeout))
        .route("/supervisor/cancel-timeout", post(cancel_timeout))
        .route("/supervisor/timeout-status", get(timeout_status));

    let router = Router::new()
        .route("/health", get(health))
        .nest(API_PREFIX, api)
        .fallback(not_found)
        .layer(axum::middleware::from_fn_with_state(
            supervisor.clone(),
            auto_extend,
        ))
        .with_state(supervisor);

    with_http_logging(router)
}

pub fn should_auto_extend(path: &str) -> bool {
    let under_prefix = path == API_PREFIX
        || path
            .strip_prefix(API_PREFIX)
            .is_some_and(|rest| rest.starts_with('/'));
    under_prefix && !SUPERVISOR_PATHS.contains(&path.trim_end_matches('/'))
}

/// Nudges an armed timer forward before passing the request on. Failures are
/// logged and never affect the request.
pub async fn auto_extend(
    State(supervisor): State<Arc<TimeoutSupervisor>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let config = supervisor.config();
    if config.expand_enabled
        && should_auto_extend(req.uri().path())
        && supervisor.is_armed().await
    {
        match supervisor.extend(Some(config.auto_extend_minutes)).await {
            Ok(status) => tracing::debug!(
                path = %req.uri().path(),
                remaining_seconds = status.remaining_seconds,
                "auto-extended sandbox timeout"
            ),
            Err(err) => tracing::warn!(
                path = %req.uri().path(),
                error = %err,
                "auto-extend failed"
            ),
        }
    }
    next.run(req).await
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        ping,
        activate_timeout,
        extend_timeout,
        cancel_timeout,
        timeout_status
    ),
    components(
        schemas(
            HealthResponse,
            PingResponse,
            TimeoutRequest,
            TimeoutStatus,
            TimerPhase,
            ProblemDetails,
            ErrorType
        )
    ),
    tags(
        (name = "meta", description = "Sandbox liveness"),
        (name = "supervisor", description = "Inactivity timeout management")
    ),
    modifiers(&SandboxAddon)
)]
pub struct SandboxApiDoc;

struct SandboxAddon;

impl Modify for SandboxAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new("http://localhost:8330")]);
    }
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

#[utoipa::path(
    get,
    path = "/api/v1/ping",
    responses((status = 200, body = PingResponse)),
    tag = "meta"
)]
async fn ping() -> Json<PingResponse> {
    Json(PingResponse {
        message: "pong".to_string(),
    })
}

fn validate_minutes(request: &TimeoutRequest) -> Result<(), ApiError> {
    let message = match request.minutes {
        Some(0) => "minutes must be at least 1".to_string(),
        Some(value) if value > MAX_TIMEOUT_MINUTES => {
            format!("minutes must be at most {MAX_TIMEOUT_MINUTES}")
        }
        _ => return Ok(()),
    };
    Err(AgentboxError::InvalidRequest { message }.into())
}

#[utoipa::path(
    post,
    path = "/api/v1/supervisor/activate-timeout",
    request_body = TimeoutRequest,
    responses(
        (status = 200, body = TimeoutStatus),
        (status = 400, body = ProblemDetails)
    ),
    tag = "supervisor"
)]
async fn activate_timeout(
    State(supervisor): State<Arc<TimeoutSupervisor>>,
    body: Option<Json<TimeoutRequest>>,
) -> Result<Json<TimeoutStatus>, ApiError> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    validate_minutes(&request)?;
    Ok(Json(supervisor.activate(request.minutes).await))
}

#[utoipa::path(
    post,
    path = "/api/v1/supervisor/extend-timeout",
    request_body = TimeoutRequest,
    responses(
        (status = 200, body = TimeoutStatus),
        (status = 400, body = ProblemDetails),
        (status = 409, body = ProblemDetails)
    ),
    tag = "supervisor"
)]
async fn extend_timeout(
    State(supervisor): State<Arc<TimeoutSupervisor>>,
    body: Option<Json<TimeoutRequest>>,
) -> Result<Json<TimeoutStatus>, ApiError> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    validate_minutes(&request)?;
    let status = supervisor
        .extend(request.minutes)
        .await
        .map_err(AgentboxError::from)?;
    Ok(Json(status))
}

#[utoipa::path(
    post,
    path = "/api/v1/supervisor/cancel-timeout",
    responses((status = 200, body = TimeoutStatus)),
    tag = "supervisor"
)]
async fn cancel_timeout(State(supervisor): State<Arc<TimeoutSupervisor>>) -> Json<TimeoutStatus> {
    Json(supervisor.cancel().await)
}

#[utoipa::path(
    get,
    path = "/api/v1/supervisor/timeout-status",
    responses((status = 200, body = TimeoutStatus)),
    tag = "supervisor"
)]
async fn timeout_status(State(supervisor): State<Arc<TimeoutSupervisor>>) -> Json<TimeoutStatus> {
    Json(supervisor.status().await)
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "404 Not Found")
}
