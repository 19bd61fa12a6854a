//! HTTP surface over the dispatcher.
//!
//! Authentication happens upstream; the gateway forwards the caller's
//! identity in `x-user-id` and the session nonce in `x-session-nonce`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, rejection::PathRejection, FromRequestParts, Path, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::dispatch::{Dispatcher, ExecutionId, RunRequest, RunScriptBody};
use crate::error::RelayError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const NONCE_HEADER: &str = "x-session-nonce";

#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Arc<Dispatcher>,
}

/// Authenticated caller, as forwarded by the gateway.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: u64,
    pub nonce: String,
}

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|id| *id != 0)
            .ok_or_else(|| ApiError::Unauthorized("missing or invalid user id".to_string()))?;

        let nonce = parts
            .headers
            .get(NONCE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError::Unauthorized("missing session nonce".to_string()))?;

        Ok(Caller { user_id, nonce })
    }
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized(String),
    BadRequest(String),
    Relay(RelayError),
}

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        ApiError::Relay(e)
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Relay(e) => {
                let status = match &e {
                    RelayError::Validation(_) => StatusCode::BAD_REQUEST,
                    RelayError::NotFound { .. } => StatusCode::NOT_FOUND,
                    RelayError::NoWorkersAvailable => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status == StatusCode::INTERNAL_SERVER_ERROR {
                    tracing::error!(error = %e, "Request failed");
                }
                (status, e.to_string())
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

#[derive(Serialize)]
struct RunScriptResponse {
    execution_id: ExecutionId,
    message: String,
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health_handler))
        .route("/api/v1/execute/script", post(run_script_handler))
        .route("/api/v1/executions/{id}", get(execution_handler))
        .route("/api/v1/workers", get(workers_handler))
        .route("/api/v1/workers/refresh", post(refresh_workers_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the API until `token` is cancelled.
pub async fn run_server(
    addr: SocketAddr,
    state: ApiState,
    token: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Starting API server");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;

    tracing::info!("API server stopped");
    Ok(())
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn run_script_handler(
    State(state): State<ApiState>,
    caller: Caller,
    payload: Result<Json<RunScriptBody>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(body) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let request = RunRequest::new(body, caller.user_id, caller.nonce);

    let execution_id = state.dispatcher.run(request).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(RunScriptResponse {
            execution_id,
            message: "Script dispatched".to_string(),
        }),
    ))
}

async fn execution_handler(
    State(state): State<ApiState>,
    caller: Caller,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Path(id) = id.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let record = state.dispatcher.execution(&id, caller.user_id).await?;
    Ok(Json(record))
}

async fn workers_handler(State(state): State<ApiState>, _caller: Caller) -> impl IntoResponse {
    Json(state.dispatcher.registry().cache_info())
}

async fn refresh_workers_handler(
    State(state): State<ApiState>,
    _caller: Caller,
) -> Result<impl IntoResponse, ApiError> {
    let registry = state.dispatcher.registry();
    let workers = registry.refresh().await.map_err(RelayError::from)?;
    tracing::info!(count = workers.len(), "Workers refreshed on request");
    Ok(Json(registry.cache_info()))
}
