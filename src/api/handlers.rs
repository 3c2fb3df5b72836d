//! REST handlers. Every request is served by the active runtime.

use super::error::{ApiError, ApiResult};
use super::types::{
    CreateSessionRequest, HealthResponse, ListQuery, OutputQuery, OutputResponse, PromptRequest,
    StopQuery, DEFAULT_OUTPUT_LINES,
};
use super::ws::spawn_pump;
use super::AppState;
use crate::runtime::{AgentSession, AgentStatus};
use axum::{
    Json,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::StatusCode,
};
use std::sync::Arc;
use tracing::{info, warn};

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|e| ApiError::bad_request(e.body_text()))
}

fn query<T>(params: Result<Query<T>, QueryRejection>) -> ApiResult<T> {
    params
        .map(|Query(value)| value)
        .map_err(|e| ApiError::bad_request(e.body_text()))
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        runtime: state.registry.active_name(),
    })
}

/// POST /sessions
pub async fn create_session(
    State(state): State<AppState>,
    payload: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<AgentSession>)> {
    let mut opts = body(payload)?.into_options()?;
    let runtime = state.registry.active()?;

    // Streaming runtimes get their first prompt only once the pump listens
    let deferred_prompt = if runtime.capabilities().streaming {
        opts.initial_prompt.take()
    } else {
        None
    };

    let session = runtime.start(opts).await?;
    info!(session = %session.session_id, runtime = runtime.name(), "Session created");

    match runtime.stream_responses(&session.session_id).await {
        Ok(stream) => {
            spawn_pump(Arc::clone(&state.hub), session.session_id.clone(), stream);
        }
        Err(e) => warn!(session = %session.session_id, error = %e, "No response stream for session"),
    }

    // The session exists either way, so a failed first prompt is not a failed create
    if let Some(prompt) = deferred_prompt {
        if let Err(e) = runtime.send_prompt(&session.session_id, &prompt).await {
            warn!(session = %session.session_id, error = %e, "Failed to deliver initial prompt");
        }
    }

    Ok((StatusCode::CREATED, Json(session)))
}

/// GET /sessions
pub async fn list_sessions(
    State(state): State<AppState>,
    params: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<AgentSession>>> {
    let filter = query(params)?.into_filter()?;
    let runtime = state.registry.active()?;
    Ok(Json(runtime.list_sessions(&filter).await?))
}

/// GET /sessions/{id}
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<AgentStatus>> {
    let runtime = state.registry.active()?;
    Ok(Json(runtime.get_status(&session_id).await?))
}

/// DELETE /sessions/{id}
pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    params: Result<Query<StopQuery>, QueryRejection>,
) -> ApiResult<StatusCode> {
    let StopQuery { force } = query(params)?;
    let runtime = state.registry.active()?;
    runtime.stop(&session_id, force).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /sessions/{id}/prompt
pub async fn send_prompt(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    payload: Result<Json<PromptRequest>, JsonRejection>,
) -> ApiResult<StatusCode> {
    let PromptRequest { prompt } = body(payload)?;
    if prompt.is_empty() {
        return Err(ApiError::bad_request("prompt is required"));
    }
    let runtime = state.registry.active()?;
    runtime.send_prompt(&session_id, &prompt).await?;
    Ok(StatusCode::ACCEPTED)
}

/// GET /sessions/{id}/output
pub async fn capture_output(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    params: Result<Query<OutputQuery>, QueryRejection>,
) -> ApiResult<Json<OutputResponse>> {
    let lines = query(params)?.lines.unwrap_or(DEFAULT_OUTPUT_LINES);
    let runtime = state.registry.active()?;
    let output = runtime.capture_output(&session_id, lines).await?;
    Ok(Json(OutputResponse { output }))
}
