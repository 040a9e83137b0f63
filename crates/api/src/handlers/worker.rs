//! Worker protocol: claim, start, steps, logs, heartbeat, completion.

use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use db::models::{ExitReason, LogLevel, LogLineRow, RunRow, StepRow};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::{ApiError, AppState};

/// Upper bound for long-polling claims.
const MAX_CLAIM_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct ClaimDto {
    pub worker_id: String,
    /// Long-poll for up to this many milliseconds when nothing is admissible.
    #[serde(default)]
    pub wait_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ClaimRunDto {
    pub worker_id: String,
}

#[derive(Debug, Deserialize)]
pub struct StartStepDto {
    pub job_id: Uuid,
    pub input_dataclip_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct CompleteStepDto {
    #[serde(default)]
    pub output: Option<Value>,
    pub exit_reason: ExitReason,
    #[serde(default)]
    pub error_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AppendLogDto {
    #[serde(default)]
    pub step_id: Option<Uuid>,
    #[serde(default)]
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct CompleteRunDto {
    pub exit_reason: ExitReason,
    #[serde(default)]
    pub error_type: Option<String>,
}

fn validate_worker_id(worker_id: &str) -> Result<(), ApiError> {
    if worker_id.trim().is_empty() {
        return Err(ApiError::bad_request("worker_id must not be empty"));
    }
    Ok(())
}

/// Claim the next admissible Run; `204 No Content` when there is none.
pub async fn claim_next(
    State(state): State<AppState>,
    Json(payload): Json<ClaimDto>,
) -> Result<Response, ApiError> {
    validate_worker_id(&payload.worker_id)?;
    let claimed = match payload.wait_ms {
        Some(ms) if ms > 0 => {
            let wait = Duration::from_millis(ms).min(MAX_CLAIM_WAIT);
            state.engine.claim_wait(&payload.worker_id, wait).await?
        }
        _ => state.engine.claim(&payload.worker_id).await?,
    };
    Ok(match claimed {
        Some(run) => Json(run).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

pub async fn claim_run(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(payload): Json<ClaimRunDto>,
) -> Result<Json<RunRow>, ApiError> {
    validate_worker_id(&payload.worker_id)?;
    Ok(Json(state.engine.claim_run(id, &payload.worker_id).await?))
}

pub async fn start_run(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<RunRow>, ApiError> {
    Ok(Json(state.engine.start_run(id).await?))
}

pub async fn start_step(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(payload): Json<StartStepDto>,
) -> Result<(StatusCode, Json<StepRow>), ApiError> {
    let step = state
        .engine
        .start_step(id, payload.job_id, payload.input_dataclip_id)
        .await?;
    Ok((StatusCode::CREATED, Json(step)))
}

pub async fn complete_step(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(payload): Json<CompleteStepDto>,
) -> Result<Json<StepRow>, ApiError> {
    let step = state
        .engine
        .complete_step(id, payload.output, payload.exit_reason, payload.error_type)
        .await?;
    Ok(Json(step))
}

pub async fn append_log(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(payload): Json<AppendLogDto>,
) -> Result<(StatusCode, Json<LogLineRow>), ApiError> {
    let line = state
        .engine
        .append_log(
            id,
            payload.step_id,
            payload.level,
            payload.message,
            payload.timestamp.unwrap_or_else(Utc::now),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(line)))
}

pub async fn heartbeat(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<StatusCode, ApiError> {
    state.engine.heartbeat(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn complete_run(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(payload): Json<CompleteRunDto>,
) -> Result<Json<RunRow>, ApiError> {
    let run = state
        .engine
        .complete_run(id, payload.exit_reason, payload.error_type)
        .await?;
    Ok(Json(run))
}
