//! UI-facing Run projections and actions.

use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use db::models::{LogLineRow, RunRow};
use engine::{Enqueued, RerunEligibility, RunDetail};
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;
use uuid::Uuid;

use crate::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    pub step_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct RerunDto {
    pub job_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct EligibilityQuery {
    pub job_id: Uuid,
    #[serde(default)]
    pub can_edit_retention: bool,
}

pub async fn get_run(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<RunDetail>, ApiError> {
    Ok(Json(state.engine.get_run_detail(id).await?))
}

pub async fn list_logs(
    Path(id): Path<Uuid>,
    Query(query): Query<LogQuery>,
    State(state): State<AppState>,
) -> Result<Json<Vec<LogLineRow>>, ApiError> {
    Ok(Json(state.engine.list_logs(id, query.step_id).await?))
}

fn log_event(line: &LogLineRow) -> Event {
    Event::default()
        .event("log")
        .id(line.sequence.to_string())
        .json_data(line)
        .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()))
}

/// Server-sent events: stored lines first, then each new line as it is
/// appended. The stream ends when the Run finishes.
pub async fn stream_logs(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let run = state.engine.get_run(id).await?;
    if run.state.is_terminal() {
        state.engine.logs().close(id);
    }
    // Subscribe before reading the backlog so no line falls in between.
    let rx = state.engine.logs().subscribe(id);
    let backlog = state.engine.list_logs(id, None).await?;
    let last_seen = backlog.last().map_or(0, |l| l.sequence);

    let live = stream::unfold(rx, move |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(line) => return Some((line, rx)),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(run_id = %id, skipped, "log subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .filter(move |line| futures::future::ready(line.sequence > last_seen));

    let events = stream::iter(backlog)
        .chain(live)
        .map(|line| Ok(log_event(&line)));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

pub async fn kill(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<RunRow>, ApiError> {
    Ok(Json(state.engine.kill(id).await?))
}

pub async fn rerun(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(payload): Json<RerunDto>,
) -> Result<(StatusCode, Json<Enqueued>), ApiError> {
    let enqueued = state.engine.rerun(id, payload.job_id).await?;
    Ok((StatusCode::CREATED, Json(enqueued)))
}

pub async fn rerun_eligibility(
    Path(id): Path<Uuid>,
    Query(query): Query<EligibilityQuery>,
    State(state): State<AppState>,
) -> Result<Json<RerunEligibility>, ApiError> {
    let eligibility = state
        .engine
        .rerun_eligibility(id, query.job_id, query.can_edit_retention)
        .await?;
    Ok(Json(eligibility))
}
