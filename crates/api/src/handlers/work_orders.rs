use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use engine::{BulkRerunSummary, Enqueued, WorkOrderDetail};
use serde::Deserialize;
use uuid::Uuid;

use crate::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct BulkRerunDto {
    pub work_order_ids: Vec<Uuid>,
    pub job_id: Uuid,
}

pub async fn get_work_order(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<WorkOrderDetail>, ApiError> {
    Ok(Json(state.engine.get_work_order_detail(id).await?))
}

/// New Run from the work order's original trigger or job.
pub async fn rerun_from_start(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<Enqueued>), ApiError> {
    let enqueued = state.engine.rerun_from_start(id).await?;
    Ok((StatusCode::CREATED, Json(enqueued)))
}

pub async fn bulk_rerun(
    State(state): State<AppState>,
    Json(payload): Json<BulkRerunDto>,
) -> Result<Json<BulkRerunSummary>, ApiError> {
    if payload.work_order_ids.is_empty() {
        return Err(ApiError::bad_request("work_order_ids must not be empty"));
    }
    let summary = state
        .engine
        .bulk_rerun(&payload.work_order_ids, payload.job_id)
        .await?;
    Ok(Json(summary))
}
