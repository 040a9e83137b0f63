use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use engine::{Enqueued, RunOrigin};
use serde_json::Value;
use uuid::Uuid;

use crate::{ApiError, AppState};

/// Trigger ingress: the request body becomes the work order's input.
pub async fn handle_trigger(
    Path((workflow_id, trigger_id)): Path<(Uuid, Uuid)>,
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<(StatusCode, Json<Enqueued>), ApiError> {
    let enqueued = state
        .engine
        .create_work_order(workflow_id, RunOrigin::Trigger { trigger_id }, payload)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(enqueued)))
}
