//! Dataclip lifecycle, used by ingress tooling and the retention job.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use db::models::{DataclipKind, DataclipRow};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct SaveDataclipDto {
    pub kind: DataclipKind,
    pub body: Value,
}

pub async fn save(
    State(state): State<AppState>,
    Json(payload): Json<SaveDataclipDto>,
) -> Result<(StatusCode, Json<DataclipRow>), ApiError> {
    let clip = state.engine.save_dataclip(payload.kind, payload.body).await?;
    Ok((StatusCode::CREATED, Json(clip)))
}

pub async fn get(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<DataclipRow>, ApiError> {
    Ok(Json(state.engine.get_dataclip(id).await?))
}

pub async fn wipe(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<DataclipRow>, ApiError> {
    Ok(Json(state.engine.wipe_dataclip(id).await?))
}
