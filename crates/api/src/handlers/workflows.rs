//! Editor persistence: projects, workflows, snapshots, manual runs.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use db::models::{ProjectRow, WorkflowRow};
use engine::{ConcurrencySettings, Enqueued, GraphDefinition, GraphSnapshot, RunOrigin};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct ProjectDto {
    pub concurrency: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct WorkflowDto {
    pub project_id: Option<Uuid>,
    pub name: String,
    pub lock_version: i64,
    pub concurrency: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotDto {
    pub lock_version: i64,
    #[serde(flatten)]
    pub graph: GraphDefinition,
}

#[derive(Debug, Deserialize)]
pub struct ManualRunDto {
    pub job_id: Uuid,
    #[serde(default)]
    pub input: Value,
}

pub async fn upsert_project(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(payload): Json<ProjectDto>,
) -> Result<Json<ProjectRow>, ApiError> {
    let project = state
        .engine
        .upsert_project(ProjectRow {
            id,
            concurrency: payload.concurrency,
            running_count: 0,
        })
        .await?;
    Ok(Json(project))
}

pub async fn upsert_workflow(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(payload): Json<WorkflowDto>,
) -> Result<Json<WorkflowRow>, ApiError> {
    let workflow = state
        .engine
        .upsert_workflow(WorkflowRow {
            id,
            project_id: payload.project_id,
            name: payload.name,
            lock_version: payload.lock_version,
            concurrency: payload.concurrency,
            running_count: 0,
        })
        .await?;
    Ok(Json(workflow))
}

pub async fn get_workflow(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<WorkflowRow>, ApiError> {
    Ok(Json(state.engine.get_workflow(id).await?))
}

pub async fn concurrency(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<ConcurrencySettings>, ApiError> {
    Ok(Json(state.engine.admission().settings(id).await?))
}

pub async fn publish_snapshot(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(payload): Json<SnapshotDto>,
) -> Result<(StatusCode, Json<GraphSnapshot>), ApiError> {
    let snapshot = GraphSnapshot::new(id, payload.lock_version, payload.graph);
    let requested = snapshot.id;
    let stored = state.engine.publish_snapshot(snapshot).await?;
    let status = if stored.id == requested {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(stored)))
}

pub async fn get_snapshot(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<GraphSnapshot>, ApiError> {
    Ok(Json(state.engine.get_snapshot(id).await?))
}

pub async fn manual_run(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(payload): Json<ManualRunDto>,
) -> Result<(StatusCode, Json<Enqueued>), ApiError> {
    let enqueued = state
        .engine
        .create_work_order(id, RunOrigin::Manual { job_id: payload.job_id }, payload.input)
        .await?;
    Ok((StatusCode::CREATED, Json(enqueued)))
}
