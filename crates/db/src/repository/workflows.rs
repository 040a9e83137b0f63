//! Projects, workflows and graph snapshots.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::{from_opt_count, to_count, to_opt_count};
use crate::{
    models::{ProjectRow, SnapshotRow, WorkflowRow},
    DbError,
};

// ---------------------------------------------------------------------------
// projects
// ---------------------------------------------------------------------------

#[derive(Debug, FromRow)]
pub(crate) struct ProjectRecord {
    id: Uuid,
    concurrency: Option<i32>,
    running_count: i32,
}

impl TryFrom<ProjectRecord> for ProjectRow {
    type Error = DbError;

    fn try_from(r: ProjectRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            id: r.id,
            concurrency: to_opt_count("projects", r.concurrency)?,
            running_count: to_count("projects", r.running_count)?,
        })
    }
}

/// Insert or update a project. The running counter is never overwritten.
pub async fn upsert_project(pool: &PgPool, project: &ProjectRow) -> Result<ProjectRow, DbError> {
    let row = sqlx::query_as::<_, ProjectRecord>(
        r#"
        INSERT INTO projects (id, concurrency, running_count)
        VALUES ($1, $2, 0)
        ON CONFLICT (id) DO UPDATE SET concurrency = EXCLUDED.concurrency
        RETURNING id, concurrency, running_count
        "#,
    )
    .bind(project.id)
    .bind(from_opt_count(project.concurrency))
    .fetch_one(pool)
    .await?;

    row.try_into()
}

pub async fn get_project(pool: &PgPool, id: Uuid) -> Result<ProjectRow, DbError> {
    sqlx::query_as::<_, ProjectRecord>(
        "SELECT id, concurrency, running_count FROM projects WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::not_found("projects", id))?
    .try_into()
}

// ---------------------------------------------------------------------------
// workflows
// ---------------------------------------------------------------------------

pub(crate) const WORKFLOW_COLUMNS: &str =
    "id, project_id, name, lock_version, concurrency, running_count";

#[derive(Debug, FromRow)]
pub(crate) struct WorkflowRecord {
    id: Uuid,
    project_id: Option<Uuid>,
    name: String,
    lock_version: i64,
    concurrency: Option<i32>,
    running_count: i32,
}

impl TryFrom<WorkflowRecord> for WorkflowRow {
    type Error = DbError;

    fn try_from(r: WorkflowRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            id: r.id,
            project_id: r.project_id,
            name: r.name,
            lock_version: r.lock_version,
            concurrency: to_opt_count("workflows", r.concurrency)?,
            running_count: to_count("workflows", r.running_count)?,
        })
    }
}

/// Insert or update the engine-visible fields of a workflow.
pub async fn upsert_workflow(
    pool: &PgPool,
    workflow: &WorkflowRow,
) -> Result<WorkflowRow, DbError> {
    let sql = format!(
        r#"
        INSERT INTO workflows (id, project_id, name, lock_version, concurrency, running_count)
        VALUES ($1, $2, $3, $4, $5, 0)
        ON CONFLICT (id) DO UPDATE SET
            project_id = EXCLUDED.project_id,
            name = EXCLUDED.name,
            lock_version = EXCLUDED.lock_version,
            concurrency = EXCLUDED.concurrency
        RETURNING {WORKFLOW_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, WorkflowRecord>(&sql)
        .bind(workflow.id)
        .bind(workflow.project_id)
        .bind(&workflow.name)
        .bind(workflow.lock_version)
        .bind(from_opt_count(workflow.concurrency))
        .fetch_one(pool)
        .await?;

    row.try_into()
}

pub async fn get_workflow(pool: &PgPool, id: Uuid) -> Result<WorkflowRow, DbError> {
    let sql = format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = $1");
    sqlx::query_as::<_, WorkflowRecord>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::not_found("workflows", id))?
        .try_into()
}

// ---------------------------------------------------------------------------
// graph_snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, FromRow)]
struct SnapshotRecord {
    id: Uuid,
    workflow_id: Uuid,
    lock_version: i64,
    definition: Value,
    inserted_at: DateTime<Utc>,
}

impl From<SnapshotRecord> for SnapshotRow {
    fn from(r: SnapshotRecord) -> Self {
        Self {
            id: r.id,
            workflow_id: r.workflow_id,
            lock_version: r.lock_version,
            definition: r.definition,
            inserted_at: r.inserted_at,
        }
    }
}

/// Insert a snapshot once per `(workflow_id, lock_version)`; a second
/// insert for the same version returns the row that is already stored.
pub async fn insert_snapshot(
    pool: &PgPool,
    snapshot: &SnapshotRow,
) -> Result<SnapshotRow, DbError> {
    sqlx::query(
        r#"
        INSERT INTO graph_snapshots (id, workflow_id, lock_version, definition, inserted_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (workflow_id, lock_version) DO NOTHING
        "#,
    )
    .bind(snapshot.id)
    .bind(snapshot.workflow_id)
    .bind(snapshot.lock_version)
    .bind(&snapshot.definition)
    .bind(snapshot.inserted_at)
    .execute(pool)
    .await?;

    find_snapshot(pool, snapshot.workflow_id, snapshot.lock_version)
        .await?
        .ok_or(DbError::not_found("graph_snapshots", snapshot.id))
}

pub async fn get_snapshot(pool: &PgPool, id: Uuid) -> Result<SnapshotRow, DbError> {
    let row = sqlx::query_as::<_, SnapshotRecord>(
        r#"
        SELECT id, workflow_id, lock_version, definition, inserted_at
        FROM graph_snapshots WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::not_found("graph_snapshots", id))?;

    Ok(row.into())
}

pub async fn find_snapshot(
    pool: &PgPool,
    workflow_id: Uuid,
    lock_version: i64,
) -> Result<Option<SnapshotRow>, DbError> {
    let row = sqlx::query_as::<_, SnapshotRecord>(
        r#"
        SELECT id, workflow_id, lock_version, definition, inserted_at
        FROM graph_snapshots WHERE workflow_id = $1 AND lock_version = $2
        "#,
    )
    .bind(workflow_id)
    .bind(lock_version)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(Into::into))
}
