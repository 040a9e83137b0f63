//! Step persistence and the `run_steps` display association.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::parse_opt_text;
use crate::{
    models::StepRow,
    store::{FinishOutcome, StepCompletion},
    DbError,
};

const COLUMNS: &str = "id, run_id, job_id, snapshot_id, input_dataclip_id, output_dataclip_id, \
     exit_reason, error_type, started_at, finished_at";

#[derive(Debug, FromRow)]
struct StepRecord {
    id: Uuid,
    run_id: Uuid,
    job_id: Uuid,
    snapshot_id: Uuid,
    input_dataclip_id: Uuid,
    output_dataclip_id: Option<Uuid>,
    exit_reason: Option<String>,
    error_type: Option<String>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<StepRecord> for StepRow {
    type Error = DbError;

    fn try_from(r: StepRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            id: r.id,
            run_id: r.run_id,
            job_id: r.job_id,
            snapshot_id: r.snapshot_id,
            input_dataclip_id: r.input_dataclip_id,
            output_dataclip_id: r.output_dataclip_id,
            exit_reason: parse_opt_text("steps", r.exit_reason.as_deref())?,
            error_type: r.error_type,
            started_at: r.started_at,
            finished_at: r.finished_at,
        })
    }
}

/// Insert a step and display it under the run that executes it.
pub async fn insert_step(pool: &PgPool, step: &StepRow) -> Result<StepRow, DbError> {
    let mut tx = pool.begin().await?;

    let sql = format!(
        "INSERT INTO steps ({COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
         RETURNING {COLUMNS}"
    );
    let row: StepRow = sqlx::query_as::<_, StepRecord>(&sql)
        .bind(step.id)
        .bind(step.run_id)
        .bind(step.job_id)
        .bind(step.snapshot_id)
        .bind(step.input_dataclip_id)
        .bind(step.output_dataclip_id)
        .bind(step.exit_reason.map(|r| r.as_str()))
        .bind(&step.error_type)
        .bind(step.started_at)
        .bind(step.finished_at)
        .fetch_one(&mut *tx)
        .await?
        .try_into()?;

    sqlx::query("INSERT INTO run_steps (run_id, step_id) VALUES ($1, $2)")
        .bind(row.run_id)
        .bind(row.id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(row)
}

pub async fn get_step(pool: &PgPool, id: Uuid) -> Result<StepRow, DbError> {
    let sql = format!("SELECT {COLUMNS} FROM steps WHERE id = $1");
    sqlx::query_as::<_, StepRecord>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::not_found("steps", id))?
        .try_into()
}

/// Close a step if it is still open (`finished_at IS NULL`).
pub async fn finish_step(
    pool: &PgPool,
    id: Uuid,
    completion: &StepCompletion,
) -> Result<FinishOutcome, DbError> {
    let sql = format!(
        r#"
        UPDATE steps
        SET output_dataclip_id = $2, exit_reason = $3, error_type = $4, finished_at = $5
        WHERE id = $1 AND finished_at IS NULL
        RETURNING {COLUMNS}
        "#
    );
    let updated = sqlx::query_as::<_, StepRecord>(&sql)
        .bind(id)
        .bind(completion.output_dataclip_id)
        .bind(completion.exit_reason.as_str())
        .bind(&completion.error_type)
        .bind(completion.at)
        .fetch_optional(pool)
        .await?;

    match updated {
        Some(record) => Ok(FinishOutcome::Finished(record.try_into()?)),
        None => Ok(FinishOutcome::AlreadyFinished(get_step(pool, id).await?)),
    }
}

/// Steps displayed under a run, executed there or cloned into it.
pub async fn list_run_steps(pool: &PgPool, run_id: Uuid) -> Result<Vec<StepRow>, DbError> {
    let columns = COLUMNS
        .split(", ")
        .map(|c| format!("s.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT {columns} FROM run_steps rs JOIN steps s ON s.id = rs.step_id \
         WHERE rs.run_id = $1 ORDER BY s.started_at, s.id"
    );
    sqlx::query_as::<_, StepRecord>(&sql)
        .bind(run_id)
        .fetch_all(pool)
        .await?
        .into_iter()
        .map(TryInto::try_into)
        .collect()
}
