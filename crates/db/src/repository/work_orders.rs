//! Work order persistence.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::{parse_text, runs};
use crate::{
    models::{derive_work_order_state, NewRun, RunRow, WorkOrderRow},
    DbError,
};

const COLUMNS: &str =
    "id, workflow_id, snapshot_id, trigger_id, dataclip_id, state, last_activity, inserted_at";

#[derive(Debug, FromRow)]
struct WorkOrderRecord {
    id: Uuid,
    workflow_id: Uuid,
    snapshot_id: Uuid,
    trigger_id: Option<Uuid>,
    dataclip_id: Uuid,
    state: String,
    last_activity: DateTime<Utc>,
    inserted_at: DateTime<Utc>,
}

impl TryFrom<WorkOrderRecord> for WorkOrderRow {
    type Error = DbError;

    fn try_from(r: WorkOrderRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            id: r.id,
            workflow_id: r.workflow_id,
            snapshot_id: r.snapshot_id,
            trigger_id: r.trigger_id,
            dataclip_id: r.dataclip_id,
            state: parse_text("work_orders", &r.state)?,
            last_activity: r.last_activity,
            inserted_at: r.inserted_at,
        })
    }
}

/// Insert a work order and its first run in one transaction.
pub async fn insert_work_order(
    pool: &PgPool,
    work_order: &WorkOrderRow,
    first_run: &NewRun,
) -> Result<(WorkOrderRow, RunRow), DbError> {
    let mut tx = pool.begin().await?;

    let sql = format!(
        "INSERT INTO work_orders ({COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING {COLUMNS}"
    );
    let stored: WorkOrderRow = sqlx::query_as::<_, WorkOrderRecord>(&sql)
        .bind(work_order.id)
        .bind(work_order.workflow_id)
        .bind(work_order.snapshot_id)
        .bind(work_order.trigger_id)
        .bind(work_order.dataclip_id)
        .bind(work_order.state.as_str())
        .bind(work_order.last_activity)
        .bind(work_order.inserted_at)
        .fetch_one(&mut *tx)
        .await?
        .try_into()?;

    let run = runs::insert_run_in(&mut tx, first_run).await?;

    tx.commit().await?;
    Ok((stored, run))
}

pub async fn get_work_order(pool: &PgPool, id: Uuid) -> Result<WorkOrderRow, DbError> {
    let sql = format!("SELECT {COLUMNS} FROM work_orders WHERE id = $1");
    sqlx::query_as::<_, WorkOrderRecord>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::not_found("work_orders", id))?
        .try_into()
}

/// Re-derive and store the work order's state. The row lock serialises
/// concurrent refreshes, so each one reads the runs as committed by every
/// refresh before it.
pub async fn refresh_work_order_state(
    pool: &PgPool,
    id: Uuid,
    at: DateTime<Utc>,
) -> Result<WorkOrderRow, DbError> {
    let mut tx = pool.begin().await?;

    let locked: Option<(Uuid,)> =
        sqlx::query_as("SELECT id FROM work_orders WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
    if locked.is_none() {
        return Err(DbError::not_found("work_orders", id));
    }

    let state = derive_work_order_state(&runs::list_runs_for_work_order(&mut *tx, id).await?);
    let sql = format!(
        "UPDATE work_orders SET state = $2, last_activity = $3 WHERE id = $1 RETURNING {COLUMNS}"
    );
    let row: WorkOrderRow = sqlx::query_as::<_, WorkOrderRecord>(&sql)
        .bind(id)
        .bind(state.as_str())
        .bind(at)
        .fetch_one(&mut *tx)
        .await?
        .try_into()?;

    tx.commit().await?;
    Ok(row)
}
