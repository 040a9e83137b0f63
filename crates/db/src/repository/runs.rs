//! Run persistence: FIFO scans, claims and compare-and-swap transitions.
//!
//! Every state change locks the run row first and the workflow/project
//! rows second, so concurrent claimers and completers always take locks
//! in the same order.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgExecutor, PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{
    parse_opt_text, parse_text,
    workflows::{WorkflowRecord, WORKFLOW_COLUMNS},
};
use crate::{
    models::{has_capacity, NewRun, ProjectRow, RunRow, RunState, WorkflowRow},
    store::{ClaimOutcome, RunTransition, TransitionOutcome},
    DbError,
};

pub(crate) const COLUMNS: &str = "id, work_order_id, workflow_id, snapshot_id, starting_job_id, \
     starting_trigger_id, dataclip_id, state, worker_id, exit_reason, error_type, claimed_at, \
     started_at, finished_at, last_activity_at, inserted_at, position";

#[derive(Debug, FromRow)]
struct RunRecord {
    id: Uuid,
    work_order_id: Uuid,
    workflow_id: Uuid,
    snapshot_id: Uuid,
    starting_job_id: Option<Uuid>,
    starting_trigger_id: Option<Uuid>,
    dataclip_id: Uuid,
    state: String,
    worker_id: Option<String>,
    exit_reason: Option<String>,
    error_type: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    last_activity_at: DateTime<Utc>,
    inserted_at: DateTime<Utc>,
    position: i64,
}

impl TryFrom<RunRecord> for RunRow {
    type Error = DbError;

    fn try_from(r: RunRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            id: r.id,
            work_order_id: r.work_order_id,
            workflow_id: r.workflow_id,
            snapshot_id: r.snapshot_id,
            starting_job_id: r.starting_job_id,
            starting_trigger_id: r.starting_trigger_id,
            dataclip_id: r.dataclip_id,
            state: parse_text("runs", &r.state)?,
            worker_id: r.worker_id,
            exit_reason: parse_opt_text("runs", r.exit_reason.as_deref())?,
            error_type: r.error_type,
            claimed_at: r.claimed_at,
            started_at: r.started_at,
            finished_at: r.finished_at,
            last_activity_at: r.last_activity_at,
            inserted_at: r.inserted_at,
            position: r.position,
        })
    }
}

/// Insert a pending run inside an open transaction.
pub(crate) async fn insert_run_in(
    tx: &mut Transaction<'_, Postgres>,
    run: &NewRun,
) -> Result<RunRow, DbError> {
    let sql = format!(
        r#"
        INSERT INTO runs (id, work_order_id, workflow_id, snapshot_id, starting_job_id,
                          starting_trigger_id, dataclip_id, state, last_activity_at, inserted_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', $8, $8)
        RETURNING {COLUMNS}
        "#
    );
    sqlx::query_as::<_, RunRecord>(&sql)
        .bind(run.id)
        .bind(run.work_order_id)
        .bind(run.workflow_id)
        .bind(run.snapshot_id)
        .bind(run.starting_job_id)
        .bind(run.starting_trigger_id)
        .bind(run.dataclip_id)
        .bind(run.inserted_at)
        .fetch_one(&mut **tx)
        .await?
        .try_into()
}

/// Insert a pending run and its cloned step associations.
pub async fn insert_run(
    pool: &PgPool,
    run: &NewRun,
    cloned_steps: &[Uuid],
) -> Result<RunRow, DbError> {
    let mut tx = pool.begin().await?;
    let row = insert_run_in(&mut tx, run).await?;

    for step_id in cloned_steps {
        sqlx::query("INSERT INTO run_steps (run_id, step_id) VALUES ($1, $2)")
            .bind(row.id)
            .bind(step_id)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(row)
}

pub async fn get_run(pool: &PgPool, id: Uuid) -> Result<RunRow, DbError> {
    let sql = format!("SELECT {COLUMNS} FROM runs WHERE id = $1");
    sqlx::query_as::<_, RunRecord>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::not_found("runs", id))?
        .try_into()
}

/// Runs of a work order, oldest first. Takes any executor so the work
/// order refresh can read them inside its own transaction.
pub async fn list_runs_for_work_order<'c>(
    executor: impl PgExecutor<'c>,
    work_order_id: Uuid,
) -> Result<Vec<RunRow>, DbError> {
    let sql = format!("SELECT {COLUMNS} FROM runs WHERE work_order_id = $1 ORDER BY position");
    sqlx::query_as::<_, RunRecord>(&sql)
        .bind(work_order_id)
        .fetch_all(executor)
        .await?
        .into_iter()
        .map(TryInto::try_into)
        .collect()
}

pub async fn list_runs_in_states(
    pool: &PgPool,
    states: &[RunState],
    limit: usize,
) -> Result<Vec<RunRow>, DbError> {
    let states: Vec<String> = states.iter().map(|s| s.as_str().to_owned()).collect();
    let sql = format!(
        "SELECT {COLUMNS} FROM runs WHERE state = ANY($1) ORDER BY position LIMIT $2"
    );
    sqlx::query_as::<_, RunRecord>(&sql)
        .bind(&states)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(pool)
        .await?
        .into_iter()
        .map(TryInto::try_into)
        .collect()
}

/// Oldest pending run per workflow, after `after_position`, FIFO order.
pub async fn list_pending_heads(
    pool: &PgPool,
    after_position: i64,
    limit: usize,
) -> Result<Vec<RunRow>, DbError> {
    let sql = format!(
        r#"
        SELECT {COLUMNS} FROM (
            SELECT DISTINCT ON (workflow_id) {COLUMNS}
            FROM runs
            WHERE state = 'pending'
            ORDER BY workflow_id, position
        ) heads
        WHERE position > $1
        ORDER BY position
        LIMIT $2
        "#
    );
    sqlx::query_as::<_, RunRecord>(&sql)
        .bind(after_position)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(pool)
        .await?
        .into_iter()
        .map(TryInto::try_into)
        .collect()
}

async fn lock_run(tx: &mut Transaction<'_, Postgres>, id: Uuid) -> Result<RunRow, DbError> {
    let sql = format!("SELECT {COLUMNS} FROM runs WHERE id = $1 FOR UPDATE");
    sqlx::query_as::<_, RunRecord>(&sql)
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(DbError::not_found("runs", id))?
        .try_into()
}

async fn lock_workflow(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
) -> Result<(WorkflowRow, Option<ProjectRow>), DbError> {
    let sql = format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = $1 FOR UPDATE");
    let workflow: WorkflowRow = sqlx::query_as::<_, WorkflowRecord>(&sql)
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(DbError::not_found("workflows", id))?
        .try_into()?;

    let project = match workflow.project_id {
        Some(project_id) => {
            let record = sqlx::query_as::<_, (Uuid, Option<i32>, i32)>(
                "SELECT id, concurrency, running_count FROM projects WHERE id = $1 FOR UPDATE",
            )
            .bind(project_id)
            .fetch_optional(&mut **tx)
            .await?;
            match record {
                Some((id, concurrency, running_count)) => Some(ProjectRow {
                    id,
                    concurrency: super::to_opt_count("projects", concurrency)?,
                    running_count: super::to_count("projects", running_count)?,
                }),
                None => None,
            }
        }
        None => None,
    };

    Ok((workflow, project))
}

async fn adjust_slots(
    tx: &mut Transaction<'_, Postgres>,
    workflow: &WorkflowRow,
    delta: i32,
) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE workflows SET running_count = GREATEST(running_count + $2, 0) WHERE id = $1",
    )
    .bind(workflow.id)
    .bind(delta)
    .execute(&mut **tx)
    .await?;

    if let Some(project_id) = workflow.project_id {
        sqlx::query(
            "UPDATE projects SET running_count = GREATEST(running_count + $2, 0) WHERE id = $1",
        )
        .bind(project_id)
        .bind(delta)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn write_run(tx: &mut Transaction<'_, Postgres>, run: &RunRow) -> Result<(), DbError> {
    sqlx::query(
        r#"
        UPDATE runs
        SET state = $2, worker_id = $3, exit_reason = $4, error_type = $5,
            claimed_at = $6, started_at = $7, finished_at = $8, last_activity_at = $9
        WHERE id = $1
        "#,
    )
    .bind(run.id)
    .bind(run.state.as_str())
    .bind(&run.worker_id)
    .bind(run.exit_reason.map(|r| r.as_str()))
    .bind(&run.error_type)
    .bind(run.claimed_at)
    .bind(run.started_at)
    .bind(run.finished_at)
    .bind(run.last_activity_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Claim a pending run, taking a concurrency slot in the same transaction.
pub async fn claim_run(
    pool: &PgPool,
    id: Uuid,
    worker_id: &str,
    at: DateTime<Utc>,
    fallback_cap: Option<u32>,
) -> Result<ClaimOutcome, DbError> {
    let mut tx = pool.begin().await?;

    // Racing claimers skip a row another transaction holds instead of
    // queueing behind it.
    let sql = format!("SELECT {COLUMNS} FROM runs WHERE id = $1 FOR UPDATE SKIP LOCKED");
    let locked = sqlx::query_as::<_, RunRecord>(&sql)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
    let mut run: RunRow = match locked {
        Some(record) => record.try_into()?,
        None => {
            tx.rollback().await?;
            // Either missing (NotFound) or busy elsewhere.
            return Ok(ClaimOutcome::Conflict(get_run(pool, id).await?));
        }
    };
    if run.state != RunState::Pending {
        tx.rollback().await?;
        return Ok(ClaimOutcome::Conflict(run));
    }

    let (workflow, project) = lock_workflow(&mut tx, run.workflow_id).await?;
    if !has_capacity(&workflow, project.as_ref(), fallback_cap) {
        tx.rollback().await?;
        return Ok(ClaimOutcome::NoCapacity);
    }

    RunTransition::new(&[RunState::Pending], RunState::Claimed, at).apply(&mut run);
    run.worker_id = Some(worker_id.to_owned());
    write_run(&mut tx, &run).await?;
    adjust_slots(&mut tx, &workflow, 1).await?;

    tx.commit().await?;
    Ok(ClaimOutcome::Claimed(run))
}

/// Compare-and-swap a run's state, releasing its slot on a terminal move.
pub async fn transition_run(
    pool: &PgPool,
    id: Uuid,
    transition: &RunTransition,
) -> Result<TransitionOutcome, DbError> {
    let mut tx = pool.begin().await?;

    let mut run = lock_run(&mut tx, id).await?;
    if !transition.matches(&run) {
        tx.rollback().await?;
        return Ok(TransitionOutcome::Rejected(run));
    }

    let previous = run.state;
    transition.apply(&mut run);
    write_run(&mut tx, &run).await?;

    if previous.holds_slot() && run.state.is_terminal() {
        let (workflow, _) = lock_workflow(&mut tx, run.workflow_id).await?;
        adjust_slots(&mut tx, &workflow, -1).await?;
    }

    tx.commit().await?;
    Ok(TransitionOutcome::Applied { previous, run })
}

/// Bump `last_activity_at` on a non-terminal run; never moves it backwards.
pub async fn touch_run(pool: &PgPool, id: Uuid, at: DateTime<Utc>) -> Result<(), DbError> {
    let exists: Option<(Uuid,)> = sqlx::query_as(
        r#"
        UPDATE runs
        SET last_activity_at = CASE
            WHEN state IN ('success', 'failed', 'killed', 'crashed', 'lost') THEN last_activity_at
            ELSE GREATEST(last_activity_at, $2)
        END
        WHERE id = $1
        RETURNING id
        "#,
    )
    .bind(id)
    .bind(at)
    .fetch_optional(pool)
    .await?;

    exists.map(|_| ()).ok_or(DbError::not_found("runs", id))
}
