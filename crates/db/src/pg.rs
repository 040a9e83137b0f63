//! `RunStore` over Postgres, delegating to the repository functions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    DataclipRow, LogLineRow, NewLogLine, NewRun, ProjectRow, RunRow, RunState, SnapshotRow,
    StepRow, WorkOrderRow, WorkflowRow,
};
use crate::repository::{dataclips, logs, runs, steps, work_orders, workflows};
use crate::store::{
    ClaimOutcome, FinishOutcome, RunStore, RunTransition, StepCompletion, TransitionOutcome,
};
use crate::{DbError, DbPool};

/// Postgres-backed [`RunStore`].
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl RunStore for PgStore {
    async fn upsert_project(&self, project: ProjectRow) -> Result<ProjectRow, DbError> {
        workflows::upsert_project(&self.pool, &project).await
    }

    async fn get_project(&self, id: Uuid) -> Result<ProjectRow, DbError> {
        workflows::get_project(&self.pool, id).await
    }

    async fn upsert_workflow(&self, workflow: WorkflowRow) -> Result<WorkflowRow, DbError> {
        workflows::upsert_workflow(&self.pool, &workflow).await
    }

    async fn get_workflow(&self, id: Uuid) -> Result<WorkflowRow, DbError> {
        workflows::get_workflow(&self.pool, id).await
    }

    async fn insert_snapshot(&self, snapshot: SnapshotRow) -> Result<SnapshotRow, DbError> {
        workflows::insert_snapshot(&self.pool, &snapshot).await
    }

    async fn get_snapshot(&self, id: Uuid) -> Result<SnapshotRow, DbError> {
        workflows::get_snapshot(&self.pool, id).await
    }

    async fn find_snapshot(
        &self,
        workflow_id: Uuid,
        lock_version: i64,
    ) -> Result<Option<SnapshotRow>, DbError> {
        workflows::find_snapshot(&self.pool, workflow_id, lock_version).await
    }

    async fn insert_dataclip(&self, dataclip: DataclipRow) -> Result<DataclipRow, DbError> {
        dataclips::insert_dataclip(&self.pool, &dataclip).await
    }

    async fn get_dataclip(&self, id: Uuid) -> Result<DataclipRow, DbError> {
        dataclips::get_dataclip(&self.pool, id).await
    }

    async fn wipe_dataclip(&self, id: Uuid, at: DateTime<Utc>) -> Result<DataclipRow, DbError> {
        dataclips::wipe_dataclip(&self.pool, id, at).await
    }

    async fn insert_work_order(
        &self,
        work_order: WorkOrderRow,
        first_run: NewRun,
    ) -> Result<(WorkOrderRow, RunRow), DbError> {
        work_orders::insert_work_order(&self.pool, &work_order, &first_run).await
    }

    async fn get_work_order(&self, id: Uuid) -> Result<WorkOrderRow, DbError> {
        work_orders::get_work_order(&self.pool, id).await
    }

    async fn refresh_work_order_state(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<WorkOrderRow, DbError> {
        work_orders::refresh_work_order_state(&self.pool, id, at).await
    }

    async fn insert_run(&self, run: NewRun, cloned_steps: &[Uuid]) -> Result<RunRow, DbError> {
        runs::insert_run(&self.pool, &run, cloned_steps).await
    }

    async fn get_run(&self, id: Uuid) -> Result<RunRow, DbError> {
        runs::get_run(&self.pool, id).await
    }

    async fn list_runs_for_work_order(&self, work_order_id: Uuid) -> Result<Vec<RunRow>, DbError> {
        runs::list_runs_for_work_order(&self.pool, work_order_id).await
    }

    async fn list_runs_in_states(
        &self,
        states: &[RunState],
        limit: usize,
    ) -> Result<Vec<RunRow>, DbError> {
        runs::list_runs_in_states(&self.pool, states, limit).await
    }

    async fn list_pending_heads(
        &self,
        after_position: i64,
        limit: usize,
    ) -> Result<Vec<RunRow>, DbError> {
        runs::list_pending_heads(&self.pool, after_position, limit).await
    }

    async fn claim_run(
        &self,
        id: Uuid,
        worker_id: &str,
        at: DateTime<Utc>,
        fallback_cap: Option<u32>,
    ) -> Result<ClaimOutcome, DbError> {
        runs::claim_run(&self.pool, id, worker_id, at, fallback_cap).await
    }

    async fn transition_run(
        &self,
        id: Uuid,
        transition: &RunTransition,
    ) -> Result<TransitionOutcome, DbError> {
        runs::transition_run(&self.pool, id, transition).await
    }

    async fn touch_run(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), DbError> {
        runs::touch_run(&self.pool, id, at).await
    }

    async fn insert_step(&self, step: StepRow) -> Result<StepRow, DbError> {
        steps::insert_step(&self.pool, &step).await
    }

    async fn get_step(&self, id: Uuid) -> Result<StepRow, DbError> {
        steps::get_step(&self.pool, id).await
    }

    async fn finish_step(
        &self,
        id: Uuid,
        completion: StepCompletion,
    ) -> Result<FinishOutcome, DbError> {
        steps::finish_step(&self.pool, id, &completion).await
    }

    async fn list_run_steps(&self, run_id: Uuid) -> Result<Vec<StepRow>, DbError> {
        steps::list_run_steps(&self.pool, run_id).await
    }

    async fn append_log(&self, line: NewLogLine) -> Result<LogLineRow, DbError> {
        logs::append_log(&self.pool, &line).await
    }

    async fn list_logs(
        &self,
        run_id: Uuid,
        step_id: Option<Uuid>,
    ) -> Result<Vec<LogLineRow>, DbError> {
        logs::list_logs(&self.pool, run_id, step_id).await
    }
}
