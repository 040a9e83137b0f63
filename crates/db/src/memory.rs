//! In-process `RunStore` backed by plain tables behind one mutex.
//!
//! Each trait method takes the lock once, so every call is trivially
//! serialisable. Used by the test-suite and by `serve --in-memory`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::models::{
    derive_work_order_state, has_capacity, DataclipRow, LogLineRow, LogSource, NewLogLine, NewRun,
    ProjectRow, RunRow, RunState, SnapshotRow, StepRow, WorkOrderRow, WorkflowRow,
};
use crate::store::{
    ClaimOutcome, FinishOutcome, RunStore, RunTransition, StepCompletion, TransitionOutcome,
};
use crate::DbError;

#[derive(Default)]
struct Tables {
    projects: HashMap<Uuid, ProjectRow>,
    workflows: HashMap<Uuid, WorkflowRow>,
    snapshots: HashMap<Uuid, SnapshotRow>,
    dataclips: HashMap<Uuid, DataclipRow>,
    work_orders: HashMap<Uuid, WorkOrderRow>,
    runs: HashMap<Uuid, RunRow>,
    steps: HashMap<Uuid, StepRow>,
    /// run id → step ids displayed under it, in association order.
    run_steps: HashMap<Uuid, Vec<Uuid>>,
    log_lines: HashMap<Uuid, Vec<LogLineRow>>,
    next_position: i64,
    next_sequence: i64,
}

impl Tables {
    fn run_mut(&mut self, id: Uuid) -> Result<&mut RunRow, DbError> {
        self.runs.get_mut(&id).ok_or(DbError::not_found("runs", id))
    }

    fn push_run(&mut self, new: NewRun) -> RunRow {
        self.next_position += 1;
        let run = RunRow::from_new(new, self.next_position);
        self.runs.insert(run.id, run.clone());
        self.run_steps.entry(run.id).or_default();
        run
    }

    fn adjust_slots(&mut self, workflow_id: Uuid, acquire: bool) {
        let Some(workflow) = self.workflows.get_mut(&workflow_id) else {
            return;
        };
        bump(&mut workflow.running_count, acquire);
        if let Some(project) = workflow
            .project_id
            .and_then(|project_id| self.projects.get_mut(&project_id))
        {
            bump(&mut project.running_count, acquire);
        }
    }
}

fn bump(count: &mut u32, up: bool) {
    if up {
        *count += 1;
    } else {
        *count = count.saturating_sub(1);
    }
}

/// In-memory implementation of [`RunStore`].
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn upsert_project(&self, mut project: ProjectRow) -> Result<ProjectRow, DbError> {
        let mut t = self.tables.lock();
        if let Some(existing) = t.projects.get(&project.id) {
            project.running_count = existing.running_count;
        }
        t.projects.insert(project.id, project.clone());
        Ok(project)
    }

    async fn get_project(&self, id: Uuid) -> Result<ProjectRow, DbError> {
        let t = self.tables.lock();
        t.projects
            .get(&id)
            .cloned()
            .ok_or(DbError::not_found("projects", id))
    }

    async fn upsert_workflow(&self, mut workflow: WorkflowRow) -> Result<WorkflowRow, DbError> {
        let mut t = self.tables.lock();
        if let Some(existing) = t.workflows.get(&workflow.id) {
            workflow.running_count = existing.running_count;
        }
        t.workflows.insert(workflow.id, workflow.clone());
        Ok(workflow)
    }

    async fn get_workflow(&self, id: Uuid) -> Result<WorkflowRow, DbError> {
        let t = self.tables.lock();
        t.workflows
            .get(&id)
            .cloned()
            .ok_or(DbError::not_found("workflows", id))
    }

    async fn insert_snapshot(&self, snapshot: SnapshotRow) -> Result<SnapshotRow, DbError> {
        let mut t = self.tables.lock();
        if let Some(existing) = t.snapshots.values().find(|s| {
            s.workflow_id == snapshot.workflow_id && s.lock_version == snapshot.lock_version
        }) {
            return Ok(existing.clone());
        }
        t.snapshots.insert(snapshot.id, snapshot.clone());
        Ok(snapshot)
    }

    async fn get_snapshot(&self, id: Uuid) -> Result<SnapshotRow, DbError> {
        let t = self.tables.lock();
        t.snapshots
            .get(&id)
            .cloned()
            .ok_or(DbError::not_found("graph_snapshots", id))
    }

    async fn find_snapshot(
        &self,
        workflow_id: Uuid,
        lock_version: i64,
    ) -> Result<Option<SnapshotRow>, DbError> {
        let t = self.tables.lock();
        Ok(t.snapshots
            .values()
            .find(|s| s.workflow_id == workflow_id && s.lock_version == lock_version)
            .cloned())
    }

    async fn insert_dataclip(&self, dataclip: DataclipRow) -> Result<DataclipRow, DbError> {
        let mut t = self.tables.lock();
        if let Some(existing) = t.dataclips.values().find(|d| {
            !d.is_wiped() && d.kind == dataclip.kind && d.digest == dataclip.digest
        }) {
            return Ok(existing.clone());
        }
        t.dataclips.insert(dataclip.id, dataclip.clone());
        Ok(dataclip)
    }

    async fn get_dataclip(&self, id: Uuid) -> Result<DataclipRow, DbError> {
        let t = self.tables.lock();
        t.dataclips
            .get(&id)
            .cloned()
            .ok_or(DbError::not_found("dataclips", id))
    }

    async fn wipe_dataclip(&self, id: Uuid, at: DateTime<Utc>) -> Result<DataclipRow, DbError> {
        let mut t = self.tables.lock();
        let clip = t
            .dataclips
            .get_mut(&id)
            .ok_or(DbError::not_found("dataclips", id))?;
        clip.body = None;
        clip.wiped_at.get_or_insert(at);
        Ok(clip.clone())
    }

    async fn insert_work_order(
        &self,
        work_order: WorkOrderRow,
        first_run: NewRun,
    ) -> Result<(WorkOrderRow, RunRow), DbError> {
        let mut t = self.tables.lock();
        t.work_orders.insert(work_order.id, work_order.clone());
        let run = t.push_run(first_run);
        Ok((work_order, run))
    }

    async fn get_work_order(&self, id: Uuid) -> Result<WorkOrderRow, DbError> {
        let t = self.tables.lock();
        t.work_orders
            .get(&id)
            .cloned()
            .ok_or(DbError::not_found("work_orders", id))
    }

    async fn refresh_work_order_state(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<WorkOrderRow, DbError> {
        let mut t = self.tables.lock();
        let runs: Vec<RunRow> = t
            .runs
            .values()
            .filter(|r| r.work_order_id == id)
            .cloned()
            .collect();
        let work_order = t
            .work_orders
            .get_mut(&id)
            .ok_or(DbError::not_found("work_orders", id))?;
        work_order.state = derive_work_order_state(&runs);
        work_order.last_activity = at;
        Ok(work_order.clone())
    }

    async fn insert_run(&self, run: NewRun, cloned_steps: &[Uuid]) -> Result<RunRow, DbError> {
        let mut t = self.tables.lock();
        if !t.work_orders.contains_key(&run.work_order_id) {
            return Err(DbError::not_found("work_orders", run.work_order_id));
        }
        if let Some(missing) = cloned_steps.iter().find(|id| !t.steps.contains_key(id)) {
            return Err(DbError::not_found("steps", *missing));
        }
        let run = t.push_run(run);
        t.run_steps
            .entry(run.id)
            .or_default()
            .extend_from_slice(cloned_steps);
        Ok(run)
    }

    async fn get_run(&self, id: Uuid) -> Result<RunRow, DbError> {
        let t = self.tables.lock();
        t.runs.get(&id).cloned().ok_or(DbError::not_found("runs", id))
    }

    async fn list_runs_for_work_order(&self, work_order_id: Uuid) -> Result<Vec<RunRow>, DbError> {
        let t = self.tables.lock();
        let mut runs: Vec<RunRow> = t
            .runs
            .values()
            .filter(|r| r.work_order_id == work_order_id)
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.position);
        Ok(runs)
    }

    async fn list_runs_in_states(
        &self,
        states: &[RunState],
        limit: usize,
    ) -> Result<Vec<RunRow>, DbError> {
        let t = self.tables.lock();
        let mut runs: Vec<RunRow> = t
            .runs
            .values()
            .filter(|r| states.contains(&r.state))
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.position);
        runs.truncate(limit);
        Ok(runs)
    }

    async fn list_pending_heads(
        &self,
        after_position: i64,
        limit: usize,
    ) -> Result<Vec<RunRow>, DbError> {
        let t = self.tables.lock();
        let mut heads: HashMap<Uuid, &RunRow> = HashMap::new();
        for run in t.runs.values().filter(|r| r.state == RunState::Pending) {
            heads
                .entry(run.workflow_id)
                .and_modify(|head| {
                    if run.position < head.position {
                        *head = run;
                    }
                })
                .or_insert(run);
        }
        let mut heads: Vec<RunRow> = heads
            .into_values()
            .filter(|r| r.position > after_position)
            .cloned()
            .collect();
        heads.sort_by_key(|r| r.position);
        heads.truncate(limit);
        Ok(heads)
    }

    async fn claim_run(
        &self,
        id: Uuid,
        worker_id: &str,
        at: DateTime<Utc>,
        fallback_cap: Option<u32>,
    ) -> Result<ClaimOutcome, DbError> {
        let mut t = self.tables.lock();
        let run = t.runs.get(&id).cloned().ok_or(DbError::not_found("runs", id))?;
        if run.state != RunState::Pending {
            return Ok(ClaimOutcome::Conflict(run));
        }

        let workflow = t
            .workflows
            .get(&run.workflow_id)
            .ok_or(DbError::not_found("workflows", run.workflow_id))?;
        let project = workflow.project_id.and_then(|p| t.projects.get(&p));
        if !has_capacity(workflow, project, fallback_cap) {
            return Ok(ClaimOutcome::NoCapacity);
        }

        t.adjust_slots(run.workflow_id, true);
        let row = t.run_mut(id)?;
        RunTransition::new(&[RunState::Pending], RunState::Claimed, at).apply(row);
        row.worker_id = Some(worker_id.to_owned());
        Ok(ClaimOutcome::Claimed(row.clone()))
    }

    async fn transition_run(
        &self,
        id: Uuid,
        transition: &RunTransition,
    ) -> Result<TransitionOutcome, DbError> {
        let mut t = self.tables.lock();
        let row = t.run_mut(id)?;
        if !transition.matches(row) {
            return Ok(TransitionOutcome::Rejected(row.clone()));
        }
        let previous = row.state;
        transition.apply(row);
        let run = row.clone();
        if previous.holds_slot() && run.state.is_terminal() {
            t.adjust_slots(run.workflow_id, false);
        }
        Ok(TransitionOutcome::Applied { previous, run })
    }

    async fn touch_run(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), DbError> {
        let mut t = self.tables.lock();
        let row = t.run_mut(id)?;
        if !row.state.is_terminal() && row.last_activity_at < at {
            row.last_activity_at = at;
        }
        Ok(())
    }

    async fn insert_step(&self, step: StepRow) -> Result<StepRow, DbError> {
        let mut t = self.tables.lock();
        if !t.runs.contains_key(&step.run_id) {
            return Err(DbError::not_found("runs", step.run_id));
        }
        t.run_steps.entry(step.run_id).or_default().push(step.id);
        t.steps.insert(step.id, step.clone());
        Ok(step)
    }

    async fn get_step(&self, id: Uuid) -> Result<StepRow, DbError> {
        let t = self.tables.lock();
        t.steps.get(&id).cloned().ok_or(DbError::not_found("steps", id))
    }

    async fn finish_step(
        &self,
        id: Uuid,
        completion: StepCompletion,
    ) -> Result<FinishOutcome, DbError> {
        let mut t = self.tables.lock();
        let step = t.steps.get_mut(&id).ok_or(DbError::not_found("steps", id))?;
        if !step.is_open() {
            return Ok(FinishOutcome::AlreadyFinished(step.clone()));
        }
        step.output_dataclip_id = completion.output_dataclip_id;
        step.exit_reason = Some(completion.exit_reason);
        step.error_type = completion.error_type;
        step.finished_at = Some(completion.at);
        Ok(FinishOutcome::Finished(step.clone()))
    }

    async fn list_run_steps(&self, run_id: Uuid) -> Result<Vec<StepRow>, DbError> {
        let t = self.tables.lock();
        let ids = t
            .run_steps
            .get(&run_id)
            .ok_or(DbError::not_found("runs", run_id))?;
        let mut steps: Vec<StepRow> = ids
            .iter()
            .filter_map(|id| t.steps.get(id))
            .cloned()
            .collect();
        // Stable sort keeps association order for identical start times.
        steps.sort_by_key(|s| s.started_at);
        Ok(steps)
    }

    async fn append_log(&self, line: NewLogLine) -> Result<LogLineRow, DbError> {
        let mut t = self.tables.lock();
        if !t.runs.contains_key(&line.run_id) {
            return Err(DbError::not_found("runs", line.run_id));
        }
        t.next_sequence += 1;
        let row = LogLineRow {
            id: Uuid::new_v4(),
            run_id: line.run_id,
            step_id: line.step_id,
            source: if line.step_id.is_some() {
                LogSource::Job
            } else {
                LogSource::Run
            },
            level: line.level,
            message: line.message,
            timestamp: line.timestamp,
            sequence: t.next_sequence,
            inserted_at: Utc::now(),
        };
        t.log_lines.entry(row.run_id).or_default().push(row.clone());
        Ok(row)
    }

    async fn list_logs(
        &self,
        run_id: Uuid,
        step_id: Option<Uuid>,
    ) -> Result<Vec<LogLineRow>, DbError> {
        let t = self.tables.lock();
        Ok(t.log_lines
            .get(&run_id)
            .map(|lines| {
                lines
                    .iter()
                    .filter(|l| step_id.is_none() || l.step_id == step_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
