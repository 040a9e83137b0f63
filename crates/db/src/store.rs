//! The `RunStore` trait — the persistence contract the run engine relies on.
//!
//! Every method is a single atomic, serialisable operation. State changes
//! that race between workers (claiming, terminal transitions, step
//! completion) are expressed as compare-and-swap calls so that the store,
//! not the caller, decides who wins.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    DataclipRow, ExitReason, LogLineRow, NewLogLine, NewRun, ProjectRow, RunRow, RunState,
    SnapshotRow, StepRow, WorkOrderRow, WorkflowRow,
};
use crate::DbError;

/// A conditional run state change.
#[derive(Debug, Clone)]
pub struct RunTransition {
    /// The change applies only if the run is currently in one of these.
    pub from: Vec<RunState>,
    pub to: RunState,
    pub at: DateTime<Utc>,
    pub exit_reason: Option<ExitReason>,
    pub error_type: Option<String>,
    /// When set, the change also requires `last_activity_at <= inactive_since`.
    pub inactive_since: Option<DateTime<Utc>>,
}

impl RunTransition {
    pub fn new(from: &[RunState], to: RunState, at: DateTime<Utc>) -> Self {
        Self {
            from: from.to_vec(),
            to,
            at,
            exit_reason: None,
            error_type: None,
            inactive_since: None,
        }
    }

    pub fn with_exit(mut self, exit_reason: ExitReason, error_type: Option<String>) -> Self {
        self.exit_reason = Some(exit_reason);
        self.error_type = error_type;
        self
    }

    pub fn inactive_since(mut self, cutoff: DateTime<Utc>) -> Self {
        self.inactive_since = Some(cutoff);
        self
    }

    /// Whether `run` satisfies this transition's preconditions.
    pub fn matches(&self, run: &RunRow) -> bool {
        self.from.contains(&run.state)
            && self
                .inactive_since
                .map_or(true, |cutoff| run.last_activity_at <= cutoff)
    }

    /// Apply the change to an in-memory row. Callers must check
    /// [`RunTransition::matches`] first.
    pub fn apply(&self, run: &mut RunRow) {
        run.state = self.to;
        match self.to {
            RunState::Claimed => run.claimed_at = Some(self.at),
            RunState::Started => run.started_at = Some(self.at),
            _ => {}
        }
        if self.to.is_terminal() {
            run.finished_at = Some(self.at);
            run.exit_reason = self.exit_reason;
            run.error_type = self.error_type.clone();
        }
        // A lost run keeps the timestamp of the last activity we saw.
        if self.to != RunState::Lost {
            run.last_activity_at = self.at;
        }
    }
}

/// Result of [`RunStore::transition_run`].
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    Applied { previous: RunState, run: RunRow },
    /// Preconditions did not hold; the row is returned unchanged.
    Rejected(RunRow),
}

/// Result of [`RunStore::claim_run`].
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    Claimed(RunRow),
    /// The run is no longer pending.
    Conflict(RunRow),
    /// The workflow or project is at its concurrency cap.
    NoCapacity,
}

#[derive(Debug, Clone)]
pub struct StepCompletion {
    pub output_dataclip_id: Option<Uuid>,
    pub exit_reason: ExitReason,
    pub error_type: Option<String>,
    pub at: DateTime<Utc>,
}

/// Result of [`RunStore::finish_step`].
#[derive(Debug, Clone)]
pub enum FinishOutcome {
    Finished(StepRow),
    AlreadyFinished(StepRow),
}

#[async_trait]
pub trait RunStore: Send + Sync + 'static {
    // ------ projects / workflows ------

    /// Insert or update a project; `running_count` is preserved.
    async fn upsert_project(&self, project: ProjectRow) -> Result<ProjectRow, DbError>;
    async fn get_project(&self, id: Uuid) -> Result<ProjectRow, DbError>;
    /// Insert or update a workflow; `running_count` is preserved.
    async fn upsert_workflow(&self, workflow: WorkflowRow) -> Result<WorkflowRow, DbError>;
    async fn get_workflow(&self, id: Uuid) -> Result<WorkflowRow, DbError>;

    // ------ graph_snapshots ------

    /// Insert a snapshot unless one already exists for the same
    /// `(workflow_id, lock_version)`, in which case the stored one is returned.
    async fn insert_snapshot(&self, snapshot: SnapshotRow) -> Result<SnapshotRow, DbError>;
    async fn get_snapshot(&self, id: Uuid) -> Result<SnapshotRow, DbError>;
    async fn find_snapshot(
        &self,
        workflow_id: Uuid,
        lock_version: i64,
    ) -> Result<Option<SnapshotRow>, DbError>;

    // ------ dataclips ------

    /// Insert a dataclip unless an unwiped clip of the same kind and digest
    /// exists, in which case that one is returned.
    async fn insert_dataclip(&self, dataclip: DataclipRow) -> Result<DataclipRow, DbError>;
    async fn get_dataclip(&self, id: Uuid) -> Result<DataclipRow, DbError>;
    /// Discard the body and stamp `wiped_at`. Wiping twice keeps the first stamp.
    async fn wipe_dataclip(&self, id: Uuid, at: DateTime<Utc>) -> Result<DataclipRow, DbError>;

    // ------ work_orders ------

    /// Insert a work order together with its first run.
    async fn insert_work_order(
        &self,
        work_order: WorkOrderRow,
        first_run: NewRun,
    ) -> Result<(WorkOrderRow, RunRow), DbError>;
    async fn get_work_order(&self, id: Uuid) -> Result<WorkOrderRow, DbError>;
    /// Re-derive the work order's state from its runs and store it, as one
    /// operation. Concurrent refreshes serialise on the work order, so the
    /// last writer always sees every committed run transition.
    async fn refresh_work_order_state(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<WorkOrderRow, DbError>;

    // ------ runs ------

    /// Insert a pending run and associate `cloned_steps` with it, in order.
    async fn insert_run(&self, run: NewRun, cloned_steps: &[Uuid]) -> Result<RunRow, DbError>;
    async fn get_run(&self, id: Uuid) -> Result<RunRow, DbError>;
    /// Runs of a work order, oldest first.
    async fn list_runs_for_work_order(&self, work_order_id: Uuid) -> Result<Vec<RunRow>, DbError>;
    /// Runs in any of `states`, in FIFO (`position`) order.
    async fn list_runs_in_states(
        &self,
        states: &[RunState],
        limit: usize,
    ) -> Result<Vec<RunRow>, DbError>;
    /// The oldest pending run of every workflow, in FIFO (`position`)
    /// order, starting after `after_position`. Claimers page through this
    /// so a saturated workflow's queue never hides another workflow's head.
    async fn list_pending_heads(
        &self,
        after_position: i64,
        limit: usize,
    ) -> Result<Vec<RunRow>, DbError>;
    /// Atomically move a pending run to `claimed`, taking a concurrency slot
    /// for its workflow (and project). `fallback_cap` applies when neither
    /// the workflow nor its project sets a limit. A run another claimer is
    /// busy with comes back as [`ClaimOutcome::Conflict`].
    async fn claim_run(
        &self,
        id: Uuid,
        worker_id: &str,
        at: DateTime<Utc>,
        fallback_cap: Option<u32>,
    ) -> Result<ClaimOutcome, DbError>;
    /// Compare-and-swap on run state. A move from a slot-holding state to
    /// a terminal state releases the slot in the same operation.
    async fn transition_run(
        &self,
        id: Uuid,
        transition: &RunTransition,
    ) -> Result<TransitionOutcome, DbError>;
    /// Record worker activity on a run.
    async fn touch_run(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), DbError>;

    // ------ steps ------

    /// Insert a step and associate it with the run that executes it.
    async fn insert_step(&self, step: StepRow) -> Result<StepRow, DbError>;
    async fn get_step(&self, id: Uuid) -> Result<StepRow, DbError>;
    /// Close an open step. Closing an already-closed step changes nothing.
    async fn finish_step(
        &self,
        id: Uuid,
        completion: StepCompletion,
    ) -> Result<FinishOutcome, DbError>;
    /// Steps displayed under a run (executed or cloned), by start time.
    async fn list_run_steps(&self, run_id: Uuid) -> Result<Vec<StepRow>, DbError>;

    // ------ log_lines ------

    /// Append a line and assign its sequence number.
    async fn append_log(&self, line: NewLogLine) -> Result<LogLineRow, DbError>;
    /// Lines of a run (optionally of one step) in append order.
    async fn list_logs(
        &self,
        run_id: Uuid,
        step_id: Option<Uuid>,
    ) -> Result<Vec<LogLineRow>, DbError>;
}
