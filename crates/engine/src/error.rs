//! Engine-level error types.

use db::models::RunState;
use db::DbError;
use thiserror::Error;
use uuid::Uuid;

/// Why a rerun cannot be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IneligibleReason {
    /// The input dataclip of the step to rerun from has been wiped.
    InputWiped { dataclip_id: Uuid },
    /// The source run has no step for the requested job.
    NoStepForJob,
    /// The source run has not reached a terminal state yet.
    RunNotFinished { state: RunState },
}

impl std::fmt::Display for IneligibleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InputWiped { dataclip_id } => {
                write!(f, "input dataclip {dataclip_id} has been wiped")
            }
            Self::NoStepForJob => write!(f, "the job did not run in the source run"),
            Self::RunNotFinished { state } => write!(f, "the source run is still {state}"),
        }
    }
}

/// Errors produced by the run engine.
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Snapshot validation errors ------

    /// Two or more jobs/triggers share the same ID.
    #[error("duplicate node ID: '{0}'")]
    DuplicateNodeId(Uuid),

    /// An edge references a node ID that doesn't exist in the snapshot.
    #[error("edge references unknown node '{node_id}' ({side} side)")]
    UnknownNodeReference { node_id: Uuid, side: &'static str },

    #[error("invalid edge {edge_id}: {message}")]
    InvalidEdge { edge_id: Uuid, message: String },

    /// Topological sort detected a cycle.
    #[error("workflow graph contains a cycle")]
    CycleDetected,

    // ------ Lookup errors ------

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("workflow {workflow_id} has no snapshot for lock_version {lock_version}")]
    SnapshotMissing { workflow_id: Uuid, lock_version: i64 },

    #[error("job {job_id} is not part of snapshot {snapshot_id}")]
    JobNotInSnapshot { job_id: Uuid, snapshot_id: Uuid },

    #[error("trigger {0} is disabled")]
    TriggerDisabled(Uuid),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // ------ Lifecycle errors ------

    /// The action is not allowed from the run's current state.
    #[error("cannot {action} run {run_id} in state {from}")]
    InvalidStateTransition {
        run_id: Uuid,
        from: RunState,
        action: &'static str,
    },

    /// A completion arrived for a run that already finished.
    #[error("run {run_id} is already terminal ({state})")]
    AlreadyTerminal { run_id: Uuid, state: RunState },

    /// Another worker claimed the run first.
    #[error("run {run_id} was already claimed (state {state})")]
    ClaimConflict { run_id: Uuid, state: RunState },

    /// The workflow is at its concurrency cap; the run stays pending.
    #[error("workflow {workflow_id} is at its concurrency limit; run stays queued")]
    AdmissionDenied { workflow_id: Uuid },

    #[error("cannot rerun from job {job_id}: {reason}")]
    RerunIneligible {
        job_id: Uuid,
        reason: IneligibleReason,
    },

    // ------ Infrastructure errors ------

    #[error("database error: {0}")]
    Database(DbError),

    #[error("snapshot definition error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<DbError> for EngineError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound { table, id } => Self::NotFound {
                entity: entity_name(table),
                id,
            },
            other => Self::Database(other),
        }
    }
}

fn entity_name(table: &'static str) -> &'static str {
    match table {
        "projects" => "project",
        "workflows" => "workflow",
        "graph_snapshots" => "snapshot",
        "dataclips" => "dataclip",
        "work_orders" => "work order",
        "runs" => "run",
        "steps" => "step",
        other => other,
    }
}
