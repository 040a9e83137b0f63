//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models; they carry no workflow-graph behaviour.
//! Graph types (jobs, triggers, edges) live in the `engine` crate and are
//! stored here as the opaque JSON `definition` of a snapshot.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Generates `as_str`, `Display` and `FromStr` for enums stored as text.
macro_rules! text_enum {
    ($name:ident, $label:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(concat!("unknown ", $label, ": {}"), other)),
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// projects / workflows
// ---------------------------------------------------------------------------

/// Project-level settings relevant to run admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRow {
    pub id: Uuid,
    /// Cap on simultaneously claimed/running Runs across all of the
    /// project's workflows. `None` = unlimited.
    pub concurrency: Option<u32>,
    /// Runs currently holding an admission slot. Owned by the store.
    #[serde(default)]
    pub running_count: u32,
}

/// The live workflow as seen by the run engine: only the fields the
/// engine reads. The graph itself is captured in [`SnapshotRow`]s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRow {
    pub id: Uuid,
    pub project_id: Option<Uuid>,
    pub name: String,
    /// Bumped by the editor on every structural edit.
    pub lock_version: i64,
    pub concurrency: Option<u32>,
    #[serde(default)]
    pub running_count: u32,
}

/// Effective per-workflow cap: the workflow's own limit bounded by the
/// project's, falling back to the project's and then to `fallback`.
/// `None` means unlimited.
pub fn effective_cap(
    workflow_cap: Option<u32>,
    project_cap: Option<u32>,
    fallback: Option<u32>,
) -> Option<u32> {
    match (workflow_cap, project_cap) {
        (Some(w), Some(p)) => Some(w.min(p)),
        (Some(w), None) => Some(w),
        (None, Some(p)) => Some(p),
        (None, None) => fallback,
    }
}

/// True when one more Run may take a slot under the given caps.
pub fn has_capacity(
    workflow: &WorkflowRow,
    project: Option<&ProjectRow>,
    fallback: Option<u32>,
) -> bool {
    let project_cap = project.and_then(|p| p.concurrency);
    let workflow_ok = match effective_cap(workflow.concurrency, project_cap, fallback) {
        Some(cap) => workflow.running_count < cap,
        None => true,
    };
    let project_ok = match project {
        Some(ProjectRow {
            concurrency: Some(cap),
            running_count,
            ..
        }) => running_count < cap,
        _ => true,
    };
    workflow_ok && project_ok
}

// ---------------------------------------------------------------------------
// graph_snapshots
// ---------------------------------------------------------------------------

/// An immutable, versioned copy of a workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub lock_version: i64,
    /// Serialised jobs/triggers/edges/positions.
    pub definition: Value,
    pub inserted_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// dataclips
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataclipKind {
    HttpRequest,
    StepResult,
    SavedInput,
    Global,
}

text_enum!(DataclipKind, "dataclip kind" {
    HttpRequest => "http_request",
    StepResult => "step_result",
    SavedInput => "saved_input",
    Global => "global",
});

/// A stored JSON payload. Once `wiped_at` is set, `body` is `None` forever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataclipRow {
    pub id: Uuid,
    pub kind: DataclipKind,
    pub body: Option<Value>,
    /// Content digest of the body, kept after a wipe.
    pub digest: String,
    pub wiped_at: Option<DateTime<Utc>>,
    pub inserted_at: DateTime<Utc>,
}

impl DataclipRow {
    pub fn is_wiped(&self) -> bool {
        self.wiped_at.is_some()
    }
}

// ---------------------------------------------------------------------------
// work_orders
// ---------------------------------------------------------------------------

/// State of a work order, derived from its runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkOrderState {
    Pending,
    Running,
    Success,
    Failed,
    Killed,
    Crashed,
    Lost,
}

text_enum!(WorkOrderState, "work order state" {
    Pending => "pending",
    Running => "running",
    Success => "success",
    Failed => "failed",
    Killed => "killed",
    Crashed => "crashed",
    Lost => "lost",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkOrderRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub snapshot_id: Uuid,
    /// `None` for manual work orders.
    pub trigger_id: Option<Uuid>,
    pub dataclip_id: Uuid,
    pub state: WorkOrderState,
    pub last_activity: DateTime<Utc>,
    pub inserted_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// runs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Claimed,
    /// Displayed as "running".
    Started,
    Success,
    Failed,
    Killed,
    Crashed,
    Lost,
}

text_enum!(RunState, "run state" {
    Pending => "pending",
    Claimed => "claimed",
    Started => "started",
    Success => "success",
    Failed => "failed",
    Killed => "killed",
    Crashed => "crashed",
    Lost => "lost",
});

impl RunState {
    pub const ACTIVE: [RunState; 2] = [RunState::Claimed, RunState::Started];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Killed | Self::Crashed | Self::Lost
        )
    }

    /// Claimed and started runs count against the concurrency caps.
    pub fn holds_slot(&self) -> bool {
        matches!(self, Self::Claimed | Self::Started)
    }
}

/// Why a run or step finished, as reported by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Success,
    Fail,
    Crash,
    Exception,
    Kill,
    /// Set by the engine, never by workers.
    Lost,
}

text_enum!(ExitReason, "exit reason" {
    Success => "success",
    Fail => "fail",
    Crash => "crash",
    Exception => "exception",
    Kill => "kill",
    Lost => "lost",
});

/// A run that has not been persisted yet. The store assigns the FIFO
/// `position` and starts it in [`RunState::Pending`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRun {
    pub id: Uuid,
    pub work_order_id: Uuid,
    pub workflow_id: Uuid,
    pub snapshot_id: Uuid,
    pub starting_job_id: Option<Uuid>,
    pub starting_trigger_id: Option<Uuid>,
    pub dataclip_id: Uuid,
    pub inserted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRow {
    pub id: Uuid,
    pub work_order_id: Uuid,
    pub workflow_id: Uuid,
    pub snapshot_id: Uuid,
    pub starting_job_id: Option<Uuid>,
    pub starting_trigger_id: Option<Uuid>,
    pub dataclip_id: Uuid,
    pub state: RunState,
    pub worker_id: Option<String>,
    pub exit_reason: Option<ExitReason>,
    /// Only meaningful on failed runs.
    pub error_type: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
    pub inserted_at: DateTime<Utc>,
    /// Monotonic enqueue order used for FIFO admission.
    pub position: i64,
}

impl RunRow {
    pub fn from_new(new: NewRun, position: i64) -> Self {
        Self {
            id: new.id,
            work_order_id: new.work_order_id,
            workflow_id: new.workflow_id,
            snapshot_id: new.snapshot_id,
            starting_job_id: new.starting_job_id,
            starting_trigger_id: new.starting_trigger_id,
            dataclip_id: new.dataclip_id,
            state: RunState::Pending,
            worker_id: None,
            exit_reason: None,
            error_type: None,
            claimed_at: None,
            started_at: None,
            finished_at: None,
            last_activity_at: new.inserted_at,
            inserted_at: new.inserted_at,
            position,
        }
    }
}

/// Work order state implied by its runs.
///
/// Active runs win, then pending ones; otherwise the most recent run's
/// terminal state is mirrored.
pub fn derive_work_order_state(runs: &[RunRow]) -> WorkOrderState {
    if runs.iter().any(|r| r.state.holds_slot()) {
        return WorkOrderState::Running;
    }
    if runs.iter().any(|r| r.state == RunState::Pending) {
        return WorkOrderState::Pending;
    }
    match runs.iter().max_by_key(|r| r.position).map(|r| r.state) {
        Some(RunState::Success) => WorkOrderState::Success,
        Some(RunState::Failed) => WorkOrderState::Failed,
        Some(RunState::Killed) => WorkOrderState::Killed,
        Some(RunState::Crashed) => WorkOrderState::Crashed,
        Some(RunState::Lost) => WorkOrderState::Lost,
        _ => WorkOrderState::Pending,
    }
}

// ---------------------------------------------------------------------------
// steps / run_steps
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Running,
    Success,
    Failed,
}

/// Execution record of one job. `run_id` is the run that executed it;
/// the runs it is displayed under live in the `run_steps` association.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRow {
    pub id: Uuid,
    pub run_id: Uuid,
    pub job_id: Uuid,
    pub snapshot_id: Uuid,
    pub input_dataclip_id: Uuid,
    pub output_dataclip_id: Option<Uuid>,
    pub exit_reason: Option<ExitReason>,
    pub error_type: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRow {
    pub fn state(&self) -> StepState {
        match (self.finished_at, self.exit_reason) {
            (None, _) => StepState::Running,
            (Some(_), Some(ExitReason::Success)) => StepState::Success,
            (Some(_), _) => StepState::Failed,
        }
    }

    pub fn is_open(&self) -> bool {
        self.finished_at.is_none()
    }
}

// ---------------------------------------------------------------------------
// log_lines
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    /// Workflow/platform-level message.
    Run,
    /// Job-level console output.
    Job,
}

text_enum!(LogSource, "log source" {
    Run => "run",
    Job => "job",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

text_enum!(LogLevel, "log level" {
    Debug => "debug",
    Info => "info",
    Warn => "warn",
    Error => "error",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLogLine {
    pub run_id: Uuid,
    pub step_id: Option<Uuid>,
    pub level: LogLevel,
    pub message: String,
    /// Worker-supplied; never used for ordering.
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLineRow {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_id: Option<Uuid>,
    pub source: LogSource,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Append order, strictly increasing within a run.
    pub sequence: i64,
    pub inserted_at: DateTime<Utc>,
}
