//! Graph models and read projections for the run engine.
//!
//! A [`GraphSnapshot`] is the frozen view of a workflow a run executes
//! against. Its jobs, triggers and edges are serialised into the JSON
//! `definition` column of the `graph_snapshots` table; the live workflow
//! row only carries `lock_version` and concurrency settings.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use db::models::{RunRow, SnapshotRow, StepRow, StepState, WorkOrderRow};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::EngineError;

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// How a trigger starts a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerKind {
    /// Triggered by an incoming HTTP request.
    Webhook,
    /// Triggered on a cron schedule.
    Cron {
        /// Standard cron expression (5 fields).
        cron_expression: String,
    },
    /// Triggered by a user from the UI or API.
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: Uuid,
    #[serde(flatten)]
    pub kind: TriggerKind,
    pub enabled: bool,
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A single unit of work in the graph. `adaptor` and `body` are opaque to
/// the engine; only external workers interpret them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Stable across snapshots.
    pub id: Uuid,
    pub name: String,
    pub adaptor: String,
    pub body: String,
    pub credential_id: Option<Uuid>,
}

// ---------------------------------------------------------------------------
// Edge
// ---------------------------------------------------------------------------

/// Where an edge starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeSource {
    Trigger(Uuid),
    Job(Uuid),
}

impl EdgeSource {
    pub fn id(&self) -> Uuid {
        match self {
            Self::Trigger(id) | Self::Job(id) => *id,
        }
    }
}

/// When an edge is followed. Evaluated by workers, recorded here as data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "condition_type", rename_all = "snake_case")]
pub enum EdgeCondition {
    Always,
    OnJobSuccess,
    OnJobFailure,
    JsExpression {
        #[serde(rename = "condition_expression")]
        expression: String,
        #[serde(default, rename = "condition_label")]
        label: Option<String>,
    },
}

/// Directed edge from a trigger or job to a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub id: Uuid,
    pub source: EdgeSource,
    pub target_job_id: Uuid,
    #[serde(flatten)]
    pub condition: EdgeCondition,
    pub enabled: bool,
}

// ---------------------------------------------------------------------------
// GraphSnapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// The serialised graph held in a snapshot row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDefinition {
    pub jobs: Vec<Job>,
    pub triggers: Vec<Trigger>,
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub positions: HashMap<Uuid, Position>,
}

/// Immutable copy of a workflow graph at one `lock_version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub lock_version: i64,
    #[serde(flatten)]
    pub graph: GraphDefinition,
    pub inserted_at: DateTime<Utc>,
}

impl GraphSnapshot {
    /// Convenience constructor for a fresh snapshot.
    pub fn new(workflow_id: Uuid, lock_version: i64, graph: GraphDefinition) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            lock_version,
            graph,
            inserted_at: Utc::now(),
        }
    }

    pub fn job(&self, id: Uuid) -> Option<&Job> {
        self.graph.jobs.iter().find(|j| j.id == id)
    }

    pub fn trigger(&self, id: Uuid) -> Option<&Trigger> {
        self.graph.triggers.iter().find(|t| t.id == id)
    }

    pub fn from_row(row: SnapshotRow) -> Result<Self, EngineError> {
        Ok(Self {
            id: row.id,
            workflow_id: row.workflow_id,
            lock_version: row.lock_version,
            graph: serde_json::from_value(row.definition)?,
            inserted_at: row.inserted_at,
        })
    }

    pub fn to_row(&self) -> Result<SnapshotRow, EngineError> {
        Ok(SnapshotRow {
            id: self.id,
            workflow_id: self.workflow_id,
            lock_version: self.lock_version,
            definition: serde_json::to_value(&self.graph)?,
            inserted_at: self.inserted_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Run origin
// ---------------------------------------------------------------------------

/// What started a work order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum RunOrigin {
    Trigger { trigger_id: Uuid },
    /// A user started the workflow at a chosen job.
    Manual { job_id: Uuid },
}

// ---------------------------------------------------------------------------
// Read projections
// ---------------------------------------------------------------------------

/// A step as displayed under a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepView {
    #[serde(flatten)]
    pub step: StepRow,
    pub state: StepState,
    /// Set when the step was originally executed in another run.
    pub cloned_from_run: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunDetail {
    #[serde(flatten)]
    pub run: RunRow,
    pub steps: Vec<StepView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkOrderDetail {
    #[serde(flatten)]
    pub work_order: WorkOrderRow,
    /// Oldest first.
    pub runs: Vec<RunRow>,
}
