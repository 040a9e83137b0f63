//! `engine` crate — graph models, snapshot validation, and the run engine:
//! the Run state machine, rerun planner, admission control, log stream and
//! lost-run sweeper.

pub mod admission;
pub mod config;
pub mod dag;
pub mod dataclips;
pub mod engine;
pub mod error;
pub mod logs;
pub mod models;
pub mod rerun;
pub mod runs;
pub mod snapshots;
pub mod steps;
pub mod sweeper;

pub use admission::{Admission, AdmissionController, ConcurrencySettings};
pub use config::EngineConfig;
pub use dag::{validate_snapshot, GraphIndex};
pub use engine::RunEngine;
pub use error::{EngineError, IneligibleReason};
pub use models::{
    Edge, EdgeCondition, EdgeSource, GraphDefinition, GraphSnapshot, Job, RunDetail, RunOrigin,
    StepView, Trigger, TriggerKind, WorkOrderDetail,
};
pub use rerun::{BulkRerunSummary, RerunEligibility};
pub use runs::{derive_work_order_state, Enqueued};
pub use sweeper::LostRunSweeper;

#[cfg(test)]
mod engine_tests;
