//! `RunEngine`: the facade the HTTP layer and the sweeper talk to.
//!
//! Operations are grouped by concern across modules (`runs`, `steps`,
//! `rerun`, `snapshots`, `dataclips`, `sweeper`), each adding an
//! `impl RunEngine` block. The engine holds no run state of its own beyond
//! log subscriptions and claimer wake-ups; everything else lives in the
//! [`RunStore`].

use std::sync::Arc;

use db::models::{ProjectRow, RunRow, WorkflowRow};
use db::{MemoryStore, RunStore};
use tracing::info;
use uuid::Uuid;

use crate::admission::AdmissionController;
use crate::config::EngineConfig;
use crate::logs::LogStream;
use crate::models::{RunDetail, StepView, WorkOrderDetail};
use crate::EngineError;

pub struct RunEngine {
    pub(crate) store: Arc<dyn RunStore>,
    pub(crate) config: EngineConfig,
    pub(crate) admission: AdmissionController,
    pub(crate) logs: LogStream,
}

impl RunEngine {
    pub fn new(store: Arc<dyn RunStore>, config: EngineConfig) -> Self {
        let admission = AdmissionController::new(Arc::clone(&store), config.project_concurrency);
        let logs = LogStream::new(Arc::clone(&store), config.log_channel_capacity);
        Self {
            store,
            config,
            admission,
            logs,
        }
    }

    /// Engine over a fresh [`MemoryStore`].
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::new(Arc::new(MemoryStore::new()), config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn logs(&self) -> &LogStream {
        &self.logs
    }

    // ------------------------------------------------------------------
    // Editor persistence
    // ------------------------------------------------------------------

    pub async fn upsert_project(&self, project: ProjectRow) -> Result<ProjectRow, EngineError> {
        let project = self.store.upsert_project(project).await?;
        info!(project_id = %project.id, concurrency = ?project.concurrency, "project saved");
        // A raised cap may admit queued Runs.
        self.admission.notify_claimers();
        Ok(project)
    }

    pub async fn upsert_workflow(&self, workflow: WorkflowRow) -> Result<WorkflowRow, EngineError> {
        if let Some(project_id) = workflow.project_id {
            self.store.get_project(project_id).await?;
        }
        let workflow = self.store.upsert_workflow(workflow).await?;
        info!(
            workflow_id = %workflow.id,
            lock_version = workflow.lock_version,
            concurrency = ?workflow.concurrency,
            "workflow saved"
        );
        self.admission.notify_claimers();
        Ok(workflow)
    }

    pub async fn get_workflow(&self, id: Uuid) -> Result<WorkflowRow, EngineError> {
        Ok(self.store.get_workflow(id).await?)
    }

    // ------------------------------------------------------------------
    // Read projections
    // ------------------------------------------------------------------

    pub async fn get_run(&self, id: Uuid) -> Result<RunRow, EngineError> {
        Ok(self.store.get_run(id).await?)
    }

    /// A Run with the Steps displayed under it, cloned ones flagged.
    pub async fn get_run_detail(&self, id: Uuid) -> Result<RunDetail, EngineError> {
        let run = self.store.get_run(id).await?;
        let steps = self
            .store
            .list_run_steps(id)
            .await?
            .into_iter()
            .map(|step| StepView {
                state: step.state(),
                cloned_from_run: (step.run_id != id).then_some(step.run_id),
                step,
            })
            .collect();
        Ok(RunDetail { run, steps })
    }

    pub async fn get_work_order_detail(&self, id: Uuid) -> Result<WorkOrderDetail, EngineError> {
        let work_order = self.store.get_work_order(id).await?;
        let runs = self.store.list_runs_for_work_order(id).await?;
        Ok(WorkOrderDetail { work_order, runs })
    }
}
