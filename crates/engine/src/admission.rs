//! Concurrency admission.
//!
//! Slots are counted on the workflow (and project) rows and are taken by
//! the store in the same atomic operation that moves a Run from `pending`
//! to `claimed`; terminal transitions give them back the same way. This
//! controller answers "would a Run be admitted right now?" and wakes
//! claimers that are waiting for a slot or for new work.

use std::sync::Arc;

use db::models::{effective_cap, has_capacity, ProjectRow, WorkflowRow};
use db::RunStore;
use serde::Serialize;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::EngineError;

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Admission {
    /// A slot is free; the Run can be claimed now.
    Permit,
    /// The workflow is at its cap; the Run stays pending until a slot frees.
    Queued,
}

/// Concurrency settings as shown in workflow settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConcurrencySettings {
    pub workflow_id: Uuid,
    pub workflow_concurrency: Option<u32>,
    pub project_concurrency: Option<u32>,
    /// `None` = unlimited.
    pub effective_concurrency: Option<u32>,
    pub running_count: u32,
    pub editable: bool,
    pub notice: Option<String>,
}

pub struct AdmissionController {
    store: Arc<dyn RunStore>,
    fallback_cap: Option<u32>,
    wakeups: Notify,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn RunStore>, fallback_cap: Option<u32>) -> Self {
        Self {
            store,
            fallback_cap,
            wakeups: Notify::new(),
        }
    }

    /// Cap used when neither the workflow nor its project sets one.
    pub fn fallback_cap(&self) -> Option<u32> {
        self.fallback_cap
    }

    pub async fn admit(&self, workflow_id: Uuid) -> Result<Admission, EngineError> {
        let (workflow, project) = self.load(workflow_id).await?;
        let admission = if has_capacity(&workflow, project.as_ref(), self.fallback_cap) {
            Admission::Permit
        } else {
            Admission::Queued
        };
        debug!(%workflow_id, running = workflow.running_count, ?admission, "admission check");
        Ok(admission)
    }

    pub async fn settings(&self, workflow_id: Uuid) -> Result<ConcurrencySettings, EngineError> {
        let (workflow, project) = self.load(workflow_id).await?;
        let project_cap = project.as_ref().and_then(|p| p.concurrency);
        let (editable, notice) = if project_cap == Some(1) {
            (
                false,
                Some(
                    "Parallel execution is disabled for this project: runs are processed \
                     one at a time."
                        .to_owned(),
                ),
            )
        } else {
            (true, None)
        };
        Ok(ConcurrencySettings {
            workflow_id,
            workflow_concurrency: workflow.concurrency,
            project_concurrency: project_cap,
            effective_concurrency: effective_cap(
                workflow.concurrency,
                project_cap,
                self.fallback_cap,
            ),
            running_count: workflow.running_count,
            editable,
            notice,
        })
    }

    /// Wake every claimer currently waiting for work.
    pub fn notify_claimers(&self) {
        self.wakeups.notify_waiters();
    }

    /// A future that resolves on the next [`AdmissionController::notify_claimers`].
    pub fn notified(&self) -> Notified<'_> {
        self.wakeups.notified()
    }

    async fn load(
        &self,
        workflow_id: Uuid,
    ) -> Result<(WorkflowRow, Option<ProjectRow>), EngineError> {
        let workflow = self.store.get_workflow(workflow_id).await?;
        let project = match workflow.project_id {
            Some(project_id) => Some(self.store.get_project(project_id).await?),
            None => None,
        };
        Ok((workflow, project))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::MemoryStore;

    async fn seeded(
        workflow_cap: Option<u32>,
        project_cap: Option<u32>,
    ) -> (Arc<MemoryStore>, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let project_id = Uuid::new_v4();
        store
            .upsert_project(ProjectRow {
                id: project_id,
                concurrency: project_cap,
                running_count: 0,
            })
            .await
            .unwrap();
        let workflow = store
            .upsert_workflow(WorkflowRow {
                id: Uuid::new_v4(),
                project_id: Some(project_id),
                name: "wf".into(),
                lock_version: 1,
                concurrency: workflow_cap,
                running_count: 0,
            })
            .await
            .unwrap();
        (store, workflow.id)
    }

    #[tokio::test]
    async fn unlimited_workflow_is_always_permitted() {
        let (store, workflow_id) = seeded(None, None).await;
        let admission = AdmissionController::new(store, None);
        assert_eq!(admission.admit(workflow_id).await.unwrap(), Admission::Permit);
    }

    #[tokio::test]
    async fn zero_fallback_cap_queues_everything() {
        let (store, workflow_id) = seeded(None, None).await;
        let admission = AdmissionController::new(store, Some(0));
        assert_eq!(admission.admit(workflow_id).await.unwrap(), Admission::Queued);
    }

    #[tokio::test]
    async fn project_cap_of_one_is_read_only() {
        let (store, workflow_id) = seeded(Some(4), Some(1)).await;
        let admission = AdmissionController::new(store, None);
        let settings = admission.settings(workflow_id).await.unwrap();
        assert_eq!(settings.effective_concurrency, Some(1));
        assert!(!settings.editable);
        assert!(settings.notice.is_some());

        let (store, workflow_id) = seeded(Some(4), None).await;
        let settings = AdmissionController::new(store, None)
            .settings(workflow_id)
            .await
            .unwrap();
        assert_eq!(settings.effective_concurrency, Some(4));
        assert!(settings.editable);
    }

    #[tokio::test]
    async fn unknown_workflow_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let admission = AdmissionController::new(store, None);
        assert!(matches!(
            admission.admit(Uuid::new_v4()).await,
            Err(EngineError::NotFound { entity: "workflow", .. })
        ));
    }
}
