//! Publishing and loading immutable graph snapshots.

use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::dag::validate_snapshot;
use crate::models::GraphSnapshot;
use crate::{EngineError, RunEngine};

impl RunEngine {
    /// Validate and store a snapshot. A snapshot already stored for the same
    /// `(workflow_id, lock_version)` is returned as-is and never replaced.
    #[instrument(
        skip(self, snapshot),
        fields(workflow_id = %snapshot.workflow_id, lock_version = snapshot.lock_version)
    )]
    pub async fn publish_snapshot(
        &self,
        snapshot: GraphSnapshot,
    ) -> Result<GraphSnapshot, EngineError> {
        self.store.get_workflow(snapshot.workflow_id).await?;
        let order = validate_snapshot(&snapshot)?;

        let stored = self.store.insert_snapshot(snapshot.to_row()?).await?;
        let stored = GraphSnapshot::from_row(stored)?;
        if stored.id != snapshot.id {
            warn!(
                existing = %stored.id,
                "snapshot version already published; keeping the stored one"
            );
        } else {
            info!(snapshot_id = %stored.id, jobs = order.len(), "snapshot published");
        }
        Ok(stored)
    }

    pub async fn get_snapshot(&self, id: Uuid) -> Result<GraphSnapshot, EngineError> {
        GraphSnapshot::from_row(self.store.get_snapshot(id).await?)
    }

    /// Snapshot at the live workflow's `lock_version`.
    pub async fn current_snapshot(&self, workflow_id: Uuid) -> Result<GraphSnapshot, EngineError> {
        let workflow = self.store.get_workflow(workflow_id).await?;
        let row = self
            .store
            .find_snapshot(workflow_id, workflow.lock_version)
            .await?
            .ok_or(EngineError::SnapshotMissing {
                workflow_id,
                lock_version: workflow.lock_version,
            })?;
        GraphSnapshot::from_row(row)
    }
}
