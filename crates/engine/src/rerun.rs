//! Rerun planning.
//!
//! A rerun from job J creates a new pending Run of the same work order,
//! pinned to the source Run's snapshot, that starts at J with the input J
//! originally received. Steps of jobs strictly before J are not executed
//! again: they are associated with the new Run and keep pointing at the
//! Run that produced them.

use db::models::{NewRun, RunRow, StepRow};
use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::dag::GraphIndex;
use crate::error::IneligibleReason;
use crate::runs::Enqueued;
use crate::{EngineError, RunEngine};

/// What a rerun would reuse from its source Run.
#[derive(Debug, Clone)]
pub struct RerunPlan {
    pub source: RunRow,
    pub target_job_id: Uuid,
    /// The source Run's (latest) Step for the target job.
    pub target_step: StepRow,
    /// Upstream Step ids to associate with the new Run, by start time.
    pub cloned_steps: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedRerun {
    pub work_order_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnqueuedRerun {
    pub work_order_id: Uuid,
    pub run_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkRerunSummary {
    pub requested: usize,
    pub enqueued: Vec<EnqueuedRerun>,
    pub skipped: Vec<SkippedRerun>,
    pub message: String,
}

/// Whether the UI should offer "rerun from here" for a Step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RerunEligibility {
    Eligible,
    Disabled { reason: String, tooltip: String },
}

fn tooltip(reason: &IneligibleReason, can_edit_retention: bool) -> String {
    match reason {
        IneligibleReason::InputWiped { .. } if can_edit_retention => {
            "No input data has been stored for this step. Go to the project's data storage \
             settings to retain input data for future runs."
                .into()
        }
        IneligibleReason::InputWiped { .. } => {
            "No input data has been stored for this step. Contact a project administrator \
             to change the data retention policy."
                .into()
        }
        IneligibleReason::NoStepForJob => "This job was not executed in the selected run.".into(),
        IneligibleReason::RunNotFinished { .. } => {
            "This run is still in progress. Wait for it to finish before retrying.".into()
        }
    }
}

impl RunEngine {
    /// Work out what rerunning `source` from `target_job_id` would need,
    /// without creating anything.
    pub async fn plan_rerun(
        &self,
        source: &RunRow,
        target_job_id: Uuid,
    ) -> Result<RerunPlan, EngineError> {
        let ineligible = |reason| EngineError::RerunIneligible {
            job_id: target_job_id,
            reason,
        };
        if !source.state.is_terminal() {
            return Err(ineligible(IneligibleReason::RunNotFinished {
                state: source.state,
            }));
        }

        let snapshot = self.get_snapshot(source.snapshot_id).await?;
        if snapshot.job(target_job_id).is_none() {
            return Err(EngineError::JobNotInSnapshot {
                job_id: target_job_id,
                snapshot_id: snapshot.id,
            });
        }

        let steps = self.store.list_run_steps(source.id).await?;
        let target_step = steps
            .iter()
            .filter(|s| s.job_id == target_job_id)
            .max_by_key(|s| s.started_at)
            .cloned()
            .ok_or_else(|| ineligible(IneligibleReason::NoStepForJob))?;

        let input = self.store.get_dataclip(target_step.input_dataclip_id).await?;
        if input.is_wiped() {
            return Err(ineligible(IneligibleReason::InputWiped {
                dataclip_id: input.id,
            }));
        }

        let upstream = GraphIndex::new(&snapshot).upstream_of(target_job_id);
        let cloned_steps = steps
            .iter()
            .filter(|s| upstream.contains(&s.job_id))
            .map(|s| s.id)
            .collect();

        Ok(RerunPlan {
            source: source.clone(),
            target_job_id,
            target_step,
            cloned_steps,
        })
    }

    /// Rerun a finished Run from `target_job_id` onward.
    #[instrument(skip(self))]
    pub async fn rerun(&self, run_id: Uuid, target_job_id: Uuid) -> Result<Enqueued, EngineError> {
        let source = self.store.get_run(run_id).await?;
        let plan = match self.plan_rerun(&source, target_job_id).await {
            Ok(plan) => plan,
            Err(e) => {
                warn!(error = %e, "rerun refused");
                return Err(e);
            }
        };

        let new_run = NewRun {
            id: Uuid::new_v4(),
            work_order_id: source.work_order_id,
            workflow_id: source.workflow_id,
            snapshot_id: source.snapshot_id,
            starting_job_id: Some(target_job_id),
            starting_trigger_id: None,
            dataclip_id: plan.target_step.input_dataclip_id,
            inserted_at: chrono::Utc::now(),
        };
        let run = self.store.insert_run(new_run, &plan.cloned_steps).await?;
        info!(
            new_run_id = %run.id,
            cloned = plan.cloned_steps.len(),
            "rerun enqueued"
        );
        self.enqueued(run).await
    }

    /// New Run from the work order's original starting point and input.
    #[instrument(skip(self))]
    pub async fn rerun_from_start(&self, work_order_id: Uuid) -> Result<Enqueued, EngineError> {
        let work_order = self.store.get_work_order(work_order_id).await?;
        let runs = self.store.list_runs_for_work_order(work_order_id).await?;
        let (Some(first), Some(latest)) = (runs.first(), runs.last()) else {
            return Err(EngineError::NotFound {
                entity: "run",
                id: work_order_id,
            });
        };
        // Trigger-started work orders report the trigger as the starting node.
        let start_node = first
            .starting_job_id
            .or(first.starting_trigger_id)
            .unwrap_or_default();
        if !latest.state.is_terminal() {
            return Err(EngineError::RerunIneligible {
                job_id: start_node,
                reason: IneligibleReason::RunNotFinished {
                    state: latest.state,
                },
            });
        }
        let input = self.store.get_dataclip(work_order.dataclip_id).await?;
        if input.is_wiped() {
            return Err(EngineError::RerunIneligible {
                job_id: start_node,
                reason: IneligibleReason::InputWiped {
                    dataclip_id: input.id,
                },
            });
        }

        let new_run = NewRun {
            id: Uuid::new_v4(),
            work_order_id,
            workflow_id: work_order.workflow_id,
            snapshot_id: work_order.snapshot_id,
            starting_job_id: first.starting_job_id,
            starting_trigger_id: first.starting_trigger_id,
            dataclip_id: work_order.dataclip_id,
            inserted_at: chrono::Utc::now(),
        };
        let run = self.store.insert_run(new_run, &[]).await?;
        info!(new_run_id = %run.id, "rerun from start enqueued");
        self.enqueued(run).await
    }

    /// Rerun the most recent Run of each work order from the same job.
    /// Work orders that cannot be rerun are skipped, not failed.
    #[instrument(skip(self, work_order_ids), fields(requested = work_order_ids.len()))]
    pub async fn bulk_rerun(
        &self,
        work_order_ids: &[Uuid],
        target_job_id: Uuid,
    ) -> Result<BulkRerunSummary, EngineError> {
        let mut enqueued = Vec::new();
        let mut skipped = Vec::new();

        for &work_order_id in work_order_ids {
            let runs = self.store.list_runs_for_work_order(work_order_id).await?;
            let Some(latest) = runs.iter().max_by_key(|r| r.position) else {
                skipped.push(SkippedRerun {
                    work_order_id,
                    reason: format!("work order {work_order_id} not found"),
                });
                continue;
            };

            match self.rerun(latest.id, target_job_id).await {
                Ok(created) => enqueued.push(EnqueuedRerun {
                    work_order_id,
                    run_id: created.run.id,
                }),
                Err(
                    e @ (EngineError::RerunIneligible { .. }
                    | EngineError::JobNotInSnapshot { .. }
                    | EngineError::NotFound { .. }),
                ) => skipped.push(SkippedRerun {
                    work_order_id,
                    reason: e.to_string(),
                }),
                Err(e) => return Err(e),
            }
        }

        let message = format!("New runs enqueued for {} workorders", enqueued.len());
        info!(enqueued = enqueued.len(), skipped = skipped.len(), "{message}");
        Ok(BulkRerunSummary {
            requested: work_order_ids.len(),
            enqueued,
            skipped,
            message,
        })
    }

    /// UI projection of [`RunEngine::plan_rerun`].
    pub async fn rerun_eligibility(
        &self,
        run_id: Uuid,
        job_id: Uuid,
        can_edit_retention: bool,
    ) -> Result<RerunEligibility, EngineError> {
        let source = self.store.get_run(run_id).await?;
        match self.plan_rerun(&source, job_id).await {
            Ok(_) => Ok(RerunEligibility::Eligible),
            Err(EngineError::RerunIneligible { reason, .. }) => Ok(RerunEligibility::Disabled {
                tooltip: tooltip(&reason, can_edit_retention),
                reason: reason.to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    /// Bookkeeping shared by every path that creates a pending Run.
    async fn enqueued(&self, run: RunRow) -> Result<Enqueued, EngineError> {
        self.after_transition(&run, run.state).await?;
        let admission = self.admission.admit(run.workflow_id).await?;
        self.admission.notify_claimers();
        let work_order = self.store.get_work_order(run.work_order_id).await?;
        Ok(Enqueued {
            work_order,
            run,
            admission,
        })
    }
}
