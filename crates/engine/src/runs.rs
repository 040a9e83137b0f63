//! Work order and Run lifecycle.
//!
//! ```text
//! Run: pending --claim--> claimed --start--> started --complete--> success|failed|crashed|killed
//!      claimed|started --sweep--> lost
//!      pending|claimed|started --kill--> killed
//! ```
//!
//! Every transition is a compare-and-swap in the store. When the swap is
//! rejected the current row comes back and is mapped to the matching
//! error; nothing is mutated.

use std::time::Duration;

use chrono::Utc;
use db::models::{
    DataclipKind, ExitReason, LogLevel, NewLogLine, NewRun, RunRow, RunState, WorkOrderRow,
    WorkOrderState,
};
use db::{ClaimOutcome, RunTransition, TransitionOutcome};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::admission::Admission;
use crate::models::{RunOrigin, TriggerKind};
use crate::{EngineError, RunEngine};

pub use db::models::derive_work_order_state;

/// Full passes over the pending heads per `claim` call when other
/// claimers keep winning races.
const CLAIM_ROUNDS: usize = 3;

/// A Run that was just created, with the admission verdict for it.
#[derive(Debug, Clone, Serialize)]
pub struct Enqueued {
    pub work_order: WorkOrderRow,
    pub run: RunRow,
    pub admission: Admission,
}

/// Terminal Run state for a worker-reported exit reason.
fn completion_state(exit_reason: ExitReason) -> Option<RunState> {
    match exit_reason {
        ExitReason::Success => Some(RunState::Success),
        ExitReason::Fail => Some(RunState::Failed),
        ExitReason::Crash | ExitReason::Exception => Some(RunState::Crashed),
        ExitReason::Kill => Some(RunState::Killed),
        ExitReason::Lost => None,
    }
}

impl RunEngine {
    /// Create a work order and its first pending Run against the workflow's
    /// current snapshot.
    #[instrument(skip(self, input), fields(workflow_id = %workflow_id))]
    pub async fn create_work_order(
        &self,
        workflow_id: Uuid,
        origin: RunOrigin,
        input: Value,
    ) -> Result<Enqueued, EngineError> {
        let snapshot = self.current_snapshot(workflow_id).await?;

        let (kind, trigger_id, starting_job_id) = match origin {
            RunOrigin::Trigger { trigger_id } => {
                let trigger = snapshot.trigger(trigger_id).ok_or(EngineError::NotFound {
                    entity: "trigger",
                    id: trigger_id,
                })?;
                if !trigger.enabled {
                    return Err(EngineError::TriggerDisabled(trigger_id));
                }
                let kind = match trigger.kind {
                    TriggerKind::Webhook => DataclipKind::HttpRequest,
                    TriggerKind::Cron { .. } => DataclipKind::Global,
                    TriggerKind::Manual => DataclipKind::SavedInput,
                };
                (kind, Some(trigger_id), None)
            }
            RunOrigin::Manual { job_id } => {
                if snapshot.job(job_id).is_none() {
                    return Err(EngineError::JobNotInSnapshot {
                        job_id,
                        snapshot_id: snapshot.id,
                    });
                }
                (DataclipKind::SavedInput, None, Some(job_id))
            }
        };

        let dataclip = self.save_dataclip(kind, input).await?;
        let now = Utc::now();
        let work_order = WorkOrderRow {
            id: Uuid::new_v4(),
            workflow_id,
            snapshot_id: snapshot.id,
            trigger_id,
            dataclip_id: dataclip.id,
            state: WorkOrderState::Pending,
            last_activity: now,
            inserted_at: now,
        };
        let first_run = NewRun {
            id: Uuid::new_v4(),
            work_order_id: work_order.id,
            workflow_id,
            snapshot_id: snapshot.id,
            starting_job_id,
            starting_trigger_id: trigger_id,
            dataclip_id: dataclip.id,
            inserted_at: now,
        };

        let (work_order, run) = self.store.insert_work_order(work_order, first_run).await?;
        let admission = self.admission.admit(workflow_id).await?;
        info!(work_order_id = %work_order.id, run_id = %run.id, ?admission, "work order created");
        self.admission.notify_claimers();

        Ok(Enqueued {
            work_order,
            run,
            admission,
        })
    }

    /// Claim the oldest admissible pending Run, if any.
    ///
    /// FIFO holds per workflow: only the head of each workflow's queue is
    /// a candidate, and heads are tried oldest first, page by page, until
    /// one has a free slot.
    #[instrument(skip(self))]
    pub async fn claim(&self, worker_id: &str) -> Result<Option<RunRow>, EngineError> {
        let page = self.config.claim_scan_limit.max(1);
        for _ in 0..CLAIM_ROUNDS {
            let mut after = 0;
            let mut raced = false;
            loop {
                let heads = self.store.list_pending_heads(after, page).await?;
                let Some(last) = heads.last().map(|r| r.position) else {
                    break;
                };
                after = last;
                let full_page = heads.len() == page;

                for head in heads {
                    match self
                        .store
                        .claim_run(head.id, worker_id, Utc::now(), self.admission.fallback_cap())
                        .await?
                    {
                        ClaimOutcome::Claimed(run) => {
                            info!(run_id = %run.id, "run claimed");
                            self.after_transition(&run, RunState::Pending).await?;
                            return Ok(Some(run));
                        }
                        ClaimOutcome::Conflict(run) => {
                            debug!(run_id = %run.id, state = %run.state, "lost claim race");
                            raced = true;
                        }
                        ClaimOutcome::NoCapacity => {}
                    }
                }
                if !full_page {
                    break;
                }
            }
            // Whoever won a race moved that workflow's head; look again.
            if !raced {
                break;
            }
        }
        Ok(None)
    }

    /// Claim one specific Run.
    #[instrument(skip(self))]
    pub async fn claim_run(&self, run_id: Uuid, worker_id: &str) -> Result<RunRow, EngineError> {
        match self
            .store
            .claim_run(run_id, worker_id, Utc::now(), self.admission.fallback_cap())
            .await?
        {
            ClaimOutcome::Claimed(run) => {
                info!("run claimed");
                self.after_transition(&run, RunState::Pending).await?;
                Ok(run)
            }
            ClaimOutcome::Conflict(run) => {
                warn!(state = %run.state, "claim rejected: run is not pending");
                Err(EngineError::ClaimConflict {
                    run_id,
                    state: run.state,
                })
            }
            ClaimOutcome::NoCapacity => {
                let run = self.store.get_run(run_id).await?;
                debug!(workflow_id = %run.workflow_id, "claim queued: workflow at capacity");
                Err(EngineError::AdmissionDenied {
                    workflow_id: run.workflow_id,
                })
            }
        }
    }

    /// Like [`RunEngine::claim`], but waits up to `wait` for a Run to
    /// become admissible.
    pub async fn claim_wait(
        &self,
        worker_id: &str,
        wait: Duration,
    ) -> Result<Option<RunRow>, EngineError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.admission.notified();
            tokio::pin!(notified);
            // Register before looking so a release in between is not missed.
            notified.as_mut().enable();

            if let Some(run) = self.claim(worker_id).await? {
                return Ok(Some(run));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn start_run(&self, run_id: Uuid) -> Result<RunRow, EngineError> {
        let transition = RunTransition::new(&[RunState::Claimed], RunState::Started, Utc::now());
        match self.store.transition_run(run_id, &transition).await? {
            TransitionOutcome::Applied { previous, run } => {
                info!("run started");
                self.after_transition(&run, previous).await?;
                Ok(run)
            }
            TransitionOutcome::Rejected(run) => {
                warn!(state = %run.state, "start rejected");
                Err(EngineError::InvalidStateTransition {
                    run_id,
                    from: run.state,
                    action: "start",
                })
            }
        }
    }

    /// Record the worker's verdict on a started Run.
    ///
    /// A verdict for a Run that was already marked lost is accepted and
    /// dropped; the Run stays lost.
    #[instrument(skip(self, error_type))]
    pub async fn complete_run(
        &self,
        run_id: Uuid,
        exit_reason: ExitReason,
        error_type: Option<String>,
    ) -> Result<RunRow, EngineError> {
        let to = completion_state(exit_reason).ok_or_else(|| {
            EngineError::InvalidRequest("workers cannot report a run as lost".into())
        })?;
        let error_type = if to == RunState::Success { None } else { error_type };
        let transition = RunTransition::new(&[RunState::Started], to, Utc::now())
            .with_exit(exit_reason, error_type);

        match self.store.transition_run(run_id, &transition).await? {
            TransitionOutcome::Applied { previous, run } => {
                info!(state = %run.state, "run completed");
                self.after_transition(&run, previous).await?;
                Ok(run)
            }
            TransitionOutcome::Rejected(run) if run.state == RunState::Lost => {
                warn!(%exit_reason, "orphaned completion for lost run ignored");
                Ok(run)
            }
            TransitionOutcome::Rejected(run) if run.state.is_terminal() => {
                warn!(state = %run.state, "duplicate completion rejected");
                Err(EngineError::AlreadyTerminal {
                    run_id,
                    state: run.state,
                })
            }
            TransitionOutcome::Rejected(run) => {
                warn!(state = %run.state, "completion rejected");
                Err(EngineError::InvalidStateTransition {
                    run_id,
                    from: run.state,
                    action: "complete",
                })
            }
        }
    }

    /// Cancel a Run. Advisory for a worker already executing it.
    #[instrument(skip(self))]
    pub async fn kill(&self, run_id: Uuid) -> Result<RunRow, EngineError> {
        let transition = RunTransition::new(
            &[RunState::Pending, RunState::Claimed, RunState::Started],
            RunState::Killed,
            Utc::now(),
        )
        .with_exit(ExitReason::Kill, None);

        match self.store.transition_run(run_id, &transition).await? {
            TransitionOutcome::Applied { previous, run } => {
                info!(%previous, "run killed");
                self.platform_log(run_id, LogLevel::Warn, "Run was cancelled.").await;
                self.after_transition(&run, previous).await?;
                Ok(run)
            }
            TransitionOutcome::Rejected(run) => {
                warn!(state = %run.state, "kill rejected");
                Err(EngineError::AlreadyTerminal {
                    run_id,
                    state: run.state,
                })
            }
        }
    }

    /// Record worker liveness without any other change.
    pub async fn heartbeat(&self, run_id: Uuid) -> Result<(), EngineError> {
        let run = self.store.get_run(run_id).await?;
        if !run.state.holds_slot() {
            return Err(EngineError::InvalidStateTransition {
                run_id,
                from: run.state,
                action: "heartbeat",
            });
        }
        self.store.touch_run(run_id, Utc::now()).await?;
        Ok(())
    }

    /// Bookkeeping after a Run changed state: recompute its work order and,
    /// when it finished, wake claimers and end its log stream.
    pub(crate) async fn after_transition(
        &self,
        run: &RunRow,
        previous: RunState,
    ) -> Result<(), EngineError> {
        let work_order = self
            .store
            .refresh_work_order_state(run.work_order_id, Utc::now())
            .await?;
        debug!(
            work_order_id = %work_order.id,
            state = %work_order.state,
            "work order state recomputed"
        );

        if run.state.is_terminal() {
            if previous.holds_slot() {
                self.admission.notify_claimers();
            }
            self.logs.close(run.id);
        }
        Ok(())
    }

    /// Append an engine-authored line. The state change it describes has
    /// already been committed, so a failed append is logged, not returned.
    pub(crate) async fn platform_log(&self, run_id: Uuid, level: LogLevel, message: &str) {
        let line = NewLogLine {
            run_id,
            step_id: None,
            level,
            message: message.to_owned(),
            timestamp: Utc::now(),
        };
        if let Err(e) = self.logs.append(line).await {
            error!(%run_id, error = %e, "failed to record platform log line");
        }
    }
}
