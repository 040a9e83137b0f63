//! Step execution records and worker log lines.

use chrono::{DateTime, Utc};
use db::models::{DataclipKind, ExitReason, LogLevel, LogLineRow, NewLogLine, RunState, StepRow};
use db::{FinishOutcome, StepCompletion};
use serde_json::Value;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{EngineError, RunEngine};

impl RunEngine {
    /// Open a Step for `job_id` inside a started Run.
    #[instrument(skip(self))]
    pub async fn start_step(
        &self,
        run_id: Uuid,
        job_id: Uuid,
        input_dataclip_id: Uuid,
    ) -> Result<StepRow, EngineError> {
        let run = self.store.get_run(run_id).await?;
        if run.state != RunState::Started {
            warn!(state = %run.state, "step start rejected");
            return Err(EngineError::InvalidStateTransition {
                run_id,
                from: run.state,
                action: "start a step in",
            });
        }

        let snapshot = self.get_snapshot(run.snapshot_id).await?;
        if snapshot.job(job_id).is_none() {
            return Err(EngineError::JobNotInSnapshot {
                job_id,
                snapshot_id: snapshot.id,
            });
        }
        self.store.get_dataclip(input_dataclip_id).await?;

        let now = Utc::now();
        let step = self
            .store
            .insert_step(StepRow {
                id: Uuid::new_v4(),
                run_id,
                job_id,
                snapshot_id: run.snapshot_id,
                input_dataclip_id,
                output_dataclip_id: None,
                exit_reason: None,
                error_type: None,
                started_at: now,
                finished_at: None,
            })
            .await?;
        self.store.touch_run(run_id, now).await?;
        info!(step_id = %step.id, "step started");
        Ok(step)
    }

    /// Close a Step. Repeating the call for a closed Step changes nothing.
    #[instrument(skip(self, output, error_type))]
    pub async fn complete_step(
        &self,
        step_id: Uuid,
        output: Option<Value>,
        exit_reason: ExitReason,
        error_type: Option<String>,
    ) -> Result<StepRow, EngineError> {
        if exit_reason == ExitReason::Lost {
            return Err(EngineError::InvalidRequest(
                "workers cannot report a step as lost".into(),
            ));
        }
        let step = self.store.get_step(step_id).await?;
        if !step.is_open() {
            warn!(run_id = %step.run_id, "step already completed; ignoring repeat");
            return Ok(step);
        }

        let output_dataclip_id = match output {
            Some(body) => Some(self.save_dataclip(DataclipKind::StepResult, body).await?.id),
            None => None,
        };
        let now = Utc::now();
        let completion = StepCompletion {
            output_dataclip_id,
            error_type: if exit_reason == ExitReason::Success { None } else { error_type },
            exit_reason,
            at: now,
        };
        let step = match self.store.finish_step(step_id, completion).await? {
            FinishOutcome::Finished(step) => step,
            FinishOutcome::AlreadyFinished(step) => {
                warn!(run_id = %step.run_id, "step completed concurrently; ignoring repeat");
                return Ok(step);
            }
        };

        let run = self.store.get_run(step.run_id).await?;
        match run.state {
            RunState::Lost => {
                warn!(run_id = %run.id, "orphaned step completion recorded for lost run");
            }
            state if state.is_terminal() => {
                warn!(run_id = %run.id, %state, "late step completion for finished run");
            }
            _ => self.store.touch_run(run.id, now).await?,
        }
        info!(run_id = %step.run_id, %exit_reason, "step completed");
        Ok(step)
    }

    /// Append a worker log line. `timestamp` is kept for display only;
    /// lines are ordered by arrival.
    pub async fn append_log(
        &self,
        run_id: Uuid,
        step_id: Option<Uuid>,
        level: LogLevel,
        message: String,
        timestamp: DateTime<Utc>,
    ) -> Result<LogLineRow, EngineError> {
        if let Some(step_id) = step_id {
            let step = self.store.get_step(step_id).await?;
            if step.run_id != run_id {
                return Err(EngineError::InvalidRequest(format!(
                    "step {step_id} was not executed by run {run_id}"
                )));
            }
        }
        let line = self
            .logs
            .append(NewLogLine {
                run_id,
                step_id,
                level,
                message,
                timestamp,
            })
            .await?;
        self.store.touch_run(run_id, Utc::now()).await?;
        Ok(line)
    }

    pub async fn list_logs(
        &self,
        run_id: Uuid,
        step_id: Option<Uuid>,
    ) -> Result<Vec<LogLineRow>, EngineError> {
        self.store.get_run(run_id).await?;
        self.logs.list(run_id, step_id).await
    }
}
