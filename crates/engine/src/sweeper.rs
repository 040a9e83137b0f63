//! Lost-run detection.
//!
//! Claimed or started Runs with no activity for `lost_timeout` are marked
//! `lost`. The sweep only marks; it never creates a retry Run.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use db::models::{ExitReason, LogLevel, RunState};
use db::{RunTransition, TransitionOutcome};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{EngineError, RunEngine};

impl RunEngine {
    /// Mark every stale active Run as lost. Returns the ids that were marked.
    pub async fn sweep_lost(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, EngineError> {
        let timeout = chrono::Duration::from_std(self.config.lost_timeout)
            .map_err(|e| EngineError::InvalidRequest(format!("lost timeout out of range: {e}")))?;
        let cutoff = now - timeout;

        let active = self
            .store
            .list_runs_in_states(&RunState::ACTIVE, usize::MAX)
            .await?;

        let mut marked = Vec::new();
        for run in active.into_iter().filter(|r| r.last_activity_at <= cutoff) {
            // Conditioned on staleness too: a heartbeat after the listing wins.
            let transition = RunTransition::new(&RunState::ACTIVE, RunState::Lost, now)
                .with_exit(ExitReason::Lost, None)
                .inactive_since(cutoff);

            match self.store.transition_run(run.id, &transition).await? {
                TransitionOutcome::Applied { previous, run } => {
                    warn!(
                        run_id = %run.id,
                        %previous,
                        last_activity_at = %run.last_activity_at,
                        "run marked lost"
                    );
                    let message = format!(
                        "Run lost: no activity from the worker since {}.",
                        run.last_activity_at.to_rfc3339()
                    );
                    marked.push(run.id);
                    self.platform_log(run.id, LogLevel::Error, &message).await;
                    if let Err(e) = self.after_transition(&run, previous).await {
                        error!(run_id = %run.id, error = %e, "bookkeeping for lost run failed");
                    }
                }
                TransitionOutcome::Rejected(run) => {
                    debug!(run_id = %run.id, state = %run.state, "run recovered before sweep");
                }
            }
        }

        if !marked.is_empty() {
            info!(count = marked.len(), "lost-run sweep finished");
        }
        Ok(marked)
    }
}

/// Background task running [`RunEngine::sweep_lost`] every `sweep_interval`.
pub struct LostRunSweeper {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl LostRunSweeper {
    pub fn spawn(engine: Arc<RunEngine>) -> Self {
        let (shutdown, mut stop) = watch::channel(false);
        let period = engine.config.sweep_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval = ?period, "lost-run sweeper started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = engine.sweep_lost(Utc::now()).await {
                            error!(error = %e, "lost-run sweep failed");
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("lost-run sweeper stopped");
        });

        Self { shutdown, handle }
    }

    /// Stop the loop and wait for an in-flight sweep to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            error!(error = %e, "lost-run sweeper task panicked");
        }
    }
}
