//! End-to-end tests for the run engine.
//!
//! Every test runs against an in-process `MemoryStore`, playing the part of
//! trigger ingress, one or more workers, and the UI. No Postgres needed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use db::models::{
    DataclipKind, ExitReason, LogLevel, ProjectRow, RunRow, RunState, StepRow, WorkOrderState,
    WorkflowRow,
};
use db::{MemoryStore, RunStore};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::models::{Edge, EdgeCondition, EdgeSource, GraphDefinition, Job, Trigger};
use crate::{
    Admission, EngineConfig, EngineError, Enqueued, GraphSnapshot, IneligibleReason,
    LostRunSweeper, RerunEligibility, RunEngine, RunOrigin, TriggerKind,
};

// ---------------------------------------------------------------------------
// Fixture: T → A → B → C
// ---------------------------------------------------------------------------

struct Fixture {
    engine: Arc<RunEngine>,
    workflow_id: Uuid,
    trigger_id: Uuid,
    a: Uuid,
    b: Uuid,
    c: Uuid,
}

fn job(id: Uuid, name: &str) -> Job {
    Job {
        id,
        name: name.into(),
        adaptor: "@openfn/language-http@latest".into(),
        body: "get('/patients')".into(),
        credential_id: None,
    }
}

fn edge(source: EdgeSource, target_job_id: Uuid, condition: EdgeCondition) -> Edge {
    Edge {
        id: Uuid::new_v4(),
        source,
        target_job_id,
        condition,
        enabled: true,
    }
}

/// A workflow T → A → B → C in its own project, published at version 1.
struct Published {
    workflow_id: Uuid,
    trigger_id: Uuid,
    a: Uuid,
    b: Uuid,
    c: Uuid,
}

async fn publish_workflow(engine: &RunEngine, concurrency: Option<u32>) -> Published {
    let project = engine
        .upsert_project(ProjectRow {
            id: Uuid::new_v4(),
            concurrency: None,
            running_count: 0,
        })
        .await
        .unwrap();
    let workflow = engine
        .upsert_workflow(WorkflowRow {
            id: Uuid::new_v4(),
            project_id: Some(project.id),
            name: "patient intake".into(),
            lock_version: 1,
            concurrency,
            running_count: 0,
        })
        .await
        .unwrap();

    let (trigger_id, a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let snapshot = GraphSnapshot::new(
        workflow.id,
        1,
        GraphDefinition {
            jobs: vec![job(a, "fetch"), job(b, "transform"), job(c, "load")],
            triggers: vec![Trigger {
                id: trigger_id,
                kind: TriggerKind::Webhook,
                enabled: true,
            }],
            edges: vec![
                edge(EdgeSource::Trigger(trigger_id), a, EdgeCondition::Always),
                edge(EdgeSource::Job(a), b, EdgeCondition::OnJobSuccess),
                edge(EdgeSource::Job(b), c, EdgeCondition::OnJobSuccess),
            ],
            positions: HashMap::new(),
        },
    );
    engine.publish_snapshot(snapshot).await.unwrap();

    Published {
        workflow_id: workflow.id,
        trigger_id,
        a,
        b,
        c,
    }
}

async fn fixture(config: EngineConfig, concurrency: Option<u32>) -> Fixture {
    fixture_on(Arc::new(MemoryStore::new()), config, concurrency).await
}

async fn fixture_on(
    store: Arc<dyn RunStore>,
    config: EngineConfig,
    concurrency: Option<u32>,
) -> Fixture {
    let engine = Arc::new(RunEngine::new(store, config));
    let published = publish_workflow(&engine, concurrency).await;
    Fixture {
        engine,
        workflow_id: published.workflow_id,
        trigger_id: published.trigger_id,
        a: published.a,
        b: published.b,
        c: published.c,
    }
}

async fn trigger_workflow(engine: &RunEngine, workflow: &Published, body: Value) -> Enqueued {
    engine
        .create_work_order(
            workflow.workflow_id,
            RunOrigin::Trigger {
                trigger_id: workflow.trigger_id,
            },
            body,
        )
        .await
        .unwrap()
}

impl Fixture {
    async fn trigger(&self, body: Value) -> Enqueued {
        self.engine
            .create_work_order(
                self.workflow_id,
                RunOrigin::Trigger {
                    trigger_id: self.trigger_id,
                },
                body,
            )
            .await
            .unwrap()
    }

    async fn claim_and_start(&self, run_id: Uuid) -> RunRow {
        self.engine.claim_run(run_id, "worker-1").await.unwrap();
        self.engine.start_run(run_id).await.unwrap()
    }

    /// Execute `jobs` in order, feeding each output to the next job. The
    /// last job exits with `last_exit`, the others succeed.
    async fn execute(
        &self,
        run: &RunRow,
        jobs: &[Uuid],
        tag: &str,
        last_exit: ExitReason,
    ) -> Vec<StepRow> {
        let mut input = run.dataclip_id;
        let mut steps = Vec::new();
        for (i, &job_id) in jobs.iter().enumerate() {
            let step = self.engine.start_step(run.id, job_id, input).await.unwrap();
            let last = i + 1 == jobs.len();
            let (exit, error_type) = if last && last_exit != ExitReason::Success {
                (last_exit, Some("RuntimeError".to_owned()))
            } else {
                (ExitReason::Success, None)
            };
            let done = self
                .engine
                .complete_step(step.id, Some(json!({ "tag": tag, "job": i })), exit, error_type)
                .await
                .unwrap();
            input = done.output_dataclip_id.unwrap();
            steps.push(done);
        }
        steps
    }

    async fn work_order_state(&self, work_order_id: Uuid) -> WorkOrderState {
        self.engine
            .get_work_order_detail(work_order_id)
            .await
            .unwrap()
            .work_order
            .state
    }

    async fn active_runs(&self) -> Vec<RunRow> {
        self.engine
            .store()
            .list_runs_in_states(&RunState::ACTIVE, 100)
            .await
            .unwrap()
    }
}

// ============================================================
// End-to-end: trigger → claim → steps → success
// ============================================================

#[tokio::test]
async fn successful_run_marks_work_order_success() {
    let fx = fixture(EngineConfig::default(), None).await;
    let created = fx.trigger(json!({"patient": "p-1"})).await;
    assert_eq!(created.run.state, RunState::Pending);
    assert_eq!(created.admission, Admission::Permit);
    assert_eq!(fx.work_order_state(created.work_order.id).await, WorkOrderState::Pending);

    let claimed = fx.engine.claim("worker-1").await.unwrap().expect("a pending run");
    assert_eq!(claimed.id, created.run.id);
    assert_eq!(claimed.state, RunState::Claimed);
    assert_eq!(claimed.worker_id.as_deref(), Some("worker-1"));
    assert_eq!(fx.work_order_state(created.work_order.id).await, WorkOrderState::Running);

    let run = fx.engine.start_run(claimed.id).await.unwrap();
    assert_eq!(run.state, RunState::Started);

    let steps = fx.execute(&run, &[fx.a, fx.b], "e2e", ExitReason::Success).await;
    // B's input is A's output.
    assert_eq!(steps[1].input_dataclip_id, steps[0].output_dataclip_id.unwrap());
    let output = fx
        .engine
        .get_dataclip(steps[1].output_dataclip_id.unwrap())
        .await
        .unwrap();
    assert_eq!(output.kind, DataclipKind::StepResult);
    assert_eq!(output.body, Some(json!({"tag": "e2e", "job": 1})));

    let done = fx
        .engine
        .complete_run(run.id, ExitReason::Success, Some("ignored".into()))
        .await
        .unwrap();
    assert_eq!(done.state, RunState::Success);
    assert_eq!(done.error_type, None);
    assert!(done.finished_at.is_some());
    assert_eq!(fx.work_order_state(created.work_order.id).await, WorkOrderState::Success);

    let workflow = fx.engine.get_workflow(fx.workflow_id).await.unwrap();
    assert_eq!(workflow.running_count, 0);

    let detail = fx.engine.get_run_detail(run.id).await.unwrap();
    assert_eq!(detail.steps.len(), 2);
    assert!(detail.steps.iter().all(|s| s.cloned_from_run.is_none()));
}

#[tokio::test]
async fn failed_run_keeps_error_type() {
    let fx = fixture(EngineConfig::default(), None).await;
    let created = fx.trigger(json!({"patient": "p-2"})).await;
    let run = fx.claim_and_start(created.run.id).await;

    let done = fx
        .engine
        .complete_run(run.id, ExitReason::Fail, Some("TypeError".into()))
        .await
        .unwrap();
    assert_eq!(done.state, RunState::Failed);
    assert_eq!(done.exit_reason, Some(ExitReason::Fail));
    assert_eq!(done.error_type.as_deref(), Some("TypeError"));
    assert_eq!(fx.work_order_state(created.work_order.id).await, WorkOrderState::Failed);
}

// ============================================================
// Claiming
// ============================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_yield_exactly_one_winner() {
    let fx = fixture(EngineConfig::default(), None).await;
    let created = fx.trigger(json!({"patient": "race"})).await;
    let run_id = created.run.id;

    let attempts = (0..8).map(|i| {
        let engine = Arc::clone(&fx.engine);
        tokio::spawn(async move { engine.claim_run(run_id, &format!("worker-{i}")).await })
    });
    let results = futures::future::join_all(attempts).await;

    let mut winners = 0;
    let mut conflicts = 0;
    for result in results {
        match result.unwrap() {
            Ok(run) => {
                assert_eq!(run.state, RunState::Claimed);
                winners += 1;
            }
            Err(EngineError::ClaimConflict { state, .. }) => {
                assert_eq!(state, RunState::Claimed);
                conflicts += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(conflicts, 7);
    assert_eq!(fx.engine.get_workflow(fx.workflow_id).await.unwrap().running_count, 1);
}

#[tokio::test]
async fn starting_a_step_requires_a_started_run() {
    let fx = fixture(EngineConfig::default(), None).await;
    let created = fx.trigger(json!({"patient": "p-3"})).await;
    fx.engine.claim_run(created.run.id, "worker-1").await.unwrap();

    let err = fx
        .engine
        .start_step(created.run.id, fx.a, created.run.dataclip_id)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidStateTransition { from: RunState::Claimed, .. }
    ));

    fx.engine.start_run(created.run.id).await.unwrap();
    let err = fx
        .engine
        .start_step(created.run.id, Uuid::new_v4(), created.run.dataclip_id)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::JobNotInSnapshot { .. }));

    // Starting twice is not allowed either.
    let err = fx.engine.start_run(created.run.id).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidStateTransition { from: RunState::Started, .. }
    ));
}

// ============================================================
// Completion idempotency
// ============================================================

#[tokio::test]
async fn completing_a_terminal_run_changes_nothing() {
    let fx = fixture(EngineConfig::default(), None).await;
    let created = fx.trigger(json!({"patient": "p-4"})).await;
    let run = fx.claim_and_start(created.run.id).await;
    let done = fx
        .engine
        .complete_run(run.id, ExitReason::Success, None)
        .await
        .unwrap();

    let err = fx
        .engine
        .complete_run(run.id, ExitReason::Fail, Some("Late".into()))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::AlreadyTerminal { state: RunState::Success, .. }
    ));

    let after = fx.engine.get_run(run.id).await.unwrap();
    assert_eq!(after.state, RunState::Success);
    assert_eq!(after.finished_at, done.finished_at);
    assert_eq!(after.error_type, None);
}

#[tokio::test]
async fn completing_a_pending_run_is_rejected() {
    let fx = fixture(EngineConfig::default(), None).await;
    let created = fx.trigger(json!({"patient": "p-5"})).await;
    let err = fx
        .engine
        .complete_run(created.run.id, ExitReason::Success, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidStateTransition { from: RunState::Pending, .. }
    ));
    let err = fx
        .engine
        .complete_run(created.run.id, ExitReason::Lost, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));
}

#[tokio::test]
async fn repeated_step_completion_is_ignored() {
    let fx = fixture(EngineConfig::default(), None).await;
    let created = fx.trigger(json!({"patient": "p-6"})).await;
    let run = fx.claim_and_start(created.run.id).await;
    let step = fx
        .engine
        .start_step(run.id, fx.a, run.dataclip_id)
        .await
        .unwrap();

    let first = fx
        .engine
        .complete_step(step.id, Some(json!({"ok": true})), ExitReason::Success, None)
        .await
        .unwrap();
    let second = fx
        .engine
        .complete_step(step.id, Some(json!({"ok": false})), ExitReason::Fail, None)
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(second.exit_reason, Some(ExitReason::Success));
}

// ============================================================
// Kill
// ============================================================

#[tokio::test]
async fn killing_releases_the_slot_and_is_not_repeatable() {
    let fx = fixture(EngineConfig::default(), Some(1)).await;
    let first = fx.trigger(json!({"patient": "k-1"})).await;
    let second = fx.trigger(json!({"patient": "k-2"})).await;
    fx.claim_and_start(first.run.id).await;

    let killed = fx.engine.kill(first.run.id).await.unwrap();
    assert_eq!(killed.state, RunState::Killed);
    assert_eq!(killed.exit_reason, Some(ExitReason::Kill));
    assert_eq!(fx.work_order_state(first.work_order.id).await, WorkOrderState::Killed);

    let err = fx.engine.kill(first.run.id).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyTerminal { .. }));

    // The freed slot goes to the next run in line.
    let next = fx.engine.claim("worker-2").await.unwrap().unwrap();
    assert_eq!(next.id, second.run.id);

    // A pending run can be cancelled too.
    let third = fx.trigger(json!({"patient": "k-3"})).await;
    let killed = fx.engine.kill(third.run.id).await.unwrap();
    assert_eq!(killed.state, RunState::Killed);
    assert_eq!(fx.engine.get_workflow(fx.workflow_id).await.unwrap().running_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_reruns_settle_the_work_order() {
    for round in 0..20 {
        let fx = fixture(EngineConfig::default(), None).await;
        let created = fx.trigger(json!({ "patient": format!("o-{round}") })).await;
        let run = fx.claim_and_start(created.run.id).await;
        fx.execute(&run, &[fx.a, fx.b], "o", ExitReason::Fail).await;
        fx.engine
            .complete_run(run.id, ExitReason::Fail, Some("RuntimeError".into()))
            .await
            .unwrap();

        let second = fx.engine.rerun(run.id, fx.b).await.unwrap().run;
        let third = fx.engine.rerun(run.id, fx.b).await.unwrap().run;
        fx.claim_and_start(second.id).await;
        fx.claim_and_start(third.id).await;
        assert_eq!(fx.work_order_state(created.work_order.id).await, WorkOrderState::Running);

        let finishers = [second.id, third.id].map(|id| {
            let engine = Arc::clone(&fx.engine);
            tokio::spawn(async move { engine.complete_run(id, ExitReason::Success, None).await })
        });
        for finisher in finishers {
            finisher.await.unwrap().unwrap();
        }

        assert_eq!(
            fx.work_order_state(created.work_order.id).await,
            WorkOrderState::Success,
            "round {round}"
        );
    }
}

#[tokio::test]
async fn earlier_run_finishing_last_does_not_mask_the_latest() {
    let fx = fixture(EngineConfig::default(), None).await;
    let created = fx.trigger(json!({"patient": "o-late"})).await;
    let run = fx.claim_and_start(created.run.id).await;
    fx.execute(&run, &[fx.a, fx.b], "o", ExitReason::Fail).await;
    fx.engine
        .complete_run(run.id, ExitReason::Fail, Some("RuntimeError".into()))
        .await
        .unwrap();

    let second = fx.engine.rerun(run.id, fx.b).await.unwrap().run;
    let third = fx.engine.rerun(run.id, fx.b).await.unwrap().run;
    fx.claim_and_start(second.id).await;
    fx.claim_and_start(third.id).await;

    fx.engine
        .complete_run(third.id, ExitReason::Success, None)
        .await
        .unwrap();
    assert_eq!(fx.work_order_state(created.work_order.id).await, WorkOrderState::Running);
    fx.engine
        .complete_run(second.id, ExitReason::Fail, Some("RuntimeError".into()))
        .await
        .unwrap();
    assert_eq!(fx.work_order_state(created.work_order.id).await, WorkOrderState::Success);
}

// ============================================================
// Admission
// ============================================================

#[tokio::test]
async fn concurrency_of_one_runs_work_orders_one_at_a_time() {
    let fx = fixture(EngineConfig::default(), Some(1)).await;

    let created = futures::future::join_all(
        (0..3).map(|i| fx.trigger(json!({ "patient": format!("c-{i}") }))),
    )
    .await;
    let mut runs: Vec<RunRow> = created.into_iter().map(|e| e.run).collect();
    runs.sort_by_key(|r| r.position);

    for expected in &runs {
        let claimed = fx.engine.claim("worker-1").await.unwrap().unwrap();
        assert_eq!(claimed.id, expected.id, "runs are admitted in FIFO order");
        assert!(fx.engine.claim("worker-2").await.unwrap().is_none());

        let other = runs.iter().find(|r| r.id != expected.id).unwrap();
        if fx.engine.get_run(other.id).await.unwrap().state == RunState::Pending {
            let err = fx.engine.claim_run(other.id, "worker-3").await.unwrap_err();
            assert!(matches!(err, EngineError::AdmissionDenied { .. }));
        }

        fx.engine.start_run(claimed.id).await.unwrap();
        assert_eq!(fx.active_runs().await.len(), 1);
        let pending = fx
            .engine
            .store()
            .list_runs_in_states(&[RunState::Pending], 10)
            .await
            .unwrap();
        let claimed_at = runs.iter().position(|r| r.id == expected.id).unwrap();
        assert_eq!(pending.len(), runs.len() - 1 - claimed_at);

        fx.engine
            .complete_run(claimed.id, ExitReason::Success, None)
            .await
            .unwrap();
        assert!(fx.active_runs().await.is_empty());
    }
}

#[tokio::test]
async fn queued_work_order_reports_queued_admission() {
    let fx = fixture(EngineConfig::default(), Some(1)).await;
    let first = fx.trigger(json!({"patient": "q-1"})).await;
    assert_eq!(first.admission, Admission::Permit);
    fx.engine.claim("worker-1").await.unwrap().unwrap();

    let second = fx.trigger(json!({"patient": "q-2"})).await;
    assert_eq!(second.admission, Admission::Queued);
    assert_eq!(second.run.state, RunState::Pending);
}

#[tokio::test]
async fn saturated_queues_do_not_hide_a_free_workflow() {
    let config = EngineConfig {
        claim_scan_limit: 2,
        ..EngineConfig::default()
    };
    let fx = fixture(config, Some(1)).await;
    let first = fx.trigger(json!({"patient": "s-0"})).await;
    fx.claim_and_start(first.run.id).await;
    for i in 1..=10 {
        fx.trigger(json!({ "patient": format!("s-{i}") })).await;
    }

    // More saturated workflows than fit on one page of queue heads.
    for i in 0..4 {
        let busy = publish_workflow(&fx.engine, Some(1)).await;
        let running = trigger_workflow(&fx.engine, &busy, json!({ "busy": i })).await;
        trigger_workflow(&fx.engine, &busy, json!({ "busy": i, "queued": true })).await;
        fx.engine.claim_run(running.run.id, "worker-1").await.unwrap();
    }

    let free = publish_workflow(&fx.engine, None).await;
    let waiting = trigger_workflow(&fx.engine, &free, json!({"patient": "free"})).await;
    assert_eq!(waiting.admission, Admission::Permit);

    let claimed = fx
        .engine
        .claim("worker-2")
        .await
        .unwrap()
        .expect("the free workflow's run is claimable");
    assert_eq!(claimed.id, waiting.run.id);
    assert!(fx.engine.claim("worker-3").await.unwrap().is_none());
}

#[tokio::test]
async fn waiting_claimer_is_woken_by_a_release() {
    let fx = fixture(EngineConfig::default(), Some(1)).await;
    let first = fx.trigger(json!({"patient": "w-1"})).await;
    let second = fx.trigger(json!({"patient": "w-2"})).await;
    fx.claim_and_start(first.run.id).await;

    let engine = Arc::clone(&fx.engine);
    let waiter =
        tokio::spawn(async move { engine.claim_wait("worker-2", Duration::from_secs(5)).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    fx.engine
        .complete_run(first.run.id, ExitReason::Success, None)
        .await
        .unwrap();

    let claimed = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("waiter should wake")
        .unwrap()
        .unwrap()
        .expect("a run after release");
    assert_eq!(claimed.id, second.run.id);
}

#[tokio::test]
async fn claim_wait_times_out_when_nothing_is_pending() {
    let fx = fixture(EngineConfig::default(), None).await;
    let claimed = fx
        .engine
        .claim_wait("worker-1", Duration::from_millis(20))
        .await
        .unwrap();
    assert!(claimed.is_none());
}

// ============================================================
// Rerun planner
// ============================================================

#[tokio::test]
async fn rerun_clones_only_upstream_steps() {
    let fx = fixture(EngineConfig::default(), None).await;
    let created = fx.trigger(json!({"patient": "r-1"})).await;
    let run = fx.claim_and_start(created.run.id).await;
    let steps = fx.execute(&run, &[fx.a, fx.b, fx.c], "r-1", ExitReason::Fail).await;
    fx.engine
        .complete_run(run.id, ExitReason::Fail, Some("RuntimeError".into()))
        .await
        .unwrap();

    let rerun = fx.engine.rerun(run.id, fx.b).await.unwrap();
    assert_eq!(rerun.run.state, RunState::Pending);
    assert_eq!(rerun.run.work_order_id, created.work_order.id);
    assert_eq!(rerun.run.snapshot_id, run.snapshot_id);
    assert_eq!(rerun.run.starting_job_id, Some(fx.b));
    assert_eq!(rerun.run.starting_trigger_id, None);
    assert_eq!(rerun.run.dataclip_id, steps[1].input_dataclip_id);
    assert_eq!(rerun.work_order.state, WorkOrderState::Pending);

    let detail = fx.engine.get_run_detail(rerun.run.id).await.unwrap();
    assert_eq!(detail.steps.len(), 1);
    let cloned = &detail.steps[0];
    assert_eq!(cloned.step.id, steps[0].id);
    assert_eq!(cloned.step.job_id, fx.a);
    assert_eq!(cloned.step.run_id, run.id);
    assert_eq!(cloned.cloned_from_run, Some(run.id));

    // The source run still shows its own three steps.
    let source = fx.engine.get_run_detail(run.id).await.unwrap();
    assert_eq!(source.steps.len(), 3);

    let runs = fx.engine.get_work_order_detail(created.work_order.id).await.unwrap().runs;
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[1].id, rerun.run.id);
}

#[tokio::test]
async fn rerun_from_first_job_clones_nothing() {
    let fx = fixture(EngineConfig::default(), None).await;
    let created = fx.trigger(json!({"patient": "r-2"})).await;
    let run = fx.claim_and_start(created.run.id).await;
    fx.execute(&run, &[fx.a, fx.b], "r-2", ExitReason::Success).await;
    fx.engine
        .complete_run(run.id, ExitReason::Success, None)
        .await
        .unwrap();

    let rerun = fx.engine.rerun(run.id, fx.a).await.unwrap();
    assert_eq!(rerun.run.dataclip_id, created.run.dataclip_id);
    let detail = fx.engine.get_run_detail(rerun.run.id).await.unwrap();
    assert!(detail.steps.is_empty());
}

#[tokio::test]
async fn wiped_input_refuses_rerun() {
    let fx = fixture(EngineConfig::default(), None).await;
    let created = fx.trigger(json!({"patient": "r-3"})).await;
    let run = fx.claim_and_start(created.run.id).await;
    let steps = fx.execute(&run, &[fx.a, fx.b], "r-3", ExitReason::Fail).await;
    fx.engine
        .complete_run(run.id, ExitReason::Fail, None)
        .await
        .unwrap();

    assert_eq!(
        fx.engine.rerun_eligibility(run.id, fx.b, true).await.unwrap(),
        RerunEligibility::Eligible
    );

    fx.engine
        .wipe_dataclip(steps[1].input_dataclip_id)
        .await
        .unwrap();

    let err = fx.engine.rerun(run.id, fx.b).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::RerunIneligible { reason: IneligibleReason::InputWiped { .. }, .. }
    ));
    let runs = fx.engine.get_work_order_detail(created.work_order.id).await.unwrap().runs;
    assert_eq!(runs.len(), 1, "no run is created");

    // A's input is intact, so rerunning from A is still possible.
    fx.engine.rerun(run.id, fx.a).await.unwrap();

    let admin = fx.engine.rerun_eligibility(run.id, fx.b, true).await.unwrap();
    let member = fx.engine.rerun_eligibility(run.id, fx.b, false).await.unwrap();
    match (admin, member) {
        (
            RerunEligibility::Disabled { tooltip: admin_tip, reason },
            RerunEligibility::Disabled { tooltip: member_tip, .. },
        ) => {
            assert!(reason.contains("wiped"));
            assert_ne!(admin_tip, member_tip);
            assert!(member_tip.contains("administrator"));
        }
        other => panic!("expected disabled rerun, got {other:?}"),
    }
}

#[tokio::test]
async fn rerun_requires_a_finished_run_and_an_executed_job() {
    let fx = fixture(EngineConfig::default(), None).await;
    let created = fx.trigger(json!({"patient": "r-4"})).await;
    let run = fx.claim_and_start(created.run.id).await;
    fx.execute(&run, &[fx.a], "r-4", ExitReason::Success).await;

    let err = fx.engine.rerun(run.id, fx.a).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::RerunIneligible { reason: IneligibleReason::RunNotFinished { .. }, .. }
    ));

    fx.engine
        .complete_run(run.id, ExitReason::Fail, None)
        .await
        .unwrap();
    let err = fx.engine.rerun(run.id, fx.c).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::RerunIneligible { reason: IneligibleReason::NoStepForJob, .. }
    ));
}

#[tokio::test]
async fn rerun_from_start_reuses_work_order_input() {
    let fx = fixture(EngineConfig::default(), None).await;
    let created = fx.trigger(json!({"patient": "r-5"})).await;
    let run = fx.claim_and_start(created.run.id).await;
    fx.engine
        .complete_run(run.id, ExitReason::Crash, Some("OOM".into()))
        .await
        .unwrap();
    assert_eq!(fx.work_order_state(created.work_order.id).await, WorkOrderState::Crashed);

    let again = fx.engine.rerun_from_start(created.work_order.id).await.unwrap();
    assert_eq!(again.run.starting_trigger_id, Some(fx.trigger_id));
    assert_eq!(again.run.dataclip_id, created.work_order.dataclip_id);
    assert_eq!(again.work_order.state, WorkOrderState::Pending);
}

#[tokio::test]
async fn bulk_rerun_skips_work_orders_with_wiped_input() {
    let fx = fixture(EngineConfig::default(), None).await;

    let mut work_orders = Vec::new();
    let mut b_inputs = Vec::new();
    for i in 0..3 {
        let created = fx.trigger(json!({ "patient": format!("bulk-{i}") })).await;
        let run = fx.claim_and_start(created.run.id).await;
        let steps = fx
            .execute(&run, &[fx.a, fx.b], &format!("bulk-{i}"), ExitReason::Fail)
            .await;
        fx.engine
            .complete_run(run.id, ExitReason::Fail, None)
            .await
            .unwrap();
        work_orders.push(created.work_order.id);
        b_inputs.push(steps[1].input_dataclip_id);
    }
    fx.engine.wipe_dataclip(b_inputs[1]).await.unwrap();

    let summary = fx.engine.bulk_rerun(&work_orders, fx.b).await.unwrap();
    assert_eq!(summary.requested, 3);
    assert_eq!(summary.enqueued.len(), 2);
    assert_eq!(summary.skipped.len(), 1);
    assert_eq!(summary.skipped[0].work_order_id, work_orders[1]);
    assert_eq!(summary.message, "New runs enqueued for 2 workorders");

    let enqueued: Vec<Uuid> = summary.enqueued.iter().map(|e| e.work_order_id).collect();
    assert_eq!(enqueued, vec![work_orders[0], work_orders[2]]);
    let skipped_runs = fx.engine.get_work_order_detail(work_orders[1]).await.unwrap().runs;
    assert_eq!(skipped_runs.len(), 1);
}

// ============================================================
// Log stream
// ============================================================

#[tokio::test]
async fn logs_arrive_in_append_order_despite_skewed_timestamps() {
    let fx = fixture(EngineConfig::default(), None).await;
    let created = fx.trigger(json!({"patient": "log"})).await;
    let run = fx.claim_and_start(created.run.id).await;
    let step = fx
        .engine
        .start_step(run.id, fx.a, run.dataclip_id)
        .await
        .unwrap();

    let mut rx = fx.engine.logs().subscribe(run.id);
    let now = Utc::now();
    for i in 0..5i64 {
        // Each line claims to be older than the previous one.
        let timestamp = now - chrono::Duration::seconds(i * 10);
        let step_id = (i % 2 == 0).then_some(step.id);
        fx.engine
            .append_log(run.id, step_id, LogLevel::Info, format!("line {i}"), timestamp)
            .await
            .unwrap();
    }

    let mut received = Vec::new();
    for _ in 0..5 {
        received.push(rx.recv().await.unwrap());
    }
    let messages: Vec<&str> = received.iter().map(|l| l.message.as_str()).collect();
    assert_eq!(messages, ["line 0", "line 1", "line 2", "line 3", "line 4"]);
    assert!(received.windows(2).all(|w| w[0].sequence < w[1].sequence));

    let stored = fx.engine.list_logs(run.id, None).await.unwrap();
    assert_eq!(stored, received);
    let step_lines = fx.engine.list_logs(run.id, Some(step.id)).await.unwrap();
    assert_eq!(step_lines.len(), 3);
}

#[tokio::test]
async fn log_line_for_a_foreign_step_is_rejected() {
    let fx = fixture(EngineConfig::default(), None).await;
    let first = fx.trigger(json!({"patient": "f-1"})).await;
    let second = fx.trigger(json!({"patient": "f-2"})).await;
    let run = fx.claim_and_start(first.run.id).await;
    let step = fx
        .engine
        .start_step(run.id, fx.a, run.dataclip_id)
        .await
        .unwrap();

    let err = fx
        .engine
        .append_log(second.run.id, Some(step.id), LogLevel::Info, "x".into(), Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));
}

// ============================================================
// Lost-run detection
// ============================================================

#[tokio::test]
async fn lost_run_ignores_late_worker_reports() {
    let config = EngineConfig {
        lost_timeout: Duration::from_secs(60),
        ..EngineConfig::default()
    };
    let fx = fixture(config, Some(1)).await;
    let created = fx.trigger(json!({"patient": "lost"})).await;
    let run = fx.claim_and_start(created.run.id).await;
    let step = fx
        .engine
        .start_step(run.id, fx.a, run.dataclip_id)
        .await
        .unwrap();

    // Not stale yet.
    assert!(fx.engine.sweep_lost(Utc::now()).await.unwrap().is_empty());

    let marked = fx
        .engine
        .sweep_lost(Utc::now() + chrono::Duration::minutes(2))
        .await
        .unwrap();
    assert_eq!(marked, vec![run.id]);

    let lost = fx.engine.get_run(run.id).await.unwrap();
    assert_eq!(lost.state, RunState::Lost);
    assert_eq!(lost.exit_reason, Some(ExitReason::Lost));
    assert_eq!(lost.error_type, None);
    assert_eq!(fx.work_order_state(created.work_order.id).await, WorkOrderState::Lost);
    assert_eq!(fx.engine.get_workflow(fx.workflow_id).await.unwrap().running_count, 0);

    // The orphaned worker keeps reporting.
    let closed = fx
        .engine
        .complete_step(step.id, Some(json!({"late": true})), ExitReason::Success, None)
        .await
        .unwrap();
    assert!(closed.finished_at.is_some());
    let still_lost = fx
        .engine
        .complete_run(run.id, ExitReason::Success, None)
        .await
        .unwrap();
    assert_eq!(still_lost.state, RunState::Lost);
    assert_eq!(still_lost.finished_at, lost.finished_at);
    assert_eq!(fx.engine.get_run(run.id).await.unwrap().state, RunState::Lost);

    // Sweeping again finds nothing and never creates a retry.
    assert!(fx
        .engine
        .sweep_lost(Utc::now() + chrono::Duration::minutes(5))
        .await
        .unwrap()
        .is_empty());
    let runs = fx.engine.get_work_order_detail(created.work_order.id).await.unwrap().runs;
    assert_eq!(runs.len(), 1);

    let logs = fx.engine.list_logs(run.id, None).await.unwrap();
    assert!(logs.iter().any(|l| l.message.starts_with("Run lost")));
}

#[tokio::test]
async fn sweep_leaves_pending_runs_alone() {
    let config = EngineConfig {
        lost_timeout: Duration::from_secs(1),
        ..EngineConfig::default()
    };
    let fx = fixture(config, None).await;
    let created = fx.trigger(json!({"patient": "idle"})).await;
    let marked = fx
        .engine
        .sweep_lost(Utc::now() + chrono::Duration::hours(1))
        .await
        .unwrap();
    assert!(marked.is_empty());
    assert_eq!(
        fx.engine.get_run(created.run.id).await.unwrap().state,
        RunState::Pending
    );
}

#[tokio::test]
async fn background_sweeper_marks_stale_runs() {
    let config = EngineConfig {
        lost_timeout: Duration::ZERO,
        sweep_interval: Duration::from_millis(10),
        ..EngineConfig::default()
    };
    let fx = fixture(config, None).await;
    let created = fx.trigger(json!({"patient": "bg"})).await;
    fx.claim_and_start(created.run.id).await;

    let sweeper = LostRunSweeper::spawn(Arc::clone(&fx.engine));
    let mut state = RunState::Started;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        state = fx.engine.get_run(created.run.id).await.unwrap().state;
        if state == RunState::Lost {
            break;
        }
    }
    sweeper.shutdown().await;
    assert_eq!(state, RunState::Lost);
}

// ============================================================
// Bookkeeping when the log store fails
// ============================================================

mod log_outage {
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use db::models::{
        DataclipRow, LogLineRow, NewLogLine, NewRun, ProjectRow, RunRow, RunState, SnapshotRow,
        StepRow, WorkOrderRow, WorkflowRow,
    };
    use db::{
        ClaimOutcome, DbError, FinishOutcome, MemoryStore, RunStore, RunTransition,
        StepCompletion, TransitionOutcome,
    };
    use uuid::Uuid;

    /// A store whose log table rejects every write.
    #[derive(Default)]
    pub(super) struct LogOutage(MemoryStore);

    #[async_trait]
    impl RunStore for LogOutage {
        async fn upsert_project(&self, project: ProjectRow) -> Result<ProjectRow, DbError> {
            self.0.upsert_project(project).await
        }
        async fn get_project(&self, id: Uuid) -> Result<ProjectRow, DbError> {
            self.0.get_project(id).await
        }
        async fn upsert_workflow(&self, workflow: WorkflowRow) -> Result<WorkflowRow, DbError> {
            self.0.upsert_workflow(workflow).await
        }
        async fn get_workflow(&self, id: Uuid) -> Result<WorkflowRow, DbError> {
            self.0.get_workflow(id).await
        }
        async fn insert_snapshot(&self, snapshot: SnapshotRow) -> Result<SnapshotRow, DbError> {
            self.0.insert_snapshot(snapshot).await
        }
        async fn get_snapshot(&self, id: Uuid) -> Result<SnapshotRow, DbError> {
            self.0.get_snapshot(id).await
        }
        async fn find_snapshot(
            &self,
            workflow_id: Uuid,
            lock_version: i64,
        ) -> Result<Option<SnapshotRow>, DbError> {
            self.0.find_snapshot(workflow_id, lock_version).await
        }
        async fn insert_dataclip(&self, dataclip: DataclipRow) -> Result<DataclipRow, DbError> {
            self.0.insert_dataclip(dataclip).await
        }
        async fn get_dataclip(&self, id: Uuid) -> Result<DataclipRow, DbError> {
            self.0.get_dataclip(id).await
        }
        async fn wipe_dataclip(&self, id: Uuid, at: DateTime<Utc>) -> Result<DataclipRow, DbError> {
            self.0.wipe_dataclip(id, at).await
        }
        async fn insert_work_order(
            &self,
            work_order: WorkOrderRow,
            first_run: NewRun,
        ) -> Result<(WorkOrderRow, RunRow), DbError> {
            self.0.insert_work_order(work_order, first_run).await
        }
        async fn get_work_order(&self, id: Uuid) -> Result<WorkOrderRow, DbError> {
            self.0.get_work_order(id).await
        }
        async fn refresh_work_order_state(
            &self,
            id: Uuid,
            at: DateTime<Utc>,
        ) -> Result<WorkOrderRow, DbError> {
            self.0.refresh_work_order_state(id, at).await
        }
        async fn insert_run(&self, run: NewRun, cloned_steps: &[Uuid]) -> Result<RunRow, DbError> {
            self.0.insert_run(run, cloned_steps).await
        }
        async fn get_run(&self, id: Uuid) -> Result<RunRow, DbError> {
            self.0.get_run(id).await
        }
        async fn list_runs_for_work_order(
            &self,
            work_order_id: Uuid,
        ) -> Result<Vec<RunRow>, DbError> {
            self.0.list_runs_for_work_order(work_order_id).await
        }
        async fn list_runs_in_states(
            &self,
            states: &[RunState],
            limit: usize,
        ) -> Result<Vec<RunRow>, DbError> {
            self.0.list_runs_in_states(states, limit).await
        }
        async fn list_pending_heads(
            &self,
            after_position: i64,
            limit: usize,
        ) -> Result<Vec<RunRow>, DbError> {
            self.0.list_pending_heads(after_position, limit).await
        }
        async fn claim_run(
            &self,
            id: Uuid,
            worker_id: &str,
            at: DateTime<Utc>,
            fallback_cap: Option<u32>,
        ) -> Result<ClaimOutcome, DbError> {
            self.0.claim_run(id, worker_id, at, fallback_cap).await
        }
        async fn transition_run(
            &self,
            id: Uuid,
            transition: &RunTransition,
        ) -> Result<TransitionOutcome, DbError> {
            self.0.transition_run(id, transition).await
        }
        async fn touch_run(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), DbError> {
            self.0.touch_run(id, at).await
        }
        async fn insert_step(&self, step: StepRow) -> Result<StepRow, DbError> {
            self.0.insert_step(step).await
        }
        async fn get_step(&self, id: Uuid) -> Result<StepRow, DbError> {
            self.0.get_step(id).await
        }
        async fn finish_step(
            &self,
            id: Uuid,
            completion: StepCompletion,
        ) -> Result<FinishOutcome, DbError> {
            self.0.finish_step(id, completion).await
        }
        async fn list_run_steps(&self, run_id: Uuid) -> Result<Vec<StepRow>, DbError> {
            self.0.list_run_steps(run_id).await
        }
        async fn append_log(&self, _line: NewLogLine) -> Result<LogLineRow, DbError> {
            Err(DbError::corrupt("log_lines", "disk full"))
        }
        async fn list_logs(
            &self,
            run_id: Uuid,
            step_id: Option<Uuid>,
        ) -> Result<Vec<LogLineRow>, DbError> {
            self.0.list_logs(run_id, step_id).await
        }
    }
}

#[tokio::test]
async fn kill_settles_bookkeeping_when_logging_fails() {
    let store = Arc::new(log_outage::LogOutage::default());
    let fx = fixture_on(store, EngineConfig::default(), Some(1)).await;
    let first = fx.trigger(json!({"patient": "lk-1"})).await;
    let second = fx.trigger(json!({"patient": "lk-2"})).await;
    fx.claim_and_start(first.run.id).await;

    let engine = Arc::clone(&fx.engine);
    let waiter =
        tokio::spawn(async move { engine.claim_wait("worker-2", Duration::from_secs(5)).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let killed = fx.engine.kill(first.run.id).await.unwrap();
    assert_eq!(killed.state, RunState::Killed);
    assert_eq!(fx.work_order_state(first.work_order.id).await, WorkOrderState::Killed);

    let claimed = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("waiter should wake")
        .unwrap()
        .unwrap()
        .expect("the freed slot goes to the next run");
    assert_eq!(claimed.id, second.run.id);
}

#[tokio::test]
async fn sweep_marks_every_stale_run_when_logging_fails() {
    let config = EngineConfig {
        lost_timeout: Duration::from_secs(60),
        ..EngineConfig::default()
    };
    let store = Arc::new(log_outage::LogOutage::default());
    let fx = fixture_on(store, config, None).await;
    let mut created = Vec::new();
    for i in 0..3 {
        let enqueued = fx.trigger(json!({ "patient": format!("ls-{i}") })).await;
        fx.claim_and_start(enqueued.run.id).await;
        created.push(enqueued);
    }

    let mut marked = fx
        .engine
        .sweep_lost(Utc::now() + chrono::Duration::minutes(2))
        .await
        .unwrap();
    marked.sort();
    let mut expected: Vec<Uuid> = created.iter().map(|e| e.run.id).collect();
    expected.sort();
    assert_eq!(marked, expected);

    for enqueued in &created {
        assert_eq!(
            fx.work_order_state(enqueued.work_order.id).await,
            WorkOrderState::Lost
        );
    }
    assert_eq!(fx.engine.get_workflow(fx.workflow_id).await.unwrap().running_count, 0);
    assert!(fx.active_runs().await.is_empty());
}

// ============================================================
// Snapshots and ingress
// ============================================================

#[tokio::test]
async fn republishing_a_version_keeps_the_original_snapshot() {
    let fx = fixture(EngineConfig::default(), None).await;
    let original = fx.engine.current_snapshot(fx.workflow_id).await.unwrap();

    let mut edited = original.clone();
    edited.id = Uuid::new_v4();
    edited.graph.jobs[0].body = "changed".into();
    let stored = fx.engine.publish_snapshot(edited).await.unwrap();
    assert_eq!(stored, original);
}

#[tokio::test]
async fn runs_stay_pinned_to_their_snapshot() {
    let fx = fixture(EngineConfig::default(), None).await;
    let first = fx.trigger(json!({"patient": "pin-1"})).await;

    let mut workflow = fx.engine.get_workflow(fx.workflow_id).await.unwrap();
    let mut next = fx.engine.current_snapshot(fx.workflow_id).await.unwrap();
    workflow.lock_version = 2;
    fx.engine.upsert_workflow(workflow).await.unwrap();
    next.id = Uuid::new_v4();
    next.lock_version = 2;
    next.graph.jobs[0].body = "fn(state => state)".into();
    fx.engine.publish_snapshot(next.clone()).await.unwrap();

    let second = fx.trigger(json!({"patient": "pin-2"})).await;
    assert_ne!(first.run.snapshot_id, second.run.snapshot_id);
    assert_eq!(second.run.snapshot_id, next.id);
    let pinned = fx.engine.get_snapshot(first.run.snapshot_id).await.unwrap();
    assert_eq!(pinned.lock_version, 1);
}

#[tokio::test]
async fn disabled_trigger_and_manual_origin() {
    let fx = fixture(EngineConfig::default(), None).await;

    let mut workflow = fx.engine.get_workflow(fx.workflow_id).await.unwrap();
    let mut next = fx.engine.current_snapshot(fx.workflow_id).await.unwrap();
    workflow.lock_version = 2;
    fx.engine.upsert_workflow(workflow).await.unwrap();
    next.id = Uuid::new_v4();
    next.lock_version = 2;
    next.graph.triggers[0].enabled = false;
    fx.engine.publish_snapshot(next).await.unwrap();

    let err = fx
        .engine
        .create_work_order(
            fx.workflow_id,
            RunOrigin::Trigger {
                trigger_id: fx.trigger_id,
            },
            json!({}),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::TriggerDisabled(id) if id == fx.trigger_id));

    let manual = fx
        .engine
        .create_work_order(fx.workflow_id, RunOrigin::Manual { job_id: fx.b }, json!({"x": 1}))
        .await
        .unwrap();
    assert_eq!(manual.work_order.trigger_id, None);
    assert_eq!(manual.run.starting_job_id, Some(fx.b));
    let input = fx.engine.get_dataclip(manual.run.dataclip_id).await.unwrap();
    assert_eq!(input.kind, DataclipKind::SavedInput);
}
