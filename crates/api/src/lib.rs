//! `api` crate — HTTP surface of the run engine.
//!
//! Exposes, under `/api/v1`:
//!   PUT    /projects/{id}                     editor persistence
//!   PUT    /workflows/{id}
//!   GET    /workflows/{id}
//!   GET    /workflows/{id}/concurrency
//!   POST   /workflows/{id}/snapshots
//!   GET    /snapshots/{id}
//!   POST   /workflows/{id}/triggers/{trigger_id}  trigger ingress
//!   POST   /workflows/{id}/run                     manual run
//!   POST   /worker/claim                      worker protocol
//!   POST   /runs/{id}/claim | start | steps | logs | heartbeat | complete
//!   POST   /steps/{id}/complete
//!   GET    /runs/{id}                         UI
//!   GET    /runs/{id}/logs[/stream]
//!   POST   /runs/{id}/kill | rerun
//!   GET    /runs/{id}/rerun_eligibility
//!   GET    /work_orders/{id}
//!   POST   /work_orders/{id}/rerun
//!   POST   /reruns                            bulk rerun
//!   POST   /dataclips, GET /dataclips/{id}, DELETE /dataclips/{id}/body

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use engine::RunEngine;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

pub mod error;
pub mod handlers;

pub use error::ApiError;

use handlers::{dataclips, runs, webhooks, work_orders, worker, workflows};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<RunEngine>,
}

pub fn router(engine: Arc<RunEngine>) -> Router {
    let api = Router::new()
        // editor persistence
        .route("/projects/:id", put(workflows::upsert_project))
        .route(
            "/workflows/:id",
            put(workflows::upsert_workflow).get(workflows::get_workflow),
        )
        .route("/workflows/:id/concurrency", get(workflows::concurrency))
        .route("/workflows/:id/snapshots", post(workflows::publish_snapshot))
        .route("/snapshots/:id", get(workflows::get_snapshot))
        // ingress
        .route(
            "/workflows/:id/triggers/:trigger_id",
            post(webhooks::handle_trigger),
        )
        .route("/workflows/:id/run", post(workflows::manual_run))
        // worker protocol
        .route("/worker/claim", post(worker::claim_next))
        .route("/runs/:id/claim", post(worker::claim_run))
        .route("/runs/:id/start", post(worker::start_run))
        .route("/runs/:id/steps", post(worker::start_step))
        .route("/steps/:id/complete", post(worker::complete_step))
        .route(
            "/runs/:id/logs",
            post(worker::append_log).get(runs::list_logs),
        )
        .route("/runs/:id/heartbeat", post(worker::heartbeat))
        .route("/runs/:id/complete", post(worker::complete_run))
        // UI
        .route("/runs/:id", get(runs::get_run))
        .route("/runs/:id/logs/stream", get(runs::stream_logs))
        .route("/runs/:id/kill", post(runs::kill))
        .route("/runs/:id/rerun", post(runs::rerun))
        .route("/runs/:id/rerun_eligibility", get(runs::rerun_eligibility))
        .route("/work_orders/:id", get(work_orders::get_work_order))
        .route("/work_orders/:id/rerun", post(work_orders::rerun_from_start))
        .route("/reruns", post(work_orders::bulk_rerun))
        // dataclip lifecycle
        .route("/dataclips", post(dataclips::save))
        .route("/dataclips/:id", get(dataclips::get))
        .route("/dataclips/:id/body", delete(dataclips::wipe))
        .with_state(AppState { engine });

    Router::new()
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Serve the API on `bind` until `shutdown` resolves.
pub async fn serve(
    bind: &str,
    engine: Arc<RunEngine>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "API listening");
    axum::serve(listener, router(engine))
        .with_graceful_shutdown(shutdown)
        .await
}
