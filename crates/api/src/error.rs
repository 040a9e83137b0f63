//! HTTP mapping of engine errors.
//!
//! Every error body is `{"kind": ..., "message": ...}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use engine::EngineError;
use serde_json::json;
use tracing::{debug, error};

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", message)
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let (status, kind) = match &e {
            EngineError::NotFound { .. } | EngineError::SnapshotMissing { .. } => {
                (StatusCode::NOT_FOUND, "not_found")
            }
            EngineError::InvalidStateTransition { .. } => {
                (StatusCode::CONFLICT, "invalid_state_transition")
            }
            EngineError::AlreadyTerminal { .. } => (StatusCode::CONFLICT, "already_terminal"),
            EngineError::ClaimConflict { .. } => (StatusCode::CONFLICT, "claim_conflict"),
            EngineError::AdmissionDenied { .. } => (StatusCode::CONFLICT, "queued"),
            EngineError::RerunIneligible { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "rerun_ineligible")
            }
            EngineError::DuplicateNodeId(_)
            | EngineError::UnknownNodeReference { .. }
            | EngineError::InvalidEdge { .. }
            | EngineError::CycleDetected => (StatusCode::BAD_REQUEST, "invalid_graph"),
            EngineError::TriggerDisabled(_) => (StatusCode::BAD_REQUEST, "trigger_disabled"),
            EngineError::JobNotInSnapshot { .. } | EngineError::InvalidRequest(_) => {
                (StatusCode::BAD_REQUEST, "invalid_request")
            }
            EngineError::Database(_) | EngineError::Serialization(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        Self::new(status, kind, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(kind = self.kind, "{}", self.message);
        } else {
            debug!(kind = self.kind, status = %self.status, "{}", self.message);
        }
        // Internal details stay in the log.
        let message = if self.status.is_server_error() {
            "internal server error".to_owned()
        } else {
            self.message
        };
        (
            self.status,
            Json(json!({ "kind": self.kind, "message": message })),
        )
            .into_response()
    }
}
