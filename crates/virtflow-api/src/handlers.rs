//! REST API handlers.
//!
//! Submission goes through the `Submitter`; status reads go straight to
//! the status store behind it. Every response uses the same JSON envelope.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;
use tracing::{debug, warn};

use virtflow_core::{Node, NodeName, SchedulingRequest, TaskId, TaskStatus};
use virtflow_scheduler::SchedulerError;
use virtflow_state::StatusRecord;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

/// HTTP status for a scheduler error at the API boundary.
fn status_for(err: &SchedulerError) -> StatusCode {
    match err {
        SchedulerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        SchedulerError::QueuePublish(_) | SchedulerError::PublishTimeout(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ── Scheduling ─────────────────────────────────────────────────

/// Status of one task as reported to callers.
#[derive(Debug, Serialize)]
pub struct TaskStatusView {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub result_node: Option<NodeName>,
    pub retry_count: u32,
    pub updated_at: u64,
}

impl From<StatusRecord> for TaskStatusView {
    fn from(record: StatusRecord) -> Self {
        Self {
            task_id: record.task_id,
            status: record.status,
            result_node: record.node,
            retry_count: record.retry_count,
            updated_at: record.updated_at,
        }
    }
}

/// POST /api/v1/schedule
pub async fn submit_task(
    State(state): State<ApiState>,
    payload: Result<Json<SchedulingRequest>, JsonRejection>,
) -> impl IntoResponse {
    let Json(request) = match payload {
        Ok(json) => json,
        Err(rejection) => {
            debug!(error = %rejection, "rejected schedule payload");
            return error_response(&rejection.body_text(), StatusCode::BAD_REQUEST).into_response();
        }
    };

    match state.submitter.submit(request).await {
        Ok(receipt) => (StatusCode::ACCEPTED, ApiResponse::ok(receipt)).into_response(),
        Err(e) => {
            let status = status_for(&e);
            if status != StatusCode::BAD_REQUEST {
                warn!(error = %e, "task submission failed");
            }
            error_response(&e.to_string(), status).into_response()
        }
    }
}

/// GET /api/v1/schedule/{task_id}
pub async fn get_task_status(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
) -> impl IntoResponse {
    match state.submitter.status(&task_id) {
        Ok(Some(record)) => ApiResponse::ok(TaskStatusView::from(record)).into_response(),
        Ok(None) => error_response("task not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => error_response(&e.to_string(), status_for(&e)).into_response(),
    }
}

// ── Nodes ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct InventoryView {
    pub generation: u64,
    pub captured_at: u64,
    pub nodes: Vec<Node>,
}

/// GET /api/v1/nodes
pub async fn list_nodes(State(state): State<ApiState>) -> impl IntoResponse {
    let snapshot = state.inventory.snapshot();
    ApiResponse::ok(InventoryView {
        generation: snapshot.generation,
        captured_at: snapshot.captured_at,
        nodes: snapshot.nodes().to_vec(),
    })
}

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    ApiResponse::ok("ok")
}
