//! virtflow-api — REST API for virtflow.
//!
//! A thin layer over the submission and status-query boundaries. Placement
//! itself happens asynchronously in the worker pool; submission only
//! acknowledges that a task is queued.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/schedule` | Submit a placement request |
//! | GET | `/api/v1/schedule/{task_id}` | Get task status |
//! | GET | `/api/v1/nodes` | Current inventory snapshot |
//! | GET | `/healthz` | Liveness |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use virtflow_scheduler::{NodeInventory, Submitter};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub submitter: Submitter,
    pub inventory: Arc<NodeInventory>,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/schedule", post(handlers::submit_task))
        .route("/schedule/{task_id}", get(handlers::get_task_status))
        .route("/nodes", get(handlers::list_nodes))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
}
