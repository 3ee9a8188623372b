use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};

use flowline_core::{FlowlineError, StartID};
use flowline_queue::Queue;
use flowline_starts::{create_start, FlowStart};
use flowline_store::Store;

/// Shared application state for API handlers.
pub struct AppState {
    pub store: Store,
    pub queue: Queue,
}

/// Build the Axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/starts", post(create_start_handler))
        .route("/api/starts/:id", get(start_status))
        .with_state(state)
}

/// Health check endpoint.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "flowline",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Create a flow start. Validation failures are synchronous 400s; everything
/// downstream is asynchronous and observable via status polling.
async fn create_start_handler(
    State(state): State<Arc<AppState>>,
    Json(start): Json<FlowStart>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match create_start(&state.store, &state.queue, start).await {
        Ok(id) => Ok(Json(json!({ "id": id, "status": "P" }))),
        Err(FlowlineError::Validation(message)) => {
            Err((StatusCode::BAD_REQUEST, Json(json!({ "error": message }))))
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to create start");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal error" })),
            ))
        }
    }
}

/// Report a start's status and resolved contact count.
async fn start_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, StatusCode> {
    match state.store.start_status(StartID(id)) {
        Ok(Some(info)) => Ok(Json(json!({
            "id": id,
            "status": info.status,
            "contact_count": info.contact_count,
        }))),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!(error = %e, "failed to load start status");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
