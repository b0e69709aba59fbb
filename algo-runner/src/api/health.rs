//! Health and stats endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use dispatch_common::ServiceStats;
use serde_json::{json, Value};

use crate::state::AppState;

/// GET /health
async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service_id": state.config.service.id,
        "name": state.config.service_name(),
        "version": state.config.service.version,
        "task_types": state.config.service.task_types,
        "detector": state.detector.name(),
    }))
}

/// GET /stats - the same counters sent with heartbeats.
async fn stats(State(state): State<Arc<AppState>>) -> Json<ServiceStats> {
    Json(state.stats.snapshot())
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
}
