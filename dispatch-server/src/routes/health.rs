use std::sync::Arc;

use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::producer::ProducerStatus;
use crate::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    registered_services: usize,
    /// `None` until the pipeline is running.
    producer: Option<ProducerStatus>,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let producer = state.dispatch().ok().map(|d| d.producer.status());
    let status = match &producer {
        Some(status) if !status.is_healthy() => "degraded",
        _ => "ok",
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        registered_services: state.registry.list_instances().await.len(),
        producer,
    })
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health))
}
