//! Control-plane endpoints for algorithm services and operators.

use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use dispatch_common::{AlertRecord, HeartbeatRequest, RegisterResponse, ServiceRegistration};

use crate::dispatch::{DispatchStats, InstanceKey, RegistryError, SystemAlert};
use crate::error::{ApiError, Result};
use crate::producer::ProducerStatus;
use crate::AppState;

const DEFAULT_ALERT_LIMIT: usize = 50;
const MAX_ALERT_LIMIT: usize = 500;

async fn register(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<ServiceRegistration>, JsonRejection>,
) -> Result<Json<RegisterResponse>> {
    let Json(registration) = payload.map_err(|e| ApiError::Validation(e.body_text()))?;
    let instance = state.registry.register(registration).await?;
    Ok(Json(RegisterResponse {
        ok: true,
        service_id: instance.service_id,
    }))
}

async fn unregister(
    State(state): State<Arc<AppState>>,
    Path(service_id): Path<String>,
) -> Result<Json<Value>> {
    let removed = state.registry.unregister(&service_id).await?;
    Ok(Json(json!({ "ok": true, "removed": removed.len() })))
}

/// The path segment may be a service id or an endpoint.
async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<HeartbeatRequest>>,
) -> Result<Json<Value>> {
    let stats = body.and_then(|Json(req)| req.stats());

    let matched = match state
        .registry
        .heartbeat(InstanceKey::ServiceId(&id), stats.clone())
        .await
    {
        Err(RegistryError::NotFound(_)) => {
            state
                .registry
                .heartbeat(InstanceKey::Endpoint(&id), stats)
                .await?
        }
        other => other?,
    };

    Ok(Json(json!({ "ok": true, "matched": matched })))
}

async fn services(State(state): State<Arc<AppState>>) -> Json<Value> {
    let services = state.registry.list_instances().await;
    Json(json!({ "total": services.len(), "services": services }))
}

async fn load_balance(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "categories": state.registry.load_balance_info().await }))
}

async fn clear_all(State(state): State<Arc<AppState>>) -> Json<Value> {
    let cleared = state.registry.clear_all().await;
    tracing::warn!("Cleared {} algorithm instances", cleared);
    Json(json!({ "ok": true, "cleared": cleared }))
}

#[derive(Serialize)]
struct StatsResponse {
    #[serde(flatten)]
    stats: DispatchStats,
    active_inferences: usize,
    max_concurrent: usize,
    producer_healthy: bool,
    producer_status: ProducerStatus,
}

async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<StatsResponse>> {
    let dispatch = state.dispatch()?;
    let producer_status = dispatch.producer.status();
    Ok(Json(StatsResponse {
        stats: dispatch.pipeline.stats().await,
        active_inferences: dispatch.pipeline.scheduler.active_inferences(),
        max_concurrent: dispatch.pipeline.scheduler.max_concurrent(),
        producer_healthy: producer_status.is_healthy(),
        producer_status,
    }))
}

async fn reset_queue(State(state): State<Arc<AppState>>) -> Result<Json<Value>> {
    let cleared = state.dispatch()?.pipeline.queue.clear().await;
    tracing::info!("Queue reset, {} images cleared", cleared);
    Ok(Json(json!({ "ok": true, "cleared": cleared })))
}

async fn reset_stats(State(state): State<Arc<AppState>>) -> Result<Json<Value>> {
    state.dispatch()?.pipeline.monitor.reset();
    tracing::info!("Performance stats reset");
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
struct SamplingQuery {
    frame_interval_ms: f64,
}

async fn sampling_rate(
    State(state): State<Arc<AppState>>,
    query: std::result::Result<Query<SamplingQuery>, QueryRejection>,
) -> Result<Json<Value>> {
    let Query(query) = query.map_err(|e| ApiError::Validation(e.body_text()))?;
    if query.frame_interval_ms.is_nan() || query.frame_interval_ms <= 0.0 {
        return Err(ApiError::Validation(
            "frame_interval_ms must be positive".to_string(),
        ));
    }

    let monitor = &state.dispatch()?.pipeline.monitor;
    Ok(Json(json!({
        "frame_interval_ms": query.frame_interval_ms,
        "sampling_rate": monitor.calculate_sampling_rate(query.frame_interval_ms),
        "avg_inference_ms": monitor.avg_inference_ms(),
    })))
}

#[derive(Deserialize)]
struct AlertsQuery {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct AlertsResponse {
    alerts: Vec<AlertRecord>,
}

async fn alerts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AlertsQuery>,
) -> Result<Json<AlertsResponse>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_ALERT_LIMIT)
        .clamp(1, MAX_ALERT_LIMIT);
    let alerts = state
        .dispatch()?
        .alert_store
        .recent(limit)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(AlertsResponse { alerts }))
}

#[derive(Serialize)]
struct SystemAlertsResponse {
    alerts: Vec<SystemAlert>,
}

async fn system_alerts(State(state): State<Arc<AppState>>) -> Result<Json<SystemAlertsResponse>> {
    let alerts = state.dispatch()?.system_alerts.recent().await;
    Ok(Json(SystemAlertsResponse { alerts }))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/register", post(register))
        .route("/unregister/:service_id", delete(unregister))
        .route("/heartbeat/:id", post(heartbeat))
        .route("/services", get(services))
        .route("/load_balance", get(load_balance))
        .route("/clear_all", post(clear_all))
        .route("/stats", get(stats))
        .route("/stats/reset", post(reset_stats))
        .route("/queue/reset", post(reset_queue))
        .route("/sampling_rate", get(sampling_rate))
        .route("/alerts", get(alerts))
        .route("/system_alerts", get(system_alerts))
}
