//! Inference endpoint called by the dispatcher.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};

use dispatch_common::{InferenceRequest, InferenceResponse};

use crate::detector::Detection;
use crate::error::{Error, Result};
use crate::state::AppState;

/// POST /infer
///
/// A malformed body is rejected with 400. Every other failure answers 200 with
/// `success: false` so the dispatcher records it as a failed inference.
async fn infer(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<InferenceRequest>, JsonRejection>,
) -> Result<Json<InferenceResponse>> {
    let Json(request) = payload.map_err(|e| Error::InvalidRequest(e.body_text()))?;
    let started = Instant::now();

    match run(&state, &request).await {
        Ok((detection, inference_ms)) => {
            let total_ms = started.elapsed().as_secs_f64() * 1000.0;
            state.stats.record(inference_ms, total_ms);
            tracing::info!(
                "Inference for {} ({}) took {:.1}ms, {:.1}ms total",
                request.task_id,
                request.task_type,
                inference_ms,
                total_ms
            );
            Ok(Json(InferenceResponse {
                success: true,
                result: detection.result,
                confidence: detection.confidence,
                inference_time_ms: inference_ms,
                error: None,
            }))
        }
        Err(e) => {
            tracing::warn!("Inference for {} failed: {}", request.image_path, e);
            Ok(Json(InferenceResponse::failure(e.to_string())))
        }
    }
}

async fn run(
    state: &AppState,
    request: &InferenceRequest,
) -> Result<(Detection, f64)> {
    let image = fetch_image(state, &request.image_url).await?;

    let started = Instant::now();
    let detection = state.detector.detect(&image, request).await?;
    Ok((detection, started.elapsed().as_secs_f64() * 1000.0))
}

async fn fetch_image(state: &AppState, url: &str) -> Result<Vec<u8>> {
    let limit = state.config.detector.max_image_bytes;

    let response = state
        .http_client
        .get(url)
        .send()
        .await
        .map_err(|e| Error::ImageFetch(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::ImageFetch(format!("image server returned {}", status)));
    }
    if let Some(length) = response.content_length() {
        if length as usize > limit {
            return Err(Error::ImageTooLarge(length as usize));
        }
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| Error::ImageFetch(e.to_string()))?;
    if bytes.len() > limit {
        return Err(Error::ImageTooLarge(bytes.len()));
    }
    Ok(bytes.to_vec())
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/infer", post(infer))
}
