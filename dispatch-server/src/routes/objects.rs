//! Signed reads of objects held by the local store.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Router};
use chrono::Utc;
use serde::Deserialize;

use crate::error::{ApiError, Result};
use crate::store::ObjectStore;
use crate::AppState;

#[derive(Deserialize)]
struct SignedQuery {
    expires: i64,
    signature: String,
}

fn content_type(key: &str) -> &'static str {
    let lower = key.to_ascii_lowercase();
    if lower.ends_with(".png") {
        "image/png"
    } else if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg"
    } else {
        "application/octet-stream"
    }
}

async fn get_object(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    query: Option<Query<SignedQuery>>,
) -> Result<Response> {
    let objects = state
        .objects
        .as_ref()
        .ok_or_else(|| ApiError::NotFound("No local object store configured".to_string()))?;
    let Some(Query(query)) = query else {
        return Err(ApiError::Forbidden("Missing signature".to_string()));
    };

    objects
        .signer()
        .verify(&key, query.expires, &query.signature, Utc::now().timestamp())?;

    let data = objects.get(&key).await?;
    Ok(([(header::CONTENT_TYPE, content_type(&key))], data).into_response())
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/objects/*key", get(get_object))
}
