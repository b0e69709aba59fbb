//! HTTP API of the algorithm runner.

pub mod health;
pub mod infer;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the full application router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(infer::router())
        .merge(health::router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
