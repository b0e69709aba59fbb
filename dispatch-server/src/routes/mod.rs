pub mod analysis;
pub mod health;
pub mod objects;

use std::sync::Arc;

use axum::{middleware, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use dispatch_common::API_PREFIX;

use crate::logging::request_logger;
use crate::AppState;

/// Build the full HTTP application.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .nest(API_PREFIX, analysis::router())
        .merge(health::router())
        .merge(objects::router())
        .layer(middleware::from_fn(request_logger))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
