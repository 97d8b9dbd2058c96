pub mod errors;
pub mod http;

use crate::pipeline::Pipeline;
use axum::routing::{get, post};
use axum::{Extension, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn router(pipeline: Arc<Pipeline>) -> Router {
    Router::new()
        .route("/", post(http::proxy_rpc))
        .route("/health", get(http::health))
        .route("/cache/stats", get(http::cache_stats))
        .route("/cache/flush", post(http::cache_flush))
        .fallback(errors::handler_404)
        .layer(Extension(pipeline))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
