//! Router construction

use axum::{routing::any, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::api::handlers::{health, proxy};
use crate::AppState;

/// `/health` goes to the aggregator, every other path to the proxy engine.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", any(health))
        .fallback(proxy)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
