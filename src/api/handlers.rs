//! Request handlers

use axum::{
    extract::{ConnectInfo, Request, State},
    http::request::Parts,
    response::{IntoResponse, Response},
    Json,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info_span, Instrument};
use uuid::Uuid;

use crate::gateway::health_check::HealthSummary;
use crate::gateway::load_balancer::RequestContext;
use crate::AppState;

/// Aggregated pool health, probed fresh on every call
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthSummary> {
    Json(state.health_manager.summary().await)
}

/// Forward any non-health request to a selected instance
pub async fn proxy(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let request_id = Uuid::new_v4();
    let span = info_span!(
        "proxy",
        %request_id,
        method = %request.method(),
        path = %request.uri().path(),
    );

    async move {
        let (parts, body) = request.into_parts();

        let body = match state.proxy.read_body(body).await {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "Rejected request body");
                return e.into_response();
            }
        };

        let ctx = request_context(&state, &parts);
        let instance = match state.load_balancer.select_instance(&ctx) {
            Ok(instance) => instance,
            Err(e) => {
                error!(error = %e, "No instance to route to");
                return e.into_response();
            }
        };

        match state.proxy.forward(&instance, &parts, body).await {
            Ok(response) => response,
            Err(e) => {
                error!(instance = %instance, error = %e, "Proxy request failed");
                e.into_response()
            }
        }
    }
    .instrument(span)
    .await
}

fn request_context(state: &AppState, parts: &Parts) -> RequestContext {
    let client_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let session_key = parts
        .headers
        .get(state.settings.balancer.session_header.as_str())
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    RequestContext::new(client_addr, session_key)
}
