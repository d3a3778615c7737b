//! HTTP router and handlers

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, warn};

use super::pipeline::Pipeline;
use super::request::{InboundRequest, has_routing_metadata, session_cookie};
use crate::config_reload::LiveConfig;

/// Shared application state
pub struct AppState {
    /// Route-service pipeline
    pub pipeline: Pipeline,
    /// Live configuration
    pub live_config: Arc<LiveConfig>,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/auth/message", get(auth_message_handler))
        .fallback(not_found_handler)
        // Route-service requests never reach the local routes
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            route_service_middleware,
        ))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Sends requests carrying routing metadata through the pipeline
pub async fn route_service_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !has_routing_metadata(request.headers()) {
        return next.run(request).await;
    }

    let config = state.live_config.get();
    let inbound = match InboundRequest::from_request(
        request,
        &config.session.cookie_name,
        config.server.max_body_size,
    )
    .await
    {
        Ok(inbound) => inbound,
        Err(e) => {
            warn!(error = %e, "Rejected unreadable request");
            return (e.status_code(), e.to_string()).into_response();
        }
    };

    state.pipeline.handle(&inbound).await
}

/// GET /health
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /auth/message - returns and clears the caller's last authentication failure
async fn auth_message_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let cookie_name = state.live_config.get().session.cookie_name.clone();
    let message = session_cookie(&headers, &cookie_name)
        .and_then(|id| state.pipeline.recorder().take_message(&id));

    match message {
        Some(message) => Json(json!({ "message": message })).into_response(),
        None => {
            debug!("No authentication message for caller");
            StatusCode::NO_CONTENT.into_response()
        }
    }
}

/// Requests without routing metadata for unknown paths
async fn not_found_handler() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "Not a route-service request: X-CF-Forwarded-Url, X-CF-Proxy-Metadata and X-CF-Proxy-Signature are missing"
        })),
    )
}
