//! HTTP handlers.
//!
//! The webhook transports live in [`crate::webhook::handler`]; this module
//! adds the operational endpoints and assembles the full application router.

pub mod status;

use std::sync::Arc;

use axum::middleware::from_fn_with_state;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::webhook::{webhook_router, WebhookState};

pub use status::{
    health_handler, metrics_handler, readiness_handler, status_handler, status_router,
    track_requests, AppState, HealthResponse, LatencyHistogram, LatencyMetrics, StatusResponse,
    WebhookCounters, REQUEST_ID_HEADER,
};

/// Full application: webhook transport, status endpoints, request tracking
/// and HTTP tracing.
pub fn app_router(webhook: Arc<WebhookState>, status: Arc<AppState>) -> Router {
    status_router(status.clone())
        .merge(webhook_router(webhook))
        .layer(from_fn_with_state(status, track_requests))
        .layer(TraceLayer::new_for_http())
}
