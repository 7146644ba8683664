//! Status and health check handlers.
//!
//! This module provides HTTP endpoints for monitoring the webhook service:
//! - `/health` - Simple liveness check
//! - `/ready` - Readiness (Kit connected, at least one tenant configured)
//! - `/status` - Pipeline counters, subscriber totals and request latency
//! - `/metrics` - Prometheus text format
//!
//! # Architecture
//!
//! ```text
//! HTTP Request ──> track_requests ──> Axum Router ──> status_handler ──> AppState
//!                        │                                  │               │
//!                        ▼                                  ▼               ▼
//!                LatencyHistogram                   StatusResponse   global_metrics()
//!                                                           │        + SubscriberStore
//!                                                           ▼
//!                                                     JSON Response
//! ```
//!
//! # Example Response
//!
//! ```json
//! {
//!   "version": "0.1.0",
//!   "name": "freemkit",
//!   "uptime_seconds": 3600,
//!   "webhooks": {
//!     "received": 120,
//!     "queued": 100,
//!     "duplicates": 4,
//!     "rejected": 16,
//!     "processed": 98,
//!     "retries": 3,
//!     "dropped": 1,
//!     "pending": 1
//!   },
//!   "subscribers": { "active": 97, "inactive": 2 },
//!   "latency": { "p50_ms": 2.1, "p95_ms": 8.4, "p99_ms": 15.0, "total_requests": 120, "mean_ms": 3.0, "max_ms": 21.3 },
//!   "status": "running",
//!   "timestamp": "2026-01-01T12:00:00Z"
//! }
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use hdrhistogram::Histogram;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::metrics::{global_metrics, Metrics};
use crate::store::SubscriberStore;

/// Server version from Cargo.toml
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Server name from Cargo.toml
pub const SERVER_NAME: &str = env!("CARGO_PKG_NAME");

// ============================================================================
// Response Types
// ============================================================================

/// Health check response for simple liveness probes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Health status
    pub status: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "healthy".to_string(),
        }
    }
}

/// Readiness response with the failing checks, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    /// "ready" or "not_ready"
    pub status: String,
    /// Human readable reasons the service is not ready
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub problems: Vec<String>,
}

/// Detailed service status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Server version (from Cargo.toml)
    pub version: String,

    /// Server name
    pub name: String,

    /// Server uptime in seconds
    pub uptime_seconds: u64,

    /// Pipeline counters
    pub webhooks: WebhookCounters,

    /// Subscriber totals by status; empty when the store is unavailable
    pub subscribers: BTreeMap<String, usize>,

    /// Request latency statistics (percentiles)
    pub latency: LatencyMetrics,

    /// Server status (always "running" if responding)
    pub status: String,

    /// RFC 3339 timestamp of when status was generated
    pub timestamp: String,
}

/// Snapshot of the pipeline counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookCounters {
    /// Webhook requests received
    pub received: u64,
    /// Accepted and stored
    pub queued: u64,
    /// Suppressed redeliveries
    pub duplicates: u64,
    /// Rejected before queuing
    pub rejected: u64,
    /// Successfully processed
    pub processed: u64,
    /// Failed runs that were rescheduled
    pub retries: u64,
    /// Given up after the last attempt
    pub dropped: u64,
    /// Currently waiting in the queue
    pub pending: u64,
}

impl WebhookCounters {
    /// Read the counters from a metrics collector
    pub fn from_metrics(metrics: &Metrics) -> Self {
        Self {
            received: metrics.requests_total.load(Ordering::Relaxed),
            queued: metrics.queued_total.load(Ordering::Relaxed),
            duplicates: metrics.duplicates_total.load(Ordering::Relaxed),
            rejected: metrics.rejected_total.load(Ordering::Relaxed),
            processed: metrics.processed_total.load(Ordering::Relaxed),
            retries: metrics.retries_total.load(Ordering::Relaxed),
            dropped: metrics.dropped_total.load(Ordering::Relaxed),
            pending: metrics.pending_events.load(Ordering::Relaxed).max(0) as u64,
        }
    }
}

/// Request latency percentile metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencyMetrics {
    /// 50th percentile (median) latency in milliseconds
    pub p50_ms: f64,

    /// 95th percentile latency in milliseconds
    pub p95_ms: f64,

    /// 99th percentile latency in milliseconds
    pub p99_ms: f64,

    /// Total number of requests recorded
    pub total_requests: u64,

    /// Mean latency in milliseconds
    pub mean_ms: f64,

    /// Maximum latency recorded in milliseconds
    pub max_ms: f64,
}

// ============================================================================
// Latency Histogram
// ============================================================================

/// Thread-safe latency histogram for recording request timings.
///
/// Tracks latencies from 1 microsecond to 60 seconds with 3 significant
/// figures of precision.
#[derive(Debug)]
pub struct LatencyHistogram {
    inner: RwLock<Histogram<u64>>,
}

impl LatencyHistogram {
    /// Create a new latency histogram.
    pub fn new() -> Self {
        let histogram = Histogram::new_with_bounds(1, 60_000_000, 3)
            .expect("Failed to create histogram with valid bounds");
        Self {
            inner: RwLock::new(histogram),
        }
    }

    /// Record a latency value in microseconds.
    ///
    /// Values outside the histogram bounds are silently ignored.
    pub fn record(&self, latency_us: u64) {
        let _ = self.inner.write().record(latency_us);
    }

    /// Record a latency duration.
    pub fn record_duration(&self, duration: std::time::Duration) {
        self.record(duration.as_micros() as u64);
    }

    /// Get the total count of recorded values.
    pub fn count(&self) -> u64 {
        self.inner.read().len()
    }

    /// Get complete latency metrics in milliseconds.
    pub fn metrics(&self) -> LatencyMetrics {
        let hist = self.inner.read();
        LatencyMetrics {
            p50_ms: hist.value_at_percentile(50.0) as f64 / 1000.0,
            p95_ms: hist.value_at_percentile(95.0) as f64 / 1000.0,
            p99_ms: hist.value_at_percentile(99.0) as f64 / 1000.0,
            total_requests: hist.len(),
            mean_ms: hist.mean() / 1000.0,
            max_ms: hist.max() as f64 / 1000.0,
        }
    }

    /// Reset the histogram, clearing all recorded values.
    pub fn reset(&self) {
        self.inner.write().reset();
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Application State
// ============================================================================

/// Shared state for the status endpoints.
///
/// # Usage
///
/// ```rust
/// use std::sync::Arc;
/// use freemkit::handlers::AppState;
///
/// let state = Arc::new(AppState::new().with_readiness(true, 1));
/// state.record_latency_us(12500); // 12.5ms
/// assert_eq!(state.total_requests(), 1);
/// ```
pub struct AppState {
    /// Server start time for uptime calculation
    start_time: Instant,

    /// Request latency histogram for percentile calculations
    latency_histogram: LatencyHistogram,

    /// Total number of HTTP requests seen by the middleware
    total_requests: AtomicU64,

    /// Responses with a 5xx status
    error_count: AtomicU64,

    /// Subscriber cache for totals
    subscribers: Option<Arc<dyn SubscriberStore>>,

    /// Whether a Kit access token is configured
    kit_connected: bool,

    /// Number of configured tenants
    tenants: usize,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("uptime_seconds", &self.uptime_seconds())
            .field("total_requests", &self.total_requests())
            .field("kit_connected", &self.kit_connected)
            .field("tenants", &self.tenants)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Create a new AppState; not ready until [`AppState::with_readiness`]
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            latency_histogram: LatencyHistogram::new(),
            total_requests: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            subscribers: None,
            kit_connected: false,
            tenants: 0,
        }
    }

    /// Report subscriber totals from `store`
    pub fn with_subscribers(mut self, store: Arc<dyn SubscriberStore>) -> Self {
        self.subscribers = Some(store);
        self
    }

    /// Inputs for the readiness probe
    pub fn with_readiness(mut self, kit_connected: bool, tenants: usize) -> Self {
        self.kit_connected = kit_connected;
        self.tenants = tenants;
        self
    }

    /// Get the server uptime in seconds.
    #[inline]
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Record a request latency in microseconds.
    #[inline]
    pub fn record_latency_us(&self, latency_us: u64) {
        self.latency_histogram.record(latency_us);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request latency duration.
    #[inline]
    pub fn record_latency(&self, duration: std::time::Duration) {
        self.latency_histogram.record_duration(duration);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the latency metrics.
    #[inline]
    pub fn latency_metrics(&self) -> LatencyMetrics {
        self.latency_histogram.metrics()
    }

    /// Get the total number of requests processed.
    #[inline]
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Record a server error.
    #[inline]
    pub fn record_error(&self) -> u64 {
        self.error_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Get the total error count.
    #[inline]
    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    /// Reasons the service cannot process webhooks yet
    pub fn readiness_problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if !self.kit_connected {
            problems.push("Kit access token is not configured".to_string());
        }
        if self.tenants == 0 {
            problems.push("no [[plugins]] are configured".to_string());
        }
        problems
    }

    async fn subscriber_totals(&self) -> BTreeMap<String, usize> {
        let Some(store) = &self.subscribers else {
            return BTreeMap::new();
        };
        match store.counts().await {
            Ok(counts) => counts
                .into_iter()
                .map(|(status, count)| (status.to_string(), count))
                .collect(),
            Err(e) => {
                warn!(error = %e, "Could not count subscribers");
                BTreeMap::new()
            }
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// HTTP Handlers
// ============================================================================

/// Health check endpoint handler.
///
/// # Route
/// `GET /health`
///
/// ```bash
/// curl http://localhost:8080/health
/// # {"status":"healthy"}
/// ```
#[instrument(skip_all)]
pub async fn health_handler() -> impl IntoResponse {
    debug!("Health check requested");
    (StatusCode::OK, Json(HealthResponse::default()))
}

/// Detailed status endpoint handler.
///
/// # Route
/// `GET /status`
#[instrument(skip_all)]
pub async fn status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    debug!("Status check requested");

    let response = StatusResponse {
        version: SERVER_VERSION.to_string(),
        name: SERVER_NAME.to_string(),
        uptime_seconds: state.uptime_seconds(),
        webhooks: WebhookCounters::from_metrics(global_metrics()),
        subscribers: state.subscriber_totals().await,
        latency: state.latency_metrics(),
        status: "running".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    };

    (StatusCode::OK, Json(response))
}

/// Readiness check endpoint handler.
///
/// # Route
/// `GET /ready`
///
/// # Response
/// - `200 OK` - Kit is connected and at least one tenant is configured
/// - `503 Service Unavailable` - otherwise, with the failing checks
#[instrument(skip_all)]
pub async fn readiness_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let problems = state.readiness_problems();
    if problems.is_empty() {
        (
            StatusCode::OK,
            Json(ReadinessResponse {
                status: "ready".to_string(),
                problems,
            }),
        )
    } else {
        debug!(?problems, "Not ready");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadinessResponse {
                status: "not_ready".to_string(),
                problems,
            }),
        )
    }
}

/// Prometheus metrics endpoint handler.
///
/// # Route
/// `GET /metrics`
#[instrument(skip_all)]
pub async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        global_metrics().to_prometheus_format(),
    )
}

/// Response header carrying the per-request id
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Middleware recording latency and server errors for every request.
///
/// Each response is stamped with an `x-request-id`, reusing the caller's
/// value when one was sent.
pub async fn track_requests(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let mut response = next.run(request).await;
    let elapsed = started.elapsed();
    state.record_latency(elapsed);
    if response.status().is_server_error() {
        state.record_error();
    }

    debug!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_us = elapsed.as_micros() as u64,
        "Request finished"
    );
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

// ============================================================================
// Router Setup
// ============================================================================

/// Create the status router with all health and status endpoints.
///
/// # Routes
/// - `GET /health` - Simple health check
/// - `GET /ready` - Readiness probe
/// - `GET /status` - Detailed status with metrics
/// - `GET /metrics` - Prometheus text format
pub fn status_router(state: Arc<AppState>) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(readiness_handler))
        .route("/status", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{JsonSubscriberStore, NewSubscriber};

    #[test]
    fn test_health_response_default() {
        let health = HealthResponse::default();
        assert_eq!(health.status, "healthy");
    }

    #[test]
    fn test_latency_histogram() {
        let histogram = LatencyHistogram::new();

        histogram.record(1000); // 1ms
        histogram.record(2000); // 2ms
        histogram.record(5000); // 5ms
        histogram.record(10000); // 10ms
        histogram.record(50000); // 50ms

        assert_eq!(histogram.count(), 5);
        let metrics = histogram.metrics();
        assert!(metrics.p50_ms > 0.0);
        assert!(metrics.p95_ms >= metrics.p50_ms);
        assert!(metrics.p99_ms >= metrics.p95_ms);
        assert!(
            (50.0..=51.0).contains(&metrics.max_ms),
            "max should be ~50ms, got {}",
            metrics.max_ms
        );

        histogram.reset();
        assert_eq!(histogram.count(), 0);
    }

    #[test]
    fn test_app_state_latency_and_errors() {
        let state = AppState::new();
        state.record_latency_us(5000);
        state.record_latency_us(10000);
        assert_eq!(state.total_requests(), 2);
        assert_eq!(state.latency_metrics().total_requests, 2);

        assert_eq!(state.record_error(), 1);
        assert_eq!(state.error_count(), 1);
    }

    #[test]
    fn test_readiness_problems() {
        assert_eq!(AppState::new().readiness_problems().len(), 2);
        assert!(AppState::new()
            .with_readiness(true, 1)
            .readiness_problems()
            .is_empty());
    }

    #[test]
    fn test_server_constants() {
        assert_eq!(SERVER_NAME, "freemkit");
        assert!(!SERVER_VERSION.is_empty());
    }

    #[tokio::test]
    async fn test_health_handler() {
        let response = health_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readiness_handler() {
        let not_ready = readiness_handler(State(Arc::new(AppState::new())))
            .await
            .into_response();
        assert_eq!(not_ready.status(), StatusCode::SERVICE_UNAVAILABLE);

        let ready = readiness_handler(State(Arc::new(AppState::new().with_readiness(true, 2))))
            .await
            .into_response();
        assert_eq!(ready.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_reports_subscriber_totals() {
        let store = Arc::new(JsonSubscriberStore::in_memory());
        store
            .upsert_by_email(NewSubscriber {
                email: "a@example.com".into(),
                ..NewSubscriber::default()
            })
            .await
            .unwrap();
        let state = AppState::new().with_subscribers(store);
        let totals = state.subscriber_totals().await;
        assert_eq!(totals.get("active"), Some(&1));
    }

    #[tokio::test]
    async fn test_metrics_handler() {
        let response = metrics_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_status_response_serialization() {
        let response = StatusResponse {
            version: "0.1.0".to_string(),
            name: "freemkit".to_string(),
            uptime_seconds: 3600,
            webhooks: WebhookCounters::default(),
            subscribers: BTreeMap::from([("active".to_string(), 3)]),
            latency: LatencyMetrics::default(),
            status: "running".to_string(),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"uptime_seconds\":3600"));
        assert!(json.contains("\"subscribers\":{\"active\":3}"));
        assert!(json.contains("\"status\":\"running\""));
    }
}
