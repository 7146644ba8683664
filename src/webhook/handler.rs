//! Inbound webhook transports.
//!
//! Two transports share one ingestion path (verify, check freshness,
//! enqueue):
//!
//! - REST: `POST /freemkit/v1/webhook`, JSON responses
//! - Query: any path whose query string carries `freemkit_webhook`,
//!   plain-text responses, `405` for anything but `POST`
//!
//! | Outcome                 | Status |
//! |-------------------------|--------|
//! | queued                  | 202    |
//! | processed / duplicate   | 200    |
//! | validation failure      | 400    |
//! | queue/storage failure   | 500    |

use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::config::{EndpointType, Settings};
use crate::error::{WebhookError, WebhookResult};
use crate::kit::SubscriptionClient;
use crate::metrics::global_metrics;
use crate::store::Stores;
use crate::webhook::freshness::FreshnessValidator;
use crate::webhook::headers::HeaderSources;
use crate::webhook::processor::EventProcessor;
use crate::webhook::queue::{EnqueueOutcome, EnqueueStatus, EventQueue};
use crate::webhook::scheduler::Scheduler;
use crate::webhook::signature::SignatureVerifier;

/// REST route
pub const REST_ROUTE: &str = "/freemkit/v1/webhook";

/// Query-string marker for the query transport
pub const QUERY_MARKER: &str = "freemkit_webhook";

/// Whether a query string selects the query transport
pub fn has_query_marker(query: Option<&str>) -> bool {
    query.is_some_and(|query| query.contains(QUERY_MARKER))
}

/// HTTP status for a successful ingestion
pub fn success_status(outcome: &EnqueueOutcome) -> StatusCode {
    match outcome.status {
        EnqueueStatus::Queued => StatusCode::ACCEPTED,
        EnqueueStatus::Processed | EnqueueStatus::Ignored => StatusCode::OK,
    }
}

/// Shared pipeline state
pub struct WebhookState {
    verifier: SignatureVerifier,
    freshness: FreshnessValidator,
    queue: Arc<EventQueue>,
    endpoint: EndpointType,
}

impl WebhookState {
    /// Assemble the pipeline from settings, stores, a Kit client and a scheduler.
    pub fn new(
        settings: &Settings,
        stores: &Stores,
        client: Arc<dyn SubscriptionClient>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let tenants = Arc::new(settings.tenants());
        let processor = EventProcessor::new(
            tenants.clone(),
            settings.defaults.clone(),
            client,
            stores.subscribers.clone(),
        );
        let queue = EventQueue::new(
            stores.transients.clone(),
            Arc::new(processor),
            scheduler,
            settings.webhook.clone(),
        );

        Self {
            verifier: SignatureVerifier::new(tenants),
            freshness: FreshnessValidator::new(
                settings.webhook.max_age(),
                settings.webhook.require_timestamp,
            ),
            queue: Arc::new(queue),
            endpoint: settings.webhook.endpoint,
        }
    }

    /// Queue shared with the background worker
    pub fn queue(&self) -> Arc<EventQueue> {
        self.queue.clone()
    }

    /// Configured transport
    pub fn endpoint(&self) -> EndpointType {
        self.endpoint
    }

    /// Verify, check freshness and enqueue one delivery.
    pub async fn ingest(
        &self,
        body: &[u8],
        headers: &HeaderSources<'_>,
    ) -> WebhookResult<EnqueueOutcome> {
        let result: WebhookResult<EnqueueOutcome> = async {
            let plugin_id = self.verifier.verify(body, &headers.signature())?;
            self.freshness.validate(body, headers)?;
            let outcome = self.queue.enqueue(body).await?;
            debug!(plugin_id = %plugin_id, status = ?outcome.status, "Webhook accepted");
            Ok::<_, WebhookError>(outcome)
        }
        .await;

        if let Err(e) = &result {
            global_metrics().record_rejection(e.code());
            if e.is_validation() {
                info!(code = e.code(), "Webhook rejected: {}", e);
            } else {
                warn!(code = e.code(), error = %e, "Webhook could not be queued");
            }
        }
        result
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: String,
    data: ErrorData,
}

#[derive(Serialize)]
struct ErrorData {
    status: u16,
}

fn json_response(result: WebhookResult<EnqueueOutcome>) -> Response {
    match result {
        Ok(outcome) => (success_status(&outcome), Json(outcome)).into_response(),
        Err(e) => {
            let status = e.status_code();
            let body = ErrorBody {
                code: e.code(),
                message: e.to_string(),
                data: ErrorData {
                    status: status.as_u16(),
                },
            };
            (status, Json(body)).into_response()
        }
    }
}

/// Plain-text rendering used by the query and CGI transports
pub fn text_response(result: &WebhookResult<EnqueueOutcome>) -> (StatusCode, String) {
    match result {
        Ok(outcome) => (success_status(outcome), outcome.message.clone()),
        Err(e) => (e.status_code(), e.to_string()),
    }
}

/// `POST /freemkit/v1/webhook`
#[instrument(skip_all)]
pub async fn rest_webhook_handler(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    let sources = HeaderSources::new().with_native(&headers);
    let response = json_response(state.ingest(&body, &sources).await);
    global_metrics().record_request(REST_ROUTE, response.status().as_u16(), started.elapsed());
    response
}

/// Fallback handler for the query transport
#[instrument(skip_all, fields(path = %uri.path()))]
pub async fn query_webhook_handler(
    State(state): State<Arc<WebhookState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !has_query_marker(uri.query()) {
        return StatusCode::NOT_FOUND.into_response();
    }

    let started = Instant::now();
    let (status, message) = if method != Method::POST {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "Invalid request method".to_string(),
        )
    } else {
        let sources = HeaderSources::new().with_native(&headers);
        text_response(&state.ingest(&body, &sources).await)
    };

    global_metrics().record_request(uri.path(), status.as_u16(), started.elapsed());
    (status, message).into_response()
}

/// Router exposing the configured transport
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    match state.endpoint() {
        EndpointType::Rest => Router::new()
            .route(REST_ROUTE, post(rest_webhook_handler))
            .with_state(state),
        EndpointType::Query => Router::new()
            .fallback(query_webhook_handler)
            .with_state(state),
    }
}
