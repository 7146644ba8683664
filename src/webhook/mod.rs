//! Freemius Webhook Pipeline
//!
//! Receives Freemius license/install webhooks and subscribes the user to Kit.
//!
//! # Features
//!
//! - HMAC-SHA256 signature verification per tenant
//! - Freshness window on delivery timestamps
//! - Replay suppression keyed by event id or payload hash
//! - Deferred processing with bounded, linearly backed-off retries
//! - Free/paid tier dispatch with layered list and tag fallbacks
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use freemkit::config::Settings;
//! use freemkit::kit::KitClient;
//! use freemkit::store::Stores;
//! use freemkit::webhook::{webhook_router, QueueWorker, TokioScheduler, WebhookState};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let settings = Settings::load("freemkit.toml".as_ref())?;
//! let stores = Stores::open(&settings.storage).await?;
//! let client = Arc::new(KitClient::new(&settings.kit)?);
//! let (scheduler, receiver) = TokioScheduler::new(1024);
//!
//! let state = Arc::new(WebhookState::new(&settings, &stores, client, Arc::new(scheduler)));
//! tokio::spawn(QueueWorker::new(state.queue(), receiver).run());
//!
//! let app = webhook_router(state);
//! # Ok(())
//! # }
//! ```

pub mod cgi;
pub mod dedup;
pub mod events;
pub mod freshness;
pub mod handler;
pub mod headers;
pub mod processor;
pub mod queue;
pub mod scheduler;
pub mod signature;

pub use cgi::{handle_cgi, CgiRequest, CgiResponse};
pub use dedup::{event_key, ReplayGuard};
pub use events::{FreemiusEvent, Tier};
pub use freshness::FreshnessValidator;
pub use handler::{webhook_router, WebhookState, QUERY_MARKER, REST_ROUTE};
pub use headers::HeaderSources;
pub use processor::{EventProcessor, PayloadProcessor, ProcessOutcome};
pub use queue::{EnqueueOutcome, EnqueueStatus, EventQueue, QueueProgress, QueueWorker};
pub use scheduler::{DisabledScheduler, ScheduleOutcome, Scheduler, TokioScheduler};
pub use signature::{sign, SignatureVerifier};
