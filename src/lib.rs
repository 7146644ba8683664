//! FreemKit - Freemius to Kit webhook bridge
//!
//! This crate receives Freemius licensing webhooks and subscribes the
//! customer to Kit (ConvertKit) forms and tags, keeping a local cache of
//! subscribers.
//!
//! # Features
//!
//! - **Webhook pipeline**: signature, freshness and replay checks before
//!   anything is queued
//! - **Deferred delivery**: queued events run in the background with
//!   bounded retries, or inline when scheduling is unavailable
//! - **Tier mapping**: free and paid trigger events, forms and tags per
//!   Freemius product with site-wide fallbacks
//! - **Transports**: REST route, query-string endpoint, or CGI
//!
//! # Architecture
//!
//! ```text
//! Freemius ──▶ Transport ──▶ Verify ──▶ Freshness ──▶ Replay Guard ──▶ Queue
//!                                                                        │
//!                                                         (deferred)     ▼
//!                                       Subscriber Store ◀── Processor ──▶ Kit API
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use freemkit::config::Settings;
//! use freemkit::kit::KitClient;
//! use freemkit::store::Stores;
//! use freemkit::webhook::{DisabledScheduler, WebhookState};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::load("freemkit.toml".as_ref())?;
//!     let stores = Stores::open(&settings.storage).await?;
//!     let client = Arc::new(KitClient::new(&settings.kit)?);
//!     let state = WebhookState::new(&settings, &stores, client, Arc::new(DisabledScheduler));
//!     println!("endpoint: {}", state.endpoint());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod config;
pub mod error;
pub mod handlers;
pub mod kit;
pub mod metrics;
pub mod store;
pub mod webhook;

// Re-exports for convenience
pub use config::Settings;
pub use error::{Error, Result, WebhookError};
pub use kit::{KitClient, SubscriptionClient};
pub use store::{Stores, SubscriberStore};
pub use webhook::{EventQueue, WebhookState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
