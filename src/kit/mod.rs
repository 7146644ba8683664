//! Kit (ConvertKit) subscription client.
//!
//! The pipeline only needs three capabilities from the email platform, so it
//! depends on the [`SubscriptionClient`] trait. [`KitClient`] implements it
//! against the Kit v4 REST API.

pub mod client;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::ClientResult;

pub use client::KitClient;

/// Outbound email-platform operations used by the event processor.
#[async_trait]
pub trait SubscriptionClient: Send + Sync + 'static {
    /// Create the subscriber (or fetch the existing one) and return its id.
    async fn create_or_get_subscriber(
        &self,
        email: &str,
        first_name: &str,
        fields: &BTreeMap<String, String>,
    ) -> ClientResult<u64>;

    /// Add the subscriber to a form/list.
    async fn attach_to_list(&self, list_id: &str, subscriber_id: u64) -> ClientResult<()>;

    /// Apply a tag to the subscriber.
    async fn apply_tag(&self, tag_id: &str, subscriber_id: u64) -> ClientResult<()>;
}
