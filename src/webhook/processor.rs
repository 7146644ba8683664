//! Event Processing
//!
//! Turns one verified Freemius delivery into Kit subscriptions and a local
//! subscriber record.
//!
//! # Stages
//!
//! ```text
//! [Decode & Validate]      InvalidRequest / InvalidPlugin / InvalidData / InvalidEmail / InvalidEvent
//!       |
//! [Resolve Fields]         last-name field + custom field mappings
//!       |
//! [Resolve Lists & Tags]   tenant -> site default -> built-in trigger event
//!       |
//! [Dispatch Tier]          free, paid, or ignored
//!       |
//! [Deliver to Kit]         ApiError on the first failed call
//!       |
//! [Upsert Subscriber]      DbError (Kit calls are not undone)
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{DefaultsConfig, PluginConfig, TenantRegistry};
use crate::error::{WebhookError, WebhookResult};
use crate::kit::SubscriptionClient;
use crate::metrics::global_metrics;
use crate::store::{NewSubscriber, SubscriberStore};
use crate::webhook::events::{decode_payload, normalize_event_types, FreemiusEvent, Tier};

/// How many trigger events each tier honours
pub const MAX_TRIGGER_EVENTS: usize = 1;

/// Successful processing result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ProcessOutcome {
    /// The user was subscribed on the given tier
    Subscribed {
        /// Dispatched tier
        tier: Tier,
        /// Subscriber email
        email: String,
        /// Kit forms the subscriber was attached to
        lists: Vec<String>,
        /// Kit tags applied
        tags: Vec<String>,
    },
    /// The event type is not a trigger for either tier
    Ignored {
        /// Normalized event type
        event_type: String,
    },
}

impl ProcessOutcome {
    /// Human readable result
    pub fn message(&self) -> &'static str {
        match self {
            Self::Subscribed { .. } => "Webhook processed successfully",
            Self::Ignored { .. } => "Event type not mapped; ignored.",
        }
    }

    /// Dispatched tier, if any
    pub fn tier(&self) -> Option<Tier> {
        match self {
            Self::Subscribed { tier, .. } => Some(*tier),
            Self::Ignored { .. } => None,
        }
    }
}

/// Anything that can process a raw delivery
#[async_trait]
pub trait PayloadProcessor: Send + Sync + 'static {
    /// Process a raw (already verified) payload
    async fn process(&self, raw: &[u8]) -> WebhookResult<ProcessOutcome>;
}

/// Forms, tags and trigger events for one tier
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TierTargets {
    /// Kit form ids
    pub lists: Vec<String>,
    /// Kit tag ids
    pub tags: Vec<String>,
    /// Normalized trigger events
    pub events: Vec<String>,
}

/// Resolve a list setting: tenant value, then site default, then built-in.
pub fn resolve_list(tenant: &[String], site_default: &[String], builtin: &[&str]) -> Vec<String> {
    let non_empty = |list: &[String]| -> Vec<String> {
        list.iter()
            .map(|item| item.trim())
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()
    };

    let list = non_empty(tenant);
    if !list.is_empty() {
        return list;
    }
    let list = non_empty(site_default);
    if !list.is_empty() {
        return list;
    }
    builtin.iter().map(|item| item.to_string()).collect()
}

/// Resolve forms, tags and trigger events for a tier.
pub fn resolve_targets(plugin: &PluginConfig, defaults: &DefaultsConfig, tier: Tier) -> TierTargets {
    let (lists, tags, events, default_events) = match tier {
        Tier::Free => (
            &plugin.free_form_ids,
            &plugin.free_tag_ids,
            &plugin.free_event_types,
            &defaults.free_event_types,
        ),
        Tier::Paid => (
            &plugin.paid_form_ids,
            &plugin.paid_tag_ids,
            &plugin.paid_event_types,
            &defaults.paid_event_types,
        ),
    };

    let mut events = normalize_event_types(&resolve_list(
        events,
        default_events,
        &[tier.default_event()],
    ));
    events.truncate(MAX_TRIGGER_EVENTS);

    TierTargets {
        lists: resolve_list(lists, &defaults.kit_form_id, &[]),
        tags: resolve_list(tags, &defaults.kit_tag_id, &[]),
        events,
    }
}

/// Build the Kit custom fields map for a user.
///
/// Every configured remote field is present; unresolved properties map to
/// an empty string.
pub fn resolve_fields(event: &FreemiusEvent, defaults: &DefaultsConfig) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();

    if let Some(last_name_field) = defaults
        .last_name_field
        .as_deref()
        .map(str::trim)
        .filter(|field| !field.is_empty())
    {
        fields.insert(last_name_field.to_string(), event.last_name());
    }

    for mapping in &defaults.custom_fields {
        fields.insert(
            mapping.remote_name.clone(),
            event.user_property(mapping.local_name.trim()),
        );
    }

    fields
}

/// Drives the subscription client and subscriber store for each event.
pub struct EventProcessor {
    tenants: Arc<TenantRegistry>,
    defaults: DefaultsConfig,
    client: Arc<dyn SubscriptionClient>,
    subscribers: Arc<dyn SubscriberStore>,
}

impl fmt::Debug for EventProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventProcessor")
            .field("tenants", &self.tenants.len())
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl EventProcessor {
    /// Create a processor
    pub fn new(
        tenants: Arc<TenantRegistry>,
        defaults: DefaultsConfig,
        client: Arc<dyn SubscriptionClient>,
        subscribers: Arc<dyn SubscriberStore>,
    ) -> Self {
        Self {
            tenants,
            defaults,
            client,
            subscribers,
        }
    }

    /// Subscribe the user to every list, applying every tag after each
    /// attachment. Stops at the first client failure.
    async fn deliver(
        &self,
        targets: &TierTargets,
        event: &FreemiusEvent,
        fields: &BTreeMap<String, String>,
    ) -> WebhookResult<()> {
        let email = event.email();
        let first_name = event.first_name();

        for list_id in targets.lists.iter().filter(|id| !id.is_empty()) {
            let result = async {
                let subscriber_id = self
                    .client
                    .create_or_get_subscriber(&email, &first_name, fields)
                    .await?;
                self.client.attach_to_list(list_id, subscriber_id).await?;
                for tag_id in targets.tags.iter().filter(|id| !id.is_empty()) {
                    self.client.apply_tag(tag_id, subscriber_id).await?;
                }
                Ok::<_, crate::error::ClientError>(())
            }
            .await;

            if let Err(e) = result {
                warn!(
                    plugin_id = %event.plugin_id,
                    list_id = %list_id,
                    error = %e,
                    "Kit API call failed"
                );
                return Err(WebhookError::ApiError(e.to_string()));
            }
        }

        Ok(())
    }
}

#[async_trait]
impl PayloadProcessor for EventProcessor {
    async fn process(&self, raw: &[u8]) -> WebhookResult<ProcessOutcome> {
        let started = Instant::now();

        let (payload, plugin_id) = decode_payload(raw)?;
        let plugin = self
            .tenants
            .get(&plugin_id)
            .ok_or(WebhookError::InvalidPlugin)?;
        let event = FreemiusEvent::from_payload(plugin_id, &payload)?;

        let fields = resolve_fields(&event, &self.defaults);
        let free = resolve_targets(plugin, &self.defaults, Tier::Free);
        let paid = resolve_targets(plugin, &self.defaults, Tier::Paid);

        let event_type = event.normalized_type();
        let (tier, targets) = if free.events.contains(&event_type) {
            (Tier::Free, free)
        } else if paid.events.contains(&event_type) {
            (Tier::Paid, paid)
        } else {
            debug!(
                plugin_id = %event.plugin_id,
                event_type = %event_type,
                "Event type not mapped"
            );
            global_metrics().record_processed(None, started.elapsed());
            return Ok(ProcessOutcome::Ignored { event_type });
        };

        self.deliver(&targets, &event, &fields).await?;

        let record = NewSubscriber {
            email: event.email(),
            first_name: event.first_name(),
            last_name: event.last_name(),
            fields,
            tags: targets.tags.iter().cloned().collect::<BTreeSet<_>>(),
            forms: targets.lists.iter().cloned().collect::<BTreeSet<_>>(),
        };
        if let Err(e) = self.subscribers.upsert_by_email(record).await {
            warn!(plugin_id = %event.plugin_id, error = %e, "Subscriber upsert failed");
            return Err(WebhookError::DbError(e.to_string()));
        }

        info!(
            plugin_id = %event.plugin_id,
            event_type = %event_type,
            tier = %tier,
            lists = targets.lists.len(),
            tags = targets.tags.len(),
            "Webhook processed"
        );
        global_metrics().record_processed(Some(tier), started.elapsed());

        Ok(ProcessOutcome::Subscribed {
            tier,
            email: event.email(),
            lists: targets.lists,
            tags: targets.tags,
        })
    }
}
