//! Delivery freshness check.
//!
//! A timestamp is looked up in the delivery headers first and then in the
//! payload. Deliveries without any timestamp pass unless the policy requires
//! one. Skew is tolerated in both directions.

use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;

use crate::error::{WebhookError, WebhookResult};
use crate::webhook::headers::HeaderSources;

/// Headers that may carry a numeric epoch timestamp, in priority order
pub const TIMESTAMP_HEADERS: &[&str] = &["x-fs-timestamp", "x-timestamp", "x-webhook-timestamp"];

/// Payload fields that may carry a timestamp, in priority order
const TIMESTAMP_POINTERS: &[&str] = &[
    "/timestamp",
    "/created",
    "/created_at",
    "/event_timestamp",
    "/date",
    "/datetime",
    "/objects/event/created",
    "/objects/event/created_at",
    "/objects/event/timestamp",
];

/// Freshness policy
#[derive(Debug, Clone, Copy)]
pub struct FreshnessValidator {
    max_age: Duration,
    require_timestamp: bool,
}

impl FreshnessValidator {
    /// Create a validator
    pub fn new(max_age: Duration, require_timestamp: bool) -> Self {
        Self {
            max_age,
            require_timestamp,
        }
    }

    /// Validate against the current time
    pub fn validate(&self, body: &[u8], headers: &HeaderSources<'_>) -> WebhookResult<()> {
        self.validate_at(body, headers, Utc::now().timestamp())
    }

    /// Validate against an explicit `now` (epoch seconds)
    pub fn validate_at(
        &self,
        body: &[u8],
        headers: &HeaderSources<'_>,
        now: i64,
    ) -> WebhookResult<()> {
        let Some(timestamp) = extract_timestamp(body, headers) else {
            if self.require_timestamp {
                return Err(WebhookError::MissingTimestamp);
            }
            return Ok(());
        };

        let age = now.saturating_sub(timestamp).unsigned_abs();
        if age > self.max_age.as_secs() {
            tracing::debug!(timestamp, now, max_age = self.max_age.as_secs(), "Stale webhook");
            return Err(WebhookError::StaleWebhook);
        }
        Ok(())
    }
}

/// Find the delivery timestamp (epoch seconds).
///
/// Headers only count when numeric. Payload fields may be numbers, numeric
/// strings or date strings.
pub fn extract_timestamp(body: &[u8], headers: &HeaderSources<'_>) -> Option<i64> {
    for name in TIMESTAMP_HEADERS {
        if let Some(ts) = headers.get(name).as_deref().and_then(parse_numeric) {
            return Some(ts);
        }
    }

    let payload: Value = serde_json::from_slice(body).ok()?;
    TIMESTAMP_POINTERS
        .iter()
        .filter_map(|pointer| payload.pointer(pointer))
        .find_map(|candidate| match candidate {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => parse_numeric(s).or_else(|| parse_date(s)),
            _ => None,
        })
}

fn parse_numeric(value: &str) -> Option<i64> {
    let value = value.trim();
    value
        .parse::<i64>()
        .ok()
        .or_else(|| value.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f as i64))
}

/// Parse common date formats; naive values are taken as UTC.
fn parse_date(value: &str) -> Option<i64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.timestamp());
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
        return Some(dt.timestamp());
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Some(dt.and_utc().timestamp());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp())
}
