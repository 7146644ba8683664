//! Replay protection.
//!
//! Every accepted delivery is keyed by a stable event key and a seen-marker
//! is stored under that key. Redeliveries inside the marker's lifetime are
//! reported as ignored rather than processed again.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::StoreResult;
use crate::store::KeyValueStore;

/// Key prefix for seen-markers
pub const SEEN_PREFIX: &str = "freemkit_webhook_seen_";

/// Payload fields that may carry an event id, in priority order
const EVENT_ID_POINTERS: &[&str] = &["/id", "/event_id", "/objects/event/id"];

/// Stable event key for a raw payload.
///
/// Uses the first explicit event id, reduced to `[a-z0-9_-]`; otherwise the
/// hex SHA-256 of the raw bytes.
pub fn event_key(raw: &[u8]) -> String {
    if let Ok(payload) = serde_json::from_slice::<Value>(raw) {
        let explicit = EVENT_ID_POINTERS
            .iter()
            .filter_map(|pointer| payload.pointer(pointer))
            .filter_map(id_string)
            .map(|id| sanitize_key(&id))
            .find(|key| !key.is_empty());
        if let Some(key) = explicit {
            return key;
        }
    }
    hex::encode(Sha256::digest(raw))
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(true) => Some("1".to_string()),
        _ => None,
    }
}

fn sanitize_key(raw: &str) -> String {
    raw.chars()
        .map(|c| c.to_ascii_lowercase())
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

/// Seen-marker bookkeeping over a key-value store
#[derive(Clone)]
pub struct ReplayGuard {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl ReplayGuard {
    /// Create a guard; `ttl` is the marker lifetime
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Whether a marker exists for `key`
    pub async fn is_duplicate(&self, key: &str) -> StoreResult<bool> {
        Ok(self.store.get(&marker_key(key)).await?.is_some())
    }

    /// Store a marker for `key`
    pub async fn mark_seen(&self, key: &str) -> StoreResult<()> {
        self.store
            .set(&marker_key(key), Value::from(1), self.ttl)
            .await
    }

    /// Remove the marker so a corrected resend is accepted again
    pub async fn clear(&self, key: &str) -> StoreResult<()> {
        self.store.delete(&marker_key(key)).await
    }
}

fn marker_key(key: &str) -> String {
    format!("{SEEN_PREFIX}{key}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TransientStore;

    #[test]
    fn test_event_key_prefers_explicit_ids() {
        assert_eq!(event_key(br#"{"id":"EVT_123.ab","event_id":"x"}"#), "evt_123ab");
        assert_eq!(event_key(br#"{"event_id":987}"#), "987");
        assert_eq!(
            event_key(br#"{"objects":{"event":{"id":"Nested-1"}}}"#),
            "nested-1"
        );
    }

    #[test]
    fn test_event_key_falls_back_to_content_hash() {
        let raw = br#"{"plugin_id":"1"}"#;
        let key = event_key(raw);
        assert_eq!(key.len(), 64);
        assert_eq!(key, event_key(raw));
        assert_ne!(key, event_key(br#"{"plugin_id":"2"}"#));

        // ids that sanitize to nothing do not collapse to an empty key
        assert_eq!(event_key(br#"{"id":"..."}"#).len(), 64);
        assert_eq!(event_key(b"not json").len(), 64);
    }

    #[tokio::test]
    async fn test_mark_and_clear() {
        let guard = ReplayGuard::new(
            Arc::new(TransientStore::in_memory()),
            Duration::from_secs(3600),
        );
        assert!(!guard.is_duplicate("k").await.unwrap());
        guard.mark_seen("k").await.unwrap();
        assert!(guard.is_duplicate("k").await.unwrap());
        assert!(!guard.is_duplicate("other").await.unwrap());
        guard.clear("k").await.unwrap();
        assert!(!guard.is_duplicate("k").await.unwrap());
    }
}
