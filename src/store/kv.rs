//! Key-value store with expiring entries.
//!
//! Queue records and replay markers are short-lived: every write carries a
//! TTL and expired entries read as absent. Expired entries are dropped on
//! read, on every write and by [`TransientStore::purge_expired`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::StoreResult;

/// Storage interface the pipeline depends on.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    /// Fetch a live value
    async fn get(&self, key: &str) -> StoreResult<Option<Value>>;

    /// Store a value that expires after `ttl`
    async fn set(&self, key: &str, value: Value, ttl: Duration) -> StoreResult<()>;

    /// Remove a value; removing a missing key is not an error
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Live keys starting with `prefix`, sorted
    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    value: Value,
    /// Unix epoch milliseconds
    expires_at: i64,
}

impl Entry {
    fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at > now_ms
    }
}

/// In-memory transient store, optionally mirrored to a JSON file.
pub struct TransientStore {
    entries: RwLock<HashMap<String, Entry>>,
    path: Option<PathBuf>,
    /// Serializes file writes so snapshots land in order
    persist_lock: Mutex<()>,
}

impl TransientStore {
    /// Memory-only store
    pub fn in_memory() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            path: None,
            persist_lock: Mutex::new(()),
        }
    }

    /// File-backed store; loads live entries from `path` if it exists.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let now = Utc::now().timestamp_millis();
        let loaded: HashMap<String, Entry> = super::read_json(&path).await?.unwrap_or_default();
        let entries: HashMap<String, Entry> = loaded
            .into_iter()
            .filter(|(_, entry)| entry.is_live(now))
            .collect();

        debug!(path = %path.display(), entries = entries.len(), "Opened transient store");

        Ok(Self {
            entries: RwLock::new(entries),
            path: Some(path),
            persist_lock: Mutex::new(()),
        })
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        let now = Utc::now().timestamp_millis();
        self.entries.read().values().filter(|e| e.is_live(now)).count()
    }

    /// Whether the store holds no live entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries, returning how many were removed.
    pub async fn purge_expired(&self) -> StoreResult<usize> {
        let now = Utc::now().timestamp_millis();
        let removed = {
            let mut entries = self.entries.write();
            let before = entries.len();
            entries.retain(|_, entry| entry.is_live(now));
            before - entries.len()
        };
        if removed > 0 {
            self.persist().await?;
        }
        Ok(removed)
    }

    async fn persist(&self) -> StoreResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.entries.read().clone();
        super::write_json_atomic(path, &snapshot).await
    }
}

#[async_trait]
impl KeyValueStore for TransientStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        let now = Utc::now().timestamp_millis();
        let expired = {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if entry.is_live(now) => return Ok(Some(entry.value.clone())),
                Some(_) => true,
                None => false,
            }
        };

        if expired {
            self.entries.write().remove(key);
            if let Err(e) = self.persist().await {
                warn!(key, error = %e, "Failed to persist expiry");
            }
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> StoreResult<()> {
        let now = Utc::now().timestamp_millis();
        let expires_at = now + ttl.as_millis() as i64;
        {
            let mut entries = self.entries.write();
            // Markers are rarely read again, so expired entries go on every write
            entries.retain(|_, entry| entry.is_live(now));
            entries.insert(key.to_string(), Entry { value, expires_at });
        }
        self.persist().await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let removed = self.entries.write().remove(key).is_some();
        if removed {
            self.persist().await?;
        }
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let now = Utc::now().timestamp_millis();
        let mut keys: Vec<String> = self
            .entries
            .read()
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = TransientStore::in_memory();
        store
            .set("a", json!({"n": 1}), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(json!({"n": 1})));

        store.delete("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);

        // deleting twice is fine
        store.delete("a").await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_entries_read_as_missing() {
        let store = TransientStore::in_memory();
        store
            .set("short", json!(1), Duration::from_millis(20))
            .await
            .unwrap();
        store
            .set("long", json!(2), Duration::from_secs(60))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(store.get("short").await.unwrap(), None);
        assert_eq!(store.get("long").await.unwrap(), Some(json!(2)));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = TransientStore::in_memory();
        store.set("y", json!(1), Duration::from_secs(60)).await.unwrap();
        store.set("x", json!(1), Duration::ZERO).await.unwrap();
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(!store.is_empty());
    }

    #[tokio::test]
    async fn test_writes_drop_expired_entries_without_reading_them() {
        let store = TransientStore::in_memory();
        store.set("seen_old", json!(1), Duration::ZERO).await.unwrap();
        store.set("seen_older", json!(1), Duration::ZERO).await.unwrap();
        assert_eq!(store.entries.read().len(), 1);

        store
            .set("seen_new", json!(1), Duration::from_secs(60))
            .await
            .unwrap();
        let entries = store.entries.read();
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key("seen_new"));
    }

    #[tokio::test]
    async fn test_file_snapshot_omits_expired_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transients.json");
        let store = TransientStore::open(&path).await.unwrap();
        store.set("seen_old", json!(1), Duration::ZERO).await.unwrap();
        store
            .set("seen_new", json!(1), Duration::from_secs(60))
            .await
            .unwrap();

        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert!(on_disk.contains("seen_new"));
        assert!(!on_disk.contains("seen_old"));
    }

    #[tokio::test]
    async fn test_keys_with_prefix() {
        let store = TransientStore::in_memory();
        let ttl = Duration::from_secs(60);
        store.set("queue_b", json!(1), ttl).await.unwrap();
        store.set("queue_a", json!(1), ttl).await.unwrap();
        store.set("seen_a", json!(1), ttl).await.unwrap();
        store.set("queue_old", json!(1), Duration::ZERO).await.unwrap();

        assert_eq!(
            store.keys_with_prefix("queue_").await.unwrap(),
            vec!["queue_a".to_string(), "queue_b".to_string()]
        );
    }

    #[tokio::test]
    async fn test_file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transients.json");

        {
            let store = TransientStore::open(&path).await.unwrap();
            store
                .set("seen_abc", json!(1), Duration::from_secs(3600))
                .await
                .unwrap();
            store.set("gone", json!(1), Duration::ZERO).await.unwrap();
        }

        let reopened = TransientStore::open(&path).await.unwrap();
        assert_eq!(reopened.get("seen_abc").await.unwrap(), Some(json!(1)));
        assert_eq!(reopened.get("gone").await.unwrap(), None);
    }
}
