//! Local subscriber cache.
//!
//! One row per email address. Upserts merge into an existing row: custom
//! fields, tags and forms only ever grow, and empty incoming values never
//! clear stored ones.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{StoreError, StoreResult};

/// Subscription state of a cached subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriberStatus {
    /// Subscribed
    Active,
    /// Unsubscribed or disabled
    Inactive,
}

impl fmt::Display for SubscriberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Inactive => write!(f, "inactive"),
        }
    }
}

/// A cached subscriber row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    /// Row id
    pub id: u64,
    /// Unique, normalized email
    pub email: String,
    /// First name
    pub first_name: String,
    /// Last name
    pub last_name: String,
    /// Kit custom field values
    pub fields: BTreeMap<String, String>,
    /// Kit tag ids
    pub tags: BTreeSet<String>,
    /// Kit form ids
    pub forms: BTreeSet<String>,
    /// Subscription state
    pub status: SubscriberStatus,
    /// Row creation time
    pub created: DateTime<Utc>,
    /// Last update time
    pub modified: DateTime<Utc>,
}

/// Data for an insert-or-update keyed by email
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewSubscriber {
    /// Email, normalized on write
    pub email: String,
    /// First name
    pub first_name: String,
    /// Last name
    pub last_name: String,
    /// Custom field values
    pub fields: BTreeMap<String, String>,
    /// Tag ids to associate
    pub tags: BTreeSet<String>,
    /// Form ids to associate
    pub forms: BTreeSet<String>,
}

/// Normalize an email for use as the unique key.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

impl Subscriber {
    fn from_new(id: u64, new: NewSubscriber, now: DateTime<Utc>) -> Self {
        let mut subscriber = Self {
            id,
            email: normalize_email(&new.email),
            first_name: String::new(),
            last_name: String::new(),
            fields: BTreeMap::new(),
            tags: BTreeSet::new(),
            forms: BTreeSet::new(),
            status: SubscriberStatus::Active,
            created: now,
            modified: now,
        };
        subscriber.merge(new, now);
        subscriber
    }

    /// Merge incoming data. Names are last-writer-wins unless the new value is
    /// empty; fields, tags and forms are unioned.
    pub fn merge(&mut self, new: NewSubscriber, now: DateTime<Utc>) {
        if !new.first_name.is_empty() {
            self.first_name = new.first_name;
        }
        if !new.last_name.is_empty() {
            self.last_name = new.last_name;
        }
        for (key, value) in new.fields {
            if value.is_empty() {
                self.fields.entry(key).or_default();
            } else {
                self.fields.insert(key, value);
            }
        }
        self.tags
            .extend(new.tags.into_iter().filter(|tag| !tag.is_empty()));
        self.forms
            .extend(new.forms.into_iter().filter(|form| !form.is_empty()));
        self.status = SubscriberStatus::Active;
        self.modified = now;
    }

    fn matches_search(&self, needle: &str) -> bool {
        self.email.to_lowercase().contains(needle)
            || self.first_name.to_lowercase().contains(needle)
            || self.last_name.to_lowercase().contains(needle)
    }
}

/// Listing filter, mirroring the admin list table
#[derive(Debug, Clone)]
pub struct SubscriberQuery {
    /// Case-insensitive substring over email and names
    pub search: Option<String>,
    /// Restrict to these statuses (empty = all)
    pub statuses: Vec<SubscriberStatus>,
    /// Page size
    pub per_page: usize,
    /// 1-based page number
    pub page: usize,
}

impl Default for SubscriberQuery {
    fn default() -> Self {
        Self {
            search: None,
            statuses: Vec::new(),
            per_page: 10,
            page: 1,
        }
    }
}

/// Subscriber persistence used by the event processor.
#[async_trait]
pub trait SubscriberStore: Send + Sync + 'static {
    /// Insert a new row or merge into the row with the same email.
    async fn upsert_by_email(&self, subscriber: NewSubscriber) -> StoreResult<Subscriber>;

    /// Fetch by row id
    async fn get(&self, id: u64) -> StoreResult<Option<Subscriber>>;

    /// Fetch by email
    async fn get_by_email(&self, email: &str) -> StoreResult<Option<Subscriber>>;

    /// Newest-first page of rows matching the query
    async fn list(&self, query: &SubscriberQuery) -> StoreResult<Vec<Subscriber>>;

    /// Row counts per status
    async fn counts(&self) -> StoreResult<BTreeMap<SubscriberStatus, usize>>;

    /// Delete a row, returning whether it existed
    async fn delete(&self, id: u64) -> StoreResult<bool>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Table {
    next_id: u64,
    rows: BTreeMap<u64, Subscriber>,
    #[serde(skip)]
    by_email: HashMap<String, u64>,
}

impl Table {
    fn reindex(&mut self) {
        self.by_email = self
            .rows
            .values()
            .map(|row| (row.email.clone(), row.id))
            .collect();
        let max_id = self.rows.keys().next_back().copied().unwrap_or(0);
        self.next_id = self.next_id.max(max_id);
    }
}

/// Subscriber store kept in memory and optionally mirrored to a JSON file.
pub struct JsonSubscriberStore {
    table: RwLock<Table>,
    path: Option<PathBuf>,
    persist_lock: Mutex<()>,
}

impl JsonSubscriberStore {
    /// Memory-only store
    pub fn in_memory() -> Self {
        Self {
            table: RwLock::new(Table::default()),
            path: None,
            persist_lock: Mutex::new(()),
        }
    }

    /// File-backed store; loads existing rows from `path`.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut table: Table = super::read_json(&path).await?.unwrap_or_default();
        table.reindex();
        debug!(path = %path.display(), rows = table.rows.len(), "Opened subscriber store");

        Ok(Self {
            table: RwLock::new(table),
            path: Some(path),
            persist_lock: Mutex::new(()),
        })
    }

    async fn persist(&self) -> StoreResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.persist_lock.lock().await;
        let snapshot = {
            let table = self.table.read();
            serde_json::to_value(&*table)?
        };
        super::write_json_atomic(path, &snapshot).await
    }
}

#[async_trait]
impl SubscriberStore for JsonSubscriberStore {
    async fn upsert_by_email(&self, subscriber: NewSubscriber) -> StoreResult<Subscriber> {
        let email = normalize_email(&subscriber.email);
        if email.is_empty() {
            return Err(StoreError::MissingEmail);
        }

        let now = Utc::now();
        let row = {
            let mut table = self.table.write();
            match table.by_email.get(&email).copied() {
                Some(id) => {
                    let row = table
                        .rows
                        .get_mut(&id)
                        .ok_or_else(|| StoreError::Io(format!("index points at missing row {id}")))?;
                    row.merge(subscriber, now);
                    row.clone()
                }
                None => {
                    table.next_id += 1;
                    let id = table.next_id;
                    let row = Subscriber::from_new(id, subscriber, now);
                    table.by_email.insert(email, id);
                    table.rows.insert(id, row.clone());
                    row
                }
            }
        };

        self.persist().await?;
        Ok(row)
    }

    async fn get(&self, id: u64) -> StoreResult<Option<Subscriber>> {
        Ok(self.table.read().rows.get(&id).cloned())
    }

    async fn get_by_email(&self, email: &str) -> StoreResult<Option<Subscriber>> {
        let table = self.table.read();
        Ok(table
            .by_email
            .get(&normalize_email(email))
            .and_then(|id| table.rows.get(id))
            .cloned())
    }

    async fn list(&self, query: &SubscriberQuery) -> StoreResult<Vec<Subscriber>> {
        let needle = query
            .search
            .as_deref()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty());
        let per_page = query.per_page.max(1);
        let offset = query.page.saturating_sub(1) * per_page;

        let table = self.table.read();
        Ok(table
            .rows
            .values()
            .rev()
            .filter(|row| query.statuses.is_empty() || query.statuses.contains(&row.status))
            .filter(|row| needle.as_deref().map_or(true, |n| row.matches_search(n)))
            .skip(offset)
            .take(per_page)
            .cloned()
            .collect())
    }

    async fn counts(&self) -> StoreResult<BTreeMap<SubscriberStatus, usize>> {
        let mut counts = BTreeMap::new();
        for row in self.table.read().rows.values() {
            *counts.entry(row.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn delete(&self, id: u64) -> StoreResult<bool> {
        let removed = {
            let mut table = self.table.write();
            match table.rows.remove(&id) {
                Some(row) => {
                    table.by_email.remove(&row.email);
                    true
                }
                None => false,
            }
        };
        if removed {
            self.persist().await?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn new_subscriber(email: &str) -> NewSubscriber {
        NewSubscriber {
            email: email.to_string(),
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            fields: BTreeMap::from([("last_name".to_string(), "Lovelace".to_string())]),
            tags: BTreeSet::from(["10".to_string()]),
            forms: BTreeSet::from(["100".to_string()]),
        }
    }

    #[tokio::test]
    async fn test_insert_then_merge() {
        let store = JsonSubscriberStore::in_memory();
        let first = store
            .upsert_by_email(new_subscriber("Ada@Example.com "))
            .await
            .unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(first.email, "ada@example.com");
        assert_eq!(first.status, SubscriberStatus::Active);

        let update = NewSubscriber {
            email: "ada@example.com".to_string(),
            first_name: String::new(),
            last_name: String::new(),
            fields: BTreeMap::from([
                ("last_name".to_string(), String::new()),
                ("country".to_string(), "UK".to_string()),
            ]),
            tags: BTreeSet::from(["11".to_string()]),
            forms: BTreeSet::new(),
        };
        let merged = store.upsert_by_email(update).await.unwrap();

        assert_eq!(merged.id, 1);
        assert_eq!(merged.first_name, "Ada");
        assert_eq!(merged.fields["last_name"], "Lovelace");
        assert_eq!(merged.fields["country"], "UK");
        assert_eq!(
            merged.tags,
            BTreeSet::from(["10".to_string(), "11".to_string()])
        );
        assert_eq!(merged.forms, BTreeSet::from(["100".to_string()]));
        assert!(merged.modified >= merged.created);
    }

    #[tokio::test]
    async fn test_repeated_upsert_never_shrinks_sets() {
        let store = JsonSubscriberStore::in_memory();
        let once = store.upsert_by_email(new_subscriber("a@b.co")).await.unwrap();
        let twice = store.upsert_by_email(new_subscriber("a@b.co")).await.unwrap();
        assert_eq!(once.fields, twice.fields);
        assert_eq!(once.tags, twice.tags);
        assert_eq!(once.forms, twice.forms);
    }

    #[tokio::test]
    async fn test_missing_email_is_rejected() {
        let store = JsonSubscriberStore::in_memory();
        let result = store.upsert_by_email(new_subscriber("   ")).await;
        assert!(matches!(result, Err(StoreError::MissingEmail)));
    }

    #[tokio::test]
    async fn test_list_search_and_pagination() {
        let store = JsonSubscriberStore::in_memory();
        for i in 0..5 {
            store
                .upsert_by_email(new_subscriber(&format!("user{i}@example.com")))
                .await
                .unwrap();
        }

        let page = store
            .list(&SubscriberQuery {
                per_page: 2,
                page: 1,
                ..SubscriberQuery::default()
            })
            .await
            .unwrap();
        let emails: Vec<_> = page.iter().map(|s| s.email.as_str()).collect();
        assert_eq!(emails, vec!["user4@example.com", "user3@example.com"]);

        let found = store
            .list(&SubscriberQuery {
                search: Some("USER2".to_string()),
                ..SubscriberQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 1);

        let inactive = store
            .list(&SubscriberQuery {
                statuses: vec![SubscriberStatus::Inactive],
                ..SubscriberQuery::default()
            })
            .await
            .unwrap();
        assert!(inactive.is_empty());
    }

    #[tokio::test]
    async fn test_counts_and_delete() {
        let store = JsonSubscriberStore::in_memory();
        let row = store.upsert_by_email(new_subscriber("x@y.io")).await.unwrap();
        assert_eq!(store.counts().await.unwrap()[&SubscriberStatus::Active], 1);

        assert!(store.delete(row.id).await.unwrap());
        assert!(!store.delete(row.id).await.unwrap());
        assert!(store.get_by_email("x@y.io").await.unwrap().is_none());
        assert!(store.counts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_backed_store_keeps_ids_unique_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subscribers.json");

        {
            let store = JsonSubscriberStore::open(&path).await.unwrap();
            store.upsert_by_email(new_subscriber("one@example.com")).await.unwrap();
        }

        let store = JsonSubscriberStore::open(&path).await.unwrap();
        let existing = store.get_by_email("one@example.com").await.unwrap().unwrap();
        assert_eq!(existing.id, 1);

        let second = store
            .upsert_by_email(new_subscriber("two@example.com"))
            .await
            .unwrap();
        assert_eq!(second.id, 2);
    }
}
