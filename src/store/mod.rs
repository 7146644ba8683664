//! Persistence
//!
//! Two stores back the pipeline:
//!
//! - [`kv`]: a key-value store with per-entry TTL, holding queue records and
//!   replay markers
//! - [`subscribers`]: the local subscriber cache, keyed uniquely by email
//!
//! Both keep their data in memory and optionally mirror it to a JSON file so
//! state survives restarts (and separate CGI invocations).

pub mod kv;
pub mod subscribers;

use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use crate::config::StorageConfig;
use crate::error::StoreResult;

pub use kv::{KeyValueStore, TransientStore};
pub use subscribers::{
    JsonSubscriberStore, NewSubscriber, Subscriber, SubscriberQuery, SubscriberStatus,
    SubscriberStore,
};

/// File holding queue records and replay markers
pub const TRANSIENTS_FILE: &str = "transients.json";

/// File holding the subscriber table
pub const SUBSCRIBERS_FILE: &str = "subscribers.json";

/// Both stores, opened from one storage configuration
#[derive(Clone)]
pub struct Stores {
    /// Queue records and replay markers
    pub transients: Arc<dyn KeyValueStore>,
    /// Subscriber cache
    pub subscribers: Arc<dyn SubscriberStore>,
}

impl Stores {
    /// Memory-only stores
    pub fn in_memory() -> Self {
        Self {
            transients: Arc::new(TransientStore::in_memory()),
            subscribers: Arc::new(JsonSubscriberStore::in_memory()),
        }
    }

    /// Open file-backed stores under `data_dir`, or memory-only ones when unset.
    pub async fn open(config: &StorageConfig) -> StoreResult<Self> {
        let Some(dir) = config.data_dir.as_deref() else {
            info!("No data_dir configured; state is kept in memory only");
            return Ok(Self::in_memory());
        };

        let transients = TransientStore::open(dir.join(TRANSIENTS_FILE)).await?;
        let purged = transients.purge_expired().await?;
        let subscribers = JsonSubscriberStore::open(dir.join(SUBSCRIBERS_FILE)).await?;
        info!(data_dir = %dir.display(), purged, "Opened stores");

        Ok(Self {
            transients: Arc::new(transients),
            subscribers: Arc::new(subscribers),
        })
    }
}

/// Read a JSON file, returning `None` when it does not exist yet.
pub(crate) async fn read_json<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write JSON next to `path` and rename it into place.
pub(crate) async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let content = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
