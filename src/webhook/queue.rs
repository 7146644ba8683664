//! Deferred Event Queue
//!
//! Accepted deliveries are acknowledged quickly and processed later.
//!
//! # Architecture
//!
//! ```text
//! enqueue(raw)
//!       |
//!       v
//! [Seen before?] --> yes --> Ignored ("Duplicate webhook ignored.")
//!       |
//!       v
//! [Mark seen] -> [Store {input, attempts: 0}] -> [Schedule after ~1s]
//!       |                                               |
//!       | scheduler unavailable                         v
//!       v                                        QueueWorker::run
//! process_queued(key) inline  <---------------------------+
//!       |
//!       +-- success --> delete record
//!       +-- failure --> attempts + 1 >= max? --> delete record + seen-marker
//!                                          \--> store, reschedule in min(5m, n * 1m)
//!                                               (or retry inline when unavailable)
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::WebhookPolicy;
use crate::error::{WebhookError, WebhookResult};
use crate::metrics::global_metrics;
use crate::store::KeyValueStore;
use crate::webhook::dedup::{event_key, ReplayGuard};
use crate::webhook::processor::{PayloadProcessor, ProcessOutcome};
use crate::webhook::scheduler::{ScheduledReceiver, Scheduler};

/// Key prefix for queue records
pub const QUEUE_PREFIX: &str = "freemkit_webhook_queue_";

/// A persisted pending delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedEvent {
    /// Raw payload as received
    pub input: String,
    /// Failed attempts so far
    #[serde(default)]
    pub attempts: u32,
}

/// How an accepted delivery was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnqueueStatus {
    /// Stored and scheduled for later
    Queued,
    /// Processed before returning
    Processed,
    /// Redelivery of a known event
    Ignored,
}

/// Result of [`EventQueue::enqueue`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnqueueOutcome {
    /// What happened
    pub status: EnqueueStatus,
    /// Message returned to the sender
    pub message: String,
}

impl EnqueueOutcome {
    fn new(status: EnqueueStatus, message: &str) -> Self {
        Self {
            status,
            message: message.to_string(),
        }
    }
}

/// Result of one queue worker run for a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueProgress {
    /// No record; already done or expired
    Missing,
    /// Processed and removed
    Completed(ProcessOutcome),
    /// Failed and rescheduled
    Retrying {
        /// Failed attempts so far
        attempts: u32,
        /// Delay before the next attempt
        delay: Duration,
    },
    /// Failed for the last time; record and seen-marker removed
    Dropped {
        /// Total failed attempts
        attempts: u32,
        /// Last error
        error: WebhookError,
    },
}

/// Persistent queue with replay suppression and bounded retry
pub struct EventQueue {
    store: Arc<dyn KeyValueStore>,
    guard: ReplayGuard,
    processor: Arc<dyn PayloadProcessor>,
    scheduler: Arc<dyn Scheduler>,
    policy: WebhookPolicy,
}

impl EventQueue {
    /// Create a queue; seen-markers share `store` with queue records
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        processor: Arc<dyn PayloadProcessor>,
        scheduler: Arc<dyn Scheduler>,
        policy: WebhookPolicy,
    ) -> Self {
        let guard = ReplayGuard::new(store.clone(), policy.replay_ttl());
        Self {
            store,
            guard,
            processor,
            scheduler,
            policy,
        }
    }

    /// Replay guard used by this queue
    pub fn guard(&self) -> &ReplayGuard {
        &self.guard
    }

    /// Accept a verified delivery.
    ///
    /// Falls back to inline processing when the scheduler cannot defer.
    pub async fn enqueue(&self, raw: &[u8]) -> WebhookResult<EnqueueOutcome> {
        let input = std::str::from_utf8(raw)
            .map_err(|_| WebhookError::InvalidRequest)?
            .to_string();
        let key = event_key(raw);

        if self.guard.is_duplicate(&key).await? {
            debug!(event_key = %key, "Duplicate webhook ignored");
            global_metrics().record_duplicate();
            return Ok(EnqueueOutcome::new(
                EnqueueStatus::Ignored,
                "Duplicate webhook ignored.",
            ));
        }

        self.guard.mark_seen(&key).await?;
        let record = QueuedEvent { input, attempts: 0 };
        self.save(&key, &record).await?;
        global_metrics().record_queued();

        let outcome = self.scheduler.schedule(&key, self.policy.initial_delay());
        if !outcome.is_deferred() {
            debug!(event_key = %key, "Scheduling unavailable; processing inline");
            if let Err(e) = self.process_queued(&key).await {
                warn!(event_key = %key, error = %e, "Inline processing failed");
            }
            return Ok(EnqueueOutcome::new(
                EnqueueStatus::Processed,
                "Webhook processed immediately because scheduling was unavailable.",
            ));
        }

        debug!(event_key = %key, ?outcome, "Webhook queued");
        Ok(EnqueueOutcome::new(
            EnqueueStatus::Queued,
            "Webhook accepted for asynchronous processing.",
        ))
    }

    /// Run one processing attempt for a queued key.
    ///
    /// Storage errors are returned; processing errors are absorbed into
    /// the retry policy. When a retry cannot be scheduled it runs inline,
    /// so a record always ends completed or dropped.
    pub async fn process_queued(&self, key: &str) -> WebhookResult<QueueProgress> {
        let Some(mut record) = self.load(key).await? else {
            return Ok(QueueProgress::Missing);
        };

        loop {
            let e = match self.processor.process(record.input.as_bytes()).await {
                Ok(outcome) => {
                    self.store.delete(&queue_key(key)).await?;
                    global_metrics().record_dequeued();
                    return Ok(QueueProgress::Completed(outcome));
                }
                Err(e) => e,
            };

            let attempts = record.attempts.saturating_add(1);
            if attempts >= self.policy.max_attempts {
                error!(
                    event_key = %key,
                    attempts,
                    error = %e,
                    "Webhook dropped after retries"
                );
                self.store.delete(&queue_key(key)).await?;
                self.guard.clear(key).await?;
                global_metrics().record_dequeued();
                global_metrics().record_dropped();
                return Ok(QueueProgress::Dropped { attempts, error: e });
            }

            record.attempts = attempts;
            self.save(key, &record).await?;
            global_metrics().record_retry();
            let delay = self.policy.retry_delay(attempts);

            if self.scheduler.schedule(key, delay).is_deferred() {
                warn!(
                    event_key = %key,
                    attempts,
                    max_attempts = self.policy.max_attempts,
                    delay_secs = delay.as_secs(),
                    error = %e,
                    "Webhook processing failed; retrying"
                );
                return Ok(QueueProgress::Retrying { attempts, delay });
            }

            warn!(
                event_key = %key,
                attempts,
                max_attempts = self.policy.max_attempts,
                error = %e,
                "Webhook processing failed; retrying inline"
            );
        }
    }

    /// Schedule every stored record again, e.g. after a restart.
    ///
    /// Returns how many keys were handed to the scheduler.
    pub async fn reschedule_pending(&self) -> WebhookResult<usize> {
        let mut scheduled = 0;
        for stored in self.store.keys_with_prefix(QUEUE_PREFIX).await? {
            let key = &stored[QUEUE_PREFIX.len()..];
            if self
                .scheduler
                .schedule(key, self.policy.initial_delay())
                .is_deferred()
            {
                scheduled += 1;
            }
        }
        Ok(scheduled)
    }

    /// Load a queue record; unreadable or empty records count as missing
    pub async fn load(&self, key: &str) -> WebhookResult<Option<QueuedEvent>> {
        let Some(value) = self.store.get(&queue_key(key)).await? else {
            return Ok(None);
        };
        match serde_json::from_value::<QueuedEvent>(value) {
            Ok(record) if !record.input.is_empty() => Ok(Some(record)),
            _ => {
                warn!(event_key = %key, "Discarding unreadable queue record");
                self.store.delete(&queue_key(key)).await?;
                Ok(None)
            }
        }
    }

    async fn save(&self, key: &str, record: &QueuedEvent) -> WebhookResult<()> {
        let value = serde_json::to_value(record)
            .map_err(|e| WebhookError::Storage(e.to_string()))?;
        self.store
            .set(&queue_key(key), value, self.policy.queue_ttl())
            .await?;
        Ok(())
    }
}

fn queue_key(key: &str) -> String {
    format!("{QUEUE_PREFIX}{key}")
}

/// Background worker that runs due keys
pub struct QueueWorker {
    queue: Arc<EventQueue>,
    receiver: ScheduledReceiver,
}

impl QueueWorker {
    /// Pair a queue with the receiving side of its scheduler
    pub fn new(queue: Arc<EventQueue>, receiver: ScheduledReceiver) -> Self {
        Self { queue, receiver }
    }

    /// Run until every scheduler handle is dropped.
    ///
    /// This should be spawned as a tokio task:
    ///
    /// ```rust,ignore
    /// tokio::spawn(worker.run());
    /// ```
    pub async fn run(mut self) {
        info!("Starting webhook queue worker");

        while let Some(key) = self.receiver.recv().await {
            let queue = self.queue.clone();
            // Keys are independent; each runs in its own task
            tokio::spawn(async move {
                match queue.process_queued(&key).await {
                    Ok(progress) => debug!(event_key = %key, ?progress, "Queue run finished"),
                    Err(e) => error!(event_key = %key, error = %e, "Queue run failed"),
                }
            });
        }

        info!("Webhook queue worker shutting down");
    }
}
