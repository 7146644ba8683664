//! Deferred task scheduling.
//!
//! The queue only asks for "run this event key after a delay". A
//! [`TokioScheduler`] arms a timer task per key and hands due keys to the
//! queue worker over a channel; the same key is never armed twice. When no
//! runtime is available, or the worker has gone away, scheduling reports
//! [`ScheduleOutcome::Unavailable`] and the queue processes inline instead.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// Result of asking for a deferred run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// A new timer was armed
    Scheduled,
    /// A timer for this key is already pending
    AlreadyScheduled,
    /// Deferred execution is not possible right now
    Unavailable,
}

impl ScheduleOutcome {
    /// Whether the key will be delivered to the worker later
    pub fn is_deferred(&self) -> bool {
        !matches!(self, Self::Unavailable)
    }
}

/// Deferred-execution facility used by the event queue
pub trait Scheduler: Send + Sync + 'static {
    /// Ask for `key` to be delivered to the worker after `delay`
    fn schedule(&self, key: &str, delay: Duration) -> ScheduleOutcome;
}

/// Scheduler that never defers; every event is processed inline
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledScheduler;

impl Scheduler for DisabledScheduler {
    fn schedule(&self, _key: &str, _delay: Duration) -> ScheduleOutcome {
        ScheduleOutcome::Unavailable
    }
}

/// In-process timer scheduler backed by tokio
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    sender: mpsc::Sender<String>,
    pending: Arc<Mutex<HashSet<String>>>,
}

/// Receiving side of a [`TokioScheduler`]; yields keys as they come due
#[derive(Debug)]
pub struct ScheduledReceiver {
    receiver: mpsc::Receiver<String>,
}

impl ScheduledReceiver {
    /// Next due key, or `None` once every scheduler handle is dropped
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }
}

impl TokioScheduler {
    /// Create a scheduler whose due-key channel holds `capacity` keys
    pub fn new(capacity: usize) -> (Self, ScheduledReceiver) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                sender,
                pending: Arc::new(Mutex::new(HashSet::new())),
            },
            ScheduledReceiver { receiver },
        )
    }

    /// Number of armed timers
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, key: &str, delay: Duration) -> ScheduleOutcome {
        if self.sender.is_closed() {
            return ScheduleOutcome::Unavailable;
        }
        let Ok(runtime) = Handle::try_current() else {
            return ScheduleOutcome::Unavailable;
        };

        if !self.pending.lock().insert(key.to_string()) {
            return ScheduleOutcome::AlreadyScheduled;
        }

        let key = key.to_string();
        let sender = self.sender.clone();
        let pending = self.pending.clone();
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            pending.lock().remove(&key);
            if sender.send(key.clone()).await.is_err() {
                tracing::warn!(event_key = %key, "Queue worker stopped; deferred event not delivered");
            }
        });

        ScheduleOutcome::Scheduled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_key_is_delivered_after_delay() {
        let (scheduler, mut receiver) = TokioScheduler::new(8);
        assert_eq!(
            scheduler.schedule("evt", Duration::from_secs(1)),
            ScheduleOutcome::Scheduled
        );
        assert_eq!(scheduler.pending(), 1);
        assert_eq!(receiver.recv().await.as_deref(), Some("evt"));
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_key_is_not_armed_twice() {
        let (scheduler, mut receiver) = TokioScheduler::new(8);
        scheduler.schedule("evt", Duration::from_secs(5));
        assert_eq!(
            scheduler.schedule("evt", Duration::from_secs(1)),
            ScheduleOutcome::AlreadyScheduled
        );
        assert_eq!(
            scheduler.schedule("other", Duration::from_secs(1)),
            ScheduleOutcome::Scheduled
        );
        assert_eq!(receiver.recv().await.as_deref(), Some("other"));
        assert_eq!(receiver.recv().await.as_deref(), Some("evt"));

        // once delivered the key can be armed again
        assert_eq!(
            scheduler.schedule("evt", Duration::from_secs(1)),
            ScheduleOutcome::Scheduled
        );
    }

    #[tokio::test]
    async fn test_closed_worker_is_unavailable() {
        let (scheduler, receiver) = TokioScheduler::new(1);
        drop(receiver);
        assert_eq!(
            scheduler.schedule("evt", Duration::ZERO),
            ScheduleOutcome::Unavailable
        );
    }

    #[test]
    fn test_no_runtime_is_unavailable() {
        let (scheduler, _receiver) = TokioScheduler::new(1);
        assert_eq!(
            scheduler.schedule("evt", Duration::ZERO),
            ScheduleOutcome::Unavailable
        );
        assert_eq!(
            DisabledScheduler.schedule("evt", Duration::ZERO),
            ScheduleOutcome::Unavailable
        );
    }
}
