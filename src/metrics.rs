//! Pipeline Metrics
//!
//! Counters for every stage of the webhook pipeline plus a small ring
//! buffer of processing durations, exported in Prometheus text format.
//!
//! # Example
//!
//! ```rust
//! use freemkit::metrics::global_metrics;
//! use std::time::Duration;
//!
//! global_metrics().record_request("/freemkit/v1/webhook", 202, Duration::from_millis(3));
//! let output = global_metrics().to_prometheus_format();
//! assert!(output.contains("freemkit_requests_total"));
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::webhook::events::Tier;

/// Maximum number of duration samples kept for percentiles
const MAX_HISTOGRAM_SAMPLES: usize = 1000;

/// Webhook pipeline metrics
#[derive(Debug)]
pub struct Metrics {
    /// Webhook HTTP requests received (any transport)
    pub requests_total: AtomicU64,
    /// Deliveries rejected before queuing
    pub rejected_total: AtomicU64,
    /// Deliveries accepted for deferred processing
    pub queued_total: AtomicU64,
    /// Redeliveries suppressed by the replay guard
    pub duplicates_total: AtomicU64,
    /// Processing runs that succeeded
    pub processed_total: AtomicU64,
    /// Processing runs whose event type mapped to no tier
    pub unmapped_total: AtomicU64,
    /// Failed processing runs that were rescheduled
    pub retries_total: AtomicU64,
    /// Events dropped after exhausting their attempts
    pub dropped_total: AtomicU64,
    /// Events waiting in the queue
    pub pending_events: AtomicI64,

    durations: RwLock<RingBuffer<Duration>>,
    rejections_by_code: RwLock<BTreeMap<&'static str, u64>>,
    subscriptions_by_tier: RwLock<BTreeMap<&'static str, u64>>,
    requests_by_status: RwLock<BTreeMap<u16, u64>>,
    start_time: OnceLock<Instant>,
}

/// Fixed-capacity sample buffer
#[derive(Debug)]
struct RingBuffer<T> {
    data: Vec<T>,
    capacity: usize,
    write_pos: usize,
}

impl<T: Clone + Ord> RingBuffer<T> {
    fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
            write_pos: 0,
        }
    }

    fn push(&mut self, value: T) {
        if self.data.len() < self.capacity {
            self.data.push(value);
        } else {
            self.data[self.write_pos] = value;
        }
        self.write_pos = (self.write_pos + 1) % self.capacity;
    }

    /// Percentile in `0.0..=1.0`
    fn percentile(&self, p: f64) -> Option<T> {
        if self.data.is_empty() {
            return None;
        }
        let mut sorted = self.data.clone();
        sorted.sort();
        let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
        sorted.get(idx).cloned()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create an empty collector
    pub fn new() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            rejected_total: AtomicU64::new(0),
            queued_total: AtomicU64::new(0),
            duplicates_total: AtomicU64::new(0),
            processed_total: AtomicU64::new(0),
            unmapped_total: AtomicU64::new(0),
            retries_total: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
            pending_events: AtomicI64::new(0),
            durations: RwLock::new(RingBuffer::new(MAX_HISTOGRAM_SAMPLES)),
            rejections_by_code: RwLock::new(BTreeMap::new()),
            subscriptions_by_tier: RwLock::new(BTreeMap::new()),
            requests_by_status: RwLock::new(BTreeMap::new()),
            start_time: OnceLock::new(),
        }
    }

    /// Record a webhook HTTP request
    pub fn record_request(&self, path: &str, status_code: u16, duration: Duration) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        *self.requests_by_status.write().entry(status_code).or_insert(0) += 1;
        tracing::trace!(path, status_code, elapsed_ms = duration.as_millis() as u64, "request recorded");
    }

    /// Record a rejected delivery by error code
    pub fn record_rejection(&self, code: &'static str) {
        self.rejected_total.fetch_add(1, Ordering::Relaxed);
        *self.rejections_by_code.write().entry(code).or_insert(0) += 1;
    }

    /// Record an event stored for deferred processing
    pub fn record_queued(&self) {
        self.queued_total.fetch_add(1, Ordering::Relaxed);
        self.pending_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a suppressed redelivery
    pub fn record_duplicate(&self) {
        self.duplicates_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a processing run that left the queue (success or drop)
    pub fn record_dequeued(&self) {
        self.pending_events.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a successful processing run
    pub fn record_processed(&self, tier: Option<Tier>, duration: Duration) {
        self.processed_total.fetch_add(1, Ordering::Relaxed);
        match tier {
            Some(tier) => {
                *self
                    .subscriptions_by_tier
                    .write()
                    .entry(tier.as_str())
                    .or_insert(0) += 1
            }
            None => {
                self.unmapped_total.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.durations.write().push(duration);
    }

    /// Record a rescheduled failure
    pub fn record_retry(&self) {
        self.retries_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an event given up on
    pub fn record_dropped(&self) {
        self.dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Seconds since [`init`] was called
    pub fn uptime(&self) -> Duration {
        self.start_time
            .get()
            .map(Instant::elapsed)
            .unwrap_or_default()
    }

    /// Processing duration percentile (`0.0..=1.0`)
    pub fn processing_percentile(&self, p: f64) -> Option<Duration> {
        self.durations.read().percentile(p)
    }

    /// Rejections keyed by error code
    pub fn rejections(&self) -> BTreeMap<&'static str, u64> {
        self.rejections_by_code.read().clone()
    }

    /// Convert metrics to Prometheus text format
    pub fn to_prometheus_format(&self) -> String {
        let mut output = String::new();

        let counters = [
            ("freemkit_requests_total", &self.requests_total),
            ("freemkit_webhooks_rejected_total", &self.rejected_total),
            ("freemkit_webhooks_queued_total", &self.queued_total),
            ("freemkit_webhooks_duplicate_total", &self.duplicates_total),
            ("freemkit_webhooks_processed_total", &self.processed_total),
            ("freemkit_webhooks_unmapped_total", &self.unmapped_total),
            ("freemkit_webhook_retries_total", &self.retries_total),
            ("freemkit_webhooks_dropped_total", &self.dropped_total),
        ];
        for (name, counter) in counters {
            output.push_str(&format!("{} {}\n", name, counter.load(Ordering::Relaxed)));
        }

        output.push_str(&format!(
            "freemkit_pending_events {}\n",
            self.pending_events.load(Ordering::Relaxed).max(0)
        ));

        for (status, count) in self.requests_by_status.read().iter() {
            output.push_str(&format!(
                "freemkit_requests_by_status{{status=\"{}\"}} {}\n",
                status, count
            ));
        }
        for (code, count) in self.rejections_by_code.read().iter() {
            output.push_str(&format!(
                "freemkit_rejections{{code=\"{}\"}} {}\n",
                code, count
            ));
        }
        for (tier, count) in self.subscriptions_by_tier.read().iter() {
            output.push_str(&format!(
                "freemkit_subscriptions{{tier=\"{}\"}} {}\n",
                tier, count
            ));
        }

        for (label, p) in [("p50", 0.5), ("p95", 0.95), ("p99", 0.99)] {
            if let Some(value) = self.processing_percentile(p) {
                output.push_str(&format!(
                    "freemkit_processing_duration_{}_ms {}\n",
                    label,
                    value.as_millis()
                ));
            }
        }

        output
    }
}

/// Process-wide metrics instance
pub static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get or initialize the global metrics instance
pub fn global_metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Initialize global metrics and start the uptime clock (call once at startup)
pub fn init() {
    let _ = global_metrics().start_time.set(Instant::now());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = Metrics::new();

        metrics.record_request("/freemkit/v1/webhook", 202, Duration::from_millis(2));
        assert_eq!(metrics.requests_total.load(Ordering::Relaxed), 1);

        metrics.record_rejection("invalid_signature");
        metrics.record_rejection("invalid_signature");
        assert_eq!(metrics.rejected_total.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.rejections()["invalid_signature"], 2);

        metrics.record_queued();
        assert_eq!(metrics.pending_events.load(Ordering::Relaxed), 1);
        metrics.record_processed(Some(Tier::Paid), Duration::from_millis(40));
        metrics.record_dequeued();
        assert_eq!(metrics.pending_events.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.unmapped_total.load(Ordering::Relaxed), 0);

        metrics.record_processed(None, Duration::from_millis(1));
        assert_eq!(metrics.unmapped_total.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = Metrics::new();
        metrics.record_request("/", 400, Duration::from_millis(1));
        metrics.record_rejection("stale_webhook");
        metrics.record_processed(Some(Tier::Free), Duration::from_millis(10));

        let output = metrics.to_prometheus_format();
        assert!(output.contains("freemkit_requests_total 1\n"));
        assert!(output.contains("freemkit_requests_by_status{status=\"400\"} 1\n"));
        assert!(output.contains("freemkit_rejections{code=\"stale_webhook\"} 1\n"));
        assert!(output.contains("freemkit_subscriptions{tier=\"free\"} 1\n"));
        assert!(output.contains("freemkit_processing_duration_p50_ms 10\n"));
    }

    #[test]
    fn test_ring_buffer_wraps() {
        let mut buffer = RingBuffer::new(3);
        for value in [5, 1, 9, 2] {
            buffer.push(value);
        }
        assert_eq!(buffer.data.len(), 3);
        assert_eq!(buffer.percentile(0.0), Some(1));
        assert_eq!(buffer.percentile(1.0), Some(9));
    }
}
