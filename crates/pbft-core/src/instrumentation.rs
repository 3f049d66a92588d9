//! Production instrumentation for the agreement core.
//!
//! A single process-wide [`METRICS`] instance of lock-free counters and
//! gauges:
//!
//! - **Throughput**: messages sent/received, requests executed, batches committed
//! - **Rejections**: authentication failures, protocol violations, framing errors
//! - **Health**: current view, last executed and last stable sequence numbers
//!
//! ## Usage
//!
//! ```ignore
//! use pbft_core::instrumentation::METRICS;
//!
//! METRICS.increment_messages_received();
//! METRICS.set_view_number(view.as_u64());
//! let text = METRICS.export_prometheus();
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics instance.
pub static METRICS: Metrics = Metrics::new();

/// Counters and gauges for one replica process.
///
/// All fields are atomics with relaxed ordering; readers get a consistent
/// value per metric, not a consistent snapshot across metrics.
#[derive(Debug)]
pub struct Metrics {
    // === Throughput Counters ===
    messages_received_total: AtomicU64,
    messages_sent_total: AtomicU64,
    requests_executed_total: AtomicU64,
    batches_committed_total: AtomicU64,
    read_only_executed_total: AtomicU64,

    // === Rejection Counters ===
    authentication_failures_total: AtomicU64,
    protocol_rejections_total: AtomicU64,
    framing_errors_total: AtomicU64,
    dropped_tasks_total: AtomicU64,

    // === Protocol Events ===
    view_changes_total: AtomicU64,
    stable_checkpoints_total: AtomicU64,
    keys_installed_total: AtomicU64,

    // === Health Gauges ===
    view_number: AtomicU64,
    last_executed: AtomicU64,
    last_stable: AtomicU64,
    pending_requests: AtomicU64,
}

impl Metrics {
    const fn new() -> Self {
        Self {
            messages_received_total: AtomicU64::new(0),
            messages_sent_total: AtomicU64::new(0),
            requests_executed_total: AtomicU64::new(0),
            batches_committed_total: AtomicU64::new(0),
            read_only_executed_total: AtomicU64::new(0),
            authentication_failures_total: AtomicU64::new(0),
            protocol_rejections_total: AtomicU64::new(0),
            framing_errors_total: AtomicU64::new(0),
            dropped_tasks_total: AtomicU64::new(0),
            view_changes_total: AtomicU64::new(0),
            stable_checkpoints_total: AtomicU64::new(0),
            keys_installed_total: AtomicU64::new(0),
            view_number: AtomicU64::new(0),
            last_executed: AtomicU64::new(0),
            last_stable: AtomicU64::new(0),
            pending_requests: AtomicU64::new(0),
        }
    }

    // ========================================================================
    // Counters
    // ========================================================================

    pub fn increment_messages_received(&self) {
        self.messages_received_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_messages_sent(&self, count: u64) {
        self.messages_sent_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_requests_executed(&self) {
        self.requests_executed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_batches_committed(&self) {
        self.batches_committed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_read_only_executed(&self) {
        self.read_only_executed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_authentication_failures(&self) {
        self.authentication_failures_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_protocol_rejections(&self) {
        self.protocol_rejections_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_framing_errors(&self) {
        self.framing_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a task dropped because the task queue was full.
    pub fn increment_dropped_tasks(&self) {
        self.dropped_tasks_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_view_changes(&self) {
        self.view_changes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_stable_checkpoints(&self) {
        self.stable_checkpoints_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_keys_installed(&self) {
        self.keys_installed_total.fetch_add(1, Ordering::Relaxed);
    }

    // ========================================================================
    // Gauges
    // ========================================================================

    pub fn set_view_number(&self, view: u64) {
        self.view_number.store(view, Ordering::Relaxed);
    }

    pub fn set_last_executed(&self, seqno: u64) {
        self.last_executed.store(seqno, Ordering::Relaxed);
    }

    pub fn set_last_stable(&self, seqno: u64) {
        self.last_stable.store(seqno, Ordering::Relaxed);
    }

    pub fn set_pending_requests(&self, count: u64) {
        self.pending_requests.store(count, Ordering::Relaxed);
    }

    // ========================================================================
    // Metric Export
    // ========================================================================

    /// Exports all metrics in Prometheus exposition format.
    pub fn export_prometheus(&self) -> String {
        use std::fmt::Write;

        let counters = [
            (
                "pbft_messages_received_total",
                "Protocol messages received",
                &self.messages_received_total,
            ),
            (
                "pbft_messages_sent_total",
                "Protocol messages sent",
                &self.messages_sent_total,
            ),
            (
                "pbft_requests_executed_total",
                "Client requests executed in agreed order",
                &self.requests_executed_total,
            ),
            (
                "pbft_batches_committed_total",
                "Sequence numbers committed",
                &self.batches_committed_total,
            ),
            (
                "pbft_read_only_executed_total",
                "Read-only requests answered without agreement",
                &self.read_only_executed_total,
            ),
            (
                "pbft_authentication_failures_total",
                "Messages dropped for bad signatures or MACs",
                &self.authentication_failures_total,
            ),
            (
                "pbft_protocol_rejections_total",
                "Messages dropped for protocol violations",
                &self.protocol_rejections_total,
            ),
            (
                "pbft_framing_errors_total",
                "Datagrams dropped at the frame parser",
                &self.framing_errors_total,
            ),
            (
                "pbft_dropped_tasks_total",
                "Tasks dropped by task queue backpressure",
                &self.dropped_tasks_total,
            ),
            (
                "pbft_view_changes_total",
                "View changes started",
                &self.view_changes_total,
            ),
            (
                "pbft_stable_checkpoints_total",
                "Checkpoints that became stable",
                &self.stable_checkpoints_total,
            ),
            (
                "pbft_keys_installed_total",
                "Peer session keys installed",
                &self.keys_installed_total,
            ),
        ];

        let gauges = [
            ("pbft_view_number", "Current view number", &self.view_number),
            (
                "pbft_last_executed",
                "Last executed sequence number",
                &self.last_executed,
            ),
            (
                "pbft_last_stable",
                "Last stable checkpoint sequence number",
                &self.last_stable,
            ),
            (
                "pbft_pending_requests",
                "Requests waiting to be ordered",
                &self.pending_requests,
            ),
        ];

        let mut output = String::new();
        for (name, help, value) in counters {
            let _ = write!(
                output,
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {}\n",
                value.load(Ordering::Relaxed)
            );
        }
        for (name, help, value) in gauges {
            let _ = write!(
                output,
                "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {}\n",
                value.load(Ordering::Relaxed)
            );
        }
        output
    }

    /// Returns a snapshot of the counters for tests and debugging.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_received_total: self.messages_received_total.load(Ordering::Relaxed),
            requests_executed_total: self.requests_executed_total.load(Ordering::Relaxed),
            authentication_failures_total: self
                .authentication_failures_total
                .load(Ordering::Relaxed),
            protocol_rejections_total: self.protocol_rejections_total.load(Ordering::Relaxed),
            framing_errors_total: self.framing_errors_total.load(Ordering::Relaxed),
            view_changes_total: self.view_changes_total.load(Ordering::Relaxed),
            stable_checkpoints_total: self.stable_checkpoints_total.load(Ordering::Relaxed),
            view_number: self.view_number.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of selected metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages_received_total: u64,
    pub requests_executed_total: u64,
    pub authentication_failures_total: u64,
    pub protocol_rejections_total: u64,
    pub framing_errors_total: u64,
    pub view_changes_total: u64,
    pub stable_checkpoints_total: u64,
    pub view_number: u64,
}
