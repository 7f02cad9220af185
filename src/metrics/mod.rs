//! Metrics module for observing an ingester.
//!
//! Metrics are plain atomics kept in-process; nothing is exported. Tests and
//! callers read them through [`IngesterMetrics::snapshot`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      IngesterMetrics                         │
//! │  ┌──────────────────┐  ┌──────────────┐  ┌────────────────┐  │
//! │  │  Counters        │  │   Gauges     │  │ LabeledCounter │  │
//! │  │ - samples        │  │ - series     │  │ - rejections   │  │
//! │  │ - chunks flushed │  │ - state      │  │   by reason    │  │
//! │  │ - transfers      │  │              │  │                │  │
//! │  └──────────────────┘  └──────────────┘  └────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod counters;
mod gauges;

pub use counters::{Counter, LabeledCounter};
pub use gauges::Gauge;

use crate::ring::NodeState;

/// Metrics for one ingester node.
#[derive(Debug)]
pub struct IngesterMetrics {
    // Ingestion
    /// Samples appended to the chunk store.
    pub samples_appended: Counter,
    /// Identical samples re-sent and ignored.
    pub samples_duplicated: Counter,
    /// Samples rejected, by reason.
    pub samples_rejected: LabeledCounter,
    /// Series created in memory.
    pub series_created: Counter,
    /// Series currently held in memory.
    pub memory_series: Gauge,

    // Flush
    /// Chunks written to the durable sink.
    pub chunks_flushed: Counter,
    /// Failed tenant flush attempts.
    pub flush_failures: Counter,

    // Transfer
    /// Successful outgoing transfers.
    pub transfers_out: Counter,
    /// Failed outgoing transfer attempts.
    pub transfers_failed: Counter,
    /// Series received through incoming transfers.
    pub series_received: Counter,

    // Ring
    /// Compare-and-swap conflicts on the ring key.
    pub ring_cas_conflicts: Counter,
    /// Current lifecycle state (see [`state_value`]).
    pub state: Gauge,
}

impl IngesterMetrics {
    /// Create a new metrics instance.
    pub fn new() -> Self {
        Self {
            samples_appended: Counter::new(
                "ingester_samples_appended_total",
                "Samples appended to memory",
            ),
            samples_duplicated: Counter::new(
                "ingester_samples_duplicated_total",
                "Identical samples ignored",
            ),
            samples_rejected: LabeledCounter::new("ingester_samples_rejected_total", "reason"),
            series_created: Counter::new("ingester_series_created_total", "Series created"),
            memory_series: Gauge::new("ingester_memory_series", "Series in memory"),
            chunks_flushed: Counter::new("ingester_chunks_flushed_total", "Chunks flushed"),
            flush_failures: Counter::new(
                "ingester_flush_failures_total",
                "Failed tenant flush attempts",
            ),
            transfers_out: Counter::new("ingester_transfers_out_total", "Completed transfers out"),
            transfers_failed: Counter::new(
                "ingester_transfers_failed_total",
                "Failed transfer attempts",
            ),
            series_received: Counter::new(
                "ingester_series_received_total",
                "Series received by transfer",
            ),
            ring_cas_conflicts: Counter::new(
                "ingester_ring_cas_conflicts_total",
                "Ring compare-and-swap conflicts",
            ),
            state: Gauge::new("ingester_state", "Lifecycle state"),
        }
    }

    /// Record the current lifecycle state.
    pub fn set_state(&self, state: NodeState) {
        self.state.set(state_value(state));
    }

    /// Record a rejected sample.
    pub fn record_rejection(&self, reason: &str) {
        self.samples_rejected.inc(reason);
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            samples_appended: self.samples_appended.get(),
            samples_duplicated: self.samples_duplicated.get(),
            samples_rejected: self.samples_rejected.total(),
            series_created: self.series_created.get(),
            memory_series: self.memory_series.get(),
            chunks_flushed: self.chunks_flushed.get(),
            flush_failures: self.flush_failures.get(),
            transfers_out: self.transfers_out.get(),
            transfers_failed: self.transfers_failed.get(),
            series_received: self.series_received.get(),
            ring_cas_conflicts: self.ring_cas_conflicts.get(),
        }
    }
}

impl Default for IngesterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Numeric encoding of a lifecycle state for the state gauge.
pub fn state_value(state: NodeState) -> i64 {
    match state {
        NodeState::Pending => 0,
        NodeState::Joining => 1,
        NodeState::Active => 2,
        NodeState::Leaving => 3,
        NodeState::Stopped => 4,
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub samples_appended: u64,
    pub samples_duplicated: u64,
    pub samples_rejected: u64,
    pub series_created: u64,
    pub memory_series: i64,
    pub chunks_flushed: u64,
    pub flush_failures: u64,
    pub transfers_out: u64,
    pub transfers_failed: u64,
    pub series_received: u64,
    pub ring_cas_conflicts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let metrics = IngesterMetrics::new();
        metrics.samples_appended.inc_by(3);
        metrics.record_rejection("out_of_order");
        metrics.memory_series.set(2);
        metrics.set_state(NodeState::Active);

        let snap = metrics.snapshot();
        assert_eq!(snap.samples_appended, 3);
        assert_eq!(snap.samples_rejected, 1);
        assert_eq!(snap.memory_series, 2);
        assert_eq!(metrics.state.get(), 2);
    }
}
