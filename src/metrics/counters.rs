//! Counter metrics for monotonically increasing values.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter.
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicU64::new(0),
        }
    }

    /// Get the counter name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Get the counter help text.
    pub fn help(&self) -> &'static str {
        self.help
    }

    /// Increment the counter by 1.
    pub fn inc(&self) {
        self.inc_by(1);
    }

    /// Increment the counter by `n`.
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get the current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A counter partitioned by a single label value (e.g. tenant or reason).
#[derive(Debug)]
pub struct LabeledCounter {
    name: &'static str,
    label: &'static str,
    values: DashMap<String, AtomicU64>,
}

impl LabeledCounter {
    /// Create a new labeled counter.
    pub fn new(name: &'static str, label: &'static str) -> Self {
        Self {
            name,
            label,
            values: DashMap::new(),
        }
    }

    /// Get the counter name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Get the label name.
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Increment the counter for `value` by `n`.
    pub fn inc_by(&self, value: &str, n: u64) {
        if let Some(counter) = self.values.get(value) {
            counter.fetch_add(n, Ordering::Relaxed);
            return;
        }
        self.values
            .entry(value.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(n, Ordering::Relaxed);
    }

    /// Increment the counter for `value` by 1.
    pub fn inc(&self, value: &str) {
        self.inc_by(value, 1);
    }

    /// Get the count for `value`.
    pub fn get(&self, value: &str) -> u64 {
        self.values
            .get(value)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Sum over all label values.
    pub fn total(&self) -> u64 {
        self.values
            .iter()
            .map(|c| c.value().load(Ordering::Relaxed))
            .sum()
    }
}
