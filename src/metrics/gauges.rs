//! Gauge metrics for values that go up and down.

use std::sync::atomic::{AtomicI64, Ordering};

/// A gauge holding a signed integer.
#[derive(Debug)]
pub struct Gauge {
    name: &'static str,
    help: &'static str,
    value: AtomicI64,
}

impl Gauge {
    /// Create a new gauge.
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicI64::new(0),
        }
    }

    /// Get the gauge name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Get the gauge help text.
    pub fn help(&self) -> &'static str {
        self.help
    }

    /// Set the value.
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Add `n` (may be negative).
    pub fn add(&self, n: i64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Increment by 1.
    pub fn inc(&self) {
        self.add(1);
    }

    /// Decrement by 1.
    pub fn dec(&self) {
        self.add(-1);
    }

    /// Get the current value.
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauge() {
        let gauge = Gauge::new("memory_series", "Series in memory");
        gauge.set(10);
        gauge.inc();
        gauge.add(-3);
        gauge.dec();
        assert_eq!(gauge.get(), 7);
    }
}
