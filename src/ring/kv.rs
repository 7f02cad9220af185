//! Versioned key-value store holding the ring descriptor.

use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::watch;

/// A value with its version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    /// Monotonic version, bumped on every successful write.
    pub version: u64,
    /// Raw value.
    pub value: Vec<u8>,
}

/// Result of a compare-and-swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    /// The value was written with the new version.
    Swapped { version: u64 },
    /// The expected version did not match; carries the current value.
    Conflict { current: Option<Versioned> },
}

/// Store for the ring key.
#[async_trait]
pub trait KvStore: Send + Sync + std::fmt::Debug {
    /// Read the current value.
    async fn get(&self, key: &str) -> Result<Option<Versioned>>;

    /// Write `value` if the key is at `expected_version`
    /// (`None` means the key must not exist).
    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: Option<u64>,
        value: Vec<u8>,
    ) -> Result<CasResult>;

    /// Subscribe to version changes of the key.
    fn watch(&self, key: &str) -> watch::Receiver<u64>;
}

/// In-memory store for testing and single-process clusters.
#[derive(Debug, Default)]
pub struct InMemoryKvStore {
    values: Mutex<HashMap<String, Versioned>>,
    watchers: Mutex<HashMap<String, watch::Sender<u64>>>,
    injected_conflicts: AtomicUsize,
}

impl InMemoryKvStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` compare-and-swaps fail as if another writer won.
    pub fn inject_conflicts(&self, n: usize) {
        self.injected_conflicts.store(n, Ordering::SeqCst);
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn notify(&self, key: &str, version: u64) {
        if let Some(tx) = self.watchers.lock().get(key) {
            tx.send_replace(version);
        }
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        Ok(self.values.lock().get(key).cloned())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: Option<u64>,
        value: Vec<u8>,
    ) -> Result<CasResult> {
        let version = {
            let mut values = self.values.lock();
            let current = values.get(key).cloned();
            if self.take_injected_conflict()
                || current.as_ref().map(|v| v.version) != expected_version
            {
                return Ok(CasResult::Conflict { current });
            }
            let version = expected_version.map_or(1, |v| v + 1);
            values.insert(key.to_string(), Versioned { version, value });
            version
        };
        self.notify(key, version);
        Ok(CasResult::Swapped { version })
    }

    fn watch(&self, key: &str) -> watch::Receiver<u64> {
        let current = self.values.lock().get(key).map_or(0, |v| v.version);
        self.watchers
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(current).0)
            .subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_compare_and_swap() {
        let kv = InMemoryKvStore::new();
        assert_eq!(
            kv.compare_and_swap("ring", None, b"a".to_vec()).await.unwrap(),
            CasResult::Swapped { version: 1 }
        );

        // Stale version loses and sees the current value.
        match kv.compare_and_swap("ring", None, b"b".to_vec()).await.unwrap() {
            CasResult::Conflict { current } => assert_eq!(current.unwrap().value, b"a"),
            other => panic!("unexpected {other:?}"),
        }

        assert_eq!(
            kv.compare_and_swap("ring", Some(1), b"c".to_vec()).await.unwrap(),
            CasResult::Swapped { version: 2 }
        );
        assert_eq!(kv.get("ring").await.unwrap().unwrap().value, b"c");
    }

    #[tokio::test]
    async fn test_watch_and_injected_conflicts() {
        let kv = InMemoryKvStore::new();
        let mut rx = kv.watch("ring");
        assert_eq!(*rx.borrow(), 0);

        kv.inject_conflicts(1);
        assert!(matches!(
            kv.compare_and_swap("ring", None, vec![1]).await.unwrap(),
            CasResult::Conflict { .. }
        ));
        kv.compare_and_swap("ring", None, vec![1]).await.unwrap();

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
    }
}
