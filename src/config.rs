//! Configuration types for the ingester.

use crate::error::{Error, Result};
use std::time::Duration;

/// Main configuration for an ingester node.
#[derive(Debug, Clone, Default)]
pub struct IngesterConfig {
    /// Ring membership and lifecycle configuration.
    pub lifecycler: LifecyclerConfig,

    /// In-memory chunk configuration.
    pub chunk: ChunkConfig,

    /// Flush configuration.
    pub flush: FlushConfig,

    /// Chunk handoff configuration.
    pub transfer: TransferConfig,
}

impl IngesterConfig {
    /// Create a configuration for the given instance id and address.
    pub fn new(instance_id: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            lifecycler: LifecyclerConfig::new(instance_id, addr),
            ..Default::default()
        }
    }

    /// Set lifecycler configuration.
    pub fn with_lifecycler_config(mut self, lifecycler: LifecyclerConfig) -> Self {
        self.lifecycler = lifecycler;
        self
    }

    /// Set chunk configuration.
    pub fn with_chunk_config(mut self, chunk: ChunkConfig) -> Self {
        self.chunk = chunk;
        self
    }

    /// Set flush configuration.
    pub fn with_flush_config(mut self, flush: FlushConfig) -> Self {
        self.flush = flush;
        self
    }

    /// Set transfer configuration.
    pub fn with_transfer_config(mut self, transfer: TransferConfig) -> Self {
        self.transfer = transfer;
        self
    }

    /// Set the join delay. `None` disables auto-join.
    pub fn with_join_after(mut self, join_after: Option<Duration>) -> Self {
        self.lifecycler.join_after = join_after;
        self
    }

    /// Set the number of ring tokens.
    pub fn with_num_tokens(mut self, num_tokens: usize) -> Self {
        self.lifecycler.num_tokens = num_tokens;
        self
    }

    /// Whether to remove the ring record on process shutdown.
    pub fn with_unregister_on_shutdown(mut self, unregister: bool) -> Self {
        self.lifecycler.unregister_on_shutdown = unregister;
        self
    }

    /// Set the maximum number of transfer attempts (0 disables transfer-out).
    pub fn with_max_transfer_retries(mut self, retries: usize) -> Self {
        self.transfer.max_transfer_retries = retries;
        self
    }

    /// Set the number of tenants flushed concurrently.
    pub fn with_concurrent_flushes(mut self, n: usize) -> Self {
        self.flush.concurrent_flushes = n;
        self
    }

    /// Set the head chunk idle threshold.
    pub fn with_max_chunk_idle(mut self, idle: Duration) -> Self {
        self.chunk.max_chunk_idle = idle;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        let l = &self.lifecycler;
        if l.instance_id.is_empty() {
            return Err(Error::Config("instance_id must not be empty".into()));
        }
        if l.ring_key.is_empty() {
            return Err(Error::Config("ring_key must not be empty".into()));
        }
        if l.num_tokens == 0 {
            return Err(Error::Config("num_tokens must be at least 1".into()));
        }
        if l.heartbeat_period.is_zero() {
            return Err(Error::Config("heartbeat_period must be non-zero".into()));
        }
        if l.max_cas_retries == 0 {
            return Err(Error::Config("max_cas_retries must be at least 1".into()));
        }
        if self.chunk.max_samples_per_chunk == 0 {
            return Err(Error::Config(
                "max_samples_per_chunk must be at least 1".into(),
            ));
        }
        if self.flush.concurrent_flushes == 0 {
            return Err(Error::Config("concurrent_flushes must be at least 1".into()));
        }
        if self.flush.flush_check_period.is_zero() {
            return Err(Error::Config("flush_check_period must be non-zero".into()));
        }
        if self.transfer.stream_buffer == 0 {
            return Err(Error::Config("stream_buffer must be at least 1".into()));
        }
        if self.transfer.min_backoff > self.transfer.max_backoff {
            return Err(Error::Config(
                "min_backoff must not exceed max_backoff".into(),
            ));
        }
        Ok(())
    }
}

/// Ring membership and lifecycle configuration.
#[derive(Debug, Clone)]
pub struct LifecyclerConfig {
    /// Identity of this node in the ring. Stable across restarts.
    pub instance_id: String,

    /// Address peers use to reach this node.
    pub addr: String,

    /// Key of the ring descriptor in the KV store.
    pub ring_key: String,

    /// Number of tokens claimed when joining.
    pub num_tokens: usize,

    /// Delay before auto-joining while pending.
    /// None means never auto-join (wait for a transfer-in).
    pub join_after: Option<Duration>,

    /// Interval between heartbeats.
    pub heartbeat_period: Duration,

    /// Heartbeats older than this mark an instance unhealthy.
    pub heartbeat_timeout: Duration,

    /// Remove the ring record on process shutdown.
    pub unregister_on_shutdown: bool,

    /// Pause after disposition before returning from shutdown.
    pub final_sleep: Duration,

    /// Maximum compare-and-swap attempts per ring update.
    pub max_cas_retries: usize,
}

impl Default for LifecyclerConfig {
    fn default() -> Self {
        Self {
            instance_id: "ingester-1".to_string(),
            addr: "127.0.0.1:9095".to_string(),
            ring_key: "ring".to_string(),
            num_tokens: 128,
            join_after: Some(Duration::from_secs(0)),
            heartbeat_period: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(60),
            unregister_on_shutdown: true,
            final_sleep: Duration::ZERO,
            max_cas_retries: 10,
        }
    }
}

impl LifecyclerConfig {
    /// Create a new lifecycler config for the given identity.
    pub fn new(instance_id: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            addr: addr.into(),
            ..Default::default()
        }
    }

    /// Set the ring key.
    pub fn with_ring_key(mut self, key: impl Into<String>) -> Self {
        self.ring_key = key.into();
        self
    }

    /// Set the heartbeat period.
    pub fn with_heartbeat_period(mut self, period: Duration) -> Self {
        self.heartbeat_period = period;
        self
    }

    /// Set the heartbeat timeout.
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Set the final sleep.
    pub fn with_final_sleep(mut self, sleep: Duration) -> Self {
        self.final_sleep = sleep;
        self
    }
}

/// What to do with a sample older than the series head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutOfOrderPolicy {
    /// Reject samples not newer than the last sample.
    #[default]
    Reject,

    /// Insert into the head chunk if not older than its first sample.
    Reorder,
}

/// In-memory chunk configuration.
#[derive(Debug, Clone)]
pub struct ChunkConfig {
    /// A head chunk without appends for this long is sealed.
    pub max_chunk_idle: Duration,

    /// Maximum span between the first and last sample of a chunk.
    pub max_chunk_age: Duration,

    /// Maximum number of samples in a chunk.
    pub max_samples_per_chunk: usize,

    /// Out-of-order handling.
    pub out_of_order: OutOfOrderPolicy,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_chunk_idle: Duration::from_secs(5 * 60),
            max_chunk_age: Duration::from_secs(12 * 60 * 60),
            max_samples_per_chunk: 1024,
            out_of_order: OutOfOrderPolicy::Reject,
        }
    }
}

impl ChunkConfig {
    /// Set the maximum samples per chunk.
    pub fn with_max_samples_per_chunk(mut self, n: usize) -> Self {
        self.max_samples_per_chunk = n;
        self
    }

    /// Set the maximum chunk age.
    pub fn with_max_chunk_age(mut self, age: Duration) -> Self {
        self.max_chunk_age = age;
        self
    }

    /// Set the out-of-order policy.
    pub fn with_out_of_order(mut self, policy: OutOfOrderPolicy) -> Self {
        self.out_of_order = policy;
        self
    }
}

/// Flush configuration.
#[derive(Debug, Clone)]
pub struct FlushConfig {
    /// Interval of the periodic sweep.
    pub flush_check_period: Duration,

    /// Number of tenants flushed concurrently.
    pub concurrent_flushes: usize,

    /// Attempts per tenant before giving up.
    pub max_flush_retries: usize,

    /// Timeout for a single tenant flush attempt.
    pub flush_op_timeout: Duration,

    /// Delay between attempts for the same tenant.
    pub retry_backoff: Duration,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            flush_check_period: Duration::from_secs(60),
            concurrent_flushes: 4,
            max_flush_retries: 3,
            flush_op_timeout: Duration::from_secs(60),
            retry_backoff: Duration::from_millis(100),
        }
    }
}

impl FlushConfig {
    /// Set the sweep period.
    pub fn with_flush_check_period(mut self, period: Duration) -> Self {
        self.flush_check_period = period;
        self
    }

    /// Set the number of attempts per tenant.
    pub fn with_max_flush_retries(mut self, n: usize) -> Self {
        self.max_flush_retries = n;
        self
    }

    /// Set the per-attempt timeout.
    pub fn with_flush_op_timeout(mut self, timeout: Duration) -> Self {
        self.flush_op_timeout = timeout;
        self
    }

    /// Set the retry backoff.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }
}

/// Chunk handoff configuration.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Transfer attempts on shutdown. 0 disables transfer-out.
    pub max_transfer_retries: usize,

    /// How long to wait for a pending peer to appear.
    pub peer_lookup_timeout: Duration,

    /// Maximum wait for a single send or for the acknowledgement.
    pub stream_idle_timeout: Duration,

    /// Capacity of the in-flight message buffer.
    pub stream_buffer: usize,

    /// Backoff after the first failed attempt.
    pub min_backoff: Duration,

    /// Upper bound of the backoff.
    pub max_backoff: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_transfer_retries: 10,
            peer_lookup_timeout: Duration::from_secs(5),
            stream_idle_timeout: Duration::from_secs(30),
            stream_buffer: 16,
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl TransferConfig {
    /// Set the number of transfer attempts.
    pub fn with_max_transfer_retries(mut self, retries: usize) -> Self {
        self.max_transfer_retries = retries;
        self
    }

    /// Set the in-flight message buffer of transfer streams.
    pub fn with_stream_buffer(mut self, buffer: usize) -> Self {
        self.stream_buffer = buffer;
        self
    }

    /// Set the peer lookup timeout.
    pub fn with_peer_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.peer_lookup_timeout = timeout;
        self
    }

    /// Set the stream idle timeout.
    pub fn with_stream_idle_timeout(mut self, timeout: Duration) -> Self {
        self.stream_idle_timeout = timeout;
        self
    }

    /// Set the backoff bounds.
    pub fn with_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.min_backoff = min;
        self.max_backoff = max;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = IngesterConfig::default();
        assert_eq!(config.lifecycler.num_tokens, 128);
        assert!(config.lifecycler.unregister_on_shutdown);
        assert_eq!(config.chunk.out_of_order, OutOfOrderPolicy::Reject);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = IngesterConfig::new("ing-2", "10.0.0.2:9095")
            .with_num_tokens(4)
            .with_join_after(None)
            .with_unregister_on_shutdown(false)
            .with_max_transfer_retries(0);

        assert_eq!(config.lifecycler.instance_id, "ing-2");
        assert_eq!(config.lifecycler.num_tokens, 4);
        assert_eq!(config.lifecycler.join_after, None);
        assert!(!config.lifecycler.unregister_on_shutdown);
        assert_eq!(config.transfer.max_transfer_retries, 0);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(IngesterConfig::default().with_num_tokens(0).validate().is_err());
        assert!(IngesterConfig::default()
            .with_concurrent_flushes(0)
            .validate()
            .is_err());
        let bad_backoff = IngesterConfig::default().with_transfer_config(
            TransferConfig::default()
                .with_backoff(Duration::from_secs(2), Duration::from_secs(1)),
        );
        assert!(bad_backoff.validate().is_err());
    }
}
