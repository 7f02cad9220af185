//! Ring descriptor: the set of instances and the tokens they own.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Lifecycle state of an instance, as published in the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    /// Registered, owns no tokens yet; may receive a transfer.
    Pending,
    /// Acquiring tokens or receiving a transfer.
    Joining,
    /// Owns tokens and serves reads and writes.
    Active,
    /// Shutting down; disposing of in-memory data.
    Leaving,
    /// Terminal.
    Stopped,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Pending => write!(f, "PENDING"),
            NodeState::Joining => write!(f, "JOINING"),
            NodeState::Active => write!(f, "ACTIVE"),
            NodeState::Leaving => write!(f, "LEAVING"),
            NodeState::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// One instance's ring record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDesc {
    /// Address peers use to reach the instance.
    pub addr: String,
    /// Tokens owned, sorted.
    pub tokens: Vec<u32>,
    /// Published lifecycle state.
    pub state: NodeState,
    /// Last heartbeat, milliseconds since the Unix epoch.
    pub heartbeat_ms: i64,
    /// First registration, milliseconds since the Unix epoch.
    pub registered_at_ms: i64,
}

impl InstanceDesc {
    /// Create a record with no tokens.
    pub fn new(addr: impl Into<String>, state: NodeState, now_ms: i64) -> Self {
        Self {
            addr: addr.into(),
            tokens: Vec::new(),
            state,
            heartbeat_ms: now_ms,
            registered_at_ms: now_ms,
        }
    }

    /// Whether the last heartbeat is within `timeout` of `now_ms`.
    pub fn is_healthy(&self, now_ms: i64, timeout: Duration) -> bool {
        now_ms.saturating_sub(self.heartbeat_ms) <= timeout.as_millis() as i64
    }
}

/// The whole ring, stored under a single key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingDesc {
    /// Instances keyed by instance id.
    pub instances: BTreeMap<String, InstanceDesc>,
}

impl RingDesc {
    /// Create an empty ring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize for the KV store.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize a value read from the KV store.
    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }

    /// Look up an instance.
    pub fn get(&self, instance_id: &str) -> Option<&InstanceDesc> {
        self.instances.get(instance_id)
    }

    /// Total tokens across all instances.
    pub fn token_count(&self) -> usize {
        self.instances.values().map(|i| i.tokens.len()).sum()
    }

    /// All tokens currently owned by anyone.
    pub fn taken_tokens(&self) -> std::collections::HashSet<u32> {
        self.instances
            .values()
            .flat_map(|i| i.tokens.iter().copied())
            .collect()
    }

    /// A `Pending` instance other than `exclude` with a fresh heartbeat.
    /// The oldest registration wins so concurrent senders agree.
    pub fn find_pending_peer(
        &self,
        exclude: &str,
        now_ms: i64,
        heartbeat_timeout: Duration,
    ) -> Option<(String, InstanceDesc)> {
        self.instances
            .iter()
            .filter(|(id, i)| {
                id.as_str() != exclude
                    && i.state == NodeState::Pending
                    && i.is_healthy(now_ms, heartbeat_timeout)
            })
            .min_by_key(|(id, i)| (i.registered_at_ms, (*id).clone()))
            .map(|(id, i)| (id.clone(), i.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(tokens: Vec<u32>, state: NodeState, registered_at_ms: i64) -> InstanceDesc {
        InstanceDesc {
            addr: "addr".to_string(),
            tokens,
            state,
            heartbeat_ms: 1_000,
            registered_at_ms,
        }
    }

    #[test]
    fn test_codec_round_trip() {
        let mut ring = RingDesc::new();
        ring.instances
            .insert("a".into(), instance(vec![100, 300], NodeState::Active, 0));
        ring.instances
            .insert("b".into(), instance(vec![200], NodeState::Active, 0));

        let decoded = RingDesc::decode(&ring.encode().unwrap()).unwrap();
        assert_eq!(decoded, ring);
        assert_eq!(decoded.token_count(), 3);
        assert_eq!(decoded.taken_tokens().len(), 3);
    }

    #[test]
    fn test_find_pending_peer() {
        let mut ring = RingDesc::new();
        ring.instances
            .insert("leaving".into(), instance(vec![1], NodeState::Leaving, 0));
        ring.instances
            .insert("late".into(), instance(vec![], NodeState::Pending, 20));
        ring.instances
            .insert("early".into(), instance(vec![], NodeState::Pending, 10));
        let mut stale = instance(vec![], NodeState::Pending, 0);
        stale.heartbeat_ms = -100_000;
        ring.instances.insert("stale".into(), stale);

        let (id, _) = ring
            .find_pending_peer("leaving", 1_000, Duration::from_secs(60))
            .unwrap();
        assert_eq!(id, "early");
        assert!(ring
            .find_pending_peer("early", 1_000, Duration::from_secs(60))
            .is_some_and(|(id, _)| id == "late"));
    }
}
