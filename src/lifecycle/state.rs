//! Lifecycle transition function.

use crate::error::{Error, Result};
use crate::ring::NodeState;

/// Events driving the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// The join delay elapsed while pending.
    JoinDelayElapsed,
    /// Tokens from a previous run were found in the ring.
    TokensRecovered,
    /// A peer started streaming chunks to this node.
    TransferInStarted,
    /// An incoming transfer finished and its tokens were claimed.
    TransferInCompleted,
    /// An incoming transfer failed.
    TransferInFailed,
    /// Fresh tokens were claimed.
    TokensClaimed,
    /// Shutdown was requested.
    ShutdownRequested,
    /// In-memory data was flushed or transferred.
    DispositionCompleted,
    /// Neither flush nor transfer succeeded.
    DispositionFailed,
}

impl std::fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleEvent::JoinDelayElapsed => write!(f, "join_delay_elapsed"),
            LifecycleEvent::TokensRecovered => write!(f, "tokens_recovered"),
            LifecycleEvent::TransferInStarted => write!(f, "transfer_in_started"),
            LifecycleEvent::TransferInCompleted => write!(f, "transfer_in_completed"),
            LifecycleEvent::TransferInFailed => write!(f, "transfer_in_failed"),
            LifecycleEvent::TokensClaimed => write!(f, "tokens_claimed"),
            LifecycleEvent::ShutdownRequested => write!(f, "shutdown_requested"),
            LifecycleEvent::DispositionCompleted => write!(f, "disposition_completed"),
            LifecycleEvent::DispositionFailed => write!(f, "disposition_failed"),
        }
    }
}

/// Next state for `event` in `state`.
pub fn transition(state: NodeState, event: LifecycleEvent) -> Result<NodeState> {
    use LifecycleEvent::*;
    use NodeState::*;

    let next = match (state, event) {
        (Pending, JoinDelayElapsed) => Joining,
        (Pending, TransferInStarted) => Joining,
        (Pending, TokensRecovered) => Active,
        (Joining, TokensClaimed) => Active,
        (Joining, TransferInCompleted) => Active,
        (Joining, TransferInFailed) => Pending,
        (Pending | Joining | Active, ShutdownRequested) => Leaving,
        (Leaving, DispositionCompleted) => Stopped,
        (Leaving, DispositionFailed) => Leaving,
        (from, event) => {
            return Err(Error::InvalidTransition {
                from,
                event: event.to_string(),
            })
        }
    };
    Ok(next)
}
