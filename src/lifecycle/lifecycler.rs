//! Ring lifecycle of one ingester.
//!
//! The lifecycler registers the node in the ring, joins it (by claiming
//! fresh tokens or by receiving a transfer), heartbeats, and on shutdown
//! disposes of in-memory data before the ring record may be removed.
//!
//! ```text
//!   start ──► PENDING ──join_after──► JOINING ──tokens──► ACTIVE
//!               │  ▲                    ▲                   │
//!               │  └──transfer failed───┤                   │ stop/shutdown
//!               └────transfer started───┘                   ▼
//!                                        STOPPED ◄──────── LEAVING
//!                                          (disposition: transfer or flush,
//!                                           then deregistration)
//! ```

use super::state::{transition, LifecycleEvent};
use crate::config::LifecyclerConfig;
use crate::error::{Error, Result, TransferError};
use crate::metrics::IngesterMetrics;
use crate::ring::{NodeState, RingClient};
use crate::transfer::TransferOutcome;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What the lifecycler calls to dispose of in-memory data.
#[async_trait]
pub trait FlushTransferer: Send + Sync + std::fmt::Debug {
    /// Flush everything in memory to durable storage.
    async fn flush(&self) -> Result<()>;

    /// Stream everything in memory to a pending peer.
    async fn transfer_out(&self) -> Result<TransferOutcome>;
}

type DispositionOutcome = std::result::Result<(), String>;

/// Drives this node's membership in the ring.
pub struct Lifecycler {
    config: LifecyclerConfig,
    ring: RingClient,
    flush_transferer: Arc<dyn FlushTransferer>,
    metrics: Arc<IngesterMetrics>,

    state: RwLock<NodeState>,
    state_tx: watch::Sender<NodeState>,
    tokens: RwLock<Vec<u32>>,

    /// Set once disposition begins; reads are refused from then on.
    disposition_started: AtomicBool,
    /// Outcome of this leaving episode's disposition, once it finished.
    disposition: Arc<tokio::sync::Mutex<Option<DispositionOutcome>>>,

    cancel: CancellationToken,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Lifecycler {
    /// Create a lifecycler. Nothing touches the ring until [`start`](Self::start).
    pub fn new(
        config: LifecyclerConfig,
        ring: RingClient,
        flush_transferer: Arc<dyn FlushTransferer>,
        metrics: Arc<IngesterMetrics>,
    ) -> Self {
        let (state_tx, _) = watch::channel(NodeState::Pending);
        metrics.set_state(NodeState::Pending);
        Self {
            config,
            ring,
            flush_transferer,
            metrics,
            state: RwLock::new(NodeState::Pending),
            state_tx,
            tokens: RwLock::new(Vec::new()),
            disposition_started: AtomicBool::new(false),
            disposition: Arc::new(tokio::sync::Mutex::new(None)),
            cancel: CancellationToken::new(),
            loop_handle: Mutex::new(None),
        }
    }

    /// Instance id.
    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    /// Ring client used by this node.
    pub fn ring(&self) -> &RingClient {
        &self.ring
    }

    /// Current state.
    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    /// Subscribe to state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<NodeState> {
        self.state_tx.subscribe()
    }

    /// Tokens owned by this node.
    pub fn tokens(&self) -> Vec<u32> {
        self.tokens.read().clone()
    }

    /// Whether writes are accepted.
    pub fn is_servable_for_writes(&self) -> bool {
        self.state() == NodeState::Active
    }

    /// Whether reads are served: while active, and while leaving until
    /// disposition begins.
    pub fn is_servable_for_reads(&self) -> bool {
        match self.state() {
            NodeState::Active => true,
            NodeState::Leaving => !self.disposition_started.load(Ordering::SeqCst),
            _ => false,
        }
    }

    fn apply(&self, event: LifecycleEvent) -> Result<NodeState> {
        let mut state = self.state.write();
        let from = *state;
        let next = transition(from, event)?;
        *state = next;
        drop(state);

        if next != from {
            info!(
                instance_id = %self.config.instance_id,
                %from,
                to = %next,
                %event,
                "Lifecycle transition"
            );
        }
        self.metrics.set_state(next);
        self.state_tx.send_replace(next);
        Ok(next)
    }

    /// Register in the ring and start the heartbeat/join loop.
    ///
    /// Tokens left in the ring by a previous run of the same instance are
    /// adopted and the node becomes active immediately.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let id = &self.config.instance_id;
        let record = self.ring.register(id, &self.config.addr).await?;

        let recovered = !record.tokens.is_empty();
        if recovered {
            *self.tokens.write() = record.tokens.clone();
            self.apply(LifecycleEvent::TokensRecovered)?;
            self.ring.update_state(id, NodeState::Active).await?;
            info!(instance_id = %id, tokens = record.tokens.len(), "Recovered tokens from ring");
        } else {
            info!(instance_id = %id, addr = %self.config.addr, "Registered in ring as pending");
        }

        let lifecycler = Arc::clone(self);
        let handle = tokio::spawn(async move { lifecycler.run_loop(!recovered).await });
        *self.loop_handle.lock() = Some(handle);
        Ok(())
    }

    async fn run_loop(&self, auto_join: bool) {
        let period = self.config.heartbeat_period;
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        let join_after = if auto_join { self.config.join_after } else { None };
        let join_timer = async {
            match join_after {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(join_timer);

        let mut join_fired = false;
        let mut join_due = false;
        let mut claiming = false;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(instance_id = %self.config.instance_id, "Lifecycle loop shutting down");
                    break;
                }
                _ = &mut join_timer, if !join_fired => {
                    join_fired = true;
                    join_due = !self.try_join(&mut claiming).await;
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = self.ring.heartbeat(&self.config.instance_id).await {
                        warn!(instance_id = %self.config.instance_id, error = %e, "Heartbeat failed");
                    }
                    if join_due {
                        join_due = !self.try_join(&mut claiming).await;
                    }
                }
            }
        }
    }

    /// Join by claiming fresh tokens. Returns true when nothing is left to do.
    async fn try_join(&self, claiming: &mut bool) -> bool {
        if !*claiming {
            match self.apply(LifecycleEvent::JoinDelayElapsed) {
                Ok(_) => *claiming = true,
                // Busy with a transfer-in: try again later unless already joined.
                Err(_) => {
                    return !matches!(self.state(), NodeState::Pending | NodeState::Joining)
                }
            }
        }

        let id = &self.config.instance_id;
        match self
            .ring
            .claim_tokens(id, self.config.num_tokens, NodeState::Active)
            .await
        {
            Ok(tokens) => {
                *claiming = false;
                *self.tokens.write() = tokens;
                if let Err(e) = self.apply(LifecycleEvent::TokensClaimed) {
                    warn!(instance_id = %id, error = %e, "Claimed tokens after leaving started");
                }
                true
            }
            Err(e) => {
                warn!(instance_id = %id, error = %e, "Failed to claim tokens, will retry");
                false
            }
        }
    }

    /// Enter `Joining` for an incoming transfer.
    pub async fn begin_transfer_in(&self) -> Result<()> {
        if let Err(e) = self.apply(LifecycleEvent::TransferInStarted) {
            debug!(instance_id = %self.config.instance_id, error = %e, "Refusing transfer");
            return Err(TransferError::NotPending {
                state: self.state(),
            }
            .into());
        }
        if let Err(e) = self
            .ring
            .update_state(&self.config.instance_id, NodeState::Joining)
            .await
        {
            let _ = self.apply(LifecycleEvent::TransferInFailed);
            return Err(e);
        }
        Ok(())
    }

    /// Take over the tokens of `from` and become active.
    pub async fn complete_transfer_in(&self, from: &str) -> Result<Vec<u32>> {
        if self.state() != NodeState::Joining {
            return Err(Error::InvalidTransition {
                from: self.state(),
                event: LifecycleEvent::TransferInCompleted.to_string(),
            });
        }
        let tokens = self
            .ring
            .claim_tokens_from(&self.config.instance_id, from)
            .await?;
        *self.tokens.write() = tokens.clone();
        self.apply(LifecycleEvent::TransferInCompleted)?;
        info!(
            instance_id = %self.config.instance_id,
            from,
            tokens = tokens.len(),
            "Claimed tokens of leaving peer"
        );
        Ok(tokens)
    }

    /// Return to `Pending` after a failed incoming transfer.
    pub async fn abort_transfer_in(&self) {
        if self.apply(LifecycleEvent::TransferInFailed).is_err() {
            return;
        }
        if let Err(e) = self
            .ring
            .update_state(&self.config.instance_id, NodeState::Pending)
            .await
        {
            warn!(instance_id = %self.config.instance_id, error = %e, "Failed to publish pending state");
        }
    }

    /// Process shutdown. The ring record is removed only when
    /// `unregister_on_shutdown` is set.
    pub async fn stop(&self) -> Result<()> {
        self.leave(self.config.unregister_on_shutdown).await
    }

    /// Administrative drain: dispose of all data and always remove the
    /// ring record.
    pub async fn shutdown(&self) -> Result<()> {
        self.leave(true).await
    }

    async fn stop_loop(&self) {
        self.cancel.cancel();
        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(instance_id = %self.config.instance_id, error = %e, "Lifecycle loop panicked");
            }
        }
    }

    async fn leave(&self, unregister: bool) -> Result<()> {
        self.stop_loop().await;
        let id = &self.config.instance_id;

        if matches!(
            self.state(),
            NodeState::Pending | NodeState::Joining | NodeState::Active
        ) && self.apply(LifecycleEvent::ShutdownRequested).is_ok()
        {
            if let Err(e) = self.ring.update_state(id, NodeState::Leaving).await {
                warn!(instance_id = %id, error = %e, "Failed to publish leaving state");
            }
        }

        if let Err(e) = self.dispose_once().await {
            let _ = self.apply(LifecycleEvent::DispositionFailed);
            error!(instance_id = %id, error = %e, "Disposition failed, keeping ring record");
            return Err(e);
        }

        if self.state() == NodeState::Leaving {
            self.apply(LifecycleEvent::DispositionCompleted)?;
        }

        if !self.config.final_sleep.is_zero() {
            tokio::time::sleep(self.config.final_sleep).await;
        }

        if unregister {
            self.ring.deregister(id).await?;
            info!(instance_id = %id, "Removed from ring");
        }
        Ok(())
    }

    /// Run the disposition once for this leaving episode. Later callers wait
    /// for and observe the same outcome.
    async fn dispose_once(&self) -> Result<()> {
        let mut outcome = Arc::clone(&self.disposition).lock_owned().await;
        if let Some(previous) = outcome.as_ref() {
            return previous.clone().map_err(Error::Disposition);
        }

        self.disposition_started.store(true, Ordering::SeqCst);
        let flush_transferer = Arc::clone(&self.flush_transferer);
        let instance_id = self.config.instance_id.clone();

        // The outcome is recorded by the task itself so an abandoned caller
        // does not leave the episode half-done.
        let task = tokio::spawn(async move {
            let result = dispose(flush_transferer.as_ref(), &instance_id).await;
            *outcome = Some(result.as_ref().map(|_| ()).map_err(|e| e.to_string()));
            result
        });
        match task.await {
            Ok(result) => result,
            Err(e) => Err(Error::Internal(format!("disposition task failed: {e}"))),
        }
    }
}

async fn dispose(flush_transferer: &dyn FlushTransferer, instance_id: &str) -> Result<()> {
    match flush_transferer.transfer_out().await {
        Ok(TransferOutcome::Transferred { to, series }) => {
            info!(instance_id, peer = %to, series, "Transferred chunks to peer");
            return Ok(());
        }
        Ok(TransferOutcome::NothingToTransfer) => {
            debug!(instance_id, "Nothing in memory to transfer");
        }
        Ok(TransferOutcome::Disabled) => {
            debug!(instance_id, "Transfer disabled, flushing");
        }
        Err(e) => {
            warn!(instance_id, error = %e, "Transfer failed, falling back to flush");
        }
    }
    flush_transferer.flush().await
}

impl std::fmt::Debug for Lifecycler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycler")
            .field("instance_id", &self.config.instance_id)
            .field("state", &self.state())
            .field("tokens", &self.tokens.read().len())
            .finish()
    }
}
