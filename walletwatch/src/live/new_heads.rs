//! New-heads driver: refresh tracked balances on every block.
//!
//! At most one subscription per chain. Each new head is turned into a
//! `LIVE_BLOCK_RECEIVED` event followed by one `LIVE_BALANCE_UPDATED` per
//! tracked address - in that order, always. A failing balance read for one
//! address never blocks the others, and watcher errors are routed to the
//! caller while the connection manager's heartbeat handles the actual
//! reconnect.

use std::sync::Arc;
use std::time::Duration;

use evm_adapter::types::BlockInfo;
use futures::StreamExt;
use moka::sync::Cache as MokaCache;
use rpc_guard::RpcError;
use rpc_guard::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::client::LiveClient;
use super::tracker::AddressTracker;
use crate::events::{BalanceUpdate, EventBus, EventKind, EventPayload};

// ═══════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Blocks remembered for duplicate suppression.
///
/// A reconnecting watcher can re-deliver the head it already reported;
/// processing it twice would re-emit every balance.
const BLOCK_CACHE_CAPACITY: u64 = 1024;

/// How long a seen block stays in the duplicate-suppression cache.
const BLOCK_CACHE_TTL: Duration = Duration::from_secs(3600);

// ═══════════════════════════════════════════════════════════════════════════════
// CALLBACKS
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-subscription driver callbacks. All optional; the bus always fires.
#[derive(Clone, Default)]
pub struct DriverCallbacks {
    /// Invoked per new block, after the block event is emitted.
    pub on_block: Option<Arc<dyn Fn(BlockInfo) + Send + Sync>>,
    /// Invoked per refreshed balance, after the balance event is emitted.
    pub on_balance_update: Option<Arc<dyn Fn(BalanceUpdate) + Send + Sync>>,
    /// Invoked for watcher and fetch errors.
    pub on_error: Option<Arc<dyn Fn(RpcError) + Send + Sync>>,
}

impl std::fmt::Debug for DriverCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverCallbacks")
            .field("on_block", &self.on_block.is_some())
            .field("on_balance_update", &self.on_balance_update.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DRIVER
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-chain block watcher that fans out balance refreshes.
pub struct NewHeadsDriver {
    bus: Arc<EventBus>,
    tracker: Arc<AddressTracker>,
    tasks: Arc<dashmap::DashMap<u64, (CancellationToken, JoinHandle<()>)>>,
    /// `(chain, block)` pairs already processed.
    seen_blocks: MokaCache<(u64, u64), ()>,
}

impl std::fmt::Debug for NewHeadsDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewHeadsDriver")
            .field("subscribed_chains", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl NewHeadsDriver {
    /// Create a driver over the shared bus and address tracker.
    #[must_use]
    pub fn new(bus: Arc<EventBus>, tracker: Arc<AddressTracker>) -> Self {
        Self {
            bus,
            tracker,
            tasks: Arc::new(dashmap::DashMap::new()),
            seen_blocks: MokaCache::builder()
                .max_capacity(BLOCK_CACHE_CAPACITY)
                .time_to_live(BLOCK_CACHE_TTL)
                .build(),
        }
    }

    /// Start watching a chain's heads. Idempotent per chain.
    ///
    /// # Errors
    ///
    /// Propagates the client's failure to open the block watcher.
    #[instrument(skip(self, client, callbacks))]
    pub async fn subscribe(
        &self,
        chain_id: u64,
        client: Arc<dyn LiveClient>,
        callbacks: DriverCallbacks,
    ) -> Result<()> {
        if self.tasks.contains_key(&chain_id) {
            debug!(chain_id, "New-heads driver already subscribed");
            return Ok(());
        }

        let mut stream = client.watch_block_numbers().await?;
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let bus = Arc::clone(&self.bus);
        let tracker = Arc::clone(&self.tracker);
        let tasks = Arc::clone(&self.tasks);
        let seen = self.seen_blocks.clone();

        let handle = tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    () = task_cancel.cancelled() => break,
                    next = stream.next() => next,
                };

                match next {
                    Some(Ok(number)) => {
                        if seen.get(&(chain_id, number)).is_some() {
                            debug!(chain_id, number, "Skipping already-processed block");
                            continue;
                        }
                        seen.insert((chain_id, number), ());
                        handle_block(chain_id, number, &client, &bus, &tracker, &callbacks)
                            .await;
                    }
                    Some(Err(err)) => {
                        warn!(chain_id, error = %err, "Block watcher error");
                        if let Some(on_error) = &callbacks.on_error {
                            on_error(err);
                        }
                    }
                    None => {
                        // Stream ended: the socket dropped. The connection
                        // manager reconnects; the service re-arms us.
                        warn!(chain_id, "Block stream ended");
                        if let Some(on_error) = &callbacks.on_error {
                            on_error(RpcError::connection(
                                rpc_guard::ConnectionKind::Reset,
                                "block stream ended",
                            ));
                        }
                        break;
                    }
                }
            }
            tasks.remove(&chain_id);
        });

        self.tasks.insert(chain_id, (cancel, handle));
        Ok(())
    }

    /// Whether a chain currently has an active head subscription.
    #[must_use]
    pub fn is_subscribed(&self, chain_id: u64) -> bool {
        self.tasks.contains_key(&chain_id)
    }

    /// Stop watching a chain. Idempotent.
    pub fn unsubscribe(&self, chain_id: u64) {
        if let Some((_, (cancel, handle))) = self.tasks.remove(&chain_id) {
            cancel.cancel();
            handle.abort();
        }
    }

    /// Stop watching every chain. Idempotent.
    pub fn destroy(&self) {
        let chains: Vec<u64> = self.tasks.iter().map(|e| *e.key()).collect();
        for chain_id in chains {
            self.unsubscribe(chain_id);
        }
    }
}

/// Process one new head: block event first, then per-address balances.
async fn handle_block(
    chain_id: u64,
    number: u64,
    client: &Arc<dyn LiveClient>,
    bus: &EventBus,
    tracker: &AddressTracker,
    callbacks: &DriverCallbacks,
) {
    let block = match client.block(number).await {
        Ok(block) => block,
        Err(err) => {
            warn!(chain_id, number, error = %err, "Failed to fetch block details");
            if let Some(on_error) = &callbacks.on_error {
                on_error(err);
            }
            return;
        }
    };

    bus.emit(
        EventKind::LiveBlockReceived,
        chain_id,
        EventPayload::Block(block.clone()),
    );
    if let Some(on_block) = &callbacks.on_block {
        on_block(block);
    }

    for address in tracker.addresses(chain_id) {
        let amount = match client.native_balance(address).await {
            Ok(amount) => amount,
            Err(err) => {
                // One bad address never halts the cycle.
                warn!(chain_id, %address, error = %err, "Balance refresh failed");
                if let Some(on_error) = &callbacks.on_error {
                    on_error(err);
                }
                continue;
            }
        };

        // The set may have changed while the read was in flight; only
        // currently tracked addresses may produce events.
        if !tracker.is_tracked(chain_id, address) {
            continue;
        }

        let update = BalanceUpdate {
            address,
            chain_id,
            amount,
            block_number: number,
        };
        bus.emit(
            EventKind::LiveBalanceUpdated,
            chain_id,
            EventPayload::Balance(update.clone()),
        );
        if let Some(on_balance_update) = &callbacks.on_balance_update {
            on_balance_update(update);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
