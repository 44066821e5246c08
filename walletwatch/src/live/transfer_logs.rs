//! ERC-20 transfer watcher for tracked addresses.
//!
//! One log subscription per chain, filtered to the canonical transfer topic
//! and optionally to a token contract set. Decoded transfers are delivered
//! only when the sender **or** recipient is currently tracked; addresses
//! are compared as parsed values, so hex casing can never split a match.
//! Logs that do not decode as transfers are skipped, not errors.

use std::sync::Arc;

use alloy::primitives::{Address, B256, U256, b256};
use chrono::Utc;
use evm_adapter::types::TransferEvent;
use futures::StreamExt;
use rpc_guard::{Result, RpcError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::client::{LiveClient, LogFilter, LogRecord};
use super::tracker::AddressTracker;
use crate::events::{EventBus, EventKind, EventPayload};

// ═══════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// keccak-256 of `Transfer(address,address,uint256)`.
pub const TRANSFER_TOPIC: B256 =
    b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef");

// ═══════════════════════════════════════════════════════════════════════════════
// CALLBACKS
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-subscription watcher callbacks.
#[derive(Clone, Default)]
pub struct TransferCallbacks {
    /// Invoked per matching transfer, after the bus event.
    pub on_transfer: Option<Arc<dyn Fn(TransferEvent) + Send + Sync>>,
    /// Invoked for watcher errors.
    pub on_error: Option<Arc<dyn Fn(RpcError) + Send + Sync>>,
}

impl std::fmt::Debug for TransferCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferCallbacks")
            .field("on_transfer", &self.on_transfer.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DECODING
// ═══════════════════════════════════════════════════════════════════════════════

/// Decode a raw log as an ERC-20 transfer. `None` for anything malformed.
#[must_use]
pub fn decode_transfer(record: &LogRecord, chain_id: u64) -> Option<TransferEvent> {
    if record.topics.len() != 3 || record.topics[0] != TRANSFER_TOPIC {
        return None;
    }
    if record.data.len() < 32 {
        return None;
    }

    let from = Address::from_slice(&record.topics[1][12..]);
    let to = Address::from_slice(&record.topics[2][12..]);
    let value = U256::from_be_slice(&record.data[..32]);

    Some(TransferEvent {
        from,
        to,
        token_address: record.address,
        value,
        chain_id,
        block_number: record.block_number?,
        tx_hash: record.tx_hash?,
        log_index: record.log_index.unwrap_or(0),
        timestamp: Utc::now(),
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// WATCHER
// ═══════════════════════════════════════════════════════════════════════════════

struct WatchSlot {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    client: Arc<dyn LiveClient>,
    token_filter: Vec<Address>,
    callbacks: TransferCallbacks,
}

/// Per-chain filtered transfer stream.
pub struct TransferLogsWatcher {
    bus: Arc<EventBus>,
    tracker: Arc<AddressTracker>,
    slots: Arc<dashmap::DashMap<u64, WatchSlot>>,
}

impl std::fmt::Debug for TransferLogsWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferLogsWatcher")
            .field("subscribed_chains", &self.slots.len())
            .finish_non_exhaustive()
    }
}

impl TransferLogsWatcher {
    /// Create a watcher over the shared bus and address tracker.
    #[must_use]
    pub fn new(bus: Arc<EventBus>, tracker: Arc<AddressTracker>) -> Self {
        Self {
            bus,
            tracker,
            slots: Arc::new(dashmap::DashMap::new()),
        }
    }

    /// Start watching a chain's transfers. Idempotent per chain.
    ///
    /// `token_filter` narrows the stream to those token contracts; empty
    /// means every token.
    ///
    /// # Errors
    ///
    /// Propagates the client's failure to open the log watcher.
    #[instrument(skip(self, client, callbacks))]
    pub async fn subscribe(
        &self,
        chain_id: u64,
        client: Arc<dyn LiveClient>,
        token_filter: Vec<Address>,
        callbacks: TransferCallbacks,
    ) -> Result<()> {
        if self.slots.contains_key(&chain_id) {
            debug!(chain_id, "Transfer watcher already subscribed");
            return Ok(());
        }

        let filter = LogFilter {
            topic0: Some(TRANSFER_TOPIC),
            addresses: token_filter.clone(),
            ..LogFilter::default()
        };
        let mut stream = client.watch_logs(&filter).await?;

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let bus = Arc::clone(&self.bus);
        let tracker = Arc::clone(&self.tracker);
        let task_callbacks = callbacks.clone();

        let handle = tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    () = task_cancel.cancelled() => break,
                    next = stream.next() => next,
                };

                match next {
                    Some(Ok(record)) => {
                        let Some(transfer) = decode_transfer(&record, chain_id) else {
                            debug!(chain_id, "Skipping undecodable transfer log");
                            continue;
                        };
                        if !tracker.is_tracked(chain_id, transfer.from)
                            && !tracker.is_tracked(chain_id, transfer.to)
                        {
                            continue;
                        }
                        bus.emit(
                            EventKind::LiveTransferDetected,
                            chain_id,
                            EventPayload::Transfer(transfer.clone()),
                        );
                        if let Some(on_transfer) = &task_callbacks.on_transfer {
                            on_transfer(transfer);
                        }
                    }
                    Some(Err(err)) => {
                        warn!(chain_id, error = %err, "Transfer log watcher error");
                        if let Some(on_error) = &task_callbacks.on_error {
                            on_error(err);
                        }
                    }
                    None => {
                        warn!(chain_id, "Transfer log stream ended");
                        if let Some(on_error) = &task_callbacks.on_error {
                            on_error(RpcError::connection(
                                rpc_guard::ConnectionKind::Reset,
                                "transfer log stream ended",
                            ));
                        }
                        break;
                    }
                }
            }
        });

        self.slots.insert(
            chain_id,
            WatchSlot {
                cancel,
                handle,
                client,
                token_filter,
                callbacks,
            },
        );
        Ok(())
    }

    /// Tear down and rebuild a chain's subscription.
    ///
    /// Used to pick up tracked-address or token-set changes that the
    /// server-side filter cannot express incrementally.
    ///
    /// # Errors
    ///
    /// Propagates the rebuild failure; the old subscription is already gone.
    pub async fn resubscribe(&self, chain_id: u64) -> Result<()> {
        let Some((_, slot)) = self.slots.remove(&chain_id) else {
            return Ok(());
        };
        slot.cancel.cancel();
        slot.handle.abort();
        self.subscribe(chain_id, slot.client, slot.token_filter, slot.callbacks)
            .await
    }

    /// Whether a chain currently has an active log subscription.
    #[must_use]
    pub fn is_subscribed(&self, chain_id: u64) -> bool {
        self.slots.contains_key(&chain_id)
    }

    /// Stop watching a chain. Idempotent.
    pub fn unsubscribe(&self, chain_id: u64) {
        if let Some((_, slot)) = self.slots.remove(&chain_id) {
            slot.cancel.cancel();
            slot.handle.abort();
        }
    }

    /// Stop watching every chain. Idempotent.
    pub fn destroy(&self) {
        let chains: Vec<u64> = self.slots.iter().map(|e| *e.key()).collect();
        for chain_id in chains {
            self.unsubscribe(chain_id);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
