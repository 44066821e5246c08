//! Polling transport: block-gated refresh plus WebSocket recovery probing.
//!
//! When a chain has no WebSocket, the poll manager produces the exact same
//! bus events the live drivers would, so consumers cannot tell transports
//! apart. The cost control is the block-number gate: a tick that observes
//! no new head does nothing at all - no block fetch, no balance reads, no
//! log queries.
//!
//! A separate per-chain probe periodically asks the connection manager to
//! re-establish the WebSocket; on success it invokes the recovery hook and
//! retires. Stopping the poll remains the service's decision - the probe
//! only reports.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::Address;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::client::{LiveClient, LogFilter};
use super::connection_manager::ConnectionManager;
use super::new_heads::DriverCallbacks;
use super::transfer_logs::{TRANSFER_TOPIC, decode_transfer};
use crate::events::{BalanceUpdate, EventBus, EventKind, EventPayload};

// ═══════════════════════════════════════════════════════════════════════════════
// CONFIG
// ═══════════════════════════════════════════════════════════════════════════════

/// Poll manager configuration.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Gap between poll ticks.
    pub poll_interval: Duration,
    /// Gap between WebSocket recovery probes.
    pub ws_recovery_interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            ws_recovery_interval: Duration::from_secs(10),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CALLBACKS
// ═══════════════════════════════════════════════════════════════════════════════

/// Poll callbacks: the driver set plus transfers.
#[derive(Clone, Default)]
pub struct PollCallbacks {
    /// Block/balance/error callbacks, as for the WebSocket drivers.
    pub driver: DriverCallbacks,
    /// Invoked per transfer found in a polled block range.
    pub on_transfer:
        Option<Arc<dyn Fn(evm_adapter::types::TransferEvent) + Send + Sync>>,
}

impl std::fmt::Debug for PollCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollCallbacks")
            .field("driver", &self.driver)
            .field("on_transfer", &self.on_transfer.is_some())
            .finish()
    }
}

/// Invoked when the recovery probe re-establishes a chain's WebSocket.
pub type WsRecoveredHook = Arc<dyn Fn(u64) + Send + Sync>;

// ═══════════════════════════════════════════════════════════════════════════════
// POLL MANAGER
// ═══════════════════════════════════════════════════════════════════════════════

struct PollSlot {
    cancel: CancellationToken,
    poll_task: JoinHandle<()>,
    probe_task: JoinHandle<()>,
    tracked: Arc<Mutex<HashSet<Address>>>,
}

/// Polling fallback for chains without a live WebSocket.
pub struct PollManager {
    config: PollConfig,
    bus: Arc<EventBus>,
    manager: Arc<ConnectionManager>,
    polls: Arc<dashmap::DashMap<u64, PollSlot>>,
    on_ws_recovered: Mutex<Option<WsRecoveredHook>>,
}

impl std::fmt::Debug for PollManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollManager")
            .field("config", &self.config)
            .field("polling_chains", &self.polls.len())
            .finish_non_exhaustive()
    }
}

impl PollManager {
    /// Create a poll manager.
    #[must_use]
    pub fn new(config: PollConfig, bus: Arc<EventBus>, manager: Arc<ConnectionManager>) -> Self {
        Self {
            config,
            bus,
            manager,
            polls: Arc::new(dashmap::DashMap::new()),
            on_ws_recovered: Mutex::new(None),
        }
    }

    /// Register the hook invoked when a chain's WebSocket recovers.
    pub fn set_on_ws_recovered(&self, hook: WsRecoveredHook) {
        #[allow(clippy::unwrap_used)]
        {
            *self.on_ws_recovered.lock().unwrap() = Some(hook);
        }
    }

    /// Start polling a chain. Idempotent: a second call extends the tracked
    /// address set and leaves the running poll alone.
    #[instrument(skip(self, client, callbacks, addresses))]
    pub fn start_polling(
        &self,
        chain_id: u64,
        client: Arc<dyn LiveClient>,
        addresses: Vec<Address>,
        callbacks: PollCallbacks,
        track_transfers: bool,
    ) {
        if let Some(slot) = self.polls.get(&chain_id) {
            #[allow(clippy::unwrap_used)]
            let mut tracked = slot.tracked.lock().unwrap();
            tracked.extend(addresses);
            debug!(chain_id, "Poll already running; extended tracked set");
            return;
        }

        info!(chain_id, addresses = addresses.len(), track_transfers, "Starting poll");
        let tracked = Arc::new(Mutex::new(addresses.into_iter().collect::<HashSet<_>>()));
        let cancel = CancellationToken::new();

        let poll_task = tokio::spawn(poll_loop(
            chain_id,
            self.config.poll_interval,
            Arc::clone(&client),
            Arc::clone(&self.bus),
            Arc::clone(&tracked),
            callbacks,
            track_transfers,
            cancel.clone(),
        ));

        #[allow(clippy::unwrap_used)]
        let hook = self.on_ws_recovered.lock().unwrap().clone();
        let probe_task = tokio::spawn(recovery_probe(
            chain_id,
            self.config.ws_recovery_interval,
            Arc::clone(&self.manager),
            hook,
            cancel.clone(),
        ));

        self.polls.insert(
            chain_id,
            PollSlot {
                cancel,
                poll_task,
                probe_task,
                tracked,
            },
        );
    }

    /// Track one more address on a polling chain.
    pub fn add_tracked_address(&self, chain_id: u64, address: Address) {
        if let Some(slot) = self.polls.get(&chain_id) {
            #[allow(clippy::unwrap_used)]
            slot.tracked.lock().unwrap().insert(address);
        }
    }

    /// Stop tracking an address on a polling chain.
    pub fn remove_tracked_address(&self, chain_id: u64, address: Address) {
        if let Some(slot) = self.polls.get(&chain_id) {
            #[allow(clippy::unwrap_used)]
            slot.tracked.lock().unwrap().remove(&address);
        }
    }

    /// Whether a chain is currently being polled.
    #[must_use]
    pub fn is_polling(&self, chain_id: u64) -> bool {
        self.polls.contains_key(&chain_id)
    }

    /// Stop polling a chain (and its recovery probe). Idempotent.
    pub fn stop_polling(&self, chain_id: u64) {
        if let Some((_, slot)) = self.polls.remove(&chain_id) {
            slot.cancel.cancel();
            slot.poll_task.abort();
            slot.probe_task.abort();
            info!(chain_id, "Stopped polling");
        }
    }

    /// Stop every poll. Idempotent.
    pub fn destroy(&self) {
        let chains: Vec<u64> = self.polls.iter().map(|e| *e.key()).collect();
        for chain_id in chains {
            self.stop_polling(chain_id);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// POLL LOOP
// ═══════════════════════════════════════════════════════════════════════════════

#[allow(clippy::too_many_arguments)] // task entry point, not an API
async fn poll_loop(
    chain_id: u64,
    poll_interval: Duration,
    client: Arc<dyn LiveClient>,
    bus: Arc<EventBus>,
    tracked: Arc<Mutex<HashSet<Address>>>,
    callbacks: PollCallbacks,
    track_transfers: bool,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(poll_interval);
    let mut last_block: Option<u64> = None;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!(chain_id, "Poll loop stopping");
                return;
            }
            _ = interval.tick() => {}
        }

        poll_once(
            chain_id,
            &client,
            &bus,
            &tracked,
            &callbacks,
            track_transfers,
            &mut last_block,
        )
        .await;
    }
}

/// One poll tick. Skips all work when the head has not advanced.
async fn poll_once(
    chain_id: u64,
    client: &Arc<dyn LiveClient>,
    bus: &EventBus,
    tracked: &Arc<Mutex<HashSet<Address>>>,
    callbacks: &PollCallbacks,
    track_transfers: bool,
    last_block: &mut Option<u64>,
) {
    let head = match client.block_number().await {
        Ok(head) => head,
        Err(err) => {
            warn!(chain_id, error = %err, "Poll failed to read head");
            if let Some(on_error) = &callbacks.driver.on_error {
                on_error(err);
            }
            return;
        }
    };

    let Some(previous) = *last_block else {
        // First poll: record the baseline silently.
        debug!(chain_id, head, "Poll baseline recorded");
        *last_block = Some(head);
        return;
    };
    if head <= previous {
        debug!(chain_id, head, "No new blocks, skipping tick");
        return;
    }

    let block = match client.block(head).await {
        Ok(block) => block,
        Err(err) => {
            warn!(chain_id, head, error = %err, "Poll failed to fetch block");
            if let Some(on_error) = &callbacks.driver.on_error {
                on_error(err);
            }
            // Leave the baseline so the next tick retries this range.
            return;
        }
    };

    bus.emit(EventKind::LiveBlockReceived, chain_id, EventPayload::Block(block.clone()));
    if let Some(on_block) = &callbacks.driver.on_block {
        on_block(block);
    }

    #[allow(clippy::unwrap_used)]
    let addresses: Vec<Address> = tracked.lock().unwrap().iter().copied().collect();
    for address in addresses {
        match client.native_balance(address).await {
            Ok(amount) => {
                let update = BalanceUpdate {
                    address,
                    chain_id,
                    amount,
                    block_number: head,
                };
                bus.emit(
                    EventKind::LiveBalanceUpdated,
                    chain_id,
                    EventPayload::Balance(update.clone()),
                );
                if let Some(on_balance_update) = &callbacks.driver.on_balance_update {
                    on_balance_update(update);
                }
            }
            Err(err) => {
                warn!(chain_id, %address, error = %err, "Poll balance refresh failed");
                if let Some(on_error) = &callbacks.driver.on_error {
                    on_error(err);
                }
            }
        }
    }

    if track_transfers {
        poll_transfers(chain_id, client, bus, tracked, callbacks, previous + 1, head).await;
    }

    *last_block = Some(head);
}

/// Fetch and fan out transfers for the blocks covered since the last tick.
async fn poll_transfers(
    chain_id: u64,
    client: &Arc<dyn LiveClient>,
    bus: &EventBus,
    tracked: &Arc<Mutex<HashSet<Address>>>,
    callbacks: &PollCallbacks,
    from_block: u64,
    to_block: u64,
) {
    let filter = LogFilter {
        topic0: Some(TRANSFER_TOPIC),
        from_block: Some(from_block),
        to_block: Some(to_block),
        ..LogFilter::default()
    };
    let logs = match client.get_logs(&filter).await {
        Ok(logs) => logs,
        Err(err) => {
            warn!(chain_id, from_block, to_block, error = %err, "Poll log fetch failed");
            if let Some(on_error) = &callbacks.driver.on_error {
                on_error(err);
            }
            return;
        }
    };

    for record in logs {
        let Some(transfer) = decode_transfer(&record, chain_id) else {
            continue;
        };
        let matches = {
            #[allow(clippy::unwrap_used)]
            let tracked = tracked.lock().unwrap();
            tracked.contains(&transfer.from) || tracked.contains(&transfer.to)
        };
        if !matches {
            continue;
        }
        bus.emit(
            EventKind::LiveTransferDetected,
            chain_id,
            EventPayload::Transfer(transfer.clone()),
        );
        if let Some(on_transfer) = &callbacks.on_transfer {
            on_transfer(transfer);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RECOVERY PROBE
// ═══════════════════════════════════════════════════════════════════════════════

/// Periodically try to bring the WebSocket back; report once and retire.
async fn recovery_probe(
    chain_id: u64,
    probe_interval: Duration,
    manager: Arc<ConnectionManager>,
    hook: Option<WsRecoveredHook>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(probe_interval);
    interval.tick().await; // polling just started; probing immediately is pointless
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }

        match manager.connect(chain_id).await {
            Ok(_) => {
                info!(chain_id, "WebSocket recovered while polling");
                if let Some(hook) = &hook {
                    hook(chain_id);
                }
                return;
            }
            Err(err) => {
                debug!(chain_id, error = %err, "WebSocket still unavailable");
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
