//! Subscription orchestration: handle lifecycle, routing, transport fan-out.
//!
//! A subscribe call returns a [`SubscriptionHandle`] immediately - status
//! `Active` (optimistic), transport `Websocket` (provisional) - while setup
//! proceeds on a spawned task. Setup asks the connection manager for the
//! chain's client, arms the matching driver (WebSocket) or the poll manager
//! (fallback), and wires a bus listener filtered to exactly what the handle
//! asked for. Consumers only ever see bus-shaped data, so the transport can
//! change under them without notice.
//!
//! Cleanup is id-based: handles carry no references into the drivers, so
//! there is no ownership cycle to leak. The last consumer leaving a chain
//! tears its drivers down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use alloy::primitives::{Address, TxHash};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use evm_adapter::types::{BlockInfo, TransferEvent, parse_address};
use futures::StreamExt;
use rpc_guard::{Result, RpcError};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::events::{
    BalanceUpdate, EventBus, EventKind, EventPayload, ListenerGuard, SubscriptionId,
    SubscriptionKind, Transport,
};
use crate::live::client::{LiveClient, LogFilter, LogRecord};
use crate::live::connection_manager::ConnectionManager;
use crate::live::new_heads::{DriverCallbacks, NewHeadsDriver};
use crate::live::poll_manager::{PollCallbacks, PollManager};
use crate::live::tracker::AddressTracker;
use crate::live::transfer_logs::{TransferCallbacks, TransferLogsWatcher};

// ═══════════════════════════════════════════════════════════════════════════════
// STATUS & SINKS
// ═══════════════════════════════════════════════════════════════════════════════

/// Observable state of one subscription handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Delivering data (or optimistically assumed to be).
    Active,
    /// Alive but not delivering (e.g. pending-tx under polling).
    Paused,
    /// Setup or transport failed; the handle may still recover.
    Error,
    /// Closed; terminal.
    Closed,
}

/// Consumer callbacks for one subscription.
pub struct SubscriptionSink<T> {
    /// Invoked per delivered item.
    pub on_data: Option<Arc<dyn Fn(T) + Send + Sync>>,
    /// Invoked on subscription-level errors.
    pub on_error: Option<Arc<dyn Fn(RpcError) + Send + Sync>>,
    /// Invoked on status transitions.
    pub on_status: Option<Arc<dyn Fn(SubscriptionStatus) + Send + Sync>>,
}

impl<T> Default for SubscriptionSink<T> {
    fn default() -> Self {
        Self {
            on_data: None,
            on_error: None,
            on_status: None,
        }
    }
}

impl<T> Clone for SubscriptionSink<T> {
    fn clone(&self) -> Self {
        Self {
            on_data: self.on_data.clone(),
            on_error: self.on_error.clone(),
            on_status: self.on_status.clone(),
        }
    }
}

impl<T> std::fmt::Debug for SubscriptionSink<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionSink")
            .field("on_data", &self.on_data.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_status", &self.on_status.is_some())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HANDLE
// ═══════════════════════════════════════════════════════════════════════════════

struct HandleShared {
    status: std::sync::Mutex<SubscriptionStatus>,
    transport: std::sync::Mutex<Transport>,
    on_status: Option<Arc<dyn Fn(SubscriptionStatus) + Send + Sync>>,
}

impl HandleShared {
    #[allow(clippy::unwrap_used)] // mutex poisoning is unrecoverable here
    fn set_status(&self, status: SubscriptionStatus) {
        {
            let mut current = self.status.lock().unwrap();
            // Closed is terminal.
            if *current == SubscriptionStatus::Closed || *current == status {
                return;
            }
            *current = status;
        }
        if let Some(on_status) = &self.on_status {
            on_status(status);
        }
    }

    #[allow(clippy::unwrap_used)]
    fn set_transport(&self, transport: Transport) {
        *self.transport.lock().unwrap() = transport;
    }
}

/// A live subscription, returned immediately from every subscribe call.
pub struct SubscriptionHandle {
    /// Process-unique id.
    pub id: SubscriptionId,
    /// What the handle delivers.
    pub kind: SubscriptionKind,
    /// The chain it watches.
    pub chain_id: u64,
    /// When the handle was created.
    pub created_at: DateTime<Utc>,
    shared: Arc<HandleShared>,
    service: std::sync::Weak<ServiceInner>,
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("chain_id", &self.chain_id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl SubscriptionHandle {
    /// Current status.
    #[must_use]
    #[allow(clippy::unwrap_used)] // mutex poisoning is unrecoverable here
    pub fn status(&self) -> SubscriptionStatus {
        *self.shared.status.lock().unwrap()
    }

    /// Current transport.
    #[must_use]
    #[allow(clippy::unwrap_used)] // mutex poisoning is unrecoverable here
    pub fn transport(&self) -> Transport {
        *self.shared.transport.lock().unwrap()
    }

    /// Close the subscription. Idempotent beyond the first call.
    pub fn unsubscribe(&self) {
        if let Some(service) = self.service.upgrade() {
            ServiceInner::unsubscribe(&service, self.id);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// REGISTRY ENTRIES
// ═══════════════════════════════════════════════════════════════════════════════

struct SubEntry {
    kind: SubscriptionKind,
    chain_id: u64,
    shared: Arc<HandleShared>,
    /// Addresses this handle contributed to the tracked set.
    addresses: Vec<Address>,
    guard: std::sync::Mutex<Option<ListenerGuard>>,
    /// Direct-stream task (pending transactions, contract events).
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// SUBSCRIPTION SERVICE
// ═══════════════════════════════════════════════════════════════════════════════

struct ServiceInner {
    bus: Arc<EventBus>,
    manager: Arc<ConnectionManager>,
    new_heads: Arc<NewHeadsDriver>,
    transfers: Arc<TransferLogsWatcher>,
    poll: Arc<PollManager>,
    tracker: Arc<AddressTracker>,
    entries: DashMap<SubscriptionId, SubEntry>,
    destroyed: AtomicBool,
}

/// The realtime orchestrator.
pub struct SubscriptionService {
    inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for SubscriptionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionService")
            .field("subscriptions", &self.inner.entries.len())
            .finish_non_exhaustive()
    }
}

impl SubscriptionService {
    /// Wire the service over its collaborators and arm the recovery hook.
    #[must_use]
    pub fn new(
        bus: Arc<EventBus>,
        manager: Arc<ConnectionManager>,
        poll: Arc<PollManager>,
        tracker: Arc<AddressTracker>,
    ) -> Self {
        let inner = Arc::new(ServiceInner {
            new_heads: Arc::new(NewHeadsDriver::new(Arc::clone(&bus), Arc::clone(&tracker))),
            transfers: Arc::new(TransferLogsWatcher::new(Arc::clone(&bus), Arc::clone(&tracker))),
            bus,
            manager,
            poll,
            tracker,
            entries: DashMap::new(),
            destroyed: AtomicBool::new(false),
        });

        // The poll manager's probe reports recovery; rewiring happens here.
        let weak = Arc::downgrade(&inner);
        inner.poll.set_on_ws_recovered(Arc::new(move |chain_id| {
            if let Some(inner) = weak.upgrade() {
                tokio::spawn(async move {
                    ServiceInner::handle_ws_recovery(&inner, chain_id).await;
                });
            }
        }));

        // The connection manager's own reconnect loop reports the same way.
        let weak = Arc::downgrade(&inner);
        inner.manager.set_on_reconnected(Arc::new(move |chain_id| {
            if let Some(inner) = weak.upgrade() {
                tokio::spawn(async move {
                    ServiceInner::handle_ws_recovery(&inner, chain_id).await;
                });
            }
        }));

        // Mid-session outages: when the heartbeat declares a chain down,
        // polling takes over until a reconnect path succeeds.
        let weak = Arc::downgrade(&inner);
        let _ = inner.bus.on(
            EventKind::WebsocketDisconnected,
            Arc::new(move |event| {
                if let Some(inner) = weak.upgrade() {
                    let chain_id = event.chain_id;
                    tokio::spawn(async move {
                        ServiceInner::handle_ws_outage(&inner, chain_id).await;
                    });
                }
            }),
        );

        Self { inner }
    }

    /// Number of live (non-closed) subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.entries.len()
    }

    fn check_alive(&self) -> Result<()> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(RpcError::cancelled("subscription service destroyed"));
        }
        Ok(())
    }

    fn register(
        &self,
        kind: SubscriptionKind,
        chain_id: u64,
        addresses: Vec<Address>,
        on_status: Option<Arc<dyn Fn(SubscriptionStatus) + Send + Sync>>,
    ) -> (SubscriptionId, Arc<HandleShared>, SubscriptionHandle) {
        let id = Uuid::new_v4();
        let shared = Arc::new(HandleShared {
            status: std::sync::Mutex::new(SubscriptionStatus::Active),
            transport: std::sync::Mutex::new(Transport::Websocket),
            on_status,
        });
        let handle = SubscriptionHandle {
            id,
            kind,
            chain_id,
            created_at: Utc::now(),
            shared: Arc::clone(&shared),
            service: Arc::downgrade(&self.inner),
        };

        for address in &addresses {
            self.inner.tracker.track(chain_id, *address);
        }
        self.inner.entries.insert(
            id,
            SubEntry {
                kind,
                chain_id,
                shared: Arc::clone(&shared),
                addresses,
                guard: std::sync::Mutex::new(None),
                task: std::sync::Mutex::new(None),
            },
        );
        self.inner.bus.emit(
            EventKind::SubscriptionCreated,
            chain_id,
            EventPayload::Subscription { id, kind },
        );
        (id, shared, handle)
    }

    fn store_guard(&self, id: SubscriptionId, guard: ListenerGuard) {
        if let Some(entry) = self.inner.entries.get(&id) {
            #[allow(clippy::unwrap_used)]
            {
                *entry.guard.lock().unwrap() = Some(guard);
            }
        } else {
            // The handle closed before setup finished.
            guard.unsubscribe();
        }
    }

    fn store_task(&self, id: SubscriptionId, task: JoinHandle<()>) {
        if let Some(entry) = self.inner.entries.get(&id) {
            #[allow(clippy::unwrap_used)]
            {
                *entry.task.lock().unwrap() = Some(task);
            }
        } else {
            task.abort();
        }
    }

    // ───────────────────────────────────────────────────────────────────────────
    // SUBSCRIBE: BALANCES
    // ───────────────────────────────────────────────────────────────────────────

    /// Balance refreshes for a set of addresses on one chain.
    ///
    /// # Errors
    ///
    /// Validation errors for malformed addresses, or a cancellation error
    /// after `destroy`.
    #[instrument(skip(self, sink, addresses))]
    pub fn subscribe_balances(
        &self,
        chain_id: u64,
        addresses: &[String],
        sink: SubscriptionSink<BalanceUpdate>,
    ) -> Result<SubscriptionHandle> {
        self.check_alive()?;
        let parsed = parse_all(addresses)?;
        let (id, shared, handle) =
            self.register(SubscriptionKind::Balances, chain_id, parsed.clone(), sink.on_status.clone());

        // Deliver matching bus events regardless of transport.
        let address_set: std::collections::HashSet<Address> = parsed.iter().copied().collect();
        let on_data = sink.on_data.clone();
        let guard = self.inner.bus.on(
            EventKind::LiveBalanceUpdated,
            Arc::new(move |event| {
                if event.chain_id != chain_id {
                    return;
                }
                if let EventPayload::Balance(update) = &event.payload {
                    if address_set.contains(&update.address) {
                        if let Some(on_data) = &on_data {
                            on_data(update.clone());
                        }
                    }
                }
            }),
        );
        self.store_guard(id, guard);

        self.spawn_transport_setup(id, chain_id, shared, parsed, sink.on_error, TransportNeed::Heads);
        Ok(handle)
    }

    // ───────────────────────────────────────────────────────────────────────────
    // SUBSCRIBE: TOKEN TRANSFERS
    // ───────────────────────────────────────────────────────────────────────────

    /// ERC-20 transfers touching a set of addresses, optionally narrowed to
    /// a token contract set.
    ///
    /// # Errors
    ///
    /// Same classification as [`subscribe_balances`](Self::subscribe_balances).
    #[instrument(skip(self, sink, addresses, tokens))]
    pub fn subscribe_token_transfers(
        &self,
        chain_id: u64,
        addresses: &[String],
        tokens: Vec<Address>,
        sink: SubscriptionSink<TransferEvent>,
    ) -> Result<SubscriptionHandle> {
        self.check_alive()?;
        let parsed = parse_all(addresses)?;
        let (id, shared, handle) = self.register(
            SubscriptionKind::TokenTransfers,
            chain_id,
            parsed.clone(),
            sink.on_status.clone(),
        );

        let address_set: std::collections::HashSet<Address> = parsed.iter().copied().collect();
        let token_set: std::collections::HashSet<Address> = tokens.into_iter().collect();
        let on_data = sink.on_data.clone();
        let guard = self.inner.bus.on(
            EventKind::LiveTransferDetected,
            Arc::new(move |event| {
                if event.chain_id != chain_id {
                    return;
                }
                if let EventPayload::Transfer(transfer) = &event.payload {
                    let involved = address_set.contains(&transfer.from)
                        || address_set.contains(&transfer.to);
                    let token_ok =
                        token_set.is_empty() || token_set.contains(&transfer.token_address);
                    if involved && token_ok {
                        if let Some(on_data) = &on_data {
                            on_data(transfer.clone());
                        }
                    }
                }
            }),
        );
        self.store_guard(id, guard);

        self.spawn_transport_setup(
            id,
            chain_id,
            shared,
            parsed,
            sink.on_error,
            TransportNeed::Transfers,
        );
        Ok(handle)
    }

    // ───────────────────────────────────────────────────────────────────────────
    // SUBSCRIBE: NEW BLOCKS
    // ───────────────────────────────────────────────────────────────────────────

    /// Every new block on one chain.
    ///
    /// # Errors
    ///
    /// A cancellation error after `destroy`.
    #[instrument(skip(self, sink))]
    pub fn subscribe_new_blocks(
        &self,
        chain_id: u64,
        sink: SubscriptionSink<BlockInfo>,
    ) -> Result<SubscriptionHandle> {
        self.check_alive()?;
        let (id, shared, handle) =
            self.register(SubscriptionKind::NewBlocks, chain_id, Vec::new(), sink.on_status.clone());

        let on_data = sink.on_data.clone();
        let guard = self.inner.bus.on(
            EventKind::LiveBlockReceived,
            Arc::new(move |event| {
                if event.chain_id != chain_id {
                    return;
                }
                if let EventPayload::Block(block) = &event.payload {
                    if let Some(on_data) = &on_data {
                        on_data(block.clone());
                    }
                }
            }),
        );
        self.store_guard(id, guard);

        self.spawn_transport_setup(id, chain_id, shared, Vec::new(), sink.on_error, TransportNeed::Heads);
        Ok(handle)
    }

    // ───────────────────────────────────────────────────────────────────────────
    // SUBSCRIBE: PENDING TRANSACTIONS
    // ───────────────────────────────────────────────────────────────────────────

    /// Pending transaction hashes. WebSocket only: under the polling
    /// transport the handle moves to `Paused`.
    ///
    /// # Errors
    ///
    /// A cancellation error after `destroy`.
    #[instrument(skip(self, sink))]
    pub fn subscribe_pending_transactions(
        &self,
        chain_id: u64,
        sink: SubscriptionSink<TxHash>,
    ) -> Result<SubscriptionHandle> {
        self.check_alive()?;
        let (id, shared, handle) = self.register(
            SubscriptionKind::PendingTransactions,
            chain_id,
            Vec::new(),
            sink.on_status.clone(),
        );

        let inner = Arc::clone(&self.inner);
        let service = Self {
            inner: Arc::clone(&self.inner),
        };
        tokio::spawn(async move {
            let (client, transport) = inner.manager.client_for(chain_id).await;
            shared.set_transport(transport);
            inner.manager.increment_subscription_count(chain_id);

            if transport == Transport::Polling {
                // Polling cannot observe the mempool.
                shared.set_status(SubscriptionStatus::Paused);
                return;
            }

            match client.watch_pending_transactions().await {
                Ok(mut stream) => {
                    let on_data = sink.on_data.clone();
                    let on_error = sink.on_error.clone();
                    let shared = Arc::clone(&shared);
                    let task = tokio::spawn(async move {
                        while let Some(item) = stream.next().await {
                            match item {
                                Ok(hash) => {
                                    if let Some(on_data) = &on_data {
                                        on_data(hash);
                                    }
                                }
                                Err(err) => {
                                    if let Some(on_error) = &on_error {
                                        on_error(err);
                                    }
                                }
                            }
                        }
                        shared.set_status(SubscriptionStatus::Error);
                    });
                    service.store_task(id, task);
                }
                Err(err) => {
                    shared.set_status(SubscriptionStatus::Error);
                    if let Some(on_error) = &sink.on_error {
                        on_error(err);
                    }
                }
            }
        });
        Ok(handle)
    }

    // ───────────────────────────────────────────────────────────────────────────
    // SUBSCRIBE: CONTRACT EVENTS
    // ───────────────────────────────────────────────────────────────────────────

    /// Raw logs from chosen contracts. WebSocket only: under the polling
    /// transport the handle moves to `Paused`.
    ///
    /// # Errors
    ///
    /// A cancellation error after `destroy`.
    #[instrument(skip(self, sink, filter))]
    pub fn subscribe_contract_events(
        &self,
        chain_id: u64,
        filter: LogFilter,
        sink: SubscriptionSink<LogRecord>,
    ) -> Result<SubscriptionHandle> {
        self.check_alive()?;
        let (id, shared, handle) = self.register(
            SubscriptionKind::ContractEvents,
            chain_id,
            Vec::new(),
            sink.on_status.clone(),
        );

        let inner = Arc::clone(&self.inner);
        let service = Self {
            inner: Arc::clone(&self.inner),
        };
        tokio::spawn(async move {
            let (client, transport) = inner.manager.client_for(chain_id).await;
            shared.set_transport(transport);
            inner.manager.increment_subscription_count(chain_id);

            if transport == Transport::Polling {
                shared.set_status(SubscriptionStatus::Paused);
                return;
            }

            match client.watch_logs(&filter).await {
                Ok(mut stream) => {
                    let on_data = sink.on_data.clone();
                    let on_error = sink.on_error.clone();
                    let shared = Arc::clone(&shared);
                    let task = tokio::spawn(async move {
                        while let Some(item) = stream.next().await {
                            match item {
                                Ok(record) => {
                                    if let Some(on_data) = &on_data {
                                        on_data(record);
                                    }
                                }
                                Err(err) => {
                                    if let Some(on_error) = &on_error {
                                        on_error(err);
                                    }
                                }
                            }
                        }
                        shared.set_status(SubscriptionStatus::Error);
                    });
                    service.store_task(id, task);
                }
                Err(err) => {
                    shared.set_status(SubscriptionStatus::Error);
                    if let Some(on_error) = &sink.on_error {
                        on_error(err);
                    }
                }
            }
        });
        Ok(handle)
    }

    // ───────────────────────────────────────────────────────────────────────────
    // TRANSPORT SETUP
    // ───────────────────────────────────────────────────────────────────────────

    fn spawn_transport_setup(
        &self,
        id: SubscriptionId,
        chain_id: u64,
        shared: Arc<HandleShared>,
        addresses: Vec<Address>,
        on_error: Option<Arc<dyn Fn(RpcError) + Send + Sync>>,
        need: TransportNeed,
    ) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let (client, transport) = inner.manager.client_for(chain_id).await;
            shared.set_transport(transport);
            inner.manager.increment_subscription_count(chain_id);

            match transport {
                Transport::Websocket => {
                    ServiceInner::arm_ws_drivers(&inner, chain_id, &client, need, on_error.clone())
                        .await;
                }
                Transport::Polling => {
                    let callbacks = PollCallbacks {
                        driver: DriverCallbacks {
                            on_error: on_error.clone(),
                            ..DriverCallbacks::default()
                        },
                        ..PollCallbacks::default()
                    };
                    inner.poll.start_polling(
                        chain_id,
                        client,
                        addresses,
                        callbacks,
                        need == TransportNeed::Transfers,
                    );
                }
            }
            debug!(%id, chain_id, ?transport, "Subscription setup complete");
        });
    }

    // ───────────────────────────────────────────────────────────────────────────
    // LIFECYCLE
    // ───────────────────────────────────────────────────────────────────────────

    /// Close one subscription by id. Idempotent.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        ServiceInner::unsubscribe(&self.inner, id);
    }

    /// Close every handle and tear down drivers, poll manager, connection
    /// manager, and bus listeners. Further subscribes fail.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let ids: Vec<SubscriptionId> = self.inner.entries.iter().map(|e| *e.key()).collect();
        for id in ids {
            ServiceInner::unsubscribe(&self.inner, id);
        }
        self.inner.new_heads.destroy();
        self.inner.transfers.destroy();
        self.inner.poll.destroy();
        self.inner.manager.destroy();
        self.inner.bus.remove_all_listeners();
        info!("Subscription service destroyed");
    }
}

/// Which WebSocket driver a subscription kind needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportNeed {
    /// New-heads driver (balances, new blocks).
    Heads,
    /// Transfer-logs watcher.
    Transfers,
}

impl ServiceInner {
    async fn arm_ws_drivers(
        inner: &Arc<Self>,
        chain_id: u64,
        client: &Arc<dyn LiveClient>,
        need: TransportNeed,
        on_error: Option<Arc<dyn Fn(RpcError) + Send + Sync>>,
    ) {
        match need {
            TransportNeed::Heads => {
                let callbacks = DriverCallbacks {
                    on_error,
                    ..DriverCallbacks::default()
                };
                if let Err(err) = inner
                    .new_heads
                    .subscribe(chain_id, Arc::clone(client), callbacks)
                    .await
                {
                    warn!(chain_id, error = %err, "Failed to arm new-heads driver");
                }
            }
            TransportNeed::Transfers => {
                let callbacks = TransferCallbacks {
                    on_error,
                    ..TransferCallbacks::default()
                };
                // The watcher is armed unfiltered; per-handle token
                // narrowing happens in the bus listener.
                if let Err(err) = inner
                    .transfers
                    .subscribe(chain_id, Arc::clone(client), Vec::new(), callbacks)
                    .await
                {
                    warn!(chain_id, error = %err, "Failed to arm transfer watcher");
                }
            }
        }
    }

    /// Remove one entry and tear down whatever only it was using.
    fn unsubscribe(inner: &Arc<Self>, id: SubscriptionId) {
        let Some((_, entry)) = inner.entries.remove(&id) else {
            return;
        };

        #[allow(clippy::unwrap_used)]
        if let Some(guard) = entry.guard.lock().unwrap().take() {
            guard.unsubscribe();
        }
        #[allow(clippy::unwrap_used)]
        if let Some(task) = entry.task.lock().unwrap().take() {
            task.abort();
        }

        // Untrack addresses no other live handle still needs.
        for address in &entry.addresses {
            let still_needed = inner.entries.iter().any(|other| {
                other.chain_id == entry.chain_id && other.addresses.contains(address)
            });
            if !still_needed {
                inner.tracker.untrack(entry.chain_id, *address);
                inner.poll.remove_tracked_address(entry.chain_id, *address);
            }
        }

        inner.manager.decrement_subscription_count(entry.chain_id);

        // Last consumer on the chain: tear the transports down.
        let chain_in_use = inner.entries.iter().any(|other| other.chain_id == entry.chain_id);
        if !chain_in_use {
            inner.new_heads.unsubscribe(entry.chain_id);
            inner.transfers.unsubscribe(entry.chain_id);
            inner.poll.stop_polling(entry.chain_id);
        }

        entry.shared.set_status(SubscriptionStatus::Closed);
        inner.bus.emit(
            EventKind::SubscriptionRemoved,
            entry.chain_id,
            EventPayload::Subscription {
                id,
                kind: entry.kind,
            },
        );
        debug!(%id, chain_id = entry.chain_id, "Subscription closed");
    }

    /// A chain's WebSocket died mid-session: hand its consumers to the
    /// polling transport until a reconnect path succeeds.
    async fn handle_ws_outage(inner: &Arc<Self>, chain_id: u64) {
        let mut has_consumers = false;
        let mut track_transfers = false;
        for entry in &inner.entries {
            if entry.chain_id != chain_id {
                continue;
            }
            match entry.kind {
                SubscriptionKind::TokenTransfers => {
                    has_consumers = true;
                    track_transfers = true;
                }
                SubscriptionKind::Balances | SubscriptionKind::NewBlocks => has_consumers = true,
                SubscriptionKind::PendingTransactions | SubscriptionKind::ContractEvents => {}
            }
        }
        if !has_consumers {
            return;
        }

        let (client, transport) = inner.manager.client_for(chain_id).await;
        if transport == Transport::Websocket {
            // The socket came straight back; the reconnect hook re-arms.
            return;
        }

        warn!(chain_id, "WebSocket lost; polling takes over");
        let addresses = inner.tracker.addresses(chain_id);
        inner.poll.start_polling(
            chain_id,
            client,
            addresses,
            PollCallbacks::default(),
            track_transfers,
        );
        for entry in &inner.entries {
            if entry.chain_id == chain_id
                && matches!(
                    entry.kind,
                    SubscriptionKind::Balances
                        | SubscriptionKind::NewBlocks
                        | SubscriptionKind::TokenTransfers
                )
            {
                entry.shared.set_transport(Transport::Polling);
            }
        }
    }

    /// The recovery probe brought the WebSocket back: re-arm drivers and
    /// retire polling when nothing still needs it.
    async fn handle_ws_recovery(inner: &Arc<Self>, chain_id: u64) {
        let client = match inner.manager.connect(chain_id).await {
            Ok(client) => client,
            Err(err) => {
                warn!(chain_id, error = %err, "Recovery reported but connect failed");
                return;
            }
        };
        info!(chain_id, "Rewiring subscriptions onto WebSocket");

        let mut needs_heads = false;
        let mut needs_transfers = false;
        for entry in &inner.entries {
            if entry.chain_id != chain_id {
                continue;
            }
            match entry.kind {
                SubscriptionKind::Balances | SubscriptionKind::NewBlocks => needs_heads = true,
                SubscriptionKind::TokenTransfers => needs_transfers = true,
                // Pending-tx handles paused under polling stay paused;
                // resuming them is a product decision (see DESIGN notes).
                SubscriptionKind::PendingTransactions | SubscriptionKind::ContractEvents => {}
            }
        }

        if needs_heads {
            Self::arm_ws_drivers(inner, chain_id, &client, TransportNeed::Heads, None).await;
        }
        if needs_transfers {
            Self::arm_ws_drivers(inner, chain_id, &client, TransportNeed::Transfers, None).await;
        }

        for entry in &inner.entries {
            if entry.chain_id == chain_id
                && matches!(
                    entry.kind,
                    SubscriptionKind::Balances
                        | SubscriptionKind::NewBlocks
                        | SubscriptionKind::TokenTransfers
                )
            {
                entry.shared.set_transport(Transport::Websocket);
            }
        }

        // Everything polling could serve is now on WebSocket.
        inner.poll.stop_polling(chain_id);
    }
}

fn parse_all(addresses: &[String]) -> Result<Vec<Address>> {
    addresses.iter().map(|a| parse_address(a)).collect()
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use alloy::primitives::{B256, Bytes, U256};

    use super::*;
    use crate::config::Settings;
    use crate::live::client::MockLiveClient;
    use crate::live::connection_manager::{ClientFactory, ManagerConfig};
    use crate::live::poll_manager::PollConfig;
    use crate::live::transfer_logs::TRANSFER_TOPIC;

    const ADDR: &str = "0x1111111111111111111111111111111111111111";

    fn addr(byte: u8) -> Address {
        Address::from_slice(&[byte; 20])
    }

    fn tracked() -> Address {
        parse_address(ADDR).unwrap()
    }

    struct Fixture {
        service: SubscriptionService,
        ws: Arc<MockLiveClient>,
        http: Arc<MockLiveClient>,
        bus: Arc<EventBus>,
    }

    fn fixture() -> Fixture {
        let settings = Settings::default();
        let bus = Arc::new(EventBus::new());
        let ws = Arc::new(MockLiveClient::new());
        let http = Arc::new(MockLiveClient::new());

        let ws_for_factory = Arc::clone(&ws);
        let ws_factory: ClientFactory =
            Arc::new(move |_| Arc::clone(&ws_for_factory) as Arc<dyn LiveClient>);
        let http_for_factory = Arc::clone(&http);
        let http_factory: ClientFactory =
            Arc::new(move |_| Arc::clone(&http_for_factory) as Arc<dyn LiveClient>);

        let manager = Arc::new(ConnectionManager::new(
            settings.realtime.to_config(),
            ws_factory,
            http_factory,
            Arc::clone(&bus),
        ));
        let poll = Arc::new(PollManager::new(
            PollConfig {
                poll_interval: Duration::from_secs(5),
                ws_recovery_interval: Duration::from_secs(10),
            },
            Arc::clone(&bus),
            Arc::clone(&manager),
        ));
        let tracker = Arc::new(AddressTracker::new());

        Fixture {
            service: SubscriptionService::new(Arc::clone(&bus), manager, poll, tracker),
            ws,
            http,
            bus,
        }
    }

    fn transfer_log(token: Address, from: Address, to: Address, value: u64) -> LogRecord {
        let topic_for = |address: Address| {
            let mut padded = [0u8; 32];
            padded[12..].copy_from_slice(address.as_slice());
            B256::from(padded)
        };
        LogRecord {
            address: token,
            topics: vec![TRANSFER_TOPIC, topic_for(from), topic_for(to)],
            data: Bytes::from(U256::from(value).to_be_bytes::<32>().to_vec()),
            block_number: Some(10),
            tx_hash: Some(TxHash::from([0xEE; 32])),
            log_index: Some(0),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn balance_subscription_delivers_matching_updates() {
        let fx = fixture();
        fx.ws.set_balance(tracked(), U256::from(500u64));

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = SubscriptionSink {
            on_data: Some(Arc::new({
                let received = Arc::clone(&received);
                move |update: BalanceUpdate| received.lock().unwrap().push(update)
            })),
            ..SubscriptionSink::default()
        };

        let handle = fx
            .service
            .subscribe_balances(1, &[ADDR.to_string()], sink)
            .unwrap();
        assert_eq!(handle.status(), SubscriptionStatus::Active);
        tokio::task::yield_now().await;
        assert_eq!(handle.transport(), Transport::Websocket);

        fx.ws.push_block(7);
        tokio::task::yield_now().await;

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].address, tracked());
        assert_eq!(received[0].amount, U256::from(500u64));
    }

    #[tokio::test(start_paused = true)]
    async fn updates_for_other_addresses_are_filtered_out() {
        let fx = fixture();
        let received = Arc::new(Mutex::new(0u32));
        let sink = SubscriptionSink {
            on_data: Some(Arc::new({
                let received = Arc::clone(&received);
                move |_: BalanceUpdate| *received.lock().unwrap() += 1
            })),
            ..SubscriptionSink::default()
        };
        let _handle = fx
            .service
            .subscribe_balances(1, &[ADDR.to_string()], sink)
            .unwrap();
        tokio::task::yield_now().await;

        // Another consumer tracks a different address on the same chain.
        let _other = fx
            .service
            .subscribe_balances(
                1,
                &["0x2222222222222222222222222222222222222222".to_string()],
                SubscriptionSink::default(),
            )
            .unwrap();
        tokio::task::yield_now().await;

        fx.ws.push_block(3);
        tokio::task::yield_now().await;

        // Both addresses refreshed, but this sink saw only its own.
        assert_eq!(*received.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transfer_subscription_matches_from_or_to() {
        let fx = fixture();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = SubscriptionSink {
            on_data: Some(Arc::new({
                let received = Arc::clone(&received);
                move |t: TransferEvent| received.lock().unwrap().push(t.value)
            })),
            ..SubscriptionSink::default()
        };
        let _handle = fx
            .service
            .subscribe_token_transfers(1, &[ADDR.to_string()], Vec::new(), sink)
            .unwrap();
        tokio::task::yield_now().await;

        fx.ws.push_log(&transfer_log(addr(0xAA), tracked(), addr(0x99), 1));
        fx.ws.push_log(&transfer_log(addr(0xAA), addr(0x98), tracked(), 2));
        fx.ws.push_log(&transfer_log(addr(0xAA), addr(0x98), addr(0x99), 3));
        tokio::task::yield_now().await;

        assert_eq!(*received.lock().unwrap(), vec![U256::from(1u64), U256::from(2u64)]);
    }

    #[tokio::test(start_paused = true)]
    async fn token_filter_narrows_transfer_delivery() {
        let fx = fixture();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = SubscriptionSink {
            on_data: Some(Arc::new({
                let received = Arc::clone(&received);
                move |t: TransferEvent| received.lock().unwrap().push(t.token_address)
            })),
            ..SubscriptionSink::default()
        };
        let _handle = fx
            .service
            .subscribe_token_transfers(1, &[ADDR.to_string()], vec![addr(0xAA)], sink)
            .unwrap();
        tokio::task::yield_now().await;

        fx.ws.push_log(&transfer_log(addr(0xAA), tracked(), addr(0x99), 1));
        fx.ws.push_log(&transfer_log(addr(0xBB), tracked(), addr(0x99), 2));
        tokio::task::yield_now().await;

        assert_eq!(*received.lock().unwrap(), vec![addr(0xAA)]);
    }

    #[tokio::test(start_paused = true)]
    async fn new_blocks_subscription_delivers_blocks() {
        let fx = fixture();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = SubscriptionSink {
            on_data: Some(Arc::new({
                let received = Arc::clone(&received);
                move |b: BlockInfo| received.lock().unwrap().push(b.number)
            })),
            ..SubscriptionSink::default()
        };
        let _handle = fx.service.subscribe_new_blocks(1, sink).unwrap();
        tokio::task::yield_now().await;

        fx.ws.push_block(42);
        tokio::task::yield_now().await;
        assert_eq!(*received.lock().unwrap(), vec![42]);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_transactions_pause_under_polling() {
        let fx = fixture();
        fx.ws.set_connect_fails(true);

        let statuses = Arc::new(Mutex::new(Vec::new()));
        let sink = SubscriptionSink {
            on_status: Some(Arc::new({
                let statuses = Arc::clone(&statuses);
                move |status| statuses.lock().unwrap().push(status)
            })),
            ..SubscriptionSink::<TxHash>::default()
        };
        let handle = fx.service.subscribe_pending_transactions(1, sink).unwrap();
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert_eq!(handle.transport(), Transport::Polling);
        assert_eq!(handle.status(), SubscriptionStatus::Paused);
        assert_eq!(*statuses.lock().unwrap(), vec![SubscriptionStatus::Paused]);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_transactions_stream_over_websocket() {
        let fx = fixture();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = SubscriptionSink {
            on_data: Some(Arc::new({
                let received = Arc::clone(&received);
                move |hash: TxHash| received.lock().unwrap().push(hash)
            })),
            ..SubscriptionSink::default()
        };
        let handle = fx.service.subscribe_pending_transactions(1, sink).unwrap();
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(handle.transport(), Transport::Websocket);

        fx.ws.push_pending(TxHash::from([7; 32]));
        tokio::task::yield_now().await;
        assert_eq!(*received.lock().unwrap(), vec![TxHash::from([7; 32])]);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_transport_serves_balances_transparently() {
        let fx = fixture();
        fx.ws.set_connect_fails(true);
        fx.http.set_head(100);
        fx.http.set_balance(tracked(), U256::from(9u64));

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = SubscriptionSink {
            on_data: Some(Arc::new({
                let received = Arc::clone(&received);
                move |update: BalanceUpdate| received.lock().unwrap().push(update.amount)
            })),
            ..SubscriptionSink::default()
        };
        let handle = fx
            .service
            .subscribe_balances(1, &[ADDR.to_string()], sink)
            .unwrap();
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(handle.transport(), Transport::Polling);
        assert_eq!(handle.status(), SubscriptionStatus::Active);

        // Baseline poll, then an advancing head.
        tokio::task::yield_now().await;
        fx.http.set_head(101);
        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;

        assert_eq!(*received.lock().unwrap(), vec![U256::from(9u64)]);
    }

    #[tokio::test(start_paused = true)]
    async fn ws_recovery_rewires_and_stops_polling() {
        let fx = fixture();
        fx.ws.set_connect_fails(true);
        fx.http.set_head(100);

        let handle = fx
            .service
            .subscribe_balances(1, &[ADDR.to_string()], SubscriptionSink::default())
            .unwrap();
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(handle.transport(), Transport::Polling);
        assert!(fx.service.inner.poll.is_polling(1));

        // The socket comes back; the probe fires at 10s.
        fx.ws.set_connect_fails(false);
        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert_eq!(handle.transport(), Transport::Websocket);
        assert!(!fx.service.inner.poll.is_polling(1), "polling retired");
        assert!(fx.service.inner.new_heads.is_subscribed(1), "driver re-armed");
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_closes_once_and_tears_down_drivers() {
        let fx = fixture();
        let removed = Arc::new(Mutex::new(0u32));
        let guard = fx.bus.on(
            EventKind::SubscriptionRemoved,
            Arc::new({
                let removed = Arc::clone(&removed);
                move |_| *removed.lock().unwrap() += 1
            }),
        );

        let handle = fx
            .service
            .subscribe_balances(1, &[ADDR.to_string()], SubscriptionSink::default())
            .unwrap();
        tokio::task::yield_now().await;
        assert!(fx.service.inner.new_heads.is_subscribed(1));
        assert!(fx.service.inner.tracker.is_tracked(1, tracked()));

        handle.unsubscribe();
        handle.unsubscribe();
        assert_eq!(handle.status(), SubscriptionStatus::Closed);
        assert_eq!(*removed.lock().unwrap(), 1, "closed exactly once");
        assert_eq!(fx.service.subscription_count(), 0);
        assert!(!fx.service.inner.new_heads.is_subscribed(1), "last consumer left");
        assert!(!fx.service.inner.tracker.is_tracked(1, tracked()));

        guard.unsubscribe();
    }

    #[tokio::test(start_paused = true)]
    async fn shared_addresses_stay_tracked_until_the_last_consumer_leaves() {
        let fx = fixture();
        let first = fx
            .service
            .subscribe_balances(1, &[ADDR.to_string()], SubscriptionSink::default())
            .unwrap();
        let second = fx
            .service
            .subscribe_balances(1, &[ADDR.to_string()], SubscriptionSink::default())
            .unwrap();
        tokio::task::yield_now().await;

        first.unsubscribe();
        assert!(fx.service.inner.tracker.is_tracked(1, tracked()));

        second.unsubscribe();
        assert!(!fx.service.inner.tracker.is_tracked(1, tracked()));
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_closes_everything_and_refuses_new_subscriptions() {
        let fx = fixture();
        let handle = fx
            .service
            .subscribe_balances(1, &[ADDR.to_string()], SubscriptionSink::default())
            .unwrap();
        tokio::task::yield_now().await;

        fx.service.destroy();
        fx.service.destroy();
        assert_eq!(handle.status(), SubscriptionStatus::Closed);

        let err = fx
            .service
            .subscribe_balances(1, &[ADDR.to_string()], SubscriptionSink::default())
            .unwrap_err();
        assert_eq!(err.code(), "CANCELLED");
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_addresses_fail_synchronously() {
        let fx = fixture();
        let err = fx
            .service
            .subscribe_balances(1, &["garbage".to_string()], SubscriptionSink::default())
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
        assert_eq!(fx.service.subscription_count(), 0);
    }
}
