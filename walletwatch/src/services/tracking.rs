//! Periodic balance and transaction diffing per tracked pair.
//!
//! Each `(address, chain)` pair gets its own tick task. The first tick is a
//! silent baseline; later ticks emit `on_balance_change` on any amount
//! change and `on_new_transaction` for hashes not seen before. The seen-set
//! is capped so a long-lived tracker cannot grow without bound, and
//! transient errors are counted and reported but never stop the loop.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::{Address, TxHash};
use dashmap::DashMap;
use evm_adapter::types::{Balance, Transaction, parse_address};
use rpc_guard::{Result, RpcError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::balance::{BalanceOptions, BalanceService};
use super::transaction::{TransactionPageRequest, TransactionService};
use crate::config::TrackingSettings;

// ═══════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Maximum transaction hashes remembered per tracked pair.
const SEEN_TX_CAP: usize = 100;

/// Page size used when diffing recent transactions.
const RECENT_TX_PAGE: usize = 20;

// ═══════════════════════════════════════════════════════════════════════════════
// CONFIG & CALLBACKS
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-pair overrides merged over [`TrackingSettings`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TrackingOverrides {
    /// Override the tick cadence.
    pub polling_interval: Option<Duration>,
    /// Override balance tracking.
    pub track_balances: Option<bool>,
    /// Override transaction tracking.
    pub track_transactions: Option<bool>,
}

#[derive(Debug, Clone, Copy)]
struct EffectiveConfig {
    polling_interval: Duration,
    track_balances: bool,
    track_transactions: bool,
}

impl EffectiveConfig {
    fn merge(settings: &TrackingSettings, overrides: TrackingOverrides) -> Self {
        Self {
            polling_interval: overrides
                .polling_interval
                .unwrap_or_else(|| settings.polling_interval()),
            track_balances: overrides.track_balances.unwrap_or(settings.track_balances),
            track_transactions: overrides
                .track_transactions
                .unwrap_or(settings.track_transactions),
        }
    }
}

/// Tracking callbacks. All optional.
#[derive(Clone, Default)]
pub struct TrackingCallbacks {
    /// Invoked with `(old, new)` when a tracked balance changes.
    pub on_balance_change: Option<Arc<dyn Fn(Balance, Balance) + Send + Sync>>,
    /// Invoked for each transaction hash not seen before.
    pub on_new_transaction: Option<Arc<dyn Fn(Transaction) + Send + Sync>>,
    /// Invoked for tick errors.
    pub on_error: Option<Arc<dyn Fn(RpcError) + Send + Sync>>,
}

impl std::fmt::Debug for TrackingCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackingCallbacks")
            .field("on_balance_change", &self.on_balance_change.is_some())
            .field("on_new_transaction", &self.on_new_transaction.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Point-in-time status of one tracked pair.
#[derive(Debug, Clone)]
pub struct TrackingStatus {
    /// Whether the tick task is running.
    pub is_active: bool,
    /// Time since the last completed tick.
    pub last_update_age: Option<Duration>,
    /// Errors observed so far.
    pub error_count: u64,
    /// The most recent error, if any.
    pub last_error: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// SEEN SET
// ═══════════════════════════════════════════════════════════════════════════════

/// Insertion-ordered hash set capped at a fixed size.
#[derive(Debug, Default)]
struct SeenTxSet {
    order: VecDeque<TxHash>,
    set: HashSet<TxHash>,
}

impl SeenTxSet {
    /// Remember a hash. Returns whether it was new.
    fn insert(&mut self, hash: TxHash) -> bool {
        if !self.set.insert(hash) {
            return false;
        }
        self.order.push_back(hash);
        while self.order.len() > SEEN_TX_CAP {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        true
    }

    fn contains(&self, hash: &TxHash) -> bool {
        self.set.contains(hash)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRACKING SERVICE
// ═══════════════════════════════════════════════════════════════════════════════

struct PairState {
    is_active: bool,
    last_update_at: Option<Instant>,
    error_count: u64,
    last_error: Option<String>,
}

struct TrackSlot {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    state: Arc<Mutex<PairState>>,
    overrides: TrackingOverrides,
    callbacks: TrackingCallbacks,
}

/// Multi-address, multi-chain polling of balance and transaction diffs.
pub struct TrackingService {
    settings: TrackingSettings,
    balances: Arc<BalanceService>,
    transactions: Arc<TransactionService>,
    slots: DashMap<(Address, u64), TrackSlot>,
}

impl std::fmt::Debug for TrackingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackingService")
            .field("tracked_pairs", &self.slots.len())
            .finish_non_exhaustive()
    }
}

impl TrackingService {
    /// Create a tracker over the balance and transaction services.
    #[must_use]
    pub fn new(
        settings: TrackingSettings,
        balances: Arc<BalanceService>,
        transactions: Arc<TransactionService>,
    ) -> Self {
        Self {
            settings,
            balances,
            transactions,
            slots: DashMap::new(),
        }
    }

    /// Start tracking an address on the given chains. Pairs already tracked
    /// are left running.
    ///
    /// # Errors
    ///
    /// Validation error for a malformed address.
    #[instrument(skip(self, overrides, callbacks))]
    pub fn start_tracking(
        &self,
        address: &str,
        chains: &[u64],
        overrides: TrackingOverrides,
        callbacks: TrackingCallbacks,
    ) -> Result<()> {
        let address = parse_address(address)?;
        for &chain_id in chains {
            if self.slots.contains_key(&(address, chain_id)) {
                debug!(%address, chain_id, "Pair already tracked");
                continue;
            }
            self.spawn_pair(address, chain_id, overrides, callbacks.clone());
        }
        Ok(())
    }

    fn spawn_pair(
        &self,
        address: Address,
        chain_id: u64,
        overrides: TrackingOverrides,
        callbacks: TrackingCallbacks,
    ) {
        let config = EffectiveConfig::merge(&self.settings, overrides);
        let state = Arc::new(Mutex::new(PairState {
            is_active: true,
            last_update_at: None,
            error_count: 0,
            last_error: None,
        }));
        let cancel = CancellationToken::new();

        info!(%address, chain_id, interval = ?config.polling_interval, "Tracking started");
        let handle = tokio::spawn(track_pair(
            address,
            chain_id,
            config,
            Arc::clone(&self.balances),
            Arc::clone(&self.transactions),
            callbacks.clone(),
            Arc::clone(&state),
            cancel.clone(),
        ));

        self.slots.insert(
            (address, chain_id),
            TrackSlot {
                cancel,
                handle,
                state,
                overrides,
                callbacks,
            },
        );
    }

    /// Stop tracking an address on one chain, or on every chain.
    pub fn stop_tracking(&self, address: &str, chain_id: Option<u64>) {
        let Ok(address) = parse_address(address) else {
            return;
        };
        let keys: Vec<(Address, u64)> = self
            .slots
            .iter()
            .map(|e| *e.key())
            .filter(|(a, c)| *a == address && chain_id.is_none_or(|chain| chain == *c))
            .collect();
        for key in keys {
            if let Some((_, slot)) = self.slots.remove(&key) {
                slot.cancel.cancel();
                slot.handle.abort();
                #[allow(clippy::unwrap_used)]
                {
                    slot.state.lock().unwrap().is_active = false;
                }
                info!(address = %key.0, chain_id = key.1, "Tracking stopped");
            }
        }
    }

    /// Re-start a tracked pair with merged overrides.
    ///
    /// # Errors
    ///
    /// Validation error for a malformed address.
    pub fn update_tracking_config(
        &self,
        address: &str,
        chain_id: u64,
        overrides: TrackingOverrides,
    ) -> Result<()> {
        let parsed = parse_address(address)?;
        let Some((_, slot)) = self.slots.remove(&(parsed, chain_id)) else {
            return Err(RpcError::validation(
                "pair",
                "a tracked (address, chain) pair",
                format!("{address}@{chain_id}"),
            ));
        };
        slot.cancel.cancel();
        slot.handle.abort();

        let merged = TrackingOverrides {
            polling_interval: overrides.polling_interval.or(slot.overrides.polling_interval),
            track_balances: overrides.track_balances.or(slot.overrides.track_balances),
            track_transactions: overrides
                .track_transactions
                .or(slot.overrides.track_transactions),
        };
        self.spawn_pair(parsed, chain_id, merged, slot.callbacks);
        Ok(())
    }

    /// Status of one tracked pair.
    #[must_use]
    pub fn status(&self, address: &str, chain_id: u64) -> Option<TrackingStatus> {
        let address = parse_address(address).ok()?;
        self.slots.get(&(address, chain_id)).map(|slot| {
            #[allow(clippy::unwrap_used)]
            let state = slot.state.lock().unwrap();
            TrackingStatus {
                is_active: state.is_active,
                last_update_age: state.last_update_at.map(|at| at.elapsed()),
                error_count: state.error_count,
                last_error: state.last_error.clone(),
            }
        })
    }

    /// Currently tracked pair count.
    #[must_use]
    pub fn tracked_pairs(&self) -> usize {
        self.slots.len()
    }

    /// Stop every tracked pair.
    pub fn stop_all(&self) {
        let keys: Vec<(Address, u64)> = self.slots.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, slot)) = self.slots.remove(&key) {
                slot.cancel.cancel();
                slot.handle.abort();
            }
        }
    }

    /// Stop everything. Idempotent.
    pub fn destroy(&self) {
        self.stop_all();
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TICK TASK
// ═══════════════════════════════════════════════════════════════════════════════

#[allow(clippy::too_many_arguments)] // task entry point, not an API
async fn track_pair(
    address: Address,
    chain_id: u64,
    config: EffectiveConfig,
    balances: Arc<BalanceService>,
    transactions: Arc<TransactionService>,
    callbacks: TrackingCallbacks,
    state: Arc<Mutex<PairState>>,
    cancel: CancellationToken,
) {
    let address_str = address.to_string();
    let mut interval = tokio::time::interval(config.polling_interval);
    let mut last_balance: Option<Balance> = None;
    let mut seen = SeenTxSet::default();
    let mut tx_baseline_done = false;

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }

        if config.track_balances {
            tick_balance(
                &address_str,
                chain_id,
                &balances,
                &callbacks,
                &state,
                &mut last_balance,
            )
            .await;
        }

        if config.track_transactions {
            tick_transactions(
                &address_str,
                chain_id,
                &transactions,
                &callbacks,
                &state,
                &mut seen,
                &mut tx_baseline_done,
            )
            .await;
        }

        #[allow(clippy::unwrap_used)]
        {
            state.lock().unwrap().last_update_at = Some(Instant::now());
        }
    }
}

fn record_error(state: &Arc<Mutex<PairState>>, callbacks: &TrackingCallbacks, err: RpcError) {
    #[allow(clippy::unwrap_used)]
    {
        let mut state = state.lock().unwrap();
        state.error_count += 1;
        state.last_error = Some(err.to_string());
    }
    if let Some(on_error) = &callbacks.on_error {
        on_error(err);
    }
}

async fn tick_balance(
    address: &str,
    chain_id: u64,
    balances: &BalanceService,
    callbacks: &TrackingCallbacks,
    state: &Arc<Mutex<PairState>>,
    last_balance: &mut Option<Balance>,
) {
    match balances
        .get_balance(address, chain_id, BalanceOptions { force_fresh: true })
        .await
    {
        Ok(current) => {
            if let Some(previous) = last_balance.take() {
                if previous.amount != current.amount {
                    debug!(
                        address,
                        chain_id,
                        old = %previous.amount,
                        new = %current.amount,
                        "Balance changed"
                    );
                    if let Some(on_balance_change) = &callbacks.on_balance_change {
                        on_balance_change(previous, current.clone());
                    }
                }
            }
            *last_balance = Some(current);
        }
        Err(err) => {
            warn!(address, chain_id, error = %err, "Tracking balance tick failed");
            record_error(state, callbacks, err);
        }
    }
}

async fn tick_transactions(
    address: &str,
    chain_id: u64,
    transactions: &TransactionService,
    callbacks: &TrackingCallbacks,
    state: &Arc<Mutex<PairState>>,
    seen: &mut SeenTxSet,
    baseline_done: &mut bool,
) {
    let page = transactions
        .get_transactions(
            address,
            chain_id,
            TransactionPageRequest {
                page: 1,
                page_size: RECENT_TX_PAGE,
                force_fresh: true,
                ..TransactionPageRequest::default()
            },
        )
        .await;

    let page = match page {
        Ok(page) => page,
        Err(err) => {
            warn!(address, chain_id, error = %err, "Tracking transaction tick failed");
            record_error(state, callbacks, err);
            return;
        }
    };

    if !*baseline_done {
        // First look at this pair: remember what exists, emit nothing.
        for tx in &page.items {
            seen.insert(tx.hash);
        }
        *baseline_done = true;
        return;
    }

    for tx in page.items {
        if seen.contains(&tx.hash) {
            continue;
        }
        seen.insert(tx.hash);
        if let Some(on_new_transaction) = &callbacks.on_new_transaction {
            on_new_transaction(tx);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use alloy::primitives::U256;
    use evm_adapter::MockAdapter;
    use evm_adapter::traits::ChainAdapter;
    use evm_adapter::types::{Asset, TransactionKind, TransactionStatus};

    use super::*;
    use crate::config::Settings;

    const ADDR: &str = "0x1111111111111111111111111111111111111111";

    fn addr() -> Address {
        parse_address(ADDR).unwrap()
    }

    fn balance_of(amount: u64) -> Balance {
        Balance::new(addr(), 1, Asset::native("ETH", "Ether", 18), U256::from(amount))
    }

    fn tx_with_hash(byte: u8) -> Transaction {
        Transaction {
            hash: TxHash::from([byte; 32]),
            chain_id: 1,
            from: addr(),
            to: None,
            value: U256::from(1u64),
            block_number: Some(100),
            timestamp: None,
            status: TransactionStatus::Confirmed,
            kind: TransactionKind::Native,
            fee: None,
            token_address: None,
        }
    }

    struct Fixture {
        adapter: Arc<MockAdapter>,
        service: TrackingService,
    }

    fn fixture() -> Fixture {
        let mut settings = Settings::default();
        settings.retry.max_attempts = 0;
        settings.tracking.polling_interval_ms = 1_000;
        let adapter = Arc::new(MockAdapter::new(1));

        let balances = Arc::new(BalanceService::new(&settings).unwrap());
        balances.register_adapter(1, Arc::clone(&adapter) as Arc<dyn ChainAdapter>);
        let transactions = Arc::new(TransactionService::new(&settings).unwrap());
        transactions.register_adapter(1, Arc::clone(&adapter) as Arc<dyn ChainAdapter>);

        Fixture {
            adapter,
            service: TrackingService::new(settings.tracking, balances, transactions),
        }
    }

    fn tracking_callbacks(
        changes: &Arc<Mutex<Vec<(U256, U256)>>>,
        new_txs: &Arc<Mutex<Vec<TxHash>>>,
        errors: &Arc<Mutex<u64>>,
    ) -> TrackingCallbacks {
        let changes = Arc::clone(changes);
        let new_txs = Arc::clone(new_txs);
        let errors = Arc::clone(errors);
        TrackingCallbacks {
            on_balance_change: Some(Arc::new(move |old, new| {
                changes.lock().unwrap().push((old.amount, new.amount));
            })),
            on_new_transaction: Some(Arc::new(move |tx| {
                new_txs.lock().unwrap().push(tx.hash);
            })),
            on_error: Some(Arc::new(move |_| *errors.lock().unwrap() += 1)),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_is_a_silent_baseline() {
        let fx = fixture();
        fx.adapter.set_balance(balance_of(100));
        fx.adapter.set_transactions(addr(), vec![tx_with_hash(1)]);

        let changes = Arc::new(Mutex::new(Vec::new()));
        let new_txs = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(0));
        fx.service
            .start_tracking(ADDR, &[1], TrackingOverrides::default(), tracking_callbacks(&changes, &new_txs, &errors))
            .unwrap();
        tokio::task::yield_now().await;

        assert!(changes.lock().unwrap().is_empty());
        assert!(new_txs.lock().unwrap().is_empty());
        assert_eq!(fx.service.tracked_pairs(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn balance_change_emits_old_and_new() {
        let fx = fixture();
        fx.adapter.set_balance(balance_of(100));

        let changes = Arc::new(Mutex::new(Vec::new()));
        let new_txs = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(0));
        fx.service
            .start_tracking(ADDR, &[1], TrackingOverrides::default(), tracking_callbacks(&changes, &new_txs, &errors))
            .unwrap();
        tokio::task::yield_now().await;

        // Unchanged balance: nothing fires.
        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert!(changes.lock().unwrap().is_empty());

        fx.adapter.set_balance(balance_of(250));
        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;

        assert_eq!(
            *changes.lock().unwrap(),
            vec![(U256::from(100u64), U256::from(250u64))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn new_transactions_emit_after_the_baseline() {
        let fx = fixture();
        fx.adapter.set_transactions(addr(), vec![tx_with_hash(1)]);

        let changes = Arc::new(Mutex::new(Vec::new()));
        let new_txs = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(0));
        fx.service
            .start_tracking(ADDR, &[1], TrackingOverrides::default(), tracking_callbacks(&changes, &new_txs, &errors))
            .unwrap();
        tokio::task::yield_now().await;

        // A new hash appears; only it is emitted.
        fx.adapter
            .set_transactions(addr(), vec![tx_with_hash(2), tx_with_hash(1)]);
        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;

        assert_eq!(*new_txs.lock().unwrap(), vec![TxHash::from([2; 32])]);

        // The same history again emits nothing further.
        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert_eq!(new_txs.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_are_counted_and_do_not_stop_the_loop() {
        let fx = fixture();
        fx.adapter.set_balance(balance_of(10));
        // Two data calls per tick (balance + transactions): fail one tick.
        fx.adapter.fail_next_calls(2, RpcError::timeout("rpc down"));

        let changes = Arc::new(Mutex::new(Vec::new()));
        let new_txs = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(0));
        fx.service
            .start_tracking(ADDR, &[1], TrackingOverrides::default(), tracking_callbacks(&changes, &new_txs, &errors))
            .unwrap();
        tokio::task::yield_now().await;

        assert_eq!(*errors.lock().unwrap(), 2);
        let status = fx.service.status(ADDR, 1).unwrap();
        assert_eq!(status.error_count, 2);
        assert!(status.is_active);
        assert!(status.last_error.is_some());

        // The loop recovers: the next successful tick is a fresh baseline,
        // so nothing fires and no further errors accumulate.
        fx.adapter.set_balance(balance_of(20));
        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert!(changes.lock().unwrap().is_empty());
        assert_eq!(*errors.lock().unwrap(), 2);
        assert!(fx.service.status(ADDR, 1).unwrap().last_update_age.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_tracking_specific_chain_keeps_others() {
        let fx = fixture();
        let adapter137 = Arc::new(MockAdapter::new(137));
        // Reuse the same services; register the second chain.
        fx.service
            .balances
            .register_adapter(137, Arc::clone(&adapter137) as Arc<dyn ChainAdapter>);
        fx.service
            .transactions
            .register_adapter(137, Arc::clone(&adapter137) as Arc<dyn ChainAdapter>);

        fx.service
            .start_tracking(ADDR, &[1, 137], TrackingOverrides::default(), TrackingCallbacks::default())
            .unwrap();
        assert_eq!(fx.service.tracked_pairs(), 2);

        fx.service.stop_tracking(ADDR, Some(1));
        assert_eq!(fx.service.tracked_pairs(), 1);
        assert!(fx.service.status(ADDR, 1).is_none());
        assert!(fx.service.status(ADDR, 137).is_some());

        fx.service.stop_tracking(ADDR, None);
        assert_eq!(fx.service.tracked_pairs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn update_tracking_config_restarts_the_pair() {
        let fx = fixture();
        fx.service
            .start_tracking(ADDR, &[1], TrackingOverrides::default(), TrackingCallbacks::default())
            .unwrap();

        fx.service
            .update_tracking_config(
                ADDR,
                1,
                TrackingOverrides {
                    track_transactions: Some(false),
                    ..TrackingOverrides::default()
                },
            )
            .unwrap();
        assert_eq!(fx.service.tracked_pairs(), 1);

        // Updating an untracked pair is an error.
        assert!(
            fx.service
                .update_tracking_config(
                    "0x2222222222222222222222222222222222222222",
                    1,
                    TrackingOverrides::default()
                )
                .is_err()
        );
    }

    #[test]
    fn seen_set_caps_and_evicts_oldest() {
        let mut seen = SeenTxSet::default();
        for i in 0..=SEEN_TX_CAP {
            let mut bytes = [0u8; 32];
            bytes[..8].copy_from_slice(&(i as u64).to_be_bytes());
            assert!(seen.insert(TxHash::from(bytes)));
        }
        assert_eq!(seen.order.len(), SEEN_TX_CAP);

        // The very first hash aged out.
        let mut first = [0u8; 32];
        first[..8].copy_from_slice(&0u64.to_be_bytes());
        assert!(!seen.contains(&TxHash::from(first)));

        // Re-inserting an existing hash is not "new".
        let mut last = [0u8; 32];
        last[..8].copy_from_slice(&(SEEN_TX_CAP as u64).to_be_bytes());
        assert!(!seen.insert(TxHash::from(last)));
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_stops_everything() {
        let fx = fixture();
        fx.service
            .start_tracking(ADDR, &[1], TrackingOverrides::default(), TrackingCallbacks::default())
            .unwrap();
        fx.service.destroy();
        fx.service.destroy();
        assert_eq!(fx.service.tracked_pairs(), 0);
    }
}
