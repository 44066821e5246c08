//! Scriptable mock adapter for tests and downstream development.
//!
//! Everything is staged by the test: balances, token holdings, transaction
//! history, and discovery results. Failure injection fails the next N calls
//! with a scripted error, and push helpers drive subscription callbacks so
//! subscription plumbing can be exercised without a chain.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use alloy::primitives::Address;
use async_trait::async_trait;
use dashmap::DashMap;
use rpc_guard::{Result, RpcError};

use crate::traits::{BalanceCallback, ChainAdapter, TransactionCallback, Unsubscribe};
use crate::types::{
    Asset, Balance, ChainInfo, TokenDiscovery, Transaction, TransactionQuery,
};

// ═══════════════════════════════════════════════════════════════════════════════
// MOCK ADAPTER
// ═══════════════════════════════════════════════════════════════════════════════

type SubscriberMap<C> = Arc<Mutex<HashMap<u64, (Address, C)>>>;

/// In-memory [`ChainAdapter`] with scripted data and failure injection.
pub struct MockAdapter {
    info: ChainInfo,
    balances: Mutex<HashMap<Address, Balance>>,
    token_balances: Mutex<HashMap<Address, Vec<Balance>>>,
    transactions: Mutex<HashMap<Address, Vec<Transaction>>>,
    discoveries: Mutex<HashMap<Address, TokenDiscovery>>,
    healthy: AtomicBool,
    connected: AtomicBool,
    fail_next: AtomicU32,
    failure: Mutex<Option<RpcError>>,
    calls: DashMap<&'static str, u64>,
    balance_subs: SubscriberMap<BalanceCallback>,
    tx_subs: SubscriberMap<TransactionCallback>,
    next_sub_id: AtomicU64,
}

impl std::fmt::Debug for MockAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockAdapter")
            .field("chain_id", &self.info.id)
            .field("healthy", &self.healthy.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl MockAdapter {
    /// A healthy mock for the given chain.
    #[must_use]
    pub fn new(chain_id: u64) -> Self {
        Self {
            info: ChainInfo {
                id: chain_id,
                name: format!("mock-{chain_id}"),
                symbol: "ETH".into(),
                decimals: 18,
                explorer_url: "https://explorer.example.com".into(),
            },
            balances: Mutex::new(HashMap::new()),
            token_balances: Mutex::new(HashMap::new()),
            transactions: Mutex::new(HashMap::new()),
            discoveries: Mutex::new(HashMap::new()),
            healthy: AtomicBool::new(true),
            connected: AtomicBool::new(false),
            fail_next: AtomicU32::new(0),
            failure: Mutex::new(None),
            calls: DashMap::new(),
            balance_subs: Arc::new(Mutex::new(HashMap::new())),
            tx_subs: Arc::new(Mutex::new(HashMap::new())),
            next_sub_id: AtomicU64::new(0),
        }
    }

    // ───────────────────────────────────────────────────────────────────────────
    // SCRIPTING
    // ───────────────────────────────────────────────────────────────────────────

    /// Stage a native balance.
    pub fn set_balance(&self, balance: Balance) {
        #[allow(clippy::unwrap_used)]
        self.balances.lock().unwrap().insert(balance.address, balance);
    }

    /// Stage token balances for an address.
    pub fn set_token_balances(&self, address: Address, balances: Vec<Balance>) {
        #[allow(clippy::unwrap_used)]
        self.token_balances.lock().unwrap().insert(address, balances);
    }

    /// Stage transaction history for an address (newest first).
    pub fn set_transactions(&self, address: Address, transactions: Vec<Transaction>) {
        #[allow(clippy::unwrap_used)]
        self.transactions.lock().unwrap().insert(address, transactions);
    }

    /// Stage a discovery result for an address.
    pub fn set_discovery(&self, discovery: TokenDiscovery) {
        #[allow(clippy::unwrap_used)]
        self.discoveries.lock().unwrap().insert(discovery.address, discovery);
    }

    /// Flip the health probe.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Fail the next `n` data calls with `error`.
    pub fn fail_next_calls(&self, n: u32, error: RpcError) {
        self.fail_next.store(n, Ordering::SeqCst);
        #[allow(clippy::unwrap_used)]
        {
            *self.failure.lock().unwrap() = Some(error);
        }
    }

    /// How many times `method` was called.
    #[must_use]
    pub fn call_count(&self, method: &str) -> u64 {
        self.calls.get(method).map_or(0, |c| *c)
    }

    /// Push a balance to matching balance subscribers.
    pub fn push_balance(&self, balance: Balance) {
        #[allow(clippy::unwrap_used)]
        let subs = self.balance_subs.lock().unwrap();
        for (address, callback) in subs.values() {
            if *address == balance.address {
                callback(balance.clone());
            }
        }
    }

    /// Push a transaction to matching transaction subscribers.
    pub fn push_transaction(&self, tx: &Transaction) {
        #[allow(clippy::unwrap_used)]
        let subs = self.tx_subs.lock().unwrap();
        for (address, callback) in subs.values() {
            if *address == tx.from || Some(*address) == tx.to {
                callback(tx.clone());
            }
        }
    }

    /// Currently registered balance subscriptions.
    #[must_use]
    #[allow(clippy::unwrap_used)] // mutex poisoning is unrecoverable here
    pub fn balance_subscriber_count(&self) -> usize {
        self.balance_subs.lock().unwrap().len()
    }

    fn record(&self, method: &'static str) {
        *self.calls.entry(method).or_insert(0) += 1;
    }

    fn take_failure(&self) -> Option<RpcError> {
        if self.fail_next.load(Ordering::SeqCst) == 0 {
            return None;
        }
        self.fail_next.fetch_sub(1, Ordering::SeqCst);
        #[allow(clippy::unwrap_used)]
        let failure = self.failure.lock().unwrap();
        Some(
            failure
                .clone()
                .unwrap_or_else(|| RpcError::timeout("mock failure")),
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CHAIN ADAPTER IMPLEMENTATION
// ═══════════════════════════════════════════════════════════════════════════════

#[async_trait]
impl ChainAdapter for MockAdapter {
    async fn connect(&self) -> Result<()> {
        self.record("connect");
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.record("disconnect");
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        self.record("is_healthy");
        self.healthy.load(Ordering::SeqCst)
    }

    async fn get_balance(&self, address: Address) -> Result<Balance> {
        self.record("get_balance");
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        #[allow(clippy::unwrap_used)]
        let staged = self.balances.lock().unwrap().get(&address).cloned();
        Ok(staged.unwrap_or_else(|| {
            Balance::new(
                address,
                self.info.id,
                Asset::native(self.info.symbol.clone(), self.info.name.clone(), self.info.decimals),
                alloy::primitives::U256::ZERO,
            )
        }))
    }

    async fn get_token_balances(
        &self,
        address: Address,
        tokens: Option<&[Address]>,
    ) -> Result<Vec<Balance>> {
        self.record("get_token_balances");
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        #[allow(clippy::unwrap_used)]
        let staged = self
            .token_balances
            .lock()
            .unwrap()
            .get(&address)
            .cloned()
            .unwrap_or_default();
        Ok(match tokens {
            Some(tokens) => staged
                .into_iter()
                .filter(|b| b.asset.address.is_some_and(|a| tokens.contains(&a)))
                .collect(),
            None => staged,
        })
    }

    async fn get_transactions(
        &self,
        address: Address,
        query: Option<&TransactionQuery>,
    ) -> Result<Vec<Transaction>> {
        self.record("get_transactions");
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        #[allow(clippy::unwrap_used)]
        let mut staged = self
            .transactions
            .lock()
            .unwrap()
            .get(&address)
            .cloned()
            .unwrap_or_default();
        if let Some(query) = query {
            staged.retain(|tx| query.matches(tx));
            if let Some(limit) = query.limit {
                staged.truncate(limit);
            }
        }
        Ok(staged)
    }

    async fn subscribe_to_balance(
        &self,
        address: Address,
        callback: BalanceCallback,
    ) -> Result<Unsubscribe> {
        self.record("subscribe_to_balance");
        let id = self.next_sub_id.fetch_add(1, Ordering::SeqCst);
        #[allow(clippy::unwrap_used)]
        self.balance_subs.lock().unwrap().insert(id, (address, callback));

        let subs = Arc::clone(&self.balance_subs);
        Ok(Box::new(move || {
            #[allow(clippy::unwrap_used)]
            subs.lock().unwrap().remove(&id);
        }))
    }

    async fn subscribe_to_transactions(
        &self,
        address: Address,
        callback: TransactionCallback,
    ) -> Result<Unsubscribe> {
        self.record("subscribe_to_transactions");
        let id = self.next_sub_id.fetch_add(1, Ordering::SeqCst);
        #[allow(clippy::unwrap_used)]
        self.tx_subs.lock().unwrap().insert(id, (address, callback));

        let subs = Arc::clone(&self.tx_subs);
        Ok(Box::new(move || {
            #[allow(clippy::unwrap_used)]
            subs.lock().unwrap().remove(&id);
        }))
    }

    async fn discover_tokens(&self, address: Address) -> Result<TokenDiscovery> {
        self.record("discover_tokens");
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        #[allow(clippy::unwrap_used)]
        let staged = self.discoveries.lock().unwrap().get(&address).cloned();
        Ok(staged.unwrap_or(TokenDiscovery {
            address,
            chain_id: self.info.id,
            tokens: Vec::new(),
            errors: Vec::new(),
        }))
    }

    fn chain_info(&self) -> ChainInfo {
        self.info.clone()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
