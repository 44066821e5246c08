//! The live-data client contract and its scriptable mock.
//!
//! A [`LiveClient`] is what the connection manager hands to drivers: block
//! watching, balance reads, and log streams over whichever transport the
//! manager decided on. Like the chain adapter, implementations are thin
//! translations over an RPC client; all resilience lives above.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use alloy::primitives::{Address, B256, Bytes, TxHash, U256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evm_adapter::types::BlockInfo;
use futures::stream::BoxStream;
use rpc_guard::{Result, RpcError};
use tokio::sync::mpsc;

// ═══════════════════════════════════════════════════════════════════════════════
// LOG SHAPES
// ═══════════════════════════════════════════════════════════════════════════════

/// A raw log as the drivers consume it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Emitting contract.
    pub address: Address,
    /// Indexed topics; `topics[0]` is the event signature.
    pub topics: Vec<B256>,
    /// Unindexed data.
    pub data: Bytes,
    /// Containing block, when known.
    pub block_number: Option<u64>,
    /// Transaction hash, when known.
    pub tx_hash: Option<TxHash>,
    /// Log index within the block, when known.
    pub log_index: Option<u64>,
}

/// Filter for log queries and subscriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    /// Match only this event signature.
    pub topic0: Option<B256>,
    /// Match only these contracts; empty means any.
    pub addresses: Vec<Address>,
    /// Earliest block (inclusive).
    pub from_block: Option<u64>,
    /// Latest block (inclusive).
    pub to_block: Option<u64>,
}

impl LogFilter {
    /// Whether a record passes this filter.
    #[must_use]
    pub fn matches(&self, record: &LogRecord) -> bool {
        if let Some(topic0) = self.topic0 {
            if record.topics.first() != Some(&topic0) {
                return false;
            }
        }
        if !self.addresses.is_empty() && !self.addresses.contains(&record.address) {
            return false;
        }
        if let Some(from) = self.from_block {
            if record.block_number.is_none_or(|n| n < from) {
                return false;
            }
        }
        if let Some(to) = self.to_block {
            if record.block_number.is_none_or(|n| n > to) {
                return false;
            }
        }
        true
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LIVE CLIENT TRAIT
// ═══════════════════════════════════════════════════════════════════════════════

/// Live-data operations the drivers need from a transport.
#[async_trait]
pub trait LiveClient: Send + Sync + 'static {
    /// Establish (or re-establish) the underlying connection.
    async fn connect(&self) -> Result<()>;

    /// Cheap liveness probe used by the heartbeat.
    async fn ping(&self) -> Result<()>;

    /// Current chain head number.
    async fn block_number(&self) -> Result<u64>;

    /// Details of one block.
    async fn block(&self, number: u64) -> Result<BlockInfo>;

    /// Native balance of an address at the current head.
    async fn native_balance(&self, address: Address) -> Result<U256>;

    /// Stream of new head numbers.
    async fn watch_block_numbers(&self) -> Result<BoxStream<'static, Result<u64>>>;

    /// Stream of logs matching a filter.
    async fn watch_logs(&self, filter: &LogFilter) -> Result<BoxStream<'static, Result<LogRecord>>>;

    /// One-shot log query (used by the polling path for block ranges).
    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<LogRecord>>;

    /// Stream of pending transaction hashes.
    async fn watch_pending_transactions(&self) -> Result<BoxStream<'static, Result<TxHash>>>;
}

// Allow Arc<T> to be used as LiveClient
#[async_trait]
impl<T: LiveClient + ?Sized> LiveClient for Arc<T> {
    async fn connect(&self) -> Result<()> {
        (**self).connect().await
    }

    async fn ping(&self) -> Result<()> {
        (**self).ping().await
    }

    async fn block_number(&self) -> Result<u64> {
        (**self).block_number().await
    }

    async fn block(&self, number: u64) -> Result<BlockInfo> {
        (**self).block(number).await
    }

    async fn native_balance(&self, address: Address) -> Result<U256> {
        (**self).native_balance(address).await
    }

    async fn watch_block_numbers(&self) -> Result<BoxStream<'static, Result<u64>>> {
        (**self).watch_block_numbers().await
    }

    async fn watch_logs(&self, filter: &LogFilter) -> Result<BoxStream<'static, Result<LogRecord>>> {
        (**self).watch_logs(filter).await
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<LogRecord>> {
        (**self).get_logs(filter).await
    }

    async fn watch_pending_transactions(&self) -> Result<BoxStream<'static, Result<TxHash>>> {
        (**self).watch_pending_transactions().await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MOCK LIVE CLIENT
// ═══════════════════════════════════════════════════════════════════════════════

type LogWatcher = (LogFilter, mpsc::UnboundedSender<Result<LogRecord>>);

/// Scriptable [`LiveClient`] for driver and service tests.
///
/// Blocks, balances, and logs are staged by the test; `push_*` helpers feed
/// the subscription streams.
pub struct MockLiveClient {
    connect_fails: AtomicBool,
    ping_fails: AtomicBool,
    connect_attempts: AtomicU64,
    head: AtomicU64,
    head_fails: AtomicBool,
    balances: Mutex<HashMap<Address, U256>>,
    failing_balances: Mutex<Vec<Address>>,
    staged_logs: Mutex<Vec<LogRecord>>,
    block_watchers: Mutex<Vec<mpsc::UnboundedSender<Result<u64>>>>,
    log_watchers: Mutex<Vec<LogWatcher>>,
    pending_watchers: Mutex<Vec<mpsc::UnboundedSender<Result<TxHash>>>>,
}

impl std::fmt::Debug for MockLiveClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockLiveClient")
            .field("head", &self.head.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for MockLiveClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLiveClient {
    /// A connectable client at block 0.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connect_fails: AtomicBool::new(false),
            ping_fails: AtomicBool::new(false),
            connect_attempts: AtomicU64::new(0),
            head: AtomicU64::new(0),
            head_fails: AtomicBool::new(false),
            balances: Mutex::new(HashMap::new()),
            failing_balances: Mutex::new(Vec::new()),
            staged_logs: Mutex::new(Vec::new()),
            block_watchers: Mutex::new(Vec::new()),
            log_watchers: Mutex::new(Vec::new()),
            pending_watchers: Mutex::new(Vec::new()),
        }
    }

    /// Deterministic block details for a number.
    #[must_use]
    pub fn synth_block(number: u64) -> BlockInfo {
        let mut hash = [0u8; 32];
        hash[24..].copy_from_slice(&number.to_be_bytes());
        let mut parent = [0u8; 32];
        parent[24..].copy_from_slice(&number.saturating_sub(1).to_be_bytes());
        BlockInfo {
            number,
            hash: B256::from(hash),
            parent_hash: B256::from(parent),
            timestamp: DateTime::<Utc>::from_timestamp(
                1_700_000_000 + i64::try_from(number).unwrap_or(0) * 12,
                0,
            )
            .unwrap_or_else(Utc::now),
            gas_used: 12_000_000,
            gas_limit: 30_000_000,
            transaction_count: 100,
        }
    }

    // ───────────────────────────────────────────────────────────────────────────
    // SCRIPTING
    // ───────────────────────────────────────────────────────────────────────────

    /// Make `connect` fail (WS unavailable) or succeed.
    pub fn set_connect_fails(&self, fails: bool) {
        self.connect_fails.store(fails, Ordering::SeqCst);
    }

    /// Make the heartbeat probe fail.
    pub fn set_ping_fails(&self, fails: bool) {
        self.ping_fails.store(fails, Ordering::SeqCst);
    }

    /// Make `block_number` fail.
    pub fn set_head_fails(&self, fails: bool) {
        self.head_fails.store(fails, Ordering::SeqCst);
    }

    /// How many times `connect` was attempted.
    #[must_use]
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Set the head without notifying watchers (for poll tests).
    pub fn set_head(&self, number: u64) {
        self.head.store(number, Ordering::SeqCst);
    }

    /// Stage a native balance.
    pub fn set_balance(&self, address: Address, amount: U256) {
        #[allow(clippy::unwrap_used)]
        self.balances.lock().unwrap().insert(address, amount);
    }

    /// Make balance reads for one address fail (isolation tests).
    pub fn fail_balance_for(&self, address: Address) {
        #[allow(clippy::unwrap_used)]
        self.failing_balances.lock().unwrap().push(address);
    }

    /// Stage a log for `get_logs` range queries.
    pub fn stage_log(&self, record: LogRecord) {
        #[allow(clippy::unwrap_used)]
        self.staged_logs.lock().unwrap().push(record);
    }

    /// Advance the head and notify block watchers.
    pub fn push_block(&self, number: u64) {
        self.head.store(number, Ordering::SeqCst);
        #[allow(clippy::unwrap_used)]
        let mut watchers = self.block_watchers.lock().unwrap();
        watchers.retain(|tx| tx.send(Ok(number)).is_ok());
    }

    /// Push an error into every block watcher stream.
    pub fn push_block_error(&self, error: RpcError) {
        #[allow(clippy::unwrap_used)]
        let mut watchers = self.block_watchers.lock().unwrap();
        watchers.retain(|tx| tx.send(Err(error.clone())).is_ok());
    }

    /// End every block watcher stream (simulated disconnect).
    pub fn close_block_streams(&self) {
        #[allow(clippy::unwrap_used)]
        self.block_watchers.lock().unwrap().clear();
    }

    /// Push a log to matching log watchers.
    pub fn push_log(&self, record: &LogRecord) {
        #[allow(clippy::unwrap_used)]
        let mut watchers = self.log_watchers.lock().unwrap();
        watchers.retain(|(filter, tx)| {
            if filter.matches(record) {
                tx.send(Ok(record.clone())).is_ok()
            } else {
                !tx.is_closed()
            }
        });
    }

    /// Push a pending transaction hash to watchers.
    pub fn push_pending(&self, hash: TxHash) {
        #[allow(clippy::unwrap_used)]
        let mut watchers = self.pending_watchers.lock().unwrap();
        watchers.retain(|tx| tx.send(Ok(hash)).is_ok());
    }

    /// Currently live block watcher streams.
    #[must_use]
    pub fn block_watcher_count(&self) -> usize {
        #[allow(clippy::unwrap_used)]
        let mut watchers = self.block_watchers.lock().unwrap();
        watchers.retain(|tx| !tx.is_closed());
        watchers.len()
    }

    /// Currently live log watcher streams.
    #[must_use]
    pub fn log_watcher_count(&self) -> usize {
        #[allow(clippy::unwrap_used)]
        let mut watchers = self.log_watchers.lock().unwrap();
        watchers.retain(|(_, tx)| !tx.is_closed());
        watchers.len()
    }

    fn stream_from<T: Send + 'static>(
        rx: mpsc::UnboundedReceiver<Result<T>>,
    ) -> BoxStream<'static, Result<T>> {
        Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        }))
    }
}

#[async_trait]
impl LiveClient for MockLiveClient {
    async fn connect(&self) -> Result<()> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if self.connect_fails.load(Ordering::SeqCst) {
            Err(RpcError::connection(
                rpc_guard::ConnectionKind::Refused,
                "mock websocket refused",
            ))
        } else {
            Ok(())
        }
    }

    async fn ping(&self) -> Result<()> {
        if self.ping_fails.load(Ordering::SeqCst) {
            Err(RpcError::timeout("mock pong missing"))
        } else {
            Ok(())
        }
    }

    async fn block_number(&self) -> Result<u64> {
        if self.head_fails.load(Ordering::SeqCst) {
            return Err(RpcError::timeout("mock head unavailable"));
        }
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn block(&self, number: u64) -> Result<BlockInfo> {
        Ok(Self::synth_block(number))
    }

    async fn native_balance(&self, address: Address) -> Result<U256> {
        #[allow(clippy::unwrap_used)]
        if self.failing_balances.lock().unwrap().contains(&address) {
            return Err(RpcError::timeout(format!("balance read failed for {address}")));
        }
        #[allow(clippy::unwrap_used)]
        let staged = self.balances.lock().unwrap().get(&address).copied();
        Ok(staged.unwrap_or(U256::ZERO))
    }

    async fn watch_block_numbers(&self) -> Result<BoxStream<'static, Result<u64>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        #[allow(clippy::unwrap_used)]
        self.block_watchers.lock().unwrap().push(tx);
        Ok(Self::stream_from(rx))
    }

    async fn watch_logs(&self, filter: &LogFilter) -> Result<BoxStream<'static, Result<LogRecord>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        #[allow(clippy::unwrap_used)]
        self.log_watchers.lock().unwrap().push((filter.clone(), tx));
        Ok(Self::stream_from(rx))
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<LogRecord>> {
        #[allow(clippy::unwrap_used)]
        let staged = self.staged_logs.lock().unwrap();
        Ok(staged.iter().filter(|r| filter.matches(r)).cloned().collect())
    }

    async fn watch_pending_transactions(&self) -> Result<BoxStream<'static, Result<TxHash>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        #[allow(clippy::unwrap_used)]
        self.pending_watchers.lock().unwrap().push(tx);
        Ok(Self::stream_from(rx))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
