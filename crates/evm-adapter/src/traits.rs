//! The chain adapter contract.
//!
//! One [`ChainAdapter`] per chain wraps whatever RPC client that chain
//! needs and exposes a uniform, typed surface. Everything above this trait
//! (caching, retries, breakers, subscriptions) is chain-agnostic.
//!
//! # Design Philosophy
//!
//! - **Thin**: adapters translate and filter; they do not retry, cache, or
//!   open circuits - the resilience stack above does
//! - **Lift errors once**: adapters map their client's failures into the
//!   shared taxonomy at this boundary, exactly once
//! - **Testable**: [`MockAdapter`](crate::mock::MockAdapter) implements this
//!   trait for downstream tests

use std::sync::Arc;

use alloy::primitives::Address;
use async_trait::async_trait;
use rpc_guard::Result;

use crate::types::{Balance, ChainInfo, TokenDiscovery, Transaction, TransactionQuery};

// ═══════════════════════════════════════════════════════════════════════════════
// CALLBACK TYPES
// ═══════════════════════════════════════════════════════════════════════════════

/// Tears down one adapter-level subscription when invoked.
pub type Unsubscribe = Box<dyn FnOnce() + Send>;

/// Balance push callback.
pub type BalanceCallback = Arc<dyn Fn(Balance) + Send + Sync>;

/// Transaction push callback.
pub type TransactionCallback = Arc<dyn Fn(Transaction) + Send + Sync>;

// ═══════════════════════════════════════════════════════════════════════════════
// CHAIN ADAPTER TRAIT
// ═══════════════════════════════════════════════════════════════════════════════

/// Uniform interface over one chain's RPC client.
///
/// Implementations are responsible for spam-token filtering on discovery
/// results (see [`SpamFilter`](crate::spam::SpamFilter)) and for lifting
/// client errors into [`rpc_guard::RpcError`].
#[async_trait]
pub trait ChainAdapter: Send + Sync + 'static {
    /// Establish whatever connection the underlying client needs.
    async fn connect(&self) -> Result<()>;

    /// Tear the connection down. Idempotent.
    async fn disconnect(&self) -> Result<()>;

    /// Cheap liveness probe.
    async fn is_healthy(&self) -> bool;

    /// Native balance of an address.
    async fn get_balance(&self, address: Address) -> Result<Balance>;

    /// Token balances of an address.
    ///
    /// With `tokens` given, only those contracts are queried; otherwise the
    /// adapter returns balances for every token it knows the address holds.
    async fn get_token_balances(
        &self,
        address: Address,
        tokens: Option<&[Address]>,
    ) -> Result<Vec<Balance>>;

    /// Transactions involving an address, newest first.
    async fn get_transactions(
        &self,
        address: Address,
        query: Option<&TransactionQuery>,
    ) -> Result<Vec<Transaction>>;

    /// Push balance updates for an address.
    async fn subscribe_to_balance(
        &self,
        address: Address,
        callback: BalanceCallback,
    ) -> Result<Unsubscribe>;

    /// Push new transactions involving an address.
    async fn subscribe_to_transactions(
        &self,
        address: Address,
        callback: TransactionCallback,
    ) -> Result<Unsubscribe>;

    /// Scan an address for held tokens.
    ///
    /// The returned set is already spam-filtered; partial source failures
    /// land in [`TokenDiscovery::errors`] rather than failing the scan.
    async fn discover_tokens(&self, address: Address) -> Result<TokenDiscovery>;

    /// Static chain description.
    fn chain_info(&self) -> ChainInfo;
}

// ═══════════════════════════════════════════════════════════════════════════════
// BLANKET IMPLEMENTATIONS
// ═══════════════════════════════════════════════════════════════════════════════

// Allow Arc<T> to be used as ChainAdapter
#[async_trait]
impl<T: ChainAdapter + ?Sized> ChainAdapter for Arc<T> {
    async fn connect(&self) -> Result<()> {
        (**self).connect().await
    }

    async fn disconnect(&self) -> Result<()> {
        (**self).disconnect().await
    }

    async fn is_healthy(&self) -> bool {
        (**self).is_healthy().await
    }

    async fn get_balance(&self, address: Address) -> Result<Balance> {
        (**self).get_balance(address).await
    }

    async fn get_token_balances(
        &self,
        address: Address,
        tokens: Option<&[Address]>,
    ) -> Result<Vec<Balance>> {
        (**self).get_token_balances(address, tokens).await
    }

    async fn get_transactions(
        &self,
        address: Address,
        query: Option<&TransactionQuery>,
    ) -> Result<Vec<Transaction>> {
        (**self).get_transactions(address, query).await
    }

    async fn subscribe_to_balance(
        &self,
        address: Address,
        callback: BalanceCallback,
    ) -> Result<Unsubscribe> {
        (**self).subscribe_to_balance(address, callback).await
    }

    async fn subscribe_to_transactions(
        &self,
        address: Address,
        callback: TransactionCallback,
    ) -> Result<Unsubscribe> {
        (**self).subscribe_to_transactions(address, callback).await
    }

    async fn discover_tokens(&self, address: Address) -> Result<TokenDiscovery> {
        (**self).discover_tokens(address).await
    }

    fn chain_info(&self) -> ChainInfo {
        (**self).chain_info()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
