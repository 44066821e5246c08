//! Chain boundary for the walletwatch integration stack.
//!
//! One [`ChainAdapter`] per chain wraps that chain's RPC client and exposes
//! a uniform, typed surface: balances, token holdings, transactions, token
//! discovery, and push subscriptions. Adapters are deliberately thin - the
//! resilience stack (`rpc-guard`) and the service layer above own caching,
//! retries, breakers, and transport fallback.
//!
//! # Architecture
//!
//! This crate follows the ports-and-adapters split:
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │        walletwatch services & live drivers      │
//! └─────────────────────────────────────────────────┘
//!                        │ uses
//!                        ▼
//! ┌─────────────────────────────────────────────────┐
//! │           ChainAdapter trait (Port)             │
//! │  - get_balance() / get_token_balances()         │
//! │  - get_transactions()                           │
//! │  - subscribe_to_balance() / _to_transactions()  │
//! │  - discover_tokens()                            │
//! └─────────────────────────────────────────────────┘
//!                        │
//!          ┌─────────────┴─────────────┐
//!          ▼                           ▼
//! ┌─────────────────┐       ┌─────────────────────┐
//! │ Per-chain       │       │ MockAdapter         │
//! │ adapters        │       │ (tests, downstream  │
//! │ (application-   │       │  development)       │
//! │  provided)      │       │                     │
//! └─────────────────┘       └─────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`traits`] - The [`ChainAdapter`] contract and callback types
//! - [`types`] - Balances, transactions, assets, blocks, transfers
//! - [`spam`] - Spam-token filtering applied at this boundary
//! - [`mock`] - Scriptable [`MockAdapter`]

// ═══════════════════════════════════════════════════════════════════════════════
// MODULES
// ═══════════════════════════════════════════════════════════════════════════════

pub mod mock;
pub mod spam;
pub mod traits;
pub mod types;

// ═══════════════════════════════════════════════════════════════════════════════
// RE-EXPORTS
// ═══════════════════════════════════════════════════════════════════════════════

// Primary types - what most users need
pub use mock::MockAdapter;
pub use spam::SpamFilter;
pub use traits::{BalanceCallback, ChainAdapter, TransactionCallback, Unsubscribe};
pub use types::{
    Asset, Balance, BlockInfo, ChainInfo, TokenDiscovery, Transaction, TransactionKind,
    TransactionQuery, TransactionStatus, TransferEvent, parse_address,
};

// ═══════════════════════════════════════════════════════════════════════════════
// PRELUDE
// ═══════════════════════════════════════════════════════════════════════════════

/// Convenience re-exports for common use.
///
/// # Usage
///
/// ```ignore
/// use evm_adapter::prelude::*;
/// ```
pub mod prelude {
    pub use crate::traits::{ChainAdapter, Unsubscribe};
    pub use crate::types::{
        Asset, Balance, BlockInfo, ChainInfo, Transaction, TransactionQuery, TransferEvent,
        parse_address,
    };
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exports_are_available() {
        let _filter = SpamFilter::new();
        let _mock = MockAdapter::new(1);
        assert!(parse_address("0x0000000000000000000000000000000000000000").is_ok());
    }
}
