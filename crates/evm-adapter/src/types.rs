//! Shared on-chain data model.
//!
//! These are the records adapters produce and services pass around:
//! balances, transactions, assets, blocks, and transfer events. They carry
//! no behavior beyond constructors and filtering helpers - all protocol
//! logic stays in the adapters.

use std::str::FromStr;

use alloy::primitives::{Address, B256, TxHash, U256};
use chrono::{DateTime, Utc};
use rpc_guard::{Result, RpcError};
use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════════════════════════════════════════
// VALIDATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Parse and validate an EVM address.
///
/// # Errors
///
/// Fails with a validation error (never retried) for anything that is not a
/// `0x`-prefixed 40-hex-digit address.
pub fn parse_address(input: &str) -> Result<Address> {
    Address::from_str(input)
        .map_err(|_| RpcError::validation("address", "0x-prefixed 40-hex-digit address", input))
}

// ═══════════════════════════════════════════════════════════════════════════════
// ASSETS & BALANCES
// ═══════════════════════════════════════════════════════════════════════════════

/// A native or token asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    /// Ticker symbol, e.g. `ETH`.
    pub symbol: String,
    /// Human-readable name.
    pub name: String,
    /// Token contract address; `None` for the chain's native asset.
    pub address: Option<Address>,
    /// Decimal places.
    pub decimals: u8,
}

impl Asset {
    /// The native asset of a chain.
    #[must_use]
    pub fn native(symbol: impl Into<String>, name: impl Into<String>, decimals: u8) -> Self {
        Self {
            symbol: symbol.into(),
            name: name.into(),
            address: None,
            decimals,
        }
    }

    /// An ERC-20 style token asset.
    #[must_use]
    pub fn token(
        address: Address,
        symbol: impl Into<String>,
        name: impl Into<String>,
        decimals: u8,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            name: name.into(),
            address: Some(address),
            decimals,
        }
    }
}

/// An account's holding of one asset at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    /// The holding address.
    pub address: Address,
    /// Chain the balance lives on.
    pub chain_id: u64,
    /// What is held.
    pub asset: Asset,
    /// Raw amount in the asset's smallest unit.
    pub amount: U256,
    /// Block the balance was read at, when known.
    pub block_number: Option<u64>,
    /// When the balance was fetched.
    pub fetched_at: DateTime<Utc>,
}

impl Balance {
    /// A fresh balance fetched now.
    #[must_use]
    pub fn new(address: Address, chain_id: u64, asset: Asset, amount: U256) -> Self {
        Self {
            address,
            chain_id,
            asset,
            amount,
            block_number: None,
            fetched_at: Utc::now(),
        }
    }

    /// Attach the block height the balance was read at.
    #[must_use]
    pub const fn at_block(mut self, block_number: u64) -> Self {
        self.block_number = Some(block_number);
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRANSACTIONS
// ═══════════════════════════════════════════════════════════════════════════════

/// Where a transaction stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    /// Seen but not yet included in a block.
    Pending,
    /// Included and successful.
    Confirmed,
    /// Included but reverted.
    Failed,
}

/// What kind of value movement a transaction represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    /// Native asset transfer.
    Native,
    /// Token transfer.
    Token,
    /// Arbitrary contract interaction.
    Contract,
}

/// A wallet-relevant transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction hash.
    pub hash: TxHash,
    /// Chain the transaction belongs to.
    pub chain_id: u64,
    /// Sender.
    pub from: Address,
    /// Recipient; `None` for contract creation.
    pub to: Option<Address>,
    /// Native value moved.
    pub value: U256,
    /// Including block, when mined.
    pub block_number: Option<u64>,
    /// Block timestamp, when mined.
    pub timestamp: Option<DateTime<Utc>>,
    /// Current status.
    pub status: TransactionStatus,
    /// Classification.
    pub kind: TransactionKind,
    /// Total fee paid, when known.
    pub fee: Option<U256>,
    /// Token contract for token transfers.
    pub token_address: Option<Address>,
}

/// Filter options for transaction queries.
///
/// Everything is optional; an empty query means "everything the adapter
/// returns".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionQuery {
    /// Maximum transactions the adapter should return.
    pub limit: Option<usize>,
    /// Earliest block (inclusive).
    pub from_block: Option<u64>,
    /// Latest block (inclusive).
    pub to_block: Option<u64>,
    /// Keep only these kinds.
    pub kinds: Option<Vec<TransactionKind>>,
    /// Keep only these statuses.
    pub statuses: Option<Vec<TransactionStatus>>,
    /// Keep only transactions at or after this time.
    pub after: Option<DateTime<Utc>>,
    /// Keep only transactions at or before this time.
    pub before: Option<DateTime<Utc>>,
    /// Drop pending transactions.
    pub exclude_pending: bool,
}

impl TransactionQuery {
    /// Whether a transaction passes this filter.
    #[must_use]
    pub fn matches(&self, tx: &Transaction) -> bool {
        if self.exclude_pending && tx.status == TransactionStatus::Pending {
            return false;
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&tx.kind) {
                return false;
            }
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&tx.status) {
                return false;
            }
        }
        if let Some(from_block) = self.from_block {
            if tx.block_number.is_none_or(|n| n < from_block) {
                return false;
            }
        }
        if let Some(to_block) = self.to_block {
            if tx.block_number.is_none_or(|n| n > to_block) {
                return false;
            }
        }
        if let Some(after) = self.after {
            if tx.timestamp.is_none_or(|t| t < after) {
                return false;
            }
        }
        if let Some(before) = self.before {
            if tx.timestamp.is_none_or(|t| t > before) {
                return false;
            }
        }
        true
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CHAIN & DISCOVERY
// ═══════════════════════════════════════════════════════════════════════════════

/// Static description of a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainInfo {
    /// Chain id, e.g. 1 for mainnet.
    pub id: u64,
    /// Network name.
    pub name: String,
    /// Native asset symbol.
    pub symbol: String,
    /// Native asset decimals.
    pub decimals: u8,
    /// Block explorer base URL.
    pub explorer_url: String,
}

/// Result of scanning an address for held tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenDiscovery {
    /// The scanned address.
    pub address: Address,
    /// Chain scanned.
    pub chain_id: u64,
    /// Tokens found (already spam-filtered by the adapter).
    pub tokens: Vec<Asset>,
    /// Per-source failures that did not abort the scan.
    pub errors: Vec<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// LIVE DATA
// ═══════════════════════════════════════════════════════════════════════════════

/// Details of one block, as needed by the live drivers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    /// Block number.
    pub number: u64,
    /// Block hash.
    pub hash: B256,
    /// Parent hash.
    pub parent_hash: B256,
    /// Block timestamp.
    pub timestamp: DateTime<Utc>,
    /// Gas used by the block.
    pub gas_used: u64,
    /// Block gas limit.
    pub gas_limit: u64,
    /// Transactions in the block.
    pub transaction_count: usize,
}

/// A decoded ERC-20 transfer touching a tracked address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEvent {
    /// Sender.
    pub from: Address,
    /// Recipient.
    pub to: Address,
    /// Token contract that emitted the event.
    pub token_address: Address,
    /// Raw transfer amount.
    pub value: U256,
    /// Chain the transfer happened on.
    pub chain_id: u64,
    /// Block containing the transfer.
    pub block_number: u64,
    /// Transaction hash.
    pub tx_hash: TxHash,
    /// Position of the log within the block.
    pub log_index: u64,
    /// When the transfer was observed.
    pub timestamp: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn tx(status: TransactionStatus, kind: TransactionKind, block: Option<u64>) -> Transaction {
        Transaction {
            hash: TxHash::ZERO,
            chain_id: 1,
            from: Address::ZERO,
            to: Some(Address::ZERO),
            value: U256::from(1u64),
            block_number: block,
            timestamp: block.map(|b| {
                DateTime::<Utc>::from_timestamp(1_700_000_000 + i64::try_from(b).unwrap(), 0)
                    .unwrap()
            }),
            status,
            kind,
            fee: None,
            token_address: None,
        }
    }

    #[test]
    fn parse_address_accepts_canonical_form() {
        let addr = parse_address("0x1234567890123456789012345678901234567890").unwrap();
        assert_eq!(addr, Address::from_slice(&[0x12u8, 0x34, 0x56, 0x78, 0x90].repeat(4)));
    }

    #[test]
    fn parse_address_rejects_garbage() {
        for bad in ["", "0x123", "not-an-address", "0xzz34567890123456789012345678901234567890"] {
            let err = parse_address(bad).unwrap_err();
            assert_eq!(err.code(), "VALIDATION");
            assert!(!err.is_retriable());
        }
    }

    #[test]
    fn query_filters_by_status_and_kind() {
        let query = TransactionQuery {
            kinds: Some(vec![TransactionKind::Native]),
            statuses: Some(vec![TransactionStatus::Confirmed]),
            ..TransactionQuery::default()
        };

        assert!(query.matches(&tx(TransactionStatus::Confirmed, TransactionKind::Native, Some(1))));
        assert!(!query.matches(&tx(TransactionStatus::Failed, TransactionKind::Native, Some(1))));
        assert!(!query.matches(&tx(TransactionStatus::Confirmed, TransactionKind::Token, Some(1))));
    }

    #[test]
    fn query_filters_by_block_range() {
        let query = TransactionQuery {
            from_block: Some(10),
            to_block: Some(20),
            ..TransactionQuery::default()
        };

        assert!(query.matches(&tx(TransactionStatus::Confirmed, TransactionKind::Native, Some(15))));
        assert!(!query.matches(&tx(TransactionStatus::Confirmed, TransactionKind::Native, Some(5))));
        assert!(!query.matches(&tx(TransactionStatus::Confirmed, TransactionKind::Native, Some(25))));
        // Unmined transactions have no block and fail block-range filters.
        assert!(!query.matches(&tx(TransactionStatus::Pending, TransactionKind::Native, None)));
    }

    #[test]
    fn query_excludes_pending() {
        let query = TransactionQuery {
            exclude_pending: true,
            ..TransactionQuery::default()
        };
        assert!(!query.matches(&tx(TransactionStatus::Pending, TransactionKind::Native, None)));
        assert!(query.matches(&tx(TransactionStatus::Confirmed, TransactionKind::Native, Some(1))));
    }

    #[test]
    fn query_filters_by_date_range() {
        let base = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let query = TransactionQuery {
            after: Some(base + chrono::Duration::seconds(10)),
            before: Some(base + chrono::Duration::seconds(20)),
            ..TransactionQuery::default()
        };

        assert!(query.matches(&tx(TransactionStatus::Confirmed, TransactionKind::Native, Some(15))));
        assert!(!query.matches(&tx(TransactionStatus::Confirmed, TransactionKind::Native, Some(5))));
    }

    #[test]
    fn balance_builder_attaches_block() {
        let balance = Balance::new(
            Address::ZERO,
            1,
            Asset::native("ETH", "Ether", 18),
            U256::from(100u64),
        )
        .at_block(42);
        assert_eq!(balance.block_number, Some(42));
        assert_eq!(balance.asset.address, None);
    }
}
