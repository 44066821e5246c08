//! Event vocabulary shared by the WebSocket and polling paths.
//!
//! Consumers subscribe to [`EventKind`]s and receive [`ChainEvent`]s; the
//! payload is a tagged union, so every kind carries exactly the data it
//! documents and nothing is stringly typed.

use alloy::primitives::{Address, U256};
use chrono::{DateTime, Utc};
use evm_adapter::types::{BlockInfo, TransferEvent};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ═══════════════════════════════════════════════════════════════════════════════
// TRANSPORT & SUBSCRIPTION VOCABULARY
// ═══════════════════════════════════════════════════════════════════════════════

/// The live-data channel currently serving a chain or handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Push over a WebSocket connection.
    Websocket,
    /// Pull via periodic polling.
    Polling,
}

/// What a subscription handle delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubscriptionKind {
    /// Native balance refreshes for tracked addresses.
    Balances,
    /// ERC-20 transfers touching tracked addresses.
    TokenTransfers,
    /// Every new block.
    NewBlocks,
    /// Pending transaction hashes.
    PendingTransactions,
    /// Raw logs from chosen contracts.
    ContractEvents,
}

/// Process-unique subscription id.
pub type SubscriptionId = Uuid;

// ═══════════════════════════════════════════════════════════════════════════════
// EVENT KINDS
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything the bus can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// A chain's WebSocket transport came up.
    WebsocketConnected,
    /// A chain's WebSocket transport went down.
    WebsocketDisconnected,
    /// A subscription handle was created.
    SubscriptionCreated,
    /// A subscription handle was closed.
    SubscriptionRemoved,
    /// A new block was observed (either transport).
    LiveBlockReceived,
    /// A tracked address's native balance was refreshed.
    LiveBalanceUpdated,
    /// An ERC-20 transfer touching a tracked address was decoded.
    LiveTransferDetected,
}

// ═══════════════════════════════════════════════════════════════════════════════
// PAYLOADS
// ═══════════════════════════════════════════════════════════════════════════════

/// A refreshed native balance for a tracked address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceUpdate {
    /// The tracked address.
    pub address: Address,
    /// Chain the balance lives on.
    pub chain_id: u64,
    /// Raw balance in wei.
    pub amount: U256,
    /// Block that triggered the refresh.
    pub block_number: u64,
}

/// Tagged event payload; the variant always matches the event kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EventPayload {
    /// Transport state change details.
    Connection {
        /// Which transport the chain is now on.
        transport: Transport,
        /// Human-readable detail (reason, attempt count).
        details: String,
    },
    /// Subscription lifecycle details.
    Subscription {
        /// The handle's id.
        id: SubscriptionId,
        /// What the handle delivers.
        kind: SubscriptionKind,
    },
    /// A new block.
    Block(BlockInfo),
    /// A balance refresh.
    Balance(BalanceUpdate),
    /// A decoded transfer.
    Transfer(TransferEvent),
}

/// One event as delivered to listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEvent {
    /// What happened.
    pub kind: EventKind,
    /// The chain it happened on.
    pub chain_id: u64,
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
    /// Kind-specific data.
    pub payload: EventPayload,
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(EventKind::WebsocketConnected, r#""WEBSOCKET_CONNECTED""#)]
    #[case(EventKind::WebsocketDisconnected, r#""WEBSOCKET_DISCONNECTED""#)]
    #[case(EventKind::SubscriptionCreated, r#""SUBSCRIPTION_CREATED""#)]
    #[case(EventKind::SubscriptionRemoved, r#""SUBSCRIPTION_REMOVED""#)]
    #[case(EventKind::LiveBlockReceived, r#""LIVE_BLOCK_RECEIVED""#)]
    #[case(EventKind::LiveBalanceUpdated, r#""LIVE_BALANCE_UPDATED""#)]
    #[case(EventKind::LiveTransferDetected, r#""LIVE_TRANSFER_DETECTED""#)]
    fn event_kinds_serialize_screaming_snake(#[case] kind: EventKind, #[case] expected: &str) {
        assert_eq!(serde_json::to_string(&kind).unwrap(), expected);
    }

    #[test]
    fn payload_tag_matches_variant() {
        let payload = EventPayload::Balance(BalanceUpdate {
            address: Address::ZERO,
            chain_id: 1,
            amount: U256::from(10u64),
            block_number: 100,
        });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "balance");
        assert_eq!(json["chain_id"], 1);
    }
}
