//! walletwatch: resilient balance, transaction, and live-event services
//! over EVM chains.
//!
//! This crate is the outward face of the stack. An application registers a
//! [`ChainAdapter`](evm_adapter::ChainAdapter) per chain, builds the
//! services, and gets:
//!
//! - **Balance reads** through cache -> coalescer -> breaker(retry) ->
//!   adapter ([`BalanceService`])
//! - **Transaction history** with filtering, pagination, and caching
//!   ([`TransactionService`])
//! - **Live subscriptions** that survive WebSocket failures by falling
//!   back to polling and recovering transparently
//!   ([`SubscriptionService`])
//! - **Change tracking** that diffs balances and transactions on a timer
//!   ([`TrackingService`])
//! - **Account attribution** fanning shared addresses out to every logical
//!   account that claims them ([`AccountBalanceService`],
//!   [`AccountSubscriptionService`])
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Application                              │
//! └──────────────────────────────────────────────────────────────────┘
//!        │ reads                               │ subscribes
//!        ▼                                     ▼
//! ┌───────────────────┐             ┌─────────────────────────────┐
//! │ Balance/Tx/       │             │ SubscriptionService         │
//! │ Tracking services │             │   │ transport decision      │
//! │   cache           │             │   ▼                         │
//! │   coalescer       │             │ ConnectionManager ── WS ──▶ │
//! │   breaker(retry)  │             │   │ heartbeat + reconnect   │
//! └────────┬──────────┘             │   ▼            fallback     │
//!          │                        │ NewHeads / TransferLogs     │
//!          ▼                        │ PollManager (+ recovery)    │
//! ┌───────────────────┐             └──────────┬──────────────────┘
//! │ ChainAdapter      │                        │
//! │ (per chain)       │                        ▼
//! └───────────────────┘             ┌─────────────────────────────┐
//!          │                        │ EventBus (transport-        │
//!          ▼                        │ agnostic delivery)          │
//!   RpcFallbackChain                └─────────────────────────────┘
//!   (breaker per endpoint)
//! ```
//!
//! # Modules
//!
//! - [`config`] - Typed settings with defaults and optional file/env loading
//! - [`events`] - The event bus and event vocabulary
//! - [`live`] - Connection manager, drivers, and the polling fallback
//! - [`services`] - Balance, transaction, subscription, tracking, account

// ═══════════════════════════════════════════════════════════════════════════════
// MODULES
// ═══════════════════════════════════════════════════════════════════════════════

pub mod config;
pub mod events;
pub mod live;
pub mod services;

// ═══════════════════════════════════════════════════════════════════════════════
// RE-EXPORTS
// ═══════════════════════════════════════════════════════════════════════════════

// Primary types - what most users need
pub use config::Settings;
pub use events::{BalanceUpdate, ChainEvent, EventBus, EventKind, SubscriptionKind, Transport};
pub use live::{ConnectionManager, ManagerConfig, PollManager, TRANSFER_TOPIC};
pub use services::{
    AccountBalanceService, AccountSubscriptionService, BalanceOptions, BalanceService,
    SubscriptionHandle, SubscriptionService, SubscriptionSink, SubscriptionStatus,
    TrackingService, TransactionService,
};

// ═══════════════════════════════════════════════════════════════════════════════
// PRELUDE
// ═══════════════════════════════════════════════════════════════════════════════

/// Convenience re-exports for common use.
///
/// # Usage
///
/// ```ignore
/// use walletwatch::prelude::*;
/// ```
pub mod prelude {
    pub use evm_adapter::prelude::*;
    pub use rpc_guard::prelude::*;

    pub use crate::config::Settings;
    pub use crate::events::{BalanceUpdate, ChainEvent, EventBus, EventKind, Transport};
    pub use crate::services::{
        BalanceOptions, BalanceService, SubscriptionHandle, SubscriptionService,
        SubscriptionSink, TrackingService, TransactionService,
    };
}

// ═══════════════════════════════════════════════════════════════════════════════
// CRATE INFO
// ═══════════════════════════════════════════════════════════════════════════════

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
