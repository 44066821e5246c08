//! Outward-facing services.
//!
//! - [`balance`] - Cached, coalesced, breaker-guarded balance reads
//! - [`transaction`] - Filtered, paginated, cached transaction history
//! - [`subscription`] - Handle lifecycle and transport orchestration
//! - [`tracking`] - Periodic balance/transaction diffing
//! - [`account`] - Account-id attribution over shared addresses

pub mod account;
pub mod balance;
pub mod subscription;
pub mod tracking;
pub mod transaction;

pub use account::{
    AccountBalance, AccountBalanceService, AccountBalanceUpdate, AccountBalancesOutcome,
    AccountSubscription, AccountSubscriptionService, AddressRequest,
};
pub use balance::{
    BalanceOptions, BalanceRequest, BalanceService, BalanceServiceStats, MultiChainBalance,
};
pub use subscription::{
    SubscriptionHandle, SubscriptionService, SubscriptionSink, SubscriptionStatus,
};
pub use tracking::{TrackingCallbacks, TrackingOverrides, TrackingService, TrackingStatus};
pub use transaction::{
    Page, TransactionPageRequest, TransactionService, TransactionSubscriptionOptions,
};
