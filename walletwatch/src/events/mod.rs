//! Event bus and event vocabulary.
//!
//! - [`bus`] - Typed pub/sub with error-isolated synchronous delivery
//! - [`types`] - Event kinds, payloads, and the transport/subscription vocabulary

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventListener, ListenerGuard};
pub use types::{
    BalanceUpdate, ChainEvent, EventKind, EventPayload, SubscriptionId, SubscriptionKind,
    Transport,
};
