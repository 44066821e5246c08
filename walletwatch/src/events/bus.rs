//! Typed pub/sub bus shared by the WebSocket and polling paths.
//!
//! Both transports emit the same [`ChainEvent`]s here, which is what makes
//! consumers transport-agnostic: a subscription handle wired to the bus
//! cannot tell whether a balance update came from a new-heads push or a
//! poll tick.
//!
//! Delivery is synchronous - every listener for the kind (and every
//! all-events listener) observes the event before `emit` returns. A
//! panicking listener is caught and logged; it never interrupts delivery to
//! the rest.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use tracing::warn;

use super::types::{ChainEvent, EventKind, EventPayload};

// ═══════════════════════════════════════════════════════════════════════════════
// LISTENERS
// ═══════════════════════════════════════════════════════════════════════════════

/// Bus listener. Must not block; runs on the emitter's task.
pub type EventListener = Arc<dyn Fn(&ChainEvent) + Send + Sync>;

struct BusState {
    by_kind: HashMap<EventKind, Vec<(u64, EventListener)>>,
    all: Vec<(u64, EventListener)>,
    next_id: u64,
}

/// Detaches one listener from the bus.
///
/// Dropping the guard without calling [`unsubscribe`](Self::unsubscribe)
/// leaves the listener attached; cleanup closures own their guards.
#[derive(Debug)]
pub struct ListenerGuard {
    bus: Weak<Mutex<BusState>>,
    kind: Option<EventKind>,
    id: u64,
}

impl ListenerGuard {
    /// Remove the listener this guard was returned for.
    pub fn unsubscribe(self) {
        let Some(state) = self.bus.upgrade() else {
            return;
        };
        #[allow(clippy::unwrap_used)]
        let mut state = state.lock().unwrap();
        match self.kind {
            Some(kind) => {
                if let Some(listeners) = state.by_kind.get_mut(&kind) {
                    listeners.retain(|(id, _)| *id != self.id);
                }
            }
            None => state.all.retain(|(id, _)| *id != self.id),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EVENT BUS
// ═══════════════════════════════════════════════════════════════════════════════

/// Typed pub/sub with error-isolated synchronous delivery.
pub struct EventBus {
    state: Arc<Mutex<BusState>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.total_listener_count())
            .finish_non_exhaustive()
    }
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                by_kind: HashMap::new(),
                all: Vec::new(),
                next_id: 0,
            })),
        }
    }

    #[allow(clippy::unwrap_used)] // mutex poisoning is unrecoverable here
    fn lock(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.state.lock().unwrap()
    }

    /// Listen for one event kind.
    pub fn on(&self, kind: EventKind, listener: EventListener) -> ListenerGuard {
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.by_kind.entry(kind).or_default().push((id, listener));
        ListenerGuard {
            bus: Arc::downgrade(&self.state),
            kind: Some(kind),
            id,
        }
    }

    /// Listen for every event kind.
    pub fn on_all(&self, listener: EventListener) -> ListenerGuard {
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.all.push((id, listener));
        ListenerGuard {
            bus: Arc::downgrade(&self.state),
            kind: None,
            id,
        }
    }

    /// Emit an event to every matching listener, synchronously.
    pub fn emit(&self, kind: EventKind, chain_id: u64, payload: EventPayload) {
        let event = ChainEvent {
            kind,
            chain_id,
            timestamp: Utc::now(),
            payload,
        };

        // Snapshot under the lock, deliver outside it: listeners may touch
        // the bus themselves (e.g. unsubscribe).
        let listeners: Vec<EventListener> = {
            let state = self.lock();
            state
                .by_kind
                .get(&kind)
                .into_iter()
                .flatten()
                .map(|(_, l)| Arc::clone(l))
                .chain(state.all.iter().map(|(_, l)| Arc::clone(l)))
                .collect()
        };

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                warn!(?kind, chain_id, "Event listener panicked; continuing delivery");
            }
        }
    }

    /// Listeners registered for a kind (excluding all-events listeners).
    #[must_use]
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.lock().by_kind.get(&kind).map_or(0, Vec::len)
    }

    /// Every listener on the bus.
    #[must_use]
    pub fn total_listener_count(&self) -> usize {
        let state = self.lock();
        state.by_kind.values().map(Vec::len).sum::<usize>() + state.all.len()
    }

    /// Drop every listener.
    pub fn remove_all_listeners(&self) {
        let mut state = self.lock();
        state.by_kind.clear();
        state.all.clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use alloy::primitives::{Address, U256};

    use super::super::types::BalanceUpdate;
    use super::*;

    fn balance_payload(chain_id: u64) -> EventPayload {
        EventPayload::Balance(BalanceUpdate {
            address: Address::ZERO,
            chain_id,
            amount: U256::from(1u64),
            block_number: 1,
        })
    }

    #[test]
    fn listeners_receive_matching_kind_synchronously() {
        let bus = EventBus::new();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);

        let _guard = bus.on(
            EventKind::LiveBalanceUpdated,
            Arc::new(move |event| sink.lock().unwrap().push(event.chain_id)),
        );

        bus.emit(EventKind::LiveBalanceUpdated, 1, balance_payload(1));
        // Delivery is synchronous: the listener has already run.
        assert_eq!(*received.lock().unwrap(), vec![1]);

        // Other kinds do not reach it.
        bus.emit(EventKind::SubscriptionCreated, 1, balance_payload(1));
        assert_eq!(received.lock().unwrap().len(), 1);
    }

    #[test]
    fn on_all_sees_every_kind() {
        let bus = EventBus::new();
        let count = Arc::new(Mutex::new(0u32));
        let sink = Arc::clone(&count);

        let _guard = bus.on_all(Arc::new(move |_| *sink.lock().unwrap() += 1));

        bus.emit(EventKind::LiveBlockReceived, 1, balance_payload(1));
        bus.emit(EventKind::LiveBalanceUpdated, 137, balance_payload(137));
        assert_eq!(*count.lock().unwrap(), 2);
    }

    #[test]
    fn panicking_listener_does_not_interrupt_delivery() {
        let bus = EventBus::new();
        let reached = Arc::new(Mutex::new(false));
        let sink = Arc::clone(&reached);

        #[allow(clippy::panic)]
        let _bad = bus.on(
            EventKind::LiveBalanceUpdated,
            Arc::new(|_| panic!("listener bug")),
        );
        let _good = bus.on(
            EventKind::LiveBalanceUpdated,
            Arc::new(move |_| *sink.lock().unwrap() = true),
        );

        bus.emit(EventKind::LiveBalanceUpdated, 1, balance_payload(1));
        assert!(*reached.lock().unwrap(), "second listener must still run");
    }

    #[test]
    fn unsubscribe_detaches_exactly_one_listener() {
        let bus = EventBus::new();
        let count = Arc::new(Mutex::new(0u32));

        let sink = Arc::clone(&count);
        let guard = bus.on(
            EventKind::LiveBlockReceived,
            Arc::new(move |_| *sink.lock().unwrap() += 1),
        );
        let sink = Arc::clone(&count);
        let _kept = bus.on(
            EventKind::LiveBlockReceived,
            Arc::new(move |_| *sink.lock().unwrap() += 1),
        );

        guard.unsubscribe();
        bus.emit(EventKind::LiveBlockReceived, 1, balance_payload(1));
        assert_eq!(*count.lock().unwrap(), 1);
        assert_eq!(bus.listener_count(EventKind::LiveBlockReceived), 1);
    }

    #[test]
    fn remove_all_listeners_clears_the_bus() {
        let bus = EventBus::new();
        let _a = bus.on(EventKind::LiveBlockReceived, Arc::new(|_| {}));
        let _b = bus.on_all(Arc::new(|_| {}));
        assert_eq!(bus.total_listener_count(), 2);

        bus.remove_all_listeners();
        assert_eq!(bus.total_listener_count(), 0);
    }

    #[test]
    fn listener_may_unsubscribe_during_emit() {
        // The emit snapshot means a listener can unsubscribe itself without
        // deadlocking the bus.
        let bus = Arc::new(EventBus::new());
        let guard_slot: Arc<Mutex<Option<ListenerGuard>>> = Arc::new(Mutex::new(None));

        let slot = Arc::clone(&guard_slot);
        let guard = bus.on(
            EventKind::LiveBlockReceived,
            Arc::new(move |_| {
                if let Some(guard) = slot.lock().unwrap().take() {
                    guard.unsubscribe();
                }
            }),
        );
        *guard_slot.lock().unwrap() = Some(guard);

        bus.emit(EventKind::LiveBlockReceived, 1, balance_payload(1));
        assert_eq!(bus.listener_count(EventKind::LiveBlockReceived), 0);
    }
}
