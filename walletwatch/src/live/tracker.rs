//! Tracked-address registry shared by the drivers.
//!
//! The subscription service, the new-heads driver, and the poll manager all
//! consult one tracker, so "which addresses matter on chain N" has a single
//! answer regardless of transport. Addresses are parsed [`Address`] values,
//! which makes every comparison case-free by construction.

use std::collections::HashSet;

use alloy::primitives::Address;
use dashmap::DashMap;

/// Per-chain tracked address sets.
#[derive(Debug, Default)]
pub struct AddressTracker {
    by_chain: DashMap<u64, HashSet<Address>>,
}

impl AddressTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an address on a chain. Returns whether it was newly added.
    pub fn track(&self, chain_id: u64, address: Address) -> bool {
        self.by_chain.entry(chain_id).or_default().insert(address)
    }

    /// Stop tracking an address. Returns whether it was present.
    pub fn untrack(&self, chain_id: u64, address: Address) -> bool {
        self.by_chain
            .get_mut(&chain_id)
            .is_some_and(|mut set| set.remove(&address))
    }

    /// Whether an address is tracked on a chain.
    #[must_use]
    pub fn is_tracked(&self, chain_id: u64, address: Address) -> bool {
        self.by_chain
            .get(&chain_id)
            .is_some_and(|set| set.contains(&address))
    }

    /// Snapshot of a chain's tracked addresses.
    #[must_use]
    pub fn addresses(&self, chain_id: u64) -> Vec<Address> {
        self.by_chain
            .get(&chain_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of tracked addresses on a chain.
    #[must_use]
    pub fn count(&self, chain_id: u64) -> usize {
        self.by_chain.get(&chain_id).map_or(0, |set| set.len())
    }

    /// Forget every address on a chain.
    pub fn clear_chain(&self, chain_id: u64) {
        self.by_chain.remove(&chain_id);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(byte: u8) -> Address {
        Address::from_slice(&[byte; 20])
    }

    #[test]
    fn tracking_is_per_chain() {
        let tracker = AddressTracker::new();
        assert!(tracker.track(1, addr(0x11)));
        assert!(!tracker.track(1, addr(0x11)), "second add is a no-op");
        assert!(tracker.track(137, addr(0x11)));

        assert!(tracker.is_tracked(1, addr(0x11)));
        assert!(!tracker.is_tracked(1, addr(0x22)));
        assert_eq!(tracker.count(1), 1);
        assert_eq!(tracker.count(137), 1);

        assert!(tracker.untrack(1, addr(0x11)));
        assert!(!tracker.untrack(1, addr(0x11)));
        assert!(tracker.is_tracked(137, addr(0x11)));
    }

    #[test]
    fn case_differences_cannot_split_an_address() {
        // Mixed-case hex parses to the same Address value.
        let lower: Address = "0xabcdefabcdefabcdefabcdefabcdefabcdefabcd"
            .parse()
            .unwrap_or_default();
        let mixed: Address = "0xAbCdEfAbCdEfAbCdEfAbCdEfAbCdEfAbCdEfAbCd"
            .parse()
            .unwrap_or_default();

        let tracker = AddressTracker::new();
        tracker.track(1, lower);
        assert!(tracker.is_tracked(1, mixed));
    }

    #[test]
    fn clear_chain_forgets_everything() {
        let tracker = AddressTracker::new();
        tracker.track(1, addr(0x11));
        tracker.track(1, addr(0x22));
        tracker.clear_chain(1);
        assert_eq!(tracker.count(1), 0);
    }
}
