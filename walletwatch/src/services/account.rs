//! Account-attributed balances and subscriptions.
//!
//! One on-chain address may belong to several logical accounts (wallet
//! providers, namespaces). These services deduplicate `(address, chain)`
//! pairs before touching the chain - each pair is fetched or subscribed
//! exactly once - and fan results back out with every account id whose
//! scope covers the pair. Errors fan out identically, so an account never
//! silently loses a chain.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use alloy::primitives::Address;
use evm_adapter::types::{Balance, parse_address};
use futures::future::join_all;
use rpc_guard::{Result, RpcError};
use tracing::{debug, instrument};

use super::balance::{BalanceOptions, BalanceService};
use super::subscription::{SubscriptionHandle, SubscriptionService, SubscriptionSink};
use crate::events::BalanceUpdate;

// ═══════════════════════════════════════════════════════════════════════════════
// REQUESTS & RESULTS
// ═══════════════════════════════════════════════════════════════════════════════

/// One account's claim on an address across a set of chains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRequest {
    /// Logical account id (e.g. `metamask:abc:0x...`).
    pub account_id: String,
    /// The address, as supplied by the caller.
    pub address: String,
    /// Chains this account cares about for this address.
    pub chain_scope: HashSet<u64>,
}

/// A balance attributed to every covering account.
#[derive(Debug, Clone)]
pub struct AccountBalance {
    /// Every account id bound to this `(address, chain)` pair.
    pub account_ids: Vec<String>,
    /// The address the balance belongs to.
    pub address: Address,
    /// The chain it was read on.
    pub chain_id: u64,
    /// The balance itself.
    pub balance: Balance,
}

/// A failure attributed to every covering account.
#[derive(Debug, Clone)]
pub struct AccountBalanceError {
    /// Every account id bound to the failing pair.
    pub account_ids: Vec<String>,
    /// The address that failed.
    pub address: String,
    /// The chain it failed on.
    pub chain_id: u64,
    /// What went wrong.
    pub error: RpcError,
}

/// Fan-out outcome: successes and failures, both account-attributed.
#[derive(Debug, Clone, Default)]
pub struct AccountBalancesOutcome {
    /// Per-pair successes.
    pub balances: Vec<AccountBalance>,
    /// Per-pair failures.
    pub errors: Vec<AccountBalanceError>,
}

/// A live balance update enriched with its account ids.
#[derive(Debug, Clone)]
pub struct AccountBalanceUpdate {
    /// Every account id bound to this `(address, chain)` pair.
    pub account_ids: Vec<String>,
    /// The underlying update.
    pub update: BalanceUpdate,
}

// ═══════════════════════════════════════════════════════════════════════════════
// PAIR DEDUPLICATION
// ═══════════════════════════════════════════════════════════════════════════════

struct PairBinding {
    address: Address,
    raw_address: String,
    chain_id: u64,
    account_ids: Vec<String>,
}

/// Collapse requests into unique `(address, chain)` pairs, each carrying
/// every account id whose scope covers it. Unparseable addresses come back
/// separately, attributed the same way.
fn dedupe_pairs(requests: &[AddressRequest]) -> (Vec<PairBinding>, Vec<AccountBalanceError>) {
    let mut pairs: HashMap<(Address, u64), PairBinding> = HashMap::new();
    let mut order: Vec<(Address, u64)> = Vec::new();
    let mut invalid: Vec<AccountBalanceError> = Vec::new();

    for request in requests {
        let parsed = match parse_address(&request.address) {
            Ok(parsed) => parsed,
            Err(error) => {
                for &chain_id in &request.chain_scope {
                    invalid.push(AccountBalanceError {
                        account_ids: vec![request.account_id.clone()],
                        address: request.address.clone(),
                        chain_id,
                        error: error.clone(),
                    });
                }
                continue;
            }
        };

        for &chain_id in &request.chain_scope {
            let key = (parsed, chain_id);
            let binding = pairs.entry(key).or_insert_with(|| {
                order.push(key);
                PairBinding {
                    address: parsed,
                    raw_address: request.address.clone(),
                    chain_id,
                    account_ids: Vec::new(),
                }
            });
            if !binding.account_ids.contains(&request.account_id) {
                binding.account_ids.push(request.account_id.clone());
            }
        }
    }

    let bindings = order
        .into_iter()
        .filter_map(|key| pairs.remove(&key))
        .collect();
    (bindings, invalid)
}

// ═══════════════════════════════════════════════════════════════════════════════
// ACCOUNT BALANCE SERVICE
// ═══════════════════════════════════════════════════════════════════════════════

/// Account-attributed balance reads.
#[derive(Debug)]
pub struct AccountBalanceService {
    balances: Arc<BalanceService>,
}

impl AccountBalanceService {
    /// Create over the core balance service.
    #[must_use]
    pub fn new(balances: Arc<BalanceService>) -> Self {
        Self { balances }
    }

    /// Read every requested pair once and fan results out per account.
    #[instrument(skip(self, requests))]
    pub async fn get_account_balances(
        &self,
        requests: &[AddressRequest],
    ) -> AccountBalancesOutcome {
        let (pairs, invalid) = dedupe_pairs(requests);
        debug!(
            requested = requests.len(),
            unique_pairs = pairs.len(),
            "Fetching account balances"
        );

        let reads = pairs.iter().map(|pair| async move {
            let result = self
                .balances
                .get_balance(&pair.raw_address, pair.chain_id, BalanceOptions::default())
                .await;
            (pair, result)
        });

        let mut outcome = AccountBalancesOutcome {
            balances: Vec::new(),
            errors: invalid,
        };
        for (pair, result) in join_all(reads).await {
            match result {
                Ok(balance) => outcome.balances.push(AccountBalance {
                    account_ids: pair.account_ids.clone(),
                    address: pair.address,
                    chain_id: pair.chain_id,
                    balance,
                }),
                Err(error) => outcome.errors.push(AccountBalanceError {
                    account_ids: pair.account_ids.clone(),
                    address: pair.raw_address.clone(),
                    chain_id: pair.chain_id,
                    error,
                }),
            }
        }
        outcome
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ACCOUNT SUBSCRIPTION SERVICE
// ═══════════════════════════════════════════════════════════════════════════════

/// One logical subscription fanning account-enriched updates out of many
/// native subscriptions.
pub struct AccountSubscription {
    handles: Vec<SubscriptionHandle>,
}

impl std::fmt::Debug for AccountSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountSubscription")
            .field("native_subscriptions", &self.handles.len())
            .finish()
    }
}

impl AccountSubscription {
    /// Number of native `(address, chain)` subscriptions underneath.
    #[must_use]
    pub fn native_count(&self) -> usize {
        self.handles.len()
    }

    /// Close every underlying subscription.
    pub fn unsubscribe(&self) {
        for handle in &self.handles {
            handle.unsubscribe();
        }
    }
}

/// Account-attributed live balance updates.
#[derive(Debug)]
pub struct AccountSubscriptionService {
    subscriptions: Arc<SubscriptionService>,
}

impl AccountSubscriptionService {
    /// Create over the subscription orchestrator.
    #[must_use]
    pub fn new(subscriptions: Arc<SubscriptionService>) -> Self {
        Self { subscriptions }
    }

    /// Subscribe every unique pair once; updates carry the full account-id
    /// set bound to their pair.
    ///
    /// # Errors
    ///
    /// Validation errors for malformed addresses (no partial subscriptions
    /// are left behind), or a cancellation error after the orchestrator is
    /// destroyed.
    #[instrument(skip(self, requests, on_update))]
    pub fn subscribe_account_balances(
        &self,
        requests: &[AddressRequest],
        on_update: Arc<dyn Fn(AccountBalanceUpdate) + Send + Sync>,
    ) -> Result<AccountSubscription> {
        let (pairs, invalid) = dedupe_pairs(requests);
        if let Some(first) = invalid.into_iter().next() {
            return Err(first.error);
        }

        let mut handles = Vec::with_capacity(pairs.len());
        for pair in pairs {
            let account_ids = pair.account_ids.clone();
            let on_update = Arc::clone(&on_update);
            let sink = SubscriptionSink {
                on_data: Some(Arc::new(move |update: BalanceUpdate| {
                    on_update(AccountBalanceUpdate {
                        account_ids: account_ids.clone(),
                        update,
                    });
                })),
                ..SubscriptionSink::default()
            };

            match self.subscriptions.subscribe_balances(
                pair.chain_id,
                &[pair.raw_address.clone()],
                sink,
            ) {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    // No partial fan-out: roll back what we armed.
                    for handle in &handles {
                        handle.unsubscribe();
                    }
                    return Err(err);
                }
            }
        }

        Ok(AccountSubscription { handles })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
