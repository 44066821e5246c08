//! Balance reads through the full resilience stack.
//!
//! The read path is `cache -> coalescer -> breaker(retry(adapter))`:
//! a fresh cached value short-circuits everything (including an open
//! breaker), concurrent identical reads share one adapter call, and the
//! per-chain breaker sees one logical outcome per fetch because the retry
//! policy runs *inside* it.
//!
//! Validation failures are classified before the stack: they count as
//! failed requests but are never retried and never touch the breaker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use alloy::primitives::Address;
use dashmap::DashMap;
use evm_adapter::traits::{BalanceCallback, ChainAdapter, Unsubscribe};
use evm_adapter::types::{Balance, parse_address};
use futures::future::join_all;
use rpc_guard::{
    BatchConfig, BatchProcessor, CircuitBreaker, CircuitState, RequestCoalescer, Result,
    RetryPolicy, RpcError, TtlCache,
};
use tracing::{debug, instrument, warn};

use crate::config::{BalanceSettings, BreakerSettings, CacheSettings, RetrySettings, Settings};

// ═══════════════════════════════════════════════════════════════════════════════
// OPTIONS & STATS
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-call read options.
#[derive(Debug, Clone, Copy, Default)]
pub struct BalanceOptions {
    /// Skip the cache probe and overwrite the cached value.
    pub force_fresh: bool,
}

/// One entry of a batch read.
#[derive(Debug, Clone)]
pub struct BalanceRequest {
    /// Address to read, as supplied by the caller.
    pub address: String,
    /// Chain to read it on.
    pub chain_id: u64,
}

/// Fan-out result across chains.
#[derive(Debug, Clone)]
pub struct MultiChainBalance {
    /// Per-chain successes.
    pub balances: Vec<Balance>,
    /// Per-chain failures, when not failing fast.
    pub errors: Vec<(u64, RpcError)>,
}

/// Point-in-time service statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceServiceStats {
    /// Every read entering the service.
    pub total_requests: u64,
    /// Reads served from cache.
    pub cache_hits: u64,
    /// Reads that had to fetch.
    pub cache_misses: u64,
    /// Requests routed through the batch processor.
    pub batched_requests: u64,
    /// Reads that ultimately failed.
    pub failed_requests: u64,
    /// Live adapter-level balance subscriptions.
    pub active_subscriptions: usize,
}

/// Handle for one adapter-level balance subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceSubscription {
    id: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// BALANCE SERVICE
// ═══════════════════════════════════════════════════════════════════════════════

/// Cached, coalesced, breaker-guarded balance reads over registered
/// adapters.
pub struct BalanceService {
    settings: BalanceSettings,
    breaker_settings: BreakerSettings,
    adapters: DashMap<u64, Arc<dyn ChainAdapter>>,
    cache: Arc<TtlCache<Balance>>,
    token_list_coalescer: RequestCoalescer<Vec<Balance>>,
    coalescer: RequestCoalescer<Balance>,
    breakers: DashMap<u64, Arc<CircuitBreaker>>,
    retry: Arc<RetryPolicy>,
    batchers: DashMap<u64, BatchProcessor<Address, Balance>>,
    total_requests: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    batched_requests: AtomicU64,
    failed_requests: AtomicU64,
    subscriptions: Mutex<HashMap<u64, Unsubscribe>>,
    next_subscription_id: AtomicU64,
}

impl std::fmt::Debug for BalanceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BalanceService")
            .field("chains", &self.adapters.len())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl BalanceService {
    /// Build the service from settings.
    ///
    /// # Errors
    ///
    /// Fails when the retry settings do not validate.
    pub fn new(settings: &Settings) -> Result<Self> {
        Self::with_sections(
            settings.balance.clone(),
            &settings.cache,
            &settings.retry,
            settings.breaker.clone(),
        )
    }

    fn with_sections(
        settings: BalanceSettings,
        cache: &CacheSettings,
        retry: &RetrySettings,
        breaker_settings: BreakerSettings,
    ) -> Result<Self> {
        Ok(Self {
            settings,
            breaker_settings,
            adapters: DashMap::new(),
            cache: Arc::new(TtlCache::with_config(cache.to_config())),
            coalescer: RequestCoalescer::new(),
            token_list_coalescer: RequestCoalescer::new(),
            breakers: DashMap::new(),
            retry: Arc::new(RetryPolicy::new(retry.to_config())?),
            batchers: DashMap::new(),
            total_requests: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            batched_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            subscriptions: Mutex::new(HashMap::new()),
            next_subscription_id: AtomicU64::new(0),
        })
    }

    /// Register the adapter serving a chain.
    pub fn register_adapter(&self, chain_id: u64, adapter: Arc<dyn ChainAdapter>) {
        self.adapters.insert(chain_id, adapter);
    }

    fn adapter(&self, chain_id: u64) -> Result<Arc<dyn ChainAdapter>> {
        self.adapters
            .get(&chain_id)
            .map(|a| Arc::clone(&a))
            .ok_or_else(|| {
                RpcError::validation("chain_id", "a registered chain", chain_id.to_string())
            })
    }

    fn breaker(&self, chain_id: u64) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(chain_id)
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    self.breaker_settings.to_config(format!("chain:{chain_id}")),
                ))
            })
            .clone()
    }

    /// Current breaker state for a chain (for observability and tests).
    #[must_use]
    pub fn breaker_state(&self, chain_id: u64) -> Option<CircuitState> {
        self.breakers.get(&chain_id).map(|b| b.state())
    }

    fn balance_key(&self, chain_id: u64, address: Address) -> String {
        let address = address.to_string().to_lowercase();
        self.cache
            .generate_key(&["getBalance", &chain_id.to_string(), &address])
    }

    fn token_key(&self, chain_id: u64, address: Address, token: Address) -> String {
        let address = address.to_string().to_lowercase();
        let token = token.to_string().to_lowercase();
        self.cache
            .generate_key(&["getTokenBalance", &chain_id.to_string(), &address, &token])
    }

    // ───────────────────────────────────────────────────────────────────────────
    // NATIVE BALANCES
    // ───────────────────────────────────────────────────────────────────────────

    /// Read one native balance.
    ///
    /// # Errors
    ///
    /// Validation errors for malformed addresses or unregistered chains;
    /// otherwise whatever the guarded fetch produced.
    #[instrument(skip(self, options))]
    pub async fn get_balance(
        &self,
        address: &str,
        chain_id: u64,
        options: BalanceOptions,
    ) -> Result<Balance> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let address = match parse_address(address) {
            Ok(address) => address,
            Err(err) => {
                self.failed_requests.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        };

        let key = self.balance_key(chain_id, address);
        if self.settings.cache_enabled && !options.force_fresh {
            if let Some(balance) = self.cache.get(&key) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(balance);
            }
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }

        let result = {
            let adapter = match self.adapter(chain_id) {
                Ok(adapter) => adapter,
                Err(err) => {
                    self.failed_requests.fetch_add(1, Ordering::Relaxed);
                    return Err(err);
                }
            };
            let cache = Arc::clone(&self.cache);
            let retry = Arc::clone(&self.retry);
            let breaker = self.settings.breaker_enabled.then(|| self.breaker(chain_id));
            let retry_enabled = self.settings.retry_enabled;
            let cache_enabled = self.settings.cache_enabled;
            let ttl = self.settings.cache_ttl();
            let fetch_key = key.clone();

            self.coalescer
                .execute(key, move || async move {
                    let fetch = || adapter.get_balance(address);
                    let run = || async {
                        if retry_enabled {
                            retry.execute(fetch).await
                        } else {
                            fetch().await
                        }
                    };
                    let balance = match &breaker {
                        Some(breaker) => breaker.execute(run).await,
                        None => run().await,
                    }
                    .map_err(|err| err.with_chain(chain_id))?;

                    if cache_enabled {
                        cache.set_with_ttl(fetch_key, balance.clone(), ttl);
                    }
                    Ok(balance)
                })
                .await
        };

        match result {
            Ok(balance) => Ok(balance),
            Err(err) => {
                self.failed_requests.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    // ───────────────────────────────────────────────────────────────────────────
    // TOKEN BALANCES
    // ───────────────────────────────────────────────────────────────────────────

    /// Read token balances, caching each token separately.
    ///
    /// With an explicit token list and warm caches the adapter is not
    /// called at all.
    ///
    /// # Errors
    ///
    /// Same classification as [`get_balance`](Self::get_balance).
    #[instrument(skip(self, options))]
    pub async fn get_token_balances(
        &self,
        address: &str,
        chain_id: u64,
        tokens: Option<Vec<Address>>,
        options: BalanceOptions,
    ) -> Result<Vec<Balance>> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let address = match parse_address(address) {
            Ok(address) => address,
            Err(err) => {
                self.failed_requests.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        };

        // With a concrete token list, try serving entirely from cache.
        if self.settings.cache_enabled && !options.force_fresh {
            if let Some(tokens) = &tokens {
                let cached: Vec<Balance> = tokens
                    .iter()
                    .filter_map(|token| self.cache.get(&self.token_key(chain_id, address, *token)))
                    .collect();
                if cached.len() == tokens.len() && !tokens.is_empty() {
                    self.cache_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(cached);
                }
            }
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }

        let token_part = tokens.as_ref().map_or_else(String::new, |tokens| {
            let mut parts: Vec<String> =
                tokens.iter().map(|t| t.to_string().to_lowercase()).collect();
            parts.sort();
            parts.join(",")
        });
        let key = self.cache.generate_key(&[
            "getTokenBalances",
            &chain_id.to_string(),
            &address.to_string().to_lowercase(),
            &token_part,
        ]);

        let result = {
            let adapter = match self.adapter(chain_id) {
                Ok(adapter) => adapter,
                Err(err) => {
                    self.failed_requests.fetch_add(1, Ordering::Relaxed);
                    return Err(err);
                }
            };
            let cache = Arc::clone(&self.cache);
            let retry = Arc::clone(&self.retry);
            let breaker = self.settings.breaker_enabled.then(|| self.breaker(chain_id));
            let retry_enabled = self.settings.retry_enabled;
            let cache_enabled = self.settings.cache_enabled;
            let ttl = self.settings.cache_ttl();
            // Token keys are rebuilt inside the fetch; this closure keeps
            // the key shape in sync with `token_key`.
            let token_key_for = {
                let cache = Arc::clone(&self.cache);
                move |chain_id: u64, address: Address, token: Address| {
                    let address = address.to_string().to_lowercase();
                    let token = token.to_string().to_lowercase();
                    cache.generate_key(&[
                        "getTokenBalance",
                        &chain_id.to_string(),
                        &address,
                        &token,
                    ])
                }
            };

            self.token_list_coalescer
                .execute(key, move || async move {
                    let tokens_for_call = tokens.clone();
                    let fetch = move || {
                        let tokens = tokens_for_call.clone();
                        let adapter = Arc::clone(&adapter);
                        async move { adapter.get_token_balances(address, tokens.as_deref()).await }
                    };
                    let run = || async {
                        if retry_enabled {
                            retry.execute(&fetch).await
                        } else {
                            fetch().await
                        }
                    };
                    let balances = match &breaker {
                        Some(breaker) => breaker.execute(run).await,
                        None => run().await,
                    }
                    .map_err(|err| err.with_chain(chain_id))?;

                    if cache_enabled {
                        for balance in &balances {
                            if let Some(token) = balance.asset.address {
                                let token_key = token_key_for(chain_id, address, token);
                                cache.set_with_ttl(token_key, balance.clone(), ttl);
                            }
                        }
                    }
                    Ok(balances)
                })
                .await
        };

        match result {
            Ok(balances) => Ok(balances),
            Err(err) => {
                self.failed_requests.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    // ───────────────────────────────────────────────────────────────────────────
    // FAN-OUTS
    // ───────────────────────────────────────────────────────────────────────────

    /// Read one address across several chains.
    ///
    /// # Errors
    ///
    /// With `fail_fast`, the first per-chain error; otherwise never - errors
    /// are collected per chain in the result.
    pub async fn get_multi_chain_balance(
        &self,
        address: &str,
        chains: &[u64],
        fail_fast: bool,
    ) -> Result<MultiChainBalance> {
        let reads = chains
            .iter()
            .map(|chain_id| async move {
                (
                    *chain_id,
                    self.get_balance(address, *chain_id, BalanceOptions::default())
                        .await,
                )
            })
            .collect::<Vec<_>>();

        let mut outcome = MultiChainBalance {
            balances: Vec::new(),
            errors: Vec::new(),
        };
        for (chain_id, result) in join_all(reads).await {
            match result {
                Ok(balance) => outcome.balances.push(balance),
                Err(err) if fail_fast => return Err(err),
                Err(err) => outcome.errors.push((chain_id, err)),
            }
        }
        Ok(outcome)
    }

    /// Read many `(address, chain)` pairs, windowed per chain.
    ///
    /// Each result is positional: `results[i]` answers `requests[i]`.
    pub async fn get_batch_balances(
        &self,
        requests: &[BalanceRequest],
    ) -> Vec<Result<Balance>> {
        let reads = requests.iter().map(|request| self.one_batched(request));
        join_all(reads).await
    }

    async fn one_batched(&self, request: &BalanceRequest) -> Result<Balance> {
        if !self.settings.batch_enabled {
            return self
                .get_balance(&request.address, request.chain_id, BalanceOptions::default())
                .await;
        }

        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let address = match parse_address(&request.address) {
            Ok(address) => address,
            Err(err) => {
                self.failed_requests.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        };

        let key = self.balance_key(request.chain_id, address);
        if self.settings.cache_enabled {
            if let Some(balance) = self.cache.get(&key) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(balance);
            }
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }

        let batcher = match self.batcher(request.chain_id) {
            Ok(batcher) => batcher,
            Err(err) => {
                self.failed_requests.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        };
        self.batched_requests.fetch_add(1, Ordering::Relaxed);
        let result = batcher.add(address).await;
        if result.is_err() {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn batcher(&self, chain_id: u64) -> Result<BatchProcessor<Address, Balance>> {
        if let Some(batcher) = self.batchers.get(&chain_id) {
            return Ok(batcher.clone());
        }
        let adapter = self.adapter(chain_id)?;
        let cache = Arc::clone(&self.cache);
        let cache_enabled = self.settings.cache_enabled;
        let ttl = self.settings.cache_ttl();
        let environment = {
            let cache = Arc::clone(&self.cache);
            move |address: Address| {
                let address = address.to_string().to_lowercase();
                cache.generate_key(&["getBalance", &chain_id.to_string(), &address])
            }
        };

        let batcher = BatchProcessor::new(
            BatchConfig {
                window: self.settings.batch_window(),
                max_size: self.settings.batch_max_size,
                auto_flush: true,
            },
            move |addresses: Vec<Address>| {
                let adapter = Arc::clone(&adapter);
                let cache = Arc::clone(&cache);
                let environment = environment.clone();
                async move {
                    debug!(chain_id, count = addresses.len(), "Fetching balance batch");
                    let mut results = Vec::with_capacity(addresses.len());
                    for address in addresses {
                        // The adapter has no server-side batch call; one
                        // failure fails the batch so positions stay honest.
                        let balance = adapter
                            .get_balance(address)
                            .await
                            .map_err(|err| err.with_chain(chain_id))?;
                        if cache_enabled {
                            cache.set_with_ttl(environment(address), balance.clone(), ttl);
                        }
                        results.push(balance);
                    }
                    Ok(results)
                }
            },
        );
        self.batchers.insert(chain_id, batcher.clone());
        Ok(batcher)
    }

    // ───────────────────────────────────────────────────────────────────────────
    // SUBSCRIPTIONS
    // ───────────────────────────────────────────────────────────────────────────

    /// Delegate a push subscription to the chain's adapter.
    ///
    /// # Errors
    ///
    /// Validation errors, or the adapter's subscribe failure.
    pub async fn subscribe_to_balance(
        &self,
        address: &str,
        chain_id: u64,
        callback: BalanceCallback,
    ) -> Result<BalanceSubscription> {
        let address = parse_address(address)?;
        let adapter = self.adapter(chain_id)?;
        let unsubscribe = adapter.subscribe_to_balance(address, callback).await?;

        let id = self.next_subscription_id.fetch_add(1, Ordering::SeqCst);
        #[allow(clippy::unwrap_used)]
        self.subscriptions.lock().unwrap().insert(id, unsubscribe);
        Ok(BalanceSubscription { id })
    }

    /// Tear down one adapter subscription. Idempotent.
    pub fn unsubscribe(&self, subscription: BalanceSubscription) {
        #[allow(clippy::unwrap_used)]
        let unsubscribe = self.subscriptions.lock().unwrap().remove(&subscription.id);
        if let Some(unsubscribe) = unsubscribe {
            unsubscribe();
        }
    }

    // ───────────────────────────────────────────────────────────────────────────
    // INVALIDATION & LIFECYCLE
    // ───────────────────────────────────────────────────────────────────────────

    /// Drop cached balances for an address; with `token`, only that token.
    pub fn invalidate_cache(&self, address: &str, chain_id: u64, token: Option<Address>) {
        let Ok(address) = parse_address(address) else {
            return;
        };
        match token {
            Some(token) => {
                self.cache.delete(&self.token_key(chain_id, address, token));
            }
            None => {
                let native = self.balance_key(chain_id, address);
                let token_prefix = {
                    let address = address.to_string().to_lowercase();
                    self.cache.generate_key(&[
                        "getTokenBalance",
                        &chain_id.to_string(),
                        &address,
                    ])
                };
                self.cache
                    .delete_matching(|key| key == native || key.starts_with(&token_prefix));
            }
        }
    }

    /// Drop every cached balance.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Point-in-time statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> BalanceServiceStats {
        BalanceServiceStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            batched_requests: self.batched_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            #[allow(clippy::unwrap_used)]
            active_subscriptions: self.subscriptions.lock().unwrap().len(),
        }
    }

    /// Coalescer statistics (for observability and tests).
    #[must_use]
    pub fn coalescer_stats(&self) -> rpc_guard::CoalescerStats {
        self.coalescer.stats()
    }

    /// Tear down children bottom-up. Idempotent.
    pub fn destroy(&self) {
        for entry in &self.batchers {
            entry.value().destroy();
        }
        self.batchers.clear();
        self.coalescer.destroy();
        self.token_list_coalescer.destroy();
        self.cache.destroy();

        #[allow(clippy::unwrap_used)]
        let subscriptions: Vec<Unsubscribe> = {
            let mut map = self.subscriptions.lock().unwrap();
            map.drain().map(|(_, unsubscribe)| unsubscribe).collect()
        };
        for unsubscribe in subscriptions {
            unsubscribe();
        }
        if !self.adapters.is_empty() {
            warn!("Balance service destroyed with adapters still registered");
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
