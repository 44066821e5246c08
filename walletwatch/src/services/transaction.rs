//! Transaction history with filtering, pagination, and caching.
//!
//! The adapter returns raw history; this service caches it per query shape,
//! applies the local filters (kinds, statuses, date range, pending), and
//! paginates. Subscriptions wrap the adapter's push callback with the same
//! filters, so a consumer that asked for confirmed token transfers never
//! sees anything else.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use evm_adapter::traits::{ChainAdapter, TransactionCallback, Unsubscribe};
use evm_adapter::types::{
    Transaction, TransactionKind, TransactionQuery, TransactionStatus, parse_address,
};
use rpc_guard::{CircuitBreaker, Result, RetryPolicy, RpcError, TtlCache};
use tracing::instrument;

use crate::config::{BreakerSettings, Settings, TransactionSettings};

// ═══════════════════════════════════════════════════════════════════════════════
// QUERY & PAGE
// ═══════════════════════════════════════════════════════════════════════════════

/// Options for one history read.
#[derive(Debug, Clone)]
pub struct TransactionPageRequest {
    /// Filter applied to the fetched history.
    pub query: TransactionQuery,
    /// 1-based page number.
    pub page: usize,
    /// Items per page.
    pub page_size: usize,
    /// Skip the cache probe.
    pub force_fresh: bool,
}

impl Default for TransactionPageRequest {
    fn default() -> Self {
        Self {
            query: TransactionQuery::default(),
            page: 1,
            page_size: 20,
            force_fresh: false,
        }
    }
}

/// One page of filtered history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    /// The page's items.
    pub items: Vec<T>,
    /// 1-based page number.
    pub page: usize,
    /// Requested page size.
    pub page_size: usize,
    /// Total items across all pages after filtering.
    pub total: usize,
    /// Total pages after filtering.
    pub total_pages: usize,
    /// Whether later pages exist.
    pub has_more: bool,
}

/// Options for a filtered subscription.
#[derive(Debug, Clone, Default)]
pub struct TransactionSubscriptionOptions {
    /// Deliver only these kinds; `None` delivers every kind.
    pub kinds: Option<Vec<TransactionKind>>,
    /// Deliver pending transactions too.
    pub include_pending: bool,
}

/// Handle for one adapter-level transaction subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionSubscription {
    id: u64,
}

/// Point-in-time service statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionServiceStats {
    /// Every read entering the service.
    pub total_requests: u64,
    /// Reads served from cache.
    pub cache_hits: u64,
    /// Reads that had to fetch.
    pub cache_misses: u64,
    /// Reads that ultimately failed.
    pub failed_requests: u64,
    /// Live adapter-level subscriptions.
    pub active_subscriptions: usize,
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRANSACTION SERVICE
// ═══════════════════════════════════════════════════════════════════════════════

/// Filtered, paginated, cached transaction reads.
pub struct TransactionService {
    settings: TransactionSettings,
    breaker_settings: BreakerSettings,
    retry: Arc<RetryPolicy>,
    retry_enabled: bool,
    breaker_enabled: bool,
    adapters: DashMap<u64, Arc<dyn ChainAdapter>>,
    breakers: DashMap<u64, Arc<CircuitBreaker>>,
    cache: Arc<TtlCache<Vec<Transaction>>>,
    total_requests: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    failed_requests: AtomicU64,
    subscriptions: Mutex<HashMap<u64, Unsubscribe>>,
    next_subscription_id: AtomicU64,
}

impl std::fmt::Debug for TransactionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionService")
            .field("chains", &self.adapters.len())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl TransactionService {
    /// Build the service from settings.
    ///
    /// # Errors
    ///
    /// Fails when the retry settings do not validate.
    pub fn new(settings: &Settings) -> Result<Self> {
        Ok(Self {
            settings: settings.transaction.clone(),
            breaker_settings: settings.breaker.clone(),
            retry: Arc::new(RetryPolicy::new(settings.retry.to_config())?),
            retry_enabled: settings.transaction.retry_enabled,
            breaker_enabled: settings.transaction.breaker_enabled,
            adapters: DashMap::new(),
            breakers: DashMap::new(),
            cache: Arc::new(TtlCache::with_config(rpc_guard::CacheConfig {
                default_ttl: settings.transaction.cache_ttl(),
                ..settings.cache.to_config()
            })),
            total_requests: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
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
                    self.breaker_settings.to_config(format!("transactions:{chain_id}")),
                ))
            })
            .clone()
    }

    /// Read one filtered, paginated history page.
    ///
    /// # Errors
    ///
    /// Validation errors for bad addresses or page parameters; otherwise
    /// the guarded fetch outcome.
    #[instrument(skip(self, request))]
    pub async fn get_transactions(
        &self,
        address: &str,
        chain_id: u64,
        request: TransactionPageRequest,
    ) -> Result<Page<Transaction>> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let result = self.fetch_filtered(address, chain_id, &request).await;
        match result {
            Ok(filtered) => Ok(paginate(filtered, request.page, request.page_size)),
            Err(err) => {
                self.failed_requests.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    async fn fetch_filtered(
        &self,
        address: &str,
        chain_id: u64,
        request: &TransactionPageRequest,
    ) -> Result<Vec<Transaction>> {
        let address = parse_address(address)?;
        if request.page == 0 {
            return Err(RpcError::validation("page", ">= 1", "0"));
        }
        if request.page_size == 0 || request.page_size > self.settings.max_page_size {
            return Err(RpcError::validation(
                "page_size",
                format!("within [1, {}]", self.settings.max_page_size),
                request.page_size.to_string(),
            ));
        }

        let query_json =
            serde_json::to_string(&request.query).unwrap_or_else(|_| "{}".into());
        let key = self.cache.generate_key(&[
            "getTransactions",
            &chain_id.to_string(),
            &address.to_string().to_lowercase(),
            &query_json,
        ]);

        let history = if request.force_fresh {
            None
        } else {
            self.cache.get(&key)
        };
        let history = if let Some(history) = history {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            history
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
            let adapter = self.adapter(chain_id)?;
            let query = request.query.clone();
            let fetch = move || {
                let adapter = Arc::clone(&adapter);
                let query = query.clone();
                async move { adapter.get_transactions(address, Some(&query)).await }
            };
            let retry = Arc::clone(&self.retry);
            let retry_enabled = self.retry_enabled;
            let run = || async {
                if retry_enabled {
                    retry.execute(&fetch).await
                } else {
                    fetch().await
                }
            };
            let history = if self.breaker_enabled {
                self.breaker(chain_id).execute(run).await
            } else {
                run().await
            }
            .map_err(|err| err.with_chain(chain_id))?;

            self.cache.set(key, history.clone());
            history
        };

        Ok(history
            .into_iter()
            .filter(|tx| request.query.matches(tx))
            .collect())
    }

    /// Push new transactions, filtered per the subscription options.
    ///
    /// # Errors
    ///
    /// Validation errors, or the adapter's subscribe failure.
    pub async fn subscribe_to_transactions(
        &self,
        address: &str,
        chain_id: u64,
        callback: TransactionCallback,
        options: TransactionSubscriptionOptions,
    ) -> Result<TransactionSubscription> {
        let address = parse_address(address)?;
        let adapter = self.adapter(chain_id)?;

        let filtered: TransactionCallback = Arc::new(move |tx: Transaction| {
            if !options.include_pending && tx.status == TransactionStatus::Pending {
                return;
            }
            if let Some(kinds) = &options.kinds {
                if !kinds.contains(&tx.kind) {
                    return;
                }
            }
            callback(tx);
        });

        let unsubscribe = adapter.subscribe_to_transactions(address, filtered).await?;
        let id = self.next_subscription_id.fetch_add(1, Ordering::SeqCst);
        #[allow(clippy::unwrap_used)]
        self.subscriptions.lock().unwrap().insert(id, unsubscribe);
        Ok(TransactionSubscription { id })
    }

    /// Tear down one subscription. Idempotent.
    pub fn unsubscribe(&self, subscription: TransactionSubscription) {
        #[allow(clippy::unwrap_used)]
        let unsubscribe = self.subscriptions.lock().unwrap().remove(&subscription.id);
        if let Some(unsubscribe) = unsubscribe {
            unsubscribe();
        }
    }

    /// Drop every cached history.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Point-in-time statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> TransactionServiceStats {
        TransactionServiceStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            #[allow(clippy::unwrap_used)]
            active_subscriptions: self.subscriptions.lock().unwrap().len(),
        }
    }

    /// Tear down caches and subscriptions. Idempotent.
    pub fn destroy(&self) {
        self.cache.destroy();
        #[allow(clippy::unwrap_used)]
        let subscriptions: Vec<Unsubscribe> = {
            let mut map = self.subscriptions.lock().unwrap();
            map.drain().map(|(_, unsubscribe)| unsubscribe).collect()
        };
        for unsubscribe in subscriptions {
            unsubscribe();
        }
    }
}

/// Slice `items` into the requested page.
fn paginate<T>(items: Vec<T>, page: usize, page_size: usize) -> Page<T> {
    let total = items.len();
    let total_pages = total.div_ceil(page_size);
    let start = (page - 1).saturating_mul(page_size);
    let page_items: Vec<T> = items
        .into_iter()
        .skip(start)
        .take(page_size)
        .collect();
    Page {
        has_more: page < total_pages,
        items: page_items,
        page,
        page_size,
        total,
        total_pages,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use alloy::primitives::{Address, TxHash, U256};
    use chrono::{DateTime, Utc};
    use evm_adapter::MockAdapter;

    use super::*;

    const ADDR: &str = "0x1111111111111111111111111111111111111111";

    fn addr() -> Address {
        parse_address(ADDR).unwrap()
    }

    fn tx(index: u8, status: TransactionStatus, kind: TransactionKind) -> Transaction {
        Transaction {
            hash: TxHash::from([index; 32]),
            chain_id: 1,
            from: addr(),
            to: Some(Address::from_slice(&[0x22; 20])),
            value: U256::from(u64::from(index)),
            block_number: Some(100 + u64::from(index)),
            timestamp: DateTime::<Utc>::from_timestamp(1_700_000_000 + i64::from(index), 0),
            status,
            kind,
            fee: None,
            token_address: None,
        }
    }

    fn service_with_history(history: Vec<Transaction>) -> (Arc<MockAdapter>, TransactionService) {
        let adapter = Arc::new(MockAdapter::new(1));
        adapter.set_transactions(addr(), history);
        let mut settings = Settings::default();
        settings.retry.base_delay_ms = 1;
        settings.retry.jitter_factor = 0.0;
        let service = TransactionService::new(&settings).unwrap();
        service.register_adapter(1, Arc::clone(&adapter) as Arc<dyn ChainAdapter>);
        (adapter, service)
    }

    fn confirmed(n: u8) -> Vec<Transaction> {
        (0..n)
            .map(|i| tx(i, TransactionStatus::Confirmed, TransactionKind::Native))
            .collect()
    }

    #[tokio::test]
    async fn pagination_math_is_correct() {
        let (_, service) = service_with_history(confirmed(25));

        let page = service
            .get_transactions(
                ADDR,
                1,
                TransactionPageRequest {
                    page: 2,
                    page_size: 10,
                    ..TransactionPageRequest::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(page.items.len(), 10);
        assert_eq!(page.page, 2);
        assert_eq!(page.total, 25);
        assert_eq!(page.total_pages, 3);
        assert!(page.has_more);

        let last = service
            .get_transactions(
                ADDR,
                1,
                TransactionPageRequest {
                    page: 3,
                    page_size: 10,
                    ..TransactionPageRequest::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(last.items.len(), 5);
        assert!(!last.has_more);
    }

    #[tokio::test]
    async fn page_past_the_end_is_empty() {
        let (_, service) = service_with_history(confirmed(3));
        let page = service
            .get_transactions(
                ADDR,
                1,
                TransactionPageRequest {
                    page: 5,
                    page_size: 10,
                    ..TransactionPageRequest::default()
                },
            )
            .await
            .unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.total, 3);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn page_parameters_are_validated() {
        let (_, service) = service_with_history(confirmed(3));

        let err = service
            .get_transactions(
                ADDR,
                1,
                TransactionPageRequest {
                    page: 0,
                    ..TransactionPageRequest::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");

        let err = service
            .get_transactions(
                ADDR,
                1,
                TransactionPageRequest {
                    page_size: 10_000,
                    ..TransactionPageRequest::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
        assert_eq!(service.stats().failed_requests, 2);
    }

    #[tokio::test]
    async fn filters_apply_before_pagination() {
        let history = vec![
            tx(0, TransactionStatus::Confirmed, TransactionKind::Native),
            tx(1, TransactionStatus::Pending, TransactionKind::Native),
            tx(2, TransactionStatus::Confirmed, TransactionKind::Token),
            tx(3, TransactionStatus::Failed, TransactionKind::Native),
        ];
        let (_, service) = service_with_history(history);

        let page = service
            .get_transactions(
                ADDR,
                1,
                TransactionPageRequest {
                    query: TransactionQuery {
                        statuses: Some(vec![TransactionStatus::Confirmed]),
                        kinds: Some(vec![TransactionKind::Native]),
                        ..TransactionQuery::default()
                    },
                    ..TransactionPageRequest::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].hash, TxHash::from([0; 32]));
    }

    #[tokio::test]
    async fn repeated_queries_hit_the_cache() {
        let (adapter, service) = service_with_history(confirmed(5));

        let request = TransactionPageRequest::default();
        service.get_transactions(ADDR, 1, request.clone()).await.unwrap();
        service.get_transactions(ADDR, 1, request.clone()).await.unwrap();
        assert_eq!(adapter.call_count("get_transactions"), 1);

        // A different filter shape is a different cache entry.
        let other = TransactionPageRequest {
            query: TransactionQuery {
                exclude_pending: true,
                ..TransactionQuery::default()
            },
            ..TransactionPageRequest::default()
        };
        service.get_transactions(ADDR, 1, other).await.unwrap();
        assert_eq!(adapter.call_count("get_transactions"), 2);

        let stats = service.stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 2);
    }

    #[tokio::test]
    async fn force_fresh_refetches() {
        let (adapter, service) = service_with_history(confirmed(5));
        let request = TransactionPageRequest::default();
        service.get_transactions(ADDR, 1, request.clone()).await.unwrap();

        let fresh = TransactionPageRequest {
            force_fresh: true,
            ..TransactionPageRequest::default()
        };
        service.get_transactions(ADDR, 1, fresh).await.unwrap();
        assert_eq!(adapter.call_count("get_transactions"), 2);
    }

    #[tokio::test]
    async fn subscription_filters_kind_and_pending() {
        let (adapter, service) = service_with_history(Vec::new());
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);

        let subscription = service
            .subscribe_to_transactions(
                ADDR,
                1,
                Arc::new(move |tx| sink.lock().unwrap().push(tx.hash)),
                TransactionSubscriptionOptions {
                    kinds: Some(vec![TransactionKind::Token]),
                    include_pending: false,
                },
            )
            .await
            .unwrap();

        adapter.push_transaction(&tx(1, TransactionStatus::Confirmed, TransactionKind::Token));
        adapter.push_transaction(&tx(2, TransactionStatus::Pending, TransactionKind::Token));
        adapter.push_transaction(&tx(3, TransactionStatus::Confirmed, TransactionKind::Native));

        assert_eq!(*received.lock().unwrap(), vec![TxHash::from([1; 32])]);

        service.unsubscribe(subscription);
        assert_eq!(service.stats().active_subscriptions, 0);
    }

    #[tokio::test]
    async fn adapter_failures_are_counted() {
        let (adapter, service) = service_with_history(confirmed(2));
        adapter.fail_next_calls(10, RpcError::timeout("down"));

        let err = service
            .get_transactions(ADDR, 1, TransactionPageRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TIMEOUT");
        assert_eq!(service.stats().failed_requests, 1);
    }
}
