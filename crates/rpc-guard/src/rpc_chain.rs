//! Priority-ordered RPC endpoint fallback with a breaker per endpoint.
//!
//! Endpoints are tried in ascending priority order. Each endpoint owns its
//! own [`CircuitBreaker`], so one misbehaving provider is isolated without
//! dragging down the rest of the chain: while its circuit is open the
//! endpoint is skipped outright (the operation is never invoked against it),
//! and the breaker's own half-open probing brings it back.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::circuit_breaker::{BreakerConfig, CircuitBreaker, CircuitState};
use crate::error::{ErrorKind, Result, RpcError};

// ═══════════════════════════════════════════════════════════════════════════════
// CONFIG
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-endpoint breaker tuning for the chain.
#[derive(Debug, Clone)]
pub struct RpcChainConfig {
    /// Failures before an endpoint's circuit opens.
    pub failure_threshold: u64,
    /// How long an opened endpoint is skipped before probing.
    pub circuit_timeout: Duration,
}

impl Default for RpcChainConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            circuit_timeout: Duration::from_secs(30),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENDPOINT
// ═══════════════════════════════════════════════════════════════════════════════

/// One endpoint in the chain, wrapped in its own breaker.
pub struct RpcEndpoint<C> {
    /// Endpoint URL (identification and logging; the client does the I/O).
    pub url: String,
    /// Lower is tried first.
    pub priority: u32,
    client: C,
    breaker: CircuitBreaker,
    successes: AtomicU64,
    failures: AtomicU64,
    last_used_at: std::sync::Mutex<Option<Instant>>,
}

impl<C> std::fmt::Debug for RpcEndpoint<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcEndpoint")
            .field("url", &self.url)
            .field("priority", &self.priority)
            .field("circuit", &self.breaker.state())
            .finish_non_exhaustive()
    }
}

/// Snapshot of one endpoint's health.
#[derive(Debug, Clone)]
pub struct EndpointStats {
    /// Endpoint URL.
    pub url: String,
    /// Configured priority.
    pub priority: u32,
    /// Successful calls.
    pub successes: u64,
    /// Failed calls.
    pub failures: u64,
    /// Current breaker state.
    pub circuit_state: CircuitState,
    /// Time since the endpoint last served a successful call.
    pub last_used_age: Option<Duration>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// OUTCOME
// ═══════════════════════════════════════════════════════════════════════════════

/// How a chain execution resolved.
#[derive(Debug, Clone)]
pub struct RpcOutcome<T> {
    /// The successful value.
    pub value: T,
    /// URL of the endpoint that served it.
    pub endpoint_url: String,
    /// Errors from endpoints tried (or skipped open) before the win.
    pub errors: Vec<RpcError>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// CHAIN
// ═══════════════════════════════════════════════════════════════════════════════

/// Priority-ordered endpoints, each behind its own circuit breaker.
#[derive(Debug)]
pub struct RpcFallbackChain<C> {
    chain_id: u64,
    endpoints: Vec<Arc<RpcEndpoint<C>>>,
}

impl<C> RpcFallbackChain<C> {
    /// Build a chain from `(url, priority, client)` triples.
    ///
    /// Endpoints are sorted ascending by priority; ties keep insertion
    /// order.
    ///
    /// # Errors
    ///
    /// An empty endpoint set is a validation error.
    pub fn new(
        chain_id: u64,
        endpoints: Vec<(String, u32, C)>,
        config: &RpcChainConfig,
    ) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(RpcError::validation(
                "endpoints",
                "at least one RPC endpoint",
                "empty set",
            )
            .with_chain(chain_id));
        }

        let mut endpoints: Vec<Arc<RpcEndpoint<C>>> = endpoints
            .into_iter()
            .map(|(url, priority, client)| {
                let breaker = CircuitBreaker::new(BreakerConfig {
                    failure_threshold: config.failure_threshold,
                    timeout: config.circuit_timeout,
                    // Endpoint circuits judge every call: a fallback chain
                    // cannot wait for volume before isolating a bad provider.
                    volume_threshold: 1,
                    ..BreakerConfig::named(format!("endpoint:{url}"))
                });
                Arc::new(RpcEndpoint {
                    url,
                    priority,
                    client,
                    breaker,
                    successes: AtomicU64::new(0),
                    failures: AtomicU64::new(0),
                    last_used_at: std::sync::Mutex::new(None),
                })
            })
            .collect();
        endpoints.sort_by_key(|e| e.priority);

        Ok(Self { chain_id, endpoints })
    }

    /// Run `op` against the first healthy endpoint.
    ///
    /// Endpoints with an open circuit are skipped without invoking `op`;
    /// the skip is recorded in the outcome's error list.
    ///
    /// # Errors
    ///
    /// When every endpoint fails or is skipped, fails with
    /// `AllEndpointsFailed` aggregating each endpoint's error.
    pub async fn execute<T>(
        &self,
        op: impl for<'a> Fn(&'a C) -> BoxFuture<'a, Result<T>>,
    ) -> Result<RpcOutcome<T>> {
        let mut errors: Vec<RpcError> = Vec::new();

        for endpoint in &self.endpoints {
            let result = endpoint
                .breaker
                .execute(|| op(&endpoint.client))
                .await;

            match result {
                Ok(value) => {
                    endpoint.successes.fetch_add(1, Ordering::Relaxed);
                    #[allow(clippy::unwrap_used)]
                    {
                        *endpoint.last_used_at.lock().unwrap() = Some(Instant::now());
                    }
                    debug!(url = %endpoint.url, "RPC endpoint served request");
                    return Ok(RpcOutcome {
                        value,
                        endpoint_url: endpoint.url.clone(),
                        errors,
                    });
                }
                Err(err) => {
                    if matches!(err.kind(), ErrorKind::CircuitOpen { .. }) {
                        // Open circuit: op was never invoked, move on.
                        debug!(url = %endpoint.url, "Skipping endpoint with open circuit");
                    } else {
                        endpoint.failures.fetch_add(1, Ordering::Relaxed);
                        warn!(url = %endpoint.url, error = %err, "RPC endpoint failed");
                    }
                    errors.push(err.with_context("endpoint", endpoint.url.clone()));
                }
            }
        }

        Err(RpcError::all_endpoints_failed(self.chain_id, errors))
    }

    /// Health snapshot for every endpoint, in priority order.
    #[must_use]
    pub fn endpoint_stats(&self) -> Vec<EndpointStats> {
        self.endpoints
            .iter()
            .map(|e| EndpointStats {
                url: e.url.clone(),
                priority: e.priority,
                successes: e.successes.load(Ordering::Relaxed),
                failures: e.failures.load(Ordering::Relaxed),
                circuit_state: e.breaker.state(),
                #[allow(clippy::unwrap_used)]
                last_used_age: e.last_used_at.lock().unwrap().map(|at| at.elapsed()),
            })
            .collect()
    }

    /// The chain this endpoint set serves.
    #[must_use]
    pub const fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Number of configured endpoints.
    #[must_use]
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
