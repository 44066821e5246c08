//! Resilience and delivery primitives for unreliable RPC endpoint fleets.
//!
//! This crate is the dependable middle of an RPC integration stack: it
//! decides *when* a call is made, *how often*, with *what isolation*, and
//! *who shares the answer*. It knows nothing about chains or wire formats -
//! those live in the adapter crate above it.
//!
//! # Overview
//!
//! | Primitive | Guards against |
//! |-----------|----------------|
//! | [`TtlCache`] | Repeating answered questions |
//! | [`RequestCoalescer`] | Concurrent duplicate questions |
//! | [`BatchProcessor`] | Per-request overhead on hot paths |
//! | [`ConnectionPool`] | Connection churn and dead sockets |
//! | [`TokenBucket`] | Provider rate limits |
//! | [`TimeoutManager`] | Unbounded waits |
//! | [`CircuitBreaker`] | Hammering a failing dependency |
//! | [`RetryPolicy`] | Transient failures |
//! | [`FallbackChain`] / [`RpcFallbackChain`] | Single-provider outages |
//! | [`Bulkhead`] | One workload starving the rest |
//!
//! # Composition
//!
//! The primitives are built to nest. A typical read path:
//!
//! ```text
//! cache -> coalescer -> breaker( retry( adapter call ) ) -> rpc chain
//! ```
//!
//! Every error anywhere in the stack is an [`RpcError`], so classification
//! (retriable or not, and how long to wait) happens exactly once.
//!
//! # Lifecycle
//!
//! Long-lived primitives own their background tasks and expose `destroy()`:
//! timers are cancelled, pending work is rejected with a clear reason, and
//! calling it twice is safe.

// ═══════════════════════════════════════════════════════════════════════════════
// MODULES
// ═══════════════════════════════════════════════════════════════════════════════

pub mod batch;
pub mod bulkhead;
pub mod cache;
pub mod circuit_breaker;
pub mod coalescer;
pub mod error;
pub mod fallback;
pub mod pool;
pub mod rate_limiter;
pub mod retry;
pub mod rpc_chain;
pub mod timeout;

// ═══════════════════════════════════════════════════════════════════════════════
// RE-EXPORTS
// ═══════════════════════════════════════════════════════════════════════════════

// Primary types - what most users need
pub use batch::{BatchConfig, BatchProcessor, BatchStats};
pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadStats};
pub use cache::{CacheConfig, CacheEntry, CacheStats, TtlCache};
pub use circuit_breaker::{BreakerConfig, BreakerStats, CircuitBreaker, CircuitState};
pub use coalescer::{CoalescerStats, RequestCoalescer, coalesce_key};
pub use error::{ConnectionKind, DEFAULT_RETRIABLE_CODES, ErrorKind, Result, RpcError};
pub use fallback::{FallbackChain, FallbackOutcome, FallbackStrategy};
pub use pool::{ConnectionFactory, ConnectionPool, PoolConfig, PoolStats, SelectionStrategy};
pub use rate_limiter::{RateLimiterConfig, RateLimiterStats, TokenBucket};
pub use retry::{OnRetry, RetryConfig, RetryPolicy, RetryStats};
pub use rpc_chain::{EndpointStats, RpcChainConfig, RpcEndpoint, RpcFallbackChain, RpcOutcome};
pub use timeout::{TimeoutConfig, TimeoutLevel, TimeoutManager};

// ═══════════════════════════════════════════════════════════════════════════════
// PRELUDE
// ═══════════════════════════════════════════════════════════════════════════════

/// Convenience re-exports for common use.
///
/// # Usage
///
/// ```ignore
/// use rpc_guard::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Result, RpcError};
    pub use crate::{
        BatchProcessor, Bulkhead, CircuitBreaker, CircuitState, FallbackChain, RequestCoalescer,
        RetryPolicy, RpcFallbackChain, TimeoutLevel, TimeoutManager, TokenBucket, TtlCache,
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
