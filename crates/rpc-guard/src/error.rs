//! Shared error taxonomy for the resilience stack.
//!
//! Every component in this crate (and the adapter boundary above it) speaks
//! one error type, [`RpcError`]: a kind, a stable string code, a retriability
//! flag derived from the kind, a structured context map, and an optional
//! shared source. Domain errors are lifted into this taxonomy exactly once,
//! at the adapter boundary; the retry policy, circuit breakers, and fallback
//! chains all branch on [`RpcError::is_retriable`] and [`RpcError::code`].
//!
//! # Error Philosophy
//!
//! - Connection-family and rate-limit errors are transient and retriable
//! - Validation and data errors are programmer/provider bugs, never retried
//! - `CircuitOpen` is retriable only after its `reset_at` hint
//! - Unknown errors are non-retriable unless their code is explicitly
//!   allow-listed by the caller's retry configuration
//!
//! Context values are serialized with sensitive keys redacted, so errors can
//! be logged or shipped without leaking credentials.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::ser::{Serialize, SerializeStruct, Serializer};
use serde_json::Value;
use thiserror::Error;

/// Result type alias using [`RpcError`].
pub type Result<T> = std::result::Result<T, RpcError>;

// ═══════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Context keys matching this pattern are replaced with `[REDACTED]` when an
/// error is serialized.
static REDACTED_KEYS: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)] // pattern is a compile-time constant
    let redacted = Regex::new(r"(?i)api[_-]?key|secret|private|password|token|authorization")
        .unwrap();
    redacted
});

/// Error codes retried by default: the connection family plus rate limiting.
pub const DEFAULT_RETRIABLE_CODES: [&str; 6] = [
    "TIMEOUT",
    "REFUSED",
    "RESET",
    "DNS_FAILED",
    "UNKNOWN",
    "RATE_LIMIT",
];

/// Maximum length of the `received` field on validation errors.
///
/// Longer inputs are truncated so oversized or hostile payloads never end up
/// in logs verbatim.
const VALIDATION_RECEIVED_MAX: usize = 64;

// ═══════════════════════════════════════════════════════════════════════════════
// ERROR KINDS
// ═══════════════════════════════════════════════════════════════════════════════

/// Subtype of a connection-family failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ConnectionKind {
    /// The operation did not complete within its deadline.
    Timeout,
    /// The remote actively refused the connection.
    Refused,
    /// The connection was reset mid-flight.
    Reset,
    /// Hostname resolution failed.
    DnsFailed,
    /// Connection-level failure that fits no other subtype.
    Unknown,
}

impl ConnectionKind {
    /// Stable string code for this subtype.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::Refused => "REFUSED",
            Self::Reset => "RESET",
            Self::DnsFailed => "DNS_FAILED",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// The classified failure carried by an [`RpcError`].
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Transient transport failure (timeout, refused, reset, DNS).
    #[error("connection error ({}): {message}", kind.code())]
    Connection {
        /// Connection failure subtype.
        kind: ConnectionKind,
        /// Human-readable detail.
        message: String,
    },

    /// The provider told us to back off.
    #[error("rate limited by {provider}: limit {limit} per {period_secs}s")]
    RateLimited {
        /// When the limit window resets.
        reset_at: DateTime<Utc>,
        /// Requests allowed per period.
        limit: u32,
        /// Period length in seconds.
        period_secs: u64,
        /// Which provider imposed the limit.
        provider: String,
    },

    /// Caller-supplied input failed validation. Never retried.
    #[error("validation failed for {field}: expected {expected}, got {received}")]
    Validation {
        /// The field that failed validation.
        field: String,
        /// What was expected.
        expected: String,
        /// What was received (truncated).
        received: String,
    },

    /// External data violated its schema or format. Never retried.
    #[error("data error: {0}")]
    Data(String),

    /// A circuit breaker refused the call without attempting it.
    #[error("circuit '{circuit}' is open ({failure_count} failures)")]
    CircuitOpen {
        /// Name of the open circuit.
        circuit: String,
        /// Earliest time a probe will be allowed through.
        reset_at: DateTime<Utc>,
        /// Failures recorded when the circuit opened.
        failure_count: u64,
    },

    /// Every pool connection is in use and the pool is at capacity.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// A bounded queue rejected new work.
    #[error("queue full for '{0}'")]
    QueueFull(String),

    /// Queued work timed out before a slot freed up.
    #[error("queued work timed out after {waited:?} in '{name}'")]
    QueueTimeout {
        /// Component whose queue timed out.
        name: String,
        /// How long the work waited.
        waited: Duration,
    },

    /// Work was rejected because its owner was cleared or destroyed.
    #[error("cancelled: {reason}")]
    Cancelled {
        /// Why the work was cancelled.
        reason: String,
    },

    /// A batch function returned the wrong number of results.
    #[error("batch processor returned {actual} results but expected {expected}")]
    BatchMismatch {
        /// Number of requests in the batch.
        expected: usize,
        /// Number of results returned.
        actual: usize,
    },

    /// Every endpoint in an RPC fallback chain failed.
    #[error("all RPC endpoints failed for chain {chain_id} ({} attempts)", attempts.len())]
    AllEndpointsFailed {
        /// Chain whose endpoints were exhausted.
        chain_id: u64,
        /// The error from each attempted endpoint, in attempt order.
        attempts: Vec<RpcError>,
    },

    /// Every strategy in a fallback chain failed.
    #[error("all fallback strategies failed ({} attempts)", attempts.len())]
    FallbackExhausted {
        /// `(strategy name, error)` per attempted strategy, in order.
        attempts: Vec<(String, RpcError)>,
    },

    /// Failure that fits no other category.
    #[error("{message}")]
    Other {
        /// Human-readable detail.
        message: String,
        /// Optional caller-assigned code, matched against configured
        /// retriable sets.
        code: Option<String>,
    },
}

// ═══════════════════════════════════════════════════════════════════════════════
// RPC ERROR
// ═══════════════════════════════════════════════════════════════════════════════

/// The taxonomy error used across the resilience stack.
///
/// Cheap to clone: the context map is small and the source is shared. Cloning
/// matters because coalesced callers all observe the same failure and the
/// retry policy accumulates per-attempt errors.
#[derive(Debug, Clone)]
pub struct RpcError {
    kind: ErrorKind,
    context: BTreeMap<String, Value>,
    chain_id: Option<u64>,
    timestamp: DateTime<Utc>,
    source: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.kind.fmt(f)
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|s| &**s as &(dyn std::error::Error + 'static))
    }
}

impl RpcError {
    fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: BTreeMap::new(),
            chain_id: None,
            timestamp: Utc::now(),
            source: None,
        }
    }

    // ───────────────────────────────────────────────────────────────────────────
    // CONSTRUCTORS
    // ───────────────────────────────────────────────────────────────────────────

    /// Connection-family error with an explicit subtype.
    #[must_use]
    pub fn connection(kind: ConnectionKind, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection {
            kind,
            message: message.into(),
        })
    }

    /// Shorthand for [`ConnectionKind::Timeout`].
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::connection(ConnectionKind::Timeout, message)
    }

    /// Rate-limit error with a reset hint.
    #[must_use]
    pub fn rate_limited(
        reset_at: DateTime<Utc>,
        limit: u32,
        period_secs: u64,
        provider: impl Into<String>,
    ) -> Self {
        Self::new(ErrorKind::RateLimited {
            reset_at,
            limit,
            period_secs,
            provider: provider.into(),
        })
    }

    /// Validation error. The `received` value is truncated before storage.
    #[must_use]
    pub fn validation(
        field: impl Into<String>,
        expected: impl Into<String>,
        received: impl Into<String>,
    ) -> Self {
        let mut received = received.into();
        if received.len() > VALIDATION_RECEIVED_MAX {
            received.truncate(VALIDATION_RECEIVED_MAX);
            received.push_str("...");
        }
        Self::new(ErrorKind::Validation {
            field: field.into(),
            expected: expected.into(),
            received,
        })
    }

    /// Schema/format violation from an external source.
    #[must_use]
    pub fn data(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Data(message.into()))
    }

    /// Fail-fast rejection from an open circuit breaker.
    #[must_use]
    pub fn circuit_open(
        circuit: impl Into<String>,
        reset_at: DateTime<Utc>,
        failure_count: u64,
    ) -> Self {
        Self::new(ErrorKind::CircuitOpen {
            circuit: circuit.into(),
            reset_at,
            failure_count,
        })
    }

    /// The connection pool is at capacity with nothing available.
    #[must_use]
    pub fn pool_exhausted() -> Self {
        Self::new(ErrorKind::PoolExhausted)
    }

    /// A bounded queue rejected new work.
    #[must_use]
    pub fn queue_full(name: impl Into<String>) -> Self {
        Self::new(ErrorKind::QueueFull(name.into()))
    }

    /// Queued work expired before it could run.
    #[must_use]
    pub fn queue_timeout(name: impl Into<String>, waited: Duration) -> Self {
        Self::new(ErrorKind::QueueTimeout {
            name: name.into(),
            waited,
        })
    }

    /// Work rejected because its owner was cleared or destroyed.
    #[must_use]
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled {
            reason: reason.into(),
        })
    }

    /// Batch function returned the wrong number of results.
    #[must_use]
    pub fn batch_mismatch(expected: usize, actual: usize) -> Self {
        Self::new(ErrorKind::BatchMismatch { expected, actual })
    }

    /// Every endpoint in a chain's fallback set failed.
    #[must_use]
    pub fn all_endpoints_failed(chain_id: u64, attempts: Vec<RpcError>) -> Self {
        Self::new(ErrorKind::AllEndpointsFailed { chain_id, attempts }).with_chain(chain_id)
    }

    /// Every strategy in a fallback chain failed.
    #[must_use]
    pub fn fallback_exhausted(attempts: Vec<(String, RpcError)>) -> Self {
        Self::new(ErrorKind::FallbackExhausted { attempts })
    }

    /// Uncategorized failure.
    #[must_use]
    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Other {
            message: message.into(),
            code: None,
        })
    }

    /// Uncategorized failure with a caller-assigned code.
    #[must_use]
    pub fn other_with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self::new(ErrorKind::Other {
            message: message.into(),
            code: Some(code.into()),
        })
    }

    // ───────────────────────────────────────────────────────────────────────────
    // BUILDERS
    // ───────────────────────────────────────────────────────────────────────────

    /// Attach the chain this error originated from.
    #[must_use]
    pub const fn with_chain(mut self, chain_id: u64) -> Self {
        self.chain_id = Some(chain_id);
        self
    }

    /// Attach a structured context value.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    // ───────────────────────────────────────────────────────────────────────────
    // ACCESSORS
    // ───────────────────────────────────────────────────────────────────────────

    /// The classified failure.
    #[must_use]
    pub const fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Stable string code, suitable for retriable-set matching.
    #[must_use]
    pub fn code(&self) -> &str {
        match &self.kind {
            ErrorKind::Connection { kind, .. } => kind.code(),
            ErrorKind::RateLimited { .. } => "RATE_LIMIT",
            ErrorKind::Validation { .. } => "VALIDATION",
            ErrorKind::Data(_) => "DATA",
            ErrorKind::CircuitOpen { .. } => "CIRCUIT_OPEN",
            ErrorKind::PoolExhausted => "POOL_EXHAUSTED",
            ErrorKind::QueueFull(_) => "QUEUE_FULL",
            ErrorKind::QueueTimeout { .. } => "QUEUE_TIMEOUT",
            ErrorKind::Cancelled { .. } => "CANCELLED",
            ErrorKind::BatchMismatch { .. } => "BATCH_MISMATCH",
            ErrorKind::AllEndpointsFailed { .. } => "ALL_ENDPOINTS_FAILED",
            ErrorKind::FallbackExhausted { .. } => "FALLBACK_EXHAUSTED",
            ErrorKind::Other { code, .. } => code.as_deref().unwrap_or("UNKNOWN_ERROR"),
        }
    }

    /// Whether this error is transient and worth retrying.
    ///
    /// Unknown (`Other`) errors report `false` here; retry policies may still
    /// retry them when their [`code`](Self::code) is in the configured set.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Connection { .. }
                | ErrorKind::RateLimited { .. }
                | ErrorKind::CircuitOpen { .. }
        )
    }

    /// How long the caller should wait before the error is worth retrying.
    ///
    /// Meaningful for rate-limit and circuit-open errors; zero for everything
    /// else (and for hints already in the past).
    #[must_use]
    pub fn wait_time(&self) -> Duration {
        let reset_at = match &self.kind {
            ErrorKind::RateLimited { reset_at, .. } | ErrorKind::CircuitOpen { reset_at, .. } => {
                *reset_at
            }
            _ => return Duration::ZERO,
        };
        (reset_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }

    /// The chain this error originated from, when known.
    #[must_use]
    pub const fn chain_id(&self) -> Option<u64> {
        self.chain_id
    }

    /// When the error was created.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// The structured context, with sensitive keys redacted.
    #[must_use]
    pub fn redacted_context(&self) -> BTreeMap<String, Value> {
        self.context
            .iter()
            .map(|(k, v)| {
                if REDACTED_KEYS.is_match(k) {
                    (k.clone(), Value::String("[REDACTED]".into()))
                } else {
                    (k.clone(), v.clone())
                }
            })
            .collect()
    }
}

// Serialized form carries the redacted context, never the raw one.
impl Serialize for RpcError {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("RpcError", 6)?;
        state.serialize_field("code", self.code())?;
        state.serialize_field("message", &self.to_string())?;
        state.serialize_field("retriable", &self.is_retriable())?;
        state.serialize_field("chain_id", &self.chain_id)?;
        state.serialize_field("timestamp", &self.timestamp)?;
        state.serialize_field("context", &self.redacted_context())?;
        state.end()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn connection_errors_are_retriable() {
        for kind in [
            ConnectionKind::Timeout,
            ConnectionKind::Refused,
            ConnectionKind::Reset,
            ConnectionKind::DnsFailed,
            ConnectionKind::Unknown,
        ] {
            let err = RpcError::connection(kind, "boom");
            assert!(err.is_retriable(), "{} should be retriable", err.code());
            assert!(DEFAULT_RETRIABLE_CODES.contains(&err.code()));
        }
    }

    #[test]
    fn validation_and_data_are_not_retriable() {
        assert!(!RpcError::validation("address", "0x-prefixed hex", "bogus").is_retriable());
        assert!(!RpcError::data("unexpected field").is_retriable());
    }

    #[test]
    fn unknown_errors_default_to_non_retriable() {
        let err = RpcError::other("weird transport hiccup");
        assert!(!err.is_retriable());
        assert_eq!(err.code(), "UNKNOWN_ERROR");

        let coded = RpcError::other_with_code("server said no", "SERVER_BUSY");
        assert_eq!(coded.code(), "SERVER_BUSY");
    }

    #[test]
    fn wait_time_respects_reset_hint() {
        let err = RpcError::rate_limited(
            Utc::now() + chrono::Duration::seconds(30),
            100,
            60,
            "infura",
        );
        let wait = err.wait_time();
        assert!(wait > Duration::from_secs(28) && wait <= Duration::from_secs(30));

        // A hint in the past clamps to zero.
        let stale = RpcError::rate_limited(
            Utc::now() - chrono::Duration::seconds(5),
            100,
            60,
            "infura",
        );
        assert_eq!(stale.wait_time(), Duration::ZERO);
    }

    #[test]
    fn circuit_open_carries_failure_count() {
        let err = RpcError::circuit_open("mainnet", Utc::now() + chrono::Duration::seconds(10), 7);
        assert!(err.is_retriable());
        assert_eq!(err.code(), "CIRCUIT_OPEN");
        assert!(err.to_string().contains("7 failures"));
    }

    #[test]
    fn validation_received_is_truncated() {
        let long = "x".repeat(500);
        let err = RpcError::validation("address", "0x-prefixed hex", long);
        match err.kind() {
            ErrorKind::Validation { received, .. } => {
                assert!(received.len() <= VALIDATION_RECEIVED_MAX + 3);
                assert!(received.ends_with("..."));
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn context_is_redacted_on_serialization() {
        let err = RpcError::other("auth failed")
            .with_context("api_key", "sk-super-secret")
            .with_context("apiKey", "also-secret")
            .with_context("Authorization", "Bearer abc")
            .with_context("endpoint", "https://rpc.example.com");

        let json = serde_json::to_value(&err).unwrap();
        let ctx = &json["context"];
        assert_eq!(ctx["api_key"], "[REDACTED]");
        assert_eq!(ctx["apiKey"], "[REDACTED]");
        assert_eq!(ctx["Authorization"], "[REDACTED]");
        assert_eq!(ctx["endpoint"], "https://rpc.example.com");
    }

    #[test]
    fn serialized_form_has_code_and_retriable() {
        let err = RpcError::timeout("no response in 5s").with_chain(137);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "TIMEOUT");
        assert_eq!(json["retriable"], true);
        assert_eq!(json["chain_id"], 137);
    }

    #[test]
    fn aggregated_errors_keep_every_attempt() {
        let attempts = vec![
            RpcError::timeout("primary slow").with_chain(1),
            RpcError::connection(ConnectionKind::Refused, "secondary down").with_chain(1),
        ];
        let err = RpcError::all_endpoints_failed(1, attempts);
        assert_eq!(err.chain_id(), Some(1));
        assert!(err.to_string().contains("chain 1"));
        match err.kind() {
            ErrorKind::AllEndpointsFailed { attempts, .. } => assert_eq!(attempts.len(), 2),
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn source_is_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = RpcError::connection(ConnectionKind::Refused, "transport refused").with_source(io);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn clone_shares_source() {
        let io = std::io::Error::other("boom");
        let err = RpcError::other("wrapped").with_source(io);
        let cloned = err.clone();
        assert_eq!(cloned.code(), err.code());
        assert!(std::error::Error::source(&cloned).is_some());
    }
}
