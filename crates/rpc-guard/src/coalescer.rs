//! Request coalescing for concurrent identical in-flight calls.
//!
//! When N callers ask the same question while the first answer is still in
//! flight, the underlying operation runs once and all N callers share the
//! outcome - success and failure alike. Entries are removed the moment the
//! shared future settles; a periodic sweep drops anything that somehow
//! lingers past a staleness bound, as a safety valve against leaks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::error::Result;

// ═══════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// How often the staleness sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// In-flight entries older than this are dropped by the sweep.
const STALE_AFTER: Duration = Duration::from_secs(60);

// ═══════════════════════════════════════════════════════════════════════════════
// STATS
// ═══════════════════════════════════════════════════════════════════════════════

/// Point-in-time coalescer statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoalescerStats {
    /// Every call to `execute`.
    pub total_requests: u64,
    /// Calls that joined an existing in-flight future.
    pub coalesced_requests: u64,
    /// Calls that started a new underlying operation.
    pub unique_requests: u64,
    /// `coalesced / total`, zero when idle.
    pub coalesce_rate: f64,
    /// Currently in-flight keys.
    pub active_requests: usize,
}

// ═══════════════════════════════════════════════════════════════════════════════
// COALESCER
// ═══════════════════════════════════════════════════════════════════════════════

type SharedResult<T> = Shared<BoxFuture<'static, Result<T>>>;

struct InFlight<T> {
    future: SharedResult<T>,
    created_at: Instant,
    subscribers: u64,
}

/// Folds concurrent identical calls into one underlying operation.
///
/// Values (and errors) must be cloneable so every subscriber can observe the
/// settled outcome.
pub struct RequestCoalescer<T> {
    entries: Arc<DashMap<String, InFlight<T>>>,
    total: AtomicU64,
    coalesced: AtomicU64,
    unique: AtomicU64,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<T> std::fmt::Debug for RequestCoalescer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCoalescer")
            .field("active", &self.entries.len())
            .field("total", &self.total)
            .field("coalesced", &self.coalesced)
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + Sync + 'static> RequestCoalescer<T> {
    /// Create an empty coalescer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            total: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            unique: AtomicU64::new(0),
            sweeper: Mutex::new(None),
        }
    }

    /// Run `f` under `key`, or join the in-flight call already running under
    /// that key.
    ///
    /// `f` is only invoked when no call is in flight. The entry is removed as
    /// soon as the operation settles, so sequential calls each run fresh.
    pub async fn execute<F, Fut>(&self, key: impl Into<String>, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let key = key.into();
        self.total.fetch_add(1, Ordering::Relaxed);

        let shared = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().subscribers += 1;
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Coalesced onto in-flight request");
                occupied.get().future.clone()
            }
            Entry::Vacant(vacant) => {
                self.unique.fetch_add(1, Ordering::Relaxed);
                let entries = Arc::clone(&self.entries);
                let settle_key = key.clone();
                let fut = f();
                let shared = async move {
                    let result = fut.await;
                    entries.remove(&settle_key);
                    result
                }
                .boxed()
                .shared();
                vacant.insert(InFlight {
                    future: shared.clone(),
                    created_at: Instant::now(),
                    subscribers: 1,
                });
                shared
            }
        };

        shared.await
    }

    /// Number of subscribers currently attached to `key`, if in flight.
    #[must_use]
    pub fn subscribers(&self, key: &str) -> Option<u64> {
        self.entries.get(key).map(|e| e.subscribers)
    }

    /// Point-in-time statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> CoalescerStats {
        let total = self.total.load(Ordering::Relaxed);
        let coalesced = self.coalesced.load(Ordering::Relaxed);
        CoalescerStats {
            total_requests: total,
            coalesced_requests: coalesced,
            unique_requests: self.unique.load(Ordering::Relaxed),
            #[allow(clippy::cast_precision_loss)]
            coalesce_rate: if total == 0 {
                0.0
            } else {
                coalesced as f64 / total as f64
            },
            active_requests: self.entries.len(),
        }
    }

    /// Drop in-flight entries older than the staleness bound.
    ///
    /// Entries normally remove themselves on settle; this exists so a future
    /// that never settles cannot pin its key forever.
    pub fn sweep_stale(&self) -> usize {
        let cutoff = Instant::now() - STALE_AFTER;
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.created_at > cutoff);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "Swept stale coalescer entries");
        }
        removed
    }

    /// Start the periodic staleness sweep.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(coalescer) = weak.upgrade() else { return };
                coalescer.sweep_stale();
            }
        });
        #[allow(clippy::unwrap_used)]
        let mut slot = self.sweeper.lock().unwrap();
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }

    /// Cancel the sweeper and forget all in-flight entries. Idempotent.
    ///
    /// Callers already awaiting a shared future still observe its outcome;
    /// new calls start fresh.
    pub fn destroy(&self) {
        #[allow(clippy::unwrap_used)]
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
        self.entries.clear();
    }
}

impl<T: Clone + Send + Sync + 'static> Default for RequestCoalescer<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// KEY CONSTRUCTION
// ═══════════════════════════════════════════════════════════════════════════════

/// Build a deterministic coalescing key from the call shape.
///
/// Params are serialized with object keys sorted recursively, so two
/// logically identical calls always produce the same key regardless of how
/// their params were assembled.
#[must_use]
pub fn coalesce_key(
    method: &str,
    chain_id: u64,
    address: Option<&str>,
    params: Option<&Value>,
) -> String {
    let mut key = format!("{method}:{chain_id}");
    if let Some(address) = address {
        key.push(':');
        key.push_str(&address.to_lowercase());
    }
    if let Some(params) = params {
        key.push(':');
        key.push_str(&canonical_json(params));
    }
    key
}

/// Serialize JSON with object keys sorted recursively.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    #[allow(clippy::unwrap_used)] // map access by its own key
                    let v = map.get(k).unwrap();
                    format!("{}:{}", Value::String(k.clone()), canonical_json(v))
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let fields: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", fields.join(","))
        }
        other => other.to_string(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use serde_json::json;

    use super::*;
    use crate::error::RpcError;

    #[tokio::test]
    async fn five_concurrent_callers_share_one_invocation() {
        // Seed scenario: five concurrent executes, one underlying call.
        let coalescer = Arc::new(RequestCoalescer::<u32>::new());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let coalescer = Arc::clone(&coalescer);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                coalescer
                    .execute("k1", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(42)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 42);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = coalescer.stats();
        assert_eq!(stats.total_requests, 5);
        assert_eq!(stats.unique_requests, 1);
        assert_eq!(stats.coalesced_requests, 4);
        assert!((stats.coalesce_rate - 0.8).abs() < f64::EPSILON);
        assert_eq!(stats.active_requests, 0);
    }

    #[tokio::test]
    async fn errors_are_shared_by_all_subscribers() {
        let coalescer = Arc::new(RequestCoalescer::<u32>::new());

        let first = {
            let coalescer = Arc::clone(&coalescer);
            tokio::spawn(async move {
                coalescer
                    .execute("k", || async {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Err(RpcError::timeout("slow endpoint"))
                    })
                    .await
            })
        };
        let second = {
            let coalescer = Arc::clone(&coalescer);
            tokio::spawn(async move {
                coalescer
                    .execute("k", || async { Ok(1) })
                    .await
            })
        };

        assert_eq!(first.await.unwrap().unwrap_err().code(), "TIMEOUT");
        assert_eq!(second.await.unwrap().unwrap_err().code(), "TIMEOUT");
    }

    #[tokio::test]
    async fn sequential_calls_run_independently() {
        let coalescer = RequestCoalescer::<u32>::new();
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            coalescer
                .execute("k", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(1)
                })
                .await
                .unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(coalescer.stats().unique_requests, 3);
        assert_eq!(coalescer.stats().coalesced_requests, 0);
    }

    #[tokio::test]
    async fn different_keys_do_not_coalesce() {
        let coalescer = Arc::new(RequestCoalescer::<u32>::new());
        let calls = Arc::new(AtomicU32::new(0));

        let a = {
            let (coalescer, calls) = (Arc::clone(&coalescer), Arc::clone(&calls));
            tokio::spawn(async move {
                coalescer
                    .execute("a", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(1)
                    })
                    .await
            })
        };
        let b = {
            let (coalescer, calls) = (Arc::clone(&coalescer), Arc::clone(&calls));
            tokio::spawn(async move {
                coalescer
                    .execute("b", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(2)
                    })
                    .await
            })
        };

        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_drops_stale_entries() {
        let coalescer = Arc::new(RequestCoalescer::<u32>::new());

        // A future that never settles would otherwise pin its key forever.
        let hung = {
            let coalescer = Arc::clone(&coalescer);
            tokio::spawn(async move {
                coalescer
                    .execute("stuck", || async {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok(0)
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(coalescer.stats().active_requests, 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(coalescer.sweep_stale(), 1);
        assert_eq!(coalescer.stats().active_requests, 0);

        hung.abort();
    }

    #[test]
    fn coalesce_key_is_deterministic() {
        let a = coalesce_key(
            "getBalance",
            1,
            Some("0xABCD"),
            Some(&json!({"b": 2, "a": 1})),
        );
        let b = coalesce_key(
            "getBalance",
            1,
            Some("0xabcd"),
            Some(&json!({"a": 1, "b": 2})),
        );
        assert_eq!(a, b);
        assert!(a.starts_with("getBalance:1:0xabcd"));
    }

    #[test]
    fn canonical_json_sorts_nested_objects() {
        let value = json!({"z": {"b": 1, "a": [3, {"y": 1, "x": 2}]}, "a": true});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":true,"z":{"a":[3,{"x":2,"y":1}],"b":1}}"#
        );
    }
}
