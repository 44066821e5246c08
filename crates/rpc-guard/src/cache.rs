//! TTL + LRU cache with statistics and environment-scoped keys.
//!
//! A single-layer in-memory map from string keys to [`CacheEntry`] values.
//! Expiry is enforced on every read; the background sweeper is a best-effort
//! memory reclaimer, never a correctness mechanism.
//!
//! # Key scoping
//!
//! When an environment is configured (e.g. `testnet`), every key produced by
//! [`TtlCache::generate_key`] is prefixed with `{env}:` so two environments
//! sharing one process never collide.
//!
//! # Eviction
//!
//! At capacity, one entry is evicted *before* the new one is inserted. With
//! LRU enabled the least-recently-touched entry goes; otherwise the oldest
//! insertion goes. Selection scans the map, which is fine at the capacities
//! this cache is configured for.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

// ═══════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Default maximum number of entries.
const DEFAULT_CAPACITY: usize = 1000;

/// Default TTL applied when `set` is called without an explicit one.
const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// How often the background sweeper removes expired entries.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

// ═══════════════════════════════════════════════════════════════════════════════
// CONFIG
// ═══════════════════════════════════════════════════════════════════════════════

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries before eviction kicks in.
    pub capacity: usize,
    /// TTL applied when `set` does not specify one.
    pub default_ttl: Duration,
    /// Evict least-recently-used instead of oldest-inserted.
    pub lru_enabled: bool,
    /// Optional environment prefix for generated keys.
    pub environment: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            default_ttl: DEFAULT_TTL,
            lru_enabled: true,
            environment: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENTRY
// ═══════════════════════════════════════════════════════════════════════════════

/// A single cached value with its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// The cached value.
    pub value: V,
    /// When the entry stops being served.
    pub expires_at: Instant,
    /// When the entry was inserted.
    pub created_at: Instant,
    /// When the entry was last read.
    pub last_accessed_at: Instant,
    /// How many times the entry has been read.
    pub hit_count: u64,
    /// Logical touch counter used for LRU ordering. Wall-clock reads can tie
    /// within one scheduler tick; this cannot.
    touched: u64,
    /// Logical insertion counter used for oldest-insertion eviction.
    inserted: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// STATS
// ═══════════════════════════════════════════════════════════════════════════════

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads that returned a live value.
    pub hits: u64,
    /// Reads that found nothing (or only an expired entry).
    pub misses: u64,
    /// Total inserts.
    pub sets: u64,
    /// Explicit deletes.
    pub deletes: u64,
    /// Capacity evictions.
    pub evictions: u64,
    /// Entries removed because their TTL lapsed.
    pub expired: u64,
    /// Current entry count.
    pub size: usize,
    /// Configured capacity.
    pub capacity: usize,
}

impl CacheStats {
    /// Hit rate in `[0, 1]`; zero when nothing has been read yet.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TTL CACHE
// ═══════════════════════════════════════════════════════════════════════════════

/// In-memory TTL cache with optional LRU eviction.
///
/// Thread-safe; share via `Arc<TtlCache<V>>`. All mutation goes through this
/// type's methods - there is no other owner of the map.
#[derive(Debug)]
pub struct TtlCache<V> {
    config: CacheConfig,
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    /// Monotonic counter backing LRU/insertion ordering.
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<V: Clone + Send + 'static> TtlCache<V> {
    /// Create a cache with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    /// Create a cache with the given configuration.
    #[must_use]
    pub fn with_config(config: CacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            sweeper: Mutex::new(None),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    #[allow(clippy::unwrap_used)] // mutex poisoning is unrecoverable here
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry<V>>> {
        self.entries.lock().unwrap()
    }

    /// Read a value. Expired entries are removed and counted as misses.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.hit_count += 1;
                entry.last_accessed_at = now;
                entry.touched = self.clock.fetch_add(1, Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                self.expired.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert a value with the default TTL.
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, self.config.default_ttl);
    }

    /// Insert a value with an explicit TTL.
    ///
    /// When the cache is full and the key is new, one victim is evicted
    /// before the insert so `size <= capacity` holds at all times.
    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        let now = Instant::now();
        let seq = self.tick();
        let mut entries = self.lock();

        if entries.len() >= self.config.capacity && !entries.contains_key(&key) {
            let victim = if self.config.lru_enabled {
                entries
                    .iter()
                    .min_by_key(|(_, e)| e.touched)
                    .map(|(k, _)| k.clone())
            } else {
                entries
                    .iter()
                    .min_by_key(|(_, e)| e.inserted)
                    .map(|(k, _)| k.clone())
            };
            if let Some(victim) = victim {
                entries.remove(&victim);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(key = %victim, "Evicted cache entry");
            }
        }

        entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: now + ttl,
                created_at: now,
                last_accessed_at: now,
                hit_count: 0,
                touched: seq,
                inserted: seq,
            },
        );
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    /// Expiry-aware presence check. Does not affect hit/miss statistics.
    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => true,
            Some(_) => {
                entries.remove(key);
                self.expired.fetch_add(1, Ordering::Relaxed);
                false
            }
            None => false,
        }
    }

    /// Remove a key. Returns whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        let removed = self.lock().remove(key).is_some();
        if removed {
            self.deletes.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Remove every key for which `predicate` returns true.
    ///
    /// Returns the number of entries removed. Used by services for targeted
    /// invalidation (e.g. every token balance of one address).
    pub fn delete_matching(&self, predicate: impl Fn(&str) -> bool) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|k, _| !predicate(k));
        let removed = before - entries.len();
        self.deletes.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Build a cache key from parts, joined with `:` and prefixed with the
    /// configured environment (when any).
    #[must_use]
    pub fn generate_key(&self, parts: &[&str]) -> String {
        match &self.config.environment {
            Some(env) => format!("{env}:{}", parts.join(":")),
            None => parts.join(":"),
        }
    }

    /// Current entry count (live and expired-but-unswept alike).
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Point-in-time statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            size: self.len(),
            capacity: self.config.capacity,
        }
    }

    /// Remove all expired entries now. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        let removed = before - entries.len();
        self.expired.fetch_add(removed as u64, Ordering::Relaxed);
        if removed > 0 {
            debug!(removed, "Swept expired cache entries");
        }
        removed
    }

    /// Start the periodic background sweep.
    ///
    /// The task holds only a weak reference, so dropping the cache stops it;
    /// [`destroy`](Self::destroy) stops it immediately. Calling this twice
    /// replaces the previous sweeper.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                interval.tick().await;
                let Some(cache) = weak.upgrade() else { return };
                cache.sweep();
            }
        });
        #[allow(clippy::unwrap_used)]
        let mut slot = self.sweeper.lock().unwrap();
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }

    /// Cancel the sweeper and drop every entry. Safe to call repeatedly.
    pub fn destroy(&self) {
        #[allow(clippy::unwrap_used)]
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
        self.clear();
    }
}

impl<V: Clone + Send + 'static> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
