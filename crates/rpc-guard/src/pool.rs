//! Generic connection pool with health-checked reuse.
//!
//! The pool owns connections produced by a [`ConnectionFactory`] and keeps
//! them between `min` and `max`. Idle connections expire, released
//! connections are health-checked before reuse, and a periodic task sweeps
//! unhealthy idles and refills toward `min`.
//!
//! Selection strategy decides which idle connection a caller gets:
//! LIFO favors warm connections, FIFO spreads usage evenly, round-robin
//! rotates deterministically.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Result, RpcError};

// ═══════════════════════════════════════════════════════════════════════════════
// FACTORY
// ═══════════════════════════════════════════════════════════════════════════════

/// Creates, destroys, and health-checks pool connections.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// The connection type this factory produces.
    type Connection: Send + 'static;

    /// Open a new connection.
    async fn create(&self) -> Result<Self::Connection>;

    /// Close a connection. Failures are the factory's problem to log.
    async fn destroy(&self, connection: Self::Connection);

    /// Check whether a connection is still usable.
    ///
    /// # Errors
    ///
    /// An error means the check itself failed; the pool treats the
    /// connection as unhealthy and counts the failed check.
    async fn is_healthy(&self, connection: &Self::Connection) -> Result<bool>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONFIG
// ═══════════════════════════════════════════════════════════════════════════════

/// Which idle connection `acquire` hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionStrategy {
    /// Most recently released first (warmest connection).
    #[default]
    Lifo,
    /// Least recently released first (even wear).
    Fifo,
    /// Rotating index across the idle set.
    RoundRobin,
}

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections maintained even when idle.
    pub min_connections: usize,
    /// Hard cap on total connections.
    pub max_connections: usize,
    /// Idle connections older than this are destroyed on the next sweep.
    pub idle_timeout: Duration,
    /// Deadline for creating one connection.
    pub connection_timeout: Duration,
    /// Cadence of the background health check.
    pub health_check_interval: Duration,
    /// Idle selection strategy.
    pub strategy: SelectionStrategy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 10,
            idle_timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(60),
            strategy: SelectionStrategy::default(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// POOLED CONNECTION
// ═══════════════════════════════════════════════════════════════════════════════

/// A connection checked out of (or idling in) the pool.
#[derive(Debug)]
pub struct PooledConnection<C> {
    /// The underlying connection.
    pub connection: C,
    /// Pool-unique id.
    pub id: u64,
    /// When the connection was created.
    pub created_at: Instant,
    /// When the connection was last handed out or released.
    pub last_used_at: Instant,
    /// How many times the connection has been acquired.
    pub use_count: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// STATS
// ═══════════════════════════════════════════════════════════════════════════════

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// All connections the pool currently accounts for.
    pub total: usize,
    /// Connections currently checked out.
    pub active: usize,
    /// Connections currently idle.
    pub idle: usize,
    /// Connections ever created.
    pub created: u64,
    /// Connections ever destroyed.
    pub destroyed: u64,
    /// Successful acquires.
    pub acquired: u64,
    /// Releases back into the pool.
    pub released: u64,
    /// Health checks that themselves failed.
    pub health_checks_failed: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// POOL
// ═══════════════════════════════════════════════════════════════════════════════

struct PoolState<C> {
    available: VecDeque<PooledConnection<C>>,
    /// Idle + active + mid-creation, so `max_connections` holds even while a
    /// create is in flight.
    total: usize,
    rr_index: usize,
    next_id: u64,
}

/// Health-checked connection pool.
pub struct ConnectionPool<F: ConnectionFactory> {
    factory: F,
    config: PoolConfig,
    state: Mutex<PoolState<F::Connection>>,
    created: AtomicU64,
    destroyed: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
    health_checks_failed: AtomicU64,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl<F: ConnectionFactory> std::fmt::Debug for ConnectionPool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Create an empty pool. Call [`initialize`](Self::initialize) to warm it
    /// to `min_connections`.
    #[must_use]
    pub fn new(factory: F, config: PoolConfig) -> Self {
        Self {
            factory,
            config,
            state: Mutex::new(PoolState {
                available: VecDeque::new(),
                total: 0,
                rr_index: 0,
                next_id: 0,
            }),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
            health_checks_failed: AtomicU64::new(0),
            health_task: Mutex::new(None),
        }
    }

    #[allow(clippy::unwrap_used)] // mutex poisoning is unrecoverable here
    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState<F::Connection>> {
        self.state.lock().unwrap()
    }

    /// Warm the pool to `min_connections`.
    ///
    /// # Errors
    ///
    /// Returns the first creation error; connections created before the
    /// failure stay in the pool.
    pub async fn initialize(&self) -> Result<()> {
        while self.lock().total < self.config.min_connections {
            let conn = self.create_connection().await?;
            let mut state = self.lock();
            state.available.push_back(conn);
        }
        debug!(min = self.config.min_connections, "Pool warmed");
        Ok(())
    }

    /// Create one connection, respecting the connection timeout.
    /// Reserves a slot in `total` for the duration of the attempt.
    async fn create_connection(&self) -> Result<PooledConnection<F::Connection>> {
        let id = {
            let mut state = self.lock();
            state.total += 1;
            state.next_id += 1;
            state.next_id
        };

        let created = tokio::time::timeout(self.config.connection_timeout, self.factory.create())
            .await
            .map_err(|_| {
                RpcError::timeout(format!(
                    "connection creation timed out after {:?}",
                    self.config.connection_timeout
                ))
            })
            .and_then(|r| r);

        match created {
            Ok(connection) => {
                self.created.fetch_add(1, Ordering::Relaxed);
                let now = Instant::now();
                Ok(PooledConnection {
                    connection,
                    id,
                    created_at: now,
                    last_used_at: now,
                    use_count: 0,
                })
            }
            Err(err) => {
                self.lock().total -= 1;
                Err(err)
            }
        }
    }

    /// Check out a connection.
    ///
    /// Sweeps idle-expired connections, then selects per strategy, then
    /// creates a new connection if below `max_connections`.
    ///
    /// # Errors
    ///
    /// Fails with `PoolExhausted` when every connection is in use and the
    /// pool is at capacity.
    pub async fn acquire(&self) -> Result<PooledConnection<F::Connection>> {
        // Sweep idle-expired connections first.
        let expired = {
            let mut state = self.lock();
            let cutoff = Instant::now() - self.config.idle_timeout;
            let mut expired = Vec::new();
            let mut keep = VecDeque::with_capacity(state.available.len());
            while let Some(conn) = state.available.pop_front() {
                if conn.last_used_at < cutoff {
                    expired.push(conn);
                } else {
                    keep.push_back(conn);
                }
            }
            state.available = keep;
            state.total -= expired.len();
            expired
        };
        for conn in expired {
            debug!(id = conn.id, "Destroying idle-expired connection");
            self.destroy_connection(conn).await;
        }

        let picked = {
            let mut state = self.lock();
            let len = state.available.len();
            if len == 0 {
                None
            } else {
                match self.config.strategy {
                    SelectionStrategy::Lifo => state.available.pop_back(),
                    SelectionStrategy::Fifo => state.available.pop_front(),
                    SelectionStrategy::RoundRobin => {
                        let index = state.rr_index % len;
                        state.rr_index = state.rr_index.wrapping_add(1);
                        state.available.remove(index)
                    }
                }
            }
        };

        let mut conn = match picked {
            Some(conn) => conn,
            None => {
                {
                    let state = self.lock();
                    if state.total >= self.config.max_connections {
                        return Err(RpcError::pool_exhausted());
                    }
                }
                self.create_connection().await?
            }
        };

        conn.use_count += 1;
        conn.last_used_at = Instant::now();
        self.acquired.fetch_add(1, Ordering::Relaxed);
        Ok(conn)
    }

    /// Return a connection to the pool.
    ///
    /// The connection is health-checked: healthy ones go back to the idle
    /// set, unhealthy ones are destroyed and the pool is topped back up
    /// toward `min_connections`.
    pub async fn release(&self, mut conn: PooledConnection<F::Connection>) {
        let healthy = match self.factory.is_healthy(&conn.connection).await {
            Ok(healthy) => healthy,
            Err(err) => {
                self.health_checks_failed.fetch_add(1, Ordering::Relaxed);
                warn!(id = conn.id, error = %err, "Health check failed on release");
                false
            }
        };

        if healthy {
            conn.last_used_at = Instant::now();
            self.released.fetch_add(1, Ordering::Relaxed);
            self.lock().available.push_back(conn);
        } else {
            debug!(id = conn.id, "Destroying unhealthy released connection");
            self.lock().total -= 1;
            self.destroy_connection(conn).await;
            self.top_up().await;
        }
    }

    /// Run `f` against a pooled connection, releasing it afterwards even when
    /// `f` fails.
    ///
    /// # Errors
    ///
    /// Propagates acquisition errors and `f`'s own error.
    pub async fn execute<T>(
        &self,
        f: impl for<'a> FnOnce(&'a F::Connection) -> BoxFuture<'a, Result<T>> + Send,
    ) -> Result<T> {
        let conn = self.acquire().await?;
        let result = f(&conn.connection).await;
        self.release(conn).await;
        result
    }

    /// Destroy without touching `total` - callers adjust accounting first.
    async fn destroy_connection(&self, conn: PooledConnection<F::Connection>) {
        self.factory.destroy(conn.connection).await;
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }

    /// Best-effort refill toward `min_connections`.
    async fn top_up(&self) {
        while self.lock().total < self.config.min_connections {
            match self.create_connection().await {
                Ok(conn) => self.lock().available.push_back(conn),
                Err(err) => {
                    warn!(error = %err, "Failed to top up pool");
                    break;
                }
            }
        }
    }

    /// Destroy unhealthy idle connections and refill toward `min`.
    ///
    /// This is what the background health task runs; exposed for tests and
    /// manual maintenance.
    pub async fn run_health_check(&self) {
        let idle: Vec<PooledConnection<F::Connection>> = {
            let mut state = self.lock();
            state.available.drain(..).collect()
        };

        let mut healthy = Vec::new();
        let mut unhealthy = Vec::new();
        for conn in idle {
            match self.factory.is_healthy(&conn.connection).await {
                Ok(true) => healthy.push(conn),
                Ok(false) => unhealthy.push(conn),
                Err(err) => {
                    self.health_checks_failed.fetch_add(1, Ordering::Relaxed);
                    warn!(id = conn.id, error = %err, "Health check failed");
                    unhealthy.push(conn);
                }
            }
        }

        {
            let mut state = self.lock();
            state.total -= unhealthy.len();
            state.available.extend(healthy);
        }
        for conn in unhealthy {
            self.destroy_connection(conn).await;
        }
        self.top_up().await;
    }

    /// Start the periodic background health check.
    pub fn spawn_health_checker(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.health_check_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else { return };
                pool.run_health_check().await;
            }
        });
        #[allow(clippy::unwrap_used)]
        let mut slot = self.health_task.lock().unwrap();
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }

    /// Destroy idle connections; with `force`, also forget active ones.
    ///
    /// `force` only clears the bookkeeping - operations already running on
    /// checked-out connections are not aborted, and releasing such a
    /// connection afterwards health-checks it back in as usual.
    pub async fn drain(&self, force: bool) {
        let idle: Vec<PooledConnection<F::Connection>> = {
            let mut state = self.lock();
            let idle: Vec<_> = state.available.drain(..).collect();
            state.total -= idle.len();
            if force {
                state.total = 0;
            }
            idle
        };
        for conn in idle {
            self.destroy_connection(conn).await;
        }
    }

    /// Point-in-time statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let (total, idle) = {
            let state = self.lock();
            (state.total, state.available.len())
        };
        PoolStats {
            total,
            active: total.saturating_sub(idle),
            idle,
            created: self.created.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            acquired: self.acquired.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            health_checks_failed: self.health_checks_failed.load(Ordering::Relaxed),
        }
    }

    /// Stop the health task and drop all connections. Idempotent.
    pub async fn destroy(&self) {
        #[allow(clippy::unwrap_used)]
        if let Some(handle) = self.health_task.lock().unwrap().take() {
            handle.abort();
        }
        self.drain(true).await;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU64};

    use futures::FutureExt;

    use super::*;

    struct TestFactory {
        created: AtomicU64,
        destroyed: AtomicU64,
        healthy: AtomicBool,
        check_fails: AtomicBool,
    }

    impl TestFactory {
        fn new() -> Self {
            Self {
                created: AtomicU64::new(0),
                destroyed: AtomicU64::new(0),
                healthy: AtomicBool::new(true),
                check_fails: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl ConnectionFactory for Arc<TestFactory> {
        type Connection = u64;

        async fn create(&self) -> Result<u64> {
            Ok(self.created.fetch_add(1, Ordering::SeqCst) + 1)
        }

        async fn destroy(&self, _connection: u64) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }

        async fn is_healthy(&self, _connection: &u64) -> Result<bool> {
            if self.check_fails.load(Ordering::SeqCst) {
                return Err(RpcError::timeout("health probe timed out"));
            }
            Ok(self.healthy.load(Ordering::SeqCst))
        }
    }

    fn pool_with(config: PoolConfig) -> (Arc<TestFactory>, ConnectionPool<Arc<TestFactory>>) {
        let factory = Arc::new(TestFactory::new());
        let pool = ConnectionPool::new(Arc::clone(&factory), config);
        (factory, pool)
    }

    #[tokio::test]
    async fn initialize_warms_to_min() {
        let (factory, pool) = pool_with(PoolConfig::default());
        pool.initialize().await.unwrap();

        let stats = pool.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.idle, 2);
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn acquire_caps_at_max_connections() {
        let (_, pool) = pool_with(PoolConfig {
            min_connections: 0,
            max_connections: 3,
            ..PoolConfig::default()
        });

        let mut held = Vec::new();
        for _ in 0..3 {
            held.push(pool.acquire().await.unwrap());
        }
        assert_eq!(pool.stats().total, 3);

        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err.code(), "POOL_EXHAUSTED");
        assert_eq!(err.to_string(), "connection pool exhausted");

        // Releasing one makes room again.
        pool.release(held.pop().unwrap()).await;
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn unhealthy_release_destroys_and_tops_up() {
        let (factory, pool) = pool_with(PoolConfig {
            min_connections: 1,
            max_connections: 5,
            ..PoolConfig::default()
        });
        pool.initialize().await.unwrap();

        let conn = pool.acquire().await.unwrap();
        factory.healthy.store(false, Ordering::SeqCst);
        pool.release(conn).await;

        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
        // Top-up created a replacement even though it is also "unhealthy" -
        // health is only checked on release and during sweeps.
        assert_eq!(pool.stats().total, 1);
    }

    #[tokio::test]
    async fn lifo_hands_out_most_recently_released() {
        let (_, pool) = pool_with(PoolConfig {
            min_connections: 0,
            strategy: SelectionStrategy::Lifo,
            ..PoolConfig::default()
        });

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let (a_id, b_id) = (a.id, b.id);
        pool.release(a).await;
        pool.release(b).await;

        assert_eq!(pool.acquire().await.unwrap().id, b_id);
        assert_eq!(pool.acquire().await.unwrap().id, a_id);
    }

    #[tokio::test]
    async fn fifo_hands_out_least_recently_released() {
        let (_, pool) = pool_with(PoolConfig {
            min_connections: 0,
            strategy: SelectionStrategy::Fifo,
            ..PoolConfig::default()
        });

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let (a_id, b_id) = (a.id, b.id);
        pool.release(a).await;
        pool.release(b).await;

        assert_eq!(pool.acquire().await.unwrap().id, a_id);
        assert_eq!(pool.acquire().await.unwrap().id, b_id);
    }

    #[tokio::test]
    async fn round_robin_rotates() {
        let (_, pool) = pool_with(PoolConfig {
            min_connections: 3,
            strategy: SelectionStrategy::RoundRobin,
            ..PoolConfig::default()
        });
        pool.initialize().await.unwrap();

        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        assert_ne!(first.id, second.id);
        pool.release(first).await;
        pool.release(second).await;
    }

    #[tokio::test(start_paused = true)]
    async fn idle_expired_connections_are_swept_on_acquire() {
        let (factory, pool) = pool_with(PoolConfig {
            min_connections: 0,
            idle_timeout: Duration::from_secs(30),
            ..PoolConfig::default()
        });

        let conn = pool.acquire().await.unwrap();
        let stale_id = conn.id;
        pool.release(conn).await;

        tokio::time::advance(Duration::from_secs(31)).await;

        let fresh = pool.acquire().await.unwrap();
        assert_ne!(fresh.id, stale_id, "expired connection must not be reused");
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn execute_releases_on_error() {
        let (_, pool) = pool_with(PoolConfig {
            min_connections: 0,
            max_connections: 1,
            ..PoolConfig::default()
        });

        let result: Result<u64> = pool
            .execute(|_conn| async { Err(RpcError::data("bad response")) }.boxed())
            .await;
        assert!(result.is_err());

        // The single slot must be free again.
        let value = pool
            .execute(|conn| {
                let conn = *conn;
                async move { Ok(conn) }.boxed()
            })
            .await
            .unwrap();
        assert!(value > 0);
    }

    #[tokio::test]
    async fn failed_health_check_is_counted() {
        let (factory, pool) = pool_with(PoolConfig {
            min_connections: 0,
            ..PoolConfig::default()
        });

        let conn = pool.acquire().await.unwrap();
        factory.check_fails.store(true, Ordering::SeqCst);
        pool.release(conn).await;

        assert_eq!(pool.stats().health_checks_failed, 1);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn health_sweep_destroys_unhealthy_idle_and_refills() {
        let (factory, pool) = pool_with(PoolConfig {
            min_connections: 2,
            ..PoolConfig::default()
        });
        pool.initialize().await.unwrap();

        factory.healthy.store(false, Ordering::SeqCst);
        pool.run_health_check().await;

        // Both idles destroyed, two replacements created.
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().total, 2);
    }

    #[tokio::test]
    async fn drain_force_forgets_active_bookkeeping() {
        let (_, pool) = pool_with(PoolConfig {
            min_connections: 0,
            max_connections: 2,
            ..PoolConfig::default()
        });

        let _held = pool.acquire().await.unwrap();
        let idle = pool.acquire().await.unwrap();
        pool.release(idle).await;

        pool.drain(true).await;
        let stats = pool.stats();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.idle, 0);
    }
}
