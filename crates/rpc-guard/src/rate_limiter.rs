//! Token-bucket rate limiter with a FIFO wait queue.
//!
//! Tokens refill continuously at `refill_rate` per second up to `capacity`.
//! Callers that find the bucket empty queue up and are granted tokens in
//! arrival order by an on-demand drip task; waits are bounded by
//! `max_wait` and fail with a rate-limit error past it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Result, RpcError};

// ═══════════════════════════════════════════════════════════════════════════════
// CONFIG
// ═══════════════════════════════════════════════════════════════════════════════

/// Default bound on queued waits.
const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(5);

/// Rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Maximum tokens the bucket holds.
    pub capacity: f64,
    /// Tokens added per second.
    pub refill_rate: f64,
    /// Longest a caller will wait in the queue.
    pub max_wait: Duration,
    /// Name used in errors and logs.
    pub name: String,
}

impl RateLimiterConfig {
    /// Build a config with the default wait bound.
    #[must_use]
    pub fn new(capacity: f64, refill_rate: f64, name: impl Into<String>) -> Self {
        Self {
            capacity,
            refill_rate,
            max_wait: DEFAULT_MAX_WAIT,
            name: name.into(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.capacity < 1.0 {
            return Err(RpcError::validation(
                "capacity",
                ">= 1",
                self.capacity.to_string(),
            ));
        }
        if self.refill_rate <= 0.0 {
            return Err(RpcError::validation(
                "refill_rate",
                "> 0",
                self.refill_rate.to_string(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// STATS
// ═══════════════════════════════════════════════════════════════════════════════

/// Point-in-time limiter statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterStats {
    /// Tokens currently in the bucket.
    pub tokens: f64,
    /// Acquisitions granted (immediate and queued alike).
    pub granted: u64,
    /// Callers currently queued.
    pub queued: usize,
    /// Callers that gave up after `max_wait`.
    pub timed_out: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// RATE LIMITER
// ═══════════════════════════════════════════════════════════════════════════════

struct Waiter {
    id: u64,
    grant: oneshot::Sender<()>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    waiters: VecDeque<Waiter>,
    pump_running: bool,
    next_waiter_id: u64,
    destroyed: bool,
}

struct LimiterInner {
    config: RateLimiterConfig,
    state: Mutex<BucketState>,
    granted: AtomicU64,
    timed_out: AtomicU64,
}

/// Token-bucket rate limiter. Cloning shares the bucket.
#[derive(Clone)]
pub struct TokenBucket {
    inner: Arc<LimiterInner>,
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("name", &self.inner.config.name)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl TokenBucket {
    /// Create a limiter starting with a full bucket.
    ///
    /// # Errors
    ///
    /// Fails validation when `capacity < 1` or `refill_rate <= 0`.
    pub fn new(config: RateLimiterConfig) -> Result<Self> {
        config.validate()?;
        let tokens = config.capacity;
        Ok(Self {
            inner: Arc::new(LimiterInner {
                config,
                state: Mutex::new(BucketState {
                    tokens,
                    last_refill: Instant::now(),
                    waiters: VecDeque::new(),
                    pump_running: false,
                    next_waiter_id: 0,
                    destroyed: false,
                }),
                granted: AtomicU64::new(0),
                timed_out: AtomicU64::new(0),
            }),
        })
    }

    /// Take a token if one is available right now.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        let mut state = self.lock();
        Self::refill(&self.inner.config, &mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            self.inner.granted.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Take a token, waiting in FIFO order up to `max_wait`.
    ///
    /// # Errors
    ///
    /// Fails with a rate-limit error when the wait bound is exceeded, or a
    /// cancellation error when the limiter is destroyed mid-wait.
    pub async fn acquire(&self) -> Result<()> {
        let (waiter_id, rx) = {
            let mut state = self.lock();
            if state.destroyed {
                return Err(RpcError::cancelled("destroyed"));
            }
            Self::refill(&self.inner.config, &mut state);
            if state.tokens >= 1.0 && state.waiters.is_empty() {
                state.tokens -= 1.0;
                self.inner.granted.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }

            let (tx, rx) = oneshot::channel();
            state.next_waiter_id += 1;
            let id = state.next_waiter_id;
            state.waiters.push_back(Waiter { id, grant: tx });
            if !state.pump_running {
                state.pump_running = true;
                tokio::spawn(Self::pump(Arc::clone(&self.inner)));
            }
            (id, rx)
        };

        match tokio::time::timeout(self.inner.config.max_wait, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(RpcError::cancelled("destroyed")),
            Err(_) => {
                // Remove ourselves so the pump never grants a dead waiter.
                self.lock().waiters.retain(|w| w.id != waiter_id);
                self.inner.timed_out.fetch_add(1, Ordering::Relaxed);
                let eta = self.estimated_reset();
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let capacity = self.inner.config.capacity as u32;
                Err(RpcError::rate_limited(
                    chrono::Utc::now()
                        + chrono::Duration::from_std(eta).unwrap_or_default(),
                    capacity,
                    1,
                    self.inner.config.name.clone(),
                ))
            }
        }
    }

    /// Acquire a token, then run `f`.
    ///
    /// # Errors
    ///
    /// Propagates acquisition errors and `f`'s own error.
    pub async fn execute<T, Fut>(&self, f: impl FnOnce() -> Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        self.acquire().await?;
        f().await
    }

    /// Point-in-time statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> RateLimiterStats {
        let mut state = self.lock();
        Self::refill(&self.inner.config, &mut state);
        RateLimiterStats {
            tokens: state.tokens,
            granted: self.inner.granted.load(Ordering::Relaxed),
            queued: state.waiters.len(),
            timed_out: self.inner.timed_out.load(Ordering::Relaxed),
        }
    }

    /// Reject queued waiters and refuse future acquisitions. Idempotent.
    pub fn destroy(&self) {
        let mut state = self.lock();
        state.destroyed = true;
        // Dropping the senders fails every pending receiver.
        state.waiters.clear();
    }

    #[allow(clippy::unwrap_used)] // mutex poisoning is unrecoverable here
    fn lock(&self) -> std::sync::MutexGuard<'_, BucketState> {
        self.inner.state.lock().unwrap()
    }

    /// Time until one full token is available.
    fn estimated_reset(&self) -> Duration {
        let state = self.lock();
        let deficit = (1.0 - state.tokens).max(0.0);
        Duration::from_secs_f64(deficit / self.inner.config.refill_rate)
    }

    fn refill(config: &RateLimiterConfig, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * config.refill_rate).min(config.capacity);
        state.last_refill = now;
    }

    /// Drip task: grants queued waiters in FIFO order as tokens refill, then
    /// exits once the queue is empty.
    async fn pump(inner: Arc<LimiterInner>) {
        loop {
            let sleep_for = {
                #[allow(clippy::unwrap_used)]
                let mut state = inner.state.lock().unwrap();
                Self::refill(&inner.config, &mut state);

                while state.tokens >= 1.0 {
                    let Some(waiter) = state.waiters.pop_front() else {
                        break;
                    };
                    // A waiter that timed out removed itself; one that raced
                    // the removal has a dropped receiver - keep the token.
                    if waiter.grant.send(()).is_ok() {
                        state.tokens -= 1.0;
                        inner.granted.fetch_add(1, Ordering::Relaxed);
                    }
                }

                if state.waiters.is_empty() || state.destroyed {
                    state.pump_running = false;
                    return;
                }

                let deficit = 1.0 - state.tokens;
                Duration::from_secs_f64(deficit / inner.config.refill_rate)
            };

            debug!(wait = ?sleep_for, "Rate limiter waiting for refill");
            tokio::time::sleep(sleep_for).await;
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn limiter(capacity: f64, rate: f64, max_wait: Duration) -> TokenBucket {
        TokenBucket::new(RateLimiterConfig {
            capacity,
            refill_rate: rate,
            max_wait,
            name: "test".into(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn try_acquire_consumes_tokens() {
        let bucket = limiter(2.0, 1.0, DEFAULT_MAX_WAIT);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_refill_over_time_up_to_capacity() {
        let bucket = limiter(2.0, 1.0, DEFAULT_MAX_WAIT);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());

        // A long idle period must not overfill the bucket.
        tokio::time::advance(Duration::from_secs(3600)).await;
        let stats = bucket.stats();
        assert!(stats.tokens <= 2.0);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn queued_waiters_are_served_fifo() {
        let bucket = limiter(1.0, 1.0, Duration::from_secs(30));
        assert!(bucket.try_acquire());

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let bucket = bucket.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                bucket.acquire().await.unwrap();
                order.lock().unwrap().push(i);
            }));
            // Let each waiter enqueue before the next arrives.
            tokio::task::yield_now().await;
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_with_rate_limit_error() {
        let bucket = limiter(1.0, 0.001, Duration::from_millis(100));
        assert!(bucket.try_acquire());

        let err = bucket.acquire().await.unwrap_err();
        assert_eq!(err.code(), "RATE_LIMIT");
        assert!(err.is_retriable());
        assert_eq!(bucket.stats().timed_out, 1);
        assert_eq!(bucket.stats().queued, 0, "timed-out waiter must dequeue");
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_respects_queue_even_with_token_available() {
        // A token refilled while others queue must not let a newcomer jump
        // the line.
        let bucket = limiter(1.0, 1.0, Duration::from_secs(30));
        assert!(bucket.try_acquire());

        let first = {
            let bucket = bucket.clone();
            tokio::spawn(async move { bucket.acquire().await })
        };
        tokio::task::yield_now().await;
        assert_eq!(bucket.stats().queued, 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn execute_runs_after_acquiring() {
        let bucket = limiter(1.0, 1.0, DEFAULT_MAX_WAIT);
        let value = bucket.execute(|| async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_rejects_waiters_and_future_calls() {
        let bucket = limiter(1.0, 0.001, Duration::from_secs(30));
        assert!(bucket.try_acquire());

        let waiting = {
            let bucket = bucket.clone();
            tokio::spawn(async move { bucket.acquire().await })
        };
        tokio::task::yield_now().await;

        bucket.destroy();
        let err = waiting.await.unwrap().unwrap_err();
        assert_eq!(err.code(), "CANCELLED");

        let err = bucket.acquire().await.unwrap_err();
        assert_eq!(err.code(), "CANCELLED");
    }

    #[test]
    fn config_validation_rejects_nonsense() {
        assert!(TokenBucket::new(RateLimiterConfig::new(0.0, 1.0, "x")).is_err());
        assert!(TokenBucket::new(RateLimiterConfig::new(10.0, 0.0, "x")).is_err());
        assert!(TokenBucket::new(RateLimiterConfig::new(10.0, 1.0, "x")).is_ok());
    }
}
