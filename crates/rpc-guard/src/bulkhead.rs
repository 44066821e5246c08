//! Bulkhead: bounded concurrency with a bounded, timed wait queue.
//!
//! At most `max_concurrent` operations run at once. Excess work queues up to
//! `max_queue` deep; beyond that it is rejected outright. Every queued item
//! carries its own timer, so a caller never waits longer than
//! `queue_timeout` for a slot.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Result, RpcError};

// ═══════════════════════════════════════════════════════════════════════════════
// CONFIG
// ═══════════════════════════════════════════════════════════════════════════════

/// Bulkhead configuration.
#[derive(Debug, Clone)]
pub struct BulkheadConfig {
    /// Operations allowed to run concurrently.
    pub max_concurrent: usize,
    /// Operations allowed to wait for a slot.
    pub max_queue: usize,
    /// Longest a queued operation waits before giving up.
    pub queue_timeout: Duration,
    /// Name used in errors and logs.
    pub name: String,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_queue: 50,
            queue_timeout: Duration::from_secs(5),
            name: "bulkhead".into(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// STATS
// ═══════════════════════════════════════════════════════════════════════════════

/// Point-in-time bulkhead statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BulkheadStats {
    /// Operations currently running.
    pub active: usize,
    /// Operations currently queued.
    pub queued: usize,
    /// Operations that ran to completion (success or failure).
    pub total_executed: u64,
    /// Operations rejected because the queue was full.
    pub total_rejected: u64,
    /// Operations that timed out waiting in the queue.
    pub total_timed_out: u64,
    /// `active / max_concurrent * 100`.
    pub load_percentage: f64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// BULKHEAD
// ═══════════════════════════════════════════════════════════════════════════════

struct QueuedWaiter {
    id: u64,
    grant: oneshot::Sender<()>,
}

struct BulkheadState {
    active: usize,
    queue: VecDeque<QueuedWaiter>,
    next_id: u64,
    destroyed: bool,
}

/// Concurrency isolation with a bounded wait queue.
#[derive(Clone)]
pub struct Bulkhead {
    inner: Arc<BulkheadInner>,
}

struct BulkheadInner {
    config: BulkheadConfig,
    state: Mutex<BulkheadState>,
    total_executed: AtomicU64,
    total_rejected: AtomicU64,
    total_timed_out: AtomicU64,
}

impl std::fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bulkhead")
            .field("name", &self.inner.config.name)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Bulkhead {
    /// Create a bulkhead.
    #[must_use]
    pub fn new(config: BulkheadConfig) -> Self {
        Self {
            inner: Arc::new(BulkheadInner {
                config,
                state: Mutex::new(BulkheadState {
                    active: 0,
                    queue: VecDeque::new(),
                    next_id: 0,
                    destroyed: false,
                }),
                total_executed: AtomicU64::new(0),
                total_rejected: AtomicU64::new(0),
                total_timed_out: AtomicU64::new(0),
            }),
        }
    }

    #[allow(clippy::unwrap_used)] // mutex poisoning is unrecoverable here
    fn lock(&self) -> std::sync::MutexGuard<'_, BulkheadState> {
        self.inner.state.lock().unwrap()
    }

    /// Run `op` inside the bulkhead.
    ///
    /// # Errors
    ///
    /// Fails with `QueueFull` when both the slots and the queue are full,
    /// `QueueTimeout` when no slot frees up within `queue_timeout`, or a
    /// cancellation error when the queue is cleared mid-wait. `op`'s own
    /// error passes through after the slot is released.
    pub async fn execute<T, Fut>(&self, op: impl FnOnce() -> Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let waiting = {
            let mut state = self.lock();
            if state.destroyed {
                return Err(RpcError::cancelled("destroyed"));
            }
            if state.active < self.inner.config.max_concurrent {
                state.active += 1;
                None
            } else if state.queue.len() >= self.inner.config.max_queue {
                self.inner.total_rejected.fetch_add(1, Ordering::Relaxed);
                return Err(RpcError::queue_full(self.inner.config.name.clone()));
            } else {
                let (tx, rx) = oneshot::channel();
                state.next_id += 1;
                let id = state.next_id;
                state.queue.push_back(QueuedWaiter { id, grant: tx });
                Some((id, rx))
            }
        };

        if let Some((id, rx)) = waiting {
            match tokio::time::timeout(self.inner.config.queue_timeout, rx).await {
                // Granted: the granter already moved our slot to `active`.
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    return Err(RpcError::cancelled("bulkhead queue cleared"));
                }
                Err(_) => {
                    // Dropping rx makes any in-flight grant fail and release
                    // the slot, so removal here can never leak one.
                    self.lock().queue.retain(|w| w.id != id);
                    self.inner.total_timed_out.fetch_add(1, Ordering::Relaxed);
                    return Err(RpcError::queue_timeout(
                        self.inner.config.name.clone(),
                        self.inner.config.queue_timeout,
                    ));
                }
            }
        }

        let result = op().await;
        self.inner.total_executed.fetch_add(1, Ordering::Relaxed);
        self.release_slot();
        result
    }

    /// Free one slot and hand it to the next live waiter.
    fn release_slot(&self) {
        let mut state = self.lock();
        state.active = state.active.saturating_sub(1);
        while state.active < self.inner.config.max_concurrent {
            let Some(waiter) = state.queue.pop_front() else {
                break;
            };
            state.active += 1;
            if waiter.grant.send(()).is_ok() {
                debug!(name = %self.inner.config.name, "Granted queued slot");
                break;
            }
            // Waiter timed out between dequeue and grant; take the slot back.
            state.active -= 1;
        }
    }

    /// Reject every queued waiter.
    pub fn clear_queue(&self) {
        let mut state = self.lock();
        // Dropping the senders fails every pending receiver.
        let cleared = state.queue.len();
        state.queue.clear();
        if cleared > 0 {
            debug!(name = %self.inner.config.name, cleared, "Cleared bulkhead queue");
        }
    }

    /// Point-in-time statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> BulkheadStats {
        let (active, queued) = {
            let state = self.lock();
            (state.active, state.queue.len())
        };
        BulkheadStats {
            active,
            queued,
            total_executed: self.inner.total_executed.load(Ordering::Relaxed),
            total_rejected: self.inner.total_rejected.load(Ordering::Relaxed),
            total_timed_out: self.inner.total_timed_out.load(Ordering::Relaxed),
            #[allow(clippy::cast_precision_loss)]
            load_percentage: if self.inner.config.max_concurrent == 0 {
                0.0
            } else {
                active as f64 / self.inner.config.max_concurrent as f64 * 100.0
            },
        }
    }

    /// Reject queued waiters and refuse future work. Idempotent.
    pub fn destroy(&self) {
        {
            let mut state = self.lock();
            state.destroyed = true;
        }
        self.clear_queue();
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
