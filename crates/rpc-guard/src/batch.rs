//! Window-based batching of same-kind requests.
//!
//! Single requests accumulate inside a time window and are handed to a
//! caller-provided batch function as one group. The batch function must
//! return exactly one result per request, positionally; anything else fails
//! the whole batch so no caller ever receives somebody else's answer.
//!
//! Filling the window early (hitting `max_size`) cancels the timer and
//! processes immediately - latency is bounded by `window`, throughput by
//! `max_size`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Result, RpcError};

// ═══════════════════════════════════════════════════════════════════════════════
// CONFIG
// ═══════════════════════════════════════════════════════════════════════════════

/// Default batching window.
const DEFAULT_WINDOW: Duration = Duration::from_millis(50);

/// Default maximum requests per batch.
const DEFAULT_MAX_SIZE: usize = 50;

/// Batch processor configuration.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// How long the first request in a batch waits for company.
    pub window: Duration,
    /// Requests per batch before an immediate flush.
    pub max_size: usize,
    /// Arm the window timer automatically on first enqueue.
    pub auto_flush: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            max_size: DEFAULT_MAX_SIZE,
            auto_flush: true,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// STATS
// ═══════════════════════════════════════════════════════════════════════════════

/// Point-in-time batching statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchStats {
    /// Batches processed.
    pub total_batches: u64,
    /// Requests processed across all batches.
    pub total_requests: u64,
    /// Mean batch size, zero before the first batch.
    pub average_batch_size: f64,
    /// Largest batch processed so far.
    pub largest_batch: Option<usize>,
    /// Smallest batch processed so far.
    pub smallest_batch: Option<usize>,
    /// Requests currently waiting for a flush.
    pub pending: usize,
}

// ═══════════════════════════════════════════════════════════════════════════════
// BATCH PROCESSOR
// ═══════════════════════════════════════════════════════════════════════════════

type BatchFn<Req, Res> =
    Arc<dyn Fn(Vec<Req>) -> BoxFuture<'static, Result<Vec<Res>>> + Send + Sync>;

struct Queued<Req, Res> {
    request: Req,
    #[allow(dead_code)] // recorded for observability/debugging of stuck batches
    added_at: Instant,
    sink: oneshot::Sender<Result<Res>>,
}

struct State<Req, Res> {
    queue: Vec<Queued<Req, Res>>,
    timer: Option<JoinHandle<()>>,
}

struct Inner<Req, Res> {
    config: BatchConfig,
    batch_fn: BatchFn<Req, Res>,
    state: Mutex<State<Req, Res>>,
    total_batches: AtomicU64,
    total_requests: AtomicU64,
    largest: AtomicU64,
    smallest: AtomicU64,
}

/// Coalesces individual requests into windowed batches.
///
/// Cloning is cheap and shares the queue, so one processor can serve many
/// call sites.
pub struct BatchProcessor<Req, Res> {
    inner: Arc<Inner<Req, Res>>,
}

impl<Req, Res> Clone for BatchProcessor<Req, Res> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Req, Res> std::fmt::Debug for BatchProcessor<Req, Res> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchProcessor")
            .field("config", &self.inner.config)
            .field("pending", &self.inner.state.lock().map(|s| s.queue.len()))
            .finish_non_exhaustive()
    }
}

impl<Req, Res> BatchProcessor<Req, Res>
where
    Req: Send + 'static,
    Res: Send + 'static,
{
    /// Create a processor around a batch function.
    ///
    /// The function receives the queued requests in enqueue order and must
    /// return one result per request, in the same order.
    pub fn new<F, Fut>(config: BatchConfig, batch_fn: F) -> Self
    where
        F: Fn(Vec<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Res>>> + Send + 'static,
    {
        let batch_fn: BatchFn<Req, Res> =
            Arc::new(move |reqs| Box::pin(batch_fn(reqs)) as BoxFuture<'static, _>);
        Self {
            inner: Arc::new(Inner {
                config,
                batch_fn,
                state: Mutex::new(State {
                    queue: Vec::new(),
                    timer: None,
                }),
                total_batches: AtomicU64::new(0),
                total_requests: AtomicU64::new(0),
                largest: AtomicU64::new(0),
                smallest: AtomicU64::new(u64::MAX),
            }),
        }
    }

    /// Enqueue a request and await its positional result.
    pub async fn add(&self, request: Req) -> Result<Res> {
        let (tx, rx) = oneshot::channel();
        let flush_now = {
            #[allow(clippy::unwrap_used)]
            let mut state = self.inner.state.lock().unwrap();
            state.queue.push(Queued {
                request,
                added_at: Instant::now(),
                sink: tx,
            });

            if state.queue.len() >= self.inner.config.max_size {
                // Full batch: cancel the window timer and flush right away.
                if let Some(timer) = state.timer.take() {
                    timer.abort();
                }
                true
            } else {
                if state.queue.len() == 1 && self.inner.config.auto_flush {
                    let inner = Arc::clone(&self.inner);
                    let window = self.inner.config.window;
                    state.timer = Some(tokio::spawn(async move {
                        tokio::time::sleep(window).await;
                        Inner::flush_now(&inner).await;
                    }));
                }
                false
            }
        };

        if flush_now {
            Inner::flush_now(&self.inner).await;
        }

        rx.await
            .unwrap_or_else(|_| Err(RpcError::cancelled("batch processor dropped")))
    }

    /// Flush whatever is queued. Returns the number of requests processed.
    pub async fn flush(&self) -> usize {
        Inner::flush_now(&self.inner).await
    }

    /// Reject every queued request.
    ///
    /// Pending callers fail with a cancellation error carrying `reason`
    /// (default: "batch processor cleared").
    pub fn clear(&self, reason: Option<&str>) {
        let reason = reason.unwrap_or("batch processor cleared");
        let drained = {
            #[allow(clippy::unwrap_used)]
            let mut state = self.inner.state.lock().unwrap();
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            std::mem::take(&mut state.queue)
        };
        for queued in drained {
            let _ = queued.sink.send(Err(RpcError::cancelled(reason)));
        }
    }

    /// Point-in-time statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> BatchStats {
        let batches = self.inner.total_batches.load(Ordering::Relaxed);
        let requests = self.inner.total_requests.load(Ordering::Relaxed);
        let largest = self.inner.largest.load(Ordering::Relaxed);
        let smallest = self.inner.smallest.load(Ordering::Relaxed);
        #[allow(clippy::unwrap_used)]
        let pending = self.inner.state.lock().unwrap().queue.len();
        BatchStats {
            total_batches: batches,
            total_requests: requests,
            #[allow(clippy::cast_precision_loss)]
            average_batch_size: if batches == 0 {
                0.0
            } else {
                requests as f64 / batches as f64
            },
            #[allow(clippy::cast_possible_truncation)]
            largest_batch: (largest > 0).then_some(largest as usize),
            #[allow(clippy::cast_possible_truncation)]
            smallest_batch: (smallest != u64::MAX).then_some(smallest as usize),
            pending,
        }
    }

    /// Cancel the timer and reject pending work. Idempotent.
    pub fn destroy(&self) {
        self.clear(Some("destroyed"));
    }
}

impl<Req, Res> Inner<Req, Res>
where
    Req: Send + 'static,
    Res: Send + 'static,
{
    /// Drain the queue and run one batch. Returns how many requests ran.
    async fn flush_now(inner: &Arc<Self>) -> usize {
        let drained = {
            #[allow(clippy::unwrap_used)]
            let mut state = inner.state.lock().unwrap();
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            std::mem::take(&mut state.queue)
        };
        if drained.is_empty() {
            return 0;
        }

        let count = drained.len();
        let (requests, sinks): (Vec<Req>, Vec<oneshot::Sender<Result<Res>>>) = drained
            .into_iter()
            .map(|q| (q.request, q.sink))
            .unzip();

        inner.total_batches.fetch_add(1, Ordering::Relaxed);
        inner.total_requests.fetch_add(count as u64, Ordering::Relaxed);
        inner.largest.fetch_max(count as u64, Ordering::Relaxed);
        inner.smallest.fetch_min(count as u64, Ordering::Relaxed);
        debug!(count, "Processing batch");

        match (inner.batch_fn)(requests).await {
            Ok(results) if results.len() == count => {
                for (sink, result) in sinks.into_iter().zip(results) {
                    let _ = sink.send(Ok(result));
                }
            }
            Ok(results) => {
                // Positional mapping is broken; nobody gets a guessed answer.
                let err = RpcError::batch_mismatch(count, results.len());
                for sink in sinks {
                    let _ = sink.send(Err(err.clone()));
                }
            }
            Err(err) => {
                for sink in sinks {
                    let _ = sink.send(Err(err.clone()));
                }
            }
        }

        count
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
