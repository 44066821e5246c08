//! Ordered fallback strategies: walk the chain until one succeeds.
//!
//! Each strategy can carry an optional guard (`should_attempt`) and an
//! optional per-strategy timeout. The outcome records which strategy won and
//! every error collected along the way, so callers can see how degraded the
//! path was even on success.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Result, RpcError};

// ═══════════════════════════════════════════════════════════════════════════════
// STRATEGY
// ═══════════════════════════════════════════════════════════════════════════════

type RunFn<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;
type GuardFn = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

/// One rung of a fallback chain.
pub struct FallbackStrategy<T> {
    /// Name used in outcomes and errors.
    pub name: String,
    run: RunFn<T>,
    should_attempt: Option<GuardFn>,
    timeout: Option<Duration>,
}

impl<T> Clone for FallbackStrategy<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            run: Arc::clone(&self.run),
            should_attempt: self.should_attempt.clone(),
            timeout: self.timeout,
        }
    }
}

impl<T> std::fmt::Debug for FallbackStrategy<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackStrategy")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("guarded", &self.should_attempt.is_some())
            .finish_non_exhaustive()
    }
}

impl<T> FallbackStrategy<T> {
    /// Create a strategy from an async operation.
    pub fn new<F, Fut>(name: impl Into<String>, run: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Arc::new(move || Box::pin(run()) as BoxFuture<'static, _>),
            should_attempt: None,
            timeout: None,
        }
    }

    /// Skip this strategy whenever the guard resolves false.
    #[must_use]
    pub fn with_guard<F, Fut>(mut self, guard: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.should_attempt = Some(Arc::new(move || Box::pin(guard()) as BoxFuture<'static, _>));
        self
    }

    /// Bound this strategy's execution time.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// OUTCOME
// ═══════════════════════════════════════════════════════════════════════════════

/// How a fallback execution resolved.
#[derive(Debug, Clone)]
pub struct FallbackOutcome<T> {
    /// The successful value.
    pub value: T,
    /// Index of the winning strategy; `strategies.len()` when the configured
    /// default value was used.
    pub strategy_index: usize,
    /// Name of the winning strategy, or `"(default)"`.
    pub strategy_name: String,
    /// `(strategy name, error)` for every failed attempt before the win.
    pub errors: Vec<(String, RpcError)>,
    /// Wall time for the whole chain walk.
    pub duration: Duration,
}

// ═══════════════════════════════════════════════════════════════════════════════
// CHAIN
// ═══════════════════════════════════════════════════════════════════════════════

/// Walks ordered strategies until one succeeds.
#[derive(Debug)]
pub struct FallbackChain<T> {
    strategies: Mutex<Vec<FallbackStrategy<T>>>,
    default: Option<T>,
}

impl<T: Clone> FallbackChain<T> {
    /// Create a chain from ordered strategies.
    #[must_use]
    pub fn new(strategies: Vec<FallbackStrategy<T>>) -> Self {
        Self {
            strategies: Mutex::new(strategies),
            default: None,
        }
    }

    /// Value returned when every strategy fails.
    #[must_use]
    pub fn with_default(mut self, default: T) -> Self {
        self.default = Some(default);
        self
    }

    #[allow(clippy::unwrap_used)] // mutex poisoning is unrecoverable here
    fn snapshot(&self) -> Vec<FallbackStrategy<T>> {
        self.strategies.lock().unwrap().clone()
    }

    /// Insert a strategy at `index` (clamped to the end).
    pub fn insert(&self, index: usize, strategy: FallbackStrategy<T>) {
        #[allow(clippy::unwrap_used)]
        let mut strategies = self.strategies.lock().unwrap();
        let index = index.min(strategies.len());
        strategies.insert(index, strategy);
    }

    /// Remove the first strategy with this name. Returns whether one existed.
    pub fn remove(&self, name: &str) -> bool {
        #[allow(clippy::unwrap_used)]
        let mut strategies = self.strategies.lock().unwrap();
        let before = strategies.len();
        if let Some(pos) = strategies.iter().position(|s| s.name == name) {
            strategies.remove(pos);
        }
        strategies.len() < before
    }

    /// Names of the current strategies, in order.
    #[must_use]
    #[allow(clippy::unwrap_used)] // mutex poisoning is unrecoverable here
    pub fn strategy_names(&self) -> Vec<String> {
        self.strategies
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.name.clone())
            .collect()
    }

    /// Walk the chain.
    ///
    /// # Errors
    ///
    /// When every strategy fails and no default is configured, fails with an
    /// aggregate carrying each strategy's error.
    pub async fn execute(&self) -> Result<FallbackOutcome<T>> {
        let strategies = self.snapshot();
        let started = Instant::now();
        let mut errors: Vec<(String, RpcError)> = Vec::new();

        for (index, strategy) in strategies.iter().enumerate() {
            if let Some(guard) = &strategy.should_attempt {
                if !guard().await {
                    debug!(strategy = %strategy.name, "Skipping guarded strategy");
                    continue;
                }
            }

            let attempt = (strategy.run)();
            let result = match strategy.timeout {
                Some(timeout) => tokio::time::timeout(timeout, attempt)
                    .await
                    .unwrap_or_else(|_| {
                        Err(RpcError::timeout(format!(
                            "strategy '{}' timed out after {timeout:?}",
                            strategy.name
                        )))
                    }),
                None => attempt.await,
            };

            match result {
                Ok(value) => {
                    return Ok(FallbackOutcome {
                        value,
                        strategy_index: index,
                        strategy_name: strategy.name.clone(),
                        errors,
                        duration: started.elapsed(),
                    });
                }
                Err(err) => {
                    warn!(strategy = %strategy.name, error = %err, "Fallback strategy failed");
                    errors.push((strategy.name.clone(), err));
                }
            }
        }

        if let Some(default) = &self.default {
            return Ok(FallbackOutcome {
                value: default.clone(),
                strategy_index: strategies.len(),
                strategy_name: "(default)".into(),
                errors,
                duration: started.elapsed(),
            });
        }

        Err(RpcError::fallback_exhausted(errors))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
