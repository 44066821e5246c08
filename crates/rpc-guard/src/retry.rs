//! Bounded exponential backoff with jitter and error classification.
//!
//! Attempt `n` (0-indexed) waits `min(base * multiplier^n, max)` before the
//! next try, jittered uniformly by `+-jitter_factor`. Whether an error is
//! worth retrying is decided by the error's own retriability flag, with an
//! allow-list of codes for errors the taxonomy cannot classify.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::error::{DEFAULT_RETRIABLE_CODES, ErrorKind, Result, RpcError};

// ═══════════════════════════════════════════════════════════════════════════════
// CONFIG
// ═══════════════════════════════════════════════════════════════════════════════

/// Callback invoked before each retry sleep: `(attempt, error, delay)`.
/// `attempt` is 1-based (the retry about to happen).
pub type OnRetry = Arc<dyn Fn(u32, &RpcError, Duration) + Send + Sync>;

/// Retry policy configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt; total attempts are `max_attempts + 1`.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling for any single delay.
    pub max_delay: Duration,
    /// Exponential growth factor.
    pub multiplier: f64,
    /// Jitter amplitude in `[0, 1]`, as a fraction of the computed delay.
    pub jitter_factor: f64,
    /// Codes retried even when the error itself is not marked retriable.
    pub retriable_codes: HashSet<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.3,
            retriable_codes: DEFAULT_RETRIABLE_CODES
                .iter()
                .map(|c| (*c).to_string())
                .collect(),
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<()> {
        if self.max_delay < self.base_delay {
            return Err(RpcError::validation(
                "max_delay",
                ">= base_delay",
                format!("{:?} < {:?}", self.max_delay, self.base_delay),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(RpcError::validation(
                "jitter_factor",
                "within [0, 1]",
                self.jitter_factor.to_string(),
            ));
        }
        if self.multiplier < 1.0 {
            return Err(RpcError::validation(
                "multiplier",
                ">= 1",
                self.multiplier.to_string(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// STATS
// ═══════════════════════════════════════════════════════════════════════════════

/// What one retried execution actually did.
#[derive(Debug, Clone)]
pub struct RetryStats {
    /// Attempts made (including the successful one).
    pub attempts: u32,
    /// Total time slept between attempts.
    pub total_delay: Duration,
    /// The error from each failed attempt, in order.
    pub errors: Vec<RpcError>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// RETRY POLICY
// ═══════════════════════════════════════════════════════════════════════════════

/// Retries an async operation with jittered exponential backoff.
pub struct RetryPolicy {
    config: RetryConfig,
    on_retry: Option<OnRetry>,
    rng: Mutex<StdRng>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .field("on_retry", &self.on_retry.as_ref().map(|_| "<callback>"))
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// Create a policy with validated configuration.
    ///
    /// # Errors
    ///
    /// Fails when `max_delay < base_delay`, the jitter factor leaves
    /// `[0, 1]`, or the multiplier shrinks delays.
    pub fn new(config: RetryConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            on_retry: None,
            rng: Mutex::new(StdRng::from_os_rng()),
        })
    }

    /// Seed the jitter RNG for reproducible delays in tests.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Register a callback invoked before every retry sleep.
    #[must_use]
    pub fn with_on_retry(mut self, on_retry: OnRetry) -> Self {
        self.on_retry = Some(on_retry);
        self
    }

    /// Whether the policy would retry this error.
    #[must_use]
    pub fn should_retry(&self, err: &RpcError) -> bool {
        if err.is_retriable() {
            return true;
        }
        if self.config.retriable_codes.contains(err.code()) {
            return true;
        }
        // Generic errors also match on message, so wrapped transport errors
        // like "connection TIMEOUT while reading" are still retried.
        if let ErrorKind::Other { message, .. } = err.kind() {
            return self
                .config
                .retriable_codes
                .iter()
                .any(|code| message.contains(code.as_str()));
        }
        false
    }

    /// Jittered delay before the retry following attempt `n` (0-indexed).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.config.multiplier.powi(i32::try_from(attempt).unwrap_or(i32::MAX));
        let capped =
            (self.config.base_delay.as_secs_f64() * exp).min(self.config.max_delay.as_secs_f64());

        let jittered = if self.config.jitter_factor > 0.0 {
            #[allow(clippy::unwrap_used)]
            let mut rng = self.rng.lock().unwrap();
            let amplitude = self.config.jitter_factor;
            capped * (1.0 + rng.random_range(-amplitude..=amplitude))
        } else {
            capped
        };

        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// Run `op`, retrying per policy.
    ///
    /// # Errors
    ///
    /// Returns the final error once attempts are exhausted or the error is
    /// classified non-retriable.
    pub async fn execute<T, Fut>(&self, op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_stats(op).await.map(|(value, _)| value)
    }

    /// Run `op`, retrying per policy, and report what happened.
    ///
    /// # Errors
    ///
    /// Same as [`execute`](Self::execute).
    pub async fn execute_with_stats<T, Fut>(
        &self,
        mut op: impl FnMut() -> Fut,
    ) -> Result<(T, RetryStats)>
    where
        Fut: Future<Output = Result<T>>,
    {
        let mut stats = RetryStats {
            attempts: 0,
            total_delay: Duration::ZERO,
            errors: Vec::new(),
        };

        for attempt in 0..=self.config.max_attempts {
            stats.attempts += 1;
            match op().await {
                Ok(value) => return Ok((value, stats)),
                Err(err) => {
                    let out_of_attempts = attempt == self.config.max_attempts;
                    if out_of_attempts || !self.should_retry(&err) {
                        stats.errors.push(err.clone());
                        return Err(err);
                    }

                    let delay = self.delay_for_attempt(attempt);
                    debug!(
                        attempt = attempt + 1,
                        ?delay,
                        error = %err,
                        "Retrying after failure"
                    );
                    if let Some(on_retry) = &self.on_retry {
                        on_retry(attempt + 1, &err, delay);
                    }
                    stats.errors.push(err);
                    stats.total_delay += delay;
                    tokio::time::sleep(delay).await;
                }
            }
        }

        // max_attempts is finite, so the loop always returns above.
        Err(RpcError::other("retry loop exhausted"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
