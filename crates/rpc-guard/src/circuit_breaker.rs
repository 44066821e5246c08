//! Circuit breaker: CLOSED -> OPEN -> HALF_OPEN failure isolation.
//!
//! A closed circuit passes operations through and counts outcomes inside a
//! rolling window. Once enough traffic has been seen (`volume_threshold`)
//! and failures reach `failure_threshold`, the circuit opens and fails fast
//! without invoking the operation. After `timeout` a single caller is let
//! through as a probe (half-open); one failure reopens immediately, while
//! `success_threshold` consecutive successes close the circuit again.
//!
//! State transitions are atomic between calls: no caller ever observes a
//! partially applied transition.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Result, RpcError};

// ═══════════════════════════════════════════════════════════════════════════════
// CONFIG
// ═══════════════════════════════════════════════════════════════════════════════

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures (within the rolling window) needed to open.
    pub failure_threshold: u64,
    /// Half-open successes needed to close.
    pub success_threshold: u64,
    /// How long an open circuit rejects before allowing a probe.
    pub timeout: Duration,
    /// Minimum requests in the window before failures can open the circuit.
    pub volume_threshold: u64,
    /// Length of the rolling statistics window.
    pub rolling_window: Duration,
    /// Name used in errors and logs.
    pub name: String,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            timeout: Duration::from_secs(30),
            volume_threshold: 10,
            rolling_window: Duration::from_secs(60),
            name: "circuit".into(),
        }
    }
}

impl BreakerConfig {
    /// Named config with everything else at defaults.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// STATE
// ═══════════════════════════════════════════════════════════════════════════════

/// Observable circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Operations pass through; failures are counted.
    Closed,
    /// Operations fail fast without being invoked.
    Open,
    /// Probe mode: each call is attempted, one failure reopens.
    HalfOpen,
}

/// Point-in-time breaker statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerStats {
    /// Current state.
    pub state: CircuitState,
    /// Failures in the current window.
    pub failure_count: u64,
    /// Successes in the current window.
    pub success_count: u64,
    /// Consecutive successes while half-open.
    pub half_open_successes: u64,
    /// Attempts in the current window.
    pub total_requests: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    opened_at: Option<Instant>,
    failure_count: u64,
    success_count: u64,
    half_open_successes: u64,
    total_requests: u64,
    last_failure_at: Option<Instant>,
    last_state_change_at: Instant,
    window_start: Instant,
}

// ═══════════════════════════════════════════════════════════════════════════════
// CIRCUIT BREAKER
// ═══════════════════════════════════════════════════════════════════════════════

/// A named unit of failure isolation.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        let now = Instant::now();
        Self {
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                opened_at: None,
                failure_count: 0,
                success_count: 0,
                half_open_successes: 0,
                total_requests: 0,
                last_failure_at: None,
                last_state_change_at: now,
                window_start: now,
            }),
        }
    }

    #[allow(clippy::unwrap_used)] // mutex poisoning is unrecoverable here
    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap()
    }

    /// Run `op` through the circuit.
    ///
    /// # Errors
    ///
    /// Fails fast with `CircuitOpen` while open; otherwise propagates `op`'s
    /// error after recording it.
    pub async fn execute<T, Fut>(&self, op: impl FnOnce() -> Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        self.before_attempt()?;
        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }

    /// Admission check; transitions Open -> HalfOpen when the open window
    /// has lapsed.
    fn before_attempt(&self) -> Result<()> {
        let mut state = self.lock();
        let now = Instant::now();

        if state.state == CircuitState::Closed
            && now.duration_since(state.window_start) >= self.config.rolling_window
        {
            state.window_start = now;
            state.failure_count = 0;
            state.success_count = 0;
            state.total_requests = 0;
        }

        if state.state == CircuitState::Open {
            let opened_at = state.opened_at.unwrap_or(now);
            if now.duration_since(opened_at) >= self.config.timeout {
                debug!(circuit = %self.config.name, "Circuit half-open, allowing probe");
                state.state = CircuitState::HalfOpen;
                state.half_open_successes = 0;
                state.last_state_change_at = now;
            } else {
                let remaining = self.config.timeout - now.duration_since(opened_at);
                let reset_at = chrono::Utc::now()
                    + chrono::Duration::from_std(remaining).unwrap_or_default();
                return Err(RpcError::circuit_open(
                    self.config.name.clone(),
                    reset_at,
                    state.failure_count,
                ));
            }
        }

        state.total_requests += 1;
        Ok(())
    }

    fn record_success(&self) {
        let mut state = self.lock();
        match state.state {
            CircuitState::Closed => {
                state.success_count += 1;
                state.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                state.success_count += 1;
                state.half_open_successes += 1;
                if state.half_open_successes >= self.config.success_threshold {
                    debug!(circuit = %self.config.name, "Circuit closed after successful probes");
                    state.state = CircuitState::Closed;
                    state.opened_at = None;
                    state.failure_count = 0;
                    state.half_open_successes = 0;
                    state.last_state_change_at = Instant::now();
                }
            }
            CircuitState::Open => {
                // A call admitted before the circuit opened can land here;
                // its success does not close the circuit.
                state.success_count += 1;
            }
        }
    }

    fn record_failure(&self) {
        let mut state = self.lock();
        let now = Instant::now();
        state.last_failure_at = Some(now);
        match state.state {
            CircuitState::Closed => {
                state.failure_count += 1;
                if state.total_requests >= self.config.volume_threshold
                    && state.failure_count >= self.config.failure_threshold
                {
                    warn!(
                        circuit = %self.config.name,
                        failures = state.failure_count,
                        "Circuit opened"
                    );
                    state.state = CircuitState::Open;
                    state.opened_at = Some(now);
                    state.last_state_change_at = now;
                }
            }
            CircuitState::HalfOpen => {
                warn!(circuit = %self.config.name, "Probe failed, circuit reopened");
                state.state = CircuitState::Open;
                state.opened_at = Some(now);
                state.half_open_successes = 0;
                state.failure_count += 1;
                state.last_state_change_at = now;
            }
            CircuitState::Open => {
                state.failure_count += 1;
            }
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Point-in-time statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> BreakerStats {
        let state = self.lock();
        BreakerStats {
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            half_open_successes: state.half_open_successes,
            total_requests: state.total_requests,
        }
    }

    /// Time since the last recorded failure, if any.
    #[must_use]
    pub fn last_failure_age(&self) -> Option<Duration> {
        self.lock().last_failure_at.map(|at| at.elapsed())
    }

    /// Force the circuit closed and clear all counters.
    ///
    /// Manual intervention only; normal recovery goes through half-open.
    pub fn reset(&self) {
        let mut state = self.lock();
        let now = Instant::now();
        state.state = CircuitState::Closed;
        state.opened_at = None;
        state.failure_count = 0;
        state.success_count = 0;
        state.half_open_successes = 0;
        state.total_requests = 0;
        state.last_state_change_at = now;
        state.window_start = now;
        debug!(circuit = %self.config.name, "Circuit manually reset");
    }

    /// The breaker's configured name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
