//! Settings structs and loading logic.
//!
//! All settings have sensible defaults matching the component defaults, can
//! be built in code, and can optionally be overridden via configuration
//! files or environment variables. Nothing in the library requires a file
//! to exist.

use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use rpc_guard::{
    BreakerConfig, BulkheadConfig, CacheConfig, RateLimiterConfig, RetryConfig, TimeoutConfig,
};
use serde::Deserialize;

use crate::live::connection_manager::ManagerConfig;
use crate::live::poll_manager::PollConfig;

// ═══════════════════════════════════════════════════════════════════════════════
// ROOT SETTINGS
// ═══════════════════════════════════════════════════════════════════════════════

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Settings {
    /// Cache configuration.
    #[serde(default)]
    pub cache: CacheSettings,
    /// Retry/backoff configuration.
    #[serde(default)]
    pub retry: RetrySettings,
    /// Per-chain circuit breaker configuration.
    #[serde(default)]
    pub breaker: BreakerSettings,
    /// Rate limiter configuration.
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    /// Bulkhead configuration.
    #[serde(default)]
    pub bulkhead: BulkheadSettings,
    /// Hierarchical timeout configuration.
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    /// WebSocket connection manager configuration.
    #[serde(default)]
    pub realtime: RealtimeSettings,
    /// Polling transport configuration.
    #[serde(default)]
    pub polling: PollingSettings,
    /// Balance service configuration.
    #[serde(default)]
    pub balance: BalanceSettings,
    /// Transaction service configuration.
    #[serde(default)]
    pub transaction: TransactionSettings,
    /// Tracking service configuration.
    #[serde(default)]
    pub tracking: TrackingSettings,
}

impl Settings {
    /// Load settings from configuration files and environment variables.
    ///
    /// Files are loaded in this order (later overrides earlier):
    /// 1. `config/default.toml`
    /// 2. `config/{environment}.toml` (if exists)
    /// 3. Environment variables with `WALLETWATCH__` prefix
    ///
    /// # Arguments
    /// * `environment` - Environment name (e.g., "testnet", "production")
    ///
    /// # Errors
    /// Returns `ConfigError` if configuration is invalid or cannot be loaded.
    pub fn load(environment: &str) -> Result<Self, ConfigError> {
        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".into());

        Config::builder()
            .add_source(File::with_name(&format!("{config_dir}/default")).required(false))
            .add_source(File::with_name(&format!("{config_dir}/{environment}")).required(false))
            .add_source(
                Environment::with_prefix("WALLETWATCH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Load settings from a specific file path.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from(path.as_ref()))
            .build()?
            .try_deserialize()
    }

    /// Validate settings and return any validation errors.
    ///
    /// # Errors
    /// Returns a list of validation error messages.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.cache.capacity == 0 {
            errors.push("cache.capacity must be non-zero".into());
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            errors.push("retry.max_delay_ms cannot be below retry.base_delay_ms".into());
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            errors.push("retry.jitter_factor must be within [0, 1]".into());
        }
        if self.rate_limit.capacity < 1.0 {
            errors.push("rate_limit.capacity must be at least 1".into());
        }
        if self.rate_limit.refill_rate <= 0.0 {
            errors.push("rate_limit.refill_rate must be positive".into());
        }
        if self.bulkhead.max_concurrent == 0 {
            errors.push("bulkhead.max_concurrent must be non-zero".into());
        }
        let t = &self.timeouts;
        if !(t.connection_ms <= t.request_ms
            && t.request_ms <= t.operation_ms
            && t.operation_ms <= t.global_ms)
        {
            errors.push(
                "timeouts must satisfy connection <= request <= operation <= global".into(),
            );
        }
        if self.transaction.max_page_size == 0 {
            errors.push("transaction.max_page_size must be non-zero".into());
        }
        if self.tracking.polling_interval_ms == 0 {
            errors.push("tracking.polling_interval_ms must be non-zero".into());
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SECTION SETTINGS
// ═══════════════════════════════════════════════════════════════════════════════

/// Cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Maximum entries before eviction.
    pub capacity: usize,
    /// Default TTL in milliseconds.
    pub default_ttl_ms: u64,
    /// Use LRU eviction (otherwise oldest insertion).
    pub lru_enabled: bool,
    /// Optional environment prefix for cache keys.
    pub environment: Option<String>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: 1000,
            default_ttl_ms: 60_000,
            lru_enabled: true,
            environment: None,
        }
    }
}

impl CacheSettings {
    /// Get the default TTL as a `Duration`.
    #[must_use]
    pub const fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    /// Build the cache configuration.
    #[must_use]
    pub fn to_config(&self) -> CacheConfig {
        CacheConfig {
            capacity: self.capacity,
            default_ttl: self.default_ttl(),
            lru_enabled: self.lru_enabled,
            environment: self.environment.clone(),
        }
    }
}

/// Retry/backoff configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Retries after the first attempt.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Ceiling for any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Exponential growth factor.
    pub multiplier: f64,
    /// Jitter amplitude in `[0, 1]`.
    pub jitter_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter_factor: 0.3,
        }
    }
}

impl RetrySettings {
    /// Build the retry configuration.
    #[must_use]
    pub fn to_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            jitter_factor: self.jitter_factor,
            ..RetryConfig::default()
        }
    }
}

/// Per-chain circuit breaker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Failures needed to open.
    pub failure_threshold: u64,
    /// Half-open successes needed to close.
    pub success_threshold: u64,
    /// Open window in milliseconds.
    pub timeout_ms: u64,
    /// Minimum traffic before failures can open the circuit.
    pub volume_threshold: u64,
    /// Rolling statistics window in milliseconds.
    pub rolling_window_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            timeout_ms: 30_000,
            volume_threshold: 10,
            rolling_window_ms: 60_000,
        }
    }
}

impl BreakerSettings {
    /// Build a breaker configuration with the given circuit name.
    #[must_use]
    pub fn to_config(&self, name: impl Into<String>) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            timeout: Duration::from_millis(self.timeout_ms),
            volume_threshold: self.volume_threshold,
            rolling_window: Duration::from_millis(self.rolling_window_ms),
            name: name.into(),
        }
    }
}

/// Rate limiter configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Bucket capacity.
    pub capacity: f64,
    /// Tokens per second.
    pub refill_rate: f64,
    /// Longest queued wait in milliseconds.
    pub max_wait_ms: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            capacity: 50.0,
            refill_rate: 10.0,
            max_wait_ms: 5_000,
        }
    }
}

impl RateLimitSettings {
    /// Build a limiter configuration with the given name.
    #[must_use]
    pub fn to_config(&self, name: impl Into<String>) -> RateLimiterConfig {
        RateLimiterConfig {
            capacity: self.capacity,
            refill_rate: self.refill_rate,
            max_wait: Duration::from_millis(self.max_wait_ms),
            name: name.into(),
        }
    }
}

/// Bulkhead configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BulkheadSettings {
    /// Concurrent operations allowed.
    pub max_concurrent: usize,
    /// Queue depth beyond the concurrent cap.
    pub max_queue: usize,
    /// Queued wait bound in milliseconds.
    pub queue_timeout_ms: u64,
}

impl Default for BulkheadSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_queue: 50,
            queue_timeout_ms: 5_000,
        }
    }
}

impl BulkheadSettings {
    /// Build a bulkhead configuration with the given name.
    #[must_use]
    pub fn to_config(&self, name: impl Into<String>) -> BulkheadConfig {
        BulkheadConfig {
            max_concurrent: self.max_concurrent,
            max_queue: self.max_queue,
            queue_timeout: Duration::from_millis(self.queue_timeout_ms),
            name: name.into(),
        }
    }
}

/// Hierarchical timeout configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    /// Connection-level deadline in milliseconds.
    pub connection_ms: u64,
    /// Request-level deadline in milliseconds.
    pub request_ms: u64,
    /// Operation-level deadline in milliseconds.
    pub operation_ms: u64,
    /// Global ceiling in milliseconds.
    pub global_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connection_ms: 5_000,
            request_ms: 10_000,
            operation_ms: 30_000,
            global_ms: 60_000,
        }
    }
}

impl TimeoutSettings {
    /// Build the timeout configuration.
    #[must_use]
    pub const fn to_config(&self) -> TimeoutConfig {
        TimeoutConfig {
            connection: Duration::from_millis(self.connection_ms),
            request: Duration::from_millis(self.request_ms),
            operation: Duration::from_millis(self.operation_ms),
            global: Duration::from_millis(self.global_ms),
        }
    }
}

/// WebSocket connection manager configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RealtimeSettings {
    /// First reconnect delay in milliseconds.
    pub reconnect_base_delay_ms: u64,
    /// Reconnect delay ceiling in milliseconds.
    pub reconnect_max_delay_ms: u64,
    /// Reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Heartbeat cadence in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Pong deadline in milliseconds.
    pub pong_timeout_ms: u64,
    /// Connect deadline in milliseconds.
    pub connection_timeout_ms: u64,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            max_reconnect_attempts: 10,
            heartbeat_interval_ms: 30_000,
            pong_timeout_ms: 10_000,
            connection_timeout_ms: 10_000,
        }
    }
}

impl RealtimeSettings {
    /// Build the connection manager configuration.
    #[must_use]
    pub const fn to_config(&self) -> ManagerConfig {
        ManagerConfig {
            reconnect_base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            reconnect_max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            pong_timeout: Duration::from_millis(self.pong_timeout_ms),
            connection_timeout: Duration::from_millis(self.connection_timeout_ms),
        }
    }
}

/// Polling transport configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollingSettings {
    /// Poll cadence in milliseconds.
    pub poll_interval_ms: u64,
    /// WebSocket recovery probe cadence in milliseconds.
    pub ws_recovery_interval_ms: u64,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            ws_recovery_interval_ms: 10_000,
        }
    }
}

impl PollingSettings {
    /// Build the poll manager configuration.
    #[must_use]
    pub const fn to_config(&self) -> PollConfig {
        PollConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            ws_recovery_interval: Duration::from_millis(self.ws_recovery_interval_ms),
        }
    }
}

/// Balance service configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BalanceSettings {
    /// Probe the cache before fetching.
    pub cache_enabled: bool,
    /// Route batch reads through the batch processor.
    pub batch_enabled: bool,
    /// Wrap fetches in the per-chain circuit breaker.
    pub breaker_enabled: bool,
    /// Wrap fetches in the retry policy.
    pub retry_enabled: bool,
    /// TTL for cached balances in milliseconds.
    pub cache_ttl_ms: u64,
    /// Batch window in milliseconds.
    pub batch_window_ms: u64,
    /// Maximum requests per batch.
    pub batch_max_size: usize,
}

impl Default for BalanceSettings {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            batch_enabled: true,
            breaker_enabled: true,
            retry_enabled: true,
            cache_ttl_ms: 30_000,
            batch_window_ms: 50,
            batch_max_size: 50,
        }
    }
}

impl BalanceSettings {
    /// Get the balance cache TTL as a `Duration`.
    #[must_use]
    pub const fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    /// Get the batch window as a `Duration`.
    #[must_use]
    pub const fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }
}

/// Transaction service configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransactionSettings {
    /// TTL for cached transaction lists in milliseconds.
    pub cache_ttl_ms: u64,
    /// Largest allowed page size.
    pub max_page_size: usize,
    /// Wrap fetches in the per-chain circuit breaker.
    pub breaker_enabled: bool,
    /// Wrap fetches in the retry policy.
    pub retry_enabled: bool,
}

impl Default for TransactionSettings {
    fn default() -> Self {
        Self {
            cache_ttl_ms: 30_000,
            max_page_size: 100,
            breaker_enabled: true,
            retry_enabled: true,
        }
    }
}

impl TransactionSettings {
    /// Get the transaction cache TTL as a `Duration`.
    #[must_use]
    pub const fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

/// Tracking service configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackingSettings {
    /// Tick cadence in milliseconds.
    pub polling_interval_ms: u64,
    /// Emit balance change callbacks.
    pub track_balances: bool,
    /// Emit new-transaction callbacks.
    pub track_transactions: bool,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            polling_interval_ms: 30_000,
            track_balances: true,
            track_transactions: true,
        }
    }
}

impl TrackingSettings {
    /// Get the tick cadence as a `Duration`.
    #[must_use]
    pub const fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
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
    fn defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();

        assert_eq!(settings.cache.capacity, 1000);
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.timeouts.connection_ms, 5_000);
        assert_eq!(settings.polling.poll_interval_ms, 5_000);
        assert_eq!(settings.tracking.polling_interval_ms, 30_000);
    }

    #[test]
    fn validation_catches_inverted_timeouts() {
        let mut settings = Settings::default();
        settings.timeouts.connection_ms = 20_000;

        let errors = settings.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("timeouts")));
    }

    #[test]
    fn validation_catches_zero_capacity() {
        let mut settings = Settings::default();
        settings.cache.capacity = 0;

        let errors = settings.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("cache.capacity")));
    }

    #[test]
    fn validation_catches_bad_retry_delays() {
        let mut settings = Settings::default();
        settings.retry.base_delay_ms = 60_000;

        let errors = settings.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("retry.max_delay_ms")));
    }

    #[test]
    fn duration_accessors_convert_milliseconds() {
        let settings = Settings::default();
        assert_eq!(settings.cache.default_ttl(), Duration::from_secs(60));
        assert_eq!(settings.balance.cache_ttl(), Duration::from_secs(30));
        assert_eq!(settings.balance.batch_window(), Duration::from_millis(50));
        assert_eq!(settings.tracking.polling_interval(), Duration::from_secs(30));
    }

    #[test]
    fn section_configs_carry_settings_through() {
        let settings = Settings::default();

        let cache = settings.cache.to_config();
        assert_eq!(cache.capacity, 1000);
        assert!(cache.lru_enabled);

        let breaker = settings.breaker.to_config("chain:1");
        assert_eq!(breaker.failure_threshold, 5);
        assert_eq!(breaker.name, "chain:1");

        let manager = settings.realtime.to_config();
        assert_eq!(manager.max_reconnect_attempts, 10);

        let poll = settings.polling.to_config();
        assert_eq!(poll.ws_recovery_interval, Duration::from_secs(10));
    }
}
