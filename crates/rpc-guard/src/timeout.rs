//! Hierarchical timeouts: CONNECTION <= REQUEST <= OPERATION <= GLOBAL.
//!
//! Four named levels with enforced ordering, so a single request can never
//! be allowed more time than the operation containing it. Violating the
//! hierarchy is a validation error at construction and on every update.

use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;

use crate::error::{Result, RpcError};

// ═══════════════════════════════════════════════════════════════════════════════
// LEVELS
// ═══════════════════════════════════════════════════════════════════════════════

/// A named timeout level, ordered from tightest to loosest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimeoutLevel {
    /// Establishing a connection.
    Connection,
    /// A single request/response round trip.
    Request,
    /// A logical operation that may span several requests.
    Operation,
    /// Absolute ceiling for anything.
    Global,
}

impl TimeoutLevel {
    const ALL: [Self; 4] = [
        Self::Connection,
        Self::Request,
        Self::Operation,
        Self::Global,
    ];

    const fn index(self) -> usize {
        match self {
            Self::Connection => 0,
            Self::Request => 1,
            Self::Operation => 2,
            Self::Global => 3,
        }
    }

    const fn name(self) -> &'static str {
        match self {
            Self::Connection => "CONNECTION",
            Self::Request => "REQUEST",
            Self::Operation => "OPERATION",
            Self::Global => "GLOBAL",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONFIG
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-level durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Connection-level deadline.
    pub connection: Duration,
    /// Request-level deadline.
    pub request: Duration,
    /// Operation-level deadline.
    pub operation: Duration,
    /// Global ceiling.
    pub global: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connection: Duration::from_secs(5),
            request: Duration::from_secs(10),
            operation: Duration::from_secs(30),
            global: Duration::from_secs(60),
        }
    }
}

impl TimeoutConfig {
    const fn as_array(self) -> [Duration; 4] {
        [self.connection, self.request, self.operation, self.global]
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MANAGER
// ═══════════════════════════════════════════════════════════════════════════════

/// Enforces the timeout hierarchy and races operations against their level.
#[derive(Debug)]
pub struct TimeoutManager {
    durations: Mutex<[Duration; 4]>,
}

impl TimeoutManager {
    /// Create a manager with validated durations.
    ///
    /// # Errors
    ///
    /// Fails when the hierarchy `CONNECTION <= REQUEST <= OPERATION <=
    /// GLOBAL` does not hold.
    pub fn new(config: TimeoutConfig) -> Result<Self> {
        let durations = config.as_array();
        Self::validate(&durations)?;
        Ok(Self {
            durations: Mutex::new(durations),
        })
    }

    /// Create a manager with the default hierarchy.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self {
            durations: Mutex::new(TimeoutConfig::default().as_array()),
        }
    }

    fn validate(durations: &[Duration; 4]) -> Result<()> {
        for pair in TimeoutLevel::ALL.windows(2) {
            let (lo, hi) = (pair[0], pair[1]);
            if durations[lo.index()] > durations[hi.index()] {
                return Err(RpcError::validation(
                    "timeouts",
                    format!("{} <= {}", lo.name(), hi.name()),
                    format!(
                        "{:?} > {:?}",
                        durations[lo.index()],
                        durations[hi.index()]
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Current duration for a level.
    #[must_use]
    pub fn get_timeout(&self, level: TimeoutLevel) -> Duration {
        #[allow(clippy::unwrap_used)]
        let durations = self.durations.lock().unwrap();
        durations[level.index()]
    }

    /// Update one level, re-validating the whole hierarchy.
    ///
    /// # Errors
    ///
    /// Fails (leaving the hierarchy unchanged) when the update would violate
    /// the ordering invariant.
    pub fn set_timeout(&self, level: TimeoutLevel, duration: Duration) -> Result<()> {
        #[allow(clippy::unwrap_used)]
        let mut durations = self.durations.lock().unwrap();
        let mut candidate = *durations;
        candidate[level.index()] = duration;
        Self::validate(&candidate)?;
        *durations = candidate;
        debug!(level = level.name(), ?duration, "Timeout updated");
        Ok(())
    }

    /// Race `fut` against the timer for `level`.
    ///
    /// # Errors
    ///
    /// On expiry, fails with a connection-timeout error carrying the level,
    /// duration, and operation name; other errors pass through unchanged.
    pub async fn execute<T>(
        &self,
        fut: impl Future<Output = Result<T>>,
        level: TimeoutLevel,
        name: &str,
    ) -> Result<T> {
        let duration = self.get_timeout(level);
        match tokio::time::timeout(duration, fut).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::timeout(format!(
                "'{name}' exceeded the {} timeout of {duration:?}",
                level.name()
            ))
            .with_context("level", level.name())
            .with_context("timeout_ms", u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
            .with_context("operation", name.to_string())),
        }
    }
}

impl Default for TimeoutManager {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokio_test::assert_ok;

    use super::*;

    #[test]
    fn default_hierarchy_is_valid() {
        assert!(TimeoutManager::new(TimeoutConfig::default()).is_ok());
    }

    #[test]
    fn construction_rejects_inverted_hierarchy() {
        let err = TimeoutManager::new(TimeoutConfig {
            connection: Duration::from_secs(20),
            request: Duration::from_secs(10),
            operation: Duration::from_secs(30),
            global: Duration::from_secs(60),
        })
        .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
        assert!(err.to_string().contains("CONNECTION <= REQUEST"));
    }

    #[test]
    fn set_timeout_revalidates() {
        let manager = TimeoutManager::with_defaults();

        // Raising GLOBAL is fine.
        assert_ok!(manager.set_timeout(TimeoutLevel::Global, Duration::from_secs(120)));

        // Raising CONNECTION above REQUEST is not.
        let err = manager
            .set_timeout(TimeoutLevel::Connection, Duration::from_secs(15))
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");

        // Failed updates must not partially apply.
        assert_eq!(
            manager.get_timeout(TimeoutLevel::Connection),
            Duration::from_secs(5)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn execute_times_out_at_its_level() {
        let manager = TimeoutManager::with_defaults();

        let result: Result<u32> = manager
            .execute(
                async {
                    tokio::time::sleep(Duration::from_secs(600)).await;
                    Ok(1)
                },
                TimeoutLevel::Connection,
                "ws connect",
            )
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.code(), "TIMEOUT");
        assert!(err.to_string().contains("CONNECTION"));
        assert!(err.to_string().contains("ws connect"));
        assert_eq!(
            err.redacted_context().get("timeout_ms"),
            Some(&serde_json::json!(5000))
        );
    }

    #[tokio::test]
    async fn execute_passes_success_and_errors_through() {
        let manager = TimeoutManager::with_defaults();

        let ok: Result<u32> = manager
            .execute(async { Ok(7) }, TimeoutLevel::Request, "fast")
            .await;
        assert_eq!(ok.unwrap(), 7);

        let err: Result<u32> = manager
            .execute(
                async { Err(RpcError::data("bad payload")) },
                TimeoutLevel::Request,
                "failing",
            )
            .await;
        assert_eq!(err.unwrap_err().code(), "DATA");
    }
}
