//! Timing and sizing knobs for a session engine.

use std::time::Duration;

/// Shortest period any engine timer runs at; zero periods are raised to this.
pub const MIN_TIMER_PERIOD: Duration = Duration::from_millis(1);

/// Exponential backoff for re-subscribing after the bus dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Delay before `attempt` (1-based): `initial * 2^(attempt-1)`, capped at `max`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial.saturating_mul(1u32 << exponent).min(self.max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(10),
            max_attempts: 8,
        }
    }
}

/// Session engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Quiet period after the last local edit before the document is persisted.
    pub debounce_window: Duration,
    /// Minimum spacing between cursor broadcasts.
    pub cursor_interval: Duration,
    /// Presence refresh period.
    pub heartbeat_interval: Duration,
    pub reconnect: BackoffPolicy,
    /// Fresh join codes tried before giving up on `JoinCodeTaken`.
    pub join_code_attempts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_millis(1000),
            cursor_interval: Duration::from_millis(50),
            heartbeat_interval: Duration::from_secs(10),
            reconnect: BackoffPolicy::default(),
            join_code_attempts: 5,
        }
    }
}

impl SyncConfig {
    /// Production timings with a short reconnect schedule.
    pub fn for_testing() -> Self {
        Self {
            reconnect: BackoffPolicy {
                initial: Duration::from_millis(10),
                max: Duration::from_millis(80),
                max_attempts: 3,
            },
            ..Self::default()
        }
    }
}
