//! Validated timing values.

use std::time::Duration;

use super::ConfigError;

/// Debounce interval for per-document edit coalescing (50–2000 ms).
///
/// Too short and rapid typing dispatches a call per keystroke; too long and
/// diagnostics feel laggy. Values outside the range are rejected by
/// [`DebounceInterval::new`]; configuration resolution falls back to the
/// default with a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceInterval(Duration);

impl DebounceInterval {
    const DEFAULT_MS: u64 = 250;
    pub const MIN_MS: u64 = 50;
    pub const MAX_MS: u64 = 2000;

    /// Create a debounce interval, rejecting values outside 50–2000 ms.
    ///
    /// Bounds are inclusive and checked at millisecond precision, so
    /// `2000.5ms` is rejected while `2000ms` is accepted.
    pub fn new(duration: Duration) -> Result<Self, ConfigError> {
        let min = Duration::from_millis(Self::MIN_MS);
        let max = Duration::from_millis(Self::MAX_MS);
        if duration < min || duration > max {
            return Err(ConfigError::OutOfRange {
                name: "scheduler.debounce_ms",
                value: duration.as_millis().to_string(),
                expected: format!("{}..={}", Self::MIN_MS, Self::MAX_MS),
            });
        }
        Ok(Self(duration))
    }

    pub fn from_millis(ms: u64) -> Result<Self, ConfigError> {
        Self::new(Duration::from_millis(ms))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl Default for DebounceInterval {
    fn default() -> Self {
        Self(Duration::from_millis(Self::DEFAULT_MS))
    }
}
