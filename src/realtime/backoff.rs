//! Reconnect Backoff Policy

use std::time::Duration;

/// Exponential backoff: `min(base * multiplier^(attempt - 1), cap)`
///
/// Delays are rounded to the nearest millisecond.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(3000),
            multiplier: 1.5,
            cap: Duration::from_millis(30_000),
        }
    }
}

impl BackoffPolicy {
    /// Create a policy; multipliers below 1.0 are raised to 1.0
    pub fn new(base: Duration, multiplier: f64, cap: Duration) -> Self {
        let multiplier = if multiplier.is_finite() {
            multiplier.max(1.0)
        } else {
            1.0
        };
        Self {
            base,
            multiplier,
            cap: cap.max(base),
        }
    }

    /// Delay before retry number `attempt` (1-based)
    ///
    /// Attempt 0 means no failure has happened yet and yields no delay.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw_ms = (self.base.as_millis() as f64 * self.multiplier.powi(exponent)).round();
        let cap_ms = self.cap.as_millis() as f64;

        if !raw_ms.is_finite() || raw_ms >= cap_ms {
            self.cap
        } else {
            Duration::from_millis(raw_ms as u64)
        }
    }
}
