//! Exponential backoff schedule shared by every retry loop.

use std::time::Duration;

/// First delay.
pub const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Delays never exceed this.
pub const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Compute the delay before retry `attempt` (zero-based): base 500 ms,
/// factor 2, capped at 30 s.
pub fn backoff_delay(attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
    BACKOFF_BASE.saturating_mul(factor).min(BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff_delay(0), Duration::from_millis(500));
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(6), Duration::from_secs(30));
        assert_eq!(backoff_delay(31), BACKOFF_CAP);
    }
}
