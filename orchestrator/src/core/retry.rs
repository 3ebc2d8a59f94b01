//! Retry scheduling helpers

use std::time::Duration;

/// Delay before retry number `retry` (0-based): base, 2×base, 4×base, ...
pub fn backoff_delay(base: Duration, retry: u32) -> Duration {
    base.saturating_mul(1u32 << retry.min(16))
}

/// Delay before the next retry, `None` once `max_retries` are used up
pub fn next_retry(base: Duration, retries_done: u32, max_retries: u32) -> Option<Duration> {
    if retries_done >= max_retries {
        None
    } else {
        Some(backoff_delay(base, retries_done))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(4));
    }

    #[test]
    fn test_next_retry_stops_at_limit() {
        let base = Duration::from_millis(100);
        assert_eq!(next_retry(base, 0, 2), Some(Duration::from_millis(100)));
        assert_eq!(next_retry(base, 1, 2), Some(Duration::from_millis(200)));
        assert_eq!(next_retry(base, 2, 2), None);
    }

    #[test]
    fn test_huge_retry_count_saturates() {
        assert_eq!(backoff_delay(Duration::MAX, 40), Duration::MAX);
    }
}
