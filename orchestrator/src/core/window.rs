//! Sliding window with lockout
//!
//! Attempts are counted over `(now - window, now]`. Reaching the quota sets a
//! lockout; while it is active every request is denied. Once the lockout has
//! lapsed the window starts over empty.

use chrono::{DateTime, Utc};
use shared::RateLimitRecord;
use std::time::Duration;

use crate::config::RateLimitRule;

/// Result of evaluating one request against a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowDecision {
    pub allowed: bool,
    pub retry_after: Option<Duration>,
    /// Record to persist, `None` when nothing changed
    pub next: Option<RateLimitRecord>,
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    // Out of range configuration saturates to a century
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
}

/// Evaluate a request made at `now`
pub fn evaluate(record: &RateLimitRecord, now: DateTime<Utc>, rule: &RateLimitRule) -> WindowDecision {
    if let Some(locked_until) = record.locked_until {
        if locked_until > now {
            return WindowDecision {
                allowed: false,
                retry_after: Some((locked_until - now).to_std().unwrap_or(Duration::ZERO)),
                next: None,
            };
        }
    }

    let lapsed_lockout = record.locked_until.is_some();
    let window_start = now - to_chrono(rule.window);
    let mut attempts: Vec<DateTime<Utc>> = if lapsed_lockout {
        Vec::new()
    } else {
        record
            .attempts
            .iter()
            .copied()
            .filter(|at| *at > window_start && *at <= now)
            .collect()
    };

    if attempts.len() as u64 >= rule.max_attempts as u64 {
        return WindowDecision {
            allowed: false,
            retry_after: Some(rule.lockout),
            next: Some(RateLimitRecord {
                revision: record.revision + 1,
                attempts,
                locked_until: Some(now + to_chrono(rule.lockout)),
            }),
        };
    }

    attempts.push(now);
    WindowDecision {
        allowed: true,
        retry_after: None,
        next: Some(RateLimitRecord {
            revision: record.revision + 1,
            attempts,
            locked_until: None,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule() -> RateLimitRule {
        RateLimitRule::new(3, Duration::from_secs(60), Duration::from_secs(300))
    }

    fn apply(record: &mut RateLimitRecord, now: DateTime<Utc>) -> WindowDecision {
        let decision = evaluate(record, now, &rule());
        if let Some(next) = &decision.next {
            *record = next.clone();
        }
        decision
    }

    #[test]
    fn test_allows_up_to_quota_then_locks_out() {
        let mut record = RateLimitRecord::default();
        let now = Utc::now();

        for i in 0..3 {
            assert!(apply(&mut record, now + chrono::Duration::seconds(i)).allowed);
        }
        let denied = apply(&mut record, now + chrono::Duration::seconds(3));
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(Duration::from_secs(300)));
        assert!(record.locked_until.is_some());
    }

    #[test]
    fn test_lockout_reports_remaining_time_without_writing() {
        let now = Utc::now();
        let record = RateLimitRecord {
            revision: 4,
            attempts: vec![],
            locked_until: Some(now + chrono::Duration::seconds(42)),
        };

        let decision = evaluate(&record, now, &rule());
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after, Some(Duration::from_secs(42)));
        assert!(decision.next.is_none());
    }

    #[test]
    fn test_lapsed_lockout_resets_window() {
        let now = Utc::now();
        let record = RateLimitRecord {
            revision: 7,
            attempts: vec![now - chrono::Duration::seconds(1); 3],
            locked_until: Some(now - chrono::Duration::seconds(1)),
        };

        let decision = evaluate(&record, now, &rule());
        assert!(decision.allowed);
        let next = decision.next.unwrap();
        assert_eq!(next.attempts, vec![now]);
        assert!(next.locked_until.is_none());
        assert_eq!(next.revision, 8);
    }

    #[test]
    fn test_attempts_outside_window_are_pruned() {
        let now = Utc::now();
        let record = RateLimitRecord {
            revision: 1,
            attempts: vec![now - chrono::Duration::seconds(120), now - chrono::Duration::seconds(61)],
            locked_until: None,
        };

        let decision = evaluate(&record, now, &rule());
        assert!(decision.allowed);
        assert_eq!(decision.next.unwrap().attempts, vec![now]);
    }
}
