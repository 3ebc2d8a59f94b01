//! Lease acquisition rules
//!
//! Pure decision over a lease snapshot. The lease manager turns a grant into
//! a compare-and-swap against the snapshot it evaluated, so two callers that
//! both see a grantable lease cannot both win.

use chrono::{DateTime, Utc};
use shared::{LeaseState, LeaseStatus};
use std::time::Duration;

/// Outcome of evaluating a lease snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseDecision {
    /// The lease may be taken; `reclaimed` when a stale holder is evicted
    Grant { reclaimed: bool },
    /// A live holder owns the lease
    Deny { held_for: Duration, remaining: Duration },
}

impl LeaseDecision {
    pub fn is_grant(&self) -> bool {
        matches!(self, LeaseDecision::Grant { .. })
    }
}

/// Age of a busy lease at `now`; `None` when the lease is not busy
///
/// Clock skew that puts the acquisition in the future counts as age zero.
pub fn lease_age(state: &LeaseState, now: DateTime<Utc>) -> Option<Duration> {
    if state.status != LeaseStatus::Busy {
        return None;
    }
    let acquired_at = state.acquired_at?;
    Some((now - acquired_at).to_std().unwrap_or(Duration::ZERO))
}

/// Decide whether a new attempt may take the lease
pub fn evaluate(state: &LeaseState, now: DateTime<Utc>, timeout: Duration) -> LeaseDecision {
    if state.status != LeaseStatus::Busy {
        return LeaseDecision::Grant { reclaimed: false };
    }

    match lease_age(state, now) {
        // Busy without a timestamp cannot expire on its own
        None => LeaseDecision::Grant { reclaimed: true },
        Some(age) if age > timeout => LeaseDecision::Grant { reclaimed: true },
        Some(age) => LeaseDecision::Deny {
            held_for: age,
            remaining: timeout - age,
        },
    }
}

/// Whether a live (non-expired) holder owns the lease
pub fn is_held(state: &LeaseState, now: DateTime<Utc>, timeout: Duration) -> bool {
    !evaluate(state, now, timeout).is_grant()
}
