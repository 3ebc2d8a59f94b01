//! Orchestration components
//!
//! Each component owns one concern and talks to the outside world only
//! through the collaborator traits in `crate::traits`.

pub mod batch;
pub mod build;
pub mod change_detector;
pub mod lease;
pub mod outbox;
pub mod rate_limiter;
pub mod refresh;

pub use batch::{BatchCoordinator, BatchSummary};
pub use build::{BuildOrchestrator, BuildOutcome, SkipReason};
pub use change_detector::ChangeDetector;
pub use lease::{LeaseGrant, LeaseManager};
pub use outbox::{OutboxReport, OutboxWorker};
pub use rate_limiter::{RateLimitDecision, RateLimiter};
pub use refresh::{RefreshOrchestrator, RefreshOutcome};
