//! Per-user rate limiter
//!
//! Sliding window plus lockout for each (user, action) pair. The record is
//! updated with a revision-checked swap so concurrent requests from the same
//! user cannot both slip under the quota.

use shared::{process_debug, process_warn, ProcessId, RateLimitAction, UserId};
use std::sync::Arc;
use std::time::Duration;

use crate::config::RateLimitConfig;
use crate::core::window;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::traits::{Clock, EntityStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub retry_after: Option<Duration>,
}

pub struct RateLimiter<S, C>
where
    S: EntityStore + 'static,
    C: Clock + 'static,
{
    store: Arc<S>,
    clock: Arc<C>,
    config: RateLimitConfig,
}

impl<S, C> RateLimiter<S, C>
where
    S: EntityStore + 'static,
    C: Clock + 'static,
{
    pub fn new(store: Arc<S>, clock: Arc<C>, config: RateLimitConfig) -> Self {
        Self { store, clock, config }
    }

    /// Count one request against the quota of `action`
    pub async fn check_and_record(
        &self,
        user_id: &UserId,
        action: RateLimitAction,
    ) -> OrchestratorResult<RateLimitDecision> {
        let rule = self.config.rule(action);

        for round in 0..=self.config.max_contention_retries {
            let record = self.store.load_rate_limit(user_id, action).await?;
            let decision = window::evaluate(&record, self.clock.now(), &rule);
            let result = RateLimitDecision {
                allowed: decision.allowed,
                retry_after: decision.retry_after,
            };

            let Some(next) = decision.next else {
                return Ok(result);
            };
            if self.store.swap_rate_limit(user_id, action, record.revision, next).await? {
                if !result.allowed {
                    process_warn!(
                        ProcessId::current(),
                        "🚦 User {} locked out of {} for {:?}",
                        user_id,
                        action,
                        result.retry_after.unwrap_or_default()
                    );
                }
                return Ok(result);
            }

            process_debug!(
                ProcessId::current(),
                "🚦 Rate limit record for {}/{} changed concurrently (round {})",
                user_id,
                action,
                round + 1
            );
        }

        Err(OrchestratorError::store(
            "rate_limit",
            format!("record for {user_id}/{action} kept changing"),
        ))
    }

    /// Like `check_and_record` but turns a denial into `RateLimited`
    pub async fn enforce(&self, user_id: &UserId, action: RateLimitAction) -> OrchestratorResult<()> {
        let decision = self.check_and_record(user_id, action).await?;
        if decision.allowed {
            Ok(())
        } else {
            Err(OrchestratorError::RateLimited {
                action,
                retry_after: decision.retry_after.unwrap_or_default(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{MockClock, MockEntityStore};
    use chrono::Utc;
    use shared::RateLimitRecord;

    fn limiter(store: MockEntityStore) -> RateLimiter<MockEntityStore, MockClock> {
        let mut clock = MockClock::new();
        clock.expect_now().returning(Utc::now);
        let config = RateLimitConfig {
            max_contention_retries: 2,
            ..RateLimitConfig::default()
        };
        RateLimiter::new(Arc::new(store), Arc::new(clock), config)
    }

    #[tokio::test]
    async fn test_retries_after_concurrent_update() {
        let mut store = MockEntityStore::new();
        store
            .expect_load_rate_limit()
            .returning(|_, _| Ok(RateLimitRecord::default()));
        let mut swaps = 0;
        store.expect_swap_rate_limit().times(2).returning(move |_, _, _, _| {
            swaps += 1;
            Ok(swaps == 2)
        });

        let decision = limiter(store)
            .check_and_record(&UserId::new(), RateLimitAction::BuildPaper)
            .await
            .unwrap();
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn test_gives_up_after_bounded_contention() {
        let mut store = MockEntityStore::new();
        store
            .expect_load_rate_limit()
            .returning(|_, _| Ok(RateLimitRecord::default()));
        store.expect_swap_rate_limit().times(3).returning(|_, _, _, _| Ok(false));

        let result = limiter(store)
            .check_and_record(&UserId::new(), RateLimitAction::RefreshAll)
            .await;
        assert!(matches!(result, Err(OrchestratorError::Store { .. })));
    }

    #[tokio::test]
    async fn test_active_lockout_is_enforced_without_write() {
        let mut store = MockEntityStore::new();
        store.expect_load_rate_limit().returning(|_, _| {
            Ok(RateLimitRecord {
                revision: 3,
                attempts: vec![],
                locked_until: Some(Utc::now() + chrono::Duration::minutes(5)),
            })
        });
        store.expect_swap_rate_limit().never();

        let err = limiter(store)
            .enforce(&UserId::new(), RateLimitAction::RefreshRepository)
            .await
            .unwrap_err();
        match err {
            OrchestratorError::RateLimited { action, retry_after } => {
                assert_eq!(action, RateLimitAction::RefreshRepository);
                assert!(retry_after > Duration::from_secs(290));
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
    }
}
