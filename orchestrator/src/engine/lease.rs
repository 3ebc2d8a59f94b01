//! Lease manager
//!
//! Grants time-bounded exclusive claims on repositories (refresh) and papers
//! (build). Acquisition is a compare-and-swap against the lease snapshot that
//! was evaluated, so of two callers racing for the same entity only one gets
//! a fresh attempt id.

use shared::{process_debug, process_warn, AttemptId, Fence, LeaseKey, LeaseState, LeaseStatus, ProcessId};
use std::sync::Arc;
use std::time::Duration;

use crate::config::LeaseConfig;
use crate::core::lease::{self, LeaseDecision};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::traits::{Clock, EntityStore};

/// Result of a lease acquisition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseGrant {
    pub acquired: bool,
    pub attempt_id: Option<AttemptId>,
    /// A stale holder was evicted
    pub reclaimed: bool,
}

impl LeaseGrant {
    fn denied() -> Self {
        Self {
            acquired: false,
            attempt_id: None,
            reclaimed: false,
        }
    }

    /// Fence for writes made under this grant, `None` when denied
    pub fn fence(&self, key: &LeaseKey) -> Option<Fence> {
        self.attempt_id
            .as_ref()
            .filter(|_| self.acquired)
            .map(|attempt| Fence::new(key.clone(), attempt.clone()))
    }
}

pub struct LeaseManager<S, C>
where
    S: EntityStore + 'static,
    C: Clock + 'static,
{
    store: Arc<S>,
    clock: Arc<C>,
    config: LeaseConfig,
}

impl<S, C> LeaseManager<S, C>
where
    S: EntityStore + 'static,
    C: Clock + 'static,
{
    pub fn new(store: Arc<S>, clock: Arc<C>, config: LeaseConfig) -> Self {
        Self { store, clock, config }
    }

    /// Timeout of the lease domain `key` belongs to
    pub fn timeout_for(&self, key: &LeaseKey) -> Duration {
        match key {
            LeaseKey::Repository(_) => self.config.repository_timeout,
            LeaseKey::Paper(_) => self.config.paper_timeout,
        }
    }

    /// Try to take the lease on `key`
    ///
    /// Contention is a normal outcome reported through `acquired = false`.
    pub async fn try_acquire(&self, key: &LeaseKey) -> OrchestratorResult<LeaseGrant> {
        let current = self
            .store
            .read_lease(key)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(entity_name(key), key))?;

        let now = self.clock.now();
        match lease::evaluate(&current, now, self.timeout_for(key)) {
            LeaseDecision::Deny { held_for, remaining } => {
                process_debug!(
                    ProcessId::current(),
                    "🔒 Lease on {} held for {:?}, expires in {:?}",
                    key,
                    held_for,
                    remaining
                );
                Ok(LeaseGrant::denied())
            }
            LeaseDecision::Grant { reclaimed } => {
                let attempt_id = AttemptId::new();
                let next = LeaseState::held(attempt_id.clone(), now);
                if !self.store.swap_lease(key, &current, next).await? {
                    process_debug!(ProcessId::current(), "🔒 Lost lease race on {}", key);
                    return Ok(LeaseGrant::denied());
                }

                if reclaimed {
                    process_warn!(
                        ProcessId::current(),
                        "♻️ Reclaimed stale lease on {} from attempt {:?}",
                        key,
                        current.attempt_id.as_ref().map(AttemptId::as_str)
                    );
                }
                Ok(LeaseGrant {
                    acquired: true,
                    attempt_id: Some(attempt_id),
                    reclaimed,
                })
            }
        }
    }

    /// Release the lease with a terminal status
    ///
    /// With an attempt id the release is skipped unless that attempt still
    /// holds the lease. Returns whether anything was written.
    pub async fn release(
        &self,
        key: &LeaseKey,
        status: LeaseStatus,
        attempt_id: Option<&AttemptId>,
    ) -> OrchestratorResult<bool> {
        let status = if status.is_terminal() { status } else { LeaseStatus::Idle };
        let released = self.store.release_lease(key, status, attempt_id.cloned()).await?;
        if !released {
            process_debug!(
                ProcessId::current(),
                "🔓 Skipped release of {}: attempt {:?} no longer holds it",
                key,
                attempt_id.map(AttemptId::as_str)
            );
        }
        Ok(released)
    }

    /// Whether `attempt_id` is still the current holder of `key`
    pub async fn validate(&self, key: &LeaseKey, attempt_id: &AttemptId) -> OrchestratorResult<bool> {
        let current = self.store.read_lease(key).await?;
        Ok(current.and_then(|state| state.attempt_id).as_ref() == Some(attempt_id))
    }
}

fn entity_name(key: &LeaseKey) -> &'static str {
    match key {
        LeaseKey::Repository(_) => "repository",
        LeaseKey::Paper(_) => "paper",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{MockClock, MockEntityStore};
    use chrono::Utc;
    use mockall::predicate::*;
    use shared::RepositoryId;

    fn manager(store: MockEntityStore) -> LeaseManager<MockEntityStore, MockClock> {
        let mut clock = MockClock::new();
        clock.expect_now().returning(Utc::now);
        LeaseManager::new(Arc::new(store), Arc::new(clock), LeaseConfig::default())
    }

    #[tokio::test]
    async fn test_acquire_idle_lease_swaps_in_fresh_attempt() {
        let key = LeaseKey::Repository(RepositoryId::new());
        let mut store = MockEntityStore::new();
        store
            .expect_read_lease()
            .returning(|_| Ok(Some(LeaseState::released(LeaseStatus::Idle))));
        store
            .expect_swap_lease()
            .withf(|_, expected, next| expected.status == LeaseStatus::Idle && next.status == LeaseStatus::Busy)
            .times(1)
            .returning(|_, _, _| Ok(true));

        let grant = manager(store).try_acquire(&key).await.unwrap();
        assert!(grant.acquired);
        assert!(!grant.reclaimed);
        assert!(grant.fence(&key).is_some());
    }

    #[tokio::test]
    async fn test_lost_swap_is_a_denial() {
        let key = LeaseKey::Repository(RepositoryId::new());
        let mut store = MockEntityStore::new();
        store
            .expect_read_lease()
            .returning(|_| Ok(Some(LeaseState::released(LeaseStatus::Idle))));
        store.expect_swap_lease().returning(|_, _, _| Ok(false));

        let grant = manager(store).try_acquire(&key).await.unwrap();
        assert!(!grant.acquired);
        assert!(grant.attempt_id.is_none());
        assert!(grant.fence(&key).is_none());
    }

    #[tokio::test]
    async fn test_live_lease_denied_without_write() {
        let key = LeaseKey::Repository(RepositoryId::new());
        let mut store = MockEntityStore::new();
        store
            .expect_read_lease()
            .returning(|_| Ok(Some(LeaseState::held(AttemptId::new(), Utc::now()))));
        store.expect_swap_lease().never();

        let grant = manager(store).try_acquire(&key).await.unwrap();
        assert!(!grant.acquired);
    }

    #[tokio::test]
    async fn test_missing_entity_is_not_found() {
        let key = LeaseKey::Repository(RepositoryId::new());
        let mut store = MockEntityStore::new();
        store.expect_read_lease().returning(|_| Ok(None));

        let err = manager(store).try_acquire(&key).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound { entity: "repository", .. }));
    }

    #[tokio::test]
    async fn test_release_never_writes_busy() {
        let key = LeaseKey::Repository(RepositoryId::new());
        let mut store = MockEntityStore::new();
        store
            .expect_release_lease()
            .with(eq(key.clone()), eq(LeaseStatus::Idle), eq(None::<AttemptId>))
            .returning(|_, _, _| Ok(true));

        assert!(manager(store).release(&key, LeaseStatus::Busy, None).await.unwrap());
    }
}
