//! Batch coordinator
//!
//! Fans refreshes and builds out over many entities at once. Every entity
//! runs in its own future and reports independently; one failure is counted,
//! never propagated to its siblings.

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use shared::{
    process_debug, process_info, process_warn, LeaseState, ProcessId, RateLimitAction, Repository, RepositoryId,
    UserId,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::core::lease;
use crate::core::sync_state::{self, PaperSyncState};
use crate::engine::build::{BuildOrchestrator, BuildOutcome};
use crate::engine::rate_limiter::RateLimiter;
use crate::engine::refresh::{RefreshOrchestrator, RefreshOutcome};
use crate::error::OrchestratorResult;
use crate::traits::{ArtifactProducer, ArtifactStore, Clock, EntityStore, SourceProvider};

/// Aggregated result of a batch
///
/// `checked` counts entities whose operation completed, `updated` the subset
/// that changed. Entities filtered out or denied a lease are `skipped`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub checked: usize,
    pub updated: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl BatchSummary {
    pub fn merge(&mut self, other: BatchSummary) {
        self.total += other.total;
        self.checked += other.checked;
        self.updated += other.updated;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

pub struct BatchCoordinator<S, P, R, A, C>
where
    S: EntityStore + 'static,
    P: SourceProvider + 'static,
    R: ArtifactProducer + 'static,
    A: ArtifactStore + 'static,
    C: Clock + 'static,
{
    store: Arc<S>,
    clock: Arc<C>,
    refresh: Arc<RefreshOrchestrator<S, P, C>>,
    build: Arc<BuildOrchestrator<S, P, R, A, C>>,
    rate_limiter: Arc<RateLimiter<S, C>>,
    config: EngineConfig,
}

impl<S, P, R, A, C> BatchCoordinator<S, P, R, A, C>
where
    S: EntityStore + 'static,
    P: SourceProvider + 'static,
    R: ArtifactProducer + 'static,
    A: ArtifactStore + 'static,
    C: Clock + 'static,
{
    pub fn new(
        store: Arc<S>,
        clock: Arc<C>,
        refresh: Arc<RefreshOrchestrator<S, P, C>>,
        build: Arc<BuildOrchestrator<S, P, R, A, C>>,
        rate_limiter: Arc<RateLimiter<S, C>>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            clock,
            refresh,
            build,
            rate_limiter,
            config,
        }
    }

    /// Refresh every repository owned by `user_id`
    ///
    /// Repositories mid-refresh are skipped, and unless `force` is set so
    /// are ones refreshed within the minimum interval.
    pub async fn refresh_all(&self, user_id: &UserId, force: bool) -> OrchestratorResult<BatchSummary> {
        let repositories = self.store.list_repositories(user_id).await?;
        Ok(self.refresh_batch(repositories, force).await)
    }

    async fn refresh_batch(&self, repositories: Vec<Repository>, force: bool) -> BatchSummary {
        let now = self.clock.now();
        let min_interval = chrono::Duration::from_std(self.config.batch.min_refresh_interval)
            .unwrap_or_else(|_| chrono::Duration::zero());

        let mut summary = BatchSummary {
            total: repositories.len(),
            ..BatchSummary::default()
        };

        let mut eligible: Vec<RepositoryId> = Vec::new();
        for repository in &repositories {
            let lease_state = LeaseState::of_repository(repository);
            if lease::is_held(&lease_state, now, self.config.lease.repository_timeout) {
                summary.skipped += 1;
                continue;
            }
            let recently_synced = repository
                .last_synced_at
                .is_some_and(|synced| now - synced < min_interval);
            if !force && recently_synced {
                summary.skipped += 1;
                continue;
            }
            eligible.push(repository.id.clone());
        }

        let results = join_all(eligible.iter().map(|id| self.refresh.refresh(id))).await;
        for (id, result) in eligible.iter().zip(results) {
            match result {
                Ok(RefreshOutcome::AlreadySyncing) => summary.skipped += 1,
                Ok(RefreshOutcome::Unchanged { .. }) => summary.checked += 1,
                Ok(RefreshOutcome::Updated { .. }) => {
                    summary.checked += 1;
                    summary.updated += 1;
                }
                Err(e) => {
                    process_warn!(ProcessId::current(), "⚠️ Refresh of {} failed in batch: {}", id, e);
                    summary.failed += 1;
                }
            }
        }

        process_debug!(ProcessId::current(), "📊 Refresh batch finished: {:?}", summary);
        summary
    }

    /// Build every paper of `user_id` that is stale or was never built
    ///
    /// Papers whose last build failed are retried only while they are out of date.
    pub async fn build_stale(&self, user_id: &UserId) -> OrchestratorResult<BatchSummary> {
        let papers = self.store.list_papers(user_id).await?;
        let repositories: HashMap<RepositoryId, Repository> = self
            .store
            .list_repositories(user_id)
            .await?
            .into_iter()
            .map(|repository| (repository.id.clone(), repository))
            .collect();

        let mut summary = BatchSummary {
            total: papers.len(),
            ..BatchSummary::default()
        };

        let candidates: Vec<_> = papers
            .iter()
            .filter(|paper| {
                let repository = paper.repository_id.as_ref().and_then(|id| repositories.get(id));
                match sync_state::derive(paper, repository) {
                    PaperSyncState::Failed => sync_state::is_out_of_date(paper, repository),
                    state => state.wants_build(),
                }
            })
            .map(|paper| paper.id.clone())
            .collect();
        summary.skipped += papers.len() - candidates.len();

        let results = join_all(candidates.iter().map(|id| self.build.build(id, false))).await;
        for (id, result) in candidates.iter().zip(results) {
            match result {
                Ok(BuildOutcome::Built { .. }) => {
                    summary.checked += 1;
                    summary.updated += 1;
                }
                Ok(BuildOutcome::UpToDate { .. }) => summary.checked += 1,
                Ok(BuildOutcome::Skipped(_)) | Ok(BuildOutcome::Superseded) => summary.skipped += 1,
                Err(e) => {
                    process_warn!(ProcessId::current(), "⚠️ Build of {} failed in batch: {}", id, e);
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }

    /// Refresh every opted-in repository, one batch per owner
    ///
    /// Each owner is gated by the background refresh quota; a denied owner is
    /// skipped until a later tick.
    pub async fn background_tick(&self) -> OrchestratorResult<BatchSummary> {
        let mut by_owner: BTreeMap<UserId, Vec<Repository>> = BTreeMap::new();
        for repository in self.store.list_background_repositories().await? {
            by_owner.entry(repository.user_id.clone()).or_default().push(repository);
        }

        let owners = by_owner.len();
        let batches = join_all(by_owner.into_iter().map(|(user_id, repositories)| async move {
            match self
                .rate_limiter
                .check_and_record(&user_id, RateLimitAction::BackgroundRefresh)
                .await
            {
                Ok(decision) if decision.allowed => self.refresh_batch(repositories, false).await,
                Ok(_) => {
                    process_debug!(ProcessId::current(), "🚦 Background refresh for {} deferred", user_id);
                    BatchSummary {
                        total: repositories.len(),
                        skipped: repositories.len(),
                        ..BatchSummary::default()
                    }
                }
                Err(e) => {
                    process_warn!(ProcessId::current(), "⚠️ Background gate for {} failed: {}", user_id, e);
                    BatchSummary {
                        total: repositories.len(),
                        failed: repositories.len(),
                        ..BatchSummary::default()
                    }
                }
            }
        }))
        .await;

        let mut summary = BatchSummary::default();
        for batch in batches {
            summary.merge(batch);
        }
        process_info!(
            ProcessId::current(),
            "🌙 Background tick over {} owner(s): {} checked, {} updated, {} failed, {} skipped",
            owners,
            summary.checked,
            summary.updated,
            summary.failed,
            summary.skipped
        );
        Ok(summary)
    }
}
