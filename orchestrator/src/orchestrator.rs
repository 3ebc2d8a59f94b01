//! Main orchestrator implementation
//!
//! Entry point for user-initiated and scheduled work. Wires the engine
//! components to the injected collaborators, applies ownership checks and the
//! per-user rate limit gate, then delegates to the component that owns the
//! operation.

use std::sync::Arc;
use tokio::sync::mpsc;

use shared::{
    logging, process_info, LeaseKey, LeaseStatus, Paper, PaperId, ProcessId, RateLimitAction, Repository,
    RepositoryId, UserId, VersionId,
};

use crate::{
    config::EngineConfig,
    core::sync_state::{self, PaperSyncState},
    engine::{
        BatchCoordinator, BatchSummary, BuildOrchestrator, BuildOutcome, ChangeDetector, LeaseManager, OutboxReport,
        OutboxWorker, RateLimiter, RefreshOrchestrator, RefreshOutcome,
    },
    error::{OrchestratorError, OrchestratorResult},
    traits::{ArtifactProducer, ArtifactStore, Clock, EntityStore, NotificationSink, RepositoryPatch, SourceProvider},
};

/// Main orchestrator that coordinates refreshes, builds and deferred work
pub struct Orchestrator<S, P, R, A, N, C>
where
    S: EntityStore + 'static,
    P: SourceProvider + 'static,
    R: ArtifactProducer + 'static,
    A: ArtifactStore + 'static,
    N: NotificationSink + 'static,
    C: Clock + 'static,
{
    /// Injected persistent store
    store: Arc<S>,

    config: EngineConfig,

    /// Engine components
    leases: Arc<LeaseManager<S, C>>,
    rate_limiter: Arc<RateLimiter<S, C>>,
    refresh: Arc<RefreshOrchestrator<S, P, C>>,
    build: Arc<BuildOrchestrator<S, P, R, A, C>>,
    batch: BatchCoordinator<S, P, R, A, C>,
    outbox: OutboxWorker<S, A, N, C>,
}

impl<S, P, R, A, N, C> Orchestrator<S, P, R, A, N, C>
where
    S: EntityStore + 'static,
    P: SourceProvider + 'static,
    R: ArtifactProducer + 'static,
    A: ArtifactStore + 'static,
    N: NotificationSink + 'static,
    C: Clock + 'static,
{
    /// Create new orchestrator with injected dependencies
    pub fn new(
        store: Arc<S>,
        source: Arc<P>,
        producer: Arc<R>,
        artifacts: Arc<A>,
        notifier: Arc<N>,
        clock: Arc<C>,
        config: EngineConfig,
    ) -> Self {
        let leases = Arc::new(LeaseManager::new(store.clone(), clock.clone(), config.lease.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(store.clone(), clock.clone(), config.rate_limit.clone()));
        let detector = Arc::new(ChangeDetector::new(source.clone(), config.change_detection.clone()));

        let refresh = Arc::new(RefreshOrchestrator::new(
            store.clone(),
            source.clone(),
            clock.clone(),
            leases.clone(),
            detector.clone(),
            config.clone(),
        ));
        let build = Arc::new(BuildOrchestrator::new(
            store.clone(),
            source,
            producer,
            artifacts.clone(),
            clock.clone(),
            leases.clone(),
            detector,
            config.clone(),
        ));
        let batch = BatchCoordinator::new(
            store.clone(),
            clock.clone(),
            refresh.clone(),
            build.clone(),
            rate_limiter.clone(),
            config.clone(),
        );
        let outbox = OutboxWorker::new(store.clone(), artifacts, notifier, clock, config.retention.clone());

        Self {
            store,
            config,
            leases,
            rate_limiter,
            refresh,
            build,
            batch,
            outbox,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Refresh one repository on behalf of its owner
    pub async fn request_refresh(&self, user_id: &UserId, repository_id: &RepositoryId) -> OrchestratorResult<RefreshOutcome> {
        self.owned_repository(user_id, repository_id).await?;
        self.rate_limiter
            .enforce(user_id, RateLimitAction::RefreshRepository)
            .await?;
        self.refresh.refresh(repository_id).await
    }

    /// Build one paper on behalf of its owner
    pub async fn request_build(&self, user_id: &UserId, paper_id: &PaperId, force: bool) -> OrchestratorResult<BuildOutcome> {
        self.owned_paper(user_id, paper_id).await?;
        self.rate_limiter.enforce(user_id, RateLimitAction::BuildPaper).await?;
        self.build.build(paper_id, force).await
    }

    /// Refresh every repository of a user
    pub async fn request_refresh_all(&self, user_id: &UserId, force: bool) -> OrchestratorResult<BatchSummary> {
        self.rate_limiter.enforce(user_id, RateLimitAction::RefreshAll).await?;
        let summary = self.batch.refresh_all(user_id, force).await?;
        logging::log_progress(
            ProcessId::current(),
            "Refresh all",
            &format!(
                "{} repositories, {} updated, {} failed, {} skipped",
                summary.total, summary.updated, summary.failed, summary.skipped
            ),
        );
        Ok(summary)
    }

    /// Build every stale or never-built paper of a user
    pub async fn build_stale(&self, user_id: &UserId) -> OrchestratorResult<BatchSummary> {
        self.rate_limiter.enforce(user_id, RateLimitAction::BuildPaper).await?;
        self.batch.build_stale(user_id).await
    }

    /// Periodic refresh of every opted-in repository
    pub async fn background_tick(&self) -> OrchestratorResult<BatchSummary> {
        self.batch.background_tick().await
    }

    /// Deliver every deferred task that is due
    pub async fn run_outbox_once(&self) -> OrchestratorResult<OutboxReport> {
        self.outbox.run_once().await
    }

    /// Deliver deferred tasks until `shutdown` fires
    pub async fn run_outbox(&self, shutdown: mpsc::Receiver<()>) {
        self.outbox.run(shutdown).await
    }

    /// Forcibly clear a repository's refresh lease and error
    pub async fn reset_repository(&self, user_id: &UserId, repository_id: &RepositoryId) -> OrchestratorResult<()> {
        self.owned_repository(user_id, repository_id).await?;

        let key = LeaseKey::Repository(repository_id.clone());
        self.leases.release(&key, LeaseStatus::Idle, None).await?;
        let patch = RepositoryPatch {
            last_sync_error: Some(None),
            ..RepositoryPatch::default()
        };
        self.store.update_repository(repository_id, None, patch).await?;

        process_info!(ProcessId::current(), "🧹 Reset sync state of repository {}", repository_id);
        Ok(())
    }

    /// Pin or unpin a version so retention keeps or may drop it
    pub async fn set_version_pinned(&self, user_id: &UserId, version_id: &VersionId, pinned: bool) -> OrchestratorResult<()> {
        let version = self
            .store
            .get_version(version_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("version", version_id))?;
        self.owned_paper(user_id, &version.paper_id).await?;

        if !self.store.set_version_pinned(version_id, pinned).await? {
            return Err(OrchestratorError::not_found("version", version_id));
        }
        Ok(())
    }

    /// Derived sync state of a paper
    pub async fn paper_sync_state(&self, user_id: &UserId, paper_id: &PaperId) -> OrchestratorResult<PaperSyncState> {
        let paper = self.owned_paper(user_id, paper_id).await?;
        let repository = match &paper.repository_id {
            Some(id) => self.store.get_repository(id).await?,
            None => None,
        };
        Ok(sync_state::derive(&paper, repository.as_ref()))
    }

    /// Another user's entity is reported as missing
    async fn owned_repository(&self, user_id: &UserId, repository_id: &RepositoryId) -> OrchestratorResult<Repository> {
        self.store
            .get_repository(repository_id)
            .await?
            .filter(|repository| repository.user_id == *user_id)
            .ok_or_else(|| OrchestratorError::not_found("repository", repository_id))
    }

    async fn owned_paper(&self, user_id: &UserId, paper_id: &PaperId) -> OrchestratorResult<Paper> {
        self.store
            .get_paper(paper_id)
            .await?
            .filter(|paper| paper.user_id == *user_id)
            .ok_or_else(|| OrchestratorError::not_found("paper", paper_id))
    }
}
