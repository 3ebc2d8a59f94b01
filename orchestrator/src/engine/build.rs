//! Paper build orchestrator
//!
//! Produces a fresh artifact for one paper under the paper's own build lease,
//! independent of the repository refresh lease. A build is skipped whenever
//! the paper's inputs are provably unchanged; otherwise the producer runs and
//! the result is attached in a single fenced commit that also snapshots the
//! previous artifact and enqueues the follow-up tasks.

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use shared::{
    process_debug, process_error, process_info, process_warn, ArtifactRef, DeferredTask, Fence, LeaseKey,
    LeaseStatus, NotificationEvent, OutboxTask, Paper, PaperId, ProcessId, ProductionMode, Repository, StoredArtifact,
    TrackedFile, WriteOutcome,
};
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::core::change;
use crate::engine::change_detector::ChangeDetector;
use crate::engine::lease::LeaseManager;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::traits::{
    ArtifactProducer, ArtifactStore, BuildCommit, Clock, EntityStore, PaperPatch, ProduceRequest, SourceProvider,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyBuilding,
}

/// Result of one build request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    /// Nothing ran, see the reason
    Skipped(SkipReason),
    /// Inputs unchanged; only the commit pointer moved
    UpToDate { commit_hash: String },
    /// A new artifact was attached
    Built { commit_hash: String, artifact: ArtifactRef },
    /// A newer attempt took over; any produced artifact was discarded
    Superseded,
}

impl BuildOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, BuildOutcome::Skipped(_))
    }
}

pub struct BuildOrchestrator<S, P, R, A, C>
where
    S: EntityStore + 'static,
    P: SourceProvider + 'static,
    R: ArtifactProducer + 'static,
    A: ArtifactStore + 'static,
    C: Clock + 'static,
{
    store: Arc<S>,
    source: Arc<P>,
    producer: Arc<R>,
    artifacts: Arc<A>,
    clock: Arc<C>,
    leases: Arc<LeaseManager<S, C>>,
    detector: Arc<ChangeDetector<P>>,
    config: EngineConfig,
}

impl<S, P, R, A, C> BuildOrchestrator<S, P, R, A, C>
where
    S: EntityStore + 'static,
    P: SourceProvider + 'static,
    R: ArtifactProducer + 'static,
    A: ArtifactStore + 'static,
    C: Clock + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<S>,
        source: Arc<P>,
        producer: Arc<R>,
        artifacts: Arc<A>,
        clock: Arc<C>,
        leases: Arc<LeaseManager<S, C>>,
        detector: Arc<ChangeDetector<P>>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            source,
            producer,
            artifacts,
            clock,
            leases,
            detector,
            config,
        }
    }

    /// Build one paper; `force` bypasses every unchanged-input shortcut
    pub async fn build(&self, paper_id: &PaperId, force: bool) -> OrchestratorResult<BuildOutcome> {
        self.attempt(paper_id.clone(), force, false).await
    }

    fn attempt(&self, paper_id: PaperId, force: bool, is_retry: bool) -> BoxFuture<'_, OrchestratorResult<BuildOutcome>> {
        Box::pin(async move {
            let (paper, file, repository) = self.resolve(&paper_id).await?;

            let key = LeaseKey::Paper(paper_id.clone());
            let grant = self.leases.try_acquire(&key).await?;
            let Some(fence) = grant.fence(&key) else {
                process_info!(ProcessId::current(), "⏭️ Paper {} is already building", paper_id);
                return Ok(BuildOutcome::Skipped(SkipReason::AlreadyBuilding));
            };

            // Decide on the paper as of the grant; another build may have committed since it was read
            let result = match self.store.get_paper(&paper_id).await {
                Ok(Some(current)) => self.run(&current, &file, &repository, &fence, force).await,
                Ok(None) => Err(OrchestratorError::not_found("paper", &paper_id)),
                Err(e) => Err(e),
            };

            match result {
                Ok(outcome) => Ok(outcome),
                Err(e) if e.is_source_not_found() && file.mode == ProductionMode::Compile && !is_retry => {
                    let delay = self.config.build.source_not_found_retry_delay;
                    process_warn!(
                        ProcessId::current(),
                        "🔁 {} missing for paper {}, retrying once in {:?}",
                        file.path,
                        paper_id,
                        delay
                    );
                    self.leases
                        .release(&key, LeaseStatus::Idle, Some(&fence.attempt_id))
                        .await?;
                    tokio::time::sleep(delay).await;
                    self.attempt(paper_id, force, true).await
                }
                Err(e) => {
                    self.record_failure(&paper, &fence, &e).await;
                    Err(e)
                }
            }
        })
    }

    async fn resolve(&self, paper_id: &PaperId) -> OrchestratorResult<(Paper, TrackedFile, Repository)> {
        let paper = self
            .store
            .get_paper(paper_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("paper", paper_id))?;
        let file_id = paper
            .tracked_file_id
            .clone()
            .ok_or_else(|| OrchestratorError::not_found("tracked file of paper", paper_id))?;
        let file = self
            .store
            .get_tracked_file(&file_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("tracked file", &file_id))?;
        let repository = self
            .store
            .get_repository(&file.repository_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("repository", &file.repository_id))?;
        Ok((paper, file, repository))
    }

    async fn run(
        &self,
        paper: &Paper,
        file: &TrackedFile,
        repository: &Repository,
        fence: &Fence,
        force: bool,
    ) -> OrchestratorResult<BuildOutcome> {
        if paper.last_sync_error.is_some() {
            let patch = PaperPatch {
                last_sync_error: Some(None),
                ..PaperPatch::default()
            };
            if self.store.update_paper(&paper.id, Some(fence.clone()), patch).await? == WriteOutcome::Superseded {
                return Ok(BuildOutcome::Superseded);
            }
        }

        let known_hash = if !force && self.config.source.supports_unchanged_shortcut {
            paper.cached_commit_hash.clone()
        } else {
            None
        };
        let latest = self
            .source
            .fetch_latest_commit(&repository.source, &repository.default_branch, known_hash)
            .await?;
        let head = latest.commit.sha.clone();

        if !force && paper.has_been_built() {
            if latest.unchanged || paper.cached_commit_hash.as_deref() == Some(head.as_str()) {
                process_debug!(ProcessId::current(), "✔️ Paper {} already built at {}", paper.id, head);
                return self.skip(paper, fence, head).await;
            }
            if let Some(cached) = change::cached_fingerprints(paper, file) {
                match self.detector.compare_hashes(&repository.source, &head, &cached).await {
                    None => {
                        process_debug!(ProcessId::current(), "✔️ Inputs of paper {} unchanged at {}", paper.id, head);
                        return self.skip(paper, fence, head).await;
                    }
                    Some(reason) => {
                        process_debug!(ProcessId::current(), "🔨 Rebuilding paper {}: {}", paper.id, reason);
                    }
                }
            }
        }

        let request = ProduceRequest {
            repo: repository.source.clone(),
            branch: repository.default_branch.clone(),
            commit_sha: head.clone(),
            path: file.path.clone(),
            mode: file.mode,
        };
        let produced = self.producer.compile_or_fetch(request).await?;
        let now = self.clock.now();

        let commit = BuildCommit {
            artifact: StoredArtifact {
                reference: produced.artifact.clone(),
                size_bytes: produced.size_bytes,
            },
            commit_hash: head.clone(),
            dependencies: produced.dependencies,
            blob_hash: produced.blob_hash,
            built_at: now,
            tasks: self.success_tasks(paper, &head, now),
        };

        let written = match self.store.commit_build(&paper.id, fence, commit).await {
            Ok(written) => written,
            Err(e) => {
                self.discard(&produced.artifact).await;
                return Err(e);
            }
        };

        match written {
            WriteOutcome::Applied => {
                process_info!(
                    ProcessId::current(),
                    "📄 Built paper {} at {} ({} bytes)",
                    paper.id,
                    head,
                    produced.size_bytes
                );
                Ok(BuildOutcome::Built {
                    commit_hash: head,
                    artifact: produced.artifact,
                })
            }
            WriteOutcome::Superseded | WriteOutcome::Conflict => {
                process_info!(
                    ProcessId::current(),
                    "⏭️ Build of paper {} superseded, discarding {}",
                    paper.id,
                    produced.artifact
                );
                self.discard(&produced.artifact).await;
                Ok(BuildOutcome::Superseded)
            }
        }
    }

    /// Advance the commit pointer without producing anything
    async fn skip(&self, paper: &Paper, fence: &Fence, head: String) -> OrchestratorResult<BuildOutcome> {
        let patch = PaperPatch {
            cached_commit_hash: Some(head.clone()),
            needs_sync: Some(false),
            pending_commit: Some(None),
            ..PaperPatch::default()
        };
        if self.store.update_paper(&paper.id, Some(fence.clone()), patch).await? == WriteOutcome::Superseded {
            return Ok(BuildOutcome::Superseded);
        }
        self.leases
            .release(&fence.key, LeaseStatus::Idle, Some(&fence.attempt_id))
            .await?;
        Ok(BuildOutcome::UpToDate { commit_hash: head })
    }

    fn success_tasks(&self, paper: &Paper, head: &str, now: DateTime<Utc>) -> Vec<OutboxTask> {
        let cleanup_at = now + chrono::Duration::from_std(self.config.retention.cleanup_delay).unwrap_or_else(|_| chrono::Duration::zero());
        vec![
            OutboxTask::new(
                DeferredTask::CleanupVersions {
                    paper_id: paper.id.clone(),
                },
                cleanup_at,
            ),
            OutboxTask::new(
                DeferredTask::Notify {
                    user_id: paper.user_id.clone(),
                    event: NotificationEvent::BuildSucceeded {
                        paper_id: paper.id.clone(),
                        title: paper.title.clone(),
                        commit_hash: Some(head.to_string()),
                    },
                },
                now,
            ),
        ]
    }

    async fn discard(&self, artifact: &ArtifactRef) {
        if let Err(e) = self.artifacts.delete(artifact).await {
            process_warn!(ProcessId::current(), "🗑️ Could not discard artifact {}: {}", artifact, e);
        }
    }

    async fn record_failure(&self, paper: &Paper, fence: &Fence, error: &OrchestratorError) {
        process_error!(ProcessId::current(), "❌ Build of paper {} failed: {}", paper.id, error);

        let patch = PaperPatch {
            last_sync_error: Some(Some(error.to_string())),
            ..PaperPatch::default()
        };
        match self.store.update_paper(&paper.id, Some(fence.clone()), patch).await {
            Ok(WriteOutcome::Applied) => {}
            Ok(WriteOutcome::Superseded | WriteOutcome::Conflict) => {
                process_debug!(ProcessId::current(), "⏭️ Failed build of {} was already superseded", paper.id);
                return;
            }
            Err(e) => {
                process_error!(ProcessId::current(), "❌ Could not record build error on {}: {}", paper.id, e);
            }
        }

        if let Err(e) = self
            .leases
            .release(&fence.key, LeaseStatus::Error, Some(&fence.attempt_id))
            .await
        {
            process_error!(ProcessId::current(), "❌ Could not release lease on {}: {}", paper.id, e);
        }

        let task = OutboxTask::new(
            DeferredTask::Notify {
                user_id: paper.user_id.clone(),
                event: NotificationEvent::BuildFailed {
                    paper_id: paper.id.clone(),
                    title: paper.title.clone(),
                    error: error.to_string(),
                },
            },
            self.clock.now(),
        );
        if let Err(e) = self.store.enqueue_tasks(vec![task]).await {
            process_error!(ProcessId::current(), "❌ Could not enqueue failure notification for {}: {}", paper.id, e);
        }
    }
}
