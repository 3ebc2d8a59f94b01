//! Repository refresh orchestrator
//!
//! Brings a repository's head commit up to date and classifies every tracked
//! paper against the new commit: papers whose inputs changed are flagged
//! stale, the rest only advance their commit pointer. Every write is fenced
//! by the refresh attempt, so a refresh that lost its lease cannot clobber a
//! newer one.

use chrono::{DateTime, Utc};
use shared::{
    process_debug, process_error, process_info, CommitInfo, DeferredTask, Fence, LeaseKey, LeaseStatus,
    NotificationEvent, OutboxTask, ProcessId, Repository, RepositoryId, TrackedPaper, WriteOutcome,
};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::core::change::ChangedFiles;
use crate::engine::change_detector::ChangeDetector;
use crate::engine::lease::LeaseManager;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::traits::{Clock, EntityStore, PaperPatch, RepositoryPatch, SourceProvider};

/// Result of one refresh request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Another attempt holds the refresh lease
    AlreadySyncing,
    /// The remote head did not move
    Unchanged { commit_hash: String },
    /// The remote head moved and papers were classified
    Updated {
        commit_hash: String,
        papers_needing_sync: usize,
        papers_advanced: usize,
        /// A newer attempt took over before the final write
        superseded: bool,
    },
}

impl RefreshOutcome {
    pub fn is_updated(&self) -> bool {
        matches!(self, RefreshOutcome::Updated { .. })
    }
}

#[derive(Default)]
struct Classification {
    needing_sync: usize,
    advanced: usize,
    superseded: bool,
}

pub struct RefreshOrchestrator<S, P, C>
where
    S: EntityStore + 'static,
    P: SourceProvider + 'static,
    C: Clock + 'static,
{
    store: Arc<S>,
    source: Arc<P>,
    clock: Arc<C>,
    leases: Arc<LeaseManager<S, C>>,
    detector: Arc<ChangeDetector<P>>,
    config: EngineConfig,
}

impl<S, P, C> RefreshOrchestrator<S, P, C>
where
    S: EntityStore + 'static,
    P: SourceProvider + 'static,
    C: Clock + 'static,
{
    pub fn new(
        store: Arc<S>,
        source: Arc<P>,
        clock: Arc<C>,
        leases: Arc<LeaseManager<S, C>>,
        detector: Arc<ChangeDetector<P>>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            source,
            clock,
            leases,
            detector,
            config,
        }
    }

    /// Refresh one repository against its remote
    pub async fn refresh(&self, repository_id: &RepositoryId) -> OrchestratorResult<RefreshOutcome> {
        let repository = self
            .store
            .get_repository(repository_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("repository", repository_id))?;

        let key = LeaseKey::Repository(repository_id.clone());
        let grant = self.leases.try_acquire(&key).await?;
        let Some(fence) = grant.fence(&key) else {
            process_debug!(ProcessId::current(), "⏭️ Repository {} is already syncing", repository_id);
            return Ok(RefreshOutcome::AlreadySyncing);
        };

        match self.run(&repository, &fence).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.record_failure(&repository, &fence, &e).await;
                Err(e)
            }
        }
    }

    async fn run(&self, repository: &Repository, fence: &Fence) -> OrchestratorResult<RefreshOutcome> {
        let known_hash = if self.config.source.supports_unchanged_shortcut {
            repository.last_commit_hash.clone()
        } else {
            None
        };
        let latest = self
            .source
            .fetch_latest_commit(&repository.source, &repository.default_branch, known_hash)
            .await?;
        let now = self.clock.now();
        let head = latest.commit.sha.clone();

        if latest.unchanged || repository.last_commit_hash.as_deref() == Some(head.as_str()) {
            let patch = RepositoryPatch {
                last_synced_at: Some(now),
                last_sync_error: Some(None),
                ..RepositoryPatch::default()
            };
            if self.store.update_repository(&repository.id, Some(fence.clone()), patch).await? == WriteOutcome::Superseded {
                process_info!(ProcessId::current(), "⏭️ Refresh of {} superseded", repository.id);
            }
            self.leases
                .release(&fence.key, LeaseStatus::Idle, Some(&fence.attempt_id))
                .await?;
            process_debug!(ProcessId::current(), "✔️ Repository {} unchanged at {}", repository.id, head);
            return Ok(RefreshOutcome::Unchanged { commit_hash: head });
        }

        let papers = self.store.list_tracked_papers(&repository.id).await?;
        let classification = self.classify_papers(repository, &papers, &latest.commit, fence).await?;

        let patch = RepositoryPatch {
            last_commit: Some(latest.commit.clone()),
            last_synced_at: Some(now),
            last_sync_error: Some(None),
        };
        let written = self.store.update_repository(&repository.id, Some(fence.clone()), patch).await?;
        let superseded = classification.superseded || written == WriteOutcome::Superseded;

        if superseded {
            process_info!(
                ProcessId::current(),
                "⏭️ Refresh of {} superseded by a newer attempt",
                repository.id
            );
        } else {
            self.leases
                .release(&fence.key, LeaseStatus::Idle, Some(&fence.attempt_id))
                .await?;
            if classification.needing_sync > 0 {
                self.notify_updated(repository, &head, classification.needing_sync, now)
                    .await;
            }
            process_info!(
                ProcessId::current(),
                "🔄 Repository {} moved to {}: {} paper(s) need sync, {} advanced",
                repository.id,
                head,
                classification.needing_sync,
                classification.advanced
            );
        }

        Ok(RefreshOutcome::Updated {
            commit_hash: head,
            papers_needing_sync: classification.needing_sync,
            papers_advanced: classification.advanced,
            superseded,
        })
    }

    async fn classify_papers(
        &self,
        repository: &Repository,
        papers: &[TrackedPaper],
        commit: &CommitInfo,
        fence: &Fence,
    ) -> OrchestratorResult<Classification> {
        let head = commit.sha.as_str();
        let mut result = Classification::default();
        // Papers cached at the same commit share one diff
        let mut diffs: HashMap<String, ChangedFiles> = HashMap::new();

        for tracked in papers {
            let paper = &tracked.paper;
            if paper.cached_commit_hash.as_deref() == Some(head) && paper.needs_sync != Some(true) {
                continue;
            }

            let stale = if paper.needs_sync == Some(true) {
                // Already stale against an older commit; a diff from here cannot clear it
                true
            } else {
                let changed = match paper.cached_commit_hash.as_deref() {
                    Some(base) => {
                        if !diffs.contains_key(base) {
                            let files = self.detector.changed_files(&repository.source, base, head).await;
                            diffs.insert(base.to_string(), files);
                        }
                        diffs.get(base).cloned().unwrap_or(ChangedFiles::Unknown)
                    }
                    None => ChangedFiles::Unknown,
                };
                match self
                    .detector
                    .classify(&repository.source, paper, &tracked.file, &changed, head)
                    .await
                {
                    Some(reason) => {
                        process_debug!(ProcessId::current(), "📄 Paper {} needs sync: {}", paper.id, reason);
                        true
                    }
                    None => false,
                }
            };

            // A build may commit while the diff is in flight; only write over the state classified
            let expected_cached_commit = Some(paper.cached_commit_hash.clone());
            let patch = if stale {
                PaperPatch {
                    needs_sync: Some(true),
                    pending_commit: Some(Some(commit.clone())),
                    expected_cached_commit,
                    ..PaperPatch::default()
                }
            } else {
                PaperPatch {
                    cached_commit_hash: Some(head.to_string()),
                    needs_sync: Some(false),
                    pending_commit: Some(None),
                    expected_cached_commit,
                    ..PaperPatch::default()
                }
            };

            match self.store.update_paper(&paper.id, Some(fence.clone()), patch).await? {
                WriteOutcome::Applied if stale => result.needing_sync += 1,
                WriteOutcome::Applied => result.advanced += 1,
                WriteOutcome::Conflict => {
                    process_debug!(
                        ProcessId::current(),
                        "⏭️ Paper {} was rebuilt during the refresh, leaving it",
                        paper.id
                    );
                }
                WriteOutcome::Superseded => {
                    result.superseded = true;
                    break;
                }
            }
        }

        Ok(result)
    }

    async fn notify_updated(&self, repository: &Repository, head: &str, papers_needing_sync: usize, now: DateTime<Utc>) {
        let task = OutboxTask::new(
            DeferredTask::Notify {
                user_id: repository.user_id.clone(),
                event: NotificationEvent::RepositoryUpdated {
                    repository_id: repository.id.clone(),
                    commit_hash: head.to_string(),
                    papers_needing_sync,
                },
            },
            now,
        );
        if let Err(e) = self.store.enqueue_tasks(vec![task]).await {
            process_error!(
                ProcessId::current(),
                "❌ Could not enqueue update notification for {}: {}",
                repository.id,
                e
            );
        }
    }

    async fn record_failure(&self, repository: &Repository, fence: &Fence, error: &OrchestratorError) {
        process_error!(ProcessId::current(), "❌ Refresh of {} failed: {}", repository.id, error);

        let patch = RepositoryPatch {
            last_sync_error: Some(Some(error.to_string())),
            ..RepositoryPatch::default()
        };
        if let Err(e) = self.store.update_repository(&repository.id, Some(fence.clone()), patch).await {
            process_error!(ProcessId::current(), "❌ Could not record refresh error on {}: {}", repository.id, e);
        }
        if let Err(e) = self
            .leases
            .release(&fence.key, LeaseStatus::Error, Some(&fence.attempt_id))
            .await
        {
            process_error!(ProcessId::current(), "❌ Could not release lease on {}: {}", repository.id, e);
        }
    }
}
