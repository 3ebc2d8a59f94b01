//! Outbox worker
//!
//! Delivers deferred tasks enqueued alongside state transitions. Claims are
//! leases too: a claimed task stays hidden until its claim expires, so a
//! worker that dies mid-task hands it to the next poll. Delivery is at least
//! once and every handler tolerates repeats.

use shared::{
    logging, process_debug, process_error, process_warn, DeferredTask, NotificationEvent, OutboxTask, PaperId,
    ProcessId, UserId,
};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::RetentionConfig;
use crate::core::{retention, retry};
use crate::error::OrchestratorResult;
use crate::traits::{ArtifactStore, Clock, EntityStore, NotificationSink};

/// Tasks claimed per poll
const CLAIM_BATCH: usize = 32;

/// What one poll did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutboxReport {
    pub completed: usize,
    pub retried: usize,
    pub dropped: usize,
}

impl OutboxReport {
    pub fn handled(&self) -> usize {
        self.completed + self.retried + self.dropped
    }
}

pub struct OutboxWorker<S, A, N, C>
where
    S: EntityStore + 'static,
    A: ArtifactStore + 'static,
    N: NotificationSink + 'static,
    C: Clock + 'static,
{
    store: Arc<S>,
    artifacts: Arc<A>,
    notifier: Arc<N>,
    clock: Arc<C>,
    config: RetentionConfig,
}

impl<S, A, N, C> OutboxWorker<S, A, N, C>
where
    S: EntityStore + 'static,
    A: ArtifactStore + 'static,
    N: NotificationSink + 'static,
    C: Clock + 'static,
{
    pub fn new(store: Arc<S>, artifacts: Arc<A>, notifier: Arc<N>, clock: Arc<C>, config: RetentionConfig) -> Self {
        Self {
            store,
            artifacts,
            notifier,
            clock,
            config,
        }
    }

    /// Claim and handle every task that is due now
    pub async fn run_once(&self) -> OrchestratorResult<OutboxReport> {
        let now = self.clock.now();
        let claim_until = now + to_chrono(self.config.task_claim_timeout);
        let tasks = self.store.claim_due_tasks(now, CLAIM_BATCH, claim_until).await?;

        let mut report = OutboxReport::default();
        for task in tasks {
            match self.handle(&task).await {
                Ok(()) => {
                    self.store.complete_task(&task.id).await?;
                    report.completed += 1;
                }
                Err(e) => {
                    let retries_done = task.attempts.saturating_sub(1);
                    let max_retries = self.config.max_task_attempts.saturating_sub(1);
                    match retry::next_retry(self.config.outbox_poll_interval, retries_done, max_retries) {
                        Some(delay) => {
                            process_warn!(
                                ProcessId::current(),
                                "📮 Task {} ({}) failed, retrying in {:?}: {}",
                                task.id,
                                task.task.kind(),
                                delay,
                                e
                            );
                            self.store.retry_task(&task.id, self.clock.now() + to_chrono(delay)).await?;
                            report.retried += 1;
                        }
                        None => {
                            process_error!(
                                ProcessId::current(),
                                "📮 Dropping task {} ({}) after {} attempts: {}",
                                task.id,
                                task.task.kind(),
                                task.attempts,
                                e
                            );
                            self.store.complete_task(&task.id).await?;
                            report.dropped += 1;
                        }
                    }
                }
            }
        }

        if report.handled() > 0 {
            process_debug!(ProcessId::current(), "📮 Outbox poll: {:?}", report);
        }
        Ok(report)
    }

    /// Poll until a shutdown signal arrives
    pub async fn run(&self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.outbox_poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        logging::log_error(ProcessId::current(), "Outbox poll", &e);
                    }
                }
            }
        }
        process_debug!(ProcessId::current(), "📮 Outbox worker stopped");
    }

    async fn handle(&self, task: &OutboxTask) -> OrchestratorResult<()> {
        match &task.task {
            DeferredTask::CleanupVersions { paper_id } => self.cleanup_versions(paper_id).await,
            DeferredTask::Notify { user_id, event } => {
                self.notify(user_id, event).await;
                Ok(())
            }
        }
    }

    async fn cleanup_versions(&self, paper_id: &PaperId) -> OrchestratorResult<()> {
        let versions = self.store.list_versions(paper_id).await?;
        let expired = retention::select_expired(&versions, self.config.keep_unpinned_versions);
        if expired.is_empty() {
            return Ok(());
        }

        let removed = self.store.delete_versions(paper_id, expired).await?;
        for version in &removed {
            if let Err(e) = self.artifacts.delete(&version.artifact.reference).await {
                process_warn!(
                    ProcessId::current(),
                    "🗑️ Could not delete artifact {} of version {}: {}",
                    version.artifact.reference,
                    version.id,
                    e
                );
            }
        }
        process_debug!(
            ProcessId::current(),
            "🗑️ Removed {} expired version(s) of paper {}",
            removed.len(),
            paper_id
        );
        Ok(())
    }

    /// Delivery failures are logged and swallowed
    async fn notify(&self, user_id: &UserId, event: &NotificationEvent) {
        if let Err(e) = self.notifier.notify(user_id, event).await {
            process_warn!(
                ProcessId::current(),
                "🔔 Notification '{}' to {} failed: {}",
                event.headline(),
                user_id,
                e
            );
        }
    }
}

fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrchestratorError;
    use crate::traits::{MockArtifactStore, MockClock, MockEntityStore, MockNotificationSink};
    use chrono::Utc;
    use shared::{ArtifactRef, PaperVersion, StoredArtifact, VersionId};

    fn worker(
        store: MockEntityStore,
        artifacts: MockArtifactStore,
        notifier: MockNotificationSink,
    ) -> OutboxWorker<MockEntityStore, MockArtifactStore, MockNotificationSink, MockClock> {
        let mut clock = MockClock::new();
        clock.expect_now().returning(Utc::now);
        let config = RetentionConfig {
            keep_unpinned_versions: 1,
            max_task_attempts: 2,
            ..RetentionConfig::default()
        };
        OutboxWorker::new(Arc::new(store), Arc::new(artifacts), Arc::new(notifier), Arc::new(clock), config)
    }

    fn claimed(task: DeferredTask, attempts: u32) -> OutboxTask {
        OutboxTask {
            attempts,
            ..OutboxTask::new(task, Utc::now())
        }
    }

    #[tokio::test]
    async fn test_notification_failure_is_swallowed() {
        let task = claimed(
            DeferredTask::Notify {
                user_id: UserId::new(),
                event: NotificationEvent::BuildFailed {
                    paper_id: PaperId::new(),
                    title: "Paper".into(),
                    error: "boom".into(),
                },
            },
            1,
        );
        let task_id = task.id.clone();

        let mut store = MockEntityStore::new();
        store
            .expect_claim_due_tasks()
            .return_once(move |_, _, _| Ok(vec![task]));
        store
            .expect_complete_task()
            .withf(move |id| *id == task_id)
            .times(1)
            .returning(|_| Ok(()));
        let mut notifier = MockNotificationSink::new();
        notifier
            .expect_notify()
            .returning(|_, _| Err(OrchestratorError::Notification { message: "down".into() }));

        let report = worker(store, MockArtifactStore::new(), notifier).run_once().await.unwrap();
        assert_eq!(report.completed, 1);
    }

    #[tokio::test]
    async fn test_cleanup_deletes_expired_artifacts() {
        let paper_id = PaperId::new();
        let now = Utc::now();
        let versions: Vec<PaperVersion> = (0..3)
            .map(|i| PaperVersion {
                id: VersionId::new(),
                paper_id: paper_id.clone(),
                commit_hash: Some(format!("c{i}")),
                artifact: StoredArtifact {
                    reference: ArtifactRef::new(format!("art{i}")),
                    size_bytes: 1,
                },
                created_at: now - chrono::Duration::minutes(i),
                pinned: false,
            })
            .collect();
        let expired: Vec<PaperVersion> = versions[1..].to_vec();

        let mut store = MockEntityStore::new();
        let task = claimed(
            DeferredTask::CleanupVersions {
                paper_id: paper_id.clone(),
            },
            1,
        );
        store
            .expect_claim_due_tasks()
            .return_once(move |_, _, _| Ok(vec![task]));
        store.expect_list_versions().return_once(move |_| Ok(versions));
        store
            .expect_delete_versions()
            .withf(|_, ids| ids.len() == 2)
            .return_once(move |_, _| Ok(expired));
        store.expect_complete_task().times(1).returning(|_| Ok(()));

        let mut artifacts = MockArtifactStore::new();
        artifacts
            .expect_delete()
            .withf(|r| r.as_str() == "art1" || r.as_str() == "art2")
            .times(2)
            .returning(|_| Ok(()));

        let report = worker(store, artifacts, MockNotificationSink::new()).run_once().await.unwrap();
        assert_eq!(report.completed, 1);
    }

    #[tokio::test]
    async fn test_failed_cleanup_is_retried_then_dropped() {
        let mut store = MockEntityStore::new();
        let first = claimed(DeferredTask::CleanupVersions { paper_id: PaperId::new() }, 1);
        let last = claimed(DeferredTask::CleanupVersions { paper_id: PaperId::new() }, 2);
        store
            .expect_claim_due_tasks()
            .return_once(move |_, _, _| Ok(vec![first, last]));
        store
            .expect_list_versions()
            .returning(|_| Err(OrchestratorError::store("list_versions", "offline")));
        store.expect_retry_task().times(1).returning(|_, _| Ok(()));
        store.expect_complete_task().times(1).returning(|_| Ok(()));

        let report = worker(store, MockArtifactStore::new(), MockNotificationSink::new())
            .run_once()
            .await
            .unwrap();
        assert_eq!(
            report,
            OutboxReport {
                completed: 0,
                retried: 1,
                dropped: 1
            }
        );
    }
}
