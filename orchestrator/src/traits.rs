//! Trait definitions with mockall annotations for testing
//!
//! The engine only talks to the outside world through these traits: the
//! persistent entity store, the remote source host, the artifact producer,
//! the artifact blob store, the notification channel and the clock. Real
//! implementations live in `crate::services`.

use chrono::{DateTime, Utc};
use shared::{
    ArtifactRef, AttemptId, CommitInfo, DependencyHash, Fence, LeaseKey, LeaseState, LeaseStatus,
    NotificationEvent, OutboxTask, Paper, PaperId, PaperVersion, ProductionMode, RateLimitAction,
    RateLimitRecord, RepoRef, Repository, RepositoryId, StoredArtifact, TaskId, TrackedFile,
    TrackedFileId, TrackedPaper, UserId, VersionId, WriteOutcome,
};
use std::collections::HashMap;

use crate::error::OrchestratorResult;

/// Partial update of repository metadata
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepositoryPatch {
    pub last_commit: Option<CommitInfo>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_sync_error: Option<Option<String>>,
}

/// Partial update of paper sync fields
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PaperPatch {
    pub cached_commit_hash: Option<String>,
    pub needs_sync: Option<bool>,
    pub pending_commit: Option<Option<CommitInfo>>,
    pub last_sync_error: Option<Option<String>>,
    /// Apply only while the stored cached commit still equals this
    pub expected_cached_commit: Option<Option<String>>,
}

/// Everything written atomically when a build attaches a new artifact
///
/// The store snapshots the paper's current artifact into a new version,
/// replaces artifact and inputs, clears the stale markers, releases the build
/// lease and enqueues `tasks`, all in one write.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildCommit {
    pub artifact: StoredArtifact,
    pub commit_hash: String,
    pub dependencies: Option<Vec<DependencyHash>>,
    pub blob_hash: Option<String>,
    pub built_at: DateTime<Utc>,
    pub tasks: Vec<OutboxTask>,
}

/// Latest commit of a branch
#[derive(Debug, Clone, PartialEq)]
pub struct LatestCommit {
    pub commit: CommitInfo,
    /// The provider confirmed the known hash is still the head
    pub unchanged: bool,
}

/// Request to materialize one artifact
#[derive(Debug, Clone, PartialEq)]
pub struct ProduceRequest {
    pub repo: RepoRef,
    pub branch: String,
    /// Exact commit the artifact must be produced from
    pub commit_sha: String,
    pub path: String,
    pub mode: ProductionMode,
}

/// Artifact produced by the compile/fetch backend
#[derive(Debug, Clone, PartialEq)]
pub struct ProducedArtifact {
    pub artifact: ArtifactRef,
    pub size_bytes: u64,
    /// Source fingerprints the artifact was built from (compile mode)
    pub dependencies: Option<Vec<DependencyHash>>,
    /// Blob hash of the fetched file (committed mode)
    pub blob_hash: Option<String>,
}

/// Persistent entity store
///
/// Every method is an atomic single-call operation. Methods taking a fence
/// re-read the fenced entity's attempt id inside the same atomic step and
/// return `WriteOutcome::Superseded` without writing when it no longer matches.
/// A paper patch carrying an expected cached commit returns
/// `WriteOutcome::Conflict` when the paper has moved on.
#[mockall::automock]
#[async_trait::async_trait]
pub trait EntityStore: Send + Sync {
    async fn insert_repository(&self, repository: Repository) -> OrchestratorResult<()>;

    async fn insert_tracked_file(&self, file: TrackedFile) -> OrchestratorResult<()>;

    async fn insert_paper(&self, paper: Paper) -> OrchestratorResult<()>;

    async fn get_repository(&self, id: &RepositoryId) -> OrchestratorResult<Option<Repository>>;

    /// All repositories owned by a user
    async fn list_repositories(&self, user_id: &UserId) -> OrchestratorResult<Vec<Repository>>;

    /// Repositories that opted into the periodic background refresh
    async fn list_background_repositories(&self) -> OrchestratorResult<Vec<Repository>>;

    async fn get_tracked_file(&self, id: &TrackedFileId) -> OrchestratorResult<Option<TrackedFile>>;

    async fn get_paper(&self, id: &PaperId) -> OrchestratorResult<Option<Paper>>;

    /// All papers owned by a user
    async fn list_papers(&self, user_id: &UserId) -> OrchestratorResult<Vec<Paper>>;

    /// Papers backed by an active tracked file of the repository
    async fn list_tracked_papers(&self, repository_id: &RepositoryId) -> OrchestratorResult<Vec<TrackedPaper>>;

    /// Current lease fields of an entity, `None` if the entity does not exist
    async fn read_lease(&self, key: &LeaseKey) -> OrchestratorResult<Option<LeaseState>>;

    /// Replace the lease with `next` only if it still equals `expected`
    async fn swap_lease(&self, key: &LeaseKey, expected: &LeaseState, next: LeaseState) -> OrchestratorResult<bool>;

    /// Set a terminal status, clearing holder and acquisition time
    ///
    /// With an attempt id the release only applies while that attempt still
    /// holds the lease.
    async fn release_lease(
        &self,
        key: &LeaseKey,
        status: LeaseStatus,
        attempt_id: Option<AttemptId>,
    ) -> OrchestratorResult<bool>;

    async fn update_repository(
        &self,
        id: &RepositoryId,
        fence: Option<Fence>,
        patch: RepositoryPatch,
    ) -> OrchestratorResult<WriteOutcome>;

    async fn update_paper(&self, id: &PaperId, fence: Option<Fence>, patch: PaperPatch) -> OrchestratorResult<WriteOutcome>;

    async fn commit_build(&self, id: &PaperId, fence: &Fence, commit: BuildCommit) -> OrchestratorResult<WriteOutcome>;

    /// Versions of a paper, newest first
    async fn list_versions(&self, paper_id: &PaperId) -> OrchestratorResult<Vec<PaperVersion>>;

    async fn get_version(&self, id: &VersionId) -> OrchestratorResult<Option<PaperVersion>>;

    /// Remove the given versions of a paper, returning the ones actually removed
    async fn delete_versions(&self, paper_id: &PaperId, ids: Vec<VersionId>) -> OrchestratorResult<Vec<PaperVersion>>;

    async fn set_version_pinned(&self, id: &VersionId, pinned: bool) -> OrchestratorResult<bool>;

    /// Rate limit record for (user, action); empty record when none exists
    async fn load_rate_limit(&self, user_id: &UserId, action: RateLimitAction) -> OrchestratorResult<RateLimitRecord>;

    /// Store `next` only if the stored revision still equals `expected_revision`
    async fn swap_rate_limit(
        &self,
        user_id: &UserId,
        action: RateLimitAction,
        expected_revision: u64,
        next: RateLimitRecord,
    ) -> OrchestratorResult<bool>;

    async fn enqueue_tasks(&self, tasks: Vec<OutboxTask>) -> OrchestratorResult<()>;

    /// Claim up to `limit` tasks due at `now`, hiding them until `claim_until`
    async fn claim_due_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        claim_until: DateTime<Utc>,
    ) -> OrchestratorResult<Vec<OutboxTask>>;

    async fn complete_task(&self, id: &TaskId) -> OrchestratorResult<()>;

    /// Make a claimed task visible again at `due_at`
    async fn retry_task(&self, id: &TaskId, due_at: DateTime<Utc>) -> OrchestratorResult<()>;
}

/// Remote source host abstraction
#[mockall::automock]
#[async_trait::async_trait]
pub trait SourceProvider: Send + Sync {
    /// Latest commit of `branch`
    ///
    /// When `known_hash` is given the provider may answer with
    /// `unchanged = true` and the known hash instead of fetching metadata.
    async fn fetch_latest_commit(
        &self,
        repo: &RepoRef,
        branch: &str,
        known_hash: Option<String>,
    ) -> OrchestratorResult<LatestCommit>;

    /// Paths changed between two commits
    async fn fetch_changed_files(&self, repo: &RepoRef, base: &str, head: &str) -> OrchestratorResult<Vec<String>>;

    /// Content hash of every path at `git_ref`, `None` for missing paths
    async fn fetch_content_hashes(
        &self,
        repo: &RepoRef,
        git_ref: &str,
        paths: Vec<String>,
    ) -> OrchestratorResult<HashMap<String, Option<String>>>;
}

/// Compile or fetch backend
#[mockall::automock]
#[async_trait::async_trait]
pub trait ArtifactProducer: Send + Sync {
    /// Produce and store the artifact for a tracked file
    ///
    /// Fails with `OrchestratorError::SourceNotFound` when the path does not
    /// exist at the requested commit.
    async fn compile_or_fetch(&self, request: ProduceRequest) -> OrchestratorResult<ProducedArtifact>;
}

/// Durable blob storage for artifacts
#[mockall::automock]
#[async_trait::async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn store(&self, bytes: Vec<u8>) -> OrchestratorResult<ArtifactRef>;

    async fn delete(&self, artifact: &ArtifactRef) -> OrchestratorResult<()>;
}

/// User notification channel
#[mockall::automock]
#[async_trait::async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, user_id: &UserId, event: &NotificationEvent) -> OrchestratorResult<()>;
}

/// Source of the current time
#[mockall::automock]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test that mock traits can be instantiated
    #[test]
    fn test_mock_trait_instantiation() {
        let _store = MockEntityStore::new();
        let _source = MockSourceProvider::new();
        let _producer = MockArtifactProducer::new();
        let _artifacts = MockArtifactStore::new();
        let _notifier = MockNotificationSink::new();
        let mut clock = MockClock::new();

        let fixed = Utc::now();
        clock.expect_now().return_const(fixed);
        assert_eq!(clock.now(), fixed);
    }
}
