//! In-process entity store
//!
//! Keeps every entity behind one async mutex, which makes each trait call a
//! single atomic read-modify-write. The whole state can be snapshotted to and
//! restored from a JSON file so the CLI keeps state between invocations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{
    process_debug, AttemptId, Fence, LeaseKey, LeaseState, LeaseStatus, OutboxTask, Paper, PaperId, PaperVersion,
    ProcessId, RateLimitAction, RateLimitRecord, Repository, RepositoryId, TaskId, TrackedFile, TrackedFileId,
    SharedError, TrackedPaper, UserId, VersionId, WriteOutcome,
};
use std::collections::HashMap;
use std::path::Path;
use tokio::fs;
use tokio::sync::Mutex;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::traits::{BuildCommit, EntityStore, PaperPatch, RepositoryPatch};

/// Serializable contents of the store
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct StoreState {
    pub repositories: HashMap<RepositoryId, Repository>,
    pub tracked_files: HashMap<TrackedFileId, TrackedFile>,
    pub papers: HashMap<PaperId, Paper>,
    pub versions: HashMap<VersionId, PaperVersion>,
    /// Keyed by `"{user}/{action}"`
    pub rate_limits: HashMap<String, RateLimitRecord>,
    pub outbox: Vec<OutboxTask>,
}

impl StoreState {
    fn lease(&self, key: &LeaseKey) -> Option<LeaseState> {
        match key {
            LeaseKey::Repository(id) => self.repositories.get(id).map(LeaseState::of_repository),
            LeaseKey::Paper(id) => self.papers.get(id).map(LeaseState::of_paper),
        }
    }

    fn set_lease(&mut self, key: &LeaseKey, state: &LeaseState) {
        match key {
            LeaseKey::Repository(id) => {
                if let Some(repository) = self.repositories.get_mut(id) {
                    state.apply_to_repository(repository);
                }
            }
            LeaseKey::Paper(id) => {
                if let Some(paper) = self.papers.get_mut(id) {
                    state.apply_to_paper(paper);
                }
            }
        }
    }

    /// Whether the fence's attempt still holds its lease
    fn fence_holds(&self, fence: &Fence) -> bool {
        self.lease(&fence.key)
            .and_then(|state| state.attempt_id)
            .is_some_and(|current| current == fence.attempt_id)
    }

    fn fence_allows(&self, fence: Option<&Fence>) -> bool {
        fence.map_or(true, |fence| self.fence_holds(fence))
    }
}

fn rate_limit_key(user_id: &UserId, action: RateLimitAction) -> String {
    format!("{user_id}/{action}")
}

pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_state(StoreState::default())
    }

    pub fn with_state(state: StoreState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    /// Restore a snapshot; a missing file yields an empty store
    pub async fn load(path: &Path) -> OrchestratorResult<Self> {
        match fs::read(path).await {
            Ok(bytes) => {
                let state: StoreState =
                    serde_json::from_slice(&bytes).map_err(|e| SharedError::DeserializationError {
                        message: format!("{}: {}", path.display(), e),
                    })?;
                process_debug!(
                    ProcessId::current(),
                    "💾 Loaded {} repositories and {} papers from {}",
                    state.repositories.len(),
                    state.papers.len(),
                    path.display()
                );
                Ok(Self::with_state(state))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write a snapshot, replacing the file atomically
    pub async fn save(&self, path: &Path) -> OrchestratorResult<()> {
        let json = {
            let state = self.state.lock().await;
            serde_json::to_vec_pretty(&*state).map_err(|e| SharedError::SerializationError {
                message: e.to_string(),
            })?
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Copy of the current state
    pub async fn snapshot(&self) -> StoreState {
        self.state.lock().await.clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn insert_repository(&self, repository: Repository) -> OrchestratorResult<()> {
        self.state
            .lock()
            .await
            .repositories
            .insert(repository.id.clone(), repository);
        Ok(())
    }

    async fn insert_tracked_file(&self, file: TrackedFile) -> OrchestratorResult<()> {
        let mut state = self.state.lock().await;
        if !state.repositories.contains_key(&file.repository_id) {
            return Err(OrchestratorError::not_found("repository", &file.repository_id));
        }
        state.tracked_files.insert(file.id.clone(), file);
        Ok(())
    }

    async fn insert_paper(&self, paper: Paper) -> OrchestratorResult<()> {
        self.state.lock().await.papers.insert(paper.id.clone(), paper);
        Ok(())
    }

    async fn get_repository(&self, id: &RepositoryId) -> OrchestratorResult<Option<Repository>> {
        Ok(self.state.lock().await.repositories.get(id).cloned())
    }

    async fn list_repositories(&self, user_id: &UserId) -> OrchestratorResult<Vec<Repository>> {
        let state = self.state.lock().await;
        let mut repositories: Vec<Repository> = state
            .repositories
            .values()
            .filter(|r| r.user_id == *user_id)
            .cloned()
            .collect();
        repositories.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(repositories)
    }

    async fn list_background_repositories(&self) -> OrchestratorResult<Vec<Repository>> {
        let state = self.state.lock().await;
        let mut repositories: Vec<Repository> = state
            .repositories
            .values()
            .filter(|r| r.background_refresh)
            .cloned()
            .collect();
        repositories.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(repositories)
    }

    async fn get_tracked_file(&self, id: &TrackedFileId) -> OrchestratorResult<Option<TrackedFile>> {
        Ok(self.state.lock().await.tracked_files.get(id).cloned())
    }

    async fn get_paper(&self, id: &PaperId) -> OrchestratorResult<Option<Paper>> {
        Ok(self.state.lock().await.papers.get(id).cloned())
    }

    async fn list_papers(&self, user_id: &UserId) -> OrchestratorResult<Vec<Paper>> {
        let state = self.state.lock().await;
        let mut papers: Vec<Paper> = state
            .papers
            .values()
            .filter(|p| p.user_id == *user_id)
            .cloned()
            .collect();
        papers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(papers)
    }

    async fn list_tracked_papers(&self, repository_id: &RepositoryId) -> OrchestratorResult<Vec<TrackedPaper>> {
        let state = self.state.lock().await;
        let mut tracked: Vec<TrackedPaper> = state
            .papers
            .values()
            .filter_map(|paper| {
                let file = state.tracked_files.get(paper.tracked_file_id.as_ref()?)?;
                (file.repository_id == *repository_id && file.is_active).then(|| TrackedPaper {
                    paper: paper.clone(),
                    file: file.clone(),
                })
            })
            .collect();
        tracked.sort_by(|a, b| a.paper.id.cmp(&b.paper.id));
        Ok(tracked)
    }

    async fn read_lease(&self, key: &LeaseKey) -> OrchestratorResult<Option<LeaseState>> {
        Ok(self.state.lock().await.lease(key))
    }

    async fn swap_lease(&self, key: &LeaseKey, expected: &LeaseState, next: LeaseState) -> OrchestratorResult<bool> {
        let mut state = self.state.lock().await;
        match state.lease(key) {
            Some(current) if current == *expected => {
                state.set_lease(key, &next);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(
        &self,
        key: &LeaseKey,
        status: LeaseStatus,
        attempt_id: Option<AttemptId>,
    ) -> OrchestratorResult<bool> {
        let mut state = self.state.lock().await;
        let Some(current) = state.lease(key) else {
            return Ok(false);
        };
        if attempt_id.is_some() && current.attempt_id != attempt_id {
            return Ok(false);
        }
        state.set_lease(key, &LeaseState::released(status));
        Ok(true)
    }

    async fn update_repository(
        &self,
        id: &RepositoryId,
        fence: Option<Fence>,
        patch: RepositoryPatch,
    ) -> OrchestratorResult<WriteOutcome> {
        let mut state = self.state.lock().await;
        if !state.repositories.contains_key(id) {
            return Err(OrchestratorError::not_found("repository", id));
        }
        if !state.fence_allows(fence.as_ref()) {
            return Ok(WriteOutcome::Superseded);
        }
        let Some(repository) = state.repositories.get_mut(id) else {
            return Err(OrchestratorError::not_found("repository", id));
        };

        if let Some(commit) = patch.last_commit {
            repository.last_commit_hash = Some(commit.sha);
            repository.last_commit_message = commit.message;
            repository.last_commit_author = commit.author;
            repository.last_commit_time = commit.date;
        }
        if let Some(synced_at) = patch.last_synced_at {
            repository.last_synced_at = Some(synced_at);
        }
        if let Some(error) = patch.last_sync_error {
            repository.last_sync_error = error;
        }
        Ok(WriteOutcome::Applied)
    }

    async fn update_paper(&self, id: &PaperId, fence: Option<Fence>, patch: PaperPatch) -> OrchestratorResult<WriteOutcome> {
        let mut state = self.state.lock().await;
        if !state.papers.contains_key(id) {
            return Err(OrchestratorError::not_found("paper", id));
        }
        if !state.fence_allows(fence.as_ref()) {
            return Ok(WriteOutcome::Superseded);
        }
        let Some(paper) = state.papers.get_mut(id) else {
            return Err(OrchestratorError::not_found("paper", id));
        };
        if let Some(expected) = &patch.expected_cached_commit {
            if paper.cached_commit_hash != *expected {
                return Ok(WriteOutcome::Conflict);
            }
        }

        if let Some(hash) = patch.cached_commit_hash {
            paper.cached_commit_hash = Some(hash);
        }
        if let Some(needs_sync) = patch.needs_sync {
            paper.needs_sync = Some(needs_sync);
        }
        if let Some(pending) = patch.pending_commit {
            paper.pending_commit = pending;
        }
        if let Some(error) = patch.last_sync_error {
            paper.last_sync_error = error;
        }
        Ok(WriteOutcome::Applied)
    }

    async fn commit_build(&self, id: &PaperId, fence: &Fence, commit: BuildCommit) -> OrchestratorResult<WriteOutcome> {
        let mut state = self.state.lock().await;
        if !state.papers.contains_key(id) {
            return Err(OrchestratorError::not_found("paper", id));
        }
        if fence.key != LeaseKey::Paper(id.clone()) || !state.fence_holds(fence) {
            return Ok(WriteOutcome::Superseded);
        }

        let StoreState { papers, versions, outbox, .. } = &mut *state;
        let Some(paper) = papers.get_mut(id) else {
            return Err(OrchestratorError::not_found("paper", id));
        };

        if let Some(previous) = paper.artifact.take() {
            let version = PaperVersion {
                id: VersionId::new(),
                paper_id: id.clone(),
                commit_hash: paper.cached_commit_hash.clone(),
                artifact: previous,
                created_at: commit.built_at,
                pinned: false,
            };
            versions.insert(version.id.clone(), version);
        }

        paper.artifact = Some(commit.artifact);
        paper.cached_commit_hash = Some(commit.commit_hash);
        paper.cached_dependencies = commit.dependencies;
        paper.cached_pdf_blob_hash = commit.blob_hash;
        paper.needs_sync = Some(false);
        paper.pending_commit = None;
        paper.last_sync_error = None;
        paper.last_built_at = Some(commit.built_at);
        LeaseState::released(LeaseStatus::Idle).apply_to_paper(paper);

        outbox.extend(commit.tasks);
        Ok(WriteOutcome::Applied)
    }

    async fn list_versions(&self, paper_id: &PaperId) -> OrchestratorResult<Vec<PaperVersion>> {
        let state = self.state.lock().await;
        let mut versions: Vec<PaperVersion> = state
            .versions
            .values()
            .filter(|v| v.paper_id == *paper_id)
            .cloned()
            .collect();
        versions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(versions)
    }

    async fn get_version(&self, id: &VersionId) -> OrchestratorResult<Option<PaperVersion>> {
        Ok(self.state.lock().await.versions.get(id).cloned())
    }

    async fn delete_versions(&self, paper_id: &PaperId, ids: Vec<VersionId>) -> OrchestratorResult<Vec<PaperVersion>> {
        let mut state = self.state.lock().await;
        let mut removed = Vec::new();
        for id in ids {
            // Pinning may have happened since the caller listed the versions
            let deletable = state
                .versions
                .get(&id)
                .is_some_and(|v| v.paper_id == *paper_id && !v.pinned);
            if deletable {
                if let Some(version) = state.versions.remove(&id) {
                    removed.push(version);
                }
            }
        }
        Ok(removed)
    }

    async fn set_version_pinned(&self, id: &VersionId, pinned: bool) -> OrchestratorResult<bool> {
        let mut state = self.state.lock().await;
        match state.versions.get_mut(id) {
            Some(version) => {
                version.pinned = pinned;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn load_rate_limit(&self, user_id: &UserId, action: RateLimitAction) -> OrchestratorResult<RateLimitRecord> {
        let state = self.state.lock().await;
        Ok(state
            .rate_limits
            .get(&rate_limit_key(user_id, action))
            .cloned()
            .unwrap_or_default())
    }

    async fn swap_rate_limit(
        &self,
        user_id: &UserId,
        action: RateLimitAction,
        expected_revision: u64,
        next: RateLimitRecord,
    ) -> OrchestratorResult<bool> {
        let mut state = self.state.lock().await;
        let key = rate_limit_key(user_id, action);
        let current = state.rate_limits.get(&key).map_or(0, |r| r.revision);
        if current != expected_revision {
            return Ok(false);
        }
        state.rate_limits.insert(key, next);
        Ok(true)
    }

    async fn enqueue_tasks(&self, tasks: Vec<OutboxTask>) -> OrchestratorResult<()> {
        self.state.lock().await.outbox.extend(tasks);
        Ok(())
    }

    async fn claim_due_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        claim_until: DateTime<Utc>,
    ) -> OrchestratorResult<Vec<OutboxTask>> {
        let mut state = self.state.lock().await;
        state.outbox.sort_by(|a, b| a.due_at.cmp(&b.due_at));

        let mut claimed = Vec::new();
        for task in state.outbox.iter_mut().filter(|t| t.due_at <= now).take(limit) {
            task.due_at = claim_until;
            task.attempts += 1;
            claimed.push(task.clone());
        }
        Ok(claimed)
    }

    async fn complete_task(&self, id: &TaskId) -> OrchestratorResult<()> {
        self.state.lock().await.outbox.retain(|t| t.id != *id);
        Ok(())
    }

    async fn retry_task(&self, id: &TaskId, due_at: DateTime<Utc>) -> OrchestratorResult<()> {
        let mut state = self.state.lock().await;
        if let Some(task) = state.outbox.iter_mut().find(|t| t.id == *id) {
            task.due_at = due_at;
        }
        Ok(())
    }
}
