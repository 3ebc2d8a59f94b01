//! Persisted entities of the paper mirror
//!
//! Repositories are refreshed against their remote, tracked files name a path
//! inside a repository, and papers carry the artifact built from a tracked
//! file together with the inputs that produced it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{ArtifactRef, AttemptId, PaperId, RepositoryId, TrackedFileId, UserId, VersionId};

/// Refresh lifecycle of a repository
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Error,
}

/// Build lifecycle of a paper
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    #[default]
    Idle,
    Building,
    Error,
}

/// How the artifact of a tracked file is produced
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductionMode {
    /// The PDF is committed to the repository and fetched verbatim
    Committed,
    /// The PDF is compiled from sources
    Compile,
}

impl fmt::Display for ProductionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProductionMode::Committed => write!(f, "committed"),
            ProductionMode::Compile => write!(f, "compile"),
        }
    }
}

/// Content fingerprint of one source file an artifact depends on
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyHash {
    pub path: String,
    pub hash: String,
}

impl DependencyHash {
    pub fn new(path: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            hash: hash.into(),
        }
    }
}

/// Commit metadata as reported by the source host
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub sha: String,
    pub message: Option<String>,
    pub author: Option<String>,
    pub date: Option<DateTime<Utc>>,
}

impl CommitInfo {
    pub fn sha_only(sha: impl Into<String>) -> Self {
        Self {
            sha: sha.into(),
            message: None,
            author: None,
            date: None,
        }
    }
}

/// Location of a remote source project
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoRef {
    /// Clone URL or local path of the remote
    pub remote: String,
}

impl RepoRef {
    pub fn new(remote: impl Into<String>) -> Self {
        Self { remote: remote.into() }
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.remote)
    }
}

/// A registered remote repository owned by one user
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub id: RepositoryId,
    pub user_id: UserId,
    pub source: RepoRef,
    pub default_branch: String,
    pub last_commit_hash: Option<String>,
    pub last_commit_time: Option<DateTime<Utc>>,
    pub last_commit_author: Option<String>,
    pub last_commit_message: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub sync_status: SyncStatus,
    pub sync_lock_acquired_at: Option<DateTime<Utc>>,
    pub current_sync_attempt_id: Option<AttemptId>,
    pub last_sync_error: Option<String>,
    /// Opt-in for the periodic background refresh
    #[serde(default)]
    pub background_refresh: bool,
}

impl Repository {
    pub fn new(user_id: UserId, source: RepoRef, default_branch: impl Into<String>) -> Self {
        Self {
            id: RepositoryId::new(),
            user_id,
            source,
            default_branch: default_branch.into(),
            last_commit_hash: None,
            last_commit_time: None,
            last_commit_author: None,
            last_commit_message: None,
            last_synced_at: None,
            sync_status: SyncStatus::Idle,
            sync_lock_acquired_at: None,
            current_sync_attempt_id: None,
            last_sync_error: None,
            background_refresh: false,
        }
    }
}

/// A path inside a repository plus how its artifact is produced
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedFile {
    pub id: TrackedFileId,
    pub repository_id: RepositoryId,
    pub path: String,
    pub mode: ProductionMode,
    pub is_active: bool,
}

impl TrackedFile {
    pub fn new(repository_id: RepositoryId, path: impl Into<String>, mode: ProductionMode) -> Self {
        Self {
            id: TrackedFileId::new(),
            repository_id,
            path: path.into(),
            mode,
            is_active: true,
        }
    }
}

/// Artifact currently attached to a paper or version
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredArtifact {
    pub reference: ArtifactRef,
    pub size_bytes: u64,
}

/// The artifact-bearing projection of a tracked file
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Paper {
    pub id: PaperId,
    pub user_id: UserId,
    /// `None` for standalone uploads
    pub repository_id: Option<RepositoryId>,
    pub tracked_file_id: Option<TrackedFileId>,
    pub title: String,
    pub artifact: Option<StoredArtifact>,
    pub cached_commit_hash: Option<String>,
    pub cached_dependencies: Option<Vec<DependencyHash>>,
    pub cached_pdf_blob_hash: Option<String>,
    /// `None` for records written before the flag existed
    pub needs_sync: Option<bool>,
    /// Commit that made the paper stale, kept for display
    pub pending_commit: Option<CommitInfo>,
    pub build_status: BuildStatus,
    pub build_lock_acquired_at: Option<DateTime<Utc>>,
    pub current_build_attempt_id: Option<AttemptId>,
    pub last_sync_error: Option<String>,
    pub last_built_at: Option<DateTime<Utc>>,
}

impl Paper {
    pub fn new(user_id: UserId, title: impl Into<String>) -> Self {
        Self {
            id: PaperId::new(),
            user_id,
            repository_id: None,
            tracked_file_id: None,
            title: title.into(),
            artifact: None,
            cached_commit_hash: None,
            cached_dependencies: None,
            cached_pdf_blob_hash: None,
            needs_sync: None,
            pending_commit: None,
            build_status: BuildStatus::Idle,
            build_lock_acquired_at: None,
            current_build_attempt_id: None,
            last_sync_error: None,
            last_built_at: None,
        }
    }

    /// Paper tracking `file` inside its repository
    pub fn tracking(user_id: UserId, file: &TrackedFile, title: impl Into<String>) -> Self {
        Self {
            repository_id: Some(file.repository_id.clone()),
            tracked_file_id: Some(file.id.clone()),
            ..Self::new(user_id, title)
        }
    }

    /// Whether an artifact has been produced at least once
    pub fn has_been_built(&self) -> bool {
        self.artifact.is_some() && self.cached_commit_hash.is_some()
    }
}

/// Snapshot of an artifact that has been replaced
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaperVersion {
    pub id: VersionId,
    pub paper_id: PaperId,
    pub commit_hash: Option<String>,
    pub artifact: StoredArtifact,
    pub created_at: DateTime<Utc>,
    pub pinned: bool,
}

/// A tracked paper together with the file it projects
#[derive(Clone, Debug, PartialEq)]
pub struct TrackedPaper {
    pub paper: Paper,
    pub file: TrackedFile,
}

/// User-triggerable actions gated by the rate limiter
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAction {
    RefreshRepository,
    BuildPaper,
    RefreshAll,
    BackgroundRefresh,
}

impl fmt::Display for RateLimitAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitAction::RefreshRepository => write!(f, "refresh_repository"),
            RateLimitAction::BuildPaper => write!(f, "build_paper"),
            RateLimitAction::RefreshAll => write!(f, "refresh_all"),
            RateLimitAction::BackgroundRefresh => write!(f, "background_refresh"),
        }
    }
}

/// Attempt history and lockout for one (user, action) pair
///
/// `revision` increases on every write so concurrent updates can be detected.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRecord {
    pub revision: u64,
    pub attempts: Vec<DateTime<Utc>>,
    pub locked_until: Option<DateTime<Utc>>,
}
