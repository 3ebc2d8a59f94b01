//! Derived sync state of a paper
//!
//! Computed on read from the lease-protected fields, never stored.

use serde::{Deserialize, Serialize};
use shared::{BuildStatus, Paper, Repository};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaperSyncState {
    /// Uploaded directly, not backed by a repository
    Standalone,
    NeverBuilt,
    Building,
    Failed,
    NeedsSync,
    InSync,
}

impl PaperSyncState {
    /// Whether a build would change what the user sees
    pub fn wants_build(self) -> bool {
        matches!(self, PaperSyncState::NeverBuilt | PaperSyncState::NeedsSync)
    }
}

impl fmt::Display for PaperSyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PaperSyncState::Standalone => "standalone",
            PaperSyncState::NeverBuilt => "never built",
            PaperSyncState::Building => "building",
            PaperSyncState::Failed => "failed",
            PaperSyncState::NeedsSync => "needs sync",
            PaperSyncState::InSync => "in sync",
        };
        write!(f, "{label}")
    }
}

/// Derive the sync state of `paper`
///
/// Records without a `needs_sync` flag fall back to comparing the cached
/// commit with the repository head.
pub fn derive(paper: &Paper, repository: Option<&Repository>) -> PaperSyncState {
    if paper.repository_id.is_none() {
        return PaperSyncState::Standalone;
    }
    if paper.build_status == BuildStatus::Building {
        return PaperSyncState::Building;
    }
    if paper.build_status == BuildStatus::Error || paper.last_sync_error.is_some() {
        return PaperSyncState::Failed;
    }
    if !paper.has_been_built() {
        return PaperSyncState::NeverBuilt;
    }
    if is_out_of_date(paper, repository) {
        PaperSyncState::NeedsSync
    } else {
        PaperSyncState::InSync
    }
}

/// Whether the artifact is missing or behind the repository, whatever the build status
pub fn is_out_of_date(paper: &Paper, repository: Option<&Repository>) -> bool {
    if paper.repository_id.is_none() {
        return false;
    }
    if !paper.has_been_built() {
        return true;
    }

    match paper.needs_sync {
        Some(stale) => stale,
        None => {
            let head = repository.and_then(|r| r.last_commit_hash.as_deref());
            matches!(head, Some(head) if paper.cached_commit_hash.as_deref() != Some(head))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{ArtifactRef, ProductionMode, RepoRef, StoredArtifact, TrackedFile, UserId};

    fn setup() -> (Repository, Paper) {
        let user = UserId::new();
        let mut repo = Repository::new(user.clone(), RepoRef::new("/srv/repo"), "main");
        repo.last_commit_hash = Some("B".into());
        let file = TrackedFile::new(repo.id.clone(), "main.tex", ProductionMode::Compile);
        let mut paper = Paper::tracking(user, &file, "Paper");
        paper.artifact = Some(StoredArtifact {
            reference: ArtifactRef::new("art1"),
            size_bytes: 1,
        });
        paper.cached_commit_hash = Some("A".into());
        (repo, paper)
    }

    #[test]
    fn test_standalone_paper() {
        let paper = Paper::new(UserId::new(), "Upload");
        assert_eq!(derive(&paper, None), PaperSyncState::Standalone);
    }

    #[test]
    fn test_explicit_flag_wins_over_commit_comparison() {
        let (repo, mut paper) = setup();
        paper.needs_sync = Some(false);
        assert_eq!(derive(&paper, Some(&repo)), PaperSyncState::InSync);

        paper.needs_sync = Some(true);
        assert_eq!(derive(&paper, Some(&repo)), PaperSyncState::NeedsSync);
    }

    #[test]
    fn test_legacy_record_compares_commits() {
        let (repo, mut paper) = setup();
        assert_eq!(derive(&paper, Some(&repo)), PaperSyncState::NeedsSync);

        paper.cached_commit_hash = Some("B".into());
        assert_eq!(derive(&paper, Some(&repo)), PaperSyncState::InSync);
    }

    #[test]
    fn test_lifecycle_states() {
        let (repo, mut paper) = setup();

        paper.build_status = BuildStatus::Building;
        assert_eq!(derive(&paper, Some(&repo)), PaperSyncState::Building);

        paper.build_status = BuildStatus::Error;
        assert_eq!(derive(&paper, Some(&repo)), PaperSyncState::Failed);

        paper.build_status = BuildStatus::Idle;
        paper.artifact = None;
        assert_eq!(derive(&paper, Some(&repo)), PaperSyncState::NeverBuilt);
        assert!(derive(&paper, Some(&repo)).wants_build());
    }

    #[test]
    fn test_failed_paper_can_still_be_out_of_date() {
        let (repo, mut paper) = setup();
        paper.last_sync_error = Some("boom".into());
        paper.needs_sync = Some(true);
        assert_eq!(derive(&paper, Some(&repo)), PaperSyncState::Failed);
        assert!(is_out_of_date(&paper, Some(&repo)));

        paper.needs_sync = Some(false);
        assert!(!is_out_of_date(&paper, Some(&repo)));
    }
}
