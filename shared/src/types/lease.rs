//! Lease records shared by repositories and papers
//!
//! Repositories and papers keep their lease inline (status, acquisition time,
//! attempt id). This module gives both a common view so the lease manager
//! and the store can treat them uniformly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{AttemptId, PaperId, RepositoryId};
use super::model::{BuildStatus, Paper, Repository, SyncStatus};

/// Entity whose lease is being addressed
///
/// Repository refreshes and paper builds live in separate lease domains, so
/// papers of one repository can build while the repository refreshes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeaseKey {
    Repository(RepositoryId),
    Paper(PaperId),
}

impl fmt::Display for LeaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseKey::Repository(id) => write!(f, "repository:{id}"),
            LeaseKey::Paper(id) => write!(f, "paper:{id}"),
        }
    }
}

/// Domain-neutral lease status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseStatus {
    #[default]
    Idle,
    Busy,
    Error,
}

impl LeaseStatus {
    /// Terminal status written on release
    pub fn is_terminal(self) -> bool {
        !matches!(self, LeaseStatus::Busy)
    }
}

impl From<SyncStatus> for LeaseStatus {
    fn from(status: SyncStatus) -> Self {
        match status {
            SyncStatus::Idle => LeaseStatus::Idle,
            SyncStatus::Syncing => LeaseStatus::Busy,
            SyncStatus::Error => LeaseStatus::Error,
        }
    }
}

impl From<LeaseStatus> for SyncStatus {
    fn from(status: LeaseStatus) -> Self {
        match status {
            LeaseStatus::Idle => SyncStatus::Idle,
            LeaseStatus::Busy => SyncStatus::Syncing,
            LeaseStatus::Error => SyncStatus::Error,
        }
    }
}

impl From<BuildStatus> for LeaseStatus {
    fn from(status: BuildStatus) -> Self {
        match status {
            BuildStatus::Idle => LeaseStatus::Idle,
            BuildStatus::Building => LeaseStatus::Busy,
            BuildStatus::Error => LeaseStatus::Error,
        }
    }
}

impl From<LeaseStatus> for BuildStatus {
    fn from(status: LeaseStatus) -> Self {
        match status {
            LeaseStatus::Idle => BuildStatus::Idle,
            LeaseStatus::Busy => BuildStatus::Building,
            LeaseStatus::Error => BuildStatus::Error,
        }
    }
}

/// Snapshot of an entity's lease fields
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseState {
    pub status: LeaseStatus,
    pub acquired_at: Option<DateTime<Utc>>,
    pub attempt_id: Option<AttemptId>,
}

impl LeaseState {
    /// Fresh busy lease held by `attempt_id`
    pub fn held(attempt_id: AttemptId, acquired_at: DateTime<Utc>) -> Self {
        Self {
            status: LeaseStatus::Busy,
            acquired_at: Some(acquired_at),
            attempt_id: Some(attempt_id),
        }
    }

    /// Lease released with a terminal status
    pub fn released(status: LeaseStatus) -> Self {
        Self {
            status,
            acquired_at: None,
            attempt_id: None,
        }
    }

    pub fn of_repository(repository: &Repository) -> Self {
        Self {
            status: repository.sync_status.into(),
            acquired_at: repository.sync_lock_acquired_at,
            attempt_id: repository.current_sync_attempt_id.clone(),
        }
    }

    pub fn of_paper(paper: &Paper) -> Self {
        Self {
            status: paper.build_status.into(),
            acquired_at: paper.build_lock_acquired_at,
            attempt_id: paper.current_build_attempt_id.clone(),
        }
    }

    pub fn apply_to_repository(&self, repository: &mut Repository) {
        repository.sync_status = self.status.into();
        repository.sync_lock_acquired_at = self.acquired_at;
        repository.current_sync_attempt_id = self.attempt_id.clone();
    }

    pub fn apply_to_paper(&self, paper: &mut Paper) {
        paper.build_status = self.status.into();
        paper.build_lock_acquired_at = self.acquired_at;
        paper.current_build_attempt_id = self.attempt_id.clone();
    }
}

/// Proof of lease ownership carried by every write made on behalf of an attempt
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fence {
    pub key: LeaseKey,
    pub attempt_id: AttemptId,
}

impl Fence {
    pub fn new(key: LeaseKey, attempt_id: AttemptId) -> Self {
        Self { key, attempt_id }
    }
}

/// Result of a fenced write
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    /// The fence no longer matched; nothing was written
    Superseded,
    /// The entity moved past the state the write was computed from
    Conflict,
}

impl WriteOutcome {
    pub fn is_applied(self) -> bool {
        matches!(self, WriteOutcome::Applied)
    }
}
