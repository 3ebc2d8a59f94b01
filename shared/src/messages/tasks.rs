//! Deferred tasks stored in the outbox
//!
//! Tasks are enqueued in the same store write as the state change they
//! follow, then delivered at least once by the outbox worker. Every handler
//! must therefore be idempotent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::messages::events::NotificationEvent;
use crate::types::{PaperId, TaskId, UserId};

/// Work to perform after a state transition
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeferredTask {
    /// Apply the version retention policy to a paper
    CleanupVersions { paper_id: PaperId },
    /// Deliver a notification to a user
    Notify { user_id: UserId, event: NotificationEvent },
}

impl DeferredTask {
    pub fn kind(&self) -> &'static str {
        match self {
            DeferredTask::CleanupVersions { .. } => "cleanup_versions",
            DeferredTask::Notify { .. } => "notify",
        }
    }
}

/// Outbox record wrapping a deferred task
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxTask {
    pub id: TaskId,
    pub task: DeferredTask,
    /// Earliest time the task may be claimed
    pub due_at: DateTime<Utc>,
    /// Number of delivery attempts so far
    pub attempts: u32,
}

impl OutboxTask {
    pub fn new(task: DeferredTask, due_at: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::new(),
            task,
            due_at,
            attempts: 0,
        }
    }
}
