//! Notification payloads delivered to users

use serde::{Deserialize, Serialize};

use crate::types::{PaperId, RepositoryId};

/// Event pushed to a user's notification channel
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationEvent {
    BuildSucceeded {
        paper_id: PaperId,
        title: String,
        commit_hash: Option<String>,
    },
    BuildFailed {
        paper_id: PaperId,
        title: String,
        error: String,
    },
    RepositoryUpdated {
        repository_id: RepositoryId,
        commit_hash: String,
        papers_needing_sync: usize,
    },
}

impl NotificationEvent {
    /// Short human readable title
    pub fn headline(&self) -> String {
        match self {
            NotificationEvent::BuildSucceeded { title, .. } => format!("{title} is up to date"),
            NotificationEvent::BuildFailed { title, .. } => format!("{title} failed to build"),
            NotificationEvent::RepositoryUpdated {
                papers_needing_sync, ..
            } => format!("{papers_needing_sync} paper(s) have new changes"),
        }
    }
}
