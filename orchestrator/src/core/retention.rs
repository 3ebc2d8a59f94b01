//! Version retention policy

use shared::{PaperVersion, VersionId};

/// Versions to delete so that all pinned and the `keep_unpinned` newest
/// unpinned versions remain
pub fn select_expired(versions: &[PaperVersion], keep_unpinned: usize) -> Vec<VersionId> {
    let mut unpinned: Vec<&PaperVersion> = versions.iter().filter(|v| !v.pinned).collect();
    unpinned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    unpinned
        .into_iter()
        .skip(keep_unpinned)
        .map(|v| v.id.clone())
        .collect()
}
