//! Rebuild decision rules
//!
//! Decides from cached fingerprints and a commit-range diff whether a paper's
//! artifact is stale. Anything uncertain resolves to "changed": a redundant
//! rebuild is cheap compared to serving a stale PDF.

use shared::{DependencyHash, Paper, ProductionMode, TrackedFile};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Paths changed in a commit range
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangedFiles {
    Known(HashSet<String>),
    /// The host could not diff the range; everything may have changed
    Unknown,
}

impl ChangedFiles {
    /// An empty list is indistinguishable from a failed diff and counts as unknown
    pub fn from_paths(paths: Vec<String>) -> Self {
        if paths.is_empty() {
            ChangedFiles::Unknown
        } else {
            ChangedFiles::Known(paths.into_iter().collect())
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, ChangedFiles::Known(_))
    }
}

/// Why an artifact needs a rebuild
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeReason {
    NeverBuilt,
    PathChanged(String),
    NoFingerprints,
    HashMismatch(String),
    HashMissing(String),
    HashFetchFailed,
}

impl fmt::Display for ChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeReason::NeverBuilt => write!(f, "never built"),
            ChangeReason::PathChanged(path) => write!(f, "{path} changed in commit range"),
            ChangeReason::NoFingerprints => write!(f, "no cached fingerprints"),
            ChangeReason::HashMismatch(path) => write!(f, "{path} content changed"),
            ChangeReason::HashMissing(path) => write!(f, "{path} has no current hash"),
            ChangeReason::HashFetchFailed => write!(f, "content hashes unavailable"),
        }
    }
}

/// First-pass assessment before any hash is fetched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assessment {
    Rebuild(ChangeReason),
    /// Inputs are disjoint from the diff; only the commit pointer moves
    Unchanged,
    /// No usable diff; compare these fingerprints with current hashes
    CompareHashes(Vec<DependencyHash>),
}

/// Fingerprints recorded for the paper's current artifact
///
/// Compile mode uses the dependency list; committed mode fingerprints the
/// tracked PDF itself through its blob hash.
pub fn cached_fingerprints(paper: &Paper, file: &TrackedFile) -> Option<Vec<DependencyHash>> {
    match file.mode {
        ProductionMode::Compile => paper
            .cached_dependencies
            .as_ref()
            .filter(|deps| !deps.is_empty())
            .cloned(),
        ProductionMode::Committed => paper
            .cached_pdf_blob_hash
            .as_ref()
            .map(|hash| vec![DependencyHash::new(file.path.clone(), hash.clone())]),
    }
}

/// Assess a tracked paper against a commit-range diff
pub fn assess(paper: &Paper, file: &TrackedFile, changed: &ChangedFiles) -> Assessment {
    if !paper.has_been_built() {
        return Assessment::Rebuild(ChangeReason::NeverBuilt);
    }

    match changed {
        ChangedFiles::Known(paths) => match file.mode {
            ProductionMode::Committed => {
                if paths.contains(&file.path) {
                    Assessment::Rebuild(ChangeReason::PathChanged(file.path.clone()))
                } else {
                    Assessment::Unchanged
                }
            }
            ProductionMode::Compile => match cached_fingerprints(paper, file) {
                None => Assessment::Rebuild(ChangeReason::NoFingerprints),
                Some(deps) => match deps.iter().find(|dep| paths.contains(&dep.path)) {
                    Some(dep) => Assessment::Rebuild(ChangeReason::PathChanged(dep.path.clone())),
                    None => Assessment::Unchanged,
                },
            },
        },
        ChangedFiles::Unknown => match cached_fingerprints(paper, file) {
            None => Assessment::Rebuild(ChangeReason::NoFingerprints),
            Some(deps) => Assessment::CompareHashes(deps),
        },
    }
}

/// Compare cached fingerprints with freshly fetched hashes
///
/// Returns the first difference; a path absent from `current` or mapped to
/// `None` counts as changed.
pub fn compare_fingerprints(
    cached: &[DependencyHash],
    current: &HashMap<String, Option<String>>,
) -> Option<ChangeReason> {
    if cached.is_empty() {
        return Some(ChangeReason::NoFingerprints);
    }
    for dep in cached {
        match current.get(&dep.path) {
            Some(Some(hash)) if *hash == dep.hash => continue,
            Some(Some(_)) => return Some(ChangeReason::HashMismatch(dep.path.clone())),
            Some(None) | None => return Some(ChangeReason::HashMissing(dep.path.clone())),
        }
    }
    None
}
