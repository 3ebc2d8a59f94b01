//! Change detector
//!
//! Wraps the source provider calls behind the rebuild rules in
//! `core::change`. Provider failures never escape from here: an unusable diff
//! becomes `ChangedFiles::Unknown` and an unusable hash batch means "changed".

use shared::{process_debug, process_warn, DependencyHash, Paper, ProcessId, RepoRef, TrackedFile};
use std::sync::Arc;

use crate::config::ChangeDetectionConfig;
use crate::core::change::{self, Assessment, ChangeReason, ChangedFiles};
use crate::core::retry;
use crate::traits::SourceProvider;

pub struct ChangeDetector<P>
where
    P: SourceProvider + 'static,
{
    source: Arc<P>,
    config: ChangeDetectionConfig,
}

impl<P> ChangeDetector<P>
where
    P: SourceProvider + 'static,
{
    pub fn new(source: Arc<P>, config: ChangeDetectionConfig) -> Self {
        Self { source, config }
    }

    /// Paths changed between `base` and `head`
    pub async fn changed_files(&self, repo: &RepoRef, base: &str, head: &str) -> ChangedFiles {
        match self.source.fetch_changed_files(repo, base, head).await {
            Ok(paths) => {
                let changed = ChangedFiles::from_paths(paths);
                if !changed.is_known() {
                    process_debug!(
                        ProcessId::current(),
                        "🔍 Empty diff {}..{} for {}, falling back to hashes",
                        base,
                        head,
                        repo
                    );
                }
                changed
            }
            Err(e) => {
                process_warn!(ProcessId::current(), "🔍 Diff {}..{} failed for {}: {}", base, head, repo, e);
                ChangedFiles::Unknown
            }
        }
    }

    /// First difference between `cached` fingerprints and the content at `git_ref`
    ///
    /// The batch fetch is retried with exponential backoff; when every try
    /// fails the inputs are reported as changed.
    pub async fn compare_hashes(&self, repo: &RepoRef, git_ref: &str, cached: &[DependencyHash]) -> Option<ChangeReason> {
        if cached.is_empty() {
            return Some(ChangeReason::NoFingerprints);
        }
        let paths: Vec<String> = cached.iter().map(|dep| dep.path.clone()).collect();

        let mut retries_done = 0;
        loop {
            match self.source.fetch_content_hashes(repo, git_ref, paths.clone()).await {
                Ok(current) => return change::compare_fingerprints(cached, &current),
                Err(e) => {
                    let Some(delay) = retry::next_retry(
                        self.config.hash_retry_base_delay,
                        retries_done,
                        self.config.hash_fetch_retries,
                    ) else {
                        process_warn!(
                            ProcessId::current(),
                            "🔍 Hash fetch for {}@{} failed after {} tries, assuming changed: {}",
                            repo,
                            git_ref,
                            retries_done + 1,
                            e
                        );
                        return Some(ChangeReason::HashFetchFailed);
                    };
                    process_debug!(
                        ProcessId::current(),
                        "🔍 Hash fetch for {}@{} failed, retrying in {:?}: {}",
                        repo,
                        git_ref,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    retries_done += 1;
                }
            }
        }
    }

    /// Whether any cached dependency differs at `git_ref`
    pub async fn dependencies_changed(&self, repo: &RepoRef, git_ref: &str, cached: &[DependencyHash]) -> bool {
        self.compare_hashes(repo, git_ref, cached).await.is_some()
    }

    /// Why `paper` needs a rebuild at `head`, `None` when its inputs are unchanged
    pub async fn classify(
        &self,
        repo: &RepoRef,
        paper: &Paper,
        file: &TrackedFile,
        changed: &ChangedFiles,
        head: &str,
    ) -> Option<ChangeReason> {
        match change::assess(paper, file, changed) {
            Assessment::Unchanged => None,
            Assessment::Rebuild(reason) => Some(reason),
            Assessment::CompareHashes(cached) => self.compare_hashes(repo, head, &cached).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrchestratorError;
    use crate::traits::MockSourceProvider;
    use std::collections::HashMap;
    use std::time::Duration;

    fn detector(source: MockSourceProvider) -> ChangeDetector<MockSourceProvider> {
        let config = ChangeDetectionConfig {
            hash_fetch_retries: 2,
            hash_retry_base_delay: Duration::ZERO,
        };
        ChangeDetector::new(Arc::new(source), config)
    }

    #[tokio::test]
    async fn test_failed_diff_is_unknown() {
        let mut source = MockSourceProvider::new();
        source
            .expect_fetch_changed_files()
            .returning(|_, _, _| Err(OrchestratorError::source("diff", "unreachable")));

        let changed = detector(source).changed_files(&RepoRef::new("r"), "A", "B").await;
        assert_eq!(changed, ChangedFiles::Unknown);
    }

    #[tokio::test]
    async fn test_hash_fetch_recovers_within_retries() {
        let mut source = MockSourceProvider::new();
        let mut calls = 0;
        source.expect_fetch_content_hashes().times(3).returning(move |_, _, _| {
            calls += 1;
            if calls < 3 {
                Err(OrchestratorError::source("hashes", "timeout"))
            } else {
                Ok(HashMap::from([("main.tex".to_string(), Some("h1".to_string()))]))
            }
        });

        let cached = vec![DependencyHash::new("main.tex", "h1")];
        let changed = detector(source)
            .dependencies_changed(&RepoRef::new("r"), "B", &cached)
            .await;
        assert!(!changed);
    }

    #[tokio::test]
    async fn test_exhausted_hash_retries_assume_changed() {
        let mut source = MockSourceProvider::new();
        source
            .expect_fetch_content_hashes()
            .times(3)
            .returning(|_, _, _| Err(OrchestratorError::source("hashes", "timeout")));

        let cached = vec![DependencyHash::new("main.tex", "h1")];
        let reason = detector(source).compare_hashes(&RepoRef::new("r"), "B", &cached).await;
        assert_eq!(reason, Some(ChangeReason::HashFetchFailed));
    }

    #[tokio::test]
    async fn test_no_fingerprints_skips_fetch() {
        let mut source = MockSourceProvider::new();
        source.expect_fetch_content_hashes().never();

        let reason = detector(source).compare_hashes(&RepoRef::new("r"), "B", &[]).await;
        assert_eq!(reason, Some(ChangeReason::NoFingerprints));
    }
}
