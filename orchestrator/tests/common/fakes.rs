//! Hand-written fakes for the outside collaborators
//!
//! Mocks suit single calls; these keep state across a whole scenario and
//! count what the engine asked for.

use async_trait::async_trait;
use paper_orchestrator::traits::{LatestCommit, ProduceRequest, ProducedArtifact};
use paper_orchestrator::{ArtifactProducer, ArtifactStore, NotificationSink, OrchestratorError, OrchestratorResult, SourceProvider};
use shared::{ArtifactRef, CommitInfo, DependencyHash, NotificationEvent, ProductionMode, RepoRef, UserId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};

use super::fixtures::TestFixtures;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

struct SourceState {
    head: CommitInfo,
    /// `None` makes the diff fail
    changed: Option<Vec<String>>,
    hashes: HashMap<String, Option<String>>,
    /// Remaining hash fetches that fail before succeeding again
    hash_failures: u32,
}

/// Source host with a single branch head shared by every repository
pub struct FakeSource {
    state: Mutex<SourceState>,
    latest_calls: AtomicUsize,
    diff_calls: AtomicUsize,
    hash_calls: AtomicUsize,
    diff_gate: Mutex<Option<Arc<Semaphore>>>,
    diff_entered: Notify,
}

impl FakeSource {
    pub fn new(head: &str) -> Self {
        Self {
            state: Mutex::new(SourceState {
                head: CommitInfo::sha_only(head),
                changed: Some(Vec::new()),
                hashes: HashMap::new(),
                hash_failures: 0,
            }),
            latest_calls: AtomicUsize::new(0),
            diff_calls: AtomicUsize::new(0),
            hash_calls: AtomicUsize::new(0),
            diff_gate: Mutex::new(None),
            diff_entered: Notify::new(),
        }
    }

    pub fn set_head(&self, sha: &str) {
        lock(&self.state).head = CommitInfo {
            sha: sha.to_string(),
            message: Some(format!("commit {}", &sha[..7.min(sha.len())])),
            author: Some("Ada".to_string()),
            date: None,
        };
    }

    pub fn set_changed(&self, paths: &[&str]) {
        lock(&self.state).changed = Some(paths.iter().map(|p| p.to_string()).collect());
    }

    pub fn fail_diff(&self) {
        lock(&self.state).changed = None;
    }

    pub fn set_hash(&self, path: &str, hash: Option<&str>) {
        lock(&self.state)
            .hashes
            .insert(path.to_string(), hash.map(str::to_string));
    }

    pub fn fail_hash_fetches(&self, times: u32) {
        lock(&self.state).hash_failures = times;
    }

    /// Diffs from now on block until the returned semaphore gets a permit
    ///
    /// The changed paths are read when the diff starts, so the remote can
    /// move on while it waits.
    pub fn gate_diffs(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *lock(&self.diff_gate) = Some(gate.clone());
        gate
    }

    /// Resolves once a diff has started
    pub async fn wait_diff_entered(&self) {
        self.diff_entered.notified().await;
    }

    pub fn latest_calls(&self) -> usize {
        self.latest_calls.load(Ordering::SeqCst)
    }

    pub fn diff_calls(&self) -> usize {
        self.diff_calls.load(Ordering::SeqCst)
    }

    pub fn hash_calls(&self) -> usize {
        self.hash_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceProvider for FakeSource {
    async fn fetch_latest_commit(
        &self,
        _repo: &RepoRef,
        _branch: &str,
        known_hash: Option<String>,
    ) -> OrchestratorResult<LatestCommit> {
        self.latest_calls.fetch_add(1, Ordering::SeqCst);
        let head = lock(&self.state).head.clone();
        let unchanged = known_hash.as_deref() == Some(head.sha.as_str());
        Ok(LatestCommit { commit: head, unchanged })
    }

    async fn fetch_changed_files(&self, _repo: &RepoRef, _base: &str, _head: &str) -> OrchestratorResult<Vec<String>> {
        self.diff_calls.fetch_add(1, Ordering::SeqCst);
        let changed = lock(&self.state).changed.clone();
        let gate = lock(&self.diff_gate).clone();
        self.diff_entered.notify_one();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }
        changed.ok_or_else(|| OrchestratorError::source("compare", "endpoint unavailable"))
    }

    async fn fetch_content_hashes(
        &self,
        _repo: &RepoRef,
        _git_ref: &str,
        paths: Vec<String>,
    ) -> OrchestratorResult<HashMap<String, Option<String>>> {
        self.hash_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = lock(&self.state);
        if state.hash_failures > 0 {
            state.hash_failures -= 1;
            return Err(OrchestratorError::source("content hashes", "tree lookup timed out"));
        }
        Ok(paths
            .into_iter()
            .map(|path| {
                let hash = state.hashes.get(&path).cloned().flatten();
                (path, hash)
            })
            .collect())
    }
}

/// Producer that hands out `built-N` artifacts
pub struct FakeProducer {
    calls: AtomicUsize,
    requests: Mutex<Vec<ProduceRequest>>,
    dependencies: Mutex<Vec<DependencyHash>>,
    /// Remaining calls that report the source as missing
    missing: AtomicU32,
    gate: Option<Arc<Semaphore>>,
    entered: Arc<Notify>,
}

impl FakeProducer {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            dependencies: Mutex::new(vec![DependencyHash::new(TestFixtures::MAIN_TEX, TestFixtures::MAIN_HASH_B)]),
            missing: AtomicU32::new(0),
            gate: None,
            entered: Arc::new(Notify::new()),
        }
    }

    /// Every call blocks until the returned semaphore gets a permit
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let producer = Self {
            gate: Some(gate.clone()),
            ..Self::new()
        };
        (producer, gate)
    }

    pub fn missing_source(&self, times: u32) {
        self.missing.store(times, Ordering::SeqCst);
    }

    pub fn set_dependencies(&self, dependencies: Vec<DependencyHash>) {
        *lock(&self.dependencies) = dependencies;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ProduceRequest> {
        lock(&self.requests).clone()
    }

    /// Resolves once a call has entered the producer
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }
}

#[async_trait]
impl ArtifactProducer for FakeProducer {
    async fn compile_or_fetch(&self, request: ProduceRequest) -> OrchestratorResult<ProducedArtifact> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.requests).push(request.clone());
        self.entered.notify_one();

        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }

        let missing = self.missing.load(Ordering::SeqCst);
        if missing > 0 {
            self.missing.store(missing - 1, Ordering::SeqCst);
            return Err(OrchestratorError::SourceNotFound { path: request.path });
        }

        let (dependencies, blob_hash) = match request.mode {
            ProductionMode::Compile => (Some(lock(&self.dependencies).clone()), None),
            ProductionMode::Committed => (None, Some(format!("blob-{}", request.commit_sha))),
        };
        Ok(ProducedArtifact {
            artifact: ArtifactRef::new(format!("built-{n}")),
            size_bytes: 2048,
            dependencies,
            blob_hash,
        })
    }
}

/// Artifact store that only remembers deletions
#[derive(Default)]
pub struct MemoryArtifacts {
    stored: AtomicUsize,
    deleted: Mutex<Vec<ArtifactRef>>,
}

impl MemoryArtifacts {
    pub fn deleted(&self) -> Vec<ArtifactRef> {
        lock(&self.deleted).clone()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifacts {
    async fn store(&self, _bytes: Vec<u8>) -> OrchestratorResult<ArtifactRef> {
        let n = self.stored.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ArtifactRef::new(format!("stored-{n}")))
    }

    async fn delete(&self, artifact: &ArtifactRef) -> OrchestratorResult<()> {
        lock(&self.deleted).push(artifact.clone());
        Ok(())
    }
}

/// Notification sink that records every event
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(UserId, NotificationEvent)>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<NotificationEvent> {
        lock(&self.events).iter().map(|(_, event)| event.clone()).collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn notify(&self, user_id: &UserId, event: &NotificationEvent) -> OrchestratorResult<()> {
        lock(&self.events).push((user_id.clone(), event.clone()));
        Ok(())
    }
}
