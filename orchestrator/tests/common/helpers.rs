//! Harness wiring the fakes into a real orchestrator

use chrono::Utc;
use paper_orchestrator::services::{ManualClock, MemoryStore};
use paper_orchestrator::{Clock, EngineConfig, EntityStore, Orchestrator};
use shared::{
    AttemptId, Fence, LeaseKey, LeaseState, Paper, PaperId, ProductionMode, RepoRef, Repository, TrackedFile, UserId,
};
use std::sync::Arc;
use std::time::Duration;

use super::fakes::{FakeProducer, FakeSource, MemoryArtifacts, RecordingNotifier};
use super::fixtures::TestFixtures;

pub type TestOrchestrator =
    Orchestrator<MemoryStore, FakeSource, FakeProducer, MemoryArtifacts, RecordingNotifier, ManualClock>;

/// Production defaults with every wait removed
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.change_detection.hash_retry_base_delay = Duration::ZERO;
    config.build.source_not_found_retry_delay = Duration::ZERO;
    config.retention.cleanup_delay = Duration::ZERO;
    config.retention.outbox_poll_interval = Duration::ZERO;
    config
}

pub struct Harness {
    pub orchestrator: Arc<TestOrchestrator>,
    pub store: Arc<MemoryStore>,
    pub source: Arc<FakeSource>,
    pub producer: Arc<FakeProducer>,
    pub artifacts: Arc<MemoryArtifacts>,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: Arc<ManualClock>,
    pub user: UserId,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(test_config(), FakeProducer::new())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::with(config, FakeProducer::new())
    }

    pub fn with(config: EngineConfig, producer: FakeProducer) -> Self {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(FakeSource::new(TestFixtures::COMMIT_A));
        let producer = Arc::new(producer);
        let artifacts = Arc::new(MemoryArtifacts::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let clock = Arc::new(ManualClock::new(Utc::now()));

        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            source.clone(),
            producer.clone(),
            artifacts.clone(),
            notifier.clone(),
            clock.clone(),
            config,
        ));

        Self {
            orchestrator,
            store,
            source,
            producer,
            artifacts,
            notifier,
            clock,
            user: UserId::new(),
        }
    }

    /// Repository owned by the harness user, last seen at `head`
    pub async fn add_repository(&self, head: Option<&str>) -> Repository {
        self.add_repository_for(&self.user, head).await
    }

    pub async fn add_repository_for(&self, user: &UserId, head: Option<&str>) -> Repository {
        let mut repository = Repository::new(user.clone(), RepoRef::new(TestFixtures::REMOTE), TestFixtures::BRANCH);
        repository.last_commit_hash = head.map(str::to_string);
        self.store.insert_repository(repository.clone()).await.unwrap();
        repository
    }

    /// Paper tracking `path` that has never been built
    pub async fn track(&self, repository: &Repository, path: &str, mode: ProductionMode) -> Paper {
        let file = TrackedFile::new(repository.id.clone(), path, mode);
        let paper = Paper::tracking(repository.user_id.clone(), &file, path);
        self.store.insert_tracked_file(file).await.unwrap();
        self.store.insert_paper(paper.clone()).await.unwrap();
        paper
    }

    /// Compiled `main.tex` paper built at commit A with artifact `art1`
    pub async fn built_paper(&self, repository: &Repository) -> Paper {
        let mut paper = self.track(repository, TestFixtures::MAIN_TEX, ProductionMode::Compile).await;
        paper.artifact = Some(TestFixtures::artifact("art1"));
        paper.cached_commit_hash = Some(TestFixtures::COMMIT_A.to_string());
        paper.cached_dependencies = Some(TestFixtures::dependencies_at_a());
        paper.needs_sync = Some(false);
        paper.last_built_at = Some(self.clock.now());
        self.store.insert_paper(paper.clone()).await.unwrap();
        paper
    }

    pub async fn paper(&self, id: &PaperId) -> Paper {
        self.store.get_paper(id).await.unwrap().unwrap()
    }

    pub async fn repository(&self, repository: &Repository) -> Repository {
        self.store.get_repository(&repository.id).await.unwrap().unwrap()
    }

    /// Take a lease directly in the store as some other worker would
    pub async fn hold_lease(&self, key: LeaseKey) -> Fence {
        let current = self.store.read_lease(&key).await.unwrap().unwrap();
        let attempt = AttemptId::new();
        let held = LeaseState::held(attempt.clone(), self.clock.now());
        assert!(self.store.swap_lease(&key, &current, held).await.unwrap());
        Fence::new(key, attempt)
    }
}
