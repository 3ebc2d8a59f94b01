//! Test fixtures and data for orchestrator tests

use shared::{ArtifactRef, DependencyHash, StoredArtifact};

/// Standard test data
pub struct TestFixtures;

impl TestFixtures {
    pub const REMOTE: &'static str = "https://git.example.org/papers/thesis.git";
    pub const BRANCH: &'static str = "main";
    pub const MAIN_TEX: &'static str = "main.tex";
    pub const OTHER_TEX: &'static str = "other.tex";
    pub const PAPER_PDF: &'static str = "paper.pdf";

    /// Commit the fixtures are cached at
    pub const COMMIT_A: &'static str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    /// Commit the remote advances to
    pub const COMMIT_B: &'static str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
    pub const COMMIT_C: &'static str = "cccccccccccccccccccccccccccccccccccccccc";

    pub const MAIN_HASH_A: &'static str = "1111111111111111111111111111111111111111";
    pub const MAIN_HASH_B: &'static str = "2222222222222222222222222222222222222222";
    pub const BLOB_HASH_A: &'static str = "3333333333333333333333333333333333333333";

    pub fn artifact(name: &str) -> StoredArtifact {
        StoredArtifact {
            reference: ArtifactRef::new(name),
            size_bytes: 1024,
        }
    }

    /// Fingerprints of a compiled paper at commit A
    pub fn dependencies_at_a() -> Vec<DependencyHash> {
        vec![DependencyHash::new(Self::MAIN_TEX, Self::MAIN_HASH_A)]
    }
}
