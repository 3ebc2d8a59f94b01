//! Service-specific tests
//!
//! Each service has its own test file; shared fixtures live in `common`.

#[cfg(test)]
mod artifact_store;

// Common test utilities for services
#[cfg(test)]
pub mod common {
    use shared::{ArtifactRef, Paper, ProductionMode, RepoRef, Repository, StoredArtifact, TrackedFile, UserId};

    /// A repository with one compile-mode file and its paper
    pub fn tracked_setup() -> (Repository, TrackedFile, Paper) {
        let user = UserId::new();
        let repository = Repository::new(user.clone(), RepoRef::new("/srv/git/thesis"), "main");
        let file = TrackedFile::new(repository.id.clone(), "main.tex", ProductionMode::Compile);
        let paper = Paper::tracking(user, &file, "Thesis");
        (repository, file, paper)
    }

    pub fn artifact(name: &str) -> StoredArtifact {
        StoredArtifact {
            reference: ArtifactRef::new(name),
            size_bytes: 42,
        }
    }
}
