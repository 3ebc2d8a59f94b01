//! Tests for FsArtifactStore

use shared::ArtifactRef;
use tempfile::TempDir;

use crate::services::FsArtifactStore;
use crate::traits::ArtifactStore;

#[tokio::test]
async fn test_store_then_read_back() {
    let dir = TempDir::new().unwrap();
    let store = FsArtifactStore::new(dir.path().join("artifacts"));

    let reference = store.store(b"%PDF-1.7".to_vec()).await.unwrap();
    assert!(reference.as_str().ends_with(".pdf"));
    assert_eq!(store.read(&reference).await.unwrap(), b"%PDF-1.7".to_vec());
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = FsArtifactStore::new(dir.path().to_path_buf());

    let reference = store.store(vec![1, 2, 3]).await.unwrap();
    store.delete(&reference).await.unwrap();
    store.delete(&reference).await.unwrap();
    assert!(store.read(&reference).await.is_err());
}

#[tokio::test]
async fn test_references_cannot_escape_base_dir() {
    let dir = TempDir::new().unwrap();
    let store = FsArtifactStore::new(dir.path().to_path_buf());

    assert!(store.delete(&ArtifactRef::new("../etc/passwd")).await.is_err());
    assert!(store.path_of(&ArtifactRef::new(".hidden")).is_err());
}
