//! Orchestrator-specific error types

use shared::{RateLimitAction, SharedError};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Rate limit exceeded for {action}, retry after {}ms", retry_after.as_millis())]
    RateLimited { action: RateLimitAction, retry_after: Duration },

    #[error("Source file not found: {path}")]
    SourceNotFound { path: String },

    #[error("Source provider failed during {operation}: {message}")]
    Source { operation: String, message: String },

    #[error("Artifact producer failed for {path}: {message}")]
    Producer { path: String, message: String },

    #[error("Artifact store operation failed: {operation}: {message}")]
    ArtifactStore { operation: String, message: String },

    #[error("Entity store operation failed: {operation}: {message}")]
    Store { operation: String, message: String },

    #[error("Notification delivery failed: {message}")]
    Notification { message: String },

    #[error("Configuration error: {field}")]
    ConfigurationError { field: String },

    #[error("Shared component error: {0}")]
    SharedError(#[from] SharedError),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl OrchestratorError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn config(field: impl Into<String>) -> Self {
        Self::ConfigurationError { field: field.into() }
    }

    pub fn source(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::Source {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    pub fn store(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::Store {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    pub fn artifact_store(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::ArtifactStore {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Whether the failure means the tracked source path is missing
    pub fn is_source_not_found(&self) -> bool {
        matches!(self, Self::SourceNotFound { .. })
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_message_includes_retry_after() {
        let err = OrchestratorError::RateLimited {
            action: RateLimitAction::BuildPaper,
            retry_after: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "Rate limit exceeded for build_paper, retry after 1500ms");
    }

    #[test]
    fn test_source_not_found_detection() {
        assert!(OrchestratorError::SourceNotFound { path: "main.tex".into() }.is_source_not_found());
        assert!(!OrchestratorError::source("fetch", "boom").is_source_not_found());
    }
}
