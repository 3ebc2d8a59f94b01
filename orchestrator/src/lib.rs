//! Sync and build orchestration for mirrored paper artifacts
//!
//! Keeps rendered PDFs in step with the version-controlled sources they come
//! from. Repositories are refreshed to discover new commits, tracked papers
//! are rebuilt only when their inputs changed, and concurrent work on the
//! same entity is serialized through fenced leases in the entity store.

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod services;
pub mod traits;

// Re-export commonly used types
pub use config::EngineConfig;
pub use core::PaperSyncState;
pub use engine::{BatchSummary, BuildOutcome, OutboxReport, RefreshOutcome, SkipReason};
pub use error::{OrchestratorError, OrchestratorResult};
pub use orchestrator::Orchestrator;
pub use traits::{ArtifactProducer, ArtifactStore, Clock, EntityStore, NotificationSink, SourceProvider};
