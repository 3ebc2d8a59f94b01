//! Service implementations
//!
//! This module contains real implementations of the collaborator traits.
//! These are the implementations the CLI wires together; tests mostly swap
//! them for mocks or fakes.

pub mod artifact_store;
pub mod clock;
pub mod command_producer;
pub mod git_source;
pub mod memory_store;
pub mod notifier;

#[cfg(test)]
mod tests;

// Re-export all service implementations
pub use artifact_store::FsArtifactStore;
pub use clock::{ManualClock, SystemClock};
pub use command_producer::CommandProducer;
pub use git_source::GitCliSource;
pub use memory_store::{MemoryStore, StoreState};
pub use notifier::{ConfiguredNotifier, LogNotifier, WebhookNotifier};
