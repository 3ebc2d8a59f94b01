//! Common test utilities and infrastructure
//!
//! Fakes for the outside collaborators, fixtures for the usual entity layout
//! and a harness wiring them to the real memory store and a manual clock.
#![allow(dead_code)]

pub mod fakes;
pub mod fixtures;
pub mod helpers;

// Re-export commonly used items for convenience
pub use fakes::{FakeProducer, FakeSource, MemoryArtifacts, RecordingNotifier};
pub use fixtures::TestFixtures;
pub use helpers::{test_config, Harness};
