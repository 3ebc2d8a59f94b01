//! Shared types for the paper mirror
//!
//! Contains the persisted entities, identifiers, outbound messages and logging
//! helpers used by the orchestration engine and its binaries.

pub mod errors;
pub mod logging;
pub mod messages;
pub mod types;

pub use errors::*;
pub use types::*;

pub use messages::{DeferredTask, NotificationEvent, OutboxTask};
