//! Core business logic modules
//!
//! This module contains pure business logic with no I/O dependencies.
//! All functions are deterministic and easily testable.

pub mod change;
pub mod lease;
pub mod retention;
pub mod retry;
pub mod sync_state;
pub mod window;

pub use change::{Assessment, ChangeReason, ChangedFiles};
pub use lease::LeaseDecision;
pub use sync_state::PaperSyncState;
pub use window::WindowDecision;
