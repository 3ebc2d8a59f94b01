//! Messages that leave the engine
//!
//! - `events`: user-facing notifications about refresh and build results
//! - `tasks`: deferred work recorded in the outbox

pub mod events;
pub mod tasks;

pub use events::NotificationEvent;
pub use tasks::{DeferredTask, OutboxTask};
