//! Core shared types and identifiers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

pub mod ids;
pub mod lease;
pub mod model;

pub use ids::*;
pub use lease::*;
pub use model::*;

/// Global process identifier instance
static PROCESS_ID: OnceLock<ProcessId> = OnceLock::new();

/// Role of the running process, attached to every log line
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessId {
    /// One-shot command invoked from the CLI
    Cli,
    /// Long-running background refresh daemon
    Daemon,
    /// Library embedded in a host process that never initialized a role
    Embedded,
}

impl ProcessId {
    /// Initialize the global process ID for one-shot commands
    pub fn init_cli() -> &'static ProcessId {
        PROCESS_ID.get_or_init(|| ProcessId::Cli)
    }

    /// Initialize the global process ID for the daemon
    pub fn init_daemon() -> &'static ProcessId {
        PROCESS_ID.get_or_init(|| ProcessId::Daemon)
    }

    /// Get the global process ID, falling back to `Embedded`
    pub fn current() -> &'static ProcessId {
        PROCESS_ID.get_or_init(|| ProcessId::Embedded)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessId::Cli => write!(f, "cli"),
            ProcessId::Daemon => write!(f, "daemon"),
            ProcessId::Embedded => write!(f, "embedded"),
        }
    }
}
