use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure taxonomy for every public supervisor operation. Operations
/// return these as values; nothing panics across the API boundary, so a
/// presentation layer can render outcomes uniformly.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or malformed identifiers or options.
    #[error("{0}")]
    Validation(String),

    #[error("project not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Conflict(#[from] Conflict),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("project store: {0}")]
    Persistence(#[from] StoreError),
}

/// The requested transition contradicts current state. Recoverable: the
/// project stays addressable and the operation can be retried.
#[derive(Debug, Error)]
pub enum Conflict {
    #[error("project is already running")]
    AlreadyRunning,

    #[error("project is not running")]
    NotRunning,

    #[error("port {requested} is unavailable (suggested: {suggested})")]
    PortUnavailable { requested: u16, suggested: u16 },

    #[error("destination already exists: {}", .0.display())]
    DestinationExists(PathBuf),
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("command not allowed: {0}")]
    CommandNotAllowed(String),

    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("waiting on {command}: {source}")]
    Wait {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("preparing logs at {}: {source}", .path.display())]
    Logs {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
