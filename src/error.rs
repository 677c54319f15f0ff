//! Error handling module for stackpilot
//!
//! Provides the crate-level error type. Each subsystem owns a narrower
//! `thiserror` enum (state store, locks, resolver, orchestrator, backups)
//! which converts into [`StackError`] at the CLI boundary.

use thiserror::Error;

use crate::backup::BackupError;
use crate::lock::LockError;
use crate::logic::resolver::ResolveError;
use crate::orchestrator::OrchestratorError;
use crate::state_store::StateError;

/// Main error type for stackpilot
#[derive(Error, Debug)]
pub enum StackError {
    /// IO errors (file operations, directories)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// State store errors (unwritable file, invalid key)
    #[error(transparent)]
    State(#[from] StateError),

    /// Lock acquisition errors
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Step registration / ordering errors
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// Orchestration run errors
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    /// Backup production / retention errors
    #[error(transparent)]
    Backup(#[from] BackupError),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for stackpilot operations
pub type Result<T> = std::result::Result<T, StackError>;

impl StackError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Process exit code for this error.
    ///
    /// - `1` — a step halted the run
    /// - `75` — a lock scope is busy (`EX_TEMPFAIL`)
    /// - `130` — interrupted by a signal, including while waiting for a lock
    /// - `2` — everything else is fatal
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Lock(LockError::Busy { .. }) => 75,
            Self::Lock(LockError::Interrupted { .. }) => 130,
            Self::Orchestrator(err) => err.exit_code(),
            Self::Backup(BackupError::Lock(LockError::Busy { .. })) => 75,
            Self::Backup(BackupError::Lock(LockError::Interrupted { .. })) => 130,
            _ => 2,
        }
    }
}
