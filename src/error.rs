//! Typed errors crossing the engine's API seams.
//!
//! Recoverable outcomes (a gate rejection, an aborted command) are
//! ordinary values, not errors; these types cover genuine failures
//! only.

use thiserror::Error;

/// Failures of the execution channel itself.
#[derive(Debug, Error)]
pub enum ShellError {
    #[error("failed to write to the execution channel")]
    Write(#[source] std::io::Error),
}

/// A `modify` edit whose `before` text does not match the current
/// content. The submission itself was valid; only this application
/// step failed.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize)]
#[error("edit #{index} for {path} does not match the current file content")]
pub struct EditFailure {
    pub path: String,
    /// Zero-based position of the failing edit within the action.
    pub index: usize,
}

/// Failures while applying a finalized action.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error(transparent)]
    Edit(#[from] EditFailure),

    #[error(transparent)]
    Shell(#[from] ShellError),

    #[error("no shell session attached to this orchestration session")]
    NoShellSession,

    #[error("action is missing a target path")]
    MissingPath,
}
