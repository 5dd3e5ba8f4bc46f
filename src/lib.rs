//! Streaming engine for model-driven workspace actions.
//!
//! A language model's output arrives as arbitrarily split text chunks
//! that interleave narration with `<action>` markup. This crate turns
//! that stream into typed lifecycle events ([`parser`]), enforces the
//! read-before-write gate over the recognized actions ([`readset`]),
//! runs shell actions against a single remote process with
//! cancel-and-replace semantics ([`shell`]), and ties those pieces
//! together per model turn ([`session`]).
//!
//! The scanner is chunk-invariant: for a fixed concatenated input, the
//! emitted `Open`/`Close` events are identical no matter where the
//! chunk boundaries fall.

pub mod actions;
pub mod error;
pub mod parser;
pub mod readset;
pub mod session;
pub mod shell;

pub use actions::{ActionEvent, ActionHeader, ActionId, ActionKind, ActionPayload, ActionTag, Edit};
pub use error::{ApplyError, EditFailure, ShellError};
pub use parser::ActionParser;
pub use readset::{
    FileStore, MemoryFileStore, ReadSetConfig, ReadSetTracker, SubmissionOutcome,
    SubmissionRejection,
};
pub use session::{ActionOutcome, Session, SessionConfig, apply_edits};
pub use shell::channel::{AbortHandle, ExecChannel, PtyExecChannel};
pub use shell::sanitize::sanitize;
pub use shell::sentinel::{SentinelDecoder, SentinelToken};
pub use shell::{CommandResult, ExitStatus, SessionState, ShellCoordinator};
