//! Orchestration session: one model turn's parsing, gating, and
//! application state under a single identity.
//!
//! The session owns the scanner and the read-set tracker, borrows the
//! collaborator's file store, and optionally holds a shell coordinator.
//! It never writes files itself; `apply` returns the write as a value
//! for the collaborator to persist, keeping the store read-only from
//! this crate's side.

use std::sync::Arc;

use uuid::Uuid;

use crate::actions::{ActionEvent, ActionPayload, ActionTag, Edit};
use crate::error::{ApplyError, EditFailure};
use crate::parser::ActionParser;
use crate::readset::{FileStore, ReadSetConfig, ReadSetTracker, SubmissionOutcome};
use crate::shell::ShellCoordinator;

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub readset: ReadSetConfig,
}

/// Effect of applying one finalized action.
#[derive(Debug)]
pub enum ActionOutcome {
    /// New contents for `path`; the collaborator persists them.
    WriteFile { path: String, content: String },
    /// A shell command ran to completion.
    Command(crate::shell::CommandResult),
    /// The shell command was cancelled by a newer one before finishing.
    Superseded,
}

pub struct Session {
    id: Uuid,
    parser: ActionParser,
    tracker: ReadSetTracker,
    store: Arc<dyn FileStore>,
    shell: Option<ShellCoordinator>,
}

impl Session {
    #[must_use]
    pub fn new(store: Arc<dyn FileStore>, config: SessionConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            parser: ActionParser::new(),
            tracker: ReadSetTracker::new(config.readset),
            store,
            shell: None,
        }
    }

    #[must_use]
    pub fn with_shell(mut self, shell: ShellCoordinator) -> Self {
        self.shell = Some(shell);
        self
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Feed the next streamed chunk of model output.
    pub fn ingest(&mut self, chunk: &str) -> Vec<ActionEvent> {
        self.parser.feed(chunk)
    }

    /// Signal end of the model's output, implicitly closing any open
    /// action.
    pub fn finish(&mut self) -> Vec<ActionEvent> {
        self.parser.finalize()
    }

    /// Narration text recognized outside action markers since the last
    /// call.
    pub fn narration(&mut self) -> String {
        self.parser.take_text()
    }

    /// Fetch `path` from the store for the model's benefit, recording
    /// the disclosure in the read set.
    pub fn disclose(&mut self, path: &str) -> Option<String> {
        let contents = self.store.get_contents(path)?;
        self.tracker.record_read(path);
        tracing::debug!(session = %self.id, path, "disclosed file to the model");
        Some(contents)
    }

    pub fn read_set(&self) -> impl Iterator<Item = &str> {
        self.tracker.iter()
    }

    /// Gate a finalized submission against the read-before-write rule.
    pub fn submit(&self, actions: &[ActionTag]) -> SubmissionOutcome {
        let outcome = self.tracker.check_submission(actions, self.store.as_ref());
        if !outcome.is_accepted() {
            tracing::debug!(session = %self.id, "submission rejected by the read gate");
        }
        outcome
    }

    /// Apply one action from an accepted submission.
    pub async fn apply(&self, action: &ActionTag) -> Result<ActionOutcome, ApplyError> {
        match &action.payload {
            ActionPayload::File { content } => {
                let path = action.target_path().ok_or(ApplyError::MissingPath)?;
                Ok(ActionOutcome::WriteFile {
                    path: path.to_string(),
                    content: content.clone(),
                })
            }
            ActionPayload::Modify { edits } => {
                let path = action.target_path().ok_or(ApplyError::MissingPath)?;
                let current = self.store.get_contents(path).unwrap_or_default();
                let content = apply_edits(path, &current, edits)?;
                Ok(ActionOutcome::WriteFile {
                    path: path.to_string(),
                    content,
                })
            }
            ActionPayload::Shell { command } => {
                let shell = self.shell.as_ref().ok_or(ApplyError::NoShellSession)?;
                match shell.execute(command).await? {
                    Some(result) => Ok(ActionOutcome::Command(result)),
                    None => Ok(ActionOutcome::Superseded),
                }
            }
        }
    }
}

/// Apply ordered before/after edits to `content`. Each edit replaces the
/// first occurrence of its `before` text; an empty `before` is a full
/// write and is valid only against empty content.
pub fn apply_edits(path: &str, content: &str, edits: &[Edit]) -> Result<String, EditFailure> {
    let mut current = content.to_string();
    for (index, edit) in edits.iter().enumerate() {
        if edit.before.is_empty() {
            if !current.is_empty() {
                return Err(EditFailure {
                    path: path.to_string(),
                    index,
                });
            }
            current = edit.after.clone();
            continue;
        }
        if !current.contains(&edit.before) {
            return Err(EditFailure {
                path: path.to_string(),
                index,
            });
        }
        current = current.replacen(&edit.before, &edit.after, 1);
    }
    Ok(current)
}
