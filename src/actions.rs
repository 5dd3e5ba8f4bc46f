//! Action model: the tagged representation of one unit of work the model
//! asked for, plus the lifecycle events the scanner emits while
//! recognizing it.
//!
//! Every recognized action is a closed variant (file write, file
//! modification, shell command) so consumers can pattern-match
//! exhaustively instead of probing optional fields.

use serde::{Deserialize, Serialize};

/// Opaque action identifier, unique within one parsing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionId(pub u64);

impl std::fmt::Display for ActionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "a{}", self.0)
    }
}

/// Discriminant carried by the opening marker's `type` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    File,
    Modify,
    Shell,
}

impl ActionKind {
    /// Parse the `type` attribute value. Unknown values are rejected so
    /// the scanner can fall back to literal text.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "file" => Some(Self::File),
            "modify" => Some(Self::Modify),
            "shell" => Some(Self::Shell),
            _ => None,
        }
    }

    /// Whether this variant requires a `path` attribute.
    #[must_use]
    pub fn requires_path(self) -> bool {
        matches!(self, Self::File | Self::Modify)
    }
}

/// One before/after replacement inside a `modify` action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edit {
    pub before: String,
    pub after: String,
}

/// Variant-specific payload accumulated from the action body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionPayload {
    /// Full file contents to write.
    File { content: String },
    /// Ordered textual edits applied by first occurrence.
    Modify { edits: Vec<Edit> },
    /// A shell command line.
    Shell { command: String },
}

impl ActionPayload {
    #[must_use]
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::File { .. } => ActionKind::File,
            Self::Modify { .. } => ActionKind::Modify,
            Self::Shell { .. } => ActionKind::Shell,
        }
    }
}

/// Header information available as soon as the opening marker's
/// attributes have been parsed, before any body content arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionHeader {
    pub id: ActionId,
    pub kind: ActionKind,
    /// Target path for `file`/`modify`; `None` for `shell`.
    pub path: Option<String>,
}

/// A fully recognized action. Immutable once the closing marker (or
/// `finalize`) sealed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionTag {
    pub id: ActionId,
    pub path: Option<String>,
    pub payload: ActionPayload,
    /// Set when the stream ended before the closing marker was seen.
    /// Content is whatever had accumulated; callers may treat it with
    /// lower confidence.
    pub implicitly_closed: bool,
}

impl ActionTag {
    #[must_use]
    pub fn kind(&self) -> ActionKind {
        self.payload.kind()
    }

    /// Target path for write/modify actions.
    #[must_use]
    pub fn target_path(&self) -> Option<&str> {
        self.path.as_deref()
    }
}

/// Lifecycle events emitted by the scanner.
///
/// For a given id, exactly one `Open` precedes zero or more `Stream`
/// events, followed by exactly one `Close`. `Stream` is emitted only for
/// `file` bodies; `modify` and `shell` payloads are delivered whole at
/// `Close` because their semantics require the complete edit/command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionEvent {
    Open { header: ActionHeader },
    Stream { id: ActionId, delta: String },
    Close { id: ActionId, action: ActionTag },
}

impl ActionEvent {
    #[must_use]
    pub fn id(&self) -> ActionId {
        match self {
            Self::Open { header } => header.id,
            Self::Stream { id, .. } | Self::Close { id, .. } => *id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parse_rejects_unknown_discriminants() {
        assert_eq!(ActionKind::parse("file"), Some(ActionKind::File));
        assert_eq!(ActionKind::parse("modify"), Some(ActionKind::Modify));
        assert_eq!(ActionKind::parse("shell"), Some(ActionKind::Shell));
        assert_eq!(ActionKind::parse("FILE"), None);
        assert_eq!(ActionKind::parse("exec"), None);
        assert_eq!(ActionKind::parse(""), None);
    }

    #[test]
    fn path_requirement_follows_variant() {
        assert!(ActionKind::File.requires_path());
        assert!(ActionKind::Modify.requires_path());
        assert!(!ActionKind::Shell.requires_path());
    }

    #[test]
    fn event_id_is_uniform_across_variants() {
        let header = ActionHeader {
            id: ActionId(3),
            kind: ActionKind::Shell,
            path: None,
        };
        let tag = ActionTag {
            id: ActionId(3),
            path: None,
            payload: ActionPayload::Shell {
                command: "ls".into(),
            },
            implicitly_closed: false,
        };
        assert_eq!(ActionEvent::Open { header }.id(), ActionId(3));
        assert_eq!(
            ActionEvent::Stream {
                id: ActionId(3),
                delta: String::new()
            }
            .id(),
            ActionId(3)
        );
        assert_eq!(
            ActionEvent::Close {
                id: ActionId(3),
                action: tag
            }
            .id(),
            ActionId(3)
        );
    }
}
