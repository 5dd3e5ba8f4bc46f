//! Read-set tracking and the read-before-write validation gate.
//!
//! A session records every source path whose contents were disclosed to
//! the model. Before a submission that writes or modifies pre-existing
//! files is accepted, the gate checks that each such path was read
//! first; brand-new paths and a small exempt class of generated files
//! never require a prior read. The gate does no I/O itself: whether a
//! path pre-exists comes from the collaborator-owned file store.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use crate::actions::ActionTag;

/// Exemption predicate: paths for which the read-before-write rule is
/// waived. The exact list is policy, so it is configurable.
pub type ExemptFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Generated files the model may overwrite without reading first.
fn default_exempt(path: &str) -> bool {
    path.starts_with("docs/generated/") || path.ends_with("asset-manifest.json")
}

#[derive(Clone)]
pub struct ReadSetConfig {
    pub exempt: ExemptFn,
}

impl Default for ReadSetConfig {
    fn default() -> Self {
        Self {
            exempt: Arc::new(default_exempt),
        }
    }
}

impl std::fmt::Debug for ReadSetConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadSetConfig").finish_non_exhaustive()
    }
}

/// Read-only lookup into the collaborator-owned file map.
pub trait FileStore: Send + Sync {
    /// `None` means the path does not exist in the working tree.
    fn get_contents(&self, path: &str) -> Option<String>;
}

/// In-memory file map for tests and previews.
#[derive(Debug, Default)]
pub struct MemoryFileStore {
    files: Mutex<BTreeMap<String, String>>,
}

impl MemoryFileStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<String>, content: impl Into<String>) {
        self.lock().insert(path.into(), content.into());
    }

    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FileStore for MemoryFileStore {
    fn get_contents(&self, path: &str) -> Option<String> {
        self.lock().get(path).cloned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Remediation {
    pub action: String,
}

/// Structured rejection emitted when a submission references
/// pre-existing paths that were never disclosed. The caller is expected
/// to read the missing paths and resubmit the identical payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionRejection {
    pub error_code: String,
    /// Deterministically sorted.
    pub missing_paths: Vec<String>,
    pub remediation: Remediation,
}

impl SubmissionRejection {
    fn need_read_files(missing_paths: Vec<String>) -> Self {
        Self {
            error_code: "NEED_READ_FILES".to_string(),
            missing_paths,
            remediation: Remediation {
                action: "read-then-resubmit".to_string(),
            },
        }
    }
}

/// Result of a gate check; a rejection is a recoverable value, never an
/// error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    Accepted,
    Rejected(SubmissionRejection),
}

impl SubmissionOutcome {
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Session-scoped set of disclosed paths. Monotonic: paths are only
/// ever added.
#[derive(Debug)]
pub struct ReadSetTracker {
    config: ReadSetConfig,
    paths: BTreeSet<String>,
}

impl Default for ReadSetTracker {
    fn default() -> Self {
        Self::new(ReadSetConfig::default())
    }
}

impl ReadSetTracker {
    #[must_use]
    pub fn new(config: ReadSetConfig) -> Self {
        Self {
            config,
            paths: BTreeSet::new(),
        }
    }

    /// Record that `path`'s contents were disclosed to the model.
    /// Idempotent.
    pub fn record_read(&mut self, path: impl Into<String>) {
        self.paths.insert(path.into());
    }

    #[must_use]
    pub fn has_read(&self, path: &str) -> bool {
        self.paths.contains(path)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }

    /// Gate a finalized submission. Only write/modify actions against
    /// paths that already exist in the store require a prior read.
    pub fn check_submission(
        &self,
        actions: &[ActionTag],
        store: &dyn FileStore,
    ) -> SubmissionOutcome {
        let mut missing: BTreeSet<String> = BTreeSet::new();
        for action in actions {
            let Some(path) = action.target_path() else {
                continue;
            };
            if (self.config.exempt)(path) {
                continue;
            }
            if store.get_contents(path).is_none() {
                // Brand-new path; nothing to have read.
                continue;
            }
            if !self.paths.contains(path) {
                missing.insert(path.to_string());
            }
        }
        if missing.is_empty() {
            SubmissionOutcome::Accepted
        } else {
            SubmissionOutcome::Rejected(SubmissionRejection::need_read_files(
                missing.into_iter().collect(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{ActionId, ActionPayload, ActionTag};
    use pretty_assertions::assert_eq;

    fn file_action(id: u64, path: &str) -> ActionTag {
        ActionTag {
            id: ActionId(id),
            path: Some(path.to_string()),
            payload: ActionPayload::File {
                content: String::new(),
            },
            implicitly_closed: false,
        }
    }

    fn shell_action(id: u64) -> ActionTag {
        ActionTag {
            id: ActionId(id),
            path: None,
            payload: ActionPayload::Shell {
                command: "ls".to_string(),
            },
            implicitly_closed: false,
        }
    }

    #[test]
    fn read_set_is_monotonic_and_idempotent() {
        let mut tracker = ReadSetTracker::default();
        tracker.record_read("a.ts");
        tracker.record_read("b.ts");
        tracker.record_read("a.ts");
        assert_eq!(tracker.len(), 2);
        assert!(tracker.has_read("a.ts"));
        assert!(tracker.has_read("b.ts"));
    }

    #[test]
    fn missing_paths_are_exactly_preexisting_minus_read() {
        let store = MemoryFileStore::new();
        store.insert("a.ts", "a");
        store.insert("b.ts", "b");

        let mut tracker = ReadSetTracker::default();
        tracker.record_read("a.ts");

        let actions = [file_action(1, "a.ts"), file_action(2, "b.ts")];
        let SubmissionOutcome::Rejected(rejection) = tracker.check_submission(&actions, &store)
        else {
            panic!("expected rejection");
        };
        assert_eq!(rejection.missing_paths, vec!["b.ts".to_string()]);
        assert_eq!(rejection.error_code, "NEED_READ_FILES");
    }

    #[test]
    fn brand_new_paths_never_require_a_read() {
        let store = MemoryFileStore::new();
        let tracker = ReadSetTracker::default();
        let actions = [file_action(1, "fresh.ts")];
        assert!(tracker.check_submission(&actions, &store).is_accepted());
    }

    #[test]
    fn exempt_paths_are_skipped() {
        let store = MemoryFileStore::new();
        store.insert("docs/generated/api.md", "old");
        store.insert("asset-manifest.json", "{}");

        let tracker = ReadSetTracker::default();
        let actions = [
            file_action(1, "docs/generated/api.md"),
            file_action(2, "asset-manifest.json"),
        ];
        assert!(tracker.check_submission(&actions, &store).is_accepted());
    }

    #[test]
    fn custom_exemption_predicate_is_honored() {
        let store = MemoryFileStore::new();
        store.insert("CHANGELOG.md", "…");

        let config = ReadSetConfig {
            exempt: Arc::new(|path: &str| path.ends_with(".md")),
        };
        let tracker = ReadSetTracker::new(config);
        let actions = [file_action(1, "CHANGELOG.md")];
        assert!(tracker.check_submission(&actions, &store).is_accepted());
    }

    #[test]
    fn shell_actions_are_not_gated() {
        let store = MemoryFileStore::new();
        let tracker = ReadSetTracker::default();
        assert!(
            tracker
                .check_submission(&[shell_action(1)], &store)
                .is_accepted()
        );
    }

    #[test]
    fn missing_paths_are_sorted_and_deduplicated() {
        let store = MemoryFileStore::new();
        for path in ["z.ts", "a.ts", "m.ts"] {
            store.insert(path, "x");
        }
        let tracker = ReadSetTracker::default();
        let actions = [
            file_action(1, "z.ts"),
            file_action(2, "a.ts"),
            file_action(3, "z.ts"),
            file_action(4, "m.ts"),
        ];
        let SubmissionOutcome::Rejected(rejection) = tracker.check_submission(&actions, &store)
        else {
            panic!("expected rejection");
        };
        assert_eq!(rejection.missing_paths, vec!["a.ts", "m.ts", "z.ts"]);
    }

    #[test]
    fn rejection_payload_serializes_to_the_wire_shape() {
        let rejection = SubmissionRejection::need_read_files(vec!["b.ts".to_string()]);
        let json = serde_json::to_value(&rejection).expect("serialize");
        assert_eq!(
            json,
            serde_json::json!({
                "errorCode": "NEED_READ_FILES",
                "missingPaths": ["b.ts"],
                "remediation": { "action": "read-then-resubmit" },
            })
        );
    }
}
