//! End-to-end flow: stream model output into a session, hit the read
//! gate, disclose the missing file, resubmit, and apply the accepted
//! actions against an in-memory store and a scripted shell channel.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pretty_assertions::assert_eq;

use actionflow::shell::sentinel;
use actionflow::{
    AbortHandle, ActionEvent, ActionOutcome, ActionTag, ExecChannel, ExitStatus, FileStore,
    MemoryFileStore, Session, SessionConfig, ShellCoordinator, ShellError, SubmissionOutcome,
};

/// Shell channel that replays canned output once a command line has been
/// dispatched.
struct ScriptedShell {
    replies: VecDeque<String>,
    released: bool,
    seen: usize,
    commands: Arc<Mutex<Vec<String>>>,
}

impl ScriptedShell {
    fn new(replies: Vec<String>) -> (Self, Arc<Mutex<Vec<String>>>) {
        let commands = Arc::new(Mutex::new(Vec::new()));
        let shell = Self {
            replies: replies.into(),
            released: false,
            seen: 0,
            commands: Arc::clone(&commands),
        };
        (shell, commands)
    }
}

#[async_trait]
impl ExecChannel for ScriptedShell {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), ShellError> {
        if bytes == b"\n" {
            self.released = true;
        } else {
            self.commands
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(bytes).into_owned());
        }
        Ok(())
    }

    async fn read(&mut self) -> Result<Option<String>, ShellError> {
        if !self.released {
            return Ok(None);
        }
        match self.replies.pop_front() {
            Some(chunk) => {
                self.seen += chunk.len();
                Ok(Some(chunk))
            }
            None => Ok(None),
        }
    }

    fn output_len(&self) -> usize {
        self.seen
    }

    fn abort_handle(&self) -> AbortHandle {
        AbortHandle::noop()
    }
}

fn collect_actions(events: &[ActionEvent]) -> Vec<ActionTag> {
    events
        .iter()
        .filter_map(|event| match event {
            ActionEvent::Close { action, .. } => Some(action.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn gate_rejection_disclosure_and_application() {
    let store = Arc::new(MemoryFileStore::new());
    store.insert("src/app.ts", "const a = 1;\n");

    let (shell, commands) = ScriptedShell::new(vec![
        "12 passing\n".to_string(),
        sentinel::encode(sentinel::EXIT_OPCODE, sentinel::EXIT_NAME, Some(0)),
    ]);
    let mut session = Session::new(
        Arc::clone(&store) as Arc<dyn FileStore>,
        SessionConfig::default(),
    )
    .with_shell(ShellCoordinator::new(Box::new(shell)));

    // The turn arrives split into arbitrary chunks.
    let mut events = Vec::new();
    for chunk in [
        "Bumping the constant.\n<action type=\"modify\" path=\"src/ap",
        "p.ts\"><before>const a = 1;</before><after>const a ",
        "= 2;</after></action><action type=\"shell\">npm te",
        "st</action>",
    ] {
        events.extend(session.ingest(chunk));
    }
    events.extend(session.finish());
    assert_eq!(session.narration(), "Bumping the constant.\n");

    let actions = collect_actions(&events);
    assert_eq!(actions.len(), 2);

    // The modify target exists but was never disclosed.
    let SubmissionOutcome::Rejected(rejection) = session.submit(&actions) else {
        panic!("expected the read gate to reject");
    };
    assert_eq!(rejection.missing_paths, vec!["src/app.ts".to_string()]);
    assert_eq!(rejection.error_code, "NEED_READ_FILES");

    // Read the file, resubmit the identical payload.
    assert_eq!(
        session.disclose("src/app.ts").as_deref(),
        Some("const a = 1;\n")
    );
    assert!(session.submit(&actions).is_accepted());

    // Apply the modify; the session hands back the write for the
    // collaborator to persist.
    let outcome = session.apply(&actions[0]).await.expect("modify applies");
    let ActionOutcome::WriteFile { path, content } = outcome else {
        panic!("expected a write outcome");
    };
    assert_eq!(path, "src/app.ts");
    assert_eq!(content, "const a = 2;\n");
    store.insert(path, content);

    // Apply the shell action.
    let outcome = session.apply(&actions[1]).await.expect("shell runs");
    let ActionOutcome::Command(result) = outcome else {
        panic!("expected a command outcome");
    };
    assert_eq!(result.output, "12 passing\n");
    assert_eq!(result.exit, ExitStatus::Code(0));
    assert_eq!(commands.lock().unwrap().as_slice(), ["npm test"]);

    assert_eq!(
        store.get_contents("src/app.ts").as_deref(),
        Some("const a = 2;\n")
    );
}

#[tokio::test]
async fn brand_new_file_skips_the_gate_entirely() {
    let store = Arc::new(MemoryFileStore::new());
    let mut session = Session::new(
        Arc::clone(&store) as Arc<dyn FileStore>,
        SessionConfig::default(),
    );

    let mut events =
        session.ingest("<action type=\"file\" path=\"src/new.ts\">export const b = 3;\n</action>");
    events.extend(session.finish());
    let actions = collect_actions(&events);
    assert_eq!(actions.len(), 1);
    assert!(session.submit(&actions).is_accepted());

    let outcome = session.apply(&actions[0]).await.expect("file applies");
    let ActionOutcome::WriteFile { path, content } = outcome else {
        panic!("expected a write outcome");
    };
    assert_eq!(path, "src/new.ts");
    assert_eq!(content, "export const b = 3;\n");
}
