//! Shell session coordination.
//!
//! One remote process channel per session, at most one active command
//! at any instant. Issuing a new command while one is running is the
//! documented cancellation path: the running command's abort handle is
//! signalled synchronously, the generation counter advances, and any
//! late result from the superseded command is discarded rather than
//! surfaced.

pub mod channel;
pub mod sanitize;
pub mod sentinel;

use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ShellError;
use channel::{AbortHandle, ExecChannel};
use sentinel::{EXIT_NAME, SentinelDecoder, SentinelToken};

/// A buffer shrink smaller than this is attributed to a redraw rather
/// than a screen clear.
const SCREEN_CLEAR_SLACK: usize = 64;

/// Lifecycle of a session's command slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Running,
    Aborted,
}

/// Exit status decoded from the completion sentinel. `Unknown` is the
/// explicit incomplete marker used when the stream ended (or a custom
/// checkpoint concluded the wait) before an exit sentinel was seen;
/// callers must not conflate it with success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    Code(i32),
    Unknown,
}

impl ExitStatus {
    #[must_use]
    pub fn success(self) -> bool {
        self == Self::Code(0)
    }
}

/// Outcome of one completed (not aborted) command.
///
/// `output` is the raw concatenation of the stream's text runs, with
/// sentinels removed but terminal noise intact; run it through
/// [`sanitize::sanitize`] before presenting it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub output: String,
    pub exit: ExitStatus,
}

struct Inner {
    channel: Box<dyn ExecChannel>,
    /// Last observed output length, for screen-clear detection.
    checkpoint: usize,
}

/// Serializes command execution against one remote process channel.
pub struct ShellCoordinator {
    session_id: Uuid,
    inner: AsyncMutex<Inner>,
    abort: AbortHandle,
    /// Incremented on every dispatch; results are surfaced only when
    /// their generation is still current.
    generation: AtomicU64,
    cancel: StdMutex<CancellationToken>,
    state: StdMutex<SessionState>,
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ShellCoordinator {
    #[must_use]
    pub fn new(channel: Box<dyn ExecChannel>) -> Self {
        let abort = channel.abort_handle();
        Self {
            session_id: Uuid::new_v4(),
            inner: AsyncMutex::new(Inner {
                channel,
                checkpoint: 0,
            }),
            abort,
            generation: AtomicU64::new(0),
            cancel: StdMutex::new(CancellationToken::new()),
            state: StdMutex::new(SessionState::Idle),
        }
    }

    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Execute `command`, waiting for its exit sentinel.
    ///
    /// `Ok(None)` means the command was superseded by a newer
    /// `execute` call before it completed; its partial output is
    /// discarded, which is the documented cancel-and-replace contract.
    pub async fn execute(&self, command: &str) -> Result<Option<CommandResult>, ShellError> {
        self.execute_until(command, None).await
    }

    /// Execute `command`, concluding at the exit sentinel or at a
    /// caller-named checkpoint sentinel (e.g. `"ready"`), whichever
    /// comes first. When the checkpoint wins, the exit status is
    /// [`ExitStatus::Unknown`].
    pub async fn execute_until(
        &self,
        command: &str,
        checkpoint: Option<&str>,
    ) -> Result<Option<CommandResult>, ShellError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        // Abort the running command, if any, strictly before this one
        // touches the channel.
        let previous = {
            let mut guard = lock(&self.cancel);
            std::mem::replace(&mut *guard, CancellationToken::new())
        };
        if self.state() == SessionState::Running {
            tracing::debug!(session = %self.session_id, "aborting active command");
            self.abort.signal();
            *lock(&self.state) = SessionState::Aborted;
        }
        previous.cancel();
        let token = lock(&self.cancel).clone();

        let mut inner = self.inner.lock().await;
        // Output already buffered at this point belongs to whatever ran
        // before; it is not part of this command.
        drain_stale(&mut inner).await;

        *lock(&self.state) = SessionState::Running;
        tracing::debug!(session = %self.session_id, %command, "dispatching command");
        inner.channel.write(command.as_bytes()).await?;
        inner.channel.write(b"\n").await?;

        let result = self.wait(&mut inner, &token, checkpoint).await?;
        drop(inner);

        if self.generation.load(Ordering::SeqCst) != generation {
            // Superseded while (or right after) completing.
            return Ok(None);
        }
        if result.is_some() {
            *lock(&self.state) = SessionState::Idle;
        }
        Ok(result)
    }

    /// Read from the channel until the exit sentinel, the wanted
    /// checkpoint sentinel, end of stream, or cancellation.
    async fn wait(
        &self,
        inner: &mut Inner,
        token: &CancellationToken,
        wanted: Option<&str>,
    ) -> Result<Option<CommandResult>, ShellError> {
        let mut decoder = SentinelDecoder::new();
        let mut output = String::new();

        loop {
            let len = inner.channel.output_len();
            if inner.checkpoint > len + SCREEN_CLEAR_SLACK {
                // The remote terminal buffer shrank out from under us:
                // a screen clear, not an error.
                tracing::debug!(
                    session = %self.session_id,
                    was = inner.checkpoint,
                    now = len,
                    "output buffer shrank; resetting checkpoint"
                );
            }
            inner.checkpoint = len;

            let chunk = tokio::select! {
                () = token.cancelled() => return Ok(None),
                chunk = inner.channel.read() => chunk?,
            };
            let Some(chunk) = chunk else {
                if let Some(SentinelToken::Incomplete(raw)) = decoder.finish() {
                    tracing::debug!(bytes = raw.len(), "partial sentinel at end of stream");
                }
                return Ok(Some(CommandResult {
                    output,
                    exit: ExitStatus::Unknown,
                }));
            };

            for item in decoder.feed(&chunk) {
                match item {
                    SentinelToken::Text(text) => output.push_str(&text),
                    SentinelToken::Sentinel { name, value, .. } if name == EXIT_NAME => {
                        let exit = value
                            .and_then(|v| i32::try_from(v).ok())
                            .map_or(ExitStatus::Unknown, ExitStatus::Code);
                        return Ok(Some(CommandResult {
                            output,
                            exit,
                        }));
                    }
                    SentinelToken::Sentinel { name, .. }
                        if wanted.is_some_and(|w| w == name) =>
                    {
                        return Ok(Some(CommandResult {
                            output,
                            exit: ExitStatus::Unknown,
                        }));
                    }
                    // Unrelated checkpoint sentinels are invisible to
                    // the displayed output.
                    SentinelToken::Sentinel { .. } | SentinelToken::Incomplete(_) => {}
                }
            }
        }
    }
}

/// Discard output increments that are already buffered; they predate
/// the command about to be dispatched.
async fn drain_stale(inner: &mut Inner) {
    loop {
        match inner.channel.read().now_or_never() {
            Some(Ok(Some(_stale))) => continue,
            _ => break,
        }
    }
}
