//! Execution channel seam and the local PTY adapter.
//!
//! The coordinator only ever talks to a [`ExecChannel`]; in production
//! that is a remote container's process channel, here we ship a local
//! adapter that spawns a shell inside a PTY and arranges for the exit
//! sentinel to be emitted after every command.

use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use async_trait::async_trait;
use portable_pty::{CommandBuilder, PtySize, native_pty_system};
use tokio::sync::mpsc;

use crate::error::ShellError;
use crate::shell::sentinel::EXIT_OPCODE;

/// Cloneable handle that signals abort intent to the process behind a
/// channel. Cooperative: the process may keep running for a while, and
/// any output it produces after the signal is discarded by the
/// coordinator's generation counter.
#[derive(Clone)]
pub struct AbortHandle(Arc<dyn Fn() + Send + Sync>);

impl AbortHandle {
    pub fn new(signal: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(signal))
    }

    /// No-op handle for channels with nothing to kill.
    #[must_use]
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    pub fn signal(&self) {
        (self.0)();
    }
}

impl std::fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortHandle").finish_non_exhaustive()
    }
}

/// One remote process's raw I/O, as the coordinator sees it.
#[async_trait]
pub trait ExecChannel: Send {
    /// Write bytes (a command line, keystrokes) to the process.
    async fn write(&mut self, bytes: &[u8]) -> Result<(), ShellError>;

    /// Next output increment; `None` means end of stream.
    async fn read(&mut self) -> Result<Option<String>, ShellError>;

    /// Total output length observed so far. May shrink abruptly when
    /// the remote terminal buffer is cleared mid-command.
    fn output_len(&self) -> usize;

    fn abort_handle(&self) -> AbortHandle;
}

/// Shell prompt hook that emits the exit sentinel after every command.
fn exit_prompt_command() -> String {
    format!("printf '\\033]{EXIT_OPCODE};exit=%d\\007' \"$?\"")
}

/// Local adapter: a shell in a PTY, with a blocking reader thread
/// feeding output chunks into an async channel.
pub struct PtyExecChannel {
    writer: Box<dyn std::io::Write + Send>,
    output: mpsc::UnboundedReceiver<String>,
    abort: AbortHandle,
    seen: usize,
    // Keep the PTY master and child alive for the channel's lifetime.
    _master: Box<dyn portable_pty::MasterPty + Send>,
    _child: Box<dyn portable_pty::Child + Send + Sync>,
}

impl PtyExecChannel {
    /// Spawn an interactive bash session in `cwd`, configured to emit
    /// the exit sentinel at every prompt.
    pub fn spawn(cwd: &Path) -> anyhow::Result<Self> {
        let mut cmd = CommandBuilder::new("bash");
        cmd.args(["--noprofile", "--norc", "-i"]);
        cmd.cwd(cwd);
        cmd.env("PS1", "");
        cmd.env("PROMPT_COMMAND", exit_prompt_command());
        cmd.env("TERM", "xterm-256color");
        Self::spawn_command(cmd)
    }

    /// Spawn an arbitrary command in a PTY. The command is responsible
    /// for emitting sentinels itself.
    pub fn spawn_command(cmd: CommandBuilder) -> anyhow::Result<Self> {
        let pty = native_pty_system();
        let pair = pty
            .openpty(PtySize {
                rows: 24,
                cols: 120,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to open pty")?;
        let child = pair
            .slave
            .spawn_command(cmd)
            .context("failed to spawn shell in pty")?;
        let reader = pair
            .master
            .try_clone_reader()
            .context("failed to clone pty reader")?;
        let writer = pair
            .master
            .take_writer()
            .context("failed to take pty writer")?;

        let killer = Arc::new(Mutex::new(child.clone_killer()));
        let abort = AbortHandle::new(move || {
            let mut killer = killer.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(err) = killer.kill() {
                tracing::debug!(?err, "pty kill failed");
            }
        });

        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::spawn(move || read_loop(reader, tx));

        Ok(Self {
            writer,
            output: rx,
            abort,
            seen: 0,
            _master: pair.master,
            _child: child,
        })
    }
}

fn read_loop(mut reader: Box<dyn Read + Send>, tx: mpsc::UnboundedSender<String>) {
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                let text = String::from_utf8_lossy(&chunk[..n]).into_owned();
                if tx.send(text).is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

#[async_trait]
impl ExecChannel for PtyExecChannel {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), ShellError> {
        self.writer.write_all(bytes).map_err(ShellError::Write)?;
        self.writer.flush().map_err(ShellError::Write)
    }

    async fn read(&mut self) -> Result<Option<String>, ShellError> {
        match self.output.recv().await {
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
        self.abort.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_command_embeds_the_exit_opcode() {
        let hook = exit_prompt_command();
        assert!(hook.contains("]654;exit="));
        assert!(hook.contains("$?"));
    }

    #[test]
    fn noop_abort_handle_is_callable() {
        AbortHandle::noop().signal();
    }
}
