//! Automation of interactive installers running in a remote terminal.
//!
//! A session streams the terminal's raw bytes to every configured
//! [`OutputSink`] and keeps the most recent output in a rolling buffer. An
//! optional background task walks the step's auto-answers, waiting for each
//! prompt to appear in the ANSI-stripped buffer before typing the answer.
//! Operators can type into the same session at any time through the
//! [`SessionRegistry`].

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::installer::TtyAutoAnswer;
use crate::progress::{ProgressSink, pty_end_line, pty_output_line, pty_session_line};
use crate::remote::{RemoteError, RemoteShell};
use crate::template::TemplateContext;

pub mod registry;

pub use registry::{KeystrokeRequest, SessionRegistry, global, inject_keystrokes};

/// Bytes kept for prompt matching.
pub const BUFFER_CAPACITY: usize = 64 * 1024;
/// Size of each read from the terminal.
pub const CHUNK_SIZE: usize = 4096;
/// Fallback polling interval while waiting for a prompt.
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Errors raised by PTY sessions and the session registry.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PtyError {
    /// No session is registered under the id.
    #[error("unknown session '{0}'")]
    UnknownSession(String),
    /// Writing to a session's input failed.
    #[error("failed to write to terminal: {0}")]
    Write(String),
    /// Keystrokes were not valid base64.
    #[error("invalid keystroke payload: {0}")]
    InvalidKeystrokes(String),
    /// The remote terminal could not be opened.
    #[error("failed to open terminal: {0}")]
    Open(#[source] RemoteError),
    /// Reading terminal output failed.
    #[error("failed to read terminal output: {0}")]
    Read(String),
    /// The remote program could not be awaited.
    #[error("terminal session failed: {0}")]
    Exit(#[source] RemoteError),
}

/// Receives raw terminal output.
pub trait OutputSink: Send + Sync {
    /// Handles one chunk of output from `session_id`.
    fn chunk(&self, session_id: &str, bytes: &[u8]);
}

/// Forwards terminal output to a progress stream as base64 control lines.
#[derive(Clone)]
pub struct ProgressOutput {
    progress: Arc<dyn ProgressSink>,
}

impl ProgressOutput {
    /// Wraps `progress`.
    #[must_use]
    pub fn new(progress: Arc<dyn ProgressSink>) -> Self {
        Self { progress }
    }
}

impl OutputSink for ProgressOutput {
    fn chunk(&self, _session_id: &str, bytes: &[u8]) {
        self.progress.line(&pty_output_line(bytes));
    }
}

/// Mirrors readable terminal output into the debug log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogMirror;

impl OutputSink for LogMirror {
    fn chunk(&self, session_id: &str, bytes: &[u8]) {
        let text = strip_ansi(bytes);
        if !text.trim().is_empty() {
            debug!(target: "selfhosted::pty", session = session_id, "{}", text.trim_end());
        }
    }
}

/// Removes escape sequences and every control character except newlines.
#[must_use]
pub fn strip_ansi(bytes: &[u8]) -> String {
    let plain = strip_ansi_escapes::strip(bytes);
    String::from_utf8_lossy(&plain)
        .chars()
        .filter(|ch| !ch.is_control() || *ch == '\n')
        .collect()
}

/// Converts a rendered answer into the keystrokes sent to the terminal.
///
/// `true` and `false` become `y` and `n`; a carriage return is appended unless
/// the value already carries a line break.
#[must_use]
pub fn answer_keystrokes(rendered: &str) -> String {
    let mut keys = match rendered {
        "true" => String::from("y"),
        "false" => String::from("n"),
        other => other.to_owned(),
    };
    if !keys.contains(['\n', '\r']) {
        keys.push('\r');
    }
    keys
}

/// How an answer recognises its prompt.
#[derive(Clone, Debug)]
pub enum Prompt {
    /// Plain substring.
    Text(String),
    /// Regular expression.
    Pattern(Regex),
}

impl Prompt {
    fn is_match(&self, haystack: &str) -> bool {
        match self {
            Self::Text(text) => haystack.contains(text.as_str()),
            Self::Pattern(regex) => regex.is_match(haystack),
        }
    }
}

/// Rolling window over the most recent terminal output.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    bytes: Mutex<Vec<u8>>,
    notify: Notify,
}

impl OutputBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk`, dropping the oldest bytes beyond the capacity, and
    /// wakes a waiting matcher.
    pub fn append(&self, chunk: &[u8]) {
        {
            let mut bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
            bytes.extend_from_slice(chunk);
            let excess = bytes.len().saturating_sub(BUFFER_CAPACITY);
            if excess > 0 {
                bytes.drain(..excess);
            }
        }
        self.notify.notify_one();
    }

    /// Returns the buffered output with escape sequences removed.
    #[must_use]
    pub fn stripped(&self) -> String {
        let bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        strip_ansi(&bytes)
    }

    /// Number of raw bytes held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing has been buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits until `prompt` appears or `limit` elapses. Returns whether the
    /// prompt was seen.
    pub async fn wait_for(&self, prompt: &Prompt, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if prompt.is_match(&self.stripped()) {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            tokio::select! {
                () = self.notify.notified() => {}
                () = sleep(remaining.min(POLL_INTERVAL)) => {}
            }
        }
    }
}

enum Gate {
    Prompt(Prompt),
    Delay,
    Immediate,
}

fn gate_for(answer: &TtyAutoAnswer) -> Gate {
    let Some(wait_for) = answer.wait_for.as_deref().filter(|w| !w.is_empty()) else {
        return Gate::Delay;
    };
    if !answer.is_regex {
        return Gate::Prompt(Prompt::Text(wait_for.to_owned()));
    }
    match Regex::new(wait_for) {
        Ok(regex) => Gate::Prompt(Prompt::Pattern(regex)),
        Err(err) => {
            warn!(pattern = wait_for, error = %err, "invalid prompt pattern; answering immediately");
            Gate::Immediate
        }
    }
}

async fn answer_sequence(
    registry: Arc<SessionRegistry>,
    session_id: String,
    buffer: Arc<OutputBuffer>,
    answers: Vec<TtyAutoAnswer>,
    vars: TemplateContext,
) {
    for (index, answer) in answers.iter().enumerate() {
        match gate_for(answer) {
            Gate::Prompt(prompt) => {
                if !buffer.wait_for(&prompt, answer.timeout).await {
                    warn!(
                        session = %session_id,
                        answer = index,
                        "prompt not seen before timeout; answering anyway"
                    );
                }
            }
            Gate::Delay => sleep(answer.delay).await,
            Gate::Immediate => {}
        }
        let keys = answer_keystrokes(&vars.render(&answer.value));
        if let Err(err) = registry.write(&session_id, keys.as_bytes()).await {
            warn!(session = %session_id, error = %err, "stopping auto-answers");
            return;
        }
        debug!(session = %session_id, answer = index, "sent auto-answer");
    }
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Deregisters a session and announces its end exactly once, even when the
/// session future is dropped midway.
struct SessionGuard {
    registry: Arc<SessionRegistry>,
    progress: Arc<dyn ProgressSink>,
    id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
        self.progress.line(&pty_end_line(&self.id));
    }
}

async fn pump<R>(
    mut reader: R,
    session_id: &str,
    buffer: &OutputBuffer,
    sinks: &[Arc<dyn OutputSink>],
) -> Result<(), PtyError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0_u8; CHUNK_SIZE];
    loop {
        let read = reader
            .read(&mut chunk)
            .await
            .map_err(|err| PtyError::Read(err.to_string()))?;
        let Some(bytes) = chunk.get(..read).filter(|bytes| !bytes.is_empty()) else {
            return Ok(());
        };
        buffer.append(bytes);
        for sink in sinks {
            sink.chunk(session_id, bytes);
        }
    }
}

/// Runs terminal sessions for interactive steps.
#[derive(Clone)]
pub struct PtyAutomation {
    registry: Arc<SessionRegistry>,
    progress: Arc<dyn ProgressSink>,
    sinks: Vec<Arc<dyn OutputSink>>,
}

impl std::fmt::Debug for PtyAutomation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyAutomation")
            .field("registry", &self.registry)
            .field("sinks", &self.sinks.len())
            .finish_non_exhaustive()
    }
}

impl PtyAutomation {
    /// Creates automation that streams output to `progress` and the debug log.
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>, progress: Arc<dyn ProgressSink>) -> Self {
        let sinks: Vec<Arc<dyn OutputSink>> = vec![
            Arc::new(ProgressOutput::new(Arc::clone(&progress))),
            Arc::new(LogMirror),
        ];
        Self {
            registry,
            progress,
            sinks,
        }
    }

    /// Adds another output sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Runs `command` in a remote terminal until it exits and returns its exit
    /// code.
    ///
    /// The session is registered before any automation starts and is removed
    /// when the command ends, whatever the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`PtyError`] when the terminal cannot be opened, read, or
    /// awaited.
    pub async fn run(
        &self,
        shell: &dyn RemoteShell,
        command: &str,
        answers: &[TtyAutoAnswer],
        vars: &TemplateContext,
    ) -> Result<Option<i32>, PtyError> {
        let child = shell.open_pty(command).await.map_err(PtyError::Open)?;
        let session_id = Uuid::new_v4().to_string();

        self.registry.register(&session_id, child.stdin);
        let guard = SessionGuard {
            registry: Arc::clone(&self.registry),
            progress: Arc::clone(&self.progress),
            id: session_id.clone(),
        };
        self.progress.line(&pty_session_line(&session_id));

        let buffer = Arc::new(OutputBuffer::new());
        let answering = (!answers.is_empty()).then(|| {
            AbortOnDrop(tokio::spawn(answer_sequence(
                Arc::clone(&self.registry),
                session_id.clone(),
                Arc::clone(&buffer),
                answers.to_vec(),
                vars.clone(),
            )))
        });

        let (stdout, stderr, exit) = tokio::join!(
            pump(child.stdout, &session_id, &buffer, &self.sinks),
            pump(child.stderr, &session_id, &buffer, &self.sinks),
            child.exit,
        );

        drop(answering);
        self.registry.close(&session_id).await;
        drop(guard);

        stdout?;
        stderr?;
        let code = exit.map_err(PtyError::Exit)?;
        debug!(session = %session_id, ?code, "terminal session ended");
        Ok(code)
    }
}
