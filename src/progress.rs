//! Progress stream protocol and sinks.
//!
//! A deployment reports progress as text lines. Plain lines are for humans;
//! lines starting with a `[SELFHOSTED::…]` marker carry control information
//! (PTY session lifecycle, raw terminal output, and the final outcome).

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A PTY session started; followed by the session id.
pub const PTY_SESSION_MARKER: &str = "[SELFHOSTED::PTY_SESSION]";
/// Raw terminal output; followed by base64 bytes.
pub const PTY_OUTPUT_MARKER: &str = "[SELFHOSTED::PTY]";
/// A PTY session closed; followed by the session id.
pub const PTY_END_MARKER: &str = "[SELFHOSTED::PTY_END]";
/// The deployment succeeded.
pub const DONE_MARKER: &str = "[SELFHOSTED::DONE]";
/// The deployment failed; followed by the message.
pub const ERROR_MARKER: &str = "[SELFHOSTED::ERROR]";

const KEEPALIVE_LINE: &str = ": keep-alive";

/// Receives progress lines from a deployment.
pub trait ProgressSink: Send + Sync {
    /// Delivers one line. Sinks never fail; delivery problems are theirs to
    /// handle.
    fn line(&self, line: &str);
}

impl<S: ProgressSink + ?Sized> ProgressSink for Arc<S> {
    fn line(&self, line: &str) {
        (**self).line(line);
    }
}

/// Formats the session-start control line.
#[must_use]
pub fn pty_session_line(session_id: &str) -> String {
    format!("{PTY_SESSION_MARKER} {session_id}")
}

/// Formats a terminal output chunk.
#[must_use]
pub fn pty_output_line(chunk: &[u8]) -> String {
    format!("{PTY_OUTPUT_MARKER} {}", STANDARD.encode(chunk))
}

/// Formats the session-end control line.
#[must_use]
pub fn pty_end_line(session_id: &str) -> String {
    format!("{PTY_END_MARKER} {session_id}")
}

/// Formats the failure line, folding the message onto one line.
#[must_use]
pub fn error_line(message: &str) -> String {
    let flat: Vec<&str> = message.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    format!("{ERROR_MARKER} {}", flat.join(" "))
}

/// Writes progress to a long-lived connection.
///
/// Deployment lines and keep-alives share one mutex so they never interleave.
/// The first write error disables the writer for good; the deployment itself
/// carries on.
#[derive(Debug)]
pub struct StreamWriter<W> {
    inner: Mutex<W>,
    disabled: AtomicBool,
}

impl<W: Write + Send> StreamWriter<W> {
    /// Wraps `writer`.
    pub const fn new(writer: W) -> Self {
        Self {
            inner: Mutex::new(writer),
            disabled: AtomicBool::new(false),
        }
    }

    /// Whether a write has failed.
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    fn write_lines(&self, text: &str) {
        if self.is_disabled() {
            return;
        }
        let Ok(mut writer) = self.inner.lock() else {
            self.disabled.store(true, Ordering::Release);
            return;
        };
        let mut framed = String::with_capacity(text.len() + 1);
        for line in text.trim_end_matches('\n').split('\n') {
            framed.push_str(line);
            framed.push('\n');
        }
        let result = writer
            .write_all(framed.as_bytes())
            .and_then(|()| writer.flush());
        if let Err(err) = result {
            warn!(error = %err, "progress stream closed; suppressing further output");
            self.disabled.store(true, Ordering::Release);
        }
    }

    /// Writes a keep-alive comment line.
    pub fn keepalive(&self) {
        self.write_lines(KEEPALIVE_LINE);
    }

    /// Consumes the writer and returns the wrapped connection.
    pub fn into_inner(self) -> W {
        self.inner
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<W: Write + Send + 'static> StreamWriter<W> {
    /// Emits a keep-alive every `interval` until the returned guard drops or
    /// the writer is disabled.
    pub fn spawn_keepalive(self: &Arc<Self>, interval: Duration) -> KeepAlive {
        let writer = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if writer.is_disabled() {
                    break;
                }
                writer.keepalive();
            }
        });
        KeepAlive { task }
    }
}

impl<W: Write + Send> ProgressSink for StreamWriter<W> {
    fn line(&self, line: &str) {
        self.write_lines(line);
    }
}

/// Stops the keep-alive task when dropped.
#[derive(Debug)]
pub struct KeepAlive {
    task: JoinHandle<()>,
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Forwards lines over a channel; a closed receiver silently drops lines.
#[derive(Clone, Debug)]
pub struct ChannelSink {
    sender: UnboundedSender<String>,
}

impl ChannelSink {
    /// Wraps `sender`.
    #[must_use]
    pub const fn new(sender: UnboundedSender<String>) -> Self {
        Self { sender }
    }
}

impl ProgressSink for ChannelSink {
    fn line(&self, line: &str) {
        if self.sender.send(line.to_owned()).is_err() {
            tracing::debug!("progress receiver dropped");
        }
    }
}

/// Logs progress lines through `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn line(&self, line: &str) {
        info!(target: "selfhosted::progress", "{line}");
    }
}
