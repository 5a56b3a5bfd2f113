//! Process-wide directory of live PTY sessions.
//!
//! Automation and human operators reach an in-flight terminal through the
//! same entry: the session's input handle, looked up by id.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use super::PtyError;
use crate::remote::RemoteWriter;

static GLOBAL: LazyLock<Arc<SessionRegistry>> = LazyLock::new(Arc::default);

/// Returns the registry shared by the whole process.
#[must_use]
pub fn global() -> Arc<SessionRegistry> {
    Arc::clone(&GLOBAL)
}

struct SessionInput {
    writer: Mutex<RemoteWriter>,
}

/// Maps session ids to writable input handles.
///
/// The map lock is never held across I/O: writers clone the entry out, then
/// lock that session's own handle.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionInput>>>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .finish()
    }
}

impl SessionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `writer` under `id`, replacing any previous session.
    pub fn register(&self, id: &str, writer: RemoteWriter) {
        let input = Arc::new(SessionInput {
            writer: Mutex::new(writer),
        });
        let previous = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_owned(), input);
        if previous.is_some() {
            debug!(session = id, "replaced PTY session");
        }
    }

    /// Writes `bytes` to the session's input.
    ///
    /// # Errors
    ///
    /// Returns [`PtyError::UnknownSession`] when `id` is not registered, or
    /// [`PtyError::Write`] when the handle rejects the bytes.
    pub async fn write(&self, id: &str, bytes: &[u8]) -> Result<(), PtyError> {
        let input = self
            .lookup(id)
            .ok_or_else(|| PtyError::UnknownSession(id.to_owned()))?;
        let mut writer = input.writer.lock().await;
        let write_error = |err: std::io::Error| PtyError::Write(err.to_string());
        writer.write_all(bytes).await.map_err(write_error)?;
        writer.flush().await.map_err(write_error)
    }

    /// Shuts the session's input down and removes it. Closing an unknown or
    /// already closed session does nothing.
    pub async fn close(&self, id: &str) {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        let Some(input) = removed else {
            return;
        };
        if let Err(err) = input.writer.lock().await.shutdown().await {
            debug!(session = id, error = %err, "PTY input already closed");
        }
        debug!(session = id, "closed PTY session");
    }

    /// Removes the session without touching its handle. Used from drop
    /// guards, which cannot await.
    pub fn remove(&self, id: &str) -> bool {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some()
    }

    /// Whether `id` is registered.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.lookup(id).is_some()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no session is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, id: &str) -> Option<Arc<SessionInput>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }
}

/// Keystrokes sent by an operator to a running session.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct KeystrokeRequest {
    /// Target session.
    #[serde(rename = "sessionId")]
    pub session_id: String,
    /// Base64-encoded bytes to type.
    #[serde(rename = "dataB64")]
    pub data_b64: String,
}

/// Decodes `request` and writes its bytes to the session.
///
/// # Errors
///
/// Returns [`PtyError::InvalidKeystrokes`] for malformed base64, or the
/// registry's write error.
pub async fn inject_keystrokes(
    registry: &SessionRegistry,
    request: &KeystrokeRequest,
) -> Result<(), PtyError> {
    let bytes = STANDARD
        .decode(request.data_b64.trim())
        .map_err(|err| PtyError::InvalidKeystrokes(err.to_string()))?;
    registry.write(&request.session_id, &bytes).await
}
