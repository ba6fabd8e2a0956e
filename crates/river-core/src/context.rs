// Per-invocation handler context and the at-most-once cancellation token.

use std::any::Any;
use std::sync::Arc;

use river_protocol::{ErrorPayload, error_codes};
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::channel::StreamOut;

/// Cancellation signal for one stream. Fires at most once; subscribers that
/// arrive after the fire observe the aborted state immediately.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: watch::Sender<Option<ErrorPayload>>,
    rx: watch::Receiver<Option<ErrorPayload>>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(None);
        CancelToken { tx, rx }
    }

    /// Fire the token. Only the first call takes effect.
    pub fn fire(&self, error: ErrorPayload) {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(error);
            true
        });
    }

    #[must_use]
    pub fn is_fired(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// The abort reason, if fired.
    #[must_use]
    pub fn reason(&self) -> Option<ErrorPayload> {
        self.rx.borrow().clone()
    }

    /// Resolves with the abort reason once the token fires.
    pub async fn fired(&self) -> ErrorPayload {
        let mut rx = self.rx.clone();
        // wait_for checks the current value first, so late subscribers on an
        // already-fired token resolve immediately.
        match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone().unwrap_or_else(|| {
                ErrorPayload::new(error_codes::CANCEL, "stream aborted")
            }),
            // Sender gone means the session is gone.
            Err(_) => ErrorPayload::new(error_codes::UNEXPECTED_DISCONNECT, "session closed"),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Handler-facing context for one procedure invocation.
#[derive(Clone)]
pub struct Ctx {
    /// Peer id of the caller.
    pub from: String,
    /// The session this invocation belongs to (local session id).
    pub session_id: String,
    /// The stream id scoping this invocation.
    pub stream_id: String,
    /// Validated handshake metadata for the calling session.
    pub metadata: Value,
    state: Arc<dyn Any + Send + Sync>,
    token: CancelToken,
    out: mpsc::UnboundedSender<StreamOut>,
}

impl Ctx {
    pub(crate) fn new(
        from: &str,
        session_id: &str,
        stream_id: &str,
        metadata: Value,
        state: Arc<dyn Any + Send + Sync>,
        token: CancelToken,
        out: mpsc::UnboundedSender<StreamOut>,
    ) -> Self {
        Ctx {
            from: from.to_owned(),
            session_id: session_id.to_owned(),
            stream_id: stream_id.to_owned(),
            metadata,
            state,
            token,
            out,
        }
    }

    /// Typed access to the service state registered with the service
    /// definition. `None` when the requested type does not match.
    #[must_use]
    pub fn state<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.state).downcast::<T>().ok()
    }

    /// The cancellation signal for this stream. Handlers register cleanup on
    /// it; the framework enforces termination regardless.
    #[must_use]
    pub fn cancellation(&self) -> CancelToken {
        self.token.clone()
    }

    /// Abort the stream with a `CANCEL` error. Both sides observe exactly
    /// one terminal error result; cancel after cancel is a no-op.
    pub fn cancel(&self, reason: &str) {
        let _ = self.out.send(StreamOut::Cancel {
            stream_id: self.stream_id.clone(),
            error: ErrorPayload::new(error_codes::CANCEL, reason),
        });
    }

    /// Abort the stream with an `UNCAUGHT_ERROR` carrying the error's
    /// message. Used by the dispatcher for handler failures and available
    /// to handler code directly.
    pub fn uncaught(&self, message: &str) {
        let _ = self.out.send(StreamOut::Cancel {
            stream_id: self.stream_id.clone(),
            error: ErrorPayload::new(error_codes::UNCAUGHT_ERROR, message),
        });
    }
}

impl std::fmt::Debug for Ctx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ctx")
            .field("from", &self.from)
            .field("session_id", &self.session_id)
            .field("stream_id", &self.stream_id)
            .finish_non_exhaustive()
    }
}
