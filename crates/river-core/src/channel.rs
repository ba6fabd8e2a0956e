// Readable/Writable primitives surfaced to handlers and callers.
//
// A Readable is a single-consumer queue of results. The consumer handle is
// owned — move semantics make a second consumer unrepresentable, which is
// this crate's rendition of the one-shot lock contract. The feed half lives
// inside the session task and enforces at-most-once terminal errors.
//
// A Writable funnels writes into the owning session task. Close is
// idempotent; writes after close error; writes after an abort are dropped
// silently on the aborting side.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use river_protocol::{ErrorPayload, error_codes};
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::error::WriteError;

/// One delivered item: a payload value or a terminal error.
pub type StreamItem = Result<Value, ErrorPayload>;

// ---------------------------------------------------------------------------
// Readable
// ---------------------------------------------------------------------------

/// Consumer half of a stream's inbound queue.
///
/// Yields values in feed order. An `Err` item is terminal: nothing follows
/// it. After [`Readable::break_now`], the next read yields a single
/// `STREAM_BROKEN` error and subsequent reads report end-of-stream.
#[derive(Debug)]
pub struct Readable {
    rx: mpsc::UnboundedReceiver<StreamItem>,
    /// Set once a terminal error has been yielded; everything after is EOS.
    terminated: bool,
    /// Set by `break_now`; the pending break error is yielded exactly once.
    broken: bool,
    broken_reported: bool,
}

impl Readable {
    /// Next item, or `None` at end-of-stream. Values queued before the
    /// writer closed drain in order before `None` is reported.
    pub async fn next(&mut self) -> Option<StreamItem> {
        if self.terminated {
            return None;
        }
        if self.broken {
            if self.broken_reported {
                return None;
            }
            self.broken_reported = true;
            return Some(Err(ErrorPayload::new(
                error_codes::STREAM_BROKEN,
                "reader break",
            )));
        }
        match self.rx.recv().await {
            Some(Err(e)) => {
                self.terminated = true;
                Some(Err(e))
            }
            other => other,
        }
    }

    /// Drain the stream to completion, collecting every item.
    pub async fn collect(mut self) -> Vec<StreamItem> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item);
        }
        items
    }

    /// Reader-side poison: discard everything queued; the next read yields
    /// a `STREAM_BROKEN` error, then end-of-stream.
    pub fn break_now(&mut self) {
        if self.terminated || self.broken {
            return;
        }
        self.broken = true;
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }
}

/// Feed half of a [`Readable`], owned by the session task.
///
/// At most one terminal error crosses the pair; pushes after a terminal
/// are dropped.
#[derive(Debug)]
pub struct ReadableFeed {
    tx: Option<mpsc::UnboundedSender<StreamItem>>,
    errored: bool,
}

impl ReadableFeed {
    pub fn push(&mut self, value: Value) {
        if self.errored {
            return;
        }
        if let Some(tx) = &self.tx {
            let _ = tx.send(Ok(value));
        }
    }

    /// Terminal error: delivered once, then the feed is closed.
    pub fn error(&mut self, error: ErrorPayload) {
        if self.errored {
            return;
        }
        self.errored = true;
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(error));
        }
    }

    /// Writer close: queued values still drain, then end-of-stream.
    pub fn close(&mut self) {
        self.tx = None;
    }

    #[must_use]
    pub fn is_errored(&self) -> bool {
        self.errored
    }
}

/// A linked feed/readable pair.
#[must_use]
pub fn readable_pair() -> (ReadableFeed, Readable) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ReadableFeed {
            tx: Some(tx),
            errored: false,
        },
        Readable {
            rx,
            terminated: false,
            broken: false,
            broken_reported: false,
        },
    )
}

// ---------------------------------------------------------------------------
// Writable
// ---------------------------------------------------------------------------

/// Commands funneled from writers and handler completions into the session
/// task that owns the wire.
#[derive(Debug)]
pub enum StreamOut {
    /// A payload write on an open stream.
    Data { stream_id: String, value: Value },
    /// Local half-close.
    Close { stream_id: String },
    /// rpc/upload completion: single framed result, then close.
    Result {
        stream_id: String,
        result: Result<Value, ErrorPayload>,
    },
    /// Abortive close, from `cancel`/`uncaught`/a client abort handle.
    Cancel {
        stream_id: String,
        error: ErrorPayload,
    },
}

/// State shared between a [`Writable`] and its session-side control.
#[derive(Debug)]
struct WritableShared {
    /// Local `close()` called; further writes error.
    closed: AtomicBool,
    /// Stream aborted; further writes are dropped silently.
    aborted: AtomicBool,
}

/// Producer half of a stream's outbound path.
#[derive(Debug)]
pub struct Writable {
    stream_id: String,
    out: mpsc::UnboundedSender<StreamOut>,
    shared: Arc<WritableShared>,
    close_requested: watch::Receiver<bool>,
}

impl Writable {
    /// Queue one value for the peer. Ordering follows `write()` invocation
    /// order, subject only to session replay discipline.
    pub fn write(&self, value: Value) -> Result<(), WriteError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(WriteError::Closed);
        }
        if self.shared.aborted.load(Ordering::Acquire) {
            // Writes after abort are dropped without error propagation.
            return Ok(());
        }
        let _ = self.out.send(StreamOut::Data {
            stream_id: self.stream_id.clone(),
            value,
        });
        Ok(())
    }

    /// Half-close this side. Idempotent.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.shared.aborted.load(Ordering::Acquire) {
            return;
        }
        let _ = self.out.send(StreamOut::Close {
            stream_id: self.stream_id.clone(),
        });
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        !self.shared.closed.load(Ordering::Acquire) && !self.shared.aborted.load(Ordering::Acquire)
    }

    /// True once the peer's reader has requested close.
    #[must_use]
    pub fn is_close_requested(&self) -> bool {
        *self.close_requested.borrow()
    }

    /// Resolves when the peer's reader requests close (or the stream ends).
    /// A producer loop can select on this and stop early.
    pub async fn close_requested(&mut self) {
        if *self.close_requested.borrow() {
            return;
        }
        // An error means the control side is gone, which also ends the stream.
        let _ = self.close_requested.wait_for(|requested| *requested).await;
    }
}

/// Session-side control over a [`Writable`].
#[derive(Debug)]
pub struct WritableControl {
    shared: Arc<WritableShared>,
    close_request_tx: watch::Sender<bool>,
}

impl WritableControl {
    /// Mark the stream aborted: subsequent writes drop silently.
    pub fn abort(&self) {
        self.shared.aborted.store(true, Ordering::Release);
    }

    /// Relay the peer reader's close request to the producer.
    pub fn request_close(&self) {
        let _ = self.close_request_tx.send(true);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

/// A linked writable/control pair funneling into `out`.
#[must_use]
pub fn writable_pair(
    stream_id: &str,
    out: mpsc::UnboundedSender<StreamOut>,
) -> (Writable, WritableControl) {
    let shared = Arc::new(WritableShared {
        closed: AtomicBool::new(false),
        aborted: AtomicBool::new(false),
    });
    let (close_request_tx, close_request_rx) = watch::channel(false);
    (
        Writable {
            stream_id: stream_id.to_owned(),
            out,
            shared: Arc::clone(&shared),
            close_requested: close_request_rx,
        },
        WritableControl {
            shared,
            close_request_tx,
        },
    )
}
