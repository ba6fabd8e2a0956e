// Transport seam: a framed duplex byte channel keyed by peer id.
//
// The transport owns physical (re)connection; the session layer owns
// everything above it. No cross-connection ordering or delivery is assumed
// here — reordering and replay recovery is the session's job.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Events a transport emits toward the session layer. Delivered through the
/// [`TransportEvents`] receiver handed out alongside the transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// A connection to `peer` is up (initial connect or reconnect).
    Connected { peer: String },
    /// The connection to `peer` dropped. In-flight frames may be lost.
    Disconnected { peer: String },
    /// One whole frame arrived from `peer`. Boundaries are preserved
    /// end-to-end.
    Frame { peer: String, bytes: Vec<u8> },
}

/// Receiver half for transport events; single-consumer, owned by the
/// session layer's event loop.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// A framed duplex byte channel keyed by peer id.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one frame to `peer`. Fails when no connection to that peer is
    /// currently up; the caller decides whether to buffer and retry.
    async fn send(&self, peer: &str, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Drop the connection to `peer`, if any. The transport emits a
    /// `Disconnected` event for it.
    async fn close(&self, peer: &str);
}
