// Observable protocol events, published on a broadcast bus.
//
// Subscribers are optional: sends ignore a lagging or absent audience.

use tokio::sync::broadcast;

/// Protocol error kinds observable on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// A frame could not be encoded; the message was dropped (and, if
    /// sequenced, remains buffered for replay).
    MessageSendFailure,
    /// A handshake was rejected (version mismatch, metadata validation
    /// failure, or handshake encode failure).
    HandshakeFailed,
    /// The peer violated a protocol invariant (seq gap, ack regression).
    /// The session is torn down.
    InvariantViolation,
}

/// Session lifecycle states, as published in transition events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStateKind {
    NoConnection,
    Handshaking,
    Connected,
    PendingReconnect,
    Closed,
}

impl std::fmt::Display for SessionStateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionStateKind::NoConnection => "no_connection",
            SessionStateKind::Handshaking => "handshaking",
            SessionStateKind::Connected => "connected",
            SessionStateKind::PendingReconnect => "pending_reconnect",
            SessionStateKind::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Everything observable about a running client or server.
#[derive(Debug, Clone)]
pub enum RiverEvent {
    ProtocolError {
        kind: ProtocolErrorKind,
        message: String,
    },
    SessionTransition {
        session_id: String,
        state: SessionStateKind,
    },
    MessageReceived {
        from: String,
        stream_id: String,
    },
}

/// Shared publisher handle. Cheap to clone; publishing never blocks and
/// never fails (no subscribers is fine).
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RiverEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        EventBus { tx }
    }

    pub fn publish(&self, event: RiverEvent) {
        let _ = self.tx.send(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RiverEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
