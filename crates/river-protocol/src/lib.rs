// river-protocol: Wire-level message types and serialization.
//
// All frames use a top-level `kind` field for discriminated deserialization.
// Control-flag bit positions and error-code strings are frozen — they are
// part of the external contract and must not change between releases.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Protocol version carried in every handshake request. Peers with a
/// different version are rejected before a session is established.
pub const PROTOCOL_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Control flags
// ---------------------------------------------------------------------------

/// Bitset of per-message control flags.
///
/// Bit positions are frozen:
///
/// | Flag           | Bit |
/// |----------------|-----|
/// | `STREAM_OPEN`  | 1   |
/// | `STREAM_CLOSED`| 2   |
/// | `STREAM_CANCEL`| 4   |
/// | `ACK_ONLY`     | 8   |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ControlFlags(pub u8);

impl ControlFlags {
    pub const NONE: ControlFlags = ControlFlags(0);
    /// First message of a procedure invocation; carries service/procedure names.
    pub const STREAM_OPEN: ControlFlags = ControlFlags(1);
    /// Sender half-close: no further payloads will follow from this side.
    pub const STREAM_CLOSED: ControlFlags = ControlFlags(2);
    /// Abortive close; the payload carries an [`ErrorPayload`].
    pub const STREAM_CANCEL: ControlFlags = ControlFlags(4);
    /// Bare control message (heartbeat / ack carrier); not sequenced or buffered.
    pub const ACK_ONLY: ControlFlags = ControlFlags(8);

    #[must_use]
    pub fn union(self, other: ControlFlags) -> ControlFlags {
        ControlFlags(self.0 | other.0)
    }

    #[must_use]
    pub fn contains(self, other: ControlFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn is_stream_open(self) -> bool {
        self.contains(Self::STREAM_OPEN)
    }

    #[must_use]
    pub fn is_stream_closed(self) -> bool {
        self.contains(Self::STREAM_CLOSED)
    }

    #[must_use]
    pub fn is_stream_cancel(self) -> bool {
        self.contains(Self::STREAM_CANCEL)
    }

    #[must_use]
    pub fn is_ack_only(self) -> bool {
        self.contains(Self::ACK_ONLY)
    }
}

impl std::ops::BitOr for ControlFlags {
    type Output = ControlFlags;

    fn bitor(self, rhs: ControlFlags) -> ControlFlags {
        self.union(rhs)
    }
}

// ---------------------------------------------------------------------------
// Message envelope
// ---------------------------------------------------------------------------

/// The envelope every sequenced message travels in.
///
/// `seq` values form a gap-free, strictly increasing sequence per session
/// direction; `ack` is the last contiguously received peer `seq` and is
/// non-decreasing. Every message is scoped to a `stream_id`; messages with
/// the `STREAM_OPEN` flag additionally carry `service_name` and
/// `procedure_name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportMessage {
    /// Unique message id (UUID v4), for logging/correlation only.
    pub id: String,
    pub from: String,
    pub to: String,
    /// Monotonic per-session sender counter. `ACK_ONLY` messages carry the
    /// sender's current counter but do not advance it.
    pub seq: u64,
    /// Last contiguously received peer seq.
    pub ack: u64,
    pub stream_id: String,
    pub control_flags: ControlFlags,
    /// Required on `STREAM_OPEN`, absent otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    /// Required on `STREAM_OPEN`, absent otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub procedure_name: Option<String>,
    /// Opaque payload; decoded against procedure schemas by the dispatcher.
    pub payload: serde_json::Value,
}

impl TransportMessage {
    /// Build a payload message with a fresh message id. `seq`/`ack` are
    /// stamped by the session send path.
    #[must_use]
    pub fn new(
        from: &str,
        to: &str,
        stream_id: &str,
        control_flags: ControlFlags,
        payload: serde_json::Value,
    ) -> Self {
        TransportMessage {
            id: Uuid::new_v4().to_string(),
            from: from.to_owned(),
            to: to.to_owned(),
            seq: 0,
            ack: 0,
            stream_id: stream_id.to_owned(),
            control_flags,
            service_name: None,
            procedure_name: None,
            payload,
        }
    }

    /// Build a bare `ACK_ONLY` control message (heartbeat / ack carrier).
    #[must_use]
    pub fn ack_only(from: &str, to: &str) -> Self {
        TransportMessage::new(
            from,
            to,
            CONTROL_STREAM_ID,
            ControlFlags::ACK_ONLY,
            serde_json::Value::Null,
        )
    }
}

/// Reserved stream id used by `ACK_ONLY` control messages. Never dispatched.
pub const CONTROL_STREAM_ID: &str = "control";

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// First frame either peer sends on a fresh transport connection.
///
/// `expected_session_id` is the remote session id cached from a previous
/// connection, or absent on first contact. A mismatch on the receiving side
/// forces a brand-new session (the old one is destroyed and its streams
/// aborted).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub protocol_version: u32,
    /// The sender's freshly minted (or retained, on reconnect) session id.
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_session_id: Option<String>,
    /// Opaque, user-schema-validated payload (e.g. auth token).
    pub metadata: serde_json::Value,
}

/// Reply to a [`HandshakeRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub ok: bool,
    /// The responder's session id; present when `ok`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// One of the frozen error codes; present when not `ok`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

// ---------------------------------------------------------------------------
// Results and errors
// ---------------------------------------------------------------------------

/// Wire shape of a failed result: `{ code, message, extras? }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// One of the frozen error codes, or a user-declared error code.
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extras: Option<serde_json::Value>,
}

impl ErrorPayload {
    #[must_use]
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        ErrorPayload {
            code: code.to_owned(),
            message: message.into(),
            extras: None,
        }
    }
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Wire shape of a procedure result: `{ ok, payload }`.
///
/// `payload` holds the success value when `ok` and the serialized
/// [`ErrorPayload`] when not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload {
    pub ok: bool,
    pub payload: serde_json::Value,
}

impl ResultPayload {
    #[must_use]
    pub fn ok(payload: serde_json::Value) -> Self {
        ResultPayload { ok: true, payload }
    }

    /// Serialization of an [`ErrorPayload`] cannot fail; the unwrap is safe.
    #[must_use]
    pub fn err(error: &ErrorPayload) -> Self {
        ResultPayload {
            ok: false,
            payload: serde_json::to_value(error).unwrap_or(serde_json::Value::Null),
        }
    }

    /// Split back into `Result` form. A malformed error payload (not the
    /// `{ code, message }` shape) maps to an `INVALID_REQUEST` error rather
    /// than a panic.
    #[must_use]
    pub fn into_result(self) -> Result<serde_json::Value, ErrorPayload> {
        if self.ok {
            Ok(self.payload)
        } else {
            Err(serde_json::from_value(self.payload).unwrap_or_else(|e| {
                ErrorPayload::new(
                    error_codes::INVALID_REQUEST,
                    format!("malformed error payload: {e}"),
                )
            }))
        }
    }
}

/// Frozen protocol error codes.
pub mod error_codes {
    /// Malformed or unmatchable stream open / payload.
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    /// A handler returned an error it did not declare.
    pub const UNCAUGHT_ERROR: &str = "UNCAUGHT_ERROR";
    /// Session destroyed (grace period lapsed) with the stream still open.
    pub const UNEXPECTED_DISCONNECT: &str = "UNEXPECTED_DISCONNECT";
    /// Either side aborted the stream.
    pub const CANCEL: &str = "CANCEL";
    /// Reader-side break marker; never crosses the wire.
    pub const STREAM_BROKEN: &str = "STREAM_BROKEN";
    /// Handshake rejected (version mismatch or metadata validation failure).
    pub const HANDSHAKE_FAILED: &str = "HANDSHAKE_FAILED";
}

// ---------------------------------------------------------------------------
// Top-level discriminated union
// ---------------------------------------------------------------------------

/// All frame kinds that cross a transport connection.
///
/// Serializes/deserializes using the `kind` field as a tag:
///
/// ```json
/// { "kind": "message", ... }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum WireFrame {
    HandshakeRequest(HandshakeRequest),
    HandshakeResponse(HandshakeResponse),
    Message(TransportMessage),
}
