// Error types shared across the core.

use river_protocol::ErrorPayload;

/// Codec failures. Encoding may fail transiently (e.g. allocation pressure);
/// the session treats that as a per-message failure, never a fatal one.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encode: {0}")]
    Encode(String),
    #[error("decode: {0}")]
    Decode(String),
}

/// Transport-level send failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("peer not connected: {0}")]
    NotConnected(String),
    #[error("transport closed")]
    Closed,
    #[error("io: {0}")]
    Io(String),
}

/// Failures surfaced by [`crate::Writable::write`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WriteError {
    /// `write()` after a local `close()`.
    #[error("writable is closed")]
    Closed,
}

/// Failures surfaced by the client invocation surface before a stream is
/// even open (the session handle itself is gone).
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("client is shut down")]
    Shutdown,
}

impl From<ClientError> for ErrorPayload {
    fn from(err: ClientError) -> Self {
        ErrorPayload::new(
            river_protocol::error_codes::UNEXPECTED_DISCONNECT,
            err.to_string(),
        )
    }
}
