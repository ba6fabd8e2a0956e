// Codec seam: value <-> byte-sequence boundary for wire frames.
//
// Encode failures are per-message events, not session-fatal: the caller
// drops the frame, emits a `MessageSendFailure` protocol event, and keeps
// the session alive (the unsent message stays in the send buffer).

use river_protocol::WireFrame;

use crate::error::CodecError;

/// Encodes and decodes [`WireFrame`]s. Implementations must preserve frame
/// boundaries (one encoded buffer per frame) and may fail on either side.
pub trait Codec: Send + Sync + 'static {
    fn encode(&self, frame: &WireFrame) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<WireFrame, CodecError>;
}

/// The default codec: JSON text frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, frame: &WireFrame) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(frame).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<WireFrame, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
