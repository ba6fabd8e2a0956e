// failing_codec: wraps a codec with scriptable encode failures, for the
// allocation-failure scenarios. Decoding always passes through.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use river_core::codec::Codec;
use river_core::error::CodecError;
use river_protocol::WireFrame;

#[derive(Default)]
struct FailureState {
    fail_all: AtomicBool,
    fail_next: AtomicU32,
}

/// Test-side control over injected failures.
#[derive(Clone)]
pub struct FailureHandle {
    state: Arc<FailureState>,
}

impl FailureHandle {
    /// Fail the next `n` encode calls, then recover.
    pub fn fail_next_encodes(&self, n: u32) {
        self.state.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail every encode until turned off again.
    pub fn fail_all_encodes(&self, on: bool) {
        self.state.fail_all.store(on, Ordering::SeqCst);
    }
}

/// A codec whose encode path can be made to fail on demand.
pub struct FailingCodec<C> {
    inner: C,
    state: Arc<FailureState>,
}

impl<C: Codec> FailingCodec<C> {
    pub fn new(inner: C) -> (Self, FailureHandle) {
        let state = Arc::new(FailureState::default());
        (
            FailingCodec {
                inner,
                state: Arc::clone(&state),
            },
            FailureHandle { state },
        )
    }

    fn should_fail(&self) -> bool {
        if self.state.fail_all.load(Ordering::SeqCst) {
            return true;
        }
        self.state
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n > 0 { Some(n - 1) } else { None }
            })
            .is_ok()
    }
}

impl<C: Codec> Codec for FailingCodec<C> {
    fn encode(&self, frame: &WireFrame) -> Result<Vec<u8>, CodecError> {
        if self.should_fail() {
            return Err(CodecError::Encode("allocation failure (injected)".to_owned()));
        }
        self.inner.encode(frame)
    }

    fn decode(&self, bytes: &[u8]) -> Result<WireFrame, CodecError> {
        self.inner.decode(bytes)
    }
}
