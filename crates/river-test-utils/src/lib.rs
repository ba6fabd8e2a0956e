// river-test-utils: shared fixtures for the integration suites.
//
// Provides the in-memory transport pair with scripted connects/drops, a
// codec wrapper with injectable encode failures, and the fixture services
// the end-to-end scenarios run against.

pub mod failing_codec;
pub mod memory_transport;
pub mod services;

pub use failing_codec::{FailingCodec, FailureHandle};
pub use memory_transport::{
    HubControl, LinkHandle, MemoryHub, MemoryTransport, memory_transport_pair,
};
