// river-core: sessions, streams, and procedure dispatch.
//
// Four procedure shapes (rpc, upload, subscription, stream) multiplexed
// over one logical connection per peer. Sessions survive transport
// disconnects: sequenced messages sit in a send buffer until acked and are
// replayed in order after a reconnect, so callers see sender-order delivery
// even across drops. Codecs and transports are injected at the seams; the
// in-memory and WebSocket implementations live in sibling crates.

pub mod channel;
pub mod client;
pub mod codec;
pub mod context;
pub mod error;
pub mod events;
pub mod registry;
pub mod schema;
pub mod server;
pub mod session;
pub mod transport;

pub use channel::{Readable, StreamItem, Writable};
pub use client::{CancelHandle, Client, ClientOptions, MetadataConstruct, PendingResponse};
pub use codec::{Codec, JsonCodec};
pub use context::{CancelToken, Ctx};
pub use error::{ClientError, CodecError, TransportError, WriteError};
pub use events::{EventBus, ProtocolErrorKind, RiverEvent, SessionStateKind};
pub use registry::{
    Middleware, ProcedureDef, ProcedureKind, ProcedureResult, ServiceDef, ServiceRegistry,
};
pub use schema::Schema;
pub use server::{HandshakeValidator, Server, ServerOptions};
pub use session::SessionConfig;
pub use transport::{Transport, TransportEvent, TransportEvents};

pub use river_protocol as protocol;
