// river: facade over the workspace crates.
//
// Bidirectional typed RPC over a single logical connection: four procedure
// shapes (rpc, upload, subscription, stream), sessions that survive
// transport disconnects, exact at-most-once delivery within a session.
//
// The pieces live in dedicated crates; this crate re-exports the public
// surface and hosts the end-to-end integration suites.

pub use river_core::{
    CancelHandle, CancelToken, Client, ClientOptions, Codec, Ctx, EventBus, JsonCodec,
    MetadataConstruct, Middleware, PendingResponse, ProcedureDef, ProcedureKind, ProcedureResult,
    ProtocolErrorKind, Readable, RiverEvent, Schema, Server, ServerOptions, ServiceDef,
    ServiceRegistry, SessionConfig, SessionStateKind, StreamItem, Transport, TransportEvent,
    TransportEvents, Writable,
};

pub use river_protocol as protocol;
pub use river_schema_diff as schema_diff;
pub use river_transport_ws as transport_ws;
