// Client: the typed invocation surface over a session task.
//
// Every invocation allocates a stream id, sends a STREAM_OPEN through the
// session send path (so grace-period buffering and replay apply to opens
// like any other message), and hands back reader/writer/cancel handles.

use std::sync::Arc;

use river_protocol::{ErrorPayload, error_codes};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use crate::channel::{Readable, StreamOut, Writable};
use crate::codec::Codec;
use crate::events::{EventBus, RiverEvent};
use crate::registry::ProcedureKind;
use crate::session::SessionConfig;
use crate::session::client_session::{self, ClientCommand, OpenedStream};
use crate::transport::{Transport, TransportEvents};

/// Builds the opaque handshake metadata sent to the server.
pub type MetadataConstruct = Arc<dyn Fn() -> Value + Send + Sync>;

/// Client construction options.
pub struct ClientOptions {
    /// Peer id this client stamps as `from` on outbound messages.
    pub client_id: String,
    /// Peer id of the server on the transport.
    pub server_id: String,
    pub metadata_construct: Option<MetadataConstruct>,
    /// Handshake as soon as the transport connects, rather than deferring
    /// to the first invocation.
    pub eagerly_connect: bool,
    pub session: SessionConfig,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            client_id: format!("client-{}", Uuid::new_v4()),
            server_id: "SERVER".to_owned(),
            metadata_construct: None,
            eagerly_connect: true,
            session: SessionConfig::default(),
        }
    }
}

pub(crate) struct ClientShared {
    pub transport: Arc<dyn Transport>,
    pub codec: Arc<dyn Codec>,
    pub events: EventBus,
    pub config: SessionConfig,
    pub client_id: String,
    pub server_id: String,
    pub metadata_construct: Option<MetadataConstruct>,
    pub eagerly_connect: bool,
}

/// Aborts a stream from the caller side. Firing it sends `STREAM_CANCEL`
/// to the peer; both readers observe a single `CANCEL` error.
#[derive(Clone)]
pub struct CancelHandle {
    stream_id: String,
    out: mpsc::UnboundedSender<StreamOut>,
}

impl CancelHandle {
    pub fn cancel(&self, reason: &str) {
        let _ = self.out.send(StreamOut::Cancel {
            stream_id: self.stream_id.clone(),
            error: ErrorPayload::new(error_codes::CANCEL, reason),
        });
    }
}

/// The single pending result of an rpc or upload invocation.
pub struct PendingResponse {
    readable: Readable,
}

impl PendingResponse {
    /// Await the single framed response. A stream that ends without one
    /// reports `UNEXPECTED_DISCONNECT`.
    pub async fn finish(mut self) -> Result<Value, ErrorPayload> {
        match self.readable.next().await {
            Some(result) => result,
            None => Err(ErrorPayload::new(
                error_codes::UNEXPECTED_DISCONNECT,
                "stream closed without a response",
            )),
        }
    }
}

/// A connected (or lazily connecting) River client.
#[derive(Clone)]
pub struct Client {
    cmd_tx: mpsc::UnboundedSender<ClientCommand>,
    events: EventBus,
}

impl Client {
    /// Start the client session task over `transport`.
    pub fn start(
        transport: Arc<dyn Transport>,
        transport_events: TransportEvents,
        codec: Arc<dyn Codec>,
        options: ClientOptions,
    ) -> Client {
        let events = EventBus::new();
        let shared = Arc::new(ClientShared {
            transport,
            codec,
            events: events.clone(),
            config: options.session,
            client_id: options.client_id,
            server_id: options.server_id,
            metadata_construct: options.metadata_construct,
            eagerly_connect: options.eagerly_connect,
        });
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(client_session::run(shared, transport_events, cmd_rx));
        Client { cmd_tx, events }
    }

    /// Observe protocol errors, session transitions, and message arrivals.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RiverEvent> {
        self.events.subscribe()
    }

    /// Unary request/response.
    pub async fn rpc(
        &self,
        service: &str,
        procedure: &str,
        init: Value,
    ) -> Result<Value, ErrorPayload> {
        let opened = self.open(service, procedure, init, ProcedureKind::Rpc).await?;
        PendingResponse {
            readable: opened.readable,
        }
        .finish()
        .await
    }

    /// Client-streamed upload: write values, `close()` the writer, then
    /// [`PendingResponse::finish`] for the single response.
    pub async fn upload(
        &self,
        service: &str,
        procedure: &str,
        init: Value,
    ) -> Result<(Writable, PendingResponse), ErrorPayload> {
        let opened = self.open(service, procedure, init, ProcedureKind::Upload).await?;
        let writable = opened.writable.expect("upload shape carries a writable");
        Ok((
            writable,
            PendingResponse {
                readable: opened.readable,
            },
        ))
    }

    /// Server-streamed subscription.
    pub async fn subscription(
        &self,
        service: &str,
        procedure: &str,
        init: Value,
    ) -> Result<(Readable, CancelHandle), ErrorPayload> {
        let opened = self
            .open(service, procedure, init, ProcedureKind::Subscription)
            .await?;
        let cancel = CancelHandle {
            stream_id: opened.stream_id,
            out: opened.out,
        };
        Ok((opened.readable, cancel))
    }

    /// Bidirectional stream.
    pub async fn stream(
        &self,
        service: &str,
        procedure: &str,
        init: Value,
    ) -> Result<(Writable, Readable, CancelHandle), ErrorPayload> {
        let opened = self
            .open(service, procedure, init, ProcedureKind::Stream)
            .await?;
        let writable = opened.writable.expect("stream shape carries a writable");
        let cancel = CancelHandle {
            stream_id: opened.stream_id,
            out: opened.out,
        };
        Ok((writable, opened.readable, cancel))
    }

    /// Shut down: the current session (if any) is destroyed and pending
    /// streams abort with `UNEXPECTED_DISCONNECT`.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(ClientCommand::Shutdown);
    }

    async fn open(
        &self,
        service: &str,
        procedure: &str,
        init: Value,
        kind: ProcedureKind,
    ) -> Result<OpenedStream, ErrorPayload> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ClientCommand::Open {
                service: service.to_owned(),
                procedure: procedure.to_owned(),
                init,
                kind,
                reply: reply_tx,
            })
            .map_err(|_| shutdown_error())?;
        reply_rx.await.map_err(|_| shutdown_error())
    }
}

fn shutdown_error() -> ErrorPayload {
    ErrorPayload::new(error_codes::UNEXPECTED_DISCONNECT, "client is shut down")
}
