// Server: wires transport events to per-peer session tasks.
//
// The accept loop owns the routing table (peer id -> session input channel)
// and nothing else; every session decision happens on the session's own
// task. A session task that ends reports back so the table stays clean.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use crate::codec::Codec;
use crate::events::{EventBus, ProtocolErrorKind, RiverEvent};
use crate::registry::{Middleware, ServiceRegistry};
use crate::session::SessionConfig;
use crate::session::server_session::{self, SessionInput};
use crate::transport::{Transport, TransportEvent, TransportEvents};

/// User-supplied handshake metadata validator. Rejections carry a reason
/// for the log; the peer only sees `HANDSHAKE_FAILED`.
pub type HandshakeValidator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Server construction options.
pub struct ServerOptions {
    /// Peer id this server stamps as `from` on outbound messages.
    pub server_id: String,
    pub handshake_validate: Option<HandshakeValidator>,
    /// Side-effect-only interceptors, invoked in declaration order before
    /// every handler.
    pub middlewares: Vec<Middleware>,
    pub session: SessionConfig,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            server_id: "SERVER".to_owned(),
            handshake_validate: None,
            middlewares: Vec::new(),
            session: SessionConfig::default(),
        }
    }
}

/// Everything a session task needs, shared once.
pub(crate) struct ServerShared {
    pub transport: Arc<dyn Transport>,
    pub codec: Arc<dyn Codec>,
    pub registry: ServiceRegistry,
    pub middlewares: Vec<Middleware>,
    pub handshake_validate: Option<HandshakeValidator>,
    pub config: SessionConfig,
    pub events: EventBus,
    pub server_id: String,
}

/// A running River server. [`Server::close`] (or dropping the handle)
/// shuts it down; every live session aborts its streams with
/// `UNEXPECTED_DISCONNECT`.
pub struct Server {
    events: EventBus,
    shutdown_tx: mpsc::UnboundedSender<()>,
}

impl Server {
    /// Start serving `registry` over `transport`. The accept loop runs on a
    /// spawned task until [`Server::close`] or the transport event stream
    /// ends.
    pub fn start(
        transport: Arc<dyn Transport>,
        transport_events: TransportEvents,
        codec: Arc<dyn Codec>,
        registry: ServiceRegistry,
        options: ServerOptions,
    ) -> Server {
        let events = EventBus::new();
        let shared = Arc::new(ServerShared {
            transport,
            codec,
            registry,
            middlewares: options.middlewares,
            handshake_validate: options.handshake_validate,
            config: options.session,
            events: events.clone(),
            server_id: options.server_id,
        });
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        tokio::spawn(accept_loop(shared, transport_events, shutdown_rx));
        Server { events, shutdown_tx }
    }

    /// Observe protocol errors, session transitions, and message arrivals.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RiverEvent> {
        self.events.subscribe()
    }

    /// Shut down: every live session is destroyed (its streams abort with
    /// `UNEXPECTED_DISCONNECT`) and its connection closed.
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

async fn accept_loop(
    shared: Arc<ServerShared>,
    mut transport_events: TransportEvents,
    mut shutdown_rx: mpsc::UnboundedReceiver<()>,
) {
    let mut sessions: HashMap<String, mpsc::UnboundedSender<SessionInput>> = HashMap::new();
    let (ended_tx, mut ended_rx) = mpsc::unbounded_channel::<String>();

    info!(server_id = %shared.server_id, "server started");
    loop {
        tokio::select! {
            event = transport_events.recv() => {
                let Some(event) = event else { break };
                route_event(&shared, &mut sessions, &ended_tx, event);
            }
            Some(peer) = ended_rx.recv() => {
                debug!(peer = %peer, "session task ended");
                sessions.remove(&peer);
            }
            _ = shutdown_rx.recv() => {
                info!(server_id = %shared.server_id, "server shutting down");
                for (_, session) in sessions.drain() {
                    let _ = session.send(SessionInput::Shutdown);
                }
                break;
            }
        }
    }
}

fn route_event(
    shared: &Arc<ServerShared>,
    sessions: &mut HashMap<String, mpsc::UnboundedSender<SessionInput>>,
    ended_tx: &mpsc::UnboundedSender<String>,
    event: TransportEvent,
) {
    let (peer, input) = match event {
        TransportEvent::Connected { peer } => (peer, SessionInput::Connected),
        TransportEvent::Disconnected { peer } => {
            // No task, nothing to tear down.
            if !sessions.contains_key(&peer) {
                return;
            }
            (peer, SessionInput::Disconnected)
        }
        TransportEvent::Frame { peer, bytes } => match shared.codec.decode(&bytes) {
            Ok(frame) => (peer, SessionInput::Frame(frame)),
            Err(e) => {
                shared.events.publish(RiverEvent::ProtocolError {
                    kind: ProtocolErrorKind::InvariantViolation,
                    message: format!("undecodable frame: {e}"),
                });
                return;
            }
        },
    };

    let mut input = input;
    // Two attempts: the entry may hold the sender of a task that already
    // ended (grace expiry) but has not been reaped yet; replace it once.
    for _ in 0..2 {
        let session = sessions.entry(peer.clone()).or_insert_with(|| {
            debug!(peer = %peer, "starting session task");
            let (input_tx, input_rx) = mpsc::unbounded_channel();
            tokio::spawn(server_session::run(
                Arc::clone(shared),
                peer.clone(),
                input_rx,
                ended_tx.clone(),
            ));
            input_tx
        });
        match session.send(input) {
            Ok(()) => return,
            Err(mpsc::error::SendError(returned)) => {
                sessions.remove(&peer);
                input = returned;
            }
        }
    }
}
