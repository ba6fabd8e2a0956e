// memory_transport: in-process transports for integration testing.
//
// A MemoryHub is the accepting side: one Transport over any number of
// attached client links, mirroring how the WebSocket acceptor multiplexes
// peers. Each attached link has an operator handle that scripts connects
// and drops. Frames sent while a link is down fail at the sender and
// nothing is queued across a drop, which is exactly the loss the session
// layer's replay discipline has to absorb.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use river_core::error::TransportError;
use river_core::transport::{Transport, TransportEvent, TransportEvents};
use tokio::sync::mpsc;

struct Link {
    up: bool,
    /// Events toward the attached client.
    client_tx: mpsc::UnboundedSender<TransportEvent>,
}

struct HubState {
    server_id: String,
    /// Events toward the hub (server) side.
    server_tx: mpsc::UnboundedSender<TransportEvent>,
    links: HashMap<String, Link>,
}

/// Accepting side: one transport over all attached links.
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    /// Create a hub plus its event stream. Clients attach afterwards.
    #[must_use]
    pub fn new(server_id: &str) -> (Arc<MemoryHub>, TransportEvents, HubControl) {
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(HubState {
            server_id: server_id.to_owned(),
            server_tx,
            links: HashMap::new(),
        }));
        let hub = Arc::new(MemoryHub {
            state: Arc::clone(&state),
        });
        (hub, server_rx, HubControl { state })
    }
}

#[async_trait]
impl Transport for MemoryHub {
    async fn send(&self, peer: &str, frame: Vec<u8>) -> Result<(), TransportError> {
        let state = self.state.lock().expect("hub state poisoned");
        let link = state
            .links
            .get(peer)
            .ok_or_else(|| TransportError::NotConnected(peer.to_owned()))?;
        if !link.up {
            return Err(TransportError::NotConnected(peer.to_owned()));
        }
        link.client_tx
            .send(TransportEvent::Frame {
                peer: state.server_id.clone(),
                bytes: frame,
            })
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&self, peer: &str) {
        drop_link(&self.state, peer);
    }
}

/// Attaches client links to a hub.
pub struct HubControl {
    state: Arc<Mutex<HubState>>,
}

impl HubControl {
    /// Attach a client. The link starts down; call [`LinkHandle::connect`].
    #[must_use]
    pub fn attach(&self, client_id: &str) -> (MemoryTransport, TransportEvents, LinkHandle) {
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let server_id = {
            let mut state = self.state.lock().expect("hub state poisoned");
            state.links.insert(
                client_id.to_owned(),
                Link {
                    up: false,
                    client_tx,
                },
            );
            state.server_id.clone()
        };
        let transport = MemoryTransport {
            own_id: client_id.to_owned(),
            server_id,
            state: Arc::clone(&self.state),
        };
        let handle = LinkHandle {
            client_id: client_id.to_owned(),
            state: Arc::clone(&self.state),
        };
        (transport, client_rx, handle)
    }
}

/// The client end of one link.
pub struct MemoryTransport {
    own_id: String,
    server_id: String,
    state: Arc<Mutex<HubState>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, peer: &str, frame: Vec<u8>) -> Result<(), TransportError> {
        if peer != self.server_id {
            return Err(TransportError::NotConnected(peer.to_owned()));
        }
        let state = self.state.lock().expect("hub state poisoned");
        let up = state.links.get(&self.own_id).is_some_and(|link| link.up);
        if !up {
            return Err(TransportError::NotConnected(peer.to_owned()));
        }
        state
            .server_tx
            .send(TransportEvent::Frame {
                peer: self.own_id.clone(),
                bytes: frame,
            })
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&self, _peer: &str) {
        drop_link(&self.state, &self.own_id);
    }
}

/// Operator handle over one link.
#[derive(Clone)]
pub struct LinkHandle {
    client_id: String,
    state: Arc<Mutex<HubState>>,
}

impl LinkHandle {
    /// Bring the link up; both ends observe `Connected`.
    pub fn connect(&self) {
        let mut state = self.state.lock().expect("hub state poisoned");
        let server_id = state.server_id.clone();
        let server_tx = state.server_tx.clone();
        let Some(link) = state.links.get_mut(&self.client_id) else {
            return;
        };
        if link.up {
            return;
        }
        link.up = true;
        let _ = link.client_tx.send(TransportEvent::Connected { peer: server_id });
        let _ = server_tx.send(TransportEvent::Connected {
            peer: self.client_id.clone(),
        });
    }

    /// Drop the link; both ends observe `Disconnected`. Frames "in flight"
    /// at the drop are lost.
    pub fn drop_link(&self) {
        drop_link(&self.state, &self.client_id);
    }

    #[must_use]
    pub fn is_up(&self) -> bool {
        self.state
            .lock()
            .expect("hub state poisoned")
            .links
            .get(&self.client_id)
            .is_some_and(|link| link.up)
    }
}

fn drop_link(state: &Arc<Mutex<HubState>>, client_id: &str) {
    let mut state = state.lock().expect("hub state poisoned");
    let server_id = state.server_id.clone();
    let server_tx = state.server_tx.clone();
    let Some(link) = state.links.get_mut(client_id) else {
        return;
    };
    if !link.up {
        return;
    }
    link.up = false;
    let _ = link.client_tx.send(TransportEvent::Disconnected { peer: server_id });
    let _ = server_tx.send(TransportEvent::Disconnected {
        peer: client_id.to_owned(),
    });
}

/// Convenience: a hub with exactly one attached client, returned as
/// (client transport, client events, hub transport, hub events, link).
#[must_use]
pub fn memory_transport_pair(
    client_id: &str,
    server_id: &str,
) -> (
    MemoryTransport,
    TransportEvents,
    Arc<MemoryHub>,
    TransportEvents,
    LinkHandle,
) {
    let (hub, hub_events, control) = MemoryHub::new(server_id);
    let (client, client_events, link) = control.attach(client_id);
    (client, client_events, hub, hub_events, link)
}
