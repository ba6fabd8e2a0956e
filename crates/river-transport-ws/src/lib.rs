// river-transport-ws: the Transport seam over real WebSockets.
//
// Frames travel as binary WS messages, one frame per message, so
// boundaries are preserved end-to-end. Peer identity is negotiated with a
// one-line text preamble: the dialing side sends its peer id as the first
// message after the WS upgrade.
//
// The dialer owns reconnection: it redials on a jittered backoff and emits
// Connected/Disconnected events; everything above (handshake, replay) is
// the session layer's business.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use river_core::error::TransportError;
use river_core::transport::{Transport, TransportEvent, TransportEvents};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

/// Accepting side: binds a TCP listener and runs one task per socket.
pub struct WsServerTransport {
    addr: SocketAddr,
    peers: Arc<RwLock<HashMap<String, mpsc::UnboundedSender<Message>>>>,
}

impl WsServerTransport {
    /// Bind `addr` (use port 0 for a random port) and start accepting.
    pub async fn bind(
        addr: &str,
    ) -> Result<(Arc<WsServerTransport>, TransportEvents), std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let peers: Arc<RwLock<HashMap<String, mpsc::UnboundedSender<Message>>>> =
            Arc::new(RwLock::new(HashMap::new()));

        let transport = Arc::new(WsServerTransport {
            addr: local_addr,
            peers: Arc::clone(&peers),
        });

        tokio::spawn(async move {
            info!(addr = %local_addr, "ws transport listening");
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let peers = Arc::clone(&peers);
                        let event_tx = event_tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_socket(stream, peers, event_tx).await {
                                debug!(peer_addr = %peer_addr, error = %e, "socket ended");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        break;
                    }
                }
            }
        });

        Ok((transport, event_rx))
    }

    /// The address the listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl Transport for WsServerTransport {
    async fn send(&self, peer: &str, frame: Vec<u8>) -> Result<(), TransportError> {
        let peers = self.peers.read().await;
        let tx = peers
            .get(peer)
            .ok_or_else(|| TransportError::NotConnected(peer.to_owned()))?;
        tx.send(Message::Binary(frame.into()))
            .map_err(|_| TransportError::NotConnected(peer.to_owned()))
    }

    async fn close(&self, peer: &str) {
        // Dropping the outbound sender ends the socket task, which emits
        // the Disconnected event.
        self.peers.write().await.remove(peer);
    }
}

async fn handle_socket(
    stream: TcpStream,
    peers: Arc<RwLock<HashMap<String, mpsc::UnboundedSender<Message>>>>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut write, mut read) = ws.split();

    // Identity preamble: first message is the peer id as text.
    let peer = match read.next().await {
        Some(Ok(Message::Text(text))) => text.to_string(),
        _ => return Err("missing peer id preamble".into()),
    };

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    {
        let mut registry = peers.write().await;
        // A lingering entry for the same peer id is superseded.
        registry.insert(peer.clone(), out_tx.clone());
    }
    info!(peer = %peer, "ws peer connected");
    let _ = event_tx.send(TransportEvent::Connected { peer: peer.clone() });

    loop {
        tokio::select! {
            outbound = out_rx.recv() => {
                match outbound {
                    Some(msg) => {
                        if write.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = read.next() => {
                match inbound {
                    Some(Ok(Message::Binary(bytes))) => {
                        let _ = event_tx.send(TransportEvent::Frame {
                            peer: peer.clone(),
                            bytes: bytes.to_vec(),
                        });
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(peer = %peer, error = %e, "ws read error");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    {
        let mut registry = peers.write().await;
        // Only unregister our own entry: a superseding connection may have
        // replaced it already, and its Connected event must stand.
        match registry.get(&peer) {
            Some(current) if current.same_channel(&out_tx) => {
                registry.remove(&peer);
            }
            Some(_) => return Ok(()),
            None => {}
        }
    }
    info!(peer = %peer, "ws peer disconnected");
    let _ = event_tx.send(TransportEvent::Disconnected { peer });
    Ok(())
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// Dialing side: redials on a jittered backoff until shut down.
pub struct WsClientTransport {
    server_peer: String,
    conn: Arc<RwLock<Option<mpsc::UnboundedSender<Message>>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl WsClientTransport {
    /// Start dialing `url`. Events name the remote `server_peer`; the
    /// remote learns us as `own_id` through the preamble.
    #[must_use]
    pub fn connect(
        url: &str,
        own_id: &str,
        server_peer: &str,
    ) -> (Arc<WsClientTransport>, TransportEvents) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let conn: Arc<RwLock<Option<mpsc::UnboundedSender<Message>>>> =
            Arc::new(RwLock::new(None));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let transport = Arc::new(WsClientTransport {
            server_peer: server_peer.to_owned(),
            conn: Arc::clone(&conn),
            shutdown_tx,
        });

        let url = url.to_owned();
        let own_id = own_id.to_owned();
        let server_peer = server_peer.to_owned();
        tokio::spawn(dial_loop(url, own_id, server_peer, conn, event_tx, shutdown_rx));

        (transport, event_rx)
    }

    /// Stop redialing and drop the current connection for good.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[async_trait]
impl Transport for WsClientTransport {
    async fn send(&self, peer: &str, frame: Vec<u8>) -> Result<(), TransportError> {
        if peer != self.server_peer {
            return Err(TransportError::NotConnected(peer.to_owned()));
        }
        let conn = self.conn.read().await;
        let tx = conn
            .as_ref()
            .ok_or_else(|| TransportError::NotConnected(peer.to_owned()))?;
        tx.send(Message::Binary(frame.into()))
            .map_err(|_| TransportError::NotConnected(peer.to_owned()))
    }

    async fn close(&self, _peer: &str) {
        // Drop the current connection; the dial loop will reconnect.
        self.conn.write().await.take();
    }
}

async fn dial_loop(
    url: String,
    own_id: String,
    server_peer: String,
    conn: Arc<RwLock<Option<mpsc::UnboundedSender<Message>>>>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        match tokio_tungstenite::connect_async(&url).await {
            Ok((ws, _)) => {
                attempt = 0;
                if let Err(e) = run_connection(
                    ws,
                    &own_id,
                    &server_peer,
                    &conn,
                    &event_tx,
                    &mut shutdown_rx,
                )
                .await
                {
                    debug!(error = %e, "ws connection ended");
                }
                conn.write().await.take();
                let _ = event_tx.send(TransportEvent::Disconnected {
                    peer: server_peer.clone(),
                });
            }
            Err(e) => {
                debug!(error = %e, attempt, "dial failed");
                attempt = attempt.saturating_add(1);
            }
        }

        let base = Duration::from_millis(250) * attempt.min(8);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..100));
        tokio::select! {
            () = tokio::time::sleep(base + jitter) => {}
            _ = shutdown_rx.changed() => {}
        }
    }
}

async fn run_connection(
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<TcpStream>,
    >,
    own_id: &str,
    server_peer: &str,
    conn: &Arc<RwLock<Option<mpsc::UnboundedSender<Message>>>>,
    event_tx: &mpsc::UnboundedSender<TransportEvent>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (mut write, mut read) = ws.split();
    write.send(Message::Text(own_id.to_owned().into())).await?;

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    *conn.write().await = Some(out_tx);
    info!(url_peer = %server_peer, "ws connected");
    let _ = event_tx.send(TransportEvent::Connected {
        peer: server_peer.to_owned(),
    });

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
            outbound = out_rx.recv() => {
                match outbound {
                    Some(msg) => write.send(msg).await?,
                    // close() dropped the sender.
                    None => return Ok(()),
                }
            }
            inbound = read.next() => {
                match inbound {
                    Some(Ok(Message::Binary(bytes))) => {
                        let _ = event_tx.send(TransportEvent::Frame {
                            peer: server_peer.to_owned(),
                            bytes: bytes.to_vec(),
                        });
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}
