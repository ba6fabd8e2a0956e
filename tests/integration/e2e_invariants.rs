//! Protocol invariant enforcement: gap-free seq sequences, non-decreasing
//! acks, and duplicate suppression. Violations tear the session down and
//! surface as InvariantViolation protocol events.

use std::time::Duration;

use river::protocol::{
    ControlFlags, HandshakeRequest, PROTOCOL_VERSION, TransportMessage, WireFrame,
};
use river::{
    Codec, JsonCodec, ProtocolErrorKind, RiverEvent, Server, ServerOptions, ServiceRegistry,
    SessionConfig, Transport, TransportEvent, TransportEvents,
};
use river_test_utils::services::math_service;
use river_test_utils::{MemoryHub, MemoryTransport};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Raw peer harness
// ---------------------------------------------------------------------------

struct RawPeer {
    id: String,
    transport: MemoryTransport,
    events: TransportEvents,
    seq: u64,
    last_recv: u64,
}

impl RawPeer {
    async fn connect(control: &river_test_utils::HubControl, id: &str) -> RawPeer {
        let (transport, events, link) = control.attach(id);
        link.connect();
        let mut peer = RawPeer {
            id: id.to_owned(),
            transport,
            events,
            seq: 0,
            last_recv: 0,
        };
        match peer.next_event().await {
            TransportEvent::Connected { .. } => {}
            other => panic!("expected Connected, got {other:?}"),
        }
        peer.send_frame(&WireFrame::HandshakeRequest(HandshakeRequest {
            protocol_version: PROTOCOL_VERSION,
            session_id: Uuid::new_v4().to_string(),
            expected_session_id: None,
            metadata: Value::Null,
        }))
        .await;
        match peer.recv_frame().await {
            WireFrame::HandshakeResponse(resp) => assert!(resp.ok, "handshake must succeed"),
            other => panic!("expected HandshakeResponse, got {other:?}"),
        }
        peer
    }

    async fn next_event(&mut self) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), self.events.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("transport events ended")
    }

    async fn send_frame(&mut self, frame: &WireFrame) {
        let bytes = JsonCodec.encode(frame).unwrap();
        self.transport.send("SERVER", bytes).await.unwrap();
    }

    async fn recv_frame(&mut self) -> WireFrame {
        loop {
            match self.next_event().await {
                TransportEvent::Frame { bytes, .. } => {
                    return JsonCodec.decode(&bytes).unwrap();
                }
                TransportEvent::Connected { .. } => {}
                TransportEvent::Disconnected { .. } => panic!("link dropped unexpectedly"),
            }
        }
    }

    /// Send an `add` rpc open with explicit seq/ack overrides.
    async fn send_add(&mut self, seq: u64, ack: u64, n: i64) -> String {
        let stream_id = Uuid::new_v4().to_string();
        let mut msg = TransportMessage::new(
            &self.id,
            "SERVER",
            &stream_id,
            ControlFlags::STREAM_OPEN | ControlFlags::STREAM_CLOSED,
            json!({ "n": n }),
        );
        msg.seq = seq;
        msg.ack = ack;
        msg.service_name = Some("math".to_owned());
        msg.procedure_name = Some("add".to_owned());
        self.send_frame(&WireFrame::Message(msg)).await;
        stream_id
    }

    /// Next sequenced message, heartbeats skipped.
    async fn recv_message(&mut self) -> TransportMessage {
        loop {
            match self.recv_frame().await {
                WireFrame::Message(msg) => {
                    if msg.control_flags.is_ack_only() {
                        continue;
                    }
                    self.last_recv = msg.seq;
                    return msg;
                }
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    /// Wait until the link drops (the server's reaction to a violation).
    async fn wait_for_disconnect(&mut self) {
        loop {
            if matches!(self.next_event().await, TransportEvent::Disconnected { .. }) {
                return;
            }
        }
    }
}

fn start_server() -> (Server, river_test_utils::HubControl) {
    let (hub, hub_events, control) = MemoryHub::new("SERVER");
    let session = SessionConfig {
        heartbeat_interval: Duration::from_secs(60),
        heartbeats_until_dead: 100,
        grace_period: Duration::from_secs(600),
        max_aborted_stream_tombstones_per_session: 5,
    };
    let server = Server::start(
        hub,
        hub_events,
        std::sync::Arc::new(JsonCodec),
        ServiceRegistry::new().service(math_service()),
        ServerOptions {
            session,
            ..ServerOptions::default()
        },
    );
    (server, control)
}

async fn expect_violation(events: &mut broadcast::Receiver<RiverEvent>) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .expect("timed out waiting for InvariantViolation")
            .expect("event bus closed");
        if matches!(
            event,
            RiverEvent::ProtocolError {
                kind: ProtocolErrorKind::InvariantViolation,
                ..
            }
        ) {
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// A seq that skips past the contiguous tail tears the session down.
#[tokio::test]
async fn seq_gap_is_a_violation() {
    let (server, control) = start_server();
    let mut server_events = server.subscribe();
    let mut peer = RawPeer::connect(&control, "client-1").await;

    let first = peer.send_add(1, 0, 1).await;
    let response = peer.recv_message().await;
    assert_eq!(response.stream_id, first);

    // seq 5 skips 2..4.
    peer.send_add(5, peer.last_recv, 2).await;
    expect_violation(&mut server_events).await;
    peer.wait_for_disconnect().await;
}

/// An ack lower than a previously seen ack is a violation.
#[tokio::test]
async fn ack_regression_is_a_violation() {
    let (server, control) = start_server();
    let mut server_events = server.subscribe();
    let mut peer = RawPeer::connect(&control, "client-1").await;

    peer.send_add(1, 0, 1).await;
    let _ = peer.recv_message().await;

    // Ack the server's seq 1, then regress to 0.
    peer.send_add(2, 1, 2).await;
    let _ = peer.recv_message().await;
    peer.send_add(3, 0, 3).await;

    expect_violation(&mut server_events).await;
    peer.wait_for_disconnect().await;
}

/// Replay duplicates are dropped silently: the same seq twice processes
/// once, and the session keeps going.
#[tokio::test]
async fn duplicate_seq_is_dropped_silently() {
    let (_server, control) = start_server();
    let mut peer = RawPeer::connect(&control, "client-1").await;

    let first = peer.send_add(1, 0, 1).await;
    let response = peer.recv_message().await;
    assert_eq!(response.stream_id, first);

    // Replay the same seq with a different payload; it must be ignored.
    peer.send_add(1, peer.last_recv, 100).await;

    // A proper next message still works, and the count proves the replay
    // never reached the handler.
    let third = peer.send_add(2, peer.last_recv, 2).await;
    let response = peer.recv_message().await;
    assert_eq!(response.stream_id, third);
    let result: river::protocol::ResultPayload =
        serde_json::from_value(response.payload).unwrap();
    assert_eq!(result.into_result().unwrap(), json!({ "result": 3 }));
}

/// Undecodable frames surface as InvariantViolation protocol events.
#[tokio::test]
async fn garbage_frame_is_reported() {
    let (server, control) = start_server();
    let mut server_events = server.subscribe();
    let peer = RawPeer::connect(&control, "client-1").await;

    peer.transport
        .send("SERVER", b"not a frame".to_vec())
        .await
        .unwrap();
    expect_violation(&mut server_events).await;
}
