//! Encode-failure pathology: a failing encoder must never kill a session
//! outright. Ordinary sends are dropped (and replayed from the buffer on
//! reconnect), heartbeat failures ride the grace period into teardown, and
//! a handshake failure prevents session establishment entirely.

use std::sync::Arc;
use std::time::Duration;

use river::protocol::error_codes;
use river::{
    Client, ClientOptions, JsonCodec, ProtocolErrorKind, RiverEvent, Server, ServerOptions,
    ServiceRegistry, SessionConfig, SessionStateKind,
};
use river_test_utils::services::math_service;
use river_test_utils::{FailureHandle, LinkHandle, FailingCodec, memory_transport_pair};
use serde_json::json;
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

fn session_config() -> SessionConfig {
    SessionConfig {
        heartbeat_interval: Duration::from_millis(50),
        heartbeats_until_dead: 3,
        grace_period: Duration::from_millis(500),
        max_aborted_stream_tombstones_per_session: 5,
    }
}

/// Client side gets the failing codec; the server encodes reliably.
fn start_pair() -> (Client, Server, LinkHandle, FailureHandle) {
    let (client_transport, client_events, hub, hub_events, link) =
        memory_transport_pair("client-1", "SERVER");
    let server = Server::start(
        hub,
        hub_events,
        Arc::new(JsonCodec),
        ServiceRegistry::new().service(math_service()),
        ServerOptions {
            session: session_config(),
            ..ServerOptions::default()
        },
    );
    let (codec, failures) = FailingCodec::new(JsonCodec);
    let client = Client::start(
        Arc::new(client_transport),
        client_events,
        Arc::new(codec),
        ClientOptions {
            client_id: "client-1".to_owned(),
            session: session_config(),
            ..ClientOptions::default()
        },
    );
    (client, server, link, failures)
}

fn drain_events(events: &mut broadcast::Receiver<RiverEvent>) -> Vec<RiverEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn send_failure_count(events: &[RiverEvent]) -> usize {
    events
        .iter()
        .filter(|event| {
            matches!(
                event,
                RiverEvent::ProtocolError {
                    kind: ProtocolErrorKind::MessageSendFailure,
                    ..
                }
            )
        })
        .count()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// A transient encode failure drops the frame but keeps it buffered; the
/// next reconnect replays it and the rpc completes.
#[tokio::test(start_paused = true)]
async fn transient_encode_failure_is_retried_on_reconnect() {
    let (client, _server, link, failures) = start_pair();
    let mut events = client.subscribe();
    link.connect();

    let warm = client.rpc("math", "add", json!({ "n": 1 })).await.unwrap();
    assert_eq!(warm, json!({ "result": 1 }));

    failures.fail_next_encodes(1);
    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.rpc("math", "add", json!({ "n": 2 })).await })
    };
    // Let the open attempt hit the failing encoder before forcing the
    // reconnect that replays it.
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    link.drop_link();
    {
        let link = link.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            link.connect();
        });
    }

    let result = pending.await.unwrap().unwrap();
    assert_eq!(result, json!({ "result": 3 }));

    let seen = drain_events(&mut events);
    assert!(send_failure_count(&seen) >= 1, "expected MessageSendFailure");
}

/// Persistent encode failure: heartbeats stop reaching the server, the
/// session dies at grace on both sides, and recovery mints fresh ids. The
/// rpc stranded in the dead session's buffer is never delivered.
#[tokio::test(start_paused = true)]
async fn persistent_heartbeat_failure_kills_session_at_grace() {
    let (client, _server, link, failures) = start_pair();
    let mut events = client.subscribe();
    link.connect();

    let warm = client.rpc("math", "add", json!({ "n": 1 })).await.unwrap();
    assert_eq!(warm, json!({ "result": 1 }));

    failures.fail_all_encodes(true);
    let err = client.rpc("math", "add", json!({ "n": 2 })).await.unwrap_err();
    assert_eq!(err.code, error_codes::UNEXPECTED_DISCONNECT);

    failures.fail_all_encodes(false);
    link.connect();
    let after = client.rpc("math", "add", json!({ "n": 5 })).await.unwrap();
    // 1 + 5: the stranded add(2) must never have been applied.
    assert_eq!(after, json!({ "result": 6 }));

    let seen = drain_events(&mut events);
    assert!(send_failure_count(&seen) >= 1, "expected MessageSendFailure");
    let connected_ids: Vec<_> = seen
        .iter()
        .filter_map(|event| match event {
            RiverEvent::SessionTransition { session_id, state }
                if *state == SessionStateKind::Connected =>
            {
                Some(session_id.clone())
            }
            _ => None,
        })
        .collect();
    assert_eq!(connected_ids.len(), 2, "one id per session");
    assert_ne!(connected_ids[0], connected_ids[1], "ids must be fresh");
}

/// Encode failure during the handshake itself: no session is established,
/// and the client retries with a new session once encoding recovers.
#[tokio::test(start_paused = true)]
async fn handshake_encode_failure_prevents_establishment() {
    let (client, _server, link, failures) = start_pair();
    let mut events = client.subscribe();

    failures.fail_all_encodes(true);
    link.connect();
    // Give the failed handshake attempt time to happen and tear the
    // connection down.
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    let seen = drain_events(&mut events);
    assert!(send_failure_count(&seen) >= 1, "expected MessageSendFailure");
    assert!(
        !seen.iter().any(|event| matches!(
            event,
            RiverEvent::SessionTransition {
                state: SessionStateKind::Connected,
                ..
            }
        )),
        "no session may establish through a failing encoder"
    );

    failures.fail_all_encodes(false);
    link.connect();
    let result = client.rpc("math", "add", json!({ "n": 4 })).await.unwrap();
    assert_eq!(result, json!({ "result": 4 }));
}
