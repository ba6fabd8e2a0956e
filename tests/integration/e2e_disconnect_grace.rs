//! Grace-period behavior: operations started while a session is pending
//! reconnect succeed if the transport comes back in time, and resolve with
//! UNEXPECTED_DISCONNECT once the grace deadline lapses — across all four
//! procedure shapes. A destroyed session is replaced by a fresh one with
//! fresh ids on the next activity.

use std::sync::Arc;
use std::time::Duration;

use river::protocol::error_codes;
use river::{
    Client, ClientOptions, JsonCodec, RiverEvent, Server, ServerOptions, ServiceRegistry,
    SessionConfig, SessionStateKind,
};
use river_test_utils::{LinkHandle, memory_transport_pair};
use river_test_utils::services::{
    echo_service, math_service, subscribable_service, upload_service,
};
use serde_json::json;

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

fn start_pair() -> (Client, Server, LinkHandle) {
    let (client_transport, client_events, hub, hub_events, link) =
        memory_transport_pair("client-1", "SERVER");
    let registry = ServiceRegistry::new()
        .service(math_service())
        .service(echo_service())
        .service(upload_service())
        .service(subscribable_service());
    let server = Server::start(
        hub,
        hub_events,
        Arc::new(JsonCodec),
        registry,
        ServerOptions {
            session: session_config(),
            ..ServerOptions::default()
        },
    );
    let client = Client::start(
        Arc::new(client_transport),
        client_events,
        Arc::new(JsonCodec),
        ClientOptions {
            client_id: "client-1".to_owned(),
            session: session_config(),
            ..ClientOptions::default()
        },
    );
    link.connect();
    (client, server, link)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// An rpc issued during PendingReconnect succeeds when the link returns
/// inside the grace window.
#[tokio::test(start_paused = true)]
async fn rpc_during_pending_reconnect_succeeds_on_resume() {
    let (client, _server, link) = start_pair();

    let warm = client.rpc("math", "add", json!({ "n": 1 })).await.unwrap();
    assert_eq!(warm, json!({ "result": 1 }));

    link.drop_link();
    {
        let link = link.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            link.connect();
        });
    }

    let result = client.rpc("math", "add", json!({ "n": 2 })).await.unwrap();
    assert_eq!(result, json!({ "result": 3 }));
}

/// The disconnect-during-rpc scenario: with no reconnect, the pending rpc
/// resolves to UNEXPECTED_DISCONNECT at grace expiry.
#[tokio::test(start_paused = true)]
async fn rpc_fails_with_unexpected_disconnect_after_grace() {
    let (client, _server, link) = start_pair();

    let warm = client.rpc("math", "add", json!({ "n": 1 })).await.unwrap();
    assert_eq!(warm, json!({ "result": 1 }));

    link.drop_link();
    let err = client.rpc("math", "add", json!({ "n": 2 })).await.unwrap_err();
    assert_eq!(err.code, error_codes::UNEXPECTED_DISCONNECT);
}

/// Disconnect during an open bidirectional stream: the reader observes
/// exactly one UNEXPECTED_DISCONNECT.
#[tokio::test(start_paused = true)]
async fn stream_aborts_after_grace() {
    let (client, _server, link) = start_pair();

    let (writer, mut reader, _cancel) =
        client.stream("echo", "echo", json!({})).await.unwrap();
    writer.write(json!({ "msg": "a", "ignore": false })).unwrap();
    assert_eq!(reader.next().await, Some(Ok(json!({ "response": "a" }))));

    link.drop_link();
    match reader.next().await {
        Some(Err(error)) => assert_eq!(error.code, error_codes::UNEXPECTED_DISCONNECT),
        other => panic!("expected UNEXPECTED_DISCONNECT, got {other:?}"),
    }
    assert_eq!(reader.next().await, None);
}

/// Disconnect during a subscription: same single terminal error.
#[tokio::test(start_paused = true)]
async fn subscription_aborts_after_grace() {
    let (client, _server, link) = start_pair();

    let (mut reader, _cancel) = client
        .subscription("subscribable", "ticker", json!({}))
        .await
        .unwrap();
    // At least one tick proves the subscription is live.
    match reader.next().await {
        Some(Ok(value)) => assert!(value.get("tick").is_some()),
        other => panic!("expected a tick, got {other:?}"),
    }

    link.drop_link();
    loop {
        match reader.next().await {
            // Ticks already in flight may drain first.
            Some(Ok(_)) => {}
            Some(Err(error)) => {
                assert_eq!(error.code, error_codes::UNEXPECTED_DISCONNECT);
                break;
            }
            None => panic!("stream ended without a terminal error"),
        }
    }
    assert_eq!(reader.next().await, None);
}

/// Disconnect during an upload: the pending response resolves to
/// UNEXPECTED_DISCONNECT.
#[tokio::test(start_paused = true)]
async fn upload_fails_after_grace() {
    let (client, _server, link) = start_pair();

    let (writer, response) = client.upload("upload", "add_all", json!({})).await.unwrap();
    writer.write(json!({ "n": 1 })).unwrap();

    link.drop_link();
    // Writes during PendingReconnect buffer without error.
    writer.write(json!({ "n": 2 })).unwrap();

    let err = response.finish().await.unwrap_err();
    assert_eq!(err.code, error_codes::UNEXPECTED_DISCONNECT);
}

/// After expiry, the next activity establishes a fresh session with
/// different ids.
#[tokio::test(start_paused = true)]
async fn fresh_session_ids_after_expiry() {
    let (client, _server, link) = start_pair();
    let mut events = client.subscribe();

    let warm = client.rpc("math", "add", json!({ "n": 1 })).await.unwrap();
    assert_eq!(warm, json!({ "result": 1 }));

    link.drop_link();
    let err = client.rpc("math", "add", json!({ "n": 1 })).await.unwrap_err();
    assert_eq!(err.code, error_codes::UNEXPECTED_DISCONNECT);

    link.connect();
    // Server state survives (same server), session is new.
    let after = client.rpc("math", "add", json!({ "n": 5 })).await.unwrap();
    assert_eq!(after, json!({ "result": 6 }));

    let mut connected_ids = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let RiverEvent::SessionTransition { session_id, state } = event {
            if state == SessionStateKind::Connected {
                connected_ids.push(session_id);
            }
        }
    }
    assert_eq!(connected_ids.len(), 2, "one id per session");
    assert_ne!(connected_ids[0], connected_ids[1], "ids must be fresh");
}
