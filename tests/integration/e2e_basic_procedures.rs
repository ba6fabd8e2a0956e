//! End-to-end tests for the four procedure shapes over an in-memory
//! transport: unary rpc, declared error unions, bidirectional echo,
//! client-streamed upload, and server-streamed subscription.

use std::sync::{Arc, Mutex};

use river::protocol::error_codes;
use river::{
    Client, ClientOptions, JsonCodec, ProcedureDef, Schema, Server, ServerOptions, ServiceDef,
    ServiceRegistry,
};
use river_test_utils::memory_transport_pair;
use river_test_utils::services::{
    echo_service, math_service, subscribable_service, upload_service,
};
use serde_json::json;

// ---------------------------------------------------------------------------
// Harness helpers (duplicated per suite to keep each file self-contained).
// ---------------------------------------------------------------------------

fn registry() -> ServiceRegistry {
    ServiceRegistry::new()
        .service(math_service())
        .service(echo_service())
        .service(upload_service())
        .service(subscribable_service())
}

fn start_pair() -> (Client, Server, river_test_utils::LinkHandle) {
    let (client_transport, client_events, hub, hub_events, link) =
        memory_transport_pair("client-1", "SERVER");
    let server = Server::start(
        hub,
        hub_events,
        Arc::new(JsonCodec),
        registry(),
        ServerOptions::default(),
    );
    let client = Client::start(
        Arc::new(client_transport),
        client_events,
        Arc::new(JsonCodec),
        ClientOptions {
            client_id: "client-1".to_owned(),
            ..ClientOptions::default()
        },
    );
    link.connect();
    (client, server, link)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// Unary add against shared service state: 1 then 1+2.
#[tokio::test]
async fn unary_add_accumulates_state() {
    let (client, _server, _link) = start_pair();

    let first = client.rpc("math", "add", json!({ "n": 1 })).await.unwrap();
    assert_eq!(first, json!({ "result": 1 }));

    let second = client.rpc("math", "add", json!({ "n": 2 })).await.unwrap();
    assert_eq!(second, json!({ "result": 3 }));
}

/// Declared error unions surface as a single error result with code,
/// message, and extras intact.
#[tokio::test]
async fn divide_returns_declared_error_union() {
    let (client, _server, _link) = start_pair();

    let err = client
        .rpc("math", "divide", json!({ "a": 10, "b": 0 }))
        .await
        .unwrap_err();
    assert_eq!(err.code, "DIV_BY_ZERO");
    assert_eq!(err.message, "Cannot divide by zero");
    assert_eq!(err.extras, Some(json!({ "test": "abc" })));

    let ok = client
        .rpc("math", "divide", json!({ "a": 10, "b": 2 }))
        .await
        .unwrap();
    assert_eq!(ok, json!({ "result": 5 }));
}

/// Echo stream: ignored inputs are skipped, responses arrive in write
/// order, and closing the writer ends both halves cleanly.
#[tokio::test]
async fn echo_stream_round_trip() {
    let (client, _server, _link) = start_pair();

    let (writer, mut reader, _cancel) =
        client.stream("echo", "echo", json!({})).await.unwrap();

    writer.write(json!({ "msg": "abc", "ignore": false })).unwrap();
    assert_eq!(
        reader.next().await,
        Some(Ok(json!({ "response": "abc" })))
    );

    writer.write(json!({ "msg": "skip me", "ignore": true })).unwrap();
    writer.write(json!({ "msg": "def", "ignore": false })).unwrap();
    assert_eq!(
        reader.next().await,
        Some(Ok(json!({ "response": "def" })))
    );

    writer.close();
    assert_eq!(reader.next().await, None);
}

/// Echo with an init payload: the prefix from init applies to every
/// response.
#[tokio::test]
async fn echo_prefix_uses_init_payload() {
    let (client, _server, _link) = start_pair();

    let (writer, mut reader, _cancel) = client
        .stream("echo", "echo_prefix", json!({ "prefix": "> " }))
        .await
        .unwrap();

    writer.write(json!({ "msg": "hello", "ignore": false })).unwrap();
    assert_eq!(
        reader.next().await,
        Some(Ok(json!({ "response": "> hello" })))
    );

    writer.close();
    assert_eq!(reader.next().await, None);
}

/// Upload: all writes drain into the handler after close, one response.
#[tokio::test]
async fn upload_sums_all_writes() {
    let (client, _server, _link) = start_pair();

    let (writer, response) = client.upload("upload", "add_all", json!({})).await.unwrap();
    for n in 1..=4 {
        writer.write(json!({ "n": n })).unwrap();
    }
    writer.close();

    assert_eq!(response.finish().await.unwrap(), json!({ "result": 10 }));
}

/// Upload with no writes at all still resolves once closed.
#[tokio::test]
async fn empty_upload_resolves() {
    let (client, _server, _link) = start_pair();

    let (writer, response) = client.upload("upload", "add_all", json!({})).await.unwrap();
    writer.close();
    assert_eq!(response.finish().await.unwrap(), json!({ "result": 0 }));
}

/// Subscription: the full emitted sequence arrives in order, then
/// end-of-stream.
#[tokio::test]
async fn subscription_counts_up_then_ends() {
    let (client, _server, _link) = start_pair();

    let (reader, _cancel) = client
        .subscription("subscribable", "count_up", json!({ "to": 3 }))
        .await
        .unwrap();

    let items = reader.collect().await;
    assert_eq!(
        items,
        vec![
            Ok(json!({ "n": 0 })),
            Ok(json!({ "n": 1 })),
            Ok(json!({ "n": 2 })),
        ]
    );
}

/// Handshake metadata flows through validation into the handler context.
#[tokio::test]
async fn handshake_metadata_reaches_handlers() {
    let whoami = ServiceDef::new("session_info").procedure(
        "whoami",
        ProcedureDef::rpc(
            Schema::any("init"),
            Schema::any("output"),
            Schema::any("error"),
            |ctx, _init| {
                Box::pin(async move {
                    Ok(json!({ "from": ctx.from, "metadata": ctx.metadata }))
                })
            },
        ),
    );

    let (client_transport, client_events, hub, hub_events, link) =
        memory_transport_pair("client-1", "SERVER");
    let _server = Server::start(
        hub,
        hub_events,
        Arc::new(JsonCodec),
        ServiceRegistry::new().service(whoami),
        ServerOptions {
            handshake_validate: Some(Arc::new(|metadata| {
                if metadata.get("token").and_then(|t| t.as_str()) == Some("secret") {
                    Ok(())
                } else {
                    Err("bad token".to_owned())
                }
            })),
            ..ServerOptions::default()
        },
    );
    let client = Client::start(
        Arc::new(client_transport),
        client_events,
        Arc::new(JsonCodec),
        ClientOptions {
            client_id: "client-1".to_owned(),
            metadata_construct: Some(Arc::new(|| json!({ "token": "secret" }))),
            ..ClientOptions::default()
        },
    );
    link.connect();

    let info = client.rpc("session_info", "whoami", json!({})).await.unwrap();
    assert_eq!(info["from"], json!("client-1"));
    assert_eq!(info["metadata"], json!({ "token": "secret" }));
}

/// A rejected handshake never establishes a session; pending work fails.
#[tokio::test]
async fn rejected_handshake_fails_pending_work() {
    let (client_transport, client_events, hub, hub_events, link) =
        memory_transport_pair("client-1", "SERVER");
    let _server = Server::start(
        hub,
        hub_events,
        Arc::new(JsonCodec),
        registry(),
        ServerOptions {
            handshake_validate: Some(Arc::new(|_| Err("nobody gets in".to_owned()))),
            ..ServerOptions::default()
        },
    );
    let client = Client::start(
        Arc::new(client_transport),
        client_events,
        Arc::new(JsonCodec),
        ClientOptions {
            client_id: "client-1".to_owned(),
            // Defer the handshake to the first invocation so the rejection
            // deterministically lands on a session with pending work.
            eagerly_connect: false,
            ..ClientOptions::default()
        },
    );
    link.connect();

    let err = client.rpc("math", "add", json!({ "n": 1 })).await.unwrap_err();
    assert_eq!(err.code, error_codes::UNEXPECTED_DISCONNECT);
}

/// Middlewares run before the handler, in declaration order.
#[tokio::test]
async fn middlewares_run_in_declaration_order() {
    let calls: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let first = Arc::clone(&calls);
    let second = Arc::clone(&calls);

    let (client_transport, client_events, hub, hub_events, link) =
        memory_transport_pair("client-1", "SERVER");
    let _server = Server::start(
        hub,
        hub_events,
        Arc::new(JsonCodec),
        registry(),
        ServerOptions {
            middlewares: vec![
                Arc::new(move |_ctx, init| {
                    first.lock().unwrap().push(format!("first:{}", init["n"]));
                }),
                Arc::new(move |ctx, _init| {
                    second.lock().unwrap().push(format!("second:{}", ctx.from));
                }),
            ],
            ..ServerOptions::default()
        },
    );
    let client = Client::start(
        Arc::new(client_transport),
        client_events,
        Arc::new(JsonCodec),
        ClientOptions {
            client_id: "client-1".to_owned(),
            ..ClientOptions::default()
        },
    );
    link.connect();

    let result = client.rpc("math", "add", json!({ "n": 9 })).await.unwrap();
    assert_eq!(result, json!({ "result": 9 }));
    assert_eq!(
        calls.lock().unwrap().clone(),
        vec!["first:9".to_owned(), "second:client-1".to_owned()]
    );
}

/// Two clients get isolated streams but shared service state.
#[tokio::test]
async fn concurrent_clients_share_service_state() {
    let (hub, hub_events, control) = river_test_utils::MemoryHub::new("SERVER");
    let _server = Server::start(
        hub,
        hub_events,
        Arc::new(JsonCodec),
        registry(),
        ServerOptions::default(),
    );

    let (t1, e1, link1) = control.attach("client-1");
    let (t2, e2, link2) = control.attach("client-2");
    let client1 = Client::start(
        Arc::new(t1),
        e1,
        Arc::new(JsonCodec),
        ClientOptions {
            client_id: "client-1".to_owned(),
            ..ClientOptions::default()
        },
    );
    let client2 = Client::start(
        Arc::new(t2),
        e2,
        Arc::new(JsonCodec),
        ClientOptions {
            client_id: "client-2".to_owned(),
            ..ClientOptions::default()
        },
    );
    link1.connect();
    link2.connect();

    let first = client1.rpc("math", "add", json!({ "n": 5 })).await.unwrap();
    assert_eq!(first, json!({ "result": 5 }));
    let second = client2.rpc("math", "add", json!({ "n": 7 })).await.unwrap();
    assert_eq!(second, json!({ "result": 12 }));
}
