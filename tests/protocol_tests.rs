//! End-to-end protocol sessions over TCP

mod common;

use common::{error_code, result_text, test_config, TestClient, TestServer, TEST_TOKEN};
use dbws_mcp::mcp::protocol::ToolsCallResult;
use dbws_mcp::registry::{handler_fn, InputSchema, PropertyType, RegistryError, ToolDescriptor};
use dbws_mcp::ToolRegistry;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Registry with a counting `add` tool and a `crash` tool that panics.
fn stub_registry(calls: Arc<AtomicUsize>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry
        .register(ToolDescriptor::new(
            "add",
            "Adds two integers",
            InputSchema::empty()
                .required("a", PropertyType::Integer, "First operand")
                .required("b", PropertyType::Integer, "Second operand"),
            handler_fn(move |args, _ctx| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let sum = args["a"].as_i64().unwrap_or(0) + args["b"].as_i64().unwrap_or(0);
                    Ok(ToolsCallResult::text(sum.to_string()))
                }
            }),
        ))
        .unwrap();
    registry
        .register(ToolDescriptor::new(
            "crash",
            "Always panics",
            InputSchema::empty(),
            handler_fn(|_args, _ctx| async move {
                if true {
                    panic!("simulated handler bug");
                }
                Ok(ToolsCallResult::text("unreachable"))
            }),
        ))
        .unwrap();
    registry
}

async fn start_default() -> (TestServer, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let server = TestServer::start(test_config(), stub_registry(calls.clone())).await;
    (server, calls)
}

#[tokio::test]
async fn test_initialize_and_list_tools() {
    let (server, _) = start_default().await;
    let mut client = server.connect().await;

    let init = client.initialize(Some(TEST_TOKEN)).await;
    assert_eq!(init["result"]["protocolVersion"], "2025-06-18");
    assert_eq!(init["result"]["serverInfo"]["name"], "dbws-mcp");
    assert!(init["result"]["capabilities"]["tools"].is_object());

    let list = client.request(1, "tools/list", json!({})).await;
    let tools = list["result"]["tools"].as_array().unwrap();
    let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["add", "crash"]);

    let schema = &tools[0]["inputSchema"];
    assert_eq!(schema["type"], "object");
    assert_eq!(schema["properties"]["a"]["type"], "integer");
    assert_eq!(schema["required"], json!(["a", "b"]));

    server.shutdown().await;
}

#[tokio::test]
async fn test_unsupported_protocol_version_gets_latest() {
    let (server, _) = start_default().await;
    let mut client = server.connect().await;

    let init = client
        .request(
            1,
            "initialize",
            json!({"protocolVersion": "1999-01-01", "authToken": TEST_TOKEN}),
        )
        .await;
    assert_eq!(init["result"]["protocolVersion"], "2025-06-18");

    server.shutdown().await;
}

#[tokio::test]
async fn test_requires_initialize_first() {
    let (server, calls) = start_default().await;
    let mut client = server.connect().await;

    let response = client.call_tool(1, "add", json!({"a": 1, "b": 2})).await;
    assert_eq!(error_code(&response), -32002);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let ping = client.request(2, "ping", json!({})).await;
    assert_eq!(ping["result"], json!({}));

    client.initialize(Some(TEST_TOKEN)).await;
    let response = client.call_tool(3, "add", json!({"a": 1, "b": 2})).await;
    assert_eq!(result_text(&response), "3");

    server.shutdown().await;
}

#[tokio::test]
async fn test_notifications_get_no_response() {
    let (server, _) = start_default().await;
    let mut client = server.connect().await;
    client.initialize(Some(TEST_TOKEN)).await;

    client.notify("notifications/cancelled").await;
    client
        .send(&json!({"jsonrpc": "2.0", "method": "tools/list", "id": null}))
        .await;
    client.notify("no/such/method").await;

    // The next line on the wire answers this request, not the notifications
    let ping = client.request(7, "ping", json!({})).await;
    assert_eq!(ping["id"], 7);

    server.shutdown().await;
}

#[tokio::test]
async fn test_pipelined_requests_answered_in_order() {
    let (server, _) = start_default().await;
    let mut client = server.connect().await;
    client.initialize(Some(TEST_TOKEN)).await;

    for id in 1..=20 {
        client
            .send(&json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": "tools/call",
                "params": {"name": "add", "arguments": {"a": id, "b": 1}},
            }))
            .await;
    }
    for id in 1..=20i64 {
        let response = client.recv().await;
        assert_eq!(response["id"], id);
        assert_eq!(result_text(&response), (id + 1).to_string());
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_string_ids_are_echoed() {
    let (server, _) = start_default().await;
    let mut client = server.connect().await;
    client.initialize(Some(TEST_TOKEN)).await;

    client
        .send(&json!({"jsonrpc": "2.0", "id": "req-abc", "method": "ping"}))
        .await;
    let response = client.recv().await;
    assert_eq!(response["id"], "req-abc");
    assert_eq!(response["jsonrpc"], "2.0");

    server.shutdown().await;
}

#[tokio::test]
async fn test_invalid_arguments_never_reach_handler() {
    let (server, calls) = start_default().await;
    let mut client = server.connect().await;
    client.initialize(Some(TEST_TOKEN)).await;

    let missing = client.call_tool(1, "add", json!({"a": 1})).await;
    assert_eq!(error_code(&missing), -32602);
    assert!(missing["error"]["message"].as_str().unwrap().contains('b'));

    let wrong_type = client.call_tool(2, "add", json!({"a": "one", "b": 2})).await;
    assert_eq!(error_code(&wrong_type), -32602);

    let not_object = client.call_tool(3, "add", json!([1, 2])).await;
    assert_eq!(error_code(&not_object), -32602);

    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let ok = client.call_tool(4, "add", json!({"a": 1, "b": 2, "extra": true})).await;
    assert_eq!(result_text(&ok), "3");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_unknown_tool_and_method() {
    let (server, _) = start_default().await;
    let mut client = server.connect().await;
    client.initialize(Some(TEST_TOKEN)).await;

    let tool = client.call_tool(1, "nope", json!({})).await;
    assert_eq!(error_code(&tool), -32601);

    let method = client.request(2, "sampling/createMessage", json!({})).await;
    assert_eq!(error_code(&method), -32601);

    let resources = client.request(3, "resources/list", json!({})).await;
    assert_eq!(resources["result"]["resources"], json!([]));
    let prompts = client.request(4, "prompts/list", json!({})).await;
    assert_eq!(prompts["result"]["prompts"], json!([]));

    server.shutdown().await;
}

#[tokio::test]
async fn test_parse_error_keeps_connection_open() {
    let (server, _) = start_default().await;
    let mut client = server.connect().await;

    client.send_raw("{not json").await;
    let response = client.recv().await;
    assert_eq!(error_code(&response), -32700);
    assert_eq!(response["id"], Value::Null);

    client.send_raw(r#"{"jsonrpc":"1.0","id":5,"method":"ping"}"#).await;
    let response = client.recv().await;
    assert_eq!(error_code(&response), -32600);
    assert_eq!(response["id"], 5);

    let init = client.initialize(Some(TEST_TOKEN)).await;
    assert!(init["result"].is_object());

    server.shutdown().await;
}

#[tokio::test]
async fn test_panicking_handler_is_isolated() {
    let (server, _) = start_default().await;
    let mut client = server.connect().await;
    client.initialize(Some(TEST_TOKEN)).await;

    let crashed = client.call_tool(1, "crash", json!({})).await;
    assert_eq!(error_code(&crashed), -32005);
    let message = crashed["error"]["message"].as_str().unwrap();
    assert!(!message.contains("simulated handler bug"));

    let ok = client.call_tool(2, "add", json!({"a": 2, "b": 2})).await;
    assert_eq!(result_text(&ok), "4");

    let snapshot = server.server.dispatcher().metrics().snapshot();
    assert_eq!(snapshot.tools["crash"].errors, 1);
    assert_eq!(snapshot.tools["add"].count, 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_rate_limit_rejects_after_quota() {
    let mut config = test_config();
    // `notifications/initialized` uses one slot of the window
    config.rate_limiting.requests_per_window = 4;
    config.rate_limiting.window_seconds = 60;
    let calls = Arc::new(AtomicUsize::new(0));
    let server = TestServer::start(config, stub_registry(calls.clone())).await;
    let mut client = server.connect().await;
    client.initialize(Some(TEST_TOKEN)).await;

    for id in 1..=3 {
        let response = client.call_tool(id, "add", json!({"a": 1, "b": 1})).await;
        assert_eq!(result_text(&response), "2");
    }

    for id in 4..=5 {
        let limited = client.call_tool(id, "add", json!({"a": 1, "b": 1})).await;
        assert_eq!(error_code(&limited), -32003);
        let retry_after = limited["error"]["data"]["retry_after_secs"].as_u64().unwrap();
        assert!((1..=60).contains(&retry_after));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // The quota follows the token, not the connection. `initialize` itself
    // is never limited.
    let mut second = server.connect().await;
    let init = second.initialize(Some(TEST_TOKEN)).await;
    assert!(init["result"].is_object());
    let limited = second.request(1, "ping", json!({})).await;
    assert_eq!(error_code(&limited), -32003);

    // Two rejected calls, the second client's notification and its ping
    assert_eq!(server.server.dispatcher().metrics().snapshot().rate_limited, 4);

    server.shutdown().await;
}

#[tokio::test]
async fn test_auth_failures_lock_out_address() {
    let mut config = test_config();
    config.security.max_failed_attempts = 2;
    config.security.block_duration_secs = 300;
    let (calls, registry) = {
        let calls = Arc::new(AtomicUsize::new(0));
        (calls.clone(), stub_registry(calls))
    };
    let server = TestServer::start(config, registry).await;
    let mut client = server.connect().await;

    let missing = client.initialize(None).await;
    assert_eq!(error_code(&missing), -32001);

    // Still not initialized after a failed handshake
    let call = client.call_tool(1, "add", json!({"a": 1, "b": 1})).await;
    assert_eq!(error_code(&call), -32002);

    let wrong = client.initialize(Some("wrong-token")).await;
    assert_eq!(error_code(&wrong), -32001);

    // Locked out now, even with the right token and a new connection
    let mut retry = server.connect().await;
    let blocked = retry.initialize(Some(TEST_TOKEN)).await;
    assert_eq!(error_code(&blocked), -32001);
    let message = blocked["error"]["message"].as_str().unwrap();
    assert!(!message.contains(TEST_TOKEN));

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(server.server.dispatcher().metrics().snapshot().auth_failures, 3);

    server.shutdown().await;
}

#[tokio::test]
async fn test_auth_disabled_accepts_any_client() {
    let mut config = test_config();
    config.security.auth_enabled = false;
    config.security.auth_token = None;
    let (calls, registry) = {
        let calls = Arc::new(AtomicUsize::new(0));
        (calls.clone(), stub_registry(calls))
    };
    let server = TestServer::start(config, registry).await;
    let mut client = server.connect().await;

    let init = client.initialize(None).await;
    assert!(init["result"].is_object());
    let response = client.call_tool(1, "add", json!({"a": 5, "b": 5})).await;
    assert_eq!(result_text(&response), "10");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_per_request_auth() {
    let mut config = test_config();
    config.security.per_request_auth = true;
    let calls = Arc::new(AtomicUsize::new(0));
    let server = TestServer::start(config, stub_registry(calls)).await;
    let mut client = server.connect().await;
    client.initialize(Some(TEST_TOKEN)).await;

    let without = client.request(1, "ping", json!({})).await;
    assert_eq!(error_code(&without), -32001);

    client
        .send(&json!({"jsonrpc": "2.0", "id": 2, "method": "ping", "auth_token": TEST_TOKEN}))
        .await;
    let with = client.recv().await;
    assert_eq!(with["result"], json!({}));

    server.shutdown().await;
}

#[tokio::test]
async fn test_second_initialize_rejected() {
    let (server, _) = start_default().await;
    let mut client = server.connect().await;
    client.initialize(Some(TEST_TOKEN)).await;

    let again = client.initialize(Some(TEST_TOKEN)).await;
    assert_eq!(error_code(&again), -32600);

    server.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_request_closes_connection() {
    let (server, _) = start_default().await;
    let mut client = server.connect().await;
    client.initialize(Some(TEST_TOKEN)).await;
    server.wait_for_sessions(1).await;

    let response = client.request(1, "shutdown", json!({})).await;
    assert_eq!(response["result"], json!({}));
    assert!(client.try_recv().await.is_none());
    server.wait_for_sessions(0).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_sessions_tracked_per_connection() {
    let (server, _) = start_default().await;

    let mut first = server.connect().await;
    first.initialize(Some(TEST_TOKEN)).await;
    let mut second = server.connect().await;
    second.initialize(Some(TEST_TOKEN)).await;
    server.wait_for_sessions(2).await;

    drop(first);
    server.wait_for_sessions(1).await;

    let ping = second.request(1, "ping", json!({})).await;
    assert_eq!(ping["result"], json!({}));

    server.shutdown().await;
}

#[tokio::test]
async fn test_connection_limit() {
    let mut config = test_config();
    config.server.max_connections = 1;
    let server = TestServer::start(config, stub_registry(Arc::new(AtomicUsize::new(0)))).await;

    let mut first = server.connect().await;
    first.initialize(Some(TEST_TOKEN)).await;
    server.wait_for_sessions(1).await;

    let mut extra = TestClient::connect(server.addr).await;
    assert!(extra.try_recv().await.is_none());
    assert_eq!(server.active_sessions(), 1);

    // The first connection is unaffected
    let ping = first.request(1, "ping", json!({})).await;
    assert_eq!(ping["result"], json!({}));

    // Its slot frees up once it disconnects. The permit is released just
    // after the session is removed, so a reconnect may briefly still bounce.
    drop(first);
    server.wait_for_sessions(0).await;
    let mut accepted = false;
    for _ in 0..50 {
        let mut next = server.connect().await;
        next.send(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {"authToken": TEST_TOKEN},
        }))
        .await;
        if let Some(init) = next.try_recv().await {
            assert!(init["result"].is_object());
            accepted = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(accepted, "slot was never released");

    server.shutdown().await;
}

#[test]
fn test_duplicate_tool_registration_fails() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = stub_registry(calls);
    let duplicate = ToolDescriptor::new(
        "add",
        "Another add",
        InputSchema::empty(),
        handler_fn(|_args, _ctx| async move { Ok(ToolsCallResult::text("")) }),
    );

    assert_eq!(
        registry.register(duplicate),
        Err(RegistryError::DuplicateTool("add".to_string()))
    );
    assert_eq!(registry.names(), vec!["add", "crash"]);
}
