//! Shared helpers for integration tests: a server on an ephemeral port and
//! a line-oriented JSON-RPC client.

#![allow(dead_code)]

use dbws_mcp::config::ServerConfig;
use dbws_mcp::metrics::MetricsCollector;
use dbws_mcp::security::{AuthGuard, RateLimiter};
use dbws_mcp::session::SessionStore;
use dbws_mcp::{Dispatcher, McpServer, ToolRegistry};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const TEST_TOKEN: &str = "test-token-123";

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for tests: loopback, auth on with [`TEST_TOKEN`].
pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.server.host = "127.0.0.1".to_string();
    config.security.auth_token = Some(TEST_TOKEN.to_string());
    config.server.shutdown_grace_secs = 1;
    config
}

/// Dispatcher over a caller-supplied registry, configured from `config`.
pub fn dispatcher(config: &ServerConfig, registry: ToolRegistry) -> Dispatcher {
    let auth = if config.security.auth_enabled {
        AuthGuard::new(&config.security)
    } else {
        AuthGuard::disabled()
    };
    Dispatcher::new(
        Arc::new(registry),
        Arc::new(SessionStore::new()),
        Arc::new(auth),
        Arc::new(RateLimiter::new(
            config.rate_limiting.requests_per_window,
            config.rate_limit_window(),
        )),
        Arc::new(MetricsCollector::new()),
    )
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub server: Arc<McpServer>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    pub async fn start(config: ServerConfig, registry: ToolRegistry) -> Self {
        let dispatcher = dispatcher(&config, registry);
        Self::spawn(McpServer::new(config, Arc::new(dispatcher))).await
    }

    pub async fn spawn(server: McpServer) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(server);
        let task = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };
        Self { addr, server, task }
    }

    pub async fn connect(&self) -> TestClient {
        TestClient::connect(self.addr).await
    }

    pub fn active_sessions(&self) -> usize {
        self.server.dispatcher().sessions().active_count()
    }

    /// Wait until the active session count reaches `expected`.
    pub async fn wait_for_sessions(&self, expected: usize) {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        while self.active_sessions() != expected {
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {} sessions, have {}",
                expected,
                self.active_sessions()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn shutdown(self) {
        self.server.shutdown_token().cancel();
        let result = tokio::time::timeout(Duration::from_secs(10), self.task).await;
        assert!(matches!(result, Ok(Ok(Ok(())))), "server did not stop cleanly");
    }
}

pub struct TestClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    pub async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    pub async fn send(&mut self, message: &Value) {
        self.send_raw(&message.to_string()).await;
    }

    pub async fn notify(&mut self, method: &str) {
        self.send(&json!({"jsonrpc": "2.0", "method": method})).await;
    }

    /// Next response, or `None` once the server closed the connection.
    pub async fn try_recv(&mut self) -> Option<Value> {
        let line = tokio::time::timeout(RECV_TIMEOUT, self.lines.next_line())
            .await
            .expect("timed out waiting for a response")
            .ok()??;
        Some(serde_json::from_str(&line).unwrap())
    }

    pub async fn recv(&mut self) -> Value {
        self.try_recv().await.expect("connection closed")
    }

    pub async fn request(&mut self, id: i64, method: &str, params: Value) -> Value {
        self.send(&json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}))
            .await;
        let response = self.recv().await;
        assert_eq!(response["id"], id, "response out of order: {}", response);
        response
    }

    pub async fn initialize(&mut self, token: Option<&str>) -> Value {
        let mut params = json!({
            "protocolVersion": "2025-06-18",
            "capabilities": {},
            "clientInfo": {"name": "integration-test", "version": "1.0"},
        });
        if let Some(token) = token {
            params["authToken"] = json!(token);
        }
        let response = self.request(0, "initialize", params).await;
        if response.get("result").is_some() {
            self.notify("notifications/initialized").await;
        }
        response
    }

    pub async fn call_tool(&mut self, id: i64, name: &str, arguments: Value) -> Value {
        self.request(id, "tools/call", json!({"name": name, "arguments": arguments}))
            .await
    }
}

pub fn error_code(response: &Value) -> i64 {
    response["error"]["code"]
        .as_i64()
        .unwrap_or_else(|| panic!("expected an error response, got {}", response))
}

pub fn result_text(response: &Value) -> String {
    response["result"]["content"][0]["text"]
        .as_str()
        .unwrap_or_else(|| panic!("expected a tool result, got {}", response))
        .to_string()
}
