//! MCP server implementation
//!
//! Newline-delimited JSON-RPC over TCP (one task per connection) or over
//! stdin/stdout for a single local client. Each connection reads and
//! dispatches messages one at a time, so responses leave in request order;
//! a writer task drains a bounded queue onto the socket.

use crate::config::ServerConfig;
use crate::mcp::dispatcher::Dispatcher;
use crate::mcp::protocol::McpResponse;
use crate::types::McpError;
use anyhow::{Context, Result};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outbound messages buffered per connection before the reader waits.
const OUTPUT_QUEUE_CAPACITY: usize = 64;

/// How often idle sessions and stale limiter state are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct ConnectionOptions {
    idle_timeout: Duration,
    shutdown_grace: Duration,
    max_message_bytes: usize,
}

pub struct McpServer {
    config: Arc<ServerConfig>,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
}

impl McpServer {
    pub fn new(config: ServerConfig, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            config: Arc::new(config),
            dispatcher,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Cancelling this token stops the accept loop and closes every
    /// connection once in-flight calls finish or the grace period runs out.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn options(&self) -> ConnectionOptions {
        ConnectionOptions {
            idle_timeout: self.config.idle_timeout(),
            shutdown_grace: self.config.shutdown_grace(),
            max_message_bytes: self.config.limits.max_message_bytes,
        }
    }

    /// Serve according to the configuration: stdio or TCP.
    pub async fn run(&self) -> Result<()> {
        if self.config.server.stdio {
            return self.run_stdio().await;
        }

        let address = self.config.bind_address();
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("Failed to bind {}", address))?;
        self.serve(listener).await
    }

    /// Serve one client over stdin/stdout until it disconnects.
    pub async fn run_stdio(&self) -> Result<()> {
        info!("MCP server starting on stdio");
        self.serve_stream(tokio::io::stdin(), tokio::io::stdout(), "stdio".to_string())
            .await;
        info!("Client closed connection");
        Ok(())
    }

    /// Accept loop over an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr()?;
        let max_connections = self.config.server.max_connections;
        info!(address = %local, max_connections, "MCP server listening");

        let slots = Arc::new(Semaphore::new(max_connections));
        let mut connections = JoinSet::new();
        let sweeper = self.spawn_sweeper();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };

                    let Ok(permit) = slots.clone().try_acquire_owned() else {
                        warn!(remote = %peer, max_connections, "Connection limit reached, closing new connection");
                        drop(stream);
                        continue;
                    };

                    let _ = stream.set_nodelay(true);
                    let (reader, writer) = stream.into_split();
                    let dispatcher = self.dispatcher.clone();
                    let options = self.options();
                    let shutdown = self.shutdown.clone();
                    let remote = peer.ip().to_string();

                    connections.spawn(async move {
                        handle_connection(dispatcher, options, shutdown, reader, writer, remote).await;
                        drop(permit);
                    });
                }
            }
        }

        sweeper.abort();

        // Connections apply the grace period themselves; allow a little slack
        let drain = self.config.shutdown_grace() + Duration::from_secs(1);
        if tokio::time::timeout(drain, async { while connections.join_next().await.is_some() {} })
            .await
            .is_err()
        {
            warn!(remaining = connections.len(), "Abandoning connections after grace period");
            connections.abort_all();
        }

        info!("MCP server stopped");
        Ok(())
    }

    /// Run the protocol over an arbitrary byte stream pair until the peer
    /// closes it, it idles out, or the server shuts down.
    pub async fn serve_stream<R, W>(&self, reader: R, writer: W, remote: String)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        handle_connection(
            self.dispatcher.clone(),
            self.options(),
            self.shutdown.clone(),
            reader,
            writer,
            remote,
        )
        .await;
    }

    fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let dispatcher = self.dispatcher.clone();
        let idle_timeout = self.config.idle_timeout();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => dispatcher.sweep(idle_timeout),
                }
            }
        })
    }
}

async fn handle_connection<R, W>(
    dispatcher: Arc<Dispatcher>,
    options: ConnectionOptions,
    shutdown: CancellationToken,
    reader: R,
    writer: W,
    remote: String,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut conn = dispatcher.open(&remote);
    let (out_tx, out_rx) = mpsc::channel::<String>(OUTPUT_QUEUE_CAPACITY);
    let writer_task = tokio::spawn(write_loop(writer, out_rx));
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(options.max_message_bytes));
    // FramedRead yields one `None` after a decode error before reading on
    let mut after_decode_error = false;

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(session_id = %conn.session_id(), "Closing connection for server shutdown");
                break;
            }
            next = tokio::time::timeout(options.idle_timeout, lines.next()) => next,
        };

        let line = match next {
            Err(_) => {
                info!(
                    session_id = %conn.session_id(),
                    idle_secs = options.idle_timeout.as_secs(),
                    "Closing idle connection"
                );
                break;
            }
            Ok(None) if after_decode_error => {
                after_decode_error = false;
                continue;
            }
            Ok(None) => break,
            Ok(Some(Ok(line))) => {
                after_decode_error = false;
                line
            }
            Ok(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => {
                after_decode_error = true;
                dispatcher.record_activity(&conn);
                warn!(session_id = %conn.session_id(), limit = options.max_message_bytes, "Message too large");
                let err = McpError::InvalidRequest(format!(
                    "Message exceeds {} bytes",
                    options.max_message_bytes
                ));
                if !enqueue(&out_tx, &McpResponse::error(None, &err)).await {
                    break;
                }
                continue;
            }
            Ok(Some(Err(LinesCodecError::Io(e)))) => {
                warn!(session_id = %conn.session_id(), error = %e, "Transport read failed");
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            dispatcher.record_activity(&conn);
            continue;
        }

        let handled = tokio::select! {
            biased;
            response = dispatcher.handle_line(&mut conn, line) => Some(response),
            _ = grace_expired(&shutdown, options.shutdown_grace) => None,
        };

        let Some(response) = handled else {
            warn!(session_id = %conn.session_id(), "Abandoned in-flight request after shutdown grace period");
            break;
        };

        if let Some(response) = response {
            if !enqueue(&out_tx, &response).await {
                break;
            }
        }

        if conn.is_closing() {
            break;
        }
    }

    dispatcher.close(&mut conn);

    // Closing the queue lets the writer flush what is left and exit
    drop(out_tx);
    if let Err(e) = writer_task.await {
        error!(error = %e, "Writer task failed");
    }
}

/// Resolves `grace` after shutdown has been requested.
async fn grace_expired(shutdown: &CancellationToken, grace: Duration) {
    shutdown.cancelled().await;
    tokio::time::sleep(grace).await;
}

async fn enqueue(out_tx: &mpsc::Sender<String>, response: &McpResponse) -> bool {
    match serde_json::to_string(response) {
        Ok(json) => out_tx.send(json).await.is_ok(),
        Err(e) => {
            error!(error = %e, "Failed to serialize response");
            true
        }
    }
}

/// Background task writing queued messages, one per line.
async fn write_loop<W>(mut writer: W, mut out_rx: mpsc::Receiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = out_rx.recv().await {
        if let Err(e) = writer.write_all(message.as_bytes()).await {
            warn!(error = %e, "Failed to write message");
            break;
        }
        if let Err(e) = writer.write_all(b"\n").await {
            warn!(error = %e, "Failed to write message");
            break;
        }
        if let Err(e) = writer.flush().await {
            warn!(error = %e, "Failed to flush");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecuritySettings;
    use crate::metrics::MetricsCollector;
    use crate::registry::ToolRegistry;
    use crate::security::{AuthGuard, RateLimiter};
    use crate::session::SessionStore;
    use serde_json::Value;
    use tokio::io::{AsyncBufReadExt, BufReader};

    fn server(config: ServerConfig) -> McpServer {
        let dispatcher = Dispatcher::new(
            Arc::new(ToolRegistry::new()),
            Arc::new(SessionStore::new()),
            Arc::new(AuthGuard::new(&SecuritySettings {
                auth_enabled: false,
                ..Default::default()
            })),
            Arc::new(RateLimiter::new(100, Duration::from_secs(60))),
            Arc::new(MetricsCollector::new()),
        );
        McpServer::new(config, Arc::new(dispatcher))
    }

    #[tokio::test]
    async fn test_idle_connection_is_closed() {
        let mut config = ServerConfig::default();
        config.server.idle_timeout_secs = 1;
        let server = server(config);

        let (client, server_side) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(server_side);
        let started = std::time::Instant::now();
        server.serve_stream(reader, writer, "127.0.0.1".to_string()).await;

        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(server.dispatcher().sessions().active_count(), 0);
        drop(client);
    }

    #[tokio::test]
    async fn test_oversized_message_rejected_and_connection_survives() {
        let mut config = ServerConfig::default();
        config.limits.max_message_bytes = 64;
        let server = Arc::new(server(config));

        let (client, server_side) = tokio::io::duplex(16 * 1024);
        let (reader, writer) = tokio::io::split(server_side);
        let task = {
            let server = server.clone();
            tokio::spawn(async move { server.serve_stream(reader, writer, "127.0.0.1".to_string()).await })
        };

        let (client_read, mut client_write) = tokio::io::split(client);
        let mut responses = BufReader::new(client_read).lines();

        let big = format!("{{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"{}\"}}\n", "x".repeat(200));
        client_write.write_all(big.as_bytes()).await.unwrap();
        client_write
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"ping\"}\n")
            .await
            .unwrap();

        let first: Value = serde_json::from_str(&responses.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(first["error"]["code"], crate::types::INVALID_REQUEST);
        let second: Value = serde_json::from_str(&responses.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(second["id"], 2);

        client_write.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_blank_and_oversized_lines_count_as_activity() {
        let mut config = ServerConfig::default();
        config.limits.max_message_bytes = 64;
        let server = Arc::new(server(config));

        let (client, server_side) = tokio::io::duplex(16 * 1024);
        let (reader, writer) = tokio::io::split(server_side);
        let task = {
            let server = server.clone();
            tokio::spawn(async move { server.serve_stream(reader, writer, "127.0.0.1".to_string()).await })
        };

        let (client_read, mut client_write) = tokio::io::split(client);
        let mut responses = BufReader::new(client_read).lines();

        tokio::time::sleep(Duration::from_millis(250)).await;
        let big = format!("\n\n{}\n", "x".repeat(200));
        client_write.write_all(big.as_bytes()).await.unwrap();
        let rejected: Value = serde_json::from_str(&responses.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(rejected["error"]["code"], crate::types::INVALID_REQUEST);

        let sessions = server.dispatcher().sessions().list();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].idle_for(chrono::Utc::now()) < Duration::from_millis(200));
        assert_eq!(sessions[0].request_count, 0);

        client_write.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_token_stops_accept_loop() {
        let server = Arc::new(server(ServerConfig::default()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let token = server.shutdown_token();

        let task = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), task).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}
