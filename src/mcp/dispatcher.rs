//! Per-message protocol engine
//!
//! [`Dispatcher`] is shared by every connection; [`Connection`] holds the
//! per-connection state machine:
//!
//! ```text
//! Connecting --initialize--> Initialized --> Serving --shutdown/close--> Closing --> Closed
//! ```
//!
//! Requests (an `id` is present) always produce exactly one response.
//! Notifications never produce one, whatever happens while handling them.

use crate::mcp::protocol::*;
use crate::metrics::MetricsCollector;
use crate::registry::{ToolContext, ToolRegistry};
use crate::security::{AuthGuard, ClientIdentity, RateLimiter};
use crate::session::{SessionId, SessionStore};
use crate::types::{McpError, Result};
use futures::FutureExt;
use serde_json::{json, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Initialized,
    Serving,
    Closing,
    Closed,
}

/// State owned by one connection task.
#[derive(Debug)]
pub struct Connection {
    session_id: SessionId,
    remote: String,
    state: ConnectionState,
    identity: ClientIdentity,
}

impl Connection {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// True once the client asked to shut down or the session went away.
    pub fn is_closing(&self) -> bool {
        matches!(self.state, ConnectionState::Closing | ConnectionState::Closed)
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!(session_id = %self.session_id, from = ?self.state, to = ?next, "Connection state change");
        self.state = next;
    }
}

/// Process-wide services injected into every connection.
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    sessions: Arc<SessionStore>,
    auth: Arc<AuthGuard>,
    limiter: Arc<RateLimiter>,
    metrics: Arc<MetricsCollector>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        sessions: Arc<SessionStore>,
        auth: Arc<AuthGuard>,
        limiter: Arc<RateLimiter>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            registry,
            sessions,
            auth,
            limiter,
            metrics,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Start tracking a newly accepted connection.
    pub fn open(&self, remote: &str) -> Connection {
        let session = self.sessions.create(remote);
        self.metrics.record_connection(1);
        info!(session_id = %session.id, remote = %remote, "Client connected");
        Connection {
            session_id: session.id,
            remote: remote.to_string(),
            state: ConnectionState::Connecting,
            identity: ClientIdentity::address(remote),
        }
    }

    /// Tear down a connection. Safe to call more than once.
    pub fn close(&self, conn: &mut Connection) {
        if conn.state == ConnectionState::Closed {
            return;
        }
        if conn.state != ConnectionState::Closing {
            conn.transition(ConnectionState::Closing);
        }
        if let Some(session) = self.sessions.remove(conn.session_id) {
            info!(
                session_id = %conn.session_id,
                remote = %conn.remote,
                requests = session.request_count,
                "Client disconnected"
            );
        }
        self.metrics.record_connection(-1);
        conn.transition(ConnectionState::Closed);
    }

    /// Periodic housekeeping: expire idle sessions and forget stale
    /// limiter and lockout state.
    pub fn sweep(&self, idle_timeout: Duration) {
        let expired = self.sessions.remove_idle(idle_timeout);
        let windows = self.limiter.prune();
        let lockouts = self.auth.prune();
        if !expired.is_empty() || windows > 0 || lockouts > 0 {
            debug!(
                expired_sessions = expired.len(),
                rate_windows = windows,
                auth_entries = lockouts,
                "Swept stale state"
            );
        }
    }

    /// Mark the session active for traffic that never reaches dispatch:
    /// malformed, oversized or blank lines.
    pub fn record_activity(&self, conn: &Connection) {
        self.sessions.touch(conn.session_id, false);
    }

    /// Handle one inbound line. Returns the response to write, if any.
    pub async fn handle_line(&self, conn: &mut Connection, line: &str) -> Option<McpResponse> {
        let msg = match parse_message(line) {
            Ok(msg) => msg,
            Err(rejected) => {
                self.record_activity(conn);
                if rejected.notification {
                    warn!(session_id = %conn.session_id, error = %rejected.error, "Dropping malformed notification");
                    return None;
                }
                warn!(session_id = %conn.session_id, error = %rejected.error, "Rejected malformed message");
                return Some(McpResponse::error(rejected.id, &rejected.error));
            }
        };

        debug!(
            session_id = %conn.session_id,
            method = %msg.method,
            id = ?msg.id,
            "Received message"
        );

        let id = msg.id.clone();
        let outcome = self.dispatch(conn, msg).await;

        match (id, outcome) {
            (Some(id), Ok(result)) => Some(McpResponse::success(id, result)),
            (Some(id), Err(err)) => Some(McpResponse::error(Some(id), &err)),
            (None, Ok(_)) => None,
            (None, Err(err)) => {
                debug!(session_id = %conn.session_id, error = %err, "Notification failed");
                None
            }
        }
    }

    async fn dispatch(&self, conn: &mut Connection, msg: IncomingMessage) -> Result<Value> {
        if conn.is_closing() {
            return Err(McpError::InvalidRequest("Connection is shutting down".to_string()));
        }

        if self.sessions.touch(conn.session_id, !msg.is_notification()).is_none() {
            // Swept while the connection was still open
            conn.transition(ConnectionState::Closing);
            return Err(McpError::InvalidRequest("Session expired".to_string()));
        }

        match conn.state {
            ConnectionState::Connecting => match msg.method.as_str() {
                methods::INITIALIZE => self.initialize(conn, &msg),
                methods::PING => Ok(json!({})),
                m if m.starts_with("notifications/") => Ok(Value::Null),
                _ => Err(McpError::NotInitialized),
            },
            _ => {
                if msg.method == methods::INITIALIZE {
                    return Err(McpError::InvalidRequest("Already initialized".to_string()));
                }
                self.authorize_request(conn, &msg)?;
                self.check_rate_limit(conn)?;
                self.serve(conn, msg).await
            }
        }
    }

    fn initialize(&self, conn: &mut Connection, msg: &IncomingMessage) -> Result<Value> {
        let params: InitializeParams = match &msg.params {
            None | Some(Value::Null) => InitializeParams::default(),
            Some(p) => serde_json::from_value(p.clone())
                .map_err(|e| McpError::InvalidParams(format!("Invalid initialize params: {}", e)))?,
        };

        let token = params.auth_token.as_deref().or(msg.auth_token.as_deref());
        self.authenticate(conn, token)?;

        let version = negotiate_version(params.protocol_version.as_deref());
        conn.transition(ConnectionState::Initialized);
        info!(
            session_id = %conn.session_id,
            client = params.client_info.as_ref().map(|c| c.name.as_str()).unwrap_or("unknown"),
            protocol_version = version,
            "Client initialized"
        );
        conn.transition(ConnectionState::Serving);

        let result = InitializeResult {
            protocol_version: version.to_string(),
            capabilities: ServerCapabilities {
                tools: ToolsCapability { list_changed: false },
            },
            server_info: ServerInfo::current(),
        };
        serde_json::to_value(result).map_err(|e| McpError::Internal(e.to_string()))
    }

    fn authenticate(&self, conn: &mut Connection, token: Option<&str>) -> Result<()> {
        let session = self
            .sessions
            .get(conn.session_id)
            .ok_or_else(|| McpError::Internal("session missing".to_string()))?;

        if let Err(e) = self.auth.authenticate(&session, token) {
            self.metrics.record_auth_failure();
            return Err(e.into());
        }

        self.sessions.mark_authenticated(conn.session_id);
        if self.auth.is_enabled() {
            if let Some(token) = token {
                conn.identity = ClientIdentity::token(token);
            }
        }
        Ok(())
    }

    fn authorize_request(&self, conn: &mut Connection, msg: &IncomingMessage) -> Result<()> {
        if self.auth.per_request() {
            self.authenticate(conn, msg.auth_token.as_deref())?;
        }
        Ok(())
    }

    fn check_rate_limit(&self, conn: &Connection) -> Result<()> {
        self.limiter.check(&conn.identity).map_err(|retry_after| {
            self.metrics.record_rate_limited();
            McpError::RateLimited {
                retry_after_secs: retry_after.as_secs_f64().ceil().max(1.0) as u64,
            }
        })
    }

    async fn serve(&self, conn: &mut Connection, msg: IncomingMessage) -> Result<Value> {
        match msg.method.as_str() {
            methods::PING => Ok(json!({})),
            methods::TOOLS_LIST => {
                let result = ToolsListResult {
                    tools: self.registry.list(),
                };
                serde_json::to_value(result).map_err(|e| McpError::Internal(e.to_string()))
            }
            methods::TOOLS_CALL => self.call_tool(conn, msg.params).await,
            methods::RESOURCES_LIST => Ok(json!({ "resources": [] })),
            methods::PROMPTS_LIST => Ok(json!({ "prompts": [] })),
            methods::SHUTDOWN => {
                info!(session_id = %conn.session_id, "Client requested shutdown");
                conn.transition(ConnectionState::Closing);
                Ok(json!({}))
            }
            methods::INITIALIZED | methods::CANCELLED => Ok(Value::Null),
            other => Err(McpError::MethodNotFound(other.to_string())),
        }
    }

    async fn call_tool(&self, conn: &Connection, params: Option<Value>) -> Result<Value> {
        let params: ToolsCallParams = params
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| McpError::InvalidParams(format!("Invalid tool call params: {}", e)))?
            .ok_or_else(|| McpError::InvalidParams("Missing tool call params".to_string()))?;

        let tool = self.registry.resolve(&params.name)?;
        let args = params.arguments.unwrap_or_else(|| json!({}));

        tool.input_schema
            .validate(&args)
            .map_err(|v| McpError::InvalidParams(v.to_string()))?;

        let session = self
            .sessions
            .get(conn.session_id)
            .ok_or_else(|| McpError::Internal("session missing".to_string()))?;

        let started = Instant::now();
        let outcome = AssertUnwindSafe(tool.handler.call(args, ToolContext::new(session)))
            .catch_unwind()
            .await;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        let result = match outcome {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(McpError::from(e)),
            Err(_) => {
                error!(session_id = %conn.session_id, tool = %tool.name, "Tool handler panicked");
                Err(McpError::ToolExecutionFailed("tool handler crashed".to_string()))
            }
        };

        self.metrics.record_invocation(&tool.name, duration_ms, result.is_ok());

        match &result {
            Ok(_) => info!(session_id = %conn.session_id, tool = %tool.name, duration_ms, "Tool call completed"),
            Err(e) if e.is_handler_failure() => {
                error!(session_id = %conn.session_id, tool = %tool.name, error = %e, "Tool call failed")
            }
            Err(e) => warn!(session_id = %conn.session_id, tool = %tool.name, error = %e, "Tool call rejected"),
        }

        serde_json::to_value(result?).map_err(|e| McpError::Internal(e.to_string()))
    }
}
