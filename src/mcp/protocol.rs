//! MCP protocol types
//!
//! JSON-RPC 2.0 envelopes plus the MCP message shapes this server speaks.

use crate::types::McpError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

pub const LATEST_PROTOCOL_VERSION: &str = "2025-06-18";

/// Protocol revisions this server understands, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &[LATEST_PROTOCOL_VERSION, "2025-03-26", "2024-11-05"];

/// Echo a supported version back; anything else gets the newest one.
pub fn negotiate_version(requested: Option<&str>) -> &'static str {
    requested
        .and_then(|v| SUPPORTED_PROTOCOL_VERSIONS.iter().find(|s| **s == v).copied())
        .unwrap_or(LATEST_PROTOCOL_VERSION)
}

pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const CANCELLED: &str = "notifications/cancelled";
    pub const SHUTDOWN: &str = "shutdown";
    pub const PING: &str = "ping";

    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";

    pub const RESOURCES_LIST: &str = "resources/list";
    pub const PROMPTS_LIST: &str = "prompts/list";
}

/// Request ID can be a string or any JSON number. Numbers are kept as
/// received so fractional and `u64` ids echo back unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(serde_json::Number),
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n.into())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::String(s) => write!(f, "{}", s),
            RequestId::Number(n) => write!(f, "{}", n),
        }
    }
}

/// A decoded inbound message. `id == None` marks a notification.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub id: Option<RequestId>,
    pub method: String,
    pub params: Option<Value>,
    /// Envelope-level credential, used when every request is authenticated.
    pub auth_token: Option<String>,
}

impl IncomingMessage {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// Why a line could not be turned into an [`IncomingMessage`].
#[derive(Debug, Clone, PartialEq)]
pub struct Rejected {
    /// Best-effort id recovered from the envelope.
    pub id: Option<RequestId>,
    /// True when the envelope had no usable id, so it counts as a notification.
    pub notification: bool,
    pub error: McpError,
}

/// Decode one line of the wire stream.
pub fn parse_message(line: &str) -> Result<IncomingMessage, Rejected> {
    let value: Value = serde_json::from_str(line).map_err(|e| Rejected {
        id: None,
        notification: false,
        error: McpError::Parse(e.to_string()),
    })?;

    let Value::Object(mut obj) = value else {
        return Err(Rejected {
            id: None,
            notification: false,
            error: McpError::InvalidRequest("Expected a JSON object".to_string()),
        });
    };

    let (id, notification) = match obj.remove("id") {
        None | Some(Value::Null) => (None, true),
        Some(raw) => match serde_json::from_value::<RequestId>(raw) {
            Ok(id) => (Some(id), false),
            Err(_) => {
                return Err(Rejected {
                    id: None,
                    notification: false,
                    error: McpError::InvalidRequest("id must be a string or number".to_string()),
                })
            }
        },
    };

    let invalid = |msg: &str| Rejected {
        id: id.clone(),
        notification,
        error: McpError::InvalidRequest(msg.to_string()),
    };

    if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(invalid("jsonrpc must be \"2.0\""));
    }

    let method = match obj.remove("method") {
        Some(Value::String(m)) => m,
        _ => return Err(invalid("method must be a string")),
    };

    let auth_token = match obj.remove("auth_token") {
        Some(Value::String(t)) => Some(t),
        _ => None,
    };

    Ok(IncomingMessage {
        id,
        method,
        params: obj.remove("params"),
        auth_token,
    })
}

/// Response to MCP client
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct McpResponse {
    pub jsonrpc: String,
    /// Serialized as `null` when the request id could not be read.
    pub id: Option<RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<McpErrorResponse>,
}

impl McpResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<RequestId>, error: &McpError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct McpErrorResponse {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<&McpError> for McpErrorResponse {
    fn from(err: &McpError) -> Self {
        McpErrorResponse {
            code: err.code(),
            message: err.to_string(),
            data: err.data(),
        }
    }
}

// Initialize

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    #[serde(default)]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default)]
    pub client_info: Option<ClientInfo>,
    #[serde(default)]
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ClientInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    pub capabilities: ServerCapabilities,
    pub server_info: ServerInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerCapabilities {
    pub tools: ToolsCapability,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsCapability {
    pub list_changed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

impl ServerInfo {
    pub fn current() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

// Tools

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolsListResult {
    pub tools: Vec<ToolDefinition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsCallParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Option<Value>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolsCallResult {
    pub content: Vec<ToolResultContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolResultContent {
    Text { text: String },
}

impl ToolsCallResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolResultContent::Text { text: text.into() }],
            is_error: None,
        }
    }

    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        let text = serde_json::to_string_pretty(value)?;
        Ok(Self::text(text))
    }

    /// Concatenated text of every content block.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .map(|c| match c {
                ToolResultContent::Text { text } => text.as_str(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
